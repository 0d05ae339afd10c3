// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(missing_docs)]
#![allow(clippy::unwrap_used, clippy::panic)]
//! Traceroute metadata in, path records out.

use std::sync::Arc;

use nre_app_core::{CacheSettings, ProxySettings, RuntimeSettings, StoreSettings};
use nre_dry_tests::{fixtures, link_to, MockStore};
use nre_paths::PathFusion;
use nre_runtime::Runtime;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

async fn seeded_store(out_hops: Value, in_hops: Value) -> MockStore {
    let store = MockStore::standard().await.unwrap();
    let url = store.url().to_string();
    for node in ["A", "B", "r1", "r2"] {
        store.insert("nodes", fixtures::node(node, 1, node));
    }
    store.insert("ports", fixtures::port("p1", &format!("{url}/nodes/r1"), "10.0.0.1"));
    store.insert("ports", fixtures::port("p2", &format!("{url}/nodes/r2"), "10.0.0.2"));
    for (id, ip, port) in [("ip1", "10.0.0.1", "p1"), ("ip2", "10.0.0.2", "p2")] {
        store.insert(
            "ipports",
            json!({"id": id, "ts": 1, "ip": ip, "port": link_to(&format!("{url}/ports/{port}"))}),
        );
    }
    for (mid, src, dst, hops) in [("m-ab", "A", "B", out_hops), ("m-ba", "B", "A", in_hops)] {
        store.insert(
            "metadata",
            json!({
                "id": mid,
                "ts": 1,
                "eventType": "ps:tools:traceroute:hopip",
                "subject": link_to(&format!("{url}/measurements/trace")),
                "parameters": {"src": src, "dst": dst}
            }),
        );
        store.push_data(mid, vec![json!({"ts": 1, "value": hops})]);
    }
    store
}

async fn runtime(store: &MockStore) -> Arc<Runtime> {
    let settings = RuntimeSettings {
        unis: vec![StoreSettings::new(store.url())],
        cache: CacheSettings {
            preload: vec!["metadata".into()],
            ..CacheSettings::default()
        },
        proxy: ProxySettings {
            subscribe: false,
            ..ProxySettings::default()
        },
        ..RuntimeSettings::default()
    };
    Runtime::start(settings).await.unwrap()
}

#[tokio::test]
async fn opposite_traceroutes_become_two_paths() {
    let store = seeded_store(
        json!(["A", "10.0.0.1", "10.0.0.2", "B"]),
        json!(["B", "10.0.0.2", "10.0.0.1", "A"]),
    )
    .await;
    let rt = runtime(&store).await;
    let fusion = PathFusion::new(Vec::new());
    rt.add_service(fusion.clone()).unwrap();
    assert_eq!(fusion.traces(), 2);

    fusion.refresh(&rt).await.unwrap();
    assert_eq!(rt.collection("paths").unwrap().len(), 2);
    assert_eq!(rt.collection("links").unwrap().len(), 2);

    let usage = fusion.usage();
    assert_eq!(usage.ports["p1"], 2);
    assert_eq!(usage.ports["p2"], 2);
    assert_eq!(usage.nodes["r1"], 2);

    // Unchanged hop lists are not fused twice.
    assert!(fusion.refresh(&rt).await.unwrap().is_empty());
    assert_eq!(rt.collection("paths").unwrap().len(), 2);

    rt.flush().await.unwrap();
    assert_eq!(store.requests_to("POST", "/links").len(), 1);
    assert_eq!(store.requests_to("POST", "/paths").len(), 1);
    assert!(store.requests_to("POST", "/ports").is_empty());

    let url = store.url().to_string();
    let links = store.records("links");
    assert_eq!(links.len(), 2);
    for link in &links {
        // Both traversals cross the same port at each position.
        assert_eq!(link["endpoints"].as_array().unwrap().len(), 1);
        assert!(!link["name"].as_str().unwrap().contains('|'));
        let a = link["endpoints"][0]["href"].as_str().unwrap();
        assert!(a.starts_with(&format!("{url}/ports/")), "{a}");
        assert_eq!(link["properties"]["layer"], 2);
    }

    let mut paths = store.records("paths");
    paths.sort_by_key(|p| p["direction"].as_str().unwrap_or_default().to_string());
    assert_eq!(paths[0]["direction"], "inbound");
    assert_eq!(paths[0]["hops"], json!(["B", "r2", "r1", "A"]));
    assert_eq!(paths[1]["direction"], "outbound");
    assert_eq!(paths[1]["hops"], json!(["A", "r1", "r2", "B"]));
    for path in &paths {
        let hrefs: Vec<&str> = path["links"]
            .as_array()
            .unwrap()
            .iter()
            .map(|l| l["href"].as_str().unwrap())
            .collect();
        assert_eq!(hrefs.len(), 2);
        assert!(hrefs.iter().all(|h| h.starts_with(&format!("{url}/links/"))));
    }
    rt.shutdown().await;
}

#[tokio::test]
async fn unresolved_hops_get_floating_ports() {
    let store = seeded_store(
        json!(["A", "10.0.0.1", "10.9.9.9", "B"]),
        json!(["B", "10.9.9.9", "10.0.0.1", "A"]),
    )
    .await;
    let rt = runtime(&store).await;
    let fusion = PathFusion::new(vec![(
        "r9".to_string(),
        "interfaces { xe-0/0/0 { unit 0 { family inet { address 10.8.0.1/16; } } } }".to_string(),
    )]);
    rt.add_service(fusion.clone()).unwrap();
    fusion.refresh(&rt).await.unwrap();
    rt.flush().await.unwrap();

    let floating: Vec<Value> = store
        .records("ports")
        .into_iter()
        .filter(|p| p["properties"]["floating"] == true)
        .collect();
    assert_eq!(floating.len(), 1);
    assert_eq!(floating[0]["address"]["address"], "10.9.9.9");
    assert!(floating[0].get("node").is_none());

    let layers: Vec<i64> = store
        .records("links")
        .iter()
        .map(|l| l["properties"]["layer"].as_i64().unwrap())
        .collect();
    assert_eq!(layers.len(), 2);
    assert!(layers.contains(&2) && layers.contains(&3));

    let outbound = store
        .records("paths")
        .into_iter()
        .find(|p| p["direction"] == "outbound")
        .unwrap();
    // The prefix 10.8/16 does not cover 10.9.9.9; the hop has no node.
    assert_eq!(outbound["hops"], json!(["A", "r1", "B"]));
    rt.shutdown().await;
}
