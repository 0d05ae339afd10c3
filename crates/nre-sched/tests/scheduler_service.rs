// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(missing_docs)]
#![allow(clippy::unwrap_used, clippy::panic)]
//! Scheduling measurements held in a store.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta};
use nre_app_core::{CacheSettings, ProxySettings, RuntimeSettings, StoreSettings};
use nre_dry_tests::{fixtures, link_to, MockStore};
use nre_proto::{iso_to_micros, STORE_TIME_FORMAT};
use nre_runtime::Runtime;
use nre_sched::{resources_for, MeasurementScheduler};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

async fn seeded_store() -> MockStore {
    let store = MockStore::standard().await.unwrap();
    let url = store.url().to_string();
    for node in ["A", "R", "B"] {
        store.insert("nodes", fixtures::node(node, 1, node));
    }
    for (port, node, ip) in [("p1", "A", "10.0.0.1"), ("p2", "R", "10.0.0.5"), ("p3", "B", "10.0.0.2")] {
        store.insert("ports", fixtures::port(port, &format!("{url}/nodes/{node}"), ip));
    }
    for (link, a, b) in [("l1", "p1", "p2"), ("l2", "p2", "p3")] {
        store.insert(
            "links",
            json!({
                "id": link,
                "ts": 1,
                "endpoints": [link_to(&format!("{url}/ports/{a}")), link_to(&format!("{url}/ports/{b}"))]
            }),
        );
    }
    store.insert(
        "paths",
        json!({
            "id": "ab",
            "ts": 1,
            "src": "A",
            "dst": "B",
            "direction": "outbound",
            "hops": ["A", "R", "B"],
            "links": [link_to(&format!("{url}/links/l1")), link_to(&format!("{url}/links/l2"))]
        }),
    );
    store.insert("measurements", fixtures::measurement("m1", "10.0.0.1", "10.0.0.2", 120, 10, 2));
    store.insert("measurements", fixtures::measurement("m2", "10.0.0.1", "10.0.0.2", 120, 10, 2));
    store.insert("measurements", fixtures::measurement("m3", "192.0.2.1", "192.0.2.2", 120, 10, 2));
    store
}

async fn runtime(store: &MockStore) -> Arc<Runtime> {
    let settings = RuntimeSettings {
        unis: vec![StoreSettings::new(store.url())],
        cache: CacheSettings {
            preload: vec!["measurements".into()],
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

fn window(slot: &Value) -> (i64, i64) {
    (
        iso_to_micros(slot["start"].as_str().unwrap()).unwrap(),
        iso_to_micros(slot["end"].as_str().unwrap()).unwrap(),
    )
}

#[tokio::test]
async fn measurements_on_one_path_get_staggered_slots() {
    let store = seeded_store().await;
    let rt = runtime(&store).await;
    let sched = MeasurementScheduler::new();

    for name in ["ports", "links", "paths"] {
        rt.collection(name).unwrap().load().await.unwrap();
    }
    let expected: BTreeSet<String> = ["p1", "p2", "p3"].iter().map(|s| (*s).to_string()).collect();
    assert_eq!(resources_for(&rt, "10.0.0.1", "10.0.0.2"), expected);

    let t = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
    sched.enqueue(["m1", "m2", "m3"]);
    let out = sched.drain_at(&rt, t).await.unwrap();
    let colors: Vec<(&str, usize)> = out.iter().map(|a| (a.id.as_str(), a.color)).collect();
    assert_eq!(colors, vec![("m1", 0), ("m2", 1), ("m3", 0)]);

    let fmt = |s: i64| (t + TimeDelta::seconds(s)).format(STORE_TIME_FORMAT).to_string();
    let measurements = rt.collection("measurements").unwrap();
    let m2 = measurements.get("m2").unwrap().value("scheduled_times").unwrap().unwrap();
    assert_eq!(
        m2,
        json!([
            {"start": fmt(10), "end": fmt(20)},
            {"start": fmt(130), "end": fmt(140)}
        ])
    );
    assert_eq!(sched.scheduled(), 3);
    rt.shutdown().await;
}

#[tokio::test]
async fn the_service_schedules_new_rows_and_flush_publishes_them() {
    let store = seeded_store().await;
    let rt = runtime(&store).await;
    let sched = MeasurementScheduler::new();
    rt.add_service(sched.clone()).unwrap();

    for _ in 0..500 {
        if sched.scheduled() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(sched.scheduled(), 3);

    rt.flush().await.unwrap();
    let records = store.records("measurements");
    let times = |id: &str| -> Vec<(i64, i64)> {
        let record = records.iter().find(|r| r["id"] == id).unwrap();
        record["scheduled_times"].as_array().unwrap().iter().map(window).collect()
    };
    let (m1, m2) = (times("m1"), times("m2"));
    assert_eq!(m1.len(), 2);
    assert_eq!(m2.len(), 2);
    for a in &m1 {
        for b in &m2 {
            assert!(a.1 <= b.0 || b.1 <= a.0, "{a:?} overlaps {b:?}");
        }
    }
    rt.shutdown().await;
}
