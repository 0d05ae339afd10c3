// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(missing_docs)]
#![allow(clippy::unwrap_used, clippy::panic)]
//! Service dispatch and data stream folds.

use std::sync::Arc;
use std::time::Duration;

use nre_app_core::{MeasurementSettings, RuntimeSettings, StoreSettings};
use nre_dry_tests::{fixtures, MockStore};
use nre_runtime::{Custom, Event, EventKind, Runtime, Service};
use nre_schema::SchemaCache;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

async fn local_runtime() -> Arc<Runtime> {
    let rt = Runtime::start(RuntimeSettings::default()).await.unwrap();
    let schemas = SchemaCache::default();
    schemas.insert("http://s/schema/networkresource", fixtures::networkresource_schema());
    schemas.insert(
        "http://s/schema/node",
        fixtures::schema("node").unwrap(),
    );
    let class = schemas.build_seeded("http://s/schema/node").unwrap();
    rt.add_collection("nodes", class);
    rt
}

struct Recorder {
    name: &'static str,
    deps: Vec<String>,
    log: Arc<Mutex<Vec<String>>>,
    fail: bool,
}

impl Service for Recorder {
    fn name(&self) -> &str {
        self.name
    }

    fn depends_on(&self) -> Vec<String> {
        self.deps.clone()
    }

    fn listens(&self) -> Vec<(String, EventKind)> {
        vec![
            ("nodes".into(), EventKind::New),
            ("nodes".into(), EventKind::Update),
        ]
    }

    fn handle(&self, _: &Arc<Runtime>, event: &Event) -> anyhow::Result<()> {
        self.log
            .lock()
            .push(format!("{}:{:?}:{}", self.name, event.kind, event.entity.id()));
        if self.fail {
            anyhow::bail!("{} refuses", self.name);
        }
        // Writes from a listener must not re-enter the bus.
        event.entity.set("description", format!("seen by {}", self.name))?;
        Ok(())
    }
}

#[tokio::test]
async fn services_replay_existing_rows_and_dispatch_in_dependency_order() {
    let rt = local_runtime().await;
    let nodes = rt.collection("nodes").unwrap();
    nodes
        .append_remote("s:80", fixtures::node("n0", 1, "before"))
        .unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    rt.add_service(Arc::new(Recorder {
        name: "audit",
        deps: vec!["topology".into()],
        log: Arc::clone(&log),
        fail: true,
    }))
    .unwrap();
    rt.add_service(Arc::new(Recorder {
        name: "topology",
        deps: Vec::new(),
        log: Arc::clone(&log),
        fail: false,
    }))
    .unwrap();
    assert_eq!(rt.services().names(), vec!["topology", "audit"]);
    assert_eq!(
        log.lock().clone(),
        vec!["audit:New:n0", "topology:New:n0"]
    );

    log.lock().clear();
    nodes
        .append_remote("s:80", fixtures::node("n1", 1, "after"))
        .unwrap();
    assert_eq!(
        log.lock().clone(),
        vec!["topology:New:n1", "audit:New:n1"]
    );
    let n1 = nodes.get("n1").unwrap();
    assert_eq!(
        n1.str("description").unwrap().as_deref(),
        Some("seen by topology")
    );

    // A write outside a listener reaches both services again.
    log.lock().clear();
    n1.set("name", "renamed").unwrap();
    assert_eq!(
        log.lock().clone(),
        vec!["topology:Update:n1", "audit:Update:n1"]
    );
    rt.shutdown().await;
}

#[tokio::test]
async fn data_streams_catch_up_then_follow_pushes() {
    let store = MockStore::standard().await.unwrap();
    store.push_data(
        "m1",
        vec![json!({"ts": 1, "value": 10}), json!({"ts": 2, "value": 20})],
    );
    let settings = RuntimeSettings {
        unis: vec![StoreSettings::new(store.url())],
        measurements: MeasurementSettings {
            batch_size: 2,
            ..MeasurementSettings::default()
        },
        ..RuntimeSettings::default()
    };
    let rt = Runtime::start(settings).await.unwrap();
    let stream = rt.data("m1");
    stream.add_fold(
        "count",
        Custom::new(json!(0), |_, prior| json!(prior.as_i64().unwrap_or(0) + 1)),
    );

    assert_eq!(stream.fold("mean").await.unwrap(), Some(json!(15.0)));
    assert_eq!(stream.fold("count").await.unwrap(), Some(json!(2)));
    let reads = store.requests_to("GET", "/data/m1");
    assert_eq!(reads.len(), 1);
    assert_eq!(reads[0].query.get("ts").map(String::as_str), Some("gt=0"));
    assert_eq!(reads[0].query.get("sort").map(String::as_str), Some("ts:1"));

    assert!(store.wait_for_subscription("data/m1", 1).await);
    store.publish("data", json!({"mid": "m1", "data": [{"ts": 3, "value": 30}]}));
    store.publish("data", json!({"mid": "m1", "data": [{"ts": 2, "value": 99}]}));
    for _ in 0..500 {
        if stream.applied() >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let folds = stream.folds().await.unwrap();
    assert_eq!(folds["last"], json!(30));
    assert_eq!(folds["max"], json!(30.0));
    assert_eq!(folds["min"], json!(10.0));
    assert_eq!(folds["count"], json!(3));
    assert_eq!(stream.applied(), 3);

    stream.append(40).await.unwrap();
    assert_eq!(stream.buffered(), 1);
    stream.append(50).await.unwrap();
    assert_eq!(stream.buffered(), 0);
    let posts = store.requests_to("POST", "/data");
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].body["mid"], "m1");
    let values: Vec<Value> = posts[0].body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["value"].clone())
        .collect();
    assert_eq!(values, vec![json!(40), json!(50)]);
    assert_eq!(store.data_points("m1").len(), 4);
    assert_eq!(stream.fold("last").await.unwrap(), Some(json!(50)));

    stream.append(60).await.unwrap();
    rt.shutdown().await;
    assert_eq!(store.requests_to("POST", "/data").len(), 2);
}
