// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(missing_docs)]
#![allow(clippy::unwrap_used, clippy::panic)]
//! Secondary indices enumerate exactly the collection's rows, in order.

use std::sync::Arc;

use nre_runtime::{Predicate, UnisCollection};
use nre_schema::{SchemaCache, SchemaClass};
use proptest::prelude::*;
use serde_json::json;

#[derive(Debug, Clone)]
enum Op {
    Upsert(u8, i64),
    Write(u8, i64),
    Remove(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..8, -5i64..5).prop_map(|(id, rank)| Op::Upsert(id, rank)),
        (0u8..8, -5i64..5).prop_map(|(id, rank)| Op::Write(id, rank)),
        (0u8..8).prop_map(Op::Remove),
    ]
}

fn class() -> Arc<SchemaClass> {
    let cache = SchemaCache::default();
    cache.insert(
        "http://s/schema/item",
        json!({
            "properties": {"id": {"type": "string"}, "rank": {"type": "integer"}},
            "links": [{"rel": "collection", "href": "items"}]
        }),
    );
    cache.build_seeded("http://s/schema/item").unwrap()
}

proptest! {
    #[test]
    fn index_matches_rows(ops in prop::collection::vec(op(), 0..60), late_index in any::<bool>()) {
        let c = UnisCollection::detached("items", class());
        if !late_index {
            c.add_index("rank");
        }
        for (ts, op) in ops.iter().enumerate() {
            match op {
                Op::Upsert(id, rank) => {
                    c.append_remote("s:80", json!({"id": format!("i{id}"), "ts": ts + 1, "rank": rank}))
                        .unwrap();
                }
                Op::Write(id, rank) => {
                    if let Some(h) = c.get(&format!("i{id}")) {
                        h.set("rank", *rank).unwrap();
                    }
                }
                Op::Remove(id) => {
                    c.remove(&format!("i{id}"));
                }
            }
        }
        if late_index {
            c.add_index("rank");
        }

        let indexed = c.index_ids("rank").unwrap();
        let mut rows: Vec<String> = c.handles().iter().map(|h| h.id().to_string()).collect();
        let mut sorted_index = indexed.clone();
        sorted_index.sort();
        rows.sort();
        prop_assert_eq!(&sorted_index, &rows);

        let ranks: Vec<i64> = indexed
            .iter()
            .map(|id| c.get(id).unwrap().value("rank").unwrap().unwrap().as_i64().unwrap())
            .collect();
        prop_assert!(ranks.windows(2).all(|w| w[0] <= w[1]));

        for probe in -5i64..5 {
            let p = Predicate::new().eq("rank", probe);
            let hits = c.query(&p).count();
            let expected = ranks.iter().filter(|r| **r == probe).count();
            prop_assert_eq!(hits, expected);
        }
    }
}
