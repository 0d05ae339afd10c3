// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(clippy::unwrap_used)]

use nre_model::{Local, Resource};
use proptest::prelude::*;
use serde_json::{Map, Value};

fn leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i32>().prop_map(Value::from),
        "[a-z]{0,4}".prop_map(Value::from),
        (any::<i32>(), any::<i32>()).prop_map(|(x, y)| serde_json::json!({"x": x, "y": y})),
        prop::collection::vec(any::<i8>(), 0..4).prop_map(Value::from),
    ]
}

fn object() -> impl Strategy<Value = Map<String, Value>> {
    prop::collection::btree_map("[a-e]", leaf(), 0..5).prop_map(|m| m.into_iter().collect())
}

proptest! {
    #[test]
    fn merging_a_copy_into_itself_changes_nothing(a in object()) {
        let mut local = Local::from_map(a.clone());
        local.merge(&Local::from_map(a.clone()));
        prop_assert_eq!(local.to_map(), a);
    }

    #[test]
    fn locked_fields_survive_any_merge(
        a in object(),
        b in object(),
        key in "[a-e]",
        pinned in leaf(),
    ) {
        let mut local = Local::from_map(a);
        local.set(&key, Resource::from(pinned.clone()));
        local.merge(&Local::from_map(b));
        prop_assert_eq!(local.get(&key).map(Resource::to_value), Some(pinned));
    }

    #[test]
    fn merge_keeps_every_incoming_key(a in object(), b in object()) {
        let mut local = Local::from_map(a.clone());
        local.merge(&Local::from_map(b.clone()));
        for key in a.keys().chain(b.keys()) {
            prop_assert!(local.contains(key));
        }
    }
}
