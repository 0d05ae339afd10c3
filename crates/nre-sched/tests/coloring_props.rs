// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(missing_docs)]
#![allow(clippy::unwrap_used, clippy::panic)]
//! Measurements sharing a resource never run at the same time.

use std::collections::BTreeSet;

use chrono::DateTime;
use nre_sched::{plan, Request, ResourceRegistry, ScheduleParams};
use proptest::prelude::*;

fn batch() -> impl Strategy<Value = Vec<BTreeSet<u8>>> {
    prop::collection::vec(prop::collection::btree_set(0u8..12, 1..4), 1..16)
}

proptest! {
    #[test]
    fn conflicting_measurements_never_overlap(sets in batch(), duration in 1i64..30) {
        let n = i64::try_from(sets.len()).unwrap();
        // One period fits every possible color.
        let params = ScheduleParams { every: duration * n, duration, num_tests: 3 };
        let requests: Vec<Request> = sets
            .iter()
            .enumerate()
            .map(|(i, s)| Request {
                id: format!("m{i}"),
                resources: s.iter().map(|r| format!("p{r}")).collect(),
                params,
            })
            .collect();
        let mut registry = ResourceRegistry::new();
        let out = plan(&mut registry, requests.clone(), DateTime::from_timestamp(0, 0).unwrap());
        prop_assert_eq!(out.len(), requests.len());

        for (i, a) in out.iter().enumerate() {
            for b in &out[i + 1..] {
                let ra = &requests.iter().find(|r| r.id == a.id).unwrap().resources;
                let rb = &requests.iter().find(|r| r.id == b.id).unwrap().resources;
                if ra.is_disjoint(rb) {
                    continue;
                }
                prop_assert_ne!(a.color, b.color);
                for x in &a.slots {
                    for y in &b.slots {
                        prop_assert!(!x.overlaps(y), "{} and {} overlap", a.id, b.id);
                    }
                }
            }
        }
    }
}
