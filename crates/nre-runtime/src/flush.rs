// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Flush ordering across collections.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use nre_model::Href;

/// What the dependency builder needs to know about one pending record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSummary {
    /// Collection name.
    pub collection: String,
    /// Record id.
    pub id: String,
    /// Self-reference, when registered.
    pub self_ref: Option<String>,
    /// Link targets found in the record.
    pub hrefs: Vec<String>,
}

/// `collection → collections it depends on`.
///
/// A collection depends on another when one of its pending records links to
/// a pending record of the other, either by self-reference or by the
/// relative `collection/id` form. Every collection with pending records
/// appears as a key.
pub fn dependency_graph(pending: &[PendingSummary]) -> BTreeMap<String, BTreeSet<String>> {
    let mut owner: HashMap<String, &str> = HashMap::new();
    for row in pending {
        owner.insert(format!("{}/{}", row.collection, row.id), &row.collection);
        if let Some(self_ref) = &row.self_ref {
            owner.insert(self_ref.clone(), &row.collection);
        }
    }
    let mut graph: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for row in pending {
        let deps = graph.entry(row.collection.clone()).or_default();
        for href in &row.hrefs {
            let target = owner.get(href.as_str()).copied().or_else(|| {
                let parsed = Href::parse(href)?;
                owner.get(&parsed.relative()).copied()
            });
            if let Some(target) = target {
                if target != row.collection {
                    deps.insert(target.to_string());
                }
            }
        }
    }
    graph
}

/// Order collections so dependencies flush first.
///
/// Collections whose remaining dependencies are all flushed go next, by
/// name. When only cycles remain, the collection with the fewest remaining
/// dependencies (then the smallest name) is forced out to break them.
pub fn dependency_order(graph: &BTreeMap<String, BTreeSet<String>>) -> Vec<String> {
    let mut remaining: BTreeSet<&str> = graph.keys().map(String::as_str).collect();
    let mut order = Vec::with_capacity(remaining.len());
    let open_deps = |name: &str, remaining: &BTreeSet<&str>| -> usize {
        graph
            .get(name)
            .map_or(0, |deps| deps.iter().filter(|d| remaining.contains(d.as_str())).count())
    };
    while !remaining.is_empty() {
        let ready: Vec<&str> = remaining
            .iter()
            .copied()
            .filter(|&name| open_deps(name, &remaining) == 0)
            .collect();
        let next = if ready.is_empty() {
            remaining
                .iter()
                .copied()
                .min_by_key(|&name| (open_deps(name, &remaining), name))
                .into_iter()
                .collect()
        } else {
            ready
        };
        for name in next {
            remaining.remove(name);
            order.push(name.to_string());
        }
    }
    order
}
