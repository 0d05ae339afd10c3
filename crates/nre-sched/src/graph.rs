// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Conflict graph and smallest-last coloring.

use std::collections::{BTreeMap, BTreeSet};

/// One vertex per measurement; an edge wherever two measurements stress a
/// common resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictGraph {
    ids: Vec<String>,
    adjacency: Vec<BTreeSet<usize>>,
}

impl ConflictGraph {
    /// Build from `(id, resources)` pairs. Vertex order is input order.
    pub fn build<'a, I>(items: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a BTreeSet<String>)>,
    {
        let mut ids = Vec::new();
        let mut users: BTreeMap<&'a str, Vec<usize>> = BTreeMap::new();
        for (vertex, (id, resources)) in items.into_iter().enumerate() {
            ids.push(id.to_string());
            for resource in resources {
                users.entry(resource.as_str()).or_default().push(vertex);
            }
        }
        let mut adjacency = vec![BTreeSet::new(); ids.len()];
        for sharing in users.values() {
            for (i, &a) in sharing.iter().enumerate() {
                for &b in &sharing[i + 1..] {
                    if a != b {
                        adjacency[a].insert(b);
                        adjacency[b].insert(a);
                    }
                }
            }
        }
        Self { ids, adjacency }
    }

    /// Vertex count.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// `true` without vertices.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Measurement id of vertex `v`.
    pub fn id(&self, v: usize) -> Option<&str> {
        self.ids.get(v).map(String::as_str)
    }

    /// Neighbours of vertex `v`.
    pub fn neighbours(&self, v: usize) -> impl Iterator<Item = usize> + '_ {
        self.adjacency.get(v).into_iter().flatten().copied()
    }

    /// Edge count.
    pub fn edges(&self) -> usize {
        self.adjacency.iter().map(BTreeSet::len).sum::<usize>() / 2
    }

    /// Removal sequence of the smallest-last ordering: repeatedly take a
    /// vertex of minimum remaining degree. Among equal degrees the latest
    /// inserted goes first, so coloring (which runs in reverse) meets
    /// equal vertices in insertion order.
    pub fn smallest_last(&self) -> Vec<usize> {
        let n = self.len();
        let mut degree: Vec<usize> = self.adjacency.iter().map(BTreeSet::len).collect();
        let mut removed = vec![false; n];
        let mut order = Vec::with_capacity(n);
        for _ in 0..n {
            let next = (0..n)
                .filter(|&v| !removed[v])
                .min_by_key(|&v| (degree[v], std::cmp::Reverse(v)));
            let Some(v) = next else {
                break;
            };
            removed[v] = true;
            order.push(v);
            for u in &self.adjacency[v] {
                if !removed[*u] {
                    degree[*u] = degree[*u].saturating_sub(1);
                }
            }
        }
        order
    }

    /// Greedy coloring along the reversed smallest-last order. Each vertex
    /// gets the smallest color unused by its colored neighbours. Returns
    /// one color per vertex, indexed like the input.
    pub fn color(&self) -> Vec<usize> {
        let mut colors: Vec<Option<usize>> = vec![None; self.len()];
        for v in self.smallest_last().into_iter().rev() {
            let taken: BTreeSet<usize> = self.neighbours(v).filter_map(|u| colors[u]).collect();
            let color = (0..).find(|c| !taken.contains(c)).unwrap_or(0);
            colors[v] = Some(color);
        }
        colors.into_iter().map(|c| c.unwrap_or(0)).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn shared_resources_make_edges() {
        let a = set(&["p1", "p2"]);
        let b = set(&["p2", "p3"]);
        let c = set(&["p9"]);
        let g = ConflictGraph::build([("a", &a), ("b", &b), ("c", &c)]);
        assert_eq!(g.edges(), 1);
        assert_eq!(g.neighbours(0).collect::<Vec<_>>(), vec![1]);
        assert_eq!(g.neighbours(2).count(), 0);
        assert_eq!(g.color(), vec![0, 1, 0]);
    }

    #[test]
    fn ties_color_in_insertion_order() {
        let shared = set(&["p1"]);
        let g = ConflictGraph::build([("m1", &shared), ("m2", &shared), ("m3", &shared)]);
        assert_eq!(g.smallest_last(), vec![2, 1, 0]);
        assert_eq!(g.color(), vec![0, 1, 2]);
    }

    #[test]
    fn low_degree_vertices_are_removed_first() {
        // A star: the hub has degree 3, every leaf degree 1.
        let hub = set(&["x", "y", "z"]);
        let (x, y, z) = (set(&["x"]), set(&["y"]), set(&["z"]));
        let g = ConflictGraph::build([("hub", &hub), ("x", &x), ("y", &y), ("z", &z)]);
        let order = g.smallest_last();
        assert_eq!(order.last(), Some(&0));
        assert_eq!(g.color(), vec![0, 1, 1, 1]);
    }
}
