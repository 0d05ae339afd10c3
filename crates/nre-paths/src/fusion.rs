// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Fusing a pair of opposite traceroutes into two path plans.
//!
//! The outbound traversal is walked forward and the inbound one backward, so
//! position `k` pairs the `k`-th outbound hop with the hop the inbound trace
//! saw at the same distance from the source. Each position becomes one
//! undirected link: between the two L2 ports when both hops resolved to
//! ports, else an L3 link between floating ports named by IP. A position
//! where both traversals saw the same port collapses to a one-port link
//! rather than a self-loop.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracing::debug;

use crate::resolver::IpResolver;

/// One end of a fused link.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PortRef {
    /// A known port, by id.
    L2(String),
    /// A synthetic port standing for an unresolved hop IP.
    Floating(String),
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::L2(id) => write!(f, "l2:{id}"),
            Self::Floating(ip) => write!(f, "l3:{ip}"),
        }
    }
}

/// Undirected link identity: endpoints in sorted order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkKey {
    /// Lower endpoint.
    pub a: PortRef,
    /// Upper endpoint.
    pub b: PortRef,
}

impl LinkKey {
    /// Key for the link between `x` and `y`, in either order.
    pub fn new(x: PortRef, y: PortRef) -> Self {
        if x <= y {
            Self { a: x, b: y }
        } else {
            Self { a: y, b: x }
        }
    }

    /// Distinct endpoints: one when both ends are the same port.
    pub fn ends(&self) -> Vec<&PortRef> {
        if self.a == self.b {
            vec![&self.a]
        } else {
            vec![&self.a, &self.b]
        }
    }

    /// `true` when both ends are known ports.
    pub fn is_l2(&self) -> bool {
        matches!((&self.a, &self.b), (PortRef::L2(_), PortRef::L2(_)))
    }

    /// Layer recorded on the link record.
    pub fn layer(&self) -> u8 {
        if self.is_l2() {
            2
        } else {
            3
        }
    }
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.a == self.b {
            write!(f, "{}", self.a)
        } else {
            write!(f, "{}|{}", self.a, self.b)
        }
    }
}

/// Direction of a fused path relative to the pair's source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Source to destination.
    Outbound,
    /// Destination back to source.
    Inbound,
}

impl Direction {
    /// Value stored in the path record.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Outbound => "outbound",
            Self::Inbound => "inbound",
        }
    }
}

/// One traceroute: the hop list observed from `src` to `dst`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Traceroute {
    /// Source node id.
    pub src: String,
    /// Destination node id.
    pub dst: String,
    /// Hops as reported, endpoints included when the tool reports them.
    pub hops: Vec<String>,
}

/// A path to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPlan {
    /// Traversal direction.
    pub direction: Direction,
    /// First node.
    pub src: String,
    /// Last node.
    pub dst: String,
    /// Node ids along the path, endpoints included.
    pub hops: Vec<String>,
    /// Links in traversal order.
    pub links: Vec<LinkKey>,
}

impl PathPlan {
    /// Distinct L2 ports this path touches.
    pub fn ports(&self) -> BTreeSet<&str> {
        self.links
            .iter()
            .flat_map(|l| [&l.a, &l.b])
            .filter_map(|p| match p {
                PortRef::L2(id) => Some(id.as_str()),
                PortRef::Floating(_) => None,
            })
            .collect()
    }
}

fn is_endpoint(hop: &str, node: &str, resolver: &IpResolver) -> bool {
    hop == node
        || resolver
            .resolve(hop)
            .and_then(|e| e.node)
            .is_some_and(|n| n == node)
}

/// Hops strictly between the endpoints.
fn interior<'a>(trace: &'a Traceroute, resolver: &IpResolver) -> &'a [String] {
    let mut hops = trace.hops.as_slice();
    if let [first, rest @ ..] = hops {
        if is_endpoint(first, &trace.src, resolver) {
            hops = rest;
        }
    }
    if let [rest @ .., last] = hops {
        if is_endpoint(last, &trace.dst, resolver) {
            hops = rest;
        }
    }
    hops
}

fn port_ref(hop: &str, resolver: &IpResolver) -> PortRef {
    match resolver.resolve(hop).and_then(|e| e.port) {
        Some(port) => PortRef::L2(port),
        None => PortRef::Floating(hop.trim().to_string()),
    }
}

fn node_hops<'a>(
    src: &str,
    dst: &str,
    hops: impl Iterator<Item = &'a String>,
    resolver: &IpResolver,
) -> Vec<String> {
    let mut out = vec![src.to_string()];
    let inner = hops.filter_map(|h| resolver.resolve(h).and_then(|e| e.node));
    for node in inner.chain(std::iter::once(dst.to_string())) {
        if out.last() != Some(&node) {
            out.push(node);
        }
    }
    out
}

/// Fuse `outbound` (A→B) with its companion `inbound` (B→A).
///
/// Positions beyond the shorter traversal are dropped.
pub fn fuse(outbound: &Traceroute, inbound: &Traceroute, resolver: &IpResolver) -> (PathPlan, PathPlan) {
    let out_hops = interior(outbound, resolver);
    let in_hops = interior(inbound, resolver);
    if out_hops.len() != in_hops.len() {
        debug!(
            src = %outbound.src,
            dst = %outbound.dst,
            outbound = out_hops.len(),
            inbound = in_hops.len(),
            "asymmetric traversal"
        );
    }
    let links: Vec<LinkKey> = out_hops
        .iter()
        .zip(in_hops.iter().rev())
        .map(|(o, i)| LinkKey::new(port_ref(o, resolver), port_ref(i, resolver)))
        .collect();

    let forward = PathPlan {
        direction: Direction::Outbound,
        src: outbound.src.clone(),
        dst: outbound.dst.clone(),
        hops: node_hops(&outbound.src, &outbound.dst, out_hops.iter(), resolver),
        links: links.clone(),
    };
    let backward = PathPlan {
        direction: Direction::Inbound,
        src: inbound.src.clone(),
        dst: inbound.dst.clone(),
        hops: node_hops(&inbound.src, &inbound.dst, in_hops.iter(), resolver),
        links: links.into_iter().rev().collect(),
    };
    (forward, backward)
}

/// Traversal counters for ports, links, and nodes.
///
/// A path bumps each distinct element once, however often it repeats.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Usage {
    /// Port id → traversals.
    pub ports: BTreeMap<String, u64>,
    /// Link key (as displayed) → traversals.
    pub links: BTreeMap<String, u64>,
    /// Node id → traversals.
    pub nodes: BTreeMap<String, u64>,
}

impl Usage {
    /// Count one traversal of `plan`.
    pub fn record(&mut self, plan: &PathPlan) {
        for port in plan.ports() {
            *self.ports.entry(port.to_string()).or_default() += 1;
        }
        let links: BTreeSet<String> = plan.links.iter().map(ToString::to_string).collect();
        for link in links {
            *self.links.entry(link).or_default() += 1;
        }
        let nodes: BTreeSet<&String> = plan.hops.iter().collect();
        for node in nodes {
            *self.nodes.entry(node.clone()).or_default() += 1;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn trace(src: &str, dst: &str, hops: &[&str]) -> Traceroute {
        Traceroute {
            src: src.into(),
            dst: dst.into(),
            hops: hops.iter().map(|h| (*h).to_string()).collect(),
        }
    }

    fn resolver() -> IpResolver {
        let mut r = IpResolver::new();
        r.add_port("10.0.0.1".parse().unwrap(), "p1", Some("r1"));
        r.add_port("10.0.0.2".parse().unwrap(), "p2", Some("r2"));
        r
    }

    fn l2(a: &str, b: &str) -> LinkKey {
        LinkKey::new(PortRef::L2(a.into()), PortRef::L2(b.into()))
    }

    #[test]
    fn opposite_traversals_pair_by_position() {
        let out = trace("A", "B", &["A", "10.0.0.1", "10.0.0.2", "B"]);
        let inb = trace("B", "A", &["B", "10.0.0.2", "10.0.0.1", "A"]);
        let (fwd, back) = fuse(&out, &inb, &resolver());

        assert_eq!(fwd.links, vec![l2("p1", "p1"), l2("p2", "p2")]);
        assert_eq!(back.links, vec![l2("p2", "p2"), l2("p1", "p1")]);
        assert_eq!(fwd.hops, vec!["A", "r1", "r2", "B"]);
        assert_eq!(back.hops, vec!["B", "r2", "r1", "A"]);
        assert_eq!(back.direction, Direction::Inbound);
    }

    #[test]
    fn a_port_seen_from_both_sides_is_one_endpoint() {
        let same = l2("p1", "p1");
        assert_eq!(same.ends(), vec![&PortRef::L2("p1".into())]);
        assert_eq!(same.to_string(), "l2:p1");
        assert_eq!(same.layer(), 2);
        let pair = l2("p2", "p1");
        assert_eq!(pair.ends().len(), 2);
        assert_eq!(pair.to_string(), "l2:p1|l2:p2");
    }

    #[test]
    fn unresolved_hops_become_l3_links() {
        let out = trace("A", "B", &["10.0.0.1", "10.9.9.9"]);
        let inb = trace("B", "A", &["10.9.9.8", "10.0.0.2"]);
        let (fwd, _) = fuse(&out, &inb, &resolver());
        assert_eq!(
            fwd.links,
            vec![
                l2("p1", "p2"),
                LinkKey::new(
                    PortRef::Floating("10.9.9.9".into()),
                    PortRef::Floating("10.9.9.8".into())
                ),
            ]
        );
        assert!(fwd.links[0].is_l2());
        assert_eq!(fwd.links[1].layer(), 3);
        assert_eq!(fwd.hops, vec!["A", "r1", "B"]);
    }

    #[test]
    fn usage_counts_each_element_once_per_traversal() {
        let out = trace("A", "B", &["10.0.0.1", "10.0.0.1", "10.0.0.2"]);
        let inb = trace("B", "A", &["10.0.0.2", "10.0.0.1", "10.0.0.1"]);
        let (fwd, back) = fuse(&out, &inb, &resolver());
        let mut usage = Usage::default();
        usage.record(&fwd);
        usage.record(&back);
        assert_eq!(usage.ports["p1"], 2);
        assert_eq!(usage.ports["p2"], 2);
        assert_eq!(usage.links["l2:p1"], 2);
        assert_eq!(usage.nodes["r1"], 2);
        assert_eq!(usage.nodes["A"], 2);
    }
}
