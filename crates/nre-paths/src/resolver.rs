// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Hop IP → port/node resolution.

use std::collections::HashMap;
use std::net::IpAddr;

use nre_model::Href;
use nre_runtime::Runtime;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::PathError;
use crate::junos::{parse_router_config, InterfaceAddress};

/// What a hop IP resolved to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoint {
    /// L2 port id, when the IP is bound to a known port.
    pub port: Option<String>,
    /// Owning node id.
    pub node: Option<String>,
}

#[derive(Debug, Clone)]
struct Network {
    base: IpAddr,
    prefix_len: u8,
    node: String,
}

impl Network {
    fn contains(&self, ip: IpAddr) -> bool {
        match (self.base, ip) {
            (IpAddr::V4(base), IpAddr::V4(ip)) => {
                let mask = mask(u32::BITS, self.prefix_len);
                u128::from(u32::from(base)) & mask == u128::from(u32::from(ip)) & mask
            }
            (IpAddr::V6(base), IpAddr::V6(ip)) => {
                let mask = mask(u128::BITS, self.prefix_len);
                u128::from(base) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

fn mask(bits: u32, prefix_len: u8) -> u128 {
    let prefix = u32::from(prefix_len).min(bits);
    if prefix == 0 {
        return 0;
    }
    let ones = u128::MAX << (128 - prefix);
    ones >> (128 - bits)
}

/// Maps hop IPs to ports and nodes.
///
/// Exact addresses win over prefixes; among prefixes the longest wins.
/// Addresses learned from `ipports` take precedence over router
/// configuration.
#[derive(Debug, Clone, Default)]
pub struct IpResolver {
    exact: HashMap<IpAddr, Endpoint>,
    networks: Vec<Network>,
}

/// Id of the record a link object points at.
pub(crate) fn link_id(link: &Value) -> Option<String> {
    let href = link.get("href")?.as_str()?;
    Href::parse(href).map(|h| h.id)
}

impl IpResolver {
    /// Empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of exact addresses known.
    pub fn len(&self) -> usize {
        self.exact.len()
    }

    /// `true` when nothing is known.
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.networks.is_empty()
    }

    /// Bind `ip` to a port. Replaces any router-configuration entry.
    pub fn add_port(&mut self, ip: IpAddr, port: &str, node: Option<&str>) {
        let endpoint = Endpoint {
            port: Some(port.to_string()),
            node: node.map(str::to_string),
        };
        self.exact.insert(ip, endpoint);
    }

    /// Bind router interface addresses to `node`. Exact addresses already
    /// bound to a port are left alone.
    pub fn add_router(&mut self, node: &str, addresses: &[InterfaceAddress]) {
        for a in addresses {
            self.exact.entry(a.address).or_insert_with(|| Endpoint {
                port: None,
                node: Some(node.to_string()),
            });
            self.networks.push(Network {
                base: a.address,
                prefix_len: a.prefix_len,
                node: node.to_string(),
            });
        }
    }

    /// Parse a router configuration text and bind its addresses to `node`.
    pub fn add_router_config(&mut self, node: &str, text: &str) -> Result<usize, PathError> {
        let addresses = parse_router_config(text)?;
        self.add_router(node, &addresses);
        debug!(node, addresses = addresses.len(), "router configuration applied");
        Ok(addresses.len())
    }

    /// Resolve a hop. Unparseable or unknown hops yield `None`.
    pub fn resolve(&self, hop: &str) -> Option<Endpoint> {
        let ip: IpAddr = hop.trim().parse().ok()?;
        if let Some(endpoint) = self.exact.get(&ip) {
            return Some(endpoint.clone());
        }
        self.networks
            .iter()
            .filter(|n| n.contains(ip))
            .max_by_key(|n| n.prefix_len)
            .map(|n| Endpoint {
                port: None,
                node: Some(n.node.clone()),
            })
    }

    /// Build from the runtime's `ipports` collection (loading it and
    /// `ports` first). Each ipport's port link names the port; the port's
    /// node link names the node.
    pub async fn from_runtime(runtime: &Runtime) -> Result<Self, PathError> {
        let mut resolver = Self::new();
        let Some(ipports) = runtime.collection("ipports") else {
            return Ok(resolver);
        };
        ipports.load().await?;
        let ports = runtime.collection("ports");
        if let Some(ports) = &ports {
            ports.load().await?;
        }
        for row in ipports.handles() {
            let Ok(Some(ip)) = row.str("ip") else {
                continue;
            };
            let Ok(ip) = ip.parse::<IpAddr>() else {
                debug!(id = %row.id(), %ip, "ipport address ignored");
                continue;
            };
            let Some(port) = row.value("port").ok().flatten().and_then(|l| link_id(&l)) else {
                continue;
            };
            let node = ports
                .as_ref()
                .and_then(|p| p.get(&port))
                .and_then(|p| p.value("node").ok().flatten())
                .and_then(|l| link_id(&l));
            resolver.add_port(ip, &port, node.as_deref());
        }
        info!(addresses = resolver.len(), "ip resolver built");
        Ok(resolver)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const R1: &str = "interfaces { xe-0/0/1 { unit 0 { family inet { address 10.1.0.1/24; } } } \
                      lo0 { unit 0 { family inet { address 10.1.0.0/16; } } } }";

    #[test]
    fn ipports_take_precedence_over_router_configuration() {
        let mut r = IpResolver::new();
        r.add_port("10.1.0.1".parse().unwrap(), "p1", Some("n1"));
        r.add_router_config("router", R1).unwrap();
        assert_eq!(
            r.resolve("10.1.0.1"),
            Some(Endpoint {
                port: Some("p1".into()),
                node: Some("n1".into())
            })
        );
    }

    #[test]
    fn longest_prefix_wins_for_unknown_addresses() {
        let mut r = IpResolver::new();
        r.add_router_config("r-wide", "interfaces { e { unit 0 { family inet { address 10.1.0.0/16; } } } }")
            .unwrap();
        r.add_router_config("r-narrow", "interfaces { e { unit 0 { family inet { address 10.1.2.1/24; } } } }")
            .unwrap();
        assert_eq!(r.resolve("10.1.2.77").unwrap().node.as_deref(), Some("r-narrow"));
        assert_eq!(r.resolve("10.1.9.9").unwrap().node.as_deref(), Some("r-wide"));
        assert_eq!(r.resolve("192.168.0.1"), None);
        assert_eq!(r.resolve("not-an-ip"), None);
    }

    #[test]
    fn masks_cover_the_edges() {
        assert_eq!(mask(32, 0), 0);
        assert_eq!(mask(32, 32), u128::from(u32::MAX));
        assert_eq!(mask(32, 24), u128::from(0xffff_ff00u32));
        assert_eq!(mask(128, 128), u128::MAX);
    }
}
