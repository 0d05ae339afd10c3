// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The `paths` service: turns traceroute metadata into path records.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Weak};

use nre_model::Link;
use nre_runtime::{EntityHandle, Event, EventKind, Predicate, Runtime, Service};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::error::PathError;
use crate::fusion::{fuse, LinkKey, PathPlan, PortRef, Traceroute, Usage};
use crate::resolver::{link_id, IpResolver};

/// Metadata event-type suffix marking a hop-IP traceroute stream.
pub const HOPIP_EVENT_SUFFIX: &str = ":traceroute:hopip";

/// The two path records written for one end pair.
#[derive(Debug, Clone)]
pub struct FusedPaths {
    /// A→B.
    pub outbound: EntityHandle,
    /// B→A.
    pub inbound: EntityHandle,
}

#[derive(Default)]
struct FusionState {
    /// `(src, dst)` → metadata id of its hop stream.
    traces: BTreeMap<(String, String), String>,
    /// Hop lists last fused per unordered pair.
    fused: HashMap<(String, String), (Vec<String>, Vec<String>)>,
    links: HashMap<LinkKey, EntityHandle>,
    floating: HashMap<String, EntityHandle>,
    usage: Usage,
}

/// Fuses opposite traceroutes into outbound/inbound `paths` records.
///
/// New `metadata` rows whose `eventType` ends in [`HOPIP_EVENT_SUFFIX`]
/// and whose `parameters` carry `src` and `dst` node ids register a
/// traceroute. Once both directions of a pair are known, the latest data
/// point of each stream (a list of hop strings) is fused and written as
/// committed records; the caller's flush publishes them.
pub struct PathFusion {
    routers: Vec<(String, String)>,
    resolver: Mutex<Option<Arc<IpResolver>>>,
    state: Mutex<FusionState>,
    running: tokio::sync::Mutex<()>,
    weak: Weak<Self>,
}

impl std::fmt::Debug for PathFusion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathFusion")
            .field("routers", &self.routers.len())
            .finish_non_exhaustive()
    }
}

/// Href to use when linking to `handle`: its self-reference once
/// registered, else the relative form rewritten at flush.
fn href_of(handle: &EntityHandle, collection: &str) -> Result<String, PathError> {
    Ok(handle
        .self_ref()?
        .unwrap_or_else(|| format!("{collection}/{}", handle.id())))
}

fn hop_list(value: &Value) -> Option<Vec<String>> {
    value
        .as_array()?
        .iter()
        .map(|h| h.as_str().map(str::to_string))
        .collect()
}

impl PathFusion {
    /// Service with optional router configurations `(node id, config text)`
    /// feeding the resolver.
    pub fn new(routers: Vec<(String, String)>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            routers,
            resolver: Mutex::new(None),
            state: Mutex::new(FusionState::default()),
            running: tokio::sync::Mutex::new(()),
            weak: weak.clone(),
        })
    }

    /// Traversal counters so far.
    pub fn usage(&self) -> Usage {
        self.state.lock().usage.clone()
    }

    /// Number of registered traceroute streams.
    pub fn traces(&self) -> usize {
        self.state.lock().traces.len()
    }

    /// Register the hop stream `mid` for `src → dst`.
    pub fn track(&self, src: &str, dst: &str, mid: &str) {
        self.state
            .lock()
            .traces
            .insert((src.to_string(), dst.to_string()), mid.to_string());
    }

    async fn resolver(&self, runtime: &Runtime) -> Result<Arc<IpResolver>, PathError> {
        if let Some(resolver) = self.resolver.lock().clone() {
            return Ok(resolver);
        }
        let mut resolver = IpResolver::from_runtime(runtime).await?;
        for (node, text) in &self.routers {
            resolver.add_router_config(node, text)?;
        }
        let resolver = Arc::new(resolver);
        *self.resolver.lock() = Some(Arc::clone(&resolver));
        Ok(resolver)
    }

    async fn latest_hops(runtime: &Runtime, mid: &str) -> Result<Option<Vec<String>>, PathError> {
        let last = runtime.data(mid).fold("last").await?;
        Ok(last.as_ref().and_then(hop_list))
    }

    /// Fuse every pair whose two directions are known and whose hop lists
    /// changed since the last fusion.
    #[instrument(skip_all)]
    pub async fn refresh(&self, runtime: &Arc<Runtime>) -> Result<Vec<FusedPaths>, PathError> {
        let _serial = self.running.lock().await;
        let pairs: Vec<((String, String), String, String)> = {
            let state = self.state.lock();
            state
                .traces
                .iter()
                .filter(|((src, dst), _)| src < dst)
                .filter_map(|((src, dst), mid)| {
                    let back = state.traces.get(&(dst.clone(), src.clone()))?;
                    Some(((src.clone(), dst.clone()), mid.clone(), back.clone()))
                })
                .collect()
        };
        if pairs.is_empty() {
            return Ok(Vec::new());
        }
        let resolver = self.resolver(runtime).await?;
        let mut written = Vec::new();
        for ((src, dst), out_mid, in_mid) in pairs {
            let (Some(out_hops), Some(in_hops)) = (
                Self::latest_hops(runtime, &out_mid).await?,
                Self::latest_hops(runtime, &in_mid).await?,
            ) else {
                debug!(%src, %dst, "traceroute data not yet available");
                continue;
            };
            let key = (src.clone(), dst.clone());
            let hops = (out_hops.clone(), in_hops.clone());
            if self.state.lock().fused.get(&key) == Some(&hops) {
                continue;
            }
            let outbound = Traceroute {
                src: src.clone(),
                dst: dst.clone(),
                hops: out_hops,
            };
            let inbound = Traceroute {
                src: dst.clone(),
                dst: src.clone(),
                hops: in_hops,
            };
            let (forward, backward) = fuse(&outbound, &inbound, &resolver);
            let paths = FusedPaths {
                outbound: self.write(runtime, &forward)?,
                inbound: self.write(runtime, &backward)?,
            };
            let mut state = self.state.lock();
            state.usage.record(&forward);
            state.usage.record(&backward);
            state.fused.insert(key, hops);
            drop(state);
            info!(%src, %dst, links = forward.links.len(), "paths fused");
            written.push(paths);
        }
        Ok(written)
    }

    fn write(&self, runtime: &Runtime, plan: &PathPlan) -> Result<EntityHandle, PathError> {
        let mut links = Vec::with_capacity(plan.links.len());
        for key in &plan.links {
            let handle = self.link(runtime, key)?;
            links.push(Link::full(href_of(&handle, "links")?).to_value());
        }
        let mut path = runtime.create("paths")?;
        path.set("name", format!("{}->{}", plan.src, plan.dst))?;
        path.set("src", plan.src.as_str())?;
        path.set("dst", plan.dst.as_str())?;
        path.set("direction", plan.direction.as_str())?;
        path.set("hops", json!(plan.hops))?;
        path.set("links", Value::Array(links))?;
        Ok(runtime.insert(path, true)?)
    }

    fn port_href(&self, runtime: &Runtime, port: &PortRef) -> Result<String, PathError> {
        let ports = runtime
            .collection("ports")
            .ok_or_else(|| PathError::MissingCollection("ports".into()))?;
        match port {
            PortRef::L2(id) => match ports.get(id) {
                Some(handle) => href_of(&handle, "ports"),
                None => Ok(format!("ports/{id}")),
            },
            PortRef::Floating(ip) => {
                let known = self.state.lock().floating.get(ip).cloned();
                if let Some(handle) = known.filter(EntityHandle::is_alive) {
                    return href_of(&handle, "ports");
                }
                let mut entity = runtime.create("ports")?;
                entity.remove_field("node")?;
                entity.set("name", format!("l3:{ip}"))?;
                let family = if ip.contains(':') { "ipv6" } else { "ipv4" };
                entity.set("address", json!({"type": family, "address": ip}))?;
                entity.set("properties", json!({"floating": true, "layer": 3}))?;
                let handle = runtime.insert(entity, true)?;
                self.state.lock().floating.insert(ip.clone(), handle.clone());
                href_of(&handle, "ports")
            }
        }
    }

    fn link(&self, runtime: &Runtime, key: &LinkKey) -> Result<EntityHandle, PathError> {
        let known = self.state.lock().links.get(key).cloned();
        if let Some(handle) = known.filter(EntityHandle::is_alive) {
            return Ok(handle);
        }
        let links = runtime
            .collection("links")
            .ok_or_else(|| PathError::MissingCollection("links".into()))?;
        let wanted: Option<Vec<String>> = key
            .ends()
            .into_iter()
            .map(|end| match end {
                PortRef::L2(id) => Some(id.clone()),
                PortRef::Floating(_) => None,
            })
            .collect();
        let existing = wanted.and_then(|wanted| {
            links.first_where(&Predicate::func(move |entity| {
                let Ok(Some(Value::Array(endpoints))) = entity.value("endpoints") else {
                    return false;
                };
                let ids: BTreeSet<String> = endpoints.iter().filter_map(link_id).collect();
                ids.len() == endpoints.len() && ids.iter().eq(wanted.iter())
            }))
        });
        let handle = match existing {
            Some(handle) => handle,
            None => {
                let mut endpoints = Vec::with_capacity(2);
                for end in key.ends() {
                    endpoints.push(Link::full(self.port_href(runtime, end)?).to_value());
                }
                let mut entity = runtime.create("links")?;
                entity.set("name", key.to_string())?;
                entity.set("directed", false)?;
                entity.set("endpoints", Value::Array(endpoints))?;
                entity.set("properties", json!({"layer": key.layer()}))?;
                runtime.insert(entity, true)?
            }
        };
        self.state.lock().links.insert(key.clone(), handle.clone());
        Ok(handle)
    }

    fn spawn_refresh(&self, runtime: &Arc<Runtime>) {
        let Ok(tokio) = tokio::runtime::Handle::try_current() else {
            debug!("no async runtime; fusion waits for an explicit refresh");
            return;
        };
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        let runtime = Arc::clone(runtime);
        tokio.spawn(async move {
            if let Err(err) = this.refresh(&runtime).await {
                warn!(%err, "path fusion failed");
            }
        });
    }
}

impl Service for PathFusion {
    fn name(&self) -> &str {
        "paths"
    }

    fn listens(&self) -> Vec<(String, EventKind)> {
        vec![("metadata".into(), EventKind::New)]
    }

    fn handle(&self, runtime: &Arc<Runtime>, event: &Event) -> anyhow::Result<()> {
        let is_hopip = event
            .entity
            .str("eventType")?
            .is_some_and(|t| t.ends_with(HOPIP_EVENT_SUFFIX));
        if !is_hopip {
            return Ok(());
        }
        let params = event.entity.value("parameters")?.unwrap_or(Value::Null);
        let (Some(src), Some(dst)) = (params["src"].as_str(), params["dst"].as_str()) else {
            anyhow::bail!("traceroute metadata {} lacks src/dst parameters", event.entity.id());
        };
        self.track(src, dst, event.entity.id());
        debug!(%src, %dst, mid = %event.entity.id(), "traceroute registered");
        self.spawn_refresh(runtime);
        Ok(())
    }
}
