// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The `scheduler` service: slots new measurements without conflicts.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use chrono::{DateTime, TimeDelta, Utc};
use nre_model::{Entity, Href};
use nre_runtime::{EntityHandle, Event, EventKind, Predicate, Runtime, Service, UnisCollection};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::error::SchedError;
use crate::plan::{plan, Assignment, Request};
use crate::registry::ResourceRegistry;
use crate::slots::{ScheduleParams, Slot, PICKUP_GAP_SECS};

/// Schedules measurements as they appear in the `measurements` collection.
///
/// New rows carrying `configuration.schedule_params` are queued; the queue
/// is drained as one batch, so measurements arriving together are colored
/// together. Each assignment is written back to the row's
/// `scheduled_times`, which the next flush publishes.
pub struct MeasurementScheduler {
    registry: Mutex<ResourceRegistry>,
    queue: Mutex<Vec<String>>,
    running: tokio::sync::Mutex<()>,
    weak: Weak<Self>,
}

impl std::fmt::Debug for MeasurementScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeasurementScheduler")
            .field("scheduled", &self.registry.lock().len())
            .field("queued", &self.queue.lock().len())
            .finish_non_exhaustive()
    }
}

fn link_target(link: &Value) -> Option<String> {
    link.get("href")?.as_str().map(str::to_string)
}

fn port_by_ip(ports: &UnisCollection, ip: &str) -> Option<EntityHandle> {
    let ip = ip.to_string();
    ports.first_where(&Predicate::func(move |e: &Entity| {
        matches!(e.value_at(&["address", "address"]), Ok(Some(Value::String(a))) if a == ip)
    }))
}

fn node_of(port: &EntityHandle) -> Option<String> {
    let link = port.value("node").ok().flatten()?;
    Href::parse(&link_target(&link)?).map(|h| h.id)
}

/// Resources a measurement between `src` and `dst` stresses: the L2
/// ports along a known path, else the ports holding the endpoint IPs,
/// else the raw endpoint addresses.
pub fn resources_for(runtime: &Runtime, src: &str, dst: &str) -> BTreeSet<String> {
    let ports = runtime.collection("ports");
    let endpoint = |ip: &str| ports.as_ref().and_then(|p| port_by_ip(p, ip));
    let (src_port, dst_port) = (endpoint(src), endpoint(dst));

    let on_path = match (&src_port, &dst_port) {
        (Some(a), Some(b)) => node_of(a)
            .zip(node_of(b))
            .map(|(a, b)| path_ports(runtime, &a, &b))
            .unwrap_or_default(),
        _ => Vec::new(),
    };
    if !on_path.is_empty() {
        return on_path.into_iter().collect();
    }
    [(src, src_port), (dst, dst_port)]
        .into_iter()
        .map(|(ip, port)| match port {
            Some(port) => port.id().to_string(),
            None => format!("ip:{ip}"),
        })
        .collect()
}

/// Ordered, de-duplicated L2 ports on the `src → dst` path record.
fn path_ports(runtime: &Runtime, src: &str, dst: &str) -> Vec<String> {
    let (Some(paths), Some(links)) = (runtime.collection("paths"), runtime.collection("links")) else {
        return Vec::new();
    };
    let Some(path) = paths.first_where(&Predicate::new().eq("src", src).eq("dst", dst)) else {
        return Vec::new();
    };
    let hrefs: Vec<String> = path
        .value("links")
        .ok()
        .flatten()
        .and_then(|v| v.as_array().map(|l| l.iter().filter_map(link_target).collect()))
        .unwrap_or_default();
    let mut out: Vec<String> = Vec::new();
    for href in hrefs {
        let link = links.by_self_ref(&href).or_else(|| {
            Href::parse(&href).and_then(|h| links.get(&h.id))
        });
        let Some(endpoints) = link.and_then(|l| l.value("endpoints").ok().flatten()) else {
            continue;
        };
        let ids = endpoints
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(link_target)
            .filter_map(|h| Href::parse(&h).map(|h| h.id));
        for id in ids {
            if !out.contains(&id) {
                out.push(id);
            }
        }
    }
    out
}

impl MeasurementScheduler {
    /// Scheduler with an empty resource registry.
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            registry: Mutex::new(ResourceRegistry::new()),
            queue: Mutex::new(Vec::new()),
            running: tokio::sync::Mutex::new(()),
            weak: weak.clone(),
        })
    }

    /// Measurements currently holding slots.
    pub fn scheduled(&self) -> usize {
        self.registry.lock().len()
    }

    /// Queue measurement ids for the next drain.
    pub fn enqueue<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queue.lock().extend(ids.into_iter().map(Into::into));
    }

    /// Drain the queue with slots starting after the pickup gap.
    pub async fn drain(&self, runtime: &Arc<Runtime>) -> Result<Vec<Assignment>, SchedError> {
        let start = Utc::now() + TimeDelta::seconds(PICKUP_GAP_SECS);
        self.drain_at(runtime, start).await
    }

    /// Drain the queue as one batch with slots starting at `start`.
    #[instrument(skip(self, runtime))]
    pub async fn drain_at(
        &self,
        runtime: &Arc<Runtime>,
        start: DateTime<Utc>,
    ) -> Result<Vec<Assignment>, SchedError> {
        let _serial = self.running.lock().await;
        let ids = std::mem::take(&mut *self.queue.lock());
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let measurements = runtime
            .collection("measurements")
            .ok_or_else(|| SchedError::MissingCollection("measurements".into()))?;
        for name in ["ports", "links", "paths"] {
            if let Some(collection) = runtime.collection(name) {
                collection.load().await?;
            }
        }

        let mut batch = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(row) = measurements.get(&id) else {
                debug!(%id, "queued measurement vanished");
                continue;
            };
            let config = row.value("configuration")?.unwrap_or(Value::Null);
            let Some(params) = ScheduleParams::from_value(&config["schedule_params"]) else {
                warn!(%id, "measurement has no usable schedule_params");
                continue;
            };
            let (Some(src), Some(dst)) = (config["src"].as_str(), config["dst"].as_str()) else {
                warn!(%id, "measurement has no endpoints");
                continue;
            };
            batch.push(Request {
                resources: resources_for(runtime, src, dst),
                id,
                params,
            });
        }

        let assignments = plan(&mut self.registry.lock(), batch, start);
        for assignment in &assignments {
            let Some(row) = measurements.get(&assignment.id) else {
                continue;
            };
            let times: Vec<Value> = assignment.slots.iter().map(Slot::to_value).collect();
            row.set("scheduled_times", Value::Array(times))?;
        }
        Ok(assignments)
    }

    fn spawn_drain(&self, runtime: &Arc<Runtime>) {
        let Ok(tokio) = tokio::runtime::Handle::try_current() else {
            debug!("no async runtime; scheduling waits for an explicit drain");
            return;
        };
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        let runtime = Arc::clone(runtime);
        tokio.spawn(async move {
            if let Err(err) = this.drain(&runtime).await {
                warn!(%err, "measurement scheduling failed");
            }
        });
    }
}

impl Service for MeasurementScheduler {
    fn name(&self) -> &str {
        "scheduler"
    }

    fn listens(&self) -> Vec<(String, EventKind)> {
        vec![("measurements".into(), EventKind::New)]
    }

    fn handle(&self, runtime: &Arc<Runtime>, event: &Event) -> anyhow::Result<()> {
        let params = event
            .entity
            .read(|e| e.value_at(&["configuration", "schedule_params"]))??;
        if params.is_none() {
            return Ok(());
        }
        self.enqueue([event.entity.id()]);
        self.spawn_drain(runtime);
        Ok(())
    }
}
