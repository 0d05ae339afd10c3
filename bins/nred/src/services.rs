// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Named service factories.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use nre_paths::PathFusion;
use nre_runtime::Service;
use nre_sched::MeasurementScheduler;

/// Inputs a factory may draw on beyond the runtime settings.
#[derive(Debug, Clone, Default)]
pub struct FactoryContext {
    /// `(node id, config file)` pairs for the path resolver.
    pub router_configs: Vec<(String, PathBuf)>,
}

type Factory = fn(&FactoryContext) -> Result<Arc<dyn Service>>;

fn scheduler(_: &FactoryContext) -> Result<Arc<dyn Service>> {
    let service: Arc<dyn Service> = MeasurementScheduler::new();
    Ok(service)
}

fn paths(ctx: &FactoryContext) -> Result<Arc<dyn Service>> {
    let mut routers = Vec::with_capacity(ctx.router_configs.len());
    for (node, file) in &ctx.router_configs {
        let text = std::fs::read_to_string(file)
            .with_context(|| format!("read router config {}", file.display()))?;
        routers.push((node.clone(), text));
    }
    let service: Arc<dyn Service> = PathFusion::new(routers);
    Ok(service)
}

/// Every service the daemon knows how to build, by name.
pub fn factories() -> BTreeMap<&'static str, Factory> {
    BTreeMap::from([("paths", paths as Factory), ("scheduler", scheduler as Factory)])
}

/// Build the named service.
pub fn build(name: &str, ctx: &FactoryContext) -> Result<Arc<dyn Service>> {
    let factory = factories()
        .get(name)
        .copied()
        .ok_or_else(|| anyhow!("unknown service `{name}`"))?;
    factory(ctx)
}

/// Parse `NODE=FILE`.
pub fn parse_router_config(arg: &str) -> Result<(String, PathBuf), String> {
    match arg.split_once('=') {
        Some((node, file)) if !node.is_empty() && !file.is_empty() => {
            Ok((node.to_string(), PathBuf::from(file)))
        }
        _ => Err(format!("expected NODE=FILE, got `{arg}`")),
    }
}
