// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Services: named consumers of collection events.
//!
//! A service declares the `(collection, event kind)` pairs it listens to and
//! the services it depends on. The registry installs one bus listener per
//! collection and delivers each event to the interested services in
//! dependency order, so a service always sees an event after the services
//! it builds on.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::RuntimeError;
use crate::event::{Event, EventKind};
use crate::flush::dependency_order;
use crate::runtime::Runtime;

/// A runtime service.
pub trait Service: Send + Sync {
    /// Unique service name.
    fn name(&self) -> &str;

    /// Services whose listeners must run before this one's.
    fn depends_on(&self) -> Vec<String> {
        Vec::new()
    }

    /// `(collection, kind)` pairs delivered to [`Service::handle`].
    fn listens(&self) -> Vec<(String, EventKind)>;

    /// React to one event. Errors are logged and skipped.
    ///
    /// While this runs the record's live flag is clear, so writes made here
    /// to the event's record do not fire further `update` events.
    fn handle(&self, runtime: &Arc<Runtime>, event: &Event) -> anyhow::Result<()>;

    /// Called once after the service is registered and its collections are
    /// hooked, before existing rows are replayed.
    fn attached(&self, _runtime: &Arc<Runtime>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Registered services in dispatch order.
#[derive(Default)]
pub struct ServiceRegistry {
    ordered: RwLock<Vec<Arc<dyn Service>>>,
    hooked: Mutex<HashSet<String>>,
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.names())
            .finish_non_exhaustive()
    }
}

impl ServiceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Service names in dispatch order.
    pub fn names(&self) -> Vec<String> {
        self.ordered
            .read()
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    /// Service by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.ordered.read().iter().find(|s| s.name() == name).cloned()
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.ordered.read().len()
    }

    /// `true` when no service is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, service: Arc<dyn Service>) -> Result<(), RuntimeError> {
        let mut ordered = self.ordered.write();
        if ordered.iter().any(|s| s.name() == service.name()) {
            return Err(RuntimeError::Reference(format!(
                "service `{}` already registered",
                service.name()
            )));
        }
        ordered.push(service);
        let known: BTreeSet<String> = ordered.iter().map(|s| s.name().to_string()).collect();
        let graph: BTreeMap<String, BTreeSet<String>> = ordered
            .iter()
            .map(|s| {
                let deps = s.depends_on().into_iter().collect::<BTreeSet<_>>();
                for missing in deps.difference(&known) {
                    debug!(service = %s.name(), dependency = %missing, "dependency not registered yet");
                }
                (s.name().to_string(), deps)
            })
            .collect();
        let order = dependency_order(&graph);
        let mut by_name: BTreeMap<String, Arc<dyn Service>> = ordered
            .drain(..)
            .map(|s| (s.name().to_string(), s))
            .collect();
        ordered.extend(order.iter().filter_map(|name| by_name.remove(name)));
        Ok(())
    }

    fn dispatch(&self, runtime: &Arc<Runtime>, event: &Event) {
        let targets: Vec<Arc<dyn Service>> = self
            .ordered
            .read()
            .iter()
            .filter(|s| {
                s.listens()
                    .iter()
                    .any(|(c, k)| *c == event.collection && *k == event.kind)
            })
            .cloned()
            .collect();
        for service in targets {
            deliver(&service, runtime, event);
        }
    }
}

fn deliver(service: &Arc<dyn Service>, runtime: &Arc<Runtime>, event: &Event) {
    let previous = event.entity.set_live(false);
    let result = service.handle(runtime, event);
    if let Some(previous) = previous {
        event.entity.set_live(previous);
    }
    if let Err(err) = result {
        warn!(
            service = %service.name(),
            collection = %event.collection,
            kind = ?event.kind,
            id = %event.entity.id(),
            %err,
            "service listener failed"
        );
    }
}

impl Runtime {
    /// Register a service: hook its collections, call
    /// [`Service::attached`], then replay existing rows as `new` events for
    /// the collections it listens to with [`EventKind::New`].
    pub fn add_service(self: &Arc<Self>, service: Arc<dyn Service>) -> Result<(), RuntimeError> {
        self.services().insert(Arc::clone(&service))?;
        let listens = service.listens();
        let collections: BTreeSet<&str> = listens.iter().map(|(c, _)| c.as_str()).collect();
        for name in &collections {
            if self.collection(name).is_none() {
                warn!(service = %service.name(), collection = %name, "service listens to an unknown collection");
                continue;
            }
            self.hook(name);
        }
        if let Err(err) = service.attached(self) {
            warn!(service = %service.name(), %err, "service attach failed");
        }
        for (name, kind) in &listens {
            if *kind != EventKind::New {
                continue;
            }
            let Some(collection) = self.collection(name) else {
                continue;
            };
            let handles = collection.handles();
            debug!(service = %service.name(), collection = %name, rows = handles.len(), "replaying rows");
            for handle in handles {
                let event = Event {
                    kind: EventKind::New,
                    collection: name.clone(),
                    entity: handle,
                };
                deliver(&service, self, &event);
            }
        }
        info!(service = %service.name(), order = ?self.services().names(), "service registered");
        Ok(())
    }

    fn hook(self: &Arc<Self>, name: &str) {
        if !self.services().hooked.lock().insert(name.to_string()) {
            return;
        }
        let Some(collection) = self.collection(name) else {
            return;
        };
        let weak: Weak<Runtime> = Arc::downgrade(self);
        collection.on_any(Arc::new(move |event: &Event| {
            if let Some(runtime) = weak.upgrade() {
                runtime.services().dispatch(&runtime, event);
            }
            Ok(())
        }));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct Named(&'static str, Vec<&'static str>);

    impl Service for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn depends_on(&self) -> Vec<String> {
            self.1.iter().map(|d| (*d).to_string()).collect()
        }

        fn listens(&self) -> Vec<(String, EventKind)> {
            Vec::new()
        }

        fn handle(&self, _: &Arc<Runtime>, _: &Event) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn registry_orders_by_dependency() {
        let registry = ServiceRegistry::new();
        registry.insert(Arc::new(Named("sched", vec!["paths"]))).unwrap();
        registry.insert(Arc::new(Named("paths", vec!["topology"]))).unwrap();
        registry.insert(Arc::new(Named("topology", vec![]))).unwrap();
        assert_eq!(registry.names(), vec!["topology", "paths", "sched"]);
        assert!(registry.insert(Arc::new(Named("paths", vec![]))).is_err());
        assert_eq!(registry.len(), 3);
    }
}
