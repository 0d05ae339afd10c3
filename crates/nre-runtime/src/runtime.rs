// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The object layer: store discovery, pending writes, and flushing.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use nre_app_core::RuntimeSettings;
use nre_client::{ClientConfig, ClientError, ClientRegistry, Federation};
use nre_model::{Entity, EntityState, Href};
use nre_proto::{parse_descriptor, records, Query, DATA_COLLECTION};
use nre_schema::{SchemaCache, SchemaClass};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::collection::{next_runtime_id, CollectionContext, UnisCollection};
use crate::data::DataStream;
use crate::error::RuntimeError;
use crate::event::{EventKind, Listener, ListenerId};
use crate::flush::{dependency_graph, dependency_order, PendingSummary};
use crate::handle::EntityHandle;
use crate::pending::{PendingRow, PendingSet};
use crate::pool::WorkerPool;
use crate::service::ServiceRegistry;

/// Outcome of one [`Runtime::flush`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Collections flushed, in order.
    pub collections: Vec<String>,
    /// POST requests issued.
    pub batches: usize,
    /// Records registered or updated.
    pub flushed: usize,
}

/// Entry point of the object layer.
///
/// Owns the schema cache, the store clients, every collection, the pending
/// write set, the worker pool, data streams, and services. Created by
/// [`Runtime::start`] and torn down by [`Runtime::shutdown`]; nothing here is
/// process-global.
pub struct Runtime {
    id: u64,
    settings: RuntimeSettings,
    schemas: Arc<SchemaCache>,
    federation: Arc<Federation>,
    collections: RwLock<BTreeMap<String, Arc<UnisCollection>>>,
    by_schema: RwLock<HashMap<String, String>>,
    pending: Arc<PendingSet>,
    services: ServiceRegistry,
    pool: WorkerPool,
    streams: Mutex<HashMap<String, Arc<DataStream>>>,
    flush_serial: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    flusher: Mutex<Option<JoinHandle<()>>>,
    weak: Weak<Runtime>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("id", &self.id)
            .field("stores", &self.federation.stores())
            .field("collections", &self.collection_names())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Connect every enabled store, materialize the collections each one
    /// advertises, preload the configured collections, and (with
    /// `proxy.defer_update = false`) start the background flusher.
    #[instrument(skip_all, fields(stores = settings.unis.len()))]
    pub async fn start(settings: RuntimeSettings) -> Result<Arc<Self>, RuntimeError> {
        settings.validate()?;
        let registry = Arc::new(ClientRegistry::new(ClientConfig::from(&settings.proxy))?);
        let schemas = Arc::new(SchemaCache::new(
            registry.http().clone(),
            settings.schema.archive.clone(),
        ));
        let federation = Arc::new(Federation::new(registry));
        for store in settings.unis.iter().filter(|s| s.enabled) {
            federation.add_store(store)?;
        }
        let runtime = Arc::new_cyclic(|weak| Self {
            id: next_runtime_id(),
            pool: WorkerPool::new(settings.proxy.threads),
            settings,
            schemas,
            federation,
            collections: RwLock::new(BTreeMap::new()),
            by_schema: RwLock::new(HashMap::new()),
            pending: Arc::new(PendingSet::new()),
            services: ServiceRegistry::new(),
            streams: Mutex::new(HashMap::new()),
            flush_serial: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            flusher: Mutex::new(None),
            weak: weak.clone(),
        });
        for store in runtime.federation.stores() {
            runtime.discover(&store).await?;
        }
        for name in &runtime.settings.cache.preload {
            match runtime.collection(name) {
                Some(collection) => collection.load().await?,
                None => warn!(collection = %name, "preload names an unknown collection"),
            }
        }
        if !runtime.settings.proxy.defer_update {
            runtime.spawn_flusher();
        }
        info!(
            runtime = runtime.id,
            collections = runtime.collections.read().len(),
            "runtime started"
        );
        Ok(runtime)
    }

    #[instrument(skip(self))]
    async fn discover(&self, store: &str) -> Result<(), RuntimeError> {
        let client = self.federation.client(store)?;
        let descriptor = client.get("", &Query::new()).await?;
        for link in parse_descriptor(&descriptor) {
            if link.name == DATA_COLLECTION {
                continue;
            }
            let Some(primary) = link.schemas.first() else {
                debug!(collection = %link.name, "collection advertises no item schema");
                continue;
            };
            let mut classes = Vec::with_capacity(link.schemas.len());
            for uri in &link.schemas {
                classes.push(self.schemas.get_class(uri).await?);
            }
            {
                let mut by_schema = self.by_schema.write();
                for class in &classes {
                    by_schema.insert(class.uri().to_string(), link.name.clone());
                }
            }
            if self.collections.read().contains_key(&link.name) {
                continue;
            }
            let class = self.schemas.get_class(primary).await?;
            self.add_collection(&link.name, class);
            info!(%store, collection = %link.name, schema = %primary, "collection materialized");
        }
        Ok(())
    }

    /// Register a collection of `class` records under `name`. An existing
    /// collection with that name is returned unchanged.
    pub fn add_collection(&self, name: &str, class: Arc<SchemaClass>) -> Arc<UnisCollection> {
        let mut collections = self.collections.write();
        if let Some(existing) = collections.get(name) {
            return Arc::clone(existing);
        }
        self.by_schema
            .write()
            .entry(class.uri().to_string())
            .or_insert_with(|| name.to_string());
        let ctx = CollectionContext {
            runtime: self.id,
            federation: Some(Arc::clone(&self.federation)),
            schemas: Some(Arc::clone(&self.schemas)),
            pending: Arc::clone(&self.pending),
            page_size: self.settings.cache.page_size,
            subscribe: self.settings.proxy.subscribe,
        };
        let collection = UnisCollection::new(name, class, ctx);
        collections.insert(name.to_string(), Arc::clone(&collection));
        collection
    }

    fn spawn_flusher(&self) {
        let weak = self.weak.clone();
        let pending = Arc::clone(&self.pending);
        let task = tokio::spawn(async move {
            loop {
                pending.changed().await;
                let Some(runtime) = weak.upgrade() else {
                    break;
                };
                if runtime.is_closed() {
                    break;
                }
                if let Err(err) = runtime.flush().await {
                    warn!(%err, "background flush failed");
                }
            }
        });
        *self.flusher.lock() = Some(task);
    }

    /// Runtime identity used to claim records.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Effective settings.
    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    /// The schema cache.
    pub fn schemas(&self) -> &Arc<SchemaCache> {
        &self.schemas
    }

    /// The federation proxy.
    pub fn federation(&self) -> &Arc<Federation> {
        &self.federation
    }

    /// The pending write set.
    pub fn pending(&self) -> &Arc<PendingSet> {
        &self.pending
    }

    /// The worker pool.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Registered services.
    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    /// `true` after [`Runtime::shutdown`].
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), RuntimeError> {
        if self.is_closed() {
            Err(RuntimeError::Shutdown)
        } else {
            Ok(())
        }
    }

    /// Collection by name.
    pub fn collection(&self, name: &str) -> Option<Arc<UnisCollection>> {
        self.collections.read().get(name).cloned()
    }

    /// Collection names.
    pub fn collection_names(&self) -> Vec<String> {
        self.collections.read().keys().cloned().collect()
    }

    /// Collection holding records of `class`: the schema's own collection
    /// link, else the collection that advertised the schema, else the first
    /// collection advertising one of its ancestors.
    pub fn collection_for(&self, class: &SchemaClass) -> Option<Arc<UnisCollection>> {
        if let Some(found) = class.collection().and_then(|name| self.collection(name)) {
            return Some(found);
        }
        let by_schema = self.by_schema.read();
        let name = by_schema.get(class.uri()).cloned().or_else(|| {
            class
                .parents()
                .iter()
                .find_map(|parent| by_schema.get(parent.uri()).cloned())
        })?;
        drop(by_schema);
        self.collection(&name)
    }

    /// Resolve an href (`scheme://host/collection/id` or `collection/id`).
    ///
    /// Cached records are returned directly; otherwise the record is fetched
    /// through the federation and cached.
    pub async fn find(&self, href: &str) -> Result<EntityHandle, RuntimeError> {
        let parsed = Href::parse(href).ok_or_else(|| RuntimeError::Reference(href.to_string()))?;
        let collection = self
            .collection(&parsed.collection)
            .ok_or_else(|| RuntimeError::Reference(href.to_string()))?;
        if let Some(handle) = collection.get(&parsed.id) {
            return Ok(handle);
        }
        if let Some(handle) = collection.by_self_ref(href) {
            return Ok(handle);
        }
        let found = if parsed.is_relative() {
            collection.fetch(&parsed.id).await?
        } else {
            let (store, record) = match self.federation.get_href(href).await {
                Ok(found) => found,
                Err(ClientError::BadRequest { status: 404, .. }) => {
                    return Err(RuntimeError::Reference(href.to_string()))
                }
                Err(err) => return Err(err.into()),
            };
            collection.append_remote(&store, record)?
        };
        found.ok_or_else(|| RuntimeError::Reference(href.to_string()))
    }

    /// A fresh, unregistered record for `collection`, filled with the class
    /// defaults.
    pub fn create(&self, collection: &str) -> Result<Entity, RuntimeError> {
        let collection = self
            .collection(collection)
            .ok_or_else(|| RuntimeError::Reference(collection.to_string()))?;
        Ok(Entity::new(Arc::clone(collection.class())))
    }

    /// Add a record to the collection selected by its schema. With `commit`
    /// the record joins the pending set (and, in immediate mode, is flushed
    /// by the background flusher).
    pub fn insert(&self, entity: Entity, commit: bool) -> Result<EntityHandle, RuntimeError> {
        self.ensure_open()?;
        let collection = self
            .collection_for(entity.class())
            .ok_or_else(|| RuntimeError::Reference(entity.schema().to_string()))?;
        let handle = collection.append(entity)?;
        if commit {
            self.commit(&handle)?;
        }
        Ok(handle)
    }

    /// Queue a record for flushing and validate it.
    ///
    /// A record failing validation stays pending so the caller can fix it
    /// and flush again.
    pub fn commit(&self, handle: &EntityHandle) -> Result<(), RuntimeError> {
        let row = handle.row()?;
        let collection = handle
            .collection()
            .ok_or_else(|| RuntimeError::removed(handle.id()))?;
        let snapshot = {
            let mut entity = row.write();
            entity.commit()?;
            entity.clone()
        };
        self.pending.add(collection.name(), handle.id(), &row);
        collection.dispatch(EventKind::Commit, handle);
        snapshot.validate()?;
        Ok(())
    }

    /// Register a listener on one collection.
    pub fn on(
        &self,
        collection: &str,
        kind: EventKind,
        listener: Listener,
    ) -> Result<ListenerId, RuntimeError> {
        let collection = self
            .collection(collection)
            .ok_or_else(|| RuntimeError::Reference(collection.to_string()))?;
        Ok(collection.on(kind, listener))
    }

    /// Push every pending record to its store.
    ///
    /// Collections flush dependencies first; each collection's rows are
    /// grouped by target store and POSTed in batches of `proxy.batch`. Each
    /// echoed record is matched back to its row by id, which adopts the
    /// store's self-reference and timestamp and unlocks. Pending rows that
    /// referenced it as `collection/id` are rewritten to the new
    /// self-reference.
    ///
    /// The first failing batch aborts the flush. Batches already accepted
    /// stay flushed. A 4xx removes the batch from the pending set and
    /// returns its rows to their previous state; other failures leave it
    /// pending.
    #[instrument(skip(self), fields(runtime = self.id))]
    pub async fn flush(&self) -> Result<FlushReport, RuntimeError> {
        let _serial = self.flush_serial.lock().await;
        self.ensure_open()?;
        let summaries: Vec<PendingSummary> = self
            .pending_rows()
            .into_iter()
            .map(|p| {
                let entity = p.row.read();
                PendingSummary {
                    collection: p.collection,
                    id: p.id,
                    self_ref: entity.self_ref().map(str::to_string),
                    hrefs: entity.hrefs(),
                }
            })
            .collect();
        let mut report = FlushReport::default();
        if summaries.is_empty() {
            return Ok(report);
        }
        let order = self
            .pool
            .run(move || dependency_order(&dependency_graph(&summaries)))
            .await?;
        debug!(order = ?order, "flush order");
        for name in order {
            let Some(collection) = self.collection(&name) else {
                warn!(collection = %name, "pending rows for an unknown collection");
                continue;
            };
            let mut groups: BTreeMap<Option<String>, Vec<PendingRow>> = BTreeMap::new();
            for row in self.pending_rows().into_iter().filter(|p| p.collection == name) {
                let origin = row.row.read().origin().map(str::to_string);
                groups.entry(origin).or_default().push(row);
            }
            for (origin, rows) in groups {
                for chunk in rows.chunks(self.settings.proxy.batch.max(1)) {
                    report.flushed += self
                        .flush_batch(&collection, origin.as_deref(), chunk)
                        .await?;
                    report.batches += 1;
                }
            }
            report.collections.push(name);
        }
        Ok(report)
    }

    fn pending_rows(&self) -> Vec<PendingRow> {
        self.pending
            .snapshot()
            .into_iter()
            .filter(|p| p.row.read().is_pending())
            .collect()
    }

    async fn flush_batch(
        &self,
        collection: &Arc<UnisCollection>,
        origin: Option<&str>,
        chunk: &[PendingRow],
    ) -> Result<usize, RuntimeError> {
        let snapshots: Vec<Entity> = chunk.iter().map(|p| p.row.read().clone()).collect();
        self.pool
            .run(move || snapshots.iter().try_for_each(Entity::validate))
            .await??;
        let handles: Vec<EntityHandle> = chunk
            .iter()
            .map(|p| EntityHandle::new(&p.id, Arc::downgrade(collection), &p.row))
            .collect();
        for handle in &handles {
            collection.dispatch(EventKind::PreFlush, handle);
        }
        let sent: Vec<Value> = chunk.iter().map(|p| p.row.read().to_value()).collect();
        let body = Value::Array(sent.clone());
        let guard = collection.lock_for_flush();
        let (store, echoed) = match self.federation.post(origin, collection.name(), &body).await {
            Ok(reply) => reply,
            Err(err) => {
                drop(guard);
                if let ClientError::BadRequest { status, .. } = &err {
                    for p in chunk {
                        p.row.write().mark_rejected();
                        self.pending.remove(&p.collection, &p.id);
                    }
                    warn!(collection = %collection.name(), rows = chunk.len(), status, "flush batch rejected");
                }
                return Err(err.into());
            }
        };
        let echoed: HashMap<String, Value> = records(echoed)
            .into_iter()
            .filter_map(|r| Some((r.get("id")?.as_str()?.to_string(), r)))
            .collect();
        let mut flushed = 0;
        for (p, sent) in chunk.iter().zip(&sent) {
            let Some(record) = echoed.get(&p.id) else {
                warn!(collection = %collection.name(), id = %p.id, "flush response omitted a record");
                continue;
            };
            let rewritten = {
                let mut entity = p.row.write();
                entity.set_origin(&store);
                entity.mark_flushed(record, sent)
            };
            collection.refresh(&p.id);
            if rewritten {
                debug!(collection = %p.collection, id = %p.id, "record written during flush; kept pending");
            } else {
                self.pending.remove(&p.collection, &p.id);
            }
            if let Some(self_ref) = record.get("selfRef").and_then(Value::as_str) {
                self.rewrite_pending_refs(&format!("{}/{}", p.collection, p.id), self_ref);
            }
            flushed += 1;
        }
        drop(guard);
        info!(collection = %collection.name(), %store, rows = flushed, "flush batch accepted");
        for handle in &handles {
            collection.dispatch(EventKind::PostFlush, handle);
        }
        Ok(flushed)
    }

    fn rewrite_pending_refs(&self, relative: &str, self_ref: &str) {
        for p in self.pending.snapshot() {
            let rewritten = p.row.write().rewrite_href(relative, self_ref);
            if rewritten > 0 {
                debug!(collection = %p.collection, id = %p.id, from = relative, to = self_ref, "link rewritten");
            }
        }
    }

    /// Delete a record: DELETE it on its store when registered, then drop it
    /// from its collection (firing `delete`). Every handle to it is
    /// invalidated.
    pub async fn delete(&self, handle: &EntityHandle) -> Result<(), RuntimeError> {
        self.ensure_open()?;
        let collection = handle
            .collection()
            .ok_or_else(|| RuntimeError::removed(handle.id()))?;
        let (state, origin) = handle.read(|e| (e.state(), e.origin().map(str::to_string)))?;
        if matches!(state, EntityState::Registered | EntityState::PendingUpdate) {
            let path = format!("{}/{}", collection.name(), handle.id());
            match self.federation.delete(origin.as_deref(), &path).await {
                Ok(_) | Err(ClientError::BadRequest { status: 404, .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
        collection.remove(handle.id());
        info!(collection = %collection.name(), id = %handle.id(), "record deleted");
        Ok(())
    }

    /// Data stream for metadata `mid`, with the standard folds installed.
    ///
    /// The stream talks to the metadata record's origin store when the
    /// record is cached, else to the default store.
    pub fn data(&self, mid: &str) -> Arc<DataStream> {
        let mut streams = self.streams.lock();
        if let Some(stream) = streams.get(mid) {
            return Arc::clone(stream);
        }
        let store = self
            .collection("metadata")
            .and_then(|c| c.get(mid))
            .and_then(|h| h.read(|e| e.origin().map(str::to_string)).ok().flatten());
        let stream = DataStream::new(
            mid,
            store,
            Some(Arc::clone(&self.federation)),
            self.settings.measurements.clone(),
        );
        stream.add_standard_folds();
        streams.insert(mid.to_string(), Arc::clone(&stream));
        stream
    }

    /// Stop the runtime: stop the background flusher, publish buffered data
    /// points, refuse further pool jobs, and close every store client.
    /// Idempotent.
    #[instrument(skip(self), fields(runtime = self.id))]
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.flusher.lock().take() {
            task.abort();
        }
        let streams: Vec<Arc<DataStream>> = self.streams.lock().values().cloned().collect();
        for stream in streams {
            if let Err(err) = stream.flush().await {
                warn!(mid = %stream.mid(), %err, "data points lost at shutdown");
            }
        }
        let unflushed = self.pending.len();
        if unflushed > 0 {
            warn!(rows = unflushed, "pending records not flushed at shutdown");
        }
        self.pool.close();
        self.federation.close().await;
        info!("runtime stopped");
    }
}
