// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Live per-collection cache.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use nre_client::{ClientError, Federation, StoreEvent};
use nre_model::{Entity, ModelError};
use nre_proto::{Action, Envelope, Query};
use nre_schema::{SchemaCache, SchemaClass};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::RuntimeError;
use crate::event::{Event, EventKind, Listener, ListenerId};
use crate::handle::EntityHandle;
use crate::index::{IndexKey, SortedIndex};
use crate::pending::{PendingSet, Row};
use crate::predicate::{field_value, Predicate};

static NEXT_RUNTIME: AtomicU64 = AtomicU64::new(1);

/// A fresh runtime identity, used to claim records.
pub(crate) fn next_runtime_id() -> u64 {
    NEXT_RUNTIME.fetch_add(1, Ordering::Relaxed)
}

/// What a collection shares with its runtime.
#[derive(Clone)]
pub struct CollectionContext {
    /// Identity used to claim appended records.
    pub runtime: u64,
    /// Store access; `None` keeps the collection purely local.
    pub federation: Option<Arc<Federation>>,
    /// Class lookup for records tagged with a sub-schema.
    pub schemas: Option<Arc<SchemaCache>>,
    /// Shared pending-write set.
    pub pending: Arc<PendingSet>,
    /// Records per paged fetch.
    pub page_size: usize,
    /// Subscribe once fully loaded.
    pub subscribe: bool,
}

impl fmt::Debug for CollectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionContext")
            .field("runtime", &self.runtime)
            .field("page_size", &self.page_size)
            .field("subscribe", &self.subscribe)
            .finish_non_exhaustive()
    }
}

impl CollectionContext {
    /// Context for a collection with no stores behind it.
    pub fn detached() -> Self {
        Self {
            runtime: next_runtime_id(),
            federation: None,
            schemas: None,
            pending: Arc::new(PendingSet::new()),
            page_size: 100,
            subscribe: false,
        }
    }
}

#[derive(Default)]
struct Inner {
    rows: Vec<Option<Row>>,
    free: Vec<usize>,
    by_id: HashMap<String, usize>,
    by_self_ref: HashMap<String, usize>,
    indices: BTreeMap<String, SortedIndex>,
    fetched: usize,
    ready: bool,
    subscribed: bool,
}

impl Inner {
    fn row(&self, slot: usize) -> Option<&Row> {
        self.rows.get(slot).and_then(Option::as_ref)
    }

    fn reindex(&mut self, slot: usize) {
        let Some(row) = self.row(slot).cloned() else {
            return;
        };
        let entity = row.read();
        for (field, index) in &mut self.indices {
            index.insert(slot, IndexKey::of(field_value(&entity, field).as_ref()));
        }
        if let Some(self_ref) = entity.self_ref() {
            self.by_self_ref.insert(self_ref.to_string(), slot);
        }
    }

    fn insert(&mut self, id: &str, row: Row) -> usize {
        let slot = match self.free.pop() {
            Some(slot) => {
                self.rows[slot] = Some(row);
                slot
            }
            None => {
                self.rows.push(Some(row));
                self.rows.len() - 1
            }
        };
        self.by_id.insert(id.to_string(), slot);
        self.reindex(slot);
        slot
    }

    fn live_rows(&self) -> impl Iterator<Item = &Row> {
        self.rows.iter().flatten()
    }
}

#[derive(Default)]
struct FlushState {
    active: bool,
    deferred: Vec<(String, Envelope)>,
}

struct Registered {
    id: ListenerId,
    kind: Option<EventKind>,
    listener: Listener,
}

/// The cached rows of one collection, with indices, paging, and an event
/// bus.
///
/// Rows live in a slab addressed by slot; the primary map and every
/// secondary index refer to slots. Handles given out are weak.
pub struct UnisCollection {
    name: String,
    class: Arc<SchemaClass>,
    ctx: CollectionContext,
    inner: RwLock<Inner>,
    listeners: RwLock<Vec<Registered>>,
    next_listener: AtomicU64,
    flush: Mutex<FlushState>,
    loading: tokio::sync::Mutex<()>,
    weak: Weak<UnisCollection>,
}

impl fmt::Debug for UnisCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnisCollection")
            .field("name", &self.name)
            .field("schema", &self.class.uri())
            .field("len", &self.len())
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

/// Holds the flush lock; deferred subscription events replay on drop.
pub struct FlushGuard<'a> {
    collection: &'a UnisCollection,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        loop {
            let batch = {
                let mut state = self.collection.flush.lock();
                if state.deferred.is_empty() {
                    state.active = false;
                    return;
                }
                std::mem::take(&mut state.deferred)
            };
            debug!(
                collection = %self.collection.name,
                events = batch.len(),
                "replaying events deferred by flush"
            );
            for (store, envelope) in batch {
                self.collection.apply_now(&store, envelope);
            }
        }
    }
}

/// Lazy query results.
pub struct Matches {
    rows: std::vec::IntoIter<Row>,
    predicate: Predicate,
    collection: Weak<UnisCollection>,
}

impl Iterator for Matches {
    type Item = EntityHandle;

    fn next(&mut self) -> Option<EntityHandle> {
        for row in self.rows.by_ref() {
            let hit = {
                let entity = row.read();
                self.predicate
                    .matches(&entity)
                    .then(|| entity.id().to_string())
            };
            if let Some(id) = hit {
                return Some(EntityHandle::new(&id, self.collection.clone(), &row));
            }
        }
        None
    }
}

/// Iterates a collection, pulling pages from the stores when it runs past
/// the cached rows.
pub struct Cursor {
    collection: Arc<UnisCollection>,
    position: usize,
}

impl Cursor {
    /// Next record, or `None` once the collection is exhausted.
    pub async fn advance(&mut self) -> Result<Option<EntityHandle>, RuntimeError> {
        loop {
            let handles = self.collection.handles();
            if let Some(handle) = handles.into_iter().nth(self.position) {
                self.position += 1;
                return Ok(Some(handle));
            }
            if self.collection.is_ready() {
                return Ok(None);
            }
            self.collection.fetch_page().await?;
        }
    }
}

impl UnisCollection {
    /// New, empty collection of `class` records.
    pub fn new(name: &str, class: Arc<SchemaClass>, ctx: CollectionContext) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            name: name.to_string(),
            class,
            ctx,
            inner: RwLock::new(Inner::default()),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            flush: Mutex::new(FlushState::default()),
            loading: tokio::sync::Mutex::new(()),
            weak: weak.clone(),
        })
    }

    /// A collection with no stores behind it; it is ready immediately.
    pub fn detached(name: &str, class: Arc<SchemaClass>) -> Arc<Self> {
        let collection = Self::new(name, class, CollectionContext::detached());
        collection.inner.write().ready = true;
        collection
    }

    /// Collection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Class of the collection's records.
    pub fn class(&self) -> &Arc<SchemaClass> {
        &self.class
    }

    /// Shared context.
    pub fn context(&self) -> &CollectionContext {
        &self.ctx
    }

    /// Number of cached rows.
    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    /// `true` when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `true` once every store page has been pulled.
    pub fn is_ready(&self) -> bool {
        self.inner.read().ready
    }

    fn handle(&self, id: &str, row: &Row) -> EntityHandle {
        EntityHandle::new(id, self.weak.clone(), row)
    }

    /// Cached record by id.
    pub fn get(&self, id: &str) -> Option<EntityHandle> {
        let inner = self.inner.read();
        let slot = *inner.by_id.get(id)?;
        inner.row(slot).map(|row| self.handle(id, row))
    }

    /// Cached record by self-reference.
    pub fn by_self_ref(&self, href: &str) -> Option<EntityHandle> {
        let inner = self.inner.read();
        let slot = *inner.by_self_ref.get(href)?;
        let row = inner.row(slot)?;
        let id = row.read().id().to_string();
        Some(self.handle(&id, row))
    }

    /// Every cached record, in slot order.
    pub fn handles(&self) -> Vec<EntityHandle> {
        let inner = self.inner.read();
        inner
            .live_rows()
            .map(|row| {
                let id = row.read().id().to_string();
                self.handle(&id, row)
            })
            .collect()
    }

    /// Iterate, pulling store pages on demand.
    pub fn cursor(&self) -> Result<Cursor, RuntimeError> {
        let collection = self.weak.upgrade().ok_or(RuntimeError::Shutdown)?;
        Ok(Cursor {
            collection,
            position: 0,
        })
    }

    /// Maintain a sorted index on `field` (dotted paths allowed).
    pub fn add_index(&self, field: &str) {
        let mut inner = self.inner.write();
        if inner.indices.contains_key(field) {
            return;
        }
        let mut index = SortedIndex::new();
        for (slot, row) in inner.rows.iter().enumerate() {
            if let Some(row) = row {
                let entity = row.read();
                index.insert(slot, IndexKey::of(field_value(&entity, field).as_ref()));
            }
        }
        inner.indices.insert(field.to_string(), index);
    }

    /// Drop the index on `field`.
    pub fn remove_index(&self, field: &str) -> bool {
        self.inner.write().indices.remove(field).is_some()
    }

    /// Indexed field names.
    pub fn indexed_fields(&self) -> Vec<String> {
        self.inner.read().indices.keys().cloned().collect()
    }

    /// Record ids in `field` index order.
    pub fn index_ids(&self, field: &str) -> Option<Vec<String>> {
        let inner = self.inner.read();
        let index = inner.indices.get(field)?;
        Some(
            index
                .rows()
                .filter_map(|slot| inner.row(slot).map(|r| r.read().id().to_string()))
                .collect(),
        )
    }

    /// Cached records matching `predicate`, produced lazily.
    ///
    /// Indexed fields narrow the candidates by intersecting index lookups;
    /// without an index the collection is scanned.
    pub fn query(&self, predicate: &Predicate) -> Matches {
        let inner = self.inner.read();
        let mut candidates: Option<HashSet<usize>> = None;
        for (field, cmp) in predicate.fields() {
            if let Some(index) = inner.indices.get(field) {
                let hits: HashSet<usize> = index.lookup(cmp).into_iter().collect();
                candidates = Some(match candidates {
                    Some(prev) => prev.intersection(&hits).copied().collect(),
                    None => hits,
                });
            }
        }
        let rows: Vec<Row> = match candidates {
            Some(slots) => {
                let mut slots: Vec<usize> = slots.into_iter().collect();
                slots.sort_unstable();
                slots
                    .into_iter()
                    .filter_map(|s| inner.row(s).cloned())
                    .collect()
            }
            None => inner.live_rows().cloned().collect(),
        };
        Matches {
            rows: rows.into_iter(),
            predicate: predicate.clone(),
            collection: self.weak.clone(),
        }
    }

    /// First cached record matching `predicate`.
    pub fn first_where(&self, predicate: &Predicate) -> Option<EntityHandle> {
        self.query(predicate).next()
    }

    /// Add a record. An existing id is merged instead (firing `update`);
    /// otherwise the row is added (firing `new`).
    pub fn append(&self, mut entity: Entity) -> Result<EntityHandle, RuntimeError> {
        if !entity.claim(self.ctx.runtime) {
            return Err(RuntimeError::WrongRuntime {
                id: entity.id().to_string(),
            });
        }
        let id = entity.id().to_string();
        let existing = {
            let inner = self.inner.read();
            inner.by_id.get(&id).and_then(|s| inner.row(*s).cloned())
        };
        if let Some(row) = existing {
            let changed = row.write().merge(&entity)?;
            let handle = self.handle(&id, &row);
            if changed {
                self.refresh(&id);
                self.dispatch(EventKind::Update, &handle);
            }
            return Ok(handle);
        }
        let row: Row = Arc::new(RwLock::new(entity));
        self.inner.write().insert(&id, Arc::clone(&row));
        let handle = self.handle(&id, &row);
        self.dispatch(EventKind::New, &handle);
        Ok(handle)
    }

    /// Fold a store record into the cache.
    ///
    /// Merge failures (id mismatch, missing id) are logged and the incoming
    /// record is dropped (`Ok(None)`).
    pub fn append_remote(
        &self,
        store: &str,
        value: Value,
    ) -> Result<Option<EntityHandle>, RuntimeError> {
        let Some(id) = value.get("id").and_then(Value::as_str).map(str::to_string) else {
            warn!(collection = %self.name, %store, "dropping record without id");
            return Ok(None);
        };
        let existing = {
            let inner = self.inner.read();
            inner.by_id.get(&id).and_then(|s| inner.row(*s).cloned())
        };
        if let Some(row) = existing {
            let merged = {
                let mut entity = row.write();
                entity.set_origin(store);
                entity.merge_value(&value)
            };
            let handle = self.handle(&id, &row);
            match merged {
                Ok(true) => {
                    self.refresh(&id);
                    self.dispatch(EventKind::Update, &handle);
                }
                Ok(false) => {}
                Err(ModelError::Merge(err)) => {
                    warn!(collection = %self.name, %id, %err, "merge rejected");
                    return Ok(None);
                }
                Err(err) => return Err(err.into()),
            }
            return Ok(Some(handle));
        }
        let class = self.class_for(&value);
        let mut entity = match Entity::from_value(class, value) {
            Ok(entity) => entity,
            Err(err) => {
                warn!(collection = %self.name, %id, %err, "merge rejected");
                return Ok(None);
            }
        };
        entity.set_origin(store);
        self.append(entity).map(Some)
    }

    fn class_for(&self, value: &Value) -> Arc<SchemaClass> {
        let tagged = value
            .get("$schema")
            .or_else(|| value.get(":type"))
            .and_then(Value::as_str);
        match (tagged, &self.ctx.schemas) {
            (Some(uri), Some(schemas)) => schemas
                .class(uri)
                .unwrap_or_else(|| Arc::clone(&self.class)),
            _ => Arc::clone(&self.class),
        }
    }

    /// Remove a record: mark it deleted, drop it from every index, and fire
    /// `delete`. Returns `false` when the id is not cached.
    pub fn remove(&self, id: &str) -> bool {
        let row = {
            let mut inner = self.inner.write();
            let Some(slot) = inner.by_id.remove(id) else {
                return false;
            };
            let Some(row) = inner.rows.get_mut(slot).and_then(Option::take) else {
                return false;
            };
            for index in inner.indices.values_mut() {
                index.remove(slot);
            }
            inner.by_self_ref.retain(|_, s| *s != slot);
            inner.free.push(slot);
            row
        };
        self.ctx.pending.remove(&self.name, id);
        let handle = self.handle(id, &row);
        self.dispatch(EventKind::Delete, &handle);
        row.write().mark_deleted();
        true
    }

    /// Recompute index keys and the self-reference map for one row.
    pub(crate) fn refresh(&self, id: &str) {
        let mut inner = self.inner.write();
        if let Some(slot) = inner.by_id.get(id).copied() {
            inner.reindex(slot);
        }
    }

    pub(crate) fn after_write(&self, handle: &EntityHandle, row: &Row, live: bool, pending: bool) {
        self.refresh(handle.id());
        if pending {
            self.ctx.pending.add(&self.name, handle.id(), row);
        }
        if live {
            self.dispatch(EventKind::Update, handle);
        }
    }

    /// Register a listener for one event kind.
    pub fn on(&self, kind: EventKind, listener: Listener) -> ListenerId {
        self.register(Some(kind), listener)
    }

    /// Register a listener for every event kind.
    pub fn on_any(&self, listener: Listener) -> ListenerId {
        self.register(None, listener)
    }

    fn register(&self, kind: Option<EventKind>, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push(Registered { id, kind, listener });
        id
    }

    /// Remove a listener.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    /// Deliver one event. A failing listener is logged and skipped.
    pub(crate) fn dispatch(&self, kind: EventKind, handle: &EntityHandle) {
        let targets: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .filter(|l| l.kind.is_none_or(|k| k == kind))
            .map(|l| Arc::clone(&l.listener))
            .collect();
        if targets.is_empty() {
            return;
        }
        let event = Event {
            kind,
            collection: self.name.clone(),
            entity: handle.clone(),
        };
        for listener in targets {
            if let Err(err) = listener(&event) {
                warn!(collection = %self.name, ?kind, id = %handle.id(), %err, "listener failed");
            }
        }
    }

    /// Take the flush lock. Subscription events arriving while it is held
    /// are queued and applied, in order, when the guard drops.
    pub fn lock_for_flush(&self) -> FlushGuard<'_> {
        self.flush.lock().active = true;
        FlushGuard { collection: self }
    }

    /// Apply a pushed record (subscription entry point).
    pub fn apply(&self, store: &str, envelope: Envelope) {
        {
            let mut state = self.flush.lock();
            if state.active {
                state.deferred.push((store.to_string(), envelope));
                return;
            }
        }
        self.apply_now(store, envelope);
    }

    fn apply_now(&self, store: &str, envelope: Envelope) {
        match envelope.action() {
            Action::Delete => {
                if let Some(id) = envelope.data.get("id").and_then(Value::as_str) {
                    self.remove(id);
                }
            }
            Action::Upsert => {
                for record in nre_proto::records(envelope.data) {
                    if let Err(err) = self.append_remote(store, record) {
                        warn!(collection = %self.name, %store, %err, "dropping pushed record");
                    }
                }
            }
        }
    }

    /// Pull the next page from every store. When every store answered with
    /// a short page the collection becomes ready and, if configured,
    /// subscribes for later changes.
    pub async fn fetch_page(&self) -> Result<usize, RuntimeError> {
        let _serial = self.loading.lock().await;
        if self.is_ready() {
            return Ok(0);
        }
        let Some(federation) = self.ctx.federation.clone() else {
            self.inner.write().ready = true;
            return Ok(0);
        };
        let page_size = self.ctx.page_size.max(1);
        let skip = self.inner.read().fetched;
        let query = Query::new().limit(page_size).skip(skip);
        let page = federation.get_page(&self.name, &query).await?;
        let count = page.records.len();
        for (store, record) in page.records {
            self.append_remote(&store, record)?;
        }
        self.inner.write().fetched += page_size;
        debug!(collection = %self.name, skip, count, "page fetched");
        if page.longest < page_size {
            self.inner.write().ready = true;
            info!(collection = %self.name, rows = self.len(), "collection loaded");
            self.ensure_subscribed()?;
        }
        Ok(count)
    }

    /// Pull pages until the collection is ready.
    pub async fn load(&self) -> Result<(), RuntimeError> {
        while !self.is_ready() {
            self.fetch_page().await?;
        }
        Ok(())
    }

    /// Subscribe to the collection channel on every store (once).
    pub fn ensure_subscribed(&self) -> Result<(), RuntimeError> {
        let Some(federation) = &self.ctx.federation else {
            return Ok(());
        };
        if !self.ctx.subscribe {
            return Ok(());
        }
        {
            let mut inner = self.inner.write();
            if inner.subscribed {
                return Ok(());
            }
            inner.subscribed = true;
        }
        let weak = self.weak.clone();
        let result = federation.subscribe(
            &self.name,
            Arc::new(move |event: StoreEvent| {
                if let Some(collection) = weak.upgrade() {
                    collection.apply(&event.store, event.envelope);
                }
            }),
        );
        if let Err(err) = result {
            self.inner.write().subscribed = false;
            return Err(err.into());
        }
        Ok(())
    }

    /// Fetch one record by id from the stores and cache it.
    pub async fn fetch(&self, id: &str) -> Result<Option<EntityHandle>, RuntimeError> {
        let federation = self
            .ctx
            .federation
            .clone()
            .ok_or_else(|| RuntimeError::Reference(format!("{}/{id}", self.name)))?;
        let query = Query::new().eq("id", id);
        match federation.get_collection(&self.name, &query).await {
            Ok(found) => match found.into_iter().find(|(_, r)| r["id"] == id) {
                Some((store, record)) => self.append_remote(&store, record),
                None => Ok(None),
            },
            Err(ClientError::BadRequest { status: 404, .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}
