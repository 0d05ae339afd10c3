// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Weak references to cached records.

use std::fmt;
use std::sync::{Arc, Weak};

use nre_model::{Entity, EntityState, Micros, ModelError};
use parking_lot::RwLock;
use serde_json::Value;

use crate::collection::UnisCollection;
use crate::error::RuntimeError;
use crate::pending::Row;

/// A weak reference to one cached record.
///
/// Handles never keep a record alive: once the record is deleted every
/// access fails with `RemovedEntity`. Writes go through the owning
/// collection so indices, the pending set, and the event bus stay current.
#[derive(Clone)]
pub struct EntityHandle {
    id: String,
    collection: Weak<UnisCollection>,
    row: Weak<RwLock<Entity>>,
}

impl fmt::Debug for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityHandle")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl PartialEq for EntityHandle {
    fn eq(&self, other: &Self) -> bool {
        self.row.ptr_eq(&other.row)
    }
}

impl EntityHandle {
    pub(crate) fn new(id: &str, collection: Weak<UnisCollection>, row: &Row) -> Self {
        Self {
            id: id.to_string(),
            collection,
            row: Arc::downgrade(row),
        }
    }

    /// Record id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The owning collection, while it exists.
    pub fn collection(&self) -> Option<Arc<UnisCollection>> {
        self.collection.upgrade()
    }

    /// `false` once the record was deleted.
    pub fn is_alive(&self) -> bool {
        self.row
            .upgrade()
            .is_some_and(|row| !row.read().is_deleted())
    }

    pub(crate) fn row(&self) -> Result<Row, RuntimeError> {
        let row = self
            .row
            .upgrade()
            .ok_or_else(|| RuntimeError::removed(&self.id))?;
        if row.read().is_deleted() {
            return Err(RuntimeError::removed(&self.id));
        }
        Ok(row)
    }

    /// Run `f` against the record.
    pub fn read<R>(&self, f: impl FnOnce(&Entity) -> R) -> Result<R, RuntimeError> {
        let row = self.row()?;
        let entity = row.read();
        Ok(f(&entity))
    }

    /// Field value as JSON (identity fields included).
    pub fn value(&self, name: &str) -> Result<Option<Value>, RuntimeError> {
        let row = self.row()?;
        let value = row.read().value(name)?;
        Ok(value)
    }

    /// String field shortcut.
    pub fn str(&self, name: &str) -> Result<Option<String>, RuntimeError> {
        Ok(self
            .value(name)?
            .and_then(|v| v.as_str().map(str::to_string)))
    }

    /// Store timestamp.
    pub fn ts(&self) -> Result<Micros, RuntimeError> {
        self.read(Entity::ts)
    }

    /// Self-reference, once registered.
    pub fn self_ref(&self) -> Result<Option<String>, RuntimeError> {
        self.read(|e| e.self_ref().map(str::to_string))
    }

    /// Lifecycle state.
    pub fn state(&self) -> Result<EntityState, RuntimeError> {
        self.read(Entity::state)
    }

    /// Serialized record.
    pub fn to_value(&self) -> Result<Value, RuntimeError> {
        self.read(Entity::to_value)
    }

    /// Deep copy of the record.
    pub fn snapshot(&self) -> Result<Entity, RuntimeError> {
        self.read(Entity::clone)
    }

    /// Assign and lock a field.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<(), RuntimeError> {
        let value = value.into();
        self.modify(|e| e.set(name, value))
    }

    /// Assign and lock a nested field.
    pub fn set_path(&self, path: &[&str], value: impl Into<Value>) -> Result<(), RuntimeError> {
        let value = value.into();
        self.modify(|e| e.set_path(path, value))
    }

    /// Mutate the record.
    ///
    /// Registered records are committed automatically, joining the pending
    /// set; an `update` event fires unless the record's live flag is clear.
    pub fn modify<R>(
        &self,
        f: impl FnOnce(&mut Entity) -> Result<R, ModelError>,
    ) -> Result<R, RuntimeError> {
        let row = self.row()?;
        let (out, live, pending) = {
            let mut entity = row.write();
            let out = f(&mut entity)?;
            if matches!(
                entity.state(),
                EntityState::Registered | EntityState::PendingUpdate | EntityState::PendingCreate
            ) {
                entity.commit()?;
            }
            (out, entity.is_live(), entity.is_pending())
        };
        if let Some(collection) = self.collection.upgrade() {
            collection.after_write(self, &row, live, pending);
        }
        Ok(out)
    }

    /// Toggle the live flag (suppresses `update` events for local writes).
    pub(crate) fn set_live(&self, live: bool) -> Option<bool> {
        let row = self.row.upgrade()?;
        let mut entity = row.write();
        let previous = entity.is_live();
        entity.set_live(live);
        Some(previous)
    }
}
