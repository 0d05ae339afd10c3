// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Top-level records.

use std::collections::BTreeSet;
use std::sync::Arc;

use nre_schema::SchemaClass;
use serde_json::{Map, Value};

use crate::error::{MergeError, ModelError};
use crate::resource::{Local, Resource};
use crate::Micros;

/// Identity fields that cannot be assigned through [`Entity::set`].
pub const RESERVED_FIELDS: [&str; 5] = ["id", "ts", "selfRef", "$schema", ":type"];

/// Lifecycle of an entity.
///
/// ```text
/// Unregistered --insert+commit--> PendingCreate --flush ok--> Registered
///                                       \--flush 4xx--> Unregistered
/// Registered --locked write+commit--> PendingUpdate --flush ok--> Registered
/// any --DELETE ok--> Deleted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    /// Created locally, never flushed.
    Unregistered,
    /// Queued for its first POST.
    PendingCreate,
    /// Known to a store (has a self-reference).
    Registered,
    /// Registered, with committed local writes awaiting flush.
    PendingUpdate,
    /// Deleted; field access fails.
    Deleted,
}

/// A remote-identified record.
///
/// The class (selected by the `$schema` tag) is immutable for the life of
/// the entity. Identity fields live outside the field tree so they can never
/// be locked or merged.
#[derive(Debug, Clone)]
pub struct Entity {
    class: Arc<SchemaClass>,
    id: String,
    ts: Micros,
    self_ref: Option<String>,
    body: Local,
    state: EntityState,
    origin: Option<String>,
    owner: Option<u64>,
    live: bool,
}

impl Entity {
    /// A fresh, unregistered record populated with the class defaults and a
    /// generated identifier.
    pub fn new(class: Arc<SchemaClass>) -> Self {
        let mut body = Local::new();
        for (name, value) in class.defaults() {
            if !RESERVED_FIELDS.contains(&name.as_str()) {
                body.put(&name, Resource::from(value));
            }
        }
        Self {
            class,
            id: uuid::Uuid::new_v4().to_string(),
            ts: 0,
            self_ref: None,
            body,
            state: EntityState::Unregistered,
            origin: None,
            owner: None,
            live: true,
        }
    }

    /// Instantiate a record discovered from a store. It is registered when
    /// it carries a `selfRef`.
    pub fn from_value(class: Arc<SchemaClass>, value: Value) -> Result<Self, MergeError> {
        let Value::Object(mut map) = value else {
            return Err(MergeError::NotAnObject);
        };
        let id = match map.remove("id") {
            Some(Value::String(id)) if !id.is_empty() => id,
            _ => return Err(MergeError::MissingId),
        };
        let ts = map.remove("ts").and_then(|t| t.as_i64()).unwrap_or(0);
        let self_ref = match map.remove("selfRef") {
            Some(Value::String(s)) if !s.is_empty() => Some(s),
            _ => None,
        };
        map.remove("$schema");
        map.remove(":type");
        let state = if self_ref.is_some() {
            EntityState::Registered
        } else {
            EntityState::Unregistered
        };
        Ok(Self {
            class,
            id,
            ts,
            self_ref,
            body: Local::from_map(map),
            state,
            origin: None,
            owner: None,
            live: true,
        })
    }

    /// The schema class.
    pub fn class(&self) -> &Arc<SchemaClass> {
        &self.class
    }

    /// Schema URI (type tag).
    pub fn schema(&self) -> &str {
        self.class.uri()
    }

    /// Identifier, unique within the collection.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Replace the identifier of an unregistered record.
    pub fn set_id(&mut self, id: impl Into<String>) -> Result<(), ModelError> {
        self.ensure_alive()?;
        if self.self_ref.is_some() {
            return Err(ModelError::ReservedField("id".into()));
        }
        self.id = id.into();
        Ok(())
    }

    /// Store-assigned timestamp (microseconds).
    pub fn ts(&self) -> Micros {
        self.ts
    }

    /// Self-reference, once registered.
    pub fn self_ref(&self) -> Option<&str> {
        self.self_ref.as_deref()
    }

    /// Lifecycle state.
    pub fn state(&self) -> EntityState {
        self.state
    }

    /// `true` once the store assigned a self-reference.
    pub fn is_registered(&self) -> bool {
        self.self_ref.is_some()
    }

    /// `true` after a successful DELETE.
    pub fn is_deleted(&self) -> bool {
        self.state == EntityState::Deleted
    }

    /// Store that created or served this record.
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    /// Record the origin store (first writer wins).
    pub fn set_origin(&mut self, store: &str) {
        if self.origin.is_none() {
            self.origin = Some(store.to_string());
        }
    }

    /// Runtime that owns this record, if it has been appended anywhere.
    pub fn owner(&self) -> Option<u64> {
        self.owner
    }

    /// Claim the record for `runtime`. Returns `false` when another runtime
    /// already owns it.
    pub fn claim(&mut self, runtime: u64) -> bool {
        match self.owner {
            Some(existing) => existing == runtime,
            None => {
                self.owner = Some(runtime);
                true
            }
        }
    }

    /// Whether field writes raise update events.
    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Toggle update events; cleared while a service listener writes.
    pub fn set_live(&mut self, live: bool) {
        self.live = live;
    }

    /// Read a field.
    pub fn get(&self, name: &str) -> Result<Option<&Resource>, ModelError> {
        self.ensure_alive()?;
        Ok(self.body.get(name))
    }

    /// Read a field as JSON. Identity fields are answered too.
    pub fn value(&self, name: &str) -> Result<Option<Value>, ModelError> {
        self.ensure_alive()?;
        Ok(match name {
            "id" => Some(Value::String(self.id.clone())),
            "ts" => Some(Value::from(self.ts)),
            "selfRef" => self.self_ref.clone().map(Value::String),
            "$schema" | ":type" => Some(Value::String(self.schema().to_string())),
            _ => self.body.get(name).map(Resource::to_value),
        })
    }

    /// Read a nested value by path (`["location", "lat"]`).
    pub fn value_at(&self, path: &[&str]) -> Result<Option<Value>, ModelError> {
        let Some((head, rest)) = path.split_first() else {
            return Ok(None);
        };
        let mut current = match self.value(head)? {
            Some(v) => v,
            None => return Ok(None),
        };
        for step in rest {
            current = match current {
                Value::Object(mut map) => match map.remove(*step) {
                    Some(v) => v,
                    None => return Ok(None),
                },
                Value::Array(mut items) => match step.parse::<usize>() {
                    Ok(i) if i < items.len() => items.swap_remove(i),
                    _ => return Ok(None),
                },
                _ => return Ok(None),
            };
        }
        Ok(Some(current))
    }

    /// The field tree.
    pub fn body(&self) -> &Local {
        &self.body
    }

    /// Assign and lock a top-level field.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<(), ModelError> {
        self.ensure_alive()?;
        if RESERVED_FIELDS.contains(&name) {
            return Err(ModelError::ReservedField(name.to_string()));
        }
        self.body.set(name, Resource::from(value.into()));
        Ok(())
    }

    /// Assign and lock a nested field.
    pub fn set_path(&mut self, path: &[&str], value: impl Into<Value>) -> Result<(), ModelError> {
        self.ensure_alive()?;
        if let Some(head) = path.first() {
            if RESERVED_FIELDS.contains(head) {
                return Err(ModelError::ReservedField((*head).to_string()));
            }
        }
        self.body.set_path(path, Resource::from(value.into()))
    }

    /// Top-level locked field names.
    pub fn locked(&self) -> &BTreeSet<String> {
        self.body.locked()
    }

    /// `true` when any field in the tree is locked.
    pub fn has_locks(&self) -> bool {
        self.body.has_locks()
    }

    /// Clear every lock.
    pub fn unlock(&mut self) {
        self.body.unlock();
    }

    /// Fold a newer copy of the same record into this one.
    ///
    /// Returns `Ok(false)` (no-op) unless `incoming.ts > self.ts`. Locked
    /// fields are preserved unconditionally.
    pub fn merge(&mut self, incoming: &Entity) -> Result<bool, ModelError> {
        self.ensure_alive()?;
        if incoming.id != self.id {
            return Err(MergeError::IdMismatch {
                local: self.id.clone(),
                incoming: incoming.id.clone(),
            }
            .into());
        }
        if incoming.ts <= self.ts {
            return Ok(false);
        }
        self.body.merge(&incoming.body);
        self.ts = incoming.ts;
        if self.self_ref.is_none() {
            if let Some(self_ref) = &incoming.self_ref {
                self.self_ref = Some(self_ref.clone());
                if self.state == EntityState::Unregistered {
                    self.state = EntityState::Registered;
                }
            }
        }
        Ok(true)
    }

    /// [`Entity::merge`] from a raw document (subscription delta, fan-in copy).
    pub fn merge_value(&mut self, incoming: &Value) -> Result<bool, ModelError> {
        let incoming = Self::from_value(Arc::clone(&self.class), incoming.clone())?;
        self.merge(&incoming)
    }

    /// Deep copy suitable for insertion as a new record: identifier and
    /// self-reference are discarded and nothing is locked.
    pub fn clone_new(&self) -> Result<Self, ModelError> {
        self.ensure_alive()?;
        let mut body = self.body.clone();
        body.unlock();
        Ok(Self {
            class: Arc::clone(&self.class),
            id: uuid::Uuid::new_v4().to_string(),
            ts: 0,
            self_ref: None,
            body,
            state: EntityState::Unregistered,
            origin: None,
            owner: None,
            live: true,
        })
    }

    /// Serialize, including identity fields.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("id".into(), Value::String(self.id.clone()));
        map.insert("ts".into(), Value::from(self.ts));
        if let Some(self_ref) = &self.self_ref {
            map.insert("selfRef".into(), Value::String(self_ref.clone()));
        }
        map.insert("$schema".into(), Value::String(self.schema().to_string()));
        map.extend(self.body.to_map());
        Value::Object(map)
    }

    /// Run the schema validator over the serialized form.
    pub fn validate(&self) -> Result<(), ModelError> {
        self.ensure_alive()?;
        self.class.validate(&self.to_value())?;
        Ok(())
    }

    /// Every link target referenced from this record.
    pub fn hrefs(&self) -> Vec<String> {
        self.body.hrefs()
    }

    /// Rewrite link targets (used after a dependency is registered).
    pub fn rewrite_href(&mut self, from: &str, to: &str) -> usize {
        self.body.rewrite_href(from, to)
    }

    /// Queue local writes. Returns `true` when the record now needs a flush.
    pub fn commit(&mut self) -> Result<bool, ModelError> {
        self.state = match self.state {
            EntityState::Unregistered | EntityState::PendingCreate => EntityState::PendingCreate,
            EntityState::Registered | EntityState::PendingUpdate => EntityState::PendingUpdate,
            EntityState::Deleted => {
                return Err(ModelError::RemovedEntity {
                    id: self.id.clone(),
                })
            }
        };
        Ok(true)
    }

    /// `true` while waiting for a flush.
    pub fn is_pending(&self) -> bool {
        matches!(
            self.state,
            EntityState::PendingCreate | EntityState::PendingUpdate
        )
    }

    /// Apply a flush response for the body `sent`: adopt the store's
    /// self-reference and timestamp, release the locks the store has
    /// acknowledged, and merge any extra server fields.
    ///
    /// Fields written after `sent` was captured keep their locks and local
    /// values; the record then stays pending and `true` is returned.
    pub fn mark_flushed(&mut self, echoed: &Value, sent: &Value) -> bool {
        if let Some(self_ref) = echoed.get("selfRef").and_then(Value::as_str) {
            self.self_ref = Some(self_ref.to_string());
        }
        let echoed_ts = echoed.get("ts").and_then(Value::as_i64).unwrap_or(self.ts);
        let still_locked = match sent {
            Value::Object(sent) => self.body.settle(sent),
            _ => self.body.has_locks(),
        };
        if let Value::Object(map) = echoed {
            let mut extra = map.clone();
            for reserved in RESERVED_FIELDS {
                extra.remove(reserved);
            }
            self.body.merge(&Local::from_map(extra));
        }
        self.ts = self.ts.max(echoed_ts);
        self.state = if still_locked {
            EntityState::PendingUpdate
        } else {
            EntityState::Registered
        };
        still_locked
    }

    /// Apply a 4xx flush response.
    pub fn mark_rejected(&mut self) {
        self.state = match self.state {
            EntityState::PendingCreate => EntityState::Unregistered,
            EntityState::PendingUpdate => EntityState::Registered,
            other => other,
        };
    }

    /// Apply a successful DELETE.
    pub fn mark_deleted(&mut self) {
        self.state = EntityState::Deleted;
    }

    /// Drop a field (server-side removal).
    pub fn remove_field(&mut self, name: &str) -> Result<Option<Resource>, ModelError> {
        self.ensure_alive()?;
        Ok(self.body.remove(name))
    }

    fn ensure_alive(&self) -> Result<(), ModelError> {
        if self.state == EntityState::Deleted {
            Err(ModelError::RemovedEntity {
                id: self.id.clone(),
            })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn node_class() -> Arc<SchemaClass> {
        let cache = nre_schema::SchemaCache::default();
        cache.insert(
            "http://x/schema/node",
            json!({
                "id": "http://x/schema/node#",
                "required": ["id", "name"],
                "properties": {
                    "id": {"type": "string"},
                    "ts": {"type": "integer"},
                    "name": {"type": "string"},
                    "urn": {"type": "string"},
                    "location": {"type": "object"}
                }
            }),
        );
        cache.build_seeded("http://x/schema/node").unwrap()
    }

    fn discovered(v: Value) -> Entity {
        Entity::from_value(node_class(), v).unwrap()
    }

    #[test]
    fn discovered_record_is_registered() {
        let e = discovered(json!({"id": "n1", "ts": 5, "selfRef": "http://s/nodes/n1", "name": "a"}));
        assert_eq!(e.state(), EntityState::Registered);
        assert_eq!(e.ts(), 5);
        assert_eq!(e.value("name").unwrap(), Some(json!("a")));
        assert_eq!(e.value("$schema").unwrap(), Some(json!("http://x/schema/node")));
    }

    #[test]
    fn reserved_fields_cannot_be_set() {
        let mut e = Entity::new(node_class());
        for field in RESERVED_FIELDS {
            assert_eq!(
                e.set(field, "x"),
                Err(ModelError::ReservedField(field.to_string()))
            );
        }
    }

    #[test]
    fn new_entities_carry_defaults_and_an_id() {
        let e = Entity::new(node_class());
        assert!(!e.id().is_empty());
        assert_eq!(e.value("name").unwrap(), Some(json!("")));
        assert_eq!(e.value("location").unwrap(), Some(json!({})));
        assert_eq!(e.state(), EntityState::Unregistered);
    }

    #[test]
    fn locked_write_survives_newer_server_copy() {
        let mut e = discovered(json!({"id": "n1", "ts": 5, "name": "a"}));
        e.set("name", "b").unwrap();
        let merged = e
            .merge_value(&json!({"id": "n1", "ts": 7, "name": "c", "urn": "u"}))
            .unwrap();
        assert!(merged);
        assert_eq!(e.value("name").unwrap(), Some(json!("b")));
        assert_eq!(e.value("urn").unwrap(), Some(json!("u")));
        assert_eq!(e.ts(), 7);
    }

    #[test]
    fn stale_copy_is_a_noop() {
        let mut e = discovered(json!({"id": "n1", "ts": 5, "name": "a"}));
        assert!(!e.merge_value(&json!({"id": "n1", "ts": 5, "name": "z"})).unwrap());
        assert!(!e.merge_value(&json!({"id": "n1", "ts": 3, "name": "z"})).unwrap());
        assert_eq!(e.value("name").unwrap(), Some(json!("a")));
    }

    #[test]
    fn mismatched_ids_are_a_merge_error() {
        let mut e = discovered(json!({"id": "n1", "ts": 5}));
        let err = e.merge_value(&json!({"id": "n2", "ts": 9})).unwrap_err();
        assert!(matches!(err, ModelError::Merge(MergeError::IdMismatch { .. })));
        let err = e.merge_value(&json!({"ts": 9})).unwrap_err();
        assert_eq!(err, ModelError::Merge(MergeError::MissingId));
    }

    #[test]
    fn merge_is_idempotent() {
        let a = discovered(json!({"id": "n1", "ts": 5, "name": "a", "location": {"lat": 1}}));
        let mut b = a.clone();
        assert!(!b.merge(&a).unwrap());
        assert_eq!(b.to_value(), a.to_value());
    }

    #[test]
    fn merge_is_associative_for_increasing_updates() {
        let a = discovered(json!({"id": "n1", "ts": 1, "name": "a", "location": {"lat": 1}}));
        let b = discovered(json!({"id": "n1", "ts": 2, "location": {"lon": 2}, "urn": "u"}));
        let c = discovered(json!({"id": "n1", "ts": 3, "name": "c", "location": {"lat": 3}}));

        let mut left = a.clone();
        left.merge(&b).unwrap();
        left.merge(&c).unwrap();

        let mut bc = b.clone();
        bc.merge(&c).unwrap();
        let mut right = a.clone();
        right.merge(&bc).unwrap();

        assert_eq!(left.to_value(), right.to_value());
    }

    #[test]
    fn clone_new_drops_identity() {
        let mut e = discovered(json!({"id": "n1", "ts": 5, "selfRef": "http://s/nodes/n1", "name": "a"}));
        e.set("name", "b").unwrap();
        let copy = e.clone_new().unwrap();
        assert_ne!(copy.id(), "n1");
        assert_eq!(copy.self_ref(), None);
        assert_eq!(copy.state(), EntityState::Unregistered);
        assert!(!copy.has_locks());
        assert_eq!(copy.value("name").unwrap(), Some(json!("b")));
    }

    #[test]
    fn flush_response_unlocks_and_advances_ts() {
        let mut e = discovered(json!({"id": "n1", "ts": 5, "selfRef": "http://s/nodes/n1", "name": "a"}));
        e.set("name", "b").unwrap();
        e.commit().unwrap();
        assert_eq!(e.state(), EntityState::PendingUpdate);
        let sent = e.to_value();
        let still_pending = e.mark_flushed(
            &json!({"id": "n1", "ts": 10, "selfRef": "http://s/nodes/n1", "name": "b"}),
            &sent,
        );
        assert!(!still_pending);
        assert_eq!(e.ts(), 10);
        assert!(e.locked().is_empty());
        assert_eq!(e.state(), EntityState::Registered);
    }

    #[test]
    fn write_during_flight_survives_the_response() {
        let mut e = discovered(json!({"id": "n1", "ts": 5, "selfRef": "http://s/nodes/n1", "name": "a", "urn": "u0"}));
        e.set("name", "b").unwrap();
        e.set("urn", "u1").unwrap();
        e.commit().unwrap();
        let sent = e.to_value();
        e.set("name", "c").unwrap();
        e.commit().unwrap();

        let still_pending = e.mark_flushed(
            &json!({"id": "n1", "ts": 10, "selfRef": "http://s/nodes/n1", "name": "b", "urn": "u1"}),
            &sent,
        );
        assert!(still_pending);
        assert_eq!(e.value("name").unwrap(), Some(json!("c")));
        assert_eq!(e.locked().iter().collect::<Vec<_>>(), vec!["name"]);
        assert_eq!(e.state(), EntityState::PendingUpdate);
        assert_eq!(e.ts(), 10);
    }

    #[test]
    fn nested_write_during_flight_keeps_its_lock() {
        let mut e = discovered(json!({"id": "n1", "ts": 5, "selfRef": "http://s/nodes/n1", "location": {"city": "a", "zip": "1"}}));
        e.set_path(&["location", "city"], "b").unwrap();
        e.commit().unwrap();
        let sent = e.to_value();
        e.set_path(&["location", "zip"], "2").unwrap();

        assert!(e.mark_flushed(&sent, &sent));
        assert_eq!(e.value_at(&["location", "zip"]).unwrap(), Some(json!("2")));
        assert_eq!(e.value_at(&["location", "city"]).unwrap(), Some(json!("b")));
    }

    #[test]
    fn create_rejected_returns_to_unregistered() {
        let mut e = Entity::new(node_class());
        e.commit().unwrap();
        assert_eq!(e.state(), EntityState::PendingCreate);
        e.mark_rejected();
        assert_eq!(e.state(), EntityState::Unregistered);
    }

    #[test]
    fn deleted_entities_refuse_access() {
        let mut e = discovered(json!({"id": "n1", "ts": 5, "name": "a"}));
        e.mark_deleted();
        assert!(matches!(e.get("name"), Err(ModelError::RemovedEntity { .. })));
        assert!(matches!(e.set("name", "x"), Err(ModelError::RemovedEntity { .. })));
        assert!(matches!(e.commit(), Err(ModelError::RemovedEntity { .. })));
    }

    #[test]
    fn validation_runs_over_serialized_form() {
        let mut e = Entity::new(node_class());
        assert!(e.validate().is_ok());
        e.set("name", 42).unwrap();
        assert!(matches!(e.validate(), Err(ModelError::Validation(_))));
    }
}
