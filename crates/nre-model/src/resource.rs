// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Field value tree with locked-field tracking and diff-merge.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use crate::error::ModelError;

/// A field value.
///
/// Composite values (`List`, `Local`) merge recursively; primitives are
/// overwritten.
#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
    /// Scalar (`null`, boolean, number, string).
    Primitive(Value),
    /// Ordered sequence.
    List(Vec<Resource>),
    /// Sub-object without an identifier.
    Local(Local),
}

impl Resource {
    /// Serialize back to JSON.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Primitive(v) => v.clone(),
            Self::List(items) => Value::Array(items.iter().map(Self::to_value).collect()),
            Self::Local(local) => Value::Object(local.to_map()),
        }
    }

    /// `true` for `List` and `Local`.
    pub fn is_composite(&self) -> bool {
        !matches!(self, Self::Primitive(_))
    }

    /// Borrow as a sub-object.
    pub fn as_local(&self) -> Option<&Local> {
        match self {
            Self::Local(local) => Some(local),
            _ => None,
        }
    }

    /// Borrow as a list.
    pub fn as_list(&self) -> Option<&[Resource]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Borrow a primitive string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Primitive(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Primitive as `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Primitive(v) => v.as_i64(),
            _ => None,
        }
    }

    /// Primitive as `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Primitive(v) => v.as_f64(),
            _ => None,
        }
    }

    /// Merge `incoming` into `self`: composites of the same shape recurse,
    /// anything else is replaced.
    pub fn merge(&mut self, incoming: &Resource) {
        match (self, incoming) {
            (Self::Local(a), Self::Local(b)) => a.merge(b),
            (Self::List(a), Self::List(b)) => merge_list(a, b),
            (slot, other) => *slot = other.clone(),
        }
    }

    /// Drop every lock in the subtree.
    pub fn unlock(&mut self) {
        match self {
            Self::Primitive(_) => {}
            Self::List(items) => items.iter_mut().for_each(Resource::unlock),
            Self::Local(local) => local.unlock(),
        }
    }
}

impl From<Value> for Resource {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => Self::Local(Local::from_map(map)),
            other => Self::Primitive(other),
        }
    }
}

/// Lists merge element-wise up to the shorter length; trailing elements of
/// `incoming` are appended.
fn merge_list(local: &mut Vec<Resource>, incoming: &[Resource]) {
    let shared = local.len().min(incoming.len());
    for (slot, other) in local.iter_mut().zip(incoming).take(shared) {
        slot.merge(other);
    }
    local.extend(incoming[shared..].iter().cloned());
}

/// A sub-object: named fields plus the set of locally locked field names.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Local {
    fields: BTreeMap<String, Resource>,
    locked: BTreeSet<String>,
}

impl Local {
    /// Empty object.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON object with nothing locked.
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self {
            fields: map.into_iter().map(|(k, v)| (k, Resource::from(v))).collect(),
            locked: BTreeSet::new(),
        }
    }

    /// Serialize to a JSON object.
    pub fn to_map(&self) -> Map<String, Value> {
        self.fields
            .iter()
            .map(|(k, v)| (k.clone(), v.to_value()))
            .collect()
    }

    /// Read one field.
    pub fn get(&self, name: &str) -> Option<&Resource> {
        self.fields.get(name)
    }

    /// Mutable access without locking. Callers that change the value must
    /// lock the field themselves.
    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut Resource> {
        self.fields.get_mut(name)
    }

    /// `true` when the field exists.
    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Field names in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Field pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Resource)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// `true` when there are no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Assign and lock a field.
    pub fn set(&mut self, name: &str, value: Resource) {
        self.fields.insert(name.to_string(), value);
        self.locked.insert(name.to_string());
    }

    /// Assign without locking (server state, defaults).
    pub(crate) fn put(&mut self, name: &str, value: Resource) {
        self.fields.insert(name.to_string(), value);
    }

    /// Remove a field (and its lock).
    pub(crate) fn remove(&mut self, name: &str) -> Option<Resource> {
        self.locked.remove(name);
        self.fields.remove(name)
    }

    /// Assign at a nested path, creating intermediate objects, and lock the
    /// leaf in its innermost object.
    pub fn set_path(&mut self, path: &[&str], value: Resource) -> Result<(), ModelError> {
        match path {
            [] => Ok(()),
            [leaf] => {
                self.set(leaf, value);
                Ok(())
            }
            [head, rest @ ..] => {
                let slot = self
                    .fields
                    .entry((*head).to_string())
                    .or_insert_with(|| Resource::Local(Local::new()));
                match slot {
                    Resource::Local(inner) => inner.set_path(rest, value),
                    _ => Err(ModelError::NotAnObject((*head).to_string())),
                }
            }
        }
    }

    /// Locked field names at this level.
    pub fn locked(&self) -> &BTreeSet<String> {
        &self.locked
    }

    /// `true` when `name` is locked at this level.
    pub fn is_locked(&self, name: &str) -> bool {
        self.locked.contains(name)
    }

    /// `true` when anything in the subtree is locked.
    pub fn has_locks(&self) -> bool {
        !self.locked.is_empty()
            || self.fields.values().any(|v| match v {
                Resource::Local(l) => l.has_locks(),
                Resource::List(items) => items.iter().any(|i| match i {
                    Resource::Local(l) => l.has_locks(),
                    _ => false,
                }),
                Resource::Primitive(_) => false,
            })
    }

    /// Clear every lock in the subtree.
    pub fn unlock(&mut self) {
        self.locked.clear();
        self.fields.values_mut().for_each(Resource::unlock);
    }

    /// Release the locks a store has acknowledged.
    ///
    /// `sent` is the body that was posted. A locked field whose value still
    /// equals what was sent is unlocked with its subtree; fields written
    /// after the body was captured stay locked. Returns `true` when any lock
    /// remains.
    pub fn settle(&mut self, sent: &Map<String, Value>) -> bool {
        for (name, value) in &mut self.fields {
            let acknowledged = sent.get(name);
            if self.locked.contains(name) {
                if acknowledged == Some(&value.to_value()) {
                    self.locked.remove(name);
                    value.unlock();
                }
                continue;
            }
            match (value, acknowledged) {
                (Resource::Local(inner), Some(Value::Object(sent))) => {
                    inner.settle(sent);
                }
                (value, Some(sent)) if *sent == value.to_value() => value.unlock(),
                _ => {}
            }
        }
        self.has_locks()
    }

    /// Fold `incoming` into `self`, skipping locked fields.
    ///
    /// For each field of `incoming` not locked here: composites of the same
    /// shape recurse, anything else overwrites.
    pub fn merge(&mut self, incoming: &Local) {
        for (name, value) in &incoming.fields {
            if self.locked.contains(name) {
                continue;
            }
            match self.fields.get_mut(name) {
                Some(existing) => existing.merge(value),
                None => {
                    self.fields.insert(name.clone(), value.clone());
                }
            }
        }
    }

    /// Every `href` string in the subtree (the targets of link fields).
    pub fn hrefs(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_hrefs(self, &mut out);
        out
    }

    /// Rewrite every `href` equal to `from` into `to`. Returns the number of
    /// rewritten links. Rewrites do not lock.
    pub fn rewrite_href(&mut self, from: &str, to: &str) -> usize {
        let mut count = 0;
        if let Some(Resource::Primitive(Value::String(href))) = self.fields.get_mut("href") {
            if href == from {
                *href = to.to_string();
                count += 1;
            }
        }
        for value in self.fields.values_mut() {
            count += rewrite_in(value, from, to);
        }
        count
    }
}

fn collect_hrefs(local: &Local, out: &mut Vec<String>) {
    if let Some(href) = local.get("href").and_then(Resource::as_str) {
        out.push(href.to_string());
    }
    for value in local.fields.values() {
        match value {
            Resource::Local(inner) => collect_hrefs(inner, out),
            Resource::List(items) => {
                for item in items {
                    if let Resource::Local(inner) = item {
                        collect_hrefs(inner, out);
                    }
                }
            }
            Resource::Primitive(_) => {}
        }
    }
}

fn rewrite_in(value: &mut Resource, from: &str, to: &str) -> usize {
    match value {
        Resource::Local(inner) => inner.rewrite_href(from, to),
        Resource::List(items) => items.iter_mut().map(|i| rewrite_in(i, from, to)).sum(),
        Resource::Primitive(_) => 0,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn local(v: Value) -> Local {
        match Resource::from(v) {
            Resource::Local(l) => l,
            other => panic!("not an object: {other:?}"),
        }
    }

    #[test]
    fn merge_overwrites_unlocked_and_keeps_locked() {
        let mut a = local(json!({"name": "a", "urn": "old"}));
        a.set("name", Resource::from(json!("b")));
        let b = local(json!({"name": "c", "urn": "u", "extra": 1}));
        a.merge(&b);
        assert_eq!(
            Value::Object(a.to_map()),
            json!({"name": "b", "urn": "u", "extra": 1})
        );
    }

    #[test]
    fn nested_locks_survive_recursive_merge() {
        let mut a = local(json!({"location": {"lat": 1.0, "lon": 2.0}}));
        a.set_path(&["location", "lat"], Resource::from(json!(9.0)))
            .unwrap();
        assert!(!a.is_locked("location"));
        assert!(a.has_locks());
        a.merge(&local(json!({"location": {"lat": 5.0, "lon": 6.0}})));
        assert_eq!(
            Value::Object(a.to_map()),
            json!({"location": {"lat": 9.0, "lon": 6.0}})
        );
    }

    #[test]
    fn lists_merge_elementwise_then_append() {
        let mut a = local(json!({"xs": [{"k": 1, "keep": true}, 2]}));
        a.merge(&local(json!({"xs": [{"k": 10}, 20, 30]})));
        assert_eq!(
            Value::Object(a.to_map()),
            json!({"xs": [{"k": 10, "keep": true}, 20, 30]})
        );
    }

    #[test]
    fn shorter_incoming_list_keeps_tail() {
        let mut a = local(json!({"xs": [1, 2, 3]}));
        a.merge(&local(json!({"xs": [9]})));
        assert_eq!(Value::Object(a.to_map()), json!({"xs": [9, 2, 3]}));
    }

    #[test]
    fn shape_change_replaces_value() {
        let mut a = local(json!({"v": {"a": 1}}));
        a.merge(&local(json!({"v": [1]})));
        assert_eq!(Value::Object(a.to_map()), json!({"v": [1]}));
    }

    #[test]
    fn set_path_through_primitive_fails() {
        let mut a = local(json!({"v": 3}));
        assert_eq!(
            a.set_path(&["v", "x"], Resource::from(json!(1))),
            Err(ModelError::NotAnObject("v".into()))
        );
    }

    #[test]
    fn hrefs_are_collected_and_rewritten() {
        let mut a = local(json!({
            "node": {"href": "nodes/n1", "rel": "full"},
            "ports": [{"href": "ports/p1"}, {"href": "ports/p2"}]
        }));
        let mut hrefs = a.hrefs();
        hrefs.sort();
        assert_eq!(hrefs, vec!["nodes/n1", "ports/p1", "ports/p2"]);
        assert_eq!(a.rewrite_href("ports/p2", "http://s/ports/p2"), 1);
        assert!(a.hrefs().contains(&"http://s/ports/p2".to_string()));
        assert!(!a.has_locks(), "rewrites do not lock");
    }
}
