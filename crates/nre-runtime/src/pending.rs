// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Records waiting for a flush.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use nre_model::Entity;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

pub(crate) type Row = Arc<RwLock<Entity>>;

/// One pending record.
#[derive(Debug, Clone)]
pub(crate) struct PendingRow {
    pub collection: String,
    pub id: String,
    pub row: Row,
}

/// Pending writes keyed by `(collection, id)`.
///
/// Holds weak references; a row dropped from its collection silently
/// leaves the set.
#[derive(Debug, Default)]
pub struct PendingSet {
    rows: Mutex<BTreeMap<(String, String), Weak<RwLock<Entity>>>>,
    changed: Notify,
}

impl PendingSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, collection: &str, id: &str, row: &Row) {
        self.rows
            .lock()
            .insert((collection.to_string(), id.to_string()), Arc::downgrade(row));
        self.changed.notify_one();
    }

    pub(crate) fn remove(&self, collection: &str, id: &str) {
        self.rows
            .lock()
            .remove(&(collection.to_string(), id.to_string()));
    }

    /// `true` when `(collection, id)` is waiting for a flush.
    pub fn contains(&self, collection: &str, id: &str) -> bool {
        self.rows
            .lock()
            .contains_key(&(collection.to_string(), id.to_string()))
    }

    /// Number of live pending rows.
    pub fn len(&self) -> usize {
        let mut rows = self.rows.lock();
        rows.retain(|_, w| w.strong_count() > 0);
        rows.len()
    }

    /// `true` when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live pending rows in `(collection, id)` order.
    pub(crate) fn snapshot(&self) -> Vec<PendingRow> {
        let mut rows = self.rows.lock();
        rows.retain(|_, w| w.strong_count() > 0);
        rows.iter()
            .filter_map(|((collection, id), weak)| {
                weak.upgrade().map(|row| PendingRow {
                    collection: collection.clone(),
                    id: id.clone(),
                    row,
                })
            })
            .collect()
    }

    /// Resolves after the next `add`.
    pub(crate) async fn changed(&self) {
        self.changed.notified().await;
    }
}
