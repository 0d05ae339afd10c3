// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Collection event bus types.

use std::fmt;
use std::sync::Arc;

use crate::handle::EntityHandle;

/// What happened to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// A row was added to the collection.
    New,
    /// A row changed (local write or merged server state).
    Update,
    /// A row was removed.
    Delete,
    /// A row was committed for flushing.
    Commit,
    /// A row is about to be POSTed.
    PreFlush,
    /// A row's flush response was applied.
    PostFlush,
}

/// One dispatched event.
#[derive(Clone)]
pub struct Event {
    /// Event kind.
    pub kind: EventKind,
    /// Collection name.
    pub collection: String,
    /// The affected record.
    pub entity: EntityHandle,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.kind)
            .field("collection", &self.collection)
            .field("id", &self.entity.id())
            .finish()
    }
}

/// Event callback. Errors are logged and skipped by the dispatcher.
pub type Listener = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Token returned by listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);
