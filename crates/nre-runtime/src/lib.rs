// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Object layer for the network runtime.
//!
//! - [`Runtime`]: discovers store collections, tracks pending writes, and
//!   flushes them in dependency order.
//! - [`UnisCollection`]: the live cache of one collection, with sorted
//!   secondary indices, predicate queries, paging, subscriptions, and an
//!   event bus.
//! - [`EntityHandle`]: weak reference handed out for cached records.
//! - [`DataStream`]: time-series folds over a metadata record's data.
//! - [`Service`]: event consumers dispatched in dependency order.
#![forbid(unsafe_code)]

mod collection;
mod data;
mod error;
mod event;
mod flush;
mod fold;
mod handle;
mod index;
mod pending;
mod pool;
mod predicate;
mod runtime;
mod service;

pub use collection::{CollectionContext, Cursor, FlushGuard, Matches, UnisCollection};
pub use data::DataStream;
pub use error::RuntimeError;
pub use event::{Event, EventKind, Listener, ListenerId};
pub use flush::{dependency_graph, dependency_order, PendingSummary};
pub use fold::{Custom, Fold, Jitter, Last, Max, Mean, Min, Point};
pub use handle::EntityHandle;
pub use index::{IndexKey, SortedIndex};
pub use pending::PendingSet;
pub use pool::WorkerPool;
pub use predicate::{Cmp, Predicate};
pub use runtime::{FlushReport, Runtime};
pub use service::{Service, ServiceRegistry};
