// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Store clients: REST + WebSocket transport for one store, the
//! process-scoped client table, and the federation proxy that routes
//! operations across stores.

mod error;
mod federation;
mod registry;
mod remote;

pub use error::ClientError;
pub use federation::{merge_fan_in, Federation, Page, StoreCallback, StoreEvent, StoreId};
pub use registry::ClientRegistry;
pub use remote::{Callback, ClientConfig, RemoteClient};
