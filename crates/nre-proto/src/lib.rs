// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Wire schema for network resource stores.
//!
//! A store speaks REST for reads and writes and a single `/subscribe`
//! WebSocket for change notifications. Bodies are JSON or BSON documents
//! negotiated through the `application/perfsonar+*` content types.

pub mod codec;
pub mod descriptor;
pub mod envelope;
pub mod query;
pub mod time;

pub use codec::{records, Codec, CodecError};
pub use descriptor::{parse_descriptor, CollectionLink, DescriptorEntry};
pub use envelope::{Action, Envelope, Headers, SubscribeRequest};
pub use query::Query;
pub use time::{iso_to_micros, micros_to_iso, now_micros, STORE_TIME_FORMAT};

/// Collection that carries time-series points.
pub const DATA_COLLECTION: &str = "data";

/// Path of the multiplexed subscription socket.
pub const SUBSCRIBE_PATH: &str = "subscribe";
