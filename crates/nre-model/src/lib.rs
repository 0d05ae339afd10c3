// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Typed resource model.
//!
//! One generic [`Entity`] value type covers every collection; its field set
//! and validator come from a [`nre_schema::SchemaClass`] selected by the
//! record's `$schema` tag. Field values form a [`Resource`] tree
//! (`Primitive`, `List`, `Local`) that supports per-object locked-field
//! tracking and the diff-merge used to fold server state into local copies.

mod entity;
mod error;
mod link;
mod resource;

pub use entity::{Entity, EntityState, RESERVED_FIELDS};
pub use error::{MergeError, ModelError};
pub use link::{authority_of, Href, Link};
pub use resource::{Local, Resource};

/// Microseconds since the Unix epoch, the store timestamp unit.
pub type Micros = i64;
