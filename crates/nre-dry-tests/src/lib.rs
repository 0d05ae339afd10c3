// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared test doubles and fixtures for the network runtime crates.
#![forbid(unsafe_code)]
//!
//! # Modules
//!
//! - [`config`] - In-memory config store fake for testing without filesystem
//! - [`fixtures`] - Schema documents and record builders for the core collections
//! - [`store`] - Mock store speaking the REST + subscription wire protocol

pub mod config;
pub mod fixtures;
pub mod store;

// Re-export commonly used items at crate root for convenience
pub use config::InMemoryConfigStore;
pub use fixtures::{link_to, CORE_COLLECTIONS};
pub use store::{MockStore, RecordedRequest};
