// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared application services for the network runtime (config port, settings).
//! Keeps daemon/runtime adapters thin and storage-agnostic.

pub mod config;
pub mod settings;

pub use settings::{
    CacheSettings, CodecChoice, MeasurementSettings, ProxySettings, RuntimeSection,
    RuntimeSettings, SchemaSettings, StoreSettings,
};
