// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
use nre_model::ModelError;
use nre_runtime::RuntimeError;
use thiserror::Error;

use crate::junos::ConfigParseError;

/// Errors raised while resolving hops or writing fused paths.
#[derive(Debug, Error)]
pub enum PathError {
    /// Router configuration could not be parsed.
    #[error(transparent)]
    Config(#[from] ConfigParseError),
    /// Runtime operation failed.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    /// Record construction failed.
    #[error(transparent)]
    Model(#[from] ModelError),
    /// A collection fusion writes to was not discovered.
    #[error("collection `{0}` is not available")]
    MissingCollection(String),
}
