// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
use nre_app_core::config::ConfigError;
use nre_client::ClientError;
use nre_model::ModelError;
use nre_schema::SchemaError;
use thiserror::Error;

/// Errors surfaced by the object layer.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Settings failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A schema could not be fetched or compiled.
    #[error(transparent)]
    Schema(#[from] SchemaError),
    /// Field access on a removed record, reserved field writes, merge and
    /// validation failures.
    #[error(transparent)]
    Model(#[from] ModelError),
    /// Store transport and status errors.
    #[error(transparent)]
    Client(#[from] ClientError),
    /// An href or record targets an unknown collection.
    #[error("unknown reference `{0}`")]
    Reference(String),
    /// The record is already owned by another runtime.
    #[error("record {id} belongs to another runtime")]
    WrongRuntime {
        /// Record id.
        id: String,
    },
    /// A worker pool job panicked or was cancelled.
    #[error("worker job failed: {0}")]
    Worker(String),
    /// The runtime has been shut down.
    #[error("runtime is shut down")]
    Shutdown,
}

impl RuntimeError {
    /// `true` when the error reports access to a deleted record.
    pub fn is_removed(&self) -> bool {
        matches!(self, Self::Model(ModelError::RemovedEntity { .. }))
    }

    pub(crate) fn removed(id: &str) -> Self {
        Self::Model(ModelError::RemovedEntity { id: id.to_string() })
    }
}
