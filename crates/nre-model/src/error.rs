// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
use nre_schema::ValidationError;
use thiserror::Error;

/// Why an incoming record could not be merged. The incoming record loses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    /// Both sides carry ids and they differ.
    #[error("cannot merge record {incoming} into {local}")]
    IdMismatch {
        /// Id of the local row.
        local: String,
        /// Id of the incoming record.
        incoming: String,
    },
    /// The incoming record has no identifier.
    #[error("incoming record has no id")]
    MissingId,
    /// The incoming document is not an object.
    #[error("incoming record is not an object")]
    NotAnObject,
}

/// Errors raised by the resource model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    /// The entity was deleted; every field access fails.
    #[error("entity {id} has been removed")]
    RemovedEntity {
        /// Id of the deleted entity (may be empty for unregistered rows).
        id: String,
    },
    /// `id`, `ts`, `selfRef`, `$schema` and `:type` cannot be assigned.
    #[error("field `{0}` is reserved")]
    ReservedField(String),
    /// Merge rejected.
    #[error(transparent)]
    Merge(#[from] MergeError),
    /// Schema validation failed.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// A path step crossed a non-object value.
    #[error("`{0}` is not an object")]
    NotAnObject(String),
}
