// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
use std::fmt;

use thiserror::Error;

/// Failure while fetching, parsing, or compiling a schema.
///
/// All variants are fatal for the class being constructed.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// HTTP transport failure or non-success status.
    #[error("failed to fetch schema {url}: {reason}")]
    Fetch {
        /// Schema URL.
        url: String,
        /// Transport or status description.
        reason: String,
    },
    /// Archive file could not be read.
    #[error("schema archive io error: {0}")]
    Io(#[from] std::io::Error),
    /// Document is not valid JSON.
    #[error("schema {url} is not valid json: {source}")]
    Parse {
        /// Schema URL.
        url: String,
        /// Underlying parse failure.
        source: serde_json::Error,
    },
    /// A `$ref` (or `allOf` parent) could not be resolved.
    #[error("unresolvable $ref `{reference}` in {within}")]
    UnresolvedRef {
        /// The reference as written (absolutized).
        reference: String,
        /// The schema containing it.
        within: String,
    },
    /// The document violates the subset of JSON Schema we compile.
    #[error("malformed schema {url}: {reason}")]
    Malformed {
        /// Schema URL.
        url: String,
        /// What was wrong.
        reason: String,
    },
}

/// One violated constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// JSON pointer into the instance (`""` for the root).
    pub path: String,
    /// Human readable message.
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "<root>: {}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// A document failed its schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{schema}: {}", summarize(.violations))]
pub struct ValidationError {
    /// Schema URI the instance was checked against.
    pub schema: String,
    /// Every violation found, in traversal order.
    pub violations: Vec<Violation>,
}

fn summarize(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
