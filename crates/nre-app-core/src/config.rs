// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Settings persistence: a blob-store port and the JSON service over it.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Where settings documents live. Keys are logical names (`"nre"`), not paths.
pub trait ConfigStore {
    /// Raw bytes stored under `key`, or [`ConfigError::NotFound`].
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError>;
    /// Replace the bytes stored under `key`.
    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError>;
}

/// Failure loading, decoding or checking settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Nothing stored under the key.
    #[error("no settings stored under `{0}`")]
    NotFound(String),
    /// Backing storage failed.
    #[error("settings io: {0}")]
    Io(#[from] std::io::Error),
    /// A document did not decode.
    #[error("settings json: {0}")]
    Json(#[from] serde_json::Error),
    /// The document under `key` did not decode.
    #[error("settings `{key}` are malformed: {source}")]
    Parse {
        /// Store key.
        key: String,
        /// Decoder error.
        source: serde_json::Error,
    },
    /// A value decoded but breaks a settings constraint.
    #[error("invalid setting `{key}`: {reason}")]
    Invalid {
        /// Dotted settings key, e.g. `proxy.threads`.
        key: String,
        /// Human readable reason.
        reason: String,
    },
    /// Store-specific failure.
    #[error("{0}")]
    Other(String),
}

/// JSON codec in front of a [`ConfigStore`].
pub struct ConfigService<S> {
    store: S,
}

impl<S: ConfigStore> ConfigService<S> {
    /// Wrap `store`.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Decode the document under `key`; `None` when absent or empty.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        let bytes = match self.store.load_raw(key) {
            Ok(bytes) if bytes.is_empty() => return Ok(None),
            Ok(bytes) => bytes,
            Err(ConfigError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| ConfigError::Parse {
                key: key.to_string(),
                source,
            })
    }

    /// Decode `key`, first writing `T::default()` there when nothing is
    /// stored, so a fresh install leaves an editable document behind.
    pub fn load_or_init<T>(&self, key: &str) -> Result<T, ConfigError>
    where
        T: DeserializeOwned + Serialize + Default,
    {
        match self.load(key)? {
            Some(value) => Ok(value),
            None => {
                let value = T::default();
                self.save(key, &value)?;
                Ok(value)
            }
        }
    }

    /// Encode `value` (pretty-printed) under `key`.
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<(), ConfigError> {
        self.store.save_raw(key, &serde_json::to_vec_pretty(value)?)
    }
}
