// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Typed runtime settings.
//!
//! Every key has a default so a partial document (or none at all) yields a
//! usable configuration. The layout mirrors the on-disk JSON:
//!
//! ```json
//! {
//!   "unis": [{"url": "http://localhost:8888", "default": true}],
//!   "runtime": {"services": ["scheduler"]},
//!   "cache": {"preload": ["nodes", "ports"]},
//!   "proxy": {"threads": 10, "batch": 1000, "subscribe": true, "defer_update": true},
//!   "measurements": {"read_history": true, "subscribe": true}
//! }
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Root settings document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Connected stores.
    pub unis: Vec<StoreSettings>,
    /// Service instantiation.
    pub runtime: RuntimeSection,
    /// Collection cache behavior.
    pub cache: CacheSettings,
    /// Federation proxy and transport behavior.
    pub proxy: ProxySettings,
    /// Data stream behavior.
    pub measurements: MeasurementSettings,
    /// Schema resolution.
    pub schema: SchemaSettings,
}

/// One remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Base URL, e.g. `http://unis.example.net:8888`.
    pub url: String,
    /// Newly created records without an origin are routed here.
    pub default: bool,
    /// Verify TLS certificates.
    pub verify: bool,
    /// Extra CA certificate (PEM) trusted for this store.
    pub cert: Option<PathBuf>,
    /// Disabled stores are skipped at startup.
    pub enabled: bool,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            default: false,
            verify: true,
            cert: None,
            enabled: true,
        }
    }
}

impl StoreSettings {
    /// Convenience constructor for an enabled, verifying store.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// `runtime.*` keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeSection {
    /// Service names to instantiate at startup.
    pub services: Vec<String>,
}

/// `cache.*` keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Collections fully pulled at startup.
    pub preload: Vec<String>,
    /// Records per paged fetch.
    pub page_size: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            preload: Vec::new(),
            page_size: 100,
        }
    }
}

/// Wire encoding used for request bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CodecChoice {
    /// `application/perfsonar+json`
    #[default]
    Json,
    /// `application/perfsonar+bson`
    Bson,
}

/// `proxy.*` keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Worker pool size for CPU-bound work.
    pub threads: usize,
    /// Maximum records per flush POST.
    pub batch: usize,
    /// Open subscriptions for loaded collections.
    pub subscribe: bool,
    /// Defer commits until an explicit flush.
    pub defer_update: bool,
    /// Total per-request timeout.
    pub timeout_secs: u64,
    /// How long shutdown waits for in-flight requests.
    pub shutdown_grace_secs: u64,
    /// Request body encoding.
    pub codec: CodecChoice,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            threads: 10,
            batch: 1000,
            subscribe: true,
            defer_update: true,
            timeout_secs: 10,
            shutdown_grace_secs: 5,
            codec: CodecChoice::Json,
        }
    }
}

/// `measurements.*` keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementSettings {
    /// Start data cursors at 0 (full history) instead of now.
    pub read_history: bool,
    /// Keep folds current through subscriptions.
    pub subscribe: bool,
    /// Buffered points before an outbound data POST.
    pub batch_size: usize,
    /// Oldest buffered point age (seconds) before an outbound data POST.
    pub batch_until: u64,
}

impl Default for MeasurementSettings {
    fn default() -> Self {
        Self {
            read_history: true,
            subscribe: true,
            batch_size: 100,
            batch_until: 10,
        }
    }
}

/// `schema.*` keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SchemaSettings {
    /// Directory consulted before HTTP when fetching schemas.
    pub archive: Option<PathBuf>,
}

impl RuntimeSettings {
    /// Parse a JSON settings document.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ConfigError> {
        let settings: Self = serde_json::from_slice(bytes)?;
        settings.validate()?;
        Ok(settings)
    }

    /// The store new records are routed to when they have no origin.
    ///
    /// Falls back to the first enabled store when none is flagged.
    pub fn default_store(&self) -> Option<&StoreSettings> {
        let mut enabled = self.unis.iter().filter(|s| s.enabled);
        let first = enabled.clone().next();
        enabled.find(|s| s.default).or(first)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proxy.threads == 0 {
            return Err(invalid("proxy.threads", "must be at least 1"));
        }
        if self.proxy.batch == 0 {
            return Err(invalid("proxy.batch", "must be at least 1"));
        }
        if self.cache.page_size == 0 {
            return Err(invalid("cache.page_size", "must be at least 1"));
        }
        if self.unis.iter().filter(|s| s.enabled && s.default).count() > 1 {
            return Err(invalid("unis", "more than one store is flagged default"));
        }
        if let Some(store) = self.unis.iter().find(|s| s.url.trim().is_empty()) {
            return Err(invalid("unis.url", &format!("empty url in {store:?}")));
        }
        Ok(())
    }
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_document_yields_defaults() {
        let settings = RuntimeSettings::from_json(b"{}").unwrap();
        assert_eq!(settings, RuntimeSettings::default());
        assert_eq!(settings.proxy.threads, 10);
        assert_eq!(settings.proxy.batch, 1000);
        assert!(settings.proxy.subscribe);
        assert!(settings.proxy.defer_update);
        assert_eq!(settings.cache.page_size, 100);
    }

    #[test]
    fn partial_store_entry_fills_defaults() {
        let settings =
            RuntimeSettings::from_json(br#"{"unis": [{"url": "http://a:8888"}]}"#).unwrap();
        let store = &settings.unis[0];
        assert!(store.enabled);
        assert!(store.verify);
        assert!(!store.default);
    }

    #[test]
    fn default_store_prefers_flag_then_first_enabled() {
        let mut settings = RuntimeSettings {
            unis: vec![
                StoreSettings {
                    enabled: false,
                    ..StoreSettings::new("http://off:1")
                },
                StoreSettings::new("http://a:1"),
                StoreSettings::new("http://b:1"),
            ],
            ..RuntimeSettings::default()
        };
        assert_eq!(settings.default_store().unwrap().url, "http://a:1");
        settings.unis[2].default = true;
        assert_eq!(settings.default_store().unwrap().url, "http://b:1");
    }

    #[test]
    fn two_defaults_are_rejected() {
        let doc = br#"{"unis": [{"url": "http://a:1", "default": true}, {"url": "http://b:1", "default": true}]}"#;
        let err = RuntimeSettings::from_json(doc).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "unis"));
    }

    #[test]
    fn zero_threads_is_rejected() {
        let err = RuntimeSettings::from_json(br#"{"proxy": {"threads": 0}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "proxy.threads"));
    }

    #[test]
    fn codec_parses_lowercase() {
        let settings = RuntimeSettings::from_json(br#"{"proxy": {"codec": "bson"}}"#).unwrap();
        assert_eq!(settings.proxy.codec, CodecChoice::Bson);
    }
}
