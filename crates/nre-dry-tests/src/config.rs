// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! In-memory config store fake for testing without filesystem I/O.

use nre_app_core::config::{ConfigError, ConfigStore};
use nre_app_core::RuntimeSettings;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// In-memory implementation of [`ConfigStore`] for testing.
///
/// Clones share state, so a test can hand one copy to a `ConfigService` and
/// inspect the other. Call counts are tracked for verification.
///
/// # Example
///
/// ```
/// use nre_dry_tests::InMemoryConfigStore;
/// use nre_app_core::config::ConfigService;
/// use nre_app_core::RuntimeSettings;
///
/// let store = InMemoryConfigStore::new();
/// let service = ConfigService::new(store.clone());
///
/// let settings: RuntimeSettings = service.load_or_init("nre").unwrap();
/// assert_eq!(settings.proxy.threads, 10);
/// assert_eq!(store.save_count(), 1);
/// ```
#[derive(Clone, Default)]
pub struct InMemoryConfigStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    data: HashMap<String, Vec<u8>>,
    load_count: usize,
    save_count: usize,
    fail_on_load: bool,
    fail_on_save: bool,
}

impl InMemoryConfigStore {
    /// Create a new empty in-memory config store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `settings` under `key`.
    pub fn with_settings(key: &str, settings: &RuntimeSettings) -> Result<Self, ConfigError> {
        let store = Self::new();
        store
            .inner
            .lock()
            .data
            .insert(key.to_string(), serde_json::to_vec(settings)?);
        Ok(store)
    }

    /// Configure the store to fail on load operations.
    pub fn set_fail_on_load(&self, fail: bool) {
        self.inner.lock().fail_on_load = fail;
    }

    /// Configure the store to fail on save operations.
    pub fn set_fail_on_save(&self, fail: bool) {
        self.inner.lock().fail_on_save = fail;
    }

    /// Attempted `load_raw` calls, failures included.
    pub fn load_count(&self) -> usize {
        self.inner.lock().load_count
    }

    /// Attempted `save_raw` calls, failures included.
    pub fn save_count(&self) -> usize {
        self.inner.lock().save_count
    }

    /// Check if a key exists in the store.
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.lock().data.contains_key(key)
    }
}

impl ConfigStore for InMemoryConfigStore {
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
        let mut inner = self.inner.lock();
        inner.load_count += 1;
        if inner.fail_on_load {
            return Err(ConfigError::Other("simulated load failure".into()));
        }
        inner
            .data
            .get(key)
            .cloned()
            .ok_or_else(|| ConfigError::NotFound(key.to_string()))
    }

    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
        let mut inner = self.inner.lock();
        inner.save_count += 1;
        if inner.fail_on_save {
            return Err(ConfigError::Other("simulated save failure".into()));
        }
        inner.data.insert(key.to_string(), data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use nre_app_core::config::ConfigService;
    use nre_app_core::StoreSettings;

    #[test]
    fn seeded_settings_load_without_init() {
        let mut settings = RuntimeSettings::default();
        settings.unis.push(StoreSettings::new("http://s:8888"));
        let store = InMemoryConfigStore::with_settings("nre", &settings).unwrap();
        let service = ConfigService::new(store.clone());
        let loaded: RuntimeSettings = service.load_or_init("nre").unwrap();
        assert_eq!(loaded, settings);
        assert_eq!(store.save_count(), 0);
        assert_eq!(store.load_count(), 1);
    }

    #[test]
    fn failures_are_counted_and_surface() {
        let store = InMemoryConfigStore::new();
        store.set_fail_on_save(true);
        let service = ConfigService::new(store.clone());
        assert!(service.load_or_init::<RuntimeSettings>("nre").is_err());
        assert_eq!(store.save_count(), 1);
        assert!(!store.contains_key("nre"));

        store.set_fail_on_save(false);
        store.set_fail_on_load(true);
        assert!(matches!(
            store.load_raw("nre"),
            Err(ConfigError::Other(_))
        ));
    }

    #[test]
    fn malformed_document_names_its_key() {
        let store = InMemoryConfigStore::new();
        store.save_raw("nre", b"{\"proxy\": [").unwrap();
        let service = ConfigService::new(store);
        let err = service.load::<RuntimeSettings>("nre").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { ref key, .. } if key == "nre"));
    }
}
