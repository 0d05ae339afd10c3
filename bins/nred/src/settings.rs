// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Settings resolution: explicit file, else the config store, else defaults;
//! then command-line overrides.

use std::path::Path;

use anyhow::{Context, Result};
use nre_app_core::config::{ConfigService, ConfigStore};
use nre_app_core::{RuntimeSettings, StoreSettings};
use nre_config_fs::load_settings_file;
use tracing::info;

/// Config-store key holding the settings document.
pub const SETTINGS_KEY: &str = "nre";

/// Command-line values that replace configured ones.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// Replaces `unis` when non-empty; the first store is the default.
    pub stores: Vec<String>,
    /// Replaces `cache.preload` when non-empty.
    pub preload: Vec<String>,
    /// Appended to `runtime.services`.
    pub services: Vec<String>,
}

/// Resolve the settings document.
///
/// With `file` the document is read from it. Otherwise `store` is asked for
/// [`SETTINGS_KEY`]; an absent key is initialized with defaults.
pub fn resolve<S: ConfigStore>(
    file: Option<&Path>,
    store: S,
    overrides: &Overrides,
) -> Result<RuntimeSettings> {
    let mut settings = match file {
        Some(path) => load_settings_file(path)
            .with_context(|| format!("load settings from {}", path.display()))?,
        None => ConfigService::new(store)
            .load_or_init::<RuntimeSettings>(SETTINGS_KEY)
            .context("load settings from the config store")?,
    };
    apply(&mut settings, overrides);
    settings.validate().context("invalid settings")?;
    info!(
        stores = settings.unis.len(),
        services = ?settings.runtime.services,
        "settings resolved"
    );
    Ok(settings)
}

fn apply(settings: &mut RuntimeSettings, overrides: &Overrides) {
    if !overrides.stores.is_empty() {
        settings.unis = overrides
            .stores
            .iter()
            .enumerate()
            .map(|(i, url)| StoreSettings {
                default: i == 0,
                ..StoreSettings::new(url.as_str())
            })
            .collect();
    }
    if !overrides.preload.is_empty() {
        settings.cache.preload.clone_from(&overrides.preload);
    }
    for service in &overrides.services {
        if !settings.runtime.services.contains(service) {
            settings.runtime.services.push(service.clone());
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use nre_config_fs::FsConfigStore;
    use pretty_assertions::assert_eq;

    #[test]
    fn missing_store_key_is_initialized_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsConfigStore::at(dir.path()).unwrap();
        let settings = resolve(None, store, &Overrides::default()).unwrap();
        assert_eq!(settings, RuntimeSettings::default());
        assert!(dir.path().join("nre.json").exists());
    }

    #[test]
    fn explicit_file_wins_and_flags_override_it() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("settings.json");
        std::fs::write(
            &file,
            r#"{"unis": [{"url": "http://a:8888"}], "cache": {"preload": ["nodes"]}, "runtime": {"services": ["paths"]}}"#,
        )
        .unwrap();
        let store = FsConfigStore::at(dir.path().join("unused")).unwrap();
        let overrides = Overrides {
            stores: vec!["http://b:8888".into(), "http://c:8888".into()],
            preload: Vec::new(),
            services: vec!["scheduler".into(), "paths".into()],
        };
        let settings = resolve(Some(&file), store, &overrides).unwrap();
        let urls: Vec<(&str, bool)> = settings
            .unis
            .iter()
            .map(|s| (s.url.as_str(), s.default))
            .collect();
        assert_eq!(urls, vec![("http://b:8888", true), ("http://c:8888", false)]);
        assert_eq!(settings.cache.preload, vec!["nodes"]);
        assert_eq!(settings.runtime.services, vec!["paths", "scheduler"]);
        assert!(!dir.path().join("unused").join("nre.json").exists());
    }
}
