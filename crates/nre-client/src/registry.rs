// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Process-scoped table of live store clients.

use std::collections::HashMap;
use std::sync::Arc;

use nre_app_core::StoreSettings;
use parking_lot::RwLock;
use tracing::info;

use crate::error::ClientError;
use crate::remote::{ClientConfig, RemoteClient};

/// One client per store, keyed by normalized `host:port`.
///
/// Created by the object layer and torn down by its shutdown; there is no
/// implicit global instance.
#[derive(Debug)]
pub struct ClientRegistry {
    http: reqwest::Client,
    config: ClientConfig,
    clients: RwLock<HashMap<String, Arc<RemoteClient>>>,
}

impl ClientRegistry {
    /// Registry with a fresh shared HTTP session.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| ClientError::connection("<session>", &err))?;
        Ok(Self::with_http(http, config))
    }

    /// Registry around an existing session.
    pub fn with_http(http: reqwest::Client, config: ClientConfig) -> Self {
        Self {
            http,
            config,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// The shared HTTP session.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Transport settings applied to new clients.
    pub fn config(&self) -> ClientConfig {
        self.config
    }

    /// Return the client for `store`, creating it on first use.
    pub fn connect(&self, store: &StoreSettings) -> Result<Arc<RemoteClient>, ClientError> {
        let http = self.session_for(store)?;
        let client = RemoteClient::new(&store.url, http, self.config)?;
        let mut clients = self.clients.write();
        if let Some(existing) = clients.get(client.authority()) {
            return Ok(Arc::clone(existing));
        }
        info!(store = %client.authority(), url = %store.url, "store client created");
        let client = Arc::new(client);
        clients.insert(client.authority().to_string(), Arc::clone(&client));
        Ok(client)
    }

    /// Client by `host:port`.
    pub fn get(&self, authority: &str) -> Option<Arc<RemoteClient>> {
        self.clients.read().get(authority).cloned()
    }

    /// Client owning an absolute href.
    pub fn for_href(&self, href: &str) -> Option<Arc<RemoteClient>> {
        let url = url::Url::parse(href).ok()?;
        self.get(&nre_model::authority_of(&url)?)
    }

    /// Every live client.
    pub fn clients(&self) -> Vec<Arc<RemoteClient>> {
        self.clients.read().values().cloned().collect()
    }

    /// Close and forget every client.
    pub async fn close_all(&self) {
        let clients: Vec<_> = self.clients.write().drain().map(|(_, c)| c).collect();
        for client in clients {
            client.close().await;
        }
    }

    fn session_for(&self, store: &StoreSettings) -> Result<reqwest::Client, ClientError> {
        if store.verify && store.cert.is_none() {
            return Ok(self.http.clone());
        }
        let mut builder = reqwest::Client::builder()
            .timeout(self.config.timeout)
            .danger_accept_invalid_certs(!store.verify);
        if let Some(path) = &store.cert {
            let pem = std::fs::read(path).map_err(|err| ClientError::Connection {
                url: store.url.clone(),
                reason: format!("reading {}: {err}", path.display()),
                timeout: false,
            })?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|err| ClientError::connection(&store.url, &err))?;
            builder = builder.add_root_certificate(cert);
        }
        builder
            .build()
            .map_err(|err| ClientError::connection(&store.url, &err))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn one_client_per_authority() {
        let registry = ClientRegistry::new(ClientConfig::default()).unwrap();
        let a = registry
            .connect(&StoreSettings::new("http://Store:8888"))
            .unwrap();
        let b = registry
            .connect(&StoreSettings::new("http://store:8888/"))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.clients().len(), 1);
        assert!(registry.for_href("http://store:8888/nodes/n1").is_some());
        assert!(registry.for_href("http://elsewhere/nodes/n1").is_none());
    }

    #[test]
    fn default_ports_are_normalized() {
        let registry = ClientRegistry::new(ClientConfig::default()).unwrap();
        registry.connect(&StoreSettings::new("http://s")).unwrap();
        assert!(registry.get("s:80").is_some());
    }
}
