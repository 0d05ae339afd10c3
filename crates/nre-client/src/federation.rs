// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Routing across stores.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use nre_app_core::StoreSettings;
use nre_proto::{records, Envelope, Query};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::registry::ClientRegistry;
use crate::remote::RemoteClient;

/// Store identifier: normalized `host:port`.
pub type StoreId = String;

/// A pushed envelope tagged with the store that sent it.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    /// Sending store.
    pub store: StoreId,
    /// Pushed record.
    pub envelope: Envelope,
}

/// One fan-out read.
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Merged records tagged with the store that supplied them.
    pub records: Vec<(StoreId, Value)>,
    /// Most records returned by a single store.
    pub longest: usize,
}

/// Receives store-tagged subscription events.
pub type StoreCallback = Arc<dyn Fn(StoreEvent) + Send + Sync>;

/// Federation proxy over the configured stores.
///
/// * GET by absolute href goes to the store named by the href.
/// * GET by collection fans out to every store; results are kept in
///   arrival order and duplicate ids collapse to the newest copy.
/// * Writes go to the record's origin store, or the default store for
///   records that have none.
/// * Subscriptions fan out and every event carries its store.
#[derive(Debug)]
pub struct Federation {
    registry: Arc<ClientRegistry>,
    stores: RwLock<Vec<StoreId>>,
    default: RwLock<Option<StoreId>>,
}

impl Federation {
    /// Empty federation over `registry`.
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self {
            registry,
            stores: RwLock::new(Vec::new()),
            default: RwLock::new(None),
        }
    }

    /// The client registry.
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Connect a store. The first store, or one flagged `default`, becomes
    /// the default write target.
    pub fn add_store(&self, settings: &StoreSettings) -> Result<StoreId, ClientError> {
        let client = self.registry.connect(settings)?;
        let id = client.authority().to_string();
        {
            let mut stores = self.stores.write();
            if !stores.contains(&id) {
                stores.push(id.clone());
            }
        }
        let mut default = self.default.write();
        if settings.default || default.is_none() {
            *default = Some(id.clone());
        }
        Ok(id)
    }

    /// Connected stores in configuration order.
    pub fn stores(&self) -> Vec<StoreId> {
        self.stores.read().clone()
    }

    /// Default write target.
    pub fn default_store(&self) -> Option<StoreId> {
        self.default.read().clone()
    }

    /// Client for one store.
    pub fn client(&self, store: &str) -> Result<Arc<RemoteClient>, ClientError> {
        self.registry
            .get(store)
            .ok_or_else(|| ClientError::Reference(store.to_string()))
    }

    /// Store that owns an absolute href.
    pub fn store_for_href(&self, href: &str) -> Result<StoreId, ClientError> {
        self.registry
            .for_href(href)
            .map(|c| c.authority().to_string())
            .ok_or_else(|| ClientError::Reference(href.to_string()))
    }

    /// Write target for a record with the given origin.
    pub fn route(&self, origin: Option<&str>) -> Result<Arc<RemoteClient>, ClientError> {
        match origin {
            Some(store) => self.client(store),
            None => {
                let store = self
                    .default_store()
                    .ok_or_else(|| ClientError::Reference("<default store>".into()))?;
                self.client(&store)
            }
        }
    }

    /// GET one record by absolute href.
    pub async fn get_href(&self, href: &str) -> Result<(StoreId, Value), ClientError> {
        let client = self
            .registry
            .for_href(href)
            .ok_or_else(|| ClientError::Reference(href.to_string()))?;
        let body = client.get(href, &Query::new()).await?;
        Ok((client.authority().to_string(), body))
    }

    /// GET a collection from every store and merge the results.
    ///
    /// A failing store is logged and skipped; the call fails only when every
    /// store fails.
    pub async fn get_collection(
        &self,
        collection: &str,
        query: &Query,
    ) -> Result<Vec<(StoreId, Value)>, ClientError> {
        Ok(self.get_page(collection, query).await?.records)
    }

    /// [`Federation::get_collection`], also reporting the longest answer any
    /// single store gave so callers can detect the last page.
    pub async fn get_page(&self, collection: &str, query: &Query) -> Result<Page, ClientError> {
        let clients: Vec<_> = self
            .stores()
            .iter()
            .filter_map(|s| self.registry.get(s))
            .collect();
        let mut pending: FuturesUnordered<_> = clients
            .iter()
            .map(|client| async move {
                (
                    client.authority().to_string(),
                    client.get(collection, query).await,
                )
            })
            .collect();

        let mut arrivals = Vec::new();
        let mut first_error = None;
        let mut answered = 0usize;
        let mut longest = 0usize;
        while let Some((store, result)) = pending.next().await {
            match result {
                Ok(body) => {
                    answered += 1;
                    let rows = records(body);
                    longest = longest.max(rows.len());
                    arrivals.extend(rows.into_iter().map(|r| (store.clone(), r)));
                }
                Err(err) => {
                    warn!(%store, collection, %err, "store fan-out failed");
                    first_error.get_or_insert(err);
                }
            }
        }
        if answered == 0 {
            if let Some(err) = first_error {
                return Err(err);
            }
        }
        let records = merge_fan_in(arrivals);
        debug!(collection, records = records.len(), "fan-in merged");
        Ok(Page { records, longest })
    }

    /// POST to `path` on the write target for `origin`.
    pub async fn post(
        &self,
        origin: Option<&str>,
        path: &str,
        payload: &Value,
    ) -> Result<(StoreId, Value), ClientError> {
        let client = self.route(origin)?;
        let body = client.post(path, payload).await?;
        Ok((client.authority().to_string(), body))
    }

    /// PUT to `path` on the write target for `origin`.
    pub async fn put(
        &self,
        origin: Option<&str>,
        path: &str,
        payload: &Value,
    ) -> Result<Value, ClientError> {
        self.route(origin)?.put(path, payload).await
    }

    /// DELETE `path` on the write target for `origin`.
    pub async fn delete(&self, origin: Option<&str>, path: &str) -> Result<Value, ClientError> {
        self.route(origin)?.delete(path).await
    }

    /// Subscribe `callback` to `channel` on every store.
    pub fn subscribe(&self, channel: &str, callback: StoreCallback) -> Result<(), ClientError> {
        for store in self.stores() {
            let client = self.client(&store)?;
            let callback = Arc::clone(&callback);
            let tag = store.clone();
            client.subscribe(
                channel,
                Arc::new(move |envelope| {
                    callback(StoreEvent {
                        store: tag.clone(),
                        envelope,
                    });
                }),
            )?;
        }
        Ok(())
    }

    /// Close every store client.
    pub async fn close(&self) {
        self.registry.close_all().await;
    }
}

fn record_ts(record: &Value) -> i64 {
    record.get("ts").and_then(Value::as_i64).unwrap_or(i64::MIN)
}

/// Collapse duplicate ids, keeping the higher-timestamp copy at the
/// position where the id first arrived. Records without an id pass through.
pub fn merge_fan_in(arrivals: Vec<(StoreId, Value)>) -> Vec<(StoreId, Value)> {
    let mut merged: Vec<(StoreId, Value)> = Vec::with_capacity(arrivals.len());
    let mut seen: HashMap<String, usize> = HashMap::new();
    for (store, record) in arrivals {
        let Some(id) = record.get("id").and_then(Value::as_str).map(str::to_string) else {
            merged.push((store, record));
            continue;
        };
        match seen.get(&id) {
            Some(&slot) => {
                if record_ts(&record) > record_ts(&merged[slot].1) {
                    merged[slot] = (store, record);
                }
            }
            None => {
                seen.insert(id, merged.len());
                merged.push((store, record));
            }
        }
    }
    merged
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::remote::ClientConfig;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn newest_duplicate_wins_in_first_position() {
        let merged = merge_fan_in(vec![
            ("a:1".into(), json!({"id": "n1", "ts": 3})),
            ("a:1".into(), json!({"id": "n2", "ts": 1})),
            ("b:1".into(), json!({"id": "n1", "ts": 5})),
            ("b:1".into(), json!({"id": "n2", "ts": 1})),
        ]);
        assert_eq!(
            merged,
            vec![
                ("b:1".to_string(), json!({"id": "n1", "ts": 5})),
                ("a:1".to_string(), json!({"id": "n2", "ts": 1})),
            ]
        );
    }

    #[test]
    fn routing_prefers_origin_then_default() {
        let fed = Federation::new(Arc::new(
            ClientRegistry::new(ClientConfig::default()).unwrap(),
        ));
        assert!(matches!(fed.route(None), Err(ClientError::Reference(_))));
        fed.add_store(&StoreSettings::new("http://one:1")).unwrap();
        let mut second = StoreSettings::new("http://two:2");
        second.default = true;
        fed.add_store(&second).unwrap();
        assert_eq!(fed.default_store().as_deref(), Some("two:2"));
        assert_eq!(fed.route(None).unwrap().authority(), "two:2");
        assert_eq!(fed.route(Some("one:1")).unwrap().authority(), "one:1");
        assert!(fed.route(Some("three:3")).is_err());
        assert_eq!(fed.store_for_href("http://one:1/nodes/x").unwrap(), "one:1");
    }
}
