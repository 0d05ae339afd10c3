// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! One store: REST calls plus a multiplexed subscription socket.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use nre_app_core::{CodecChoice, ProxySettings};
use nre_proto::{Codec, Envelope, Query, SubscribeRequest, DATA_COLLECTION, SUBSCRIBE_PATH};
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Method;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::error::ClientError;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Receives every envelope pushed on a subscribed channel.
pub type Callback = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Per-client transport settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    /// Total timeout of one REST request.
    pub timeout: Duration,
    /// How long `close` waits for in-flight requests.
    pub shutdown_grace: Duration,
    /// Body encoding.
    pub codec: Codec,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
            codec: Codec::Json,
        }
    }
}

impl From<&ProxySettings> for ClientConfig {
    fn from(proxy: &ProxySettings) -> Self {
        Self {
            timeout: Duration::from_secs(proxy.timeout_secs),
            shutdown_grace: Duration::from_secs(proxy.shutdown_grace_secs),
            codec: match proxy.codec {
                CodecChoice::Json => Codec::Json,
                CodecChoice::Bson => Codec::Bson,
            },
        }
    }
}

struct Shared {
    channels: Mutex<BTreeMap<String, Vec<Callback>>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<SubscribeRequest>>>,
    socket: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    in_flight: AtomicUsize,
    idle: Notify,
}

struct InFlight<'a>(&'a Shared);

impl<'a> InFlight<'a> {
    fn enter(shared: &'a Shared) -> Self {
        shared.in_flight.fetch_add(1, Ordering::AcqRel);
        Self(shared)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Client for one store.
///
/// REST calls share the process HTTP session; at most one WebSocket is open
/// per store and it carries every subscribed channel. The socket reconnects
/// with exponential backoff (1s doubling to 30s) and replays its channel
/// list after each reconnect.
pub struct RemoteClient {
    base: Url,
    authority: String,
    http: reqwest::Client,
    config: ClientConfig,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteClient")
            .field("base", &self.base.as_str())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RemoteClient {
    /// Client for the store rooted at `base`.
    pub fn new(base: &str, http: reqwest::Client, config: ClientConfig) -> Result<Self, ClientError> {
        let mut base = Url::parse(base).map_err(|_| ClientError::Reference(base.to_string()))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let authority = nre_model::authority_of(&base)
            .ok_or_else(|| ClientError::Reference(base.to_string()))?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            base,
            authority,
            http,
            config,
            shared: Arc::new(Shared {
                channels: Mutex::new(BTreeMap::new()),
                outbound: Mutex::new(None),
                socket: Mutex::new(None),
                shutdown,
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        })
    }

    /// Base URL (always ends in `/`).
    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Normalized `host:port`, the store identifier.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Transport settings.
    pub fn config(&self) -> ClientConfig {
        self.config
    }

    /// `true` once [`RemoteClient::close`] has started.
    pub fn is_closed(&self) -> bool {
        *self.shared.shutdown.borrow()
    }

    /// Resolve a store-relative path or an absolute href.
    pub fn url_for(&self, path: &str) -> Result<Url, ClientError> {
        let parsed = if path.contains("://") {
            Url::parse(path)
        } else {
            self.base.join(path.trim_start_matches('/'))
        };
        parsed.map_err(|_| ClientError::Reference(path.to_string()))
    }

    /// `GET path?query`
    pub async fn get(&self, path: &str, query: &Query) -> Result<Value, ClientError> {
        self.request(Method::GET, path, query, None).await
    }

    /// `POST path` with a record or an array of records.
    pub async fn post(&self, path: &str, payload: &Value) -> Result<Value, ClientError> {
        self.request(Method::POST, path, &Query::new(), Some(payload))
            .await
    }

    /// `PUT path`
    pub async fn put(&self, path: &str, payload: &Value) -> Result<Value, ClientError> {
        self.request(Method::PUT, path, &Query::new(), Some(payload))
            .await
    }

    /// `DELETE path`
    pub async fn delete(&self, path: &str) -> Result<Value, ClientError> {
        self.request(Method::DELETE, path, &Query::new(), None).await
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &Query,
        body: Option<&Value>,
    ) -> Result<Value, ClientError> {
        if self.is_closed() {
            return Err(ClientError::Shutdown);
        }
        let _guard = InFlight::enter(&self.shared);
        let url = self.url_for(path)?;
        let codec = self.config.codec;
        let mut request = self
            .http
            .request(method.clone(), url.clone())
            .timeout(self.config.timeout)
            .header(ACCEPT, codec.content_type());
        if !query.is_empty() {
            request = request.query(query.pairs());
        }
        if let Some(body) = body {
            request = request
                .header(CONTENT_TYPE, codec.content_type())
                .body(codec.encode(body)?);
        }
        debug!(%method, %url, "store request");
        let response = request
            .send()
            .await
            .map_err(|err| ClientError::connection(url.as_str(), &err))?;
        let status = response.status();
        let codec = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map_or(codec, Codec::from_content_type);
        let bytes = response
            .bytes()
            .await
            .map_err(|err| ClientError::connection(url.as_str(), &err))?;
        if status.is_success() {
            Ok(codec.decode(&bytes)?)
        } else if status.is_client_error() {
            Err(ClientError::BadRequest {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            })
        } else {
            Err(ClientError::Remote {
                status: status.as_u16(),
            })
        }
    }

    /// Register `callback` for `channel` (a collection name, or
    /// `data/<metadata-id>`), opening the store socket on first use.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe(&self, channel: &str, callback: Callback) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Shutdown);
        }
        let first = {
            let mut channels = self.shared.channels.lock();
            let entry = channels.entry(channel.to_string()).or_default();
            entry.push(callback);
            entry.len() == 1
        };
        self.ensure_socket()?;
        if first {
            if let Some(tx) = self.shared.outbound.lock().as_ref() {
                let _ = tx.send(SubscribeRequest::all(channel));
            }
        }
        Ok(())
    }

    /// Channels with at least one callback.
    pub fn channels(&self) -> Vec<String> {
        self.shared.channels.lock().keys().cloned().collect()
    }

    fn ensure_socket(&self) -> Result<(), ClientError> {
        let mut socket = self.shared.socket.lock();
        if socket.is_some() {
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|err| {
            ClientError::Connection {
                url: self.base.to_string(),
                reason: err.to_string(),
                timeout: false,
            }
        })?;
        let url = self.socket_url()?;
        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.outbound.lock() = Some(tx);
        let shared = Arc::clone(&self.shared);
        let shutdown = self.shared.shutdown.subscribe();
        let codec = self.config.codec;
        *socket = Some(runtime.spawn(run_socket(url, shared, rx, shutdown, codec)));
        Ok(())
    }

    fn socket_url(&self) -> Result<Url, ClientError> {
        let mut url = self.url_for(SUBSCRIBE_PATH)?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|()| ClientError::Reference(url.to_string()))?;
        Ok(url)
    }

    /// Stop accepting requests, wait up to the grace period for in-flight
    /// requests, then close the socket. Idempotent.
    #[instrument(skip(self), fields(store = %self.authority))]
    pub async fn close(&self) {
        if self.shared.shutdown.send_replace(true) {
            return;
        }
        let deadline = Instant::now() + self.config.shutdown_grace;
        loop {
            let idle = self.shared.idle.notified();
            let pending = self.shared.in_flight.load(Ordering::Acquire);
            if pending == 0 {
                break;
            }
            if time::timeout_at(deadline, idle).await.is_err() {
                warn!(pending, "grace period elapsed with requests in flight");
                break;
            }
        }
        let handle = self.shared.socket.lock().take();
        if let Some(mut handle) = handle {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if time::timeout(remaining.max(Duration::from_millis(100)), &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }
        info!("store client closed");
    }
}

fn dispatch(shared: &Shared, envelope: Envelope) {
    let mut targets: Vec<Callback> = Vec::new();
    {
        let channels = shared.channels.lock();
        if let Some(cbs) = channels.get(&envelope.headers.collection) {
            targets.extend(cbs.iter().cloned());
        }
        // Time-series points arrive on `data` and carry their metadata id.
        if envelope.headers.collection == DATA_COLLECTION {
            if let Some(mid) = envelope.data.get("mid").and_then(Value::as_str) {
                if let Some(cbs) = channels.get(&format!("{DATA_COLLECTION}/{mid}")) {
                    targets.extend(cbs.iter().cloned());
                }
            }
        }
    }
    if targets.is_empty() {
        debug!(channel = %envelope.headers.collection, "message for unsubscribed channel");
    }
    for callback in targets {
        callback(envelope.clone());
    }
}

fn decode_message(message: Message, codec: Codec) -> Option<Envelope> {
    let value = match message {
        Message::Text(text) => serde_json::from_str::<Value>(&text).ok()?,
        Message::Binary(bytes) => codec.decode(&bytes).ok()?,
        _ => return None,
    };
    serde_json::from_value(value).ok()
}

#[instrument(skip_all, fields(url = %url))]
async fn run_socket(
    url: Url,
    shared: Arc<Shared>,
    mut outbound: mpsc::UnboundedReceiver<SubscribeRequest>,
    mut shutdown: watch::Receiver<bool>,
    codec: Codec,
) {
    let mut delay = INITIAL_BACKOFF;
    loop {
        if *shutdown.borrow() {
            break;
        }
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((socket, _)) => {
                info!("subscription socket connected");
                delay = INITIAL_BACKOFF;
                let (mut tx, mut rx) = socket.split();

                while outbound.try_recv().is_ok() {}
                let replay: Vec<String> = shared.channels.lock().keys().cloned().collect();
                let mut healthy = true;
                for channel in replay {
                    if !send_request(&mut tx, &SubscribeRequest::all(channel)).await {
                        healthy = false;
                        break;
                    }
                }

                while healthy {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            let _ = tx.send(Message::Close(None)).await;
                            info!("subscription socket closed");
                            return;
                        }
                        Some(request) = outbound.recv() => {
                            healthy = send_request(&mut tx, &request).await;
                        }
                        message = rx.next() => match message {
                            Some(Ok(Message::Close(_))) | None => healthy = false,
                            Some(Ok(message)) => {
                                if let Some(envelope) = decode_message(message, codec) {
                                    dispatch(&shared, envelope);
                                }
                            }
                            Some(Err(err)) => {
                                warn!(%err, "subscription socket error");
                                healthy = false;
                            }
                        }
                    }
                }
                warn!("subscription socket dropped");
            }
            Err(err) => warn!(%err, "subscription connect failed"),
        }
        if *shutdown.borrow() {
            break;
        }
        info!(delay_ms = delay.as_millis() as u64, "reconnecting subscription socket");
        tokio::select! {
            () = time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
        delay = (delay * 2).min(MAX_BACKOFF);
    }
}

async fn send_request<S>(tx: &mut S, request: &SubscribeRequest) -> bool
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = match serde_json::to_string(request) {
        Ok(text) => text,
        Err(err) => {
            warn!(%err, "cannot encode subscription request");
            return true;
        }
    };
    match tx.send(Message::Text(text)).await {
        Ok(()) => {
            debug!(channel = %request.resource_type, "subscription requested");
            true
        }
        Err(err) => {
            warn!(%err, "subscription request failed");
            false
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn client(base: &str) -> RemoteClient {
        RemoteClient::new(base, reqwest::Client::new(), ClientConfig::default()).unwrap()
    }

    #[test]
    fn paths_resolve_against_base() {
        let c = client("http://Store:8888/api");
        assert_eq!(c.authority(), "store:8888");
        assert_eq!(
            c.url_for("nodes").unwrap().as_str(),
            "http://store:8888/api/nodes"
        );
        assert_eq!(
            c.url_for("/nodes/n1").unwrap().as_str(),
            "http://store:8888/api/nodes/n1"
        );
        assert_eq!(
            c.url_for("http://other/ports/p1").unwrap().as_str(),
            "http://other/ports/p1"
        );
    }

    #[test]
    fn socket_url_switches_scheme() {
        assert_eq!(
            client("https://s").socket_url().unwrap().as_str(),
            "wss://s/subscribe"
        );
        assert_eq!(
            client("http://s:9000").socket_url().unwrap().as_str(),
            "ws://s:9000/subscribe"
        );
    }

    #[test]
    fn data_points_reach_per_metadata_channels() {
        let c = client("http://s");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        c.shared.channels.lock().insert(
            "data/m1".into(),
            vec![Arc::new(move |env: Envelope| sink.lock().push(env))],
        );
        dispatch(
            &c.shared,
            Envelope::upsert("data", serde_json::json!({"mid": "m1", "data": []})),
        );
        dispatch(
            &c.shared,
            Envelope::upsert("data", serde_json::json!({"mid": "m2", "data": []})),
        );
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn closed_clients_refuse_requests() {
        let c = client("http://127.0.0.1:9");
        c.close().await;
        c.close().await;
        assert!(matches!(
            c.get("nodes", &Query::new()).await,
            Err(ClientError::Shutdown)
        ));
        assert!(matches!(
            c.subscribe("nodes", Arc::new(|_| {})),
            Err(ClientError::Shutdown)
        ));
    }
}
