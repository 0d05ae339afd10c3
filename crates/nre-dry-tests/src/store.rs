// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Mock network resource store.
//!
//! Serves the store wire protocol on an ephemeral localhost port:
//!
//! * `GET /` service descriptor
//! * `GET /schema/{name}` schema documents
//! * `GET|POST /{collection}`, `GET|PUT|DELETE /{collection}/{id}`
//! * `GET /data/{mid}` and `POST /data` time-series points
//! * `GET /subscribe` WebSocket that records `resourceType` requests and
//!   forwards everything passed to [`MockStore::publish`]
//!
//! Every request is recorded so tests can assert on bodies.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use nre_proto::{records, Codec, Envelope, SubscribeRequest};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::fixtures;

/// One request seen by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    /// HTTP method.
    pub method: String,
    /// Request path, e.g. `/nodes`.
    pub path: String,
    /// Decoded query parameters.
    pub query: HashMap<String, String>,
    /// Decoded body (`null` when empty).
    pub body: Value,
}

#[derive(Debug, Clone)]
enum Frame {
    Text(String),
    Close,
}

struct StoreState {
    base: String,
    descriptor: Mutex<Vec<(String, String)>>,
    schemas: Mutex<HashMap<String, Value>>,
    collections: Mutex<BTreeMap<String, Vec<Value>>>,
    data: Mutex<HashMap<String, Vec<Value>>>,
    requests: Mutex<Vec<RecordedRequest>>,
    subscriptions: Mutex<Vec<String>>,
    rejected: Mutex<HashSet<String>>,
    held: Mutex<Option<Arc<Semaphore>>>,
    clock: AtomicI64,
    feed: broadcast::Sender<Frame>,
}

impl StoreState {
    fn next_ts(&self) -> i64 {
        self.clock.fetch_add(1, Ordering::SeqCst)
    }

    fn self_ref(&self, collection: &str, id: &str) -> String {
        format!("{}/{collection}/{id}", self.base)
    }

    fn upsert(&self, collection: &str, mut record: Value, assign_ts: bool) -> Value {
        let id = match record.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => format!("{collection}-{}", self.clock.load(Ordering::SeqCst)),
        };
        if let Value::Object(map) = &mut record {
            map.insert("id".into(), json!(id));
            map.insert("selfRef".into(), json!(self.self_ref(collection, &id)));
            if assign_ts || !map.contains_key("ts") {
                map.insert("ts".into(), json!(self.next_ts()));
            }
        }
        let mut collections = self.collections.lock();
        let rows = collections.entry(collection.to_string()).or_default();
        match rows
            .iter_mut()
            .find(|r| r.get("id").and_then(Value::as_str) == Some(id.as_str()))
        {
            Some(slot) => *slot = record.clone(),
            None => rows.push(record.clone()),
        }
        record
    }
}

/// A running mock store. Dropping it stops the server.
pub struct MockStore {
    addr: SocketAddr,
    state: Arc<StoreState>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for MockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockStore")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

impl MockStore {
    /// Start an empty store on `127.0.0.1:0`. Assigned timestamps start at 1.
    pub async fn start() -> std::io::Result<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (feed, _) = broadcast::channel(256);
        let state = Arc::new(StoreState {
            base: format!("http://{addr}"),
            descriptor: Mutex::new(Vec::new()),
            schemas: Mutex::new(HashMap::new()),
            collections: Mutex::new(BTreeMap::new()),
            data: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            rejected: Mutex::new(HashSet::new()),
            held: Mutex::new(None),
            clock: AtomicI64::new(1),
            feed,
        });
        let app = Router::new()
            .route("/", get(descriptor))
            .route("/subscribe", get(subscribe))
            .route("/schema/{name}", get(schema))
            .route("/{collection}", get(list).post(create))
            .route("/{collection}/{id}", get(fetch).put(replace).delete(remove))
            .with_state(Arc::clone(&state));
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = stopped.await;
            });
            if let Err(err) = server.await {
                warn!(%err, "mock store stopped with error");
            }
        });
        Ok(Self {
            addr,
            state,
            stop: Some(stop),
            task,
        })
    }

    /// Start a store serving every schema and collection in
    /// [`fixtures::CORE_COLLECTIONS`].
    pub async fn standard() -> std::io::Result<Self> {
        let store = Self::start().await?;
        store.serve_schema("networkresource", fixtures::networkresource_schema());
        for (collection, name) in fixtures::CORE_COLLECTIONS {
            if let Some(doc) = fixtures::schema(name) {
                store.serve_schema(name, doc);
            }
            store.add_collection(collection, &store.schema_url(name));
        }
        Ok(store)
    }

    /// Base URL, e.g. `http://127.0.0.1:40123`.
    pub fn url(&self) -> &str {
        &self.state.base
    }

    /// `host:port`
    pub fn authority(&self) -> String {
        self.addr.to_string()
    }

    /// URL of a served schema.
    pub fn schema_url(&self, name: &str) -> String {
        format!("{}/schema/{name}", self.state.base)
    }

    /// Serve a schema document at `/schema/{name}`.
    pub fn serve_schema(&self, name: &str, doc: Value) {
        self.state.schemas.lock().insert(name.to_string(), doc);
    }

    /// Advertise `collection` with items of `schema_href` in the descriptor.
    pub fn add_collection(&self, collection: &str, schema_href: &str) {
        let mut descriptor = self.state.descriptor.lock();
        descriptor.retain(|(name, _)| name != collection);
        descriptor.push((collection.to_string(), schema_href.to_string()));
        self.state
            .collections
            .lock()
            .entry(collection.to_string())
            .or_default();
    }

    /// Next timestamp the store assigns on write.
    pub fn set_clock(&self, next_ts: i64) {
        self.state.clock.store(next_ts, Ordering::SeqCst);
    }

    /// Seed a record as-is (its `ts` is kept). Returns it with `selfRef`.
    pub fn insert(&self, collection: &str, record: Value) -> Value {
        self.state.upsert(collection, record, false)
    }

    /// Stored records of a collection.
    pub fn records(&self, collection: &str) -> Vec<Value> {
        self.state
            .collections
            .lock()
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Points POSTed or seeded for one metadata id.
    pub fn data_points(&self, mid: &str) -> Vec<Value> {
        self.state.data.lock().get(mid).cloned().unwrap_or_default()
    }

    /// Seed time-series points for `mid`.
    pub fn push_data(&self, mid: &str, points: Vec<Value>) {
        self.state
            .data
            .lock()
            .entry(mid.to_string())
            .or_default()
            .extend(points);
    }

    /// Answer every POST to `collection` with 400.
    pub fn reject_posts(&self, collection: &str) {
        self.state.rejected.lock().insert(collection.to_string());
    }

    /// Park every later POST after it is recorded and before it is applied,
    /// until [`MockStore::release_posts`].
    pub fn hold_posts(&self) {
        *self.state.held.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let held POSTs (and later ones) through.
    pub fn release_posts(&self) {
        if let Some(gate) = self.state.held.lock().take() {
            gate.close();
        }
    }

    /// Every recorded request.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().clone()
    }

    /// Recorded requests with `method` on `path`.
    pub fn requests_to(&self, method: &str, path: &str) -> Vec<RecordedRequest> {
        self.state
            .requests
            .lock()
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .cloned()
            .collect()
    }

    /// `resourceType` of every subscription request received, in order.
    pub fn subscriptions(&self) -> Vec<String> {
        self.state.subscriptions.lock().clone()
    }

    /// Wait until `channel` has been requested `times` times in total.
    pub async fn wait_for_subscription(&self, channel: &str, times: usize) -> bool {
        for _ in 0..500 {
            let seen = self
                .state
                .subscriptions
                .lock()
                .iter()
                .filter(|c| c.as_str() == channel)
                .count();
            if seen >= times {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Push a record to every connected subscriber.
    pub fn publish(&self, collection: &str, record: Value) {
        self.send(&Envelope::upsert(collection, record));
    }

    /// Push a delete notification to every connected subscriber.
    pub fn publish_delete(&self, collection: &str, record: Value) {
        self.send(&Envelope::delete(collection, record));
    }

    /// Close every open subscription socket (clients are expected to
    /// reconnect).
    pub fn drop_subscribers(&self) {
        let _ = self.state.feed.send(Frame::Close);
    }

    fn send(&self, envelope: &Envelope) {
        match serde_json::to_string(envelope) {
            Ok(text) => {
                let _ = self.state.feed.send(Frame::Text(text));
            }
            Err(err) => warn!(%err, "unencodable envelope"),
        }
    }

    /// Stop serving and wait for the server task.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = (&mut self.task).await;
    }
}

impl Drop for MockStore {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn record_request(
    state: &StoreState,
    method: &Method,
    path: String,
    query: &HashMap<String, String>,
    body: &Value,
) {
    state.requests.lock().push(RecordedRequest {
        method: method.to_string(),
        path,
        query: query.clone(),
        body: body.clone(),
    });
}

fn decode_body(headers: &HeaderMap, bytes: &Bytes) -> Result<Value, Response> {
    let codec = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map_or(Codec::Json, Codec::from_content_type);
    codec
        .decode(bytes)
        .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()).into_response())
}

fn reply(value: &Value) -> Response {
    (
        [(header::CONTENT_TYPE, Codec::Json.content_type())],
        value.to_string(),
    )
        .into_response()
}

async fn descriptor(State(state): State<Arc<StoreState>>) -> Response {
    let body: Vec<Value> = state
        .descriptor
        .lock()
        .iter()
        .map(|(name, schema)| {
            json!({
                "href": format!("{}/{name}", state.base),
                "rel": "collection",
                "targetschema": {"items": {"href": schema}}
            })
        })
        .collect();
    reply(&Value::Array(body))
}

async fn schema(State(state): State<Arc<StoreState>>, Path(name): Path<String>) -> Response {
    let name = name.trim_end_matches('#');
    match state.schemas.lock().get(name) {
        Some(doc) => reply(doc),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn ts_cursor(query: &HashMap<String, String>) -> Option<i64> {
    query.get("ts")?.strip_prefix("gt=")?.parse().ok()
}

async fn list(
    State(state): State<Arc<StoreState>>,
    Path(collection): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    record_request(&state, &Method::GET, format!("/{collection}"), &query, &Value::Null);
    let Some(mut rows) = state.collections.lock().get(&collection).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if let Some(cursor) = ts_cursor(&query) {
        rows.retain(|r| r.get("ts").and_then(Value::as_i64).unwrap_or(0) > cursor);
    }
    for (field, expected) in &query {
        if matches!(field.as_str(), "limit" | "skip" | "sort" | "ts") {
            continue;
        }
        rows.retain(|r| match r.get(field) {
            Some(Value::String(s)) => s == expected,
            Some(other) => other.to_string() == *expected,
            None => false,
        });
    }
    if query.get("sort").map(String::as_str) == Some("ts:1") {
        rows.sort_by_key(|r| r.get("ts").and_then(Value::as_i64).unwrap_or(0));
    }
    let skip = query.get("skip").and_then(|s| s.parse().ok()).unwrap_or(0);
    let limit = query
        .get("limit")
        .and_then(|s| s.parse().ok())
        .unwrap_or(usize::MAX);
    let page: Vec<Value> = rows.into_iter().skip(skip).take(limit).collect();
    reply(&Value::Array(page))
}

async fn create(
    State(state): State<Arc<StoreState>>,
    Path(collection): Path<String>,
    headers: HeaderMap,
    bytes: Bytes,
) -> Response {
    let body = match decode_body(&headers, &bytes) {
        Ok(body) => body,
        Err(rejection) => return rejection,
    };
    record_request(&state, &Method::POST, format!("/{collection}"), &HashMap::new(), &body);
    let gate = state.held.lock().clone();
    if let Some(gate) = gate {
        // Closed on release; acquiring never succeeds.
        let _ = gate.acquire().await;
    }
    if state.rejected.lock().contains(&collection) {
        return (StatusCode::BAD_REQUEST, "rejected by test").into_response();
    }
    if collection == nre_proto::DATA_COLLECTION {
        let mid = body.get("mid").and_then(Value::as_str).unwrap_or_default().to_string();
        let points = body.get("data").cloned().map(records).unwrap_or_default();
        state.data.lock().entry(mid).or_default().extend(points);
        return reply(&json!({}));
    }
    let single = body.is_object();
    let echoed: Vec<Value> = records(body)
        .into_iter()
        .map(|record| state.upsert(&collection, record, true))
        .collect();
    debug!(collection, count = echoed.len(), "mock store accepted records");
    if single {
        reply(&echoed.into_iter().next().unwrap_or(Value::Null))
    } else {
        reply(&Value::Array(echoed))
    }
}

async fn fetch(
    State(state): State<Arc<StoreState>>,
    Path((collection, id)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    record_request(&state, &Method::GET, format!("/{collection}/{id}"), &query, &Value::Null);
    if collection == nre_proto::DATA_COLLECTION {
        let mut points = state.data.lock().get(&id).cloned().unwrap_or_default();
        if let Some(cursor) = ts_cursor(&query) {
            points.retain(|p| p.get("ts").and_then(Value::as_i64).unwrap_or(0) > cursor);
        }
        points.sort_by_key(|p| p.get("ts").and_then(Value::as_i64).unwrap_or(0));
        return reply(&Value::Array(points));
    }
    let found = state.collections.lock().get(&collection).and_then(|rows| {
        rows.iter()
            .find(|r| r.get("id").and_then(Value::as_str) == Some(id.as_str()))
            .cloned()
    });
    match found {
        Some(record) => reply(&record),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn replace(
    State(state): State<Arc<StoreState>>,
    Path((collection, id)): Path<(String, String)>,
    headers: HeaderMap,
    bytes: Bytes,
) -> Response {
    let mut body = match decode_body(&headers, &bytes) {
        Ok(body) => body,
        Err(rejection) => return rejection,
    };
    record_request(&state, &Method::PUT, format!("/{collection}/{id}"), &HashMap::new(), &body);
    if let Value::Object(map) = &mut body {
        map.insert("id".into(), json!(id));
    }
    reply(&state.upsert(&collection, body, true))
}

async fn remove(
    State(state): State<Arc<StoreState>>,
    Path((collection, id)): Path<(String, String)>,
) -> Response {
    record_request(&state, &Method::DELETE, format!("/{collection}/{id}"), &HashMap::new(), &Value::Null);
    let mut collections = state.collections.lock();
    let Some(rows) = collections.get_mut(&collection) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let before = rows.len();
    rows.retain(|r| r.get("id").and_then(Value::as_str) != Some(id.as_str()));
    if rows.len() == before {
        return StatusCode::NOT_FOUND.into_response();
    }
    reply(&json!({}))
}

async fn subscribe(State(state): State<Arc<StoreState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(mut socket: WebSocket, state: Arc<StoreState>) {
    let mut feed = state.feed.subscribe();
    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    match serde_json::from_str::<SubscribeRequest>(text.as_str()) {
                        Ok(request) => state.subscriptions.lock().push(request.resource_type),
                        Err(err) => warn!(%err, "unparseable subscription request"),
                    }
                }
                Some(Ok(WsMessage::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            outgoing = feed.recv() => match outgoing {
                Ok(Frame::Text(text)) => {
                    if socket.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Ok(Frame::Close) => {
                    let _ = socket.send(WsMessage::Close(None)).await;
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn descriptor_lists_standard_collections() {
        let store = MockStore::standard().await.unwrap();
        let body: Value = reqwest::get(format!("{}/", store.url()))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body.as_array().unwrap().len(), fixtures::CORE_COLLECTIONS.len());
        store.shutdown().await;
    }

    #[tokio::test]
    async fn posts_are_echoed_with_identity() {
        let store = MockStore::standard().await.unwrap();
        store.set_clock(10);
        let echoed: Value = reqwest::Client::new()
            .post(format!("{}/nodes", store.url()))
            .header(header::CONTENT_TYPE.as_str(), "application/perfsonar+json")
            .body(json!([{"id": "n1", "name": "a"}]).to_string())
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(echoed[0]["ts"], 10);
        assert_eq!(echoed[0]["selfRef"], format!("{}/nodes/n1", store.url()));
        assert_eq!(store.requests_to("POST", "/nodes").len(), 1);
        assert_eq!(store.records("nodes").len(), 1);
    }
}
