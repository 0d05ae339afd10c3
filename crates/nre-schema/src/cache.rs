// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Process-scoped schema cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info};

use crate::class::SchemaClass;
use crate::error::SchemaError;
use crate::{canonical_uri, resolve_uri, split_fragment};

/// File name used for `url` inside a schema archive directory.
///
/// Every character outside `[A-Za-z0-9._-]` becomes `_`, so
/// `http://unis/schema/node#` maps to `http___unis_schema_node.json`.
pub fn archive_file_name(url: &str) -> String {
    let mut name: String = canonical_uri(url)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    name.push_str(".json");
    name
}

/// Fetches, stores, and compiles schemas.
///
/// Documents are looked up in memory, then in the archive directory, then
/// over HTTP; each is stored under both the fetch URL and its declared
/// `$id`/`id`. Classes are memoized by canonical URI.
pub struct SchemaCache {
    http: reqwest::Client,
    archive: Option<PathBuf>,
    documents: RwLock<HashMap<String, Arc<Value>>>,
    classes: RwLock<HashMap<String, Arc<SchemaClass>>>,
}

impl std::fmt::Debug for SchemaCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaCache")
            .field("archive", &self.archive)
            .field("documents", &self.documents.read().len())
            .field("classes", &self.classes.read().len())
            .finish_non_exhaustive()
    }
}

impl Default for SchemaCache {
    /// An archive-less cache with its own HTTP client.
    fn default() -> Self {
        Self::new(reqwest::Client::new(), None)
    }
}

impl SchemaCache {
    /// Create a cache sharing `http` with the rest of the process.
    pub fn new(http: reqwest::Client, archive: Option<PathBuf>) -> Self {
        Self {
            http,
            archive,
            documents: RwLock::new(HashMap::new()),
            classes: RwLock::new(HashMap::new()),
        }
    }

    /// Seed a document directly (no I/O). Returns the stored handle.
    pub fn insert(&self, url: &str, schema: Value) -> Arc<Value> {
        let schema = Arc::new(schema);
        self.store(url, &schema);
        schema
    }

    /// Number of distinct keys in the document table.
    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    /// `true` when nothing has been cached yet.
    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }

    /// Return the parsed schema at `url`, loading it if needed.
    pub async fn cache(&self, url: &str) -> Result<Arc<Value>, SchemaError> {
        let key = canonical_uri(split_fragment(url).0).to_string();
        if let Some(doc) = self.documents.read().get(&key) {
            return Ok(Arc::clone(doc));
        }
        let doc = match self.archive.as_deref().map(|dir| read_archive(dir, &key)) {
            Some(Ok(Some(doc))) => {
                debug!(url = %key, "schema loaded from archive");
                doc
            }
            Some(Err(err)) => return Err(err),
            Some(Ok(None)) | None => self.fetch(&key).await?,
        };
        let doc = Arc::new(doc);
        self.store(&key, &doc);
        Ok(doc)
    }

    /// Return the runtime class for `url`, building it (and every `allOf`
    /// ancestor) on first use.
    pub async fn get_class(&self, url: &str) -> Result<Arc<SchemaClass>, SchemaError> {
        let key = canonical_uri(url).to_string();
        if let Some(class) = self.classes.read().get(&key) {
            return Ok(Arc::clone(class));
        }
        self.load_closure(&key).await?;

        let documents = self.documents.read().clone();
        let mut built = self.classes.read().clone();
        let class = SchemaClass::build(&key, &documents, &mut built, &mut Vec::new())?;
        info!(uri = %class.uri(), fields = class.fields().len(), "schema class built");
        self.classes.write().extend(built);
        Ok(class)
    }

    /// Build a class from documents already seeded with [`SchemaCache::insert`]
    /// or loaded earlier. Performs no I/O; a missing `$ref` target is an error.
    pub fn build_seeded(&self, url: &str) -> Result<Arc<SchemaClass>, SchemaError> {
        let key = canonical_uri(url).to_string();
        if let Some(class) = self.classes.read().get(&key) {
            return Ok(Arc::clone(class));
        }
        let documents = self.documents.read().clone();
        let mut built = self.classes.read().clone();
        let class = SchemaClass::build(&key, &documents, &mut built, &mut Vec::new())?;
        self.classes.write().extend(built);
        Ok(class)
    }

    /// Class lookup without I/O.
    pub fn class(&self, url: &str) -> Option<Arc<SchemaClass>> {
        self.classes.read().get(canonical_uri(url)).cloned()
    }

    /// Every class built so far.
    pub fn classes(&self) -> Vec<Arc<SchemaClass>> {
        self.classes.read().values().cloned().collect()
    }

    /// Load every document reachable from `root` through `$ref`.
    async fn load_closure(&self, root: &str) -> Result<(), SchemaError> {
        let mut queue = vec![root.to_string()];
        let mut seen = std::collections::HashSet::new();
        while let Some(url) = queue.pop() {
            if !seen.insert(url.clone()) {
                continue;
            }
            let doc = self.cache(&url).await.map_err(|err| match err {
                SchemaError::Fetch { .. } if url != root => SchemaError::UnresolvedRef {
                    reference: url.clone(),
                    within: root.to_string(),
                },
                other => other,
            })?;
            let base = declared_id(&doc).unwrap_or_else(|| url.clone());
            let mut refs = Vec::new();
            collect_refs(&doc, &mut refs);
            for reference in refs {
                let absolute = resolve_uri(&base, &reference);
                let target = canonical_uri(split_fragment(&absolute).0).to_string();
                if !target.is_empty() && !seen.contains(&target) {
                    queue.push(target);
                }
            }
        }
        Ok(())
    }

    async fn fetch(&self, url: &str) -> Result<Value, SchemaError> {
        let fetch_err = |reason: String| SchemaError::Fetch {
            url: url.to_string(),
            reason,
        };
        let response = self
            .http
            .get(url)
            .header(
                reqwest::header::ACCEPT,
                "application/schema+json, application/json",
            )
            .send()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;
        if !response.status().is_success() {
            return Err(fetch_err(format!("status {}", response.status())));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;
        info!(url, bytes = bytes.len(), "schema fetched");
        serde_json::from_slice(&bytes).map_err(|source| SchemaError::Parse {
            url: url.to_string(),
            source,
        })
    }

    fn store(&self, url: &str, doc: &Arc<Value>) {
        let mut documents = self.documents.write();
        documents.insert(canonical_uri(url).to_string(), Arc::clone(doc));
        if let Some(id) = declared_id(doc) {
            documents.insert(id, Arc::clone(doc));
        }
    }
}

fn declared_id(doc: &Value) -> Option<String> {
    doc.get("$id")
        .or_else(|| doc.get("id"))
        .and_then(Value::as_str)
        .filter(|id| id.contains("://"))
        .map(|id| canonical_uri(id).to_string())
}

fn read_archive(dir: &Path, url: &str) -> Result<Option<Value>, SchemaError> {
    let path = dir.join(archive_file_name(url));
    match std::fs::read(&path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| SchemaError::Parse {
                url: url.to_string(),
                source,
            }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(SchemaError::Io(err)),
    }
}

fn collect_refs(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if key == "$ref" {
                    if let Some(s) = child.as_str() {
                        out.push(s.to_string());
                    }
                } else {
                    collect_refs(child, out);
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|i| collect_refs(i, out)),
        _ => {}
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn archive_names_are_filesystem_safe() {
        assert_eq!(
            archive_file_name("http://unis/schema/node#"),
            "http___unis_schema_node.json"
        );
    }

    #[tokio::test]
    async fn archive_is_consulted_before_http() {
        let dir = tempfile::tempdir().unwrap();
        let parent = json!({
            "id": "http://nowhere.invalid/schema/base#",
            "properties": {"id": {"type": "string"}, "ts": {"type": "integer"}}
        });
        let child = json!({
            "id": "http://nowhere.invalid/schema/node#",
            "allOf": [{"$ref": "base#"}],
            "properties": {"name": {"type": "string"}}
        });
        std::fs::write(
            dir.path().join(archive_file_name("http://nowhere.invalid/schema/base")),
            parent.to_string(),
        )
        .unwrap();
        std::fs::write(
            dir.path().join(archive_file_name("http://nowhere.invalid/schema/node")),
            child.to_string(),
        )
        .unwrap();

        let cache = SchemaCache::new(reqwest::Client::new(), Some(dir.path().to_path_buf()));
        let class = cache
            .get_class("http://nowhere.invalid/schema/node#")
            .await
            .unwrap();
        assert_eq!(class.parents().len(), 1);
        assert!(class.field("ts").is_some());
        assert!(cache.class("http://nowhere.invalid/schema/base").is_some());
    }

    #[tokio::test]
    async fn seeded_documents_need_no_io() {
        let cache = SchemaCache::new(reqwest::Client::new(), None);
        cache.insert(
            "http://seed/schema/thing",
            json!({"id": "http://seed/schema/thing#", "properties": {"a": {"type": "integer"}}}),
        );
        let doc = cache.cache("http://seed/schema/thing#").await.unwrap();
        assert!(doc.get("properties").is_some());
        let class = cache.get_class("http://seed/schema/thing").await.unwrap();
        assert_eq!(class.field("a").unwrap().default, json!(0));
    }
}
