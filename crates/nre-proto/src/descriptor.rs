// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Service descriptor served at `GET /`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One raw descriptor entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorEntry {
    /// Absolute URL of the collection or link.
    pub href: String,
    /// `"collection"` or `"link"`.
    pub rel: String,
    /// `{items: {href}}` or `{items: {oneOf: [{href}, ..]}}`.
    #[serde(default, rename = "targetschema")]
    pub target_schema: Value,
}

/// A collection advertised by a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionLink {
    /// Collection name (last path segment of `href`).
    pub name: String,
    /// Absolute collection URL.
    pub href: String,
    /// Item schema URIs; more than one when the collection is polymorphic.
    pub schemas: Vec<String>,
}

impl DescriptorEntry {
    /// Item schema URIs named by `targetschema.items`.
    pub fn item_schemas(&self) -> Vec<String> {
        let Some(items) = self.target_schema.get("items") else {
            return Vec::new();
        };
        if let Some(href) = items.get("href").and_then(Value::as_str) {
            return vec![href.to_string()];
        }
        items
            .get("oneOf")
            .and_then(Value::as_array)
            .map(|branches| {
                branches
                    .iter()
                    .filter_map(|b| b.get("href").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Extract the collection links from a descriptor body. Entries that are not
/// `rel: "collection"` or fail to parse are skipped.
pub fn parse_descriptor(body: &Value) -> Vec<CollectionLink> {
    let Some(entries) = body.as_array() else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|raw| serde_json::from_value::<DescriptorEntry>(raw.clone()).ok())
        .filter(|entry| entry.rel == "collection")
        .filter_map(|entry| {
            let name = entry
                .href
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .filter(|s| !s.is_empty())?
                .to_string();
            Some(CollectionLink {
                schemas: entry.item_schemas(),
                href: entry.href,
                name,
            })
        })
        .collect()
}
