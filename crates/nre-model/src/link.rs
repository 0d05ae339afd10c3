// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Link fields and href parsing.

use serde_json::{json, Value};

/// `{"href": ..., "rel": ...}` reference to another record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// Absolute self-reference, or `collection/id` for an unregistered target.
    pub href: String,
    /// Relation, `"full"` by default.
    pub rel: String,
}

impl Link {
    /// Link with the default relation.
    pub fn full(href: impl Into<String>) -> Self {
        Self {
            href: href.into(),
            rel: "full".into(),
        }
    }

    /// Link to `id` in `collection` before the target has a self-reference.
    pub fn relative(collection: &str, id: &str) -> Self {
        Self::full(format!("{collection}/{id}"))
    }

    /// Read a link object.
    pub fn from_value(value: &Value) -> Option<Self> {
        let href = value.get("href")?.as_str()?.to_string();
        let rel = value
            .get("rel")
            .and_then(Value::as_str)
            .unwrap_or("full")
            .to_string();
        Some(Self { href, rel })
    }

    /// Serialize as a link object.
    pub fn to_value(&self) -> Value {
        json!({"href": self.href, "rel": self.rel})
    }
}

/// A parsed href: `scheme://host[:port]/.../collection/id` or the relative
/// form `collection/id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Href {
    /// Normalized `host:port` when absolute (default ports filled in).
    pub authority: Option<String>,
    /// Collection name (second-to-last path segment).
    pub collection: String,
    /// Record id (last path segment).
    pub id: String,
}

impl Href {
    /// Parse an href. Returns `None` when it has fewer than two path
    /// segments or the absolute form is not a valid URL.
    pub fn parse(href: &str) -> Option<Self> {
        if href.contains("://") {
            let url = url::Url::parse(href).ok()?;
            let (collection, id) = last_two(url.path())?;
            Some(Self {
                authority: Some(authority_of(&url)?),
                collection,
                id,
            })
        } else {
            let (collection, id) = last_two(href.split(['?', '#']).next().unwrap_or(href))?;
            Some(Self {
                authority: None,
                collection,
                id,
            })
        }
    }

    /// `true` for the relative form.
    pub fn is_relative(&self) -> bool {
        self.authority.is_none()
    }

    /// The `collection/id` form.
    pub fn relative(&self) -> String {
        format!("{}/{}", self.collection, self.id)
    }
}

/// Normalized `host:port` of an absolute URL, used to key stores.
pub fn authority_of(url: &url::Url) -> Option<String> {
    let host = url.host_str()?.to_ascii_lowercase();
    let port = url.port_or_known_default()?;
    Some(format!("{host}:{port}"))
}

fn last_two(path: &str) -> Option<(String, String)> {
    let mut segments = path.split('/').filter(|s| !s.is_empty()).rev();
    let id = segments.next()?;
    let collection = segments.next()?;
    Some((collection.to_string(), id.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn absolute_hrefs_normalize_authority() {
        let h = Href::parse("HTTP://Store.Example/nodes/n1").unwrap();
        assert_eq!(h.authority.as_deref(), Some("store.example:80"));
        assert_eq!(h.collection, "nodes");
        assert_eq!(h.id, "n1");

        let h = Href::parse("https://s:8888/api/ports/p2").unwrap();
        assert_eq!(h.authority.as_deref(), Some("s:8888"));
        assert_eq!(h.relative(), "ports/p2");
    }

    #[test]
    fn relative_hrefs_have_no_authority() {
        let h = Href::parse("links/l9").unwrap();
        assert!(h.is_relative());
        assert_eq!(h.collection, "links");
        assert_eq!(h.id, "l9");
        assert!(Href::parse("nodes").is_none());
    }

    #[test]
    fn link_defaults_to_full() {
        let l = Link::from_value(&json!({"href": "nodes/n1"})).unwrap();
        assert_eq!(l, Link::relative("nodes", "n1"));
        assert_eq!(l.to_value(), json!({"href": "nodes/n1", "rel": "full"}));
    }
}
