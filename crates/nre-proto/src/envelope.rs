// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Subscription socket frames.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Client → store: start streaming one channel.
///
/// Channels are collection names, or `data/<metadata-id>` for time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    /// Server-side filter; `{}` streams everything.
    #[serde(default = "empty_query")]
    pub query: Value,
    /// Channel name.
    #[serde(rename = "resourceType")]
    pub resource_type: String,
}

fn empty_query() -> Value {
    json!({})
}

impl SubscribeRequest {
    /// Unfiltered subscription to `channel`.
    pub fn all(channel: impl Into<String>) -> Self {
        Self {
            query: empty_query(),
            resource_type: channel.into(),
        }
    }
}

/// Routing headers of a pushed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers {
    /// Channel the record belongs to.
    pub collection: String,
    /// Present (`"DELETE"`) when the record was removed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

/// Store → client: one pushed record or delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Routing headers.
    pub headers: Headers,
    /// Record body.
    #[serde(default)]
    pub data: Value,
}

/// What a pushed record means for the local mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Insert or merge.
    Upsert,
    /// Remove the row.
    Delete,
}

impl Envelope {
    /// Upsert envelope for `collection`.
    pub fn upsert(collection: impl Into<String>, data: Value) -> Self {
        Self {
            headers: Headers {
                collection: collection.into(),
                action: None,
            },
            data,
        }
    }

    /// Delete envelope for `collection`.
    pub fn delete(collection: impl Into<String>, data: Value) -> Self {
        Self {
            headers: Headers {
                collection: collection.into(),
                action: Some("DELETE".into()),
            },
            data,
        }
    }

    /// Interpret the `action` header.
    pub fn action(&self) -> Action {
        match self.headers.action.as_deref() {
            Some(a) if a.eq_ignore_ascii_case("delete") => Action::Delete,
            _ => Action::Upsert,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn subscribe_request_uses_store_field_names() {
        let req = SubscribeRequest::all("nodes");
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"query": {}, "resourceType": "nodes"})
        );
    }

    #[test]
    fn delete_header_is_recognized() {
        let env: Envelope = serde_json::from_value(json!({
            "headers": {"collection": "nodes", "action": "DELETE"},
            "data": {"id": "n1"}
        }))
        .unwrap();
        assert_eq!(env.action(), Action::Delete);

        let env: Envelope =
            serde_json::from_value(json!({"headers": {"collection": "nodes"}, "data": {}})).unwrap();
        assert_eq!(env.action(), Action::Upsert);
    }
}
