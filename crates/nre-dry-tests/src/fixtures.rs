// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Schema documents and record builders for the core collections.
//!
//! Schemas carry no `id`, so `allOf` references resolve against whatever URL
//! serves them (the mock store's `/schema/<name>`).

use serde_json::{json, Value};

/// `(collection, schema name)` for every collection [`crate::MockStore::standard`]
/// serves.
pub const CORE_COLLECTIONS: [(&str, &str); 9] = [
    ("domains", "domain"),
    ("nodes", "node"),
    ("ports", "port"),
    ("links", "link"),
    ("services", "service"),
    ("paths", "path"),
    ("measurements", "measurement"),
    ("metadata", "metadata"),
    ("ipports", "ipport"),
];

fn link_object() -> Value {
    json!({
        "type": "object",
        "properties": {"href": {"type": "string"}, "rel": {"type": "string"}},
        "required": ["href"]
    })
}

/// Base schema shared by every record.
pub fn networkresource_schema() -> Value {
    json!({
        "title": "NetworkResource",
        "required": ["id"],
        "properties": {
            "id": {"type": "string"},
            "ts": {"type": "integer"},
            "selfRef": {"type": "string"},
            "name": {"type": "string"},
            "urn": {"type": "string"},
            "description": {"type": "string"},
            "properties": {"type": "object"}
        }
    })
}

/// Schema document by name, `None` for unknown names.
pub fn schema(name: &str) -> Option<Value> {
    let inherit = |title: &str, collection: &str, properties: Value| {
        json!({
            "title": title,
            "allOf": [{"$ref": "networkresource#"}],
            "properties": properties,
            "links": [{"rel": "collection", "href": collection}]
        })
    };
    Some(match name {
        "networkresource" => networkresource_schema(),
        "domain" => inherit("Domain", "domains", json!({"nodes": {"type": "array"}})),
        "node" => inherit(
            "Node",
            "nodes",
            json!({
                "ports": {"type": "array", "items": link_object()},
                "location": {"type": "object"}
            }),
        ),
        "port" => inherit(
            "Port",
            "ports",
            json!({
                "node": link_object(),
                "address": {
                    "type": "object",
                    "properties": {"type": {"type": "string"}, "address": {"type": "string"}}
                }
            }),
        ),
        "link" => inherit(
            "Link",
            "links",
            json!({
                "directed": {"type": "boolean"},
                "endpoints": {"type": "array", "items": link_object(), "maxItems": 2}
            }),
        ),
        "service" => inherit("Service", "services", json!({"serviceType": {"type": "string"}})),
        "path" => inherit(
            "Path",
            "paths",
            json!({
                "src": {"type": "string"},
                "dst": {"type": "string"},
                "direction": {"type": "string", "enum": ["", "outbound", "inbound"]},
                "hops": {"type": "array", "items": {"type": "string"}},
                "links": {"type": "array", "items": link_object()}
            }),
        ),
        "measurement" => inherit(
            "Measurement",
            "measurements",
            json!({
                "service": link_object(),
                "eventTypes": {"type": "array", "items": {"type": "string"}},
                "configuration": {
                    "type": "object",
                    "properties": {
                        "src": {"type": "string"},
                        "dst": {"type": "string"},
                        "schedule_params": {
                            "type": "object",
                            "properties": {
                                "every": {"type": "integer", "minimum": 1},
                                "duration": {"type": "integer", "minimum": 1},
                                "num_tests": {"type": "integer", "minimum": 0}
                            }
                        }
                    }
                },
                "scheduled_times": {"type": "array"}
            }),
        ),
        "metadata" => inherit(
            "Metadata",
            "metadata",
            json!({
                "subject": link_object(),
                "eventType": {"type": "string"},
                "parameters": {"type": "object"}
            }),
        ),
        "ipport" => inherit(
            "IpPort",
            "ipports",
            json!({"ip": {"type": "string"}, "port": link_object()}),
        ),
        _ => return None,
    })
}

/// `{"href": .., "rel": "full"}`
pub fn link_to(href: &str) -> Value {
    json!({"href": href, "rel": "full"})
}

/// A node record.
pub fn node(id: &str, ts: i64, name: &str) -> Value {
    json!({"id": id, "ts": ts, "name": name})
}

/// A port record bound to a node with an IPv4 address.
pub fn port(id: &str, node_href: &str, ip: &str) -> Value {
    json!({
        "id": id,
        "ts": 1,
        "name": id,
        "node": link_to(node_href),
        "address": {"type": "ipv4", "address": ip}
    })
}

/// A measurement between two endpoints.
pub fn measurement(id: &str, src: &str, dst: &str, every: i64, duration: i64, num_tests: i64) -> Value {
    json!({
        "id": id,
        "ts": 1,
        "eventTypes": ["ps:tools:traceroute"],
        "configuration": {
            "src": src,
            "dst": dst,
            "schedule_params": {"every": every, "duration": duration, "num_tests": num_tests}
        }
    })
}
