// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Flattened schema descriptors ("runtime classes").

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::{SchemaError, ValidationError};
use crate::validator::Validator;
use crate::{canonical_uri, resolve_uri};

/// Coarse JSON type of a field, used to pick defaults and composite handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// `"type": "string"`
    String,
    /// `"type": "integer"`
    Integer,
    /// `"type": "number"`
    Number,
    /// `"type": "boolean"`
    Boolean,
    /// `"type": "array"`
    Array,
    /// `"type": "object"` or a `$ref` to an object schema.
    Object,
    /// `"type": "null"`
    Null,
    /// Untyped, union-typed, or otherwise unconstrained.
    Any,
}

impl FieldKind {
    fn from_schema(schema: &Value) -> Self {
        let ty = match schema.get("type") {
            Some(Value::String(s)) => Some(s.as_str()),
            // `["string", "null"]` behaves like its first non-null member.
            Some(Value::Array(types)) => types
                .iter()
                .filter_map(Value::as_str)
                .find(|t| *t != "null"),
            _ => None,
        };
        match ty {
            Some("string") => Self::String,
            Some("integer") => Self::Integer,
            Some("number") => Self::Number,
            Some("boolean") => Self::Boolean,
            Some("array") => Self::Array,
            Some("object") => Self::Object,
            Some("null") => Self::Null,
            _ if schema.get("$ref").is_some() || schema.get("properties").is_some() => {
                Self::Object
            }
            _ => Self::Any,
        }
    }

    /// The JSON-Schema type default for this kind.
    pub fn default_value(self) -> Value {
        match self {
            Self::String => Value::String(String::new()),
            Self::Integer | Self::Number => Value::from(0),
            Self::Boolean => Value::Bool(false),
            Self::Array => Value::Array(Vec::new()),
            Self::Object => Value::Object(Map::new()),
            Self::Null | Self::Any => Value::Null,
        }
    }

    /// Objects and arrays merge recursively; everything else is overwritten.
    pub fn is_composite(self) -> bool {
        matches!(self, Self::Array | Self::Object)
    }
}

/// One property of a class.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    /// Property name.
    pub name: String,
    /// Coarse type.
    pub kind: FieldKind,
    /// Declared `default`, else the type default.
    pub default: Value,
    /// Listed in some `required` array along the inheritance chain.
    pub required: bool,
    /// URI of the class that declared the field (the nearest one when overridden).
    pub declared_in: String,
}

/// The runtime class built for one schema.
///
/// A class carries its schema URI as a type tag, the flattened field list
/// (parents first, overrides replace in place), the compiled validator, and
/// the collection name from the schema's `links` table when one is present.
#[derive(Debug)]
pub struct SchemaClass {
    uri: String,
    name: String,
    parents: Vec<Arc<SchemaClass>>,
    fields: Vec<FieldSpec>,
    index: HashMap<String, usize>,
    validator: Validator,
    collection: Option<String>,
}

impl SchemaClass {
    /// Build a class for `uri`, reusing already-built parents from `built`.
    pub(crate) fn build(
        uri: &str,
        documents: &HashMap<String, Arc<Value>>,
        built: &mut HashMap<String, Arc<SchemaClass>>,
        stack: &mut Vec<String>,
    ) -> Result<Arc<Self>, SchemaError> {
        let uri = canonical_uri(uri).to_string();
        if let Some(class) = built.get(&uri) {
            return Ok(Arc::clone(class));
        }
        if stack.contains(&uri) {
            return Err(SchemaError::Malformed {
                url: uri,
                reason: format!("allOf inheritance cycle through {}", stack.join(" -> ")),
            });
        }
        let doc = documents
            .get(&uri)
            .ok_or_else(|| SchemaError::UnresolvedRef {
                reference: uri.clone(),
                within: stack.last().cloned().unwrap_or_default(),
            })?;
        let map = doc.as_object().ok_or_else(|| SchemaError::Malformed {
            url: uri.clone(),
            reason: "top-level schema must be an object".into(),
        })?;
        let base = map
            .get("$id")
            .or_else(|| map.get("id"))
            .and_then(Value::as_str)
            .map_or_else(|| uri.clone(), |id| canonical_uri(id).to_string());

        stack.push(uri.clone());
        let mut parents = Vec::new();
        let mut fields: Vec<FieldSpec> = Vec::new();
        let mut required: BTreeSet<String> = BTreeSet::new();

        if let Some(all_of) = map.get("allOf") {
            let branches = all_of.as_array().ok_or_else(|| SchemaError::Malformed {
                url: uri.clone(),
                reason: "`allOf` must be an array".into(),
            })?;
            for branch in branches {
                if let Some(reference) = branch.get("$ref").and_then(Value::as_str) {
                    let parent_uri = resolve_uri(&base, reference);
                    let parent = Self::build(&parent_uri, documents, built, stack)?;
                    for field in parent.fields() {
                        upsert(&mut fields, field.clone());
                        if field.required {
                            required.insert(field.name.clone());
                        }
                    }
                    parents.push(parent);
                } else if let Some(inline) = branch.as_object() {
                    collect_own(inline, &uri, &mut fields, &mut required);
                }
            }
        }
        collect_own(map, &uri, &mut fields, &mut required);
        stack.pop();

        for field in &mut fields {
            field.required = required.contains(&field.name);
        }
        let index = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();
        let name = map
            .get("title")
            .and_then(Value::as_str)
            .map_or_else(|| last_segment(&uri).to_string(), str::to_string);
        let class = Arc::new(Self {
            validator: Validator::compile(&uri, documents)?,
            collection: collection_link(map),
            uri: uri.clone(),
            name,
            parents,
            fields,
            index,
        });
        built.insert(uri, Arc::clone(&class));
        Ok(class)
    }

    /// Schema URI (type tag).
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// `title`, or the last path segment of the URI.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Direct `allOf` parents.
    pub fn parents(&self) -> &[Arc<SchemaClass>] {
        &self.parents
    }

    /// Flattened field list.
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Look up one field.
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.index.get(name).map(|&i| &self.fields[i])
    }

    /// Names of every required field.
    pub fn required(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name.as_str())
    }

    /// Collection name from the `links` table, if any.
    pub fn collection(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    /// The compiled validator.
    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    /// Validate a serialized instance.
    pub fn validate(&self, instance: &Value) -> Result<(), ValidationError> {
        self.validator.validate(instance)
    }

    /// `true` when this class is `uri` or inherits from it.
    pub fn is_a(&self, uri: &str) -> bool {
        let uri = canonical_uri(uri);
        self.uri == uri || self.parents.iter().any(|p| p.is_a(uri))
    }

    /// A fresh object populated with every field default.
    pub fn defaults(&self) -> Map<String, Value> {
        self.fields
            .iter()
            .map(|f| (f.name.clone(), f.default.clone()))
            .collect()
    }
}

fn upsert(fields: &mut Vec<FieldSpec>, field: FieldSpec) {
    match fields.iter_mut().find(|f| f.name == field.name) {
        Some(slot) => *slot = field,
        None => fields.push(field),
    }
}

fn collect_own(
    map: &Map<String, Value>,
    uri: &str,
    fields: &mut Vec<FieldSpec>,
    required: &mut BTreeSet<String>,
) {
    if let Some(Value::Object(props)) = map.get("properties") {
        for (name, schema) in props {
            let kind = FieldKind::from_schema(schema);
            let default = schema
                .get("default")
                .cloned()
                .unwrap_or_else(|| kind.default_value());
            if schema.get("required").and_then(Value::as_bool) == Some(true) {
                required.insert(name.clone());
            }
            upsert(
                fields,
                FieldSpec {
                    name: name.clone(),
                    kind,
                    default,
                    required: false,
                    declared_in: uri.to_string(),
                },
            );
        }
    }
    if let Some(Value::Array(names)) = map.get("required") {
        required.extend(names.iter().filter_map(Value::as_str).map(str::to_string));
    }
}

fn collection_link(map: &Map<String, Value>) -> Option<String> {
    map.get("links")?
        .as_array()?
        .iter()
        .find(|l| l.get("rel").and_then(Value::as_str) == Some("collection"))
        .and_then(|l| l.get("href").and_then(Value::as_str))
        .map(|href| {
            href.trim_end_matches('/')
                .rsplit('/')
                .find(|seg| !seg.is_empty() && !seg.starts_with('{'))
                .unwrap_or(href)
                .to_string()
        })
}

fn last_segment(uri: &str) -> &str {
    uri.trim_end_matches('/').rsplit('/').next().unwrap_or(uri)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn docs(entries: &[(&str, Value)]) -> HashMap<String, Arc<Value>> {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), Arc::new(v.clone())))
            .collect()
    }

    #[test]
    fn flattens_all_of_parents_with_overrides() {
        let documents = docs(&[
            (
                "http://x/networkresource",
                json!({
                    "id": "http://x/networkresource#",
                    "required": ["id"],
                    "properties": {
                        "id": {"type": "string"},
                        "ts": {"type": "integer"},
                        "name": {"type": "string", "default": "unnamed"}
                    }
                }),
            ),
            (
                "http://x/node",
                json!({
                    "id": "http://x/node#",
                    "title": "Node",
                    "allOf": [{"$ref": "networkresource#"}],
                    "properties": {
                        "name": {"type": "string"},
                        "ports": {"type": "array"},
                        "location": {"type": "object"},
                        "up": {"type": "boolean"}
                    },
                    "links": [{"rel": "collection", "href": "http://x/nodes"}]
                }),
            ),
        ]);
        let mut built = HashMap::new();
        let class = SchemaClass::build("http://x/node#", &documents, &mut built, &mut vec![])
            .unwrap();
        assert_eq!(class.uri(), "http://x/node");
        assert_eq!(class.name(), "Node");
        assert_eq!(class.collection(), Some("nodes"));
        let names: Vec<_> = class.fields().iter().map(|f| f.name.as_str()).collect();
        // serde_json maps iterate alphabetically; parents come first.
        assert_eq!(names, vec!["id", "name", "ts", "location", "ports", "up"]);
        assert_eq!(class.field("name").unwrap().default, json!(""));
        assert_eq!(class.field("ports").unwrap().default, json!([]));
        assert_eq!(class.field("location").unwrap().default, json!({}));
        assert_eq!(class.field("up").unwrap().default, json!(false));
        assert_eq!(class.field("ts").unwrap().default, json!(0));
        assert!(class.field("id").unwrap().required);
        assert!(class.is_a("http://x/networkresource#"));
        assert_eq!(built.len(), 2);
    }

    #[test]
    fn missing_parent_is_fatal() {
        let documents = docs(&[(
            "http://x/port",
            json!({"allOf": [{"$ref": "http://x/missing#"}]}),
        )]);
        let err = SchemaClass::build("http://x/port", &documents, &mut HashMap::new(), &mut vec![])
            .unwrap_err();
        assert!(matches!(err, SchemaError::UnresolvedRef { .. }));
    }

    #[test]
    fn inheritance_cycle_is_malformed() {
        let documents = docs(&[
            ("http://x/a", json!({"allOf": [{"$ref": "http://x/b"}]})),
            ("http://x/b", json!({"allOf": [{"$ref": "http://x/a"}]})),
        ]);
        let err = SchemaClass::build("http://x/a", &documents, &mut HashMap::new(), &mut vec![])
            .unwrap_err();
        assert!(matches!(err, SchemaError::Malformed { .. }));
    }
}
