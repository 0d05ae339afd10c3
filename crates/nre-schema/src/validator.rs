// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Compiled JSON Schema validator.
//!
//! Covers the keyword subset the store schemas use: `type`, `enum`, `const`,
//! `properties`, `required`, `additionalProperties`, `items`, `minItems`,
//! `maxItems`, `minimum`, `maximum`, `minLength`, `maxLength`, `pattern`,
//! `allOf`, `anyOf`, `oneOf`, `not` and `$ref`. Unknown keywords (`format`,
//! `links`, `title`, ...) are ignored. Every `$ref` is resolved when the
//! validator is compiled, so an unresolvable reference fails construction
//! rather than validation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{SchemaError, ValidationError, Violation};
use crate::{canonical_uri, resolve_uri, split_fragment};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JsonType {
    Null,
    Boolean,
    Integer,
    Number,
    String,
    Array,
    Object,
}

impl JsonType {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "null" => Self::Null,
            "boolean" => Self::Boolean,
            "integer" => Self::Integer,
            "number" => Self::Number,
            "string" => Self::String,
            "array" => Self::Array,
            "object" => Self::Object,
            _ => return None,
        })
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            Self::Null => value.is_null(),
            Self::Boolean => value.is_boolean(),
            Self::Integer => {
                value.is_i64()
                    || value.is_u64()
                    || value.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            Self::Number => value.is_number(),
            Self::String => value.is_string(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Boolean => "boolean",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

#[derive(Debug, Clone)]
enum Check {
    Type(Vec<JsonType>),
    Enum(Vec<Value>),
    Const(Value),
    Properties(Vec<(String, Node)>),
    Required(Vec<String>),
    Additional { known: HashSet<String>, schema: Box<Node> },
    Items(Box<Node>),
    MinItems(usize),
    MaxItems(usize),
    Minimum(f64),
    Maximum(f64),
    MinLength(usize),
    MaxLength(usize),
    Pattern(Regex),
    AllOf(Vec<Node>),
    AnyOf(Vec<Node>),
    OneOf(Vec<Node>),
    Not(Box<Node>),
    Ref(String),
}

#[derive(Debug, Clone)]
enum Node {
    Any,
    Never,
    Checks(Vec<Check>),
}

/// A compiled schema, cheap to clone and safe to share across threads.
#[derive(Debug, Clone)]
pub struct Validator {
    uri: String,
    root: Arc<Node>,
    refs: Arc<HashMap<String, Node>>,
}

impl Validator {
    /// Compile the schema at `uri` against the already-loaded `documents`
    /// (keyed by canonical URI).
    pub(crate) fn compile(
        uri: &str,
        documents: &HashMap<String, Arc<Value>>,
    ) -> Result<Self, SchemaError> {
        let uri = canonical_uri(uri).to_string();
        let mut compiler = Compiler {
            documents,
            refs: HashMap::new(),
            queued: HashSet::new(),
            pending: Vec::new(),
        };
        let doc = compiler.lookup(&uri, &uri)?;
        let root = compiler.node(&doc, &uri)?;
        while let Some(reference) = compiler.pending.pop() {
            let target = compiler.lookup(&reference, &uri)?;
            let node = compiler.node(&target, &reference)?;
            compiler.refs.insert(reference, node);
        }
        Ok(Self {
            uri,
            root: Arc::new(root),
            refs: Arc::new(compiler.refs),
        })
    }

    /// Compile an inline schema with no external references. Intended for
    /// ad-hoc checks and tests.
    pub fn from_value(uri: &str, schema: &Value) -> Result<Self, SchemaError> {
        let mut documents = HashMap::new();
        documents.insert(canonical_uri(uri).to_string(), Arc::new(schema.clone()));
        Self::compile(uri, &documents)
    }

    /// The schema URI this validator was compiled from.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// `true` when `instance` satisfies the schema.
    pub fn is_valid(&self, instance: &Value) -> bool {
        let mut sink = Vec::new();
        self.walk(&self.root, instance, "", &mut sink);
        sink.is_empty()
    }

    /// Validate `instance`, collecting every violation.
    pub fn validate(&self, instance: &Value) -> Result<(), ValidationError> {
        let mut violations = Vec::new();
        self.walk(&self.root, instance, "", &mut violations);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationError {
                schema: self.uri.clone(),
                violations,
            })
        }
    }

    fn walk(&self, node: &Node, value: &Value, path: &str, out: &mut Vec<Violation>) {
        let checks = match node {
            Node::Any => return,
            Node::Never => {
                out.push(violation(path, "no value is allowed here"));
                return;
            }
            Node::Checks(checks) => checks,
        };
        for check in checks {
            self.apply(check, value, path, out);
        }
    }

    fn passes(&self, node: &Node, value: &Value, path: &str) -> bool {
        let mut sink = Vec::new();
        self.walk(node, value, path, &mut sink);
        sink.is_empty()
    }

    fn apply(&self, check: &Check, value: &Value, path: &str, out: &mut Vec<Violation>) {
        match check {
            Check::Type(types) => {
                if !types.iter().any(|t| t.matches(value)) {
                    let names: Vec<_> = types.iter().map(|t| t.name()).collect();
                    out.push(violation(
                        path,
                        &format!("expected {}, found {}", names.join(" or "), kind_of(value)),
                    ));
                }
            }
            Check::Enum(allowed) => {
                if !allowed.contains(value) {
                    out.push(violation(path, &format!("{value} is not one of {allowed:?}")));
                }
            }
            Check::Const(expected) => {
                if expected != value {
                    out.push(violation(path, &format!("expected constant {expected}")));
                }
            }
            Check::Properties(props) => {
                if let Value::Object(map) = value {
                    for (name, node) in props {
                        if let Some(child) = map.get(name) {
                            self.walk(node, child, &child_path(path, name), out);
                        }
                    }
                }
            }
            Check::Required(names) => {
                if let Value::Object(map) = value {
                    for name in names {
                        if !map.contains_key(name) {
                            out.push(violation(path, &format!("missing required field `{name}`")));
                        }
                    }
                }
            }
            Check::Additional { known, schema } => {
                if let Value::Object(map) = value {
                    for (name, child) in map {
                        if !known.contains(name) {
                            self.walk(schema, child, &child_path(path, name), out);
                        }
                    }
                }
            }
            Check::Items(node) => {
                if let Value::Array(items) = value {
                    for (idx, item) in items.iter().enumerate() {
                        self.walk(node, item, &child_path(path, &idx.to_string()), out);
                    }
                }
            }
            Check::MinItems(min) => {
                if let Value::Array(items) = value {
                    if items.len() < *min {
                        out.push(violation(path, &format!("fewer than {min} items")));
                    }
                }
            }
            Check::MaxItems(max) => {
                if let Value::Array(items) = value {
                    if items.len() > *max {
                        out.push(violation(path, &format!("more than {max} items")));
                    }
                }
            }
            Check::Minimum(min) => {
                if let Some(n) = value.as_f64() {
                    if n < *min {
                        out.push(violation(path, &format!("{n} is below minimum {min}")));
                    }
                }
            }
            Check::Maximum(max) => {
                if let Some(n) = value.as_f64() {
                    if n > *max {
                        out.push(violation(path, &format!("{n} is above maximum {max}")));
                    }
                }
            }
            Check::MinLength(min) => {
                if let Some(s) = value.as_str() {
                    if s.chars().count() < *min {
                        out.push(violation(path, &format!("shorter than {min} characters")));
                    }
                }
            }
            Check::MaxLength(max) => {
                if let Some(s) = value.as_str() {
                    if s.chars().count() > *max {
                        out.push(violation(path, &format!("longer than {max} characters")));
                    }
                }
            }
            Check::Pattern(re) => {
                if let Some(s) = value.as_str() {
                    if !re.is_match(s) {
                        out.push(violation(path, &format!("does not match /{}/", re.as_str())));
                    }
                }
            }
            Check::AllOf(nodes) => {
                for node in nodes {
                    self.walk(node, value, path, out);
                }
            }
            Check::AnyOf(nodes) => {
                if !nodes.iter().any(|n| self.passes(n, value, path)) {
                    out.push(violation(path, "matches none of anyOf"));
                }
            }
            Check::OneOf(nodes) => {
                let hits = nodes.iter().filter(|n| self.passes(n, value, path)).count();
                if hits != 1 {
                    out.push(violation(
                        path,
                        &format!("matches {hits} branches of oneOf, expected exactly 1"),
                    ));
                }
            }
            Check::Not(node) => {
                if self.passes(node, value, path) {
                    out.push(violation(path, "matches a forbidden schema"));
                }
            }
            Check::Ref(key) => match self.refs.get(key) {
                Some(node) => self.walk(node, value, path, out),
                None => out.push(violation(path, &format!("dangling reference {key}"))),
            },
        }
    }
}

fn violation(path: &str, message: &str) -> Violation {
    Violation {
        path: path.to_string(),
        message: message.to_string(),
    }
}

fn child_path(path: &str, segment: &str) -> String {
    format!("{path}/{segment}")
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

struct Compiler<'a> {
    documents: &'a HashMap<String, Arc<Value>>,
    refs: HashMap<String, Node>,
    queued: HashSet<String>,
    pending: Vec<String>,
}

impl Compiler<'_> {
    /// Fetch the schema fragment named by an absolute `reference`.
    fn lookup(&self, reference: &str, within: &str) -> Result<Value, SchemaError> {
        let (base, fragment) = split_fragment(reference);
        let unresolved = || SchemaError::UnresolvedRef {
            reference: reference.to_string(),
            within: within.to_string(),
        };
        let doc = self.documents.get(canonical_uri(base)).ok_or_else(unresolved)?;
        if fragment.is_empty() {
            return Ok(doc.as_ref().clone());
        }
        doc.pointer(fragment).cloned().ok_or_else(unresolved)
    }

    fn node(&mut self, schema: &Value, base: &str) -> Result<Node, SchemaError> {
        match schema {
            Value::Bool(true) => Ok(Node::Any),
            Value::Bool(false) => Ok(Node::Never),
            Value::Object(map) => self.object(map, base),
            other => Err(SchemaError::Malformed {
                url: base.to_string(),
                reason: format!("schema must be an object or boolean, found {other}"),
            }),
        }
    }

    fn object(&mut self, map: &Map<String, Value>, base: &str) -> Result<Node, SchemaError> {
        let malformed = |reason: String| SchemaError::Malformed {
            url: base.to_string(),
            reason,
        };
        let mut checks = Vec::new();

        if let Some(reference) = map.get("$ref") {
            let reference = reference
                .as_str()
                .ok_or_else(|| malformed("$ref must be a string".into()))?;
            let key = canonical_ref(&resolve_uri(base, reference));
            // Fail fast so construction, not validation, reports the problem.
            self.lookup(&key, base)?;
            if self.queued.insert(key.clone()) {
                self.pending.push(key.clone());
            }
            checks.push(Check::Ref(key));
        }

        match map.get("type") {
            None => {}
            Some(Value::String(name)) => {
                let ty = JsonType::parse(name)
                    .ok_or_else(|| malformed(format!("unknown type `{name}`")))?;
                checks.push(Check::Type(vec![ty]));
            }
            Some(Value::Array(names)) => {
                let mut types = Vec::with_capacity(names.len());
                for name in names {
                    let ty = name
                        .as_str()
                        .and_then(JsonType::parse)
                        .ok_or_else(|| malformed(format!("unknown type {name}")))?;
                    types.push(ty);
                }
                checks.push(Check::Type(types));
            }
            Some(other) => return Err(malformed(format!("invalid `type` {other}"))),
        }

        if let Some(values) = map.get("enum") {
            let values = values
                .as_array()
                .ok_or_else(|| malformed("`enum` must be an array".into()))?;
            checks.push(Check::Enum(values.clone()));
        }
        if let Some(value) = map.get("const") {
            checks.push(Check::Const(value.clone()));
        }

        let mut known = HashSet::new();
        if let Some(props) = map.get("properties") {
            let props = props
                .as_object()
                .ok_or_else(|| malformed("`properties` must be an object".into()))?;
            let mut compiled = Vec::with_capacity(props.len());
            for (name, sub) in props {
                known.insert(name.clone());
                compiled.push((name.clone(), self.node(sub, base)?));
            }
            checks.push(Check::Properties(compiled));
        }
        if let Some(required) = map.get("required") {
            // draft-03 style `"required": true` on a property is ignored here;
            // the parent object carries the list form.
            if let Some(names) = required.as_array() {
                let names = names
                    .iter()
                    .map(|n| {
                        n.as_str()
                            .map(str::to_string)
                            .ok_or_else(|| malformed(format!("required entry {n} is not a string")))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                checks.push(Check::Required(names));
            }
        }
        if let Some(additional) = map.get("additionalProperties") {
            let schema = Box::new(self.node(additional, base)?);
            checks.push(Check::Additional { known, schema });
        }
        if let Some(items) = map.get("items") {
            // Tuple-form `items` is treated as "any" per element.
            if items.is_object() || items.is_boolean() {
                checks.push(Check::Items(Box::new(self.node(items, base)?)));
            }
        }
        if let Some(n) = map.get("minItems").and_then(Value::as_u64) {
            checks.push(Check::MinItems(n as usize));
        }
        if let Some(n) = map.get("maxItems").and_then(Value::as_u64) {
            checks.push(Check::MaxItems(n as usize));
        }
        if let Some(n) = map.get("minimum").and_then(Value::as_f64) {
            checks.push(Check::Minimum(n));
        }
        if let Some(n) = map.get("maximum").and_then(Value::as_f64) {
            checks.push(Check::Maximum(n));
        }
        if let Some(n) = map.get("minLength").and_then(Value::as_u64) {
            checks.push(Check::MinLength(n as usize));
        }
        if let Some(n) = map.get("maxLength").and_then(Value::as_u64) {
            checks.push(Check::MaxLength(n as usize));
        }
        if let Some(pattern) = map.get("pattern") {
            let pattern = pattern
                .as_str()
                .ok_or_else(|| malformed("`pattern` must be a string".into()))?;
            let re = Regex::new(pattern).map_err(|e| malformed(format!("bad pattern: {e}")))?;
            checks.push(Check::Pattern(re));
        }
        for (keyword, ctor) in [
            ("allOf", Check::AllOf as fn(Vec<Node>) -> Check),
            ("anyOf", Check::AnyOf),
            ("oneOf", Check::OneOf),
        ] {
            if let Some(branches) = map.get(keyword) {
                let branches = branches
                    .as_array()
                    .ok_or_else(|| malformed(format!("`{keyword}` must be an array")))?;
                let nodes = branches
                    .iter()
                    .map(|b| self.node(b, base))
                    .collect::<Result<Vec<_>, _>>()?;
                checks.push(ctor(nodes));
            }
        }
        if let Some(not) = map.get("not") {
            checks.push(Check::Not(Box::new(self.node(not, base)?)));
        }

        if checks.is_empty() {
            Ok(Node::Any)
        } else {
            Ok(Node::Checks(checks))
        }
    }
}

fn canonical_ref(reference: &str) -> String {
    let (base, fragment) = split_fragment(reference);
    if fragment.is_empty() {
        canonical_uri(base).to_string()
    } else {
        format!("{}#{fragment}", canonical_uri(base))
    }
}
