// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Collection query predicates.

use std::fmt;
use std::sync::Arc;

use nre_model::Entity;
use serde_json::Value;

use crate::index::IndexKey;

/// Comparator applied to one field.
#[derive(Debug, Clone, PartialEq)]
pub enum Cmp {
    /// `field == v`
    Eq(Value),
    /// `field < v`
    Lt(Value),
    /// `field <= v`
    Le(Value),
    /// `field > v`
    Gt(Value),
    /// `field >= v`
    Ge(Value),
    /// `field` equals one of the values.
    In(Vec<Value>),
}

impl Cmp {
    /// Evaluate against a field value (`None` when the field is missing).
    ///
    /// Uses the same ordering as [`IndexKey`], so scans and index lookups
    /// agree.
    pub fn matches(&self, value: Option<&Value>) -> bool {
        let key = IndexKey::of(value);
        match self {
            Self::Eq(v) => key == IndexKey::from(v),
            Self::Lt(v) => key < IndexKey::from(v),
            Self::Le(v) => key <= IndexKey::from(v),
            Self::Gt(v) => key > IndexKey::from(v),
            Self::Ge(v) => key >= IndexKey::from(v),
            Self::In(values) => values.iter().any(|v| key == IndexKey::from(v)),
        }
    }

    /// Parse a comparator wrapper (`{"gt": 5}`, `{"in": [..]}`); any other
    /// value is an equality test.
    pub fn from_value(value: &Value) -> Self {
        if let Value::Object(map) = value {
            if map.len() == 1 {
                if let Some((op, arg)) = map.iter().next() {
                    match (op.as_str(), arg) {
                        ("eq", v) => return Self::Eq(v.clone()),
                        ("lt", v) => return Self::Lt(v.clone()),
                        ("le" | "lte", v) => return Self::Le(v.clone()),
                        ("gt", v) => return Self::Gt(v.clone()),
                        ("ge" | "gte", v) => return Self::Ge(v.clone()),
                        ("in", Value::Array(vs)) => return Self::In(vs.clone()),
                        _ => {}
                    }
                }
            }
        }
        Self::Eq(value.clone())
    }
}

type Func = Arc<dyn Fn(&Entity) -> bool + Send + Sync>;

/// A conjunction of field comparators plus an optional closure.
///
/// Field names may be dotted paths into sub-objects (`"address.address"`).
///
/// ```
/// use nre_runtime::Predicate;
/// use serde_json::json;
///
/// let p = Predicate::new().eq("name", "a").gt("ts", 5);
/// let q = Predicate::from_value(&json!({"name": "a", "ts": {"gt": 5}}));
/// assert_eq!(p.fields(), q.fields());
/// ```
#[derive(Clone, Default)]
pub struct Predicate {
    fields: Vec<(String, Cmp)>,
    func: Option<Func>,
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Predicate")
            .field("fields", &self.fields)
            .field("func", &self.func.is_some())
            .finish()
    }
}

impl Predicate {
    /// Match everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Match with a closure only.
    pub fn func(f: impl Fn(&Entity) -> bool + Send + Sync + 'static) -> Self {
        Self {
            fields: Vec::new(),
            func: Some(Arc::new(f)),
        }
    }

    /// Build from a field → value (or comparator wrapper) mapping.
    pub fn from_value(map: &Value) -> Self {
        let fields = map
            .as_object()
            .map(|m| {
                m.iter()
                    .map(|(k, v)| (k.clone(), Cmp::from_value(v)))
                    .collect()
            })
            .unwrap_or_default();
        Self { fields, func: None }
    }

    /// Add a comparator.
    pub fn with(mut self, field: &str, cmp: Cmp) -> Self {
        self.fields.push((field.to_string(), cmp));
        self
    }

    /// `field == value`
    pub fn eq(self, field: &str, value: impl Into<Value>) -> Self {
        self.with(field, Cmp::Eq(value.into()))
    }

    /// `field < value`
    pub fn lt(self, field: &str, value: impl Into<Value>) -> Self {
        self.with(field, Cmp::Lt(value.into()))
    }

    /// `field <= value`
    pub fn le(self, field: &str, value: impl Into<Value>) -> Self {
        self.with(field, Cmp::Le(value.into()))
    }

    /// `field > value`
    pub fn gt(self, field: &str, value: impl Into<Value>) -> Self {
        self.with(field, Cmp::Gt(value.into()))
    }

    /// `field >= value`
    pub fn ge(self, field: &str, value: impl Into<Value>) -> Self {
        self.with(field, Cmp::Ge(value.into()))
    }

    /// `field ∈ values`
    pub fn is_in(self, field: &str, values: Vec<Value>) -> Self {
        self.with(field, Cmp::In(values))
    }

    /// Add (or replace) the closure.
    pub fn and(mut self, f: impl Fn(&Entity) -> bool + Send + Sync + 'static) -> Self {
        self.func = Some(Arc::new(f));
        self
    }

    /// Field comparators.
    pub fn fields(&self) -> &[(String, Cmp)] {
        &self.fields
    }

    /// Evaluate against one record. Deleted records never match.
    pub fn matches(&self, entity: &Entity) -> bool {
        if entity.is_deleted() {
            return false;
        }
        let fields_ok = self.fields.iter().all(|(field, cmp)| {
            let value = field_value(entity, field);
            cmp.matches(value.as_ref())
        });
        fields_ok && self.func.as_ref().is_none_or(|f| f(entity))
    }
}

/// Value of a (possibly dotted) field, identity fields included.
pub(crate) fn field_value(entity: &Entity, field: &str) -> Option<Value> {
    let path: Vec<&str> = field.split('.').collect();
    entity.value_at(&path).ok().flatten()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wrappers_parse() {
        assert_eq!(Cmp::from_value(&json!({"gt": 5})), Cmp::Gt(json!(5)));
        assert_eq!(
            Cmp::from_value(&json!({"in": [1, 2]})),
            Cmp::In(vec![json!(1), json!(2)])
        );
        assert_eq!(
            Cmp::from_value(&json!({"gt": 5, "lt": 9})),
            Cmp::Eq(json!({"gt": 5, "lt": 9}))
        );
        assert_eq!(Cmp::from_value(&json!("a")), Cmp::Eq(json!("a")));
    }

    #[test]
    fn missing_fields_compare_as_null() {
        assert!(Cmp::Eq(Value::Null).matches(None));
        assert!(Cmp::Lt(json!(0)).matches(None));
        assert!(!Cmp::Gt(json!(0)).matches(None));
    }
}
