// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Sorted secondary indices.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::Value;

use crate::predicate::Cmp;

/// Totally ordered projection of a JSON value.
///
/// Values of different kinds order by kind: null, booleans, numbers,
/// strings, then arrays and objects (compared by their JSON text).
#[derive(Debug, Clone)]
pub enum IndexKey {
    /// `null` or a missing field.
    Null,
    /// Boolean.
    Bool(bool),
    /// Any number, compared as `f64`.
    Number(f64),
    /// String.
    Text(String),
    /// Array or object.
    Other(String),
}

impl IndexKey {
    fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Number(_) => 2,
            Self::Text(_) => 3,
            Self::Other(_) => 4,
        }
    }

    /// Key of an optional value; missing fields key as `Null`.
    pub fn of(value: Option<&Value>) -> Self {
        value.map_or(Self::Null, Self::from)
    }
}

impl From<&Value> for IndexKey {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => Self::Text(s.clone()),
            other => Self::Other(other.to_string()),
        }
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Number(a), Self::Number(b)) => a.total_cmp(b),
            (Self::Text(a), Self::Text(b)) | (Self::Other(a), Self::Other(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

/// `(key, row)` pairs kept sorted so every comparator is a bisection.
#[derive(Debug, Clone, Default)]
pub struct SortedIndex {
    entries: Vec<(IndexKey, usize)>,
    keys: HashMap<usize, IndexKey>,
}

impl SortedIndex {
    /// Empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed rows.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when no row is indexed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index `row` under `key`, replacing any previous key for it.
    pub fn insert(&mut self, row: usize, key: IndexKey) {
        self.remove(row);
        let at = self
            .entries
            .partition_point(|(k, r)| (k, *r) < (&key, row));
        self.entries.insert(at, (key.clone(), row));
        self.keys.insert(row, key);
    }

    /// Drop `row` from the index.
    pub fn remove(&mut self, row: usize) {
        let Some(key) = self.keys.remove(&row) else {
            return;
        };
        let at = self
            .entries
            .partition_point(|(k, r)| (k, *r) < (&key, row));
        if self.entries.get(at).is_some_and(|(_, r)| *r == row) {
            self.entries.remove(at);
        }
    }

    /// Rows in key order.
    pub fn rows(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries.iter().map(|(_, r)| *r)
    }

    /// Key order pairs.
    pub fn entries(&self) -> &[(IndexKey, usize)] {
        &self.entries
    }

    fn lower(&self, key: &IndexKey) -> usize {
        self.entries.partition_point(|(k, _)| k < key)
    }

    fn upper(&self, key: &IndexKey) -> usize {
        self.entries.partition_point(|(k, _)| k <= key)
    }

    /// Rows satisfying `cmp`, in key order.
    pub fn lookup(&self, cmp: &Cmp) -> Vec<usize> {
        let slice = |lo: usize, hi: usize| -> Vec<usize> {
            self.entries[lo..hi.max(lo)].iter().map(|(_, r)| *r).collect()
        };
        match cmp {
            Cmp::Eq(v) => {
                let key = IndexKey::from(v);
                slice(self.lower(&key), self.upper(&key))
            }
            Cmp::Lt(v) => slice(0, self.lower(&IndexKey::from(v))),
            Cmp::Le(v) => slice(0, self.upper(&IndexKey::from(v))),
            Cmp::Gt(v) => slice(self.upper(&IndexKey::from(v)), self.entries.len()),
            Cmp::Ge(v) => slice(self.lower(&IndexKey::from(v)), self.entries.len()),
            Cmp::In(values) => {
                let mut rows: Vec<usize> = values
                    .iter()
                    .flat_map(|v| {
                        let key = IndexKey::from(v);
                        slice(self.lower(&key), self.upper(&key))
                    })
                    .collect();
                rows.sort_unstable();
                rows.dedup();
                rows
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn index(keys: &[Value]) -> SortedIndex {
        let mut idx = SortedIndex::new();
        for (row, key) in keys.iter().enumerate() {
            idx.insert(row, IndexKey::from(key));
        }
        idx
    }

    #[test]
    fn mixed_kinds_order_by_kind() {
        let idx = index(&[json!("b"), json!(3), json!(null), json!(true), json!(1.5)]);
        assert_eq!(idx.rows().collect::<Vec<_>>(), vec![2, 3, 4, 1, 0]);
    }

    #[test]
    fn comparators_bisect() {
        let idx = index(&[json!(5), json!(1), json!(3), json!(3), json!(9)]);
        let mut eq = idx.lookup(&Cmp::Eq(json!(3)));
        eq.sort_unstable();
        assert_eq!(eq, vec![2, 3]);
        assert_eq!(idx.lookup(&Cmp::Lt(json!(3))), vec![1]);
        assert_eq!(idx.lookup(&Cmp::Le(json!(3))), vec![1, 2, 3]);
        assert_eq!(idx.lookup(&Cmp::Gt(json!(3))), vec![0, 4]);
        assert_eq!(idx.lookup(&Cmp::Ge(json!(5))), vec![0, 4]);
        assert_eq!(idx.lookup(&Cmp::In(vec![json!(9), json!(1), json!(7)])), vec![1, 4]);
    }

    #[test]
    fn reinsert_moves_the_row() {
        let mut idx = index(&[json!(1), json!(2)]);
        idx.insert(0, IndexKey::from(&json!(10)));
        assert_eq!(idx.rows().collect::<Vec<_>>(), vec![1, 0]);
        idx.remove(1);
        idx.remove(1);
        assert_eq!(idx.len(), 1);
        assert!(idx.lookup(&Cmp::Eq(json!(1))).is_empty());
    }

    #[test]
    fn integers_and_floats_compare_numerically() {
        assert_eq!(IndexKey::from(&json!(2)), IndexKey::from(&json!(2.0)));
        assert!(IndexKey::from(&json!(2)) < IndexKey::from(&json!(10)));
        assert!(IndexKey::of(None) < IndexKey::from(&json!(false)));
    }
}
