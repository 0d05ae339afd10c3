// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Collection query strings (`limit`, `skip`, `sort`, `ts=gt=`).

/// Builder for collection GET parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pairs: Vec<(String, String)>,
}

impl Query {
    /// No parameters.
    pub fn new() -> Self {
        Self::default()
    }

    /// `limit=N`
    pub fn limit(mut self, n: usize) -> Self {
        self.pairs.push(("limit".into(), n.to_string()));
        self
    }

    /// `skip=K`
    pub fn skip(mut self, k: usize) -> Self {
        self.pairs.push(("skip".into(), k.to_string()));
        self
    }

    /// `sort=ts:1`
    pub fn sort_ts_ascending(mut self) -> Self {
        self.pairs.push(("sort".into(), "ts:1".into()));
        self
    }

    /// `ts=gt=<micros>`
    pub fn ts_after(mut self, micros: i64) -> Self {
        self.pairs.push(("ts".into(), format!("gt={micros}")));
        self
    }

    /// `field=value`
    pub fn eq(mut self, field: &str, value: impl ToString) -> Self {
        self.pairs.push((field.to_string(), value.to_string()));
        self
    }

    /// Parameter pairs in insertion order.
    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    /// `true` when no parameter was added.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// `a=1&b=2`, values left unescaped the way stores print them in logs.
    pub fn to_query_string(&self) -> String {
        self.pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_and_cursor_parameters() {
        let q = Query::new().limit(100).skip(200).sort_ts_ascending();
        assert_eq!(q.to_query_string(), "limit=100&skip=200&sort=ts:1");
        let q = Query::new().ts_after(42).sort_ts_ascending();
        assert_eq!(q.to_query_string(), "ts=gt=42&sort=ts:1");
        assert!(Query::new().is_empty());
    }
}
