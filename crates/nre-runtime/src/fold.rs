// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Running reductions over data points.

use std::fmt;

use serde_json::{json, Value};

/// One time-series point.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    /// Microseconds since the epoch.
    pub ts: i64,
    /// Measured value.
    pub value: Value,
}

impl Point {
    /// Point at `ts`.
    pub fn new(ts: i64, value: impl Into<Value>) -> Self {
        Self {
            ts,
            value: value.into(),
        }
    }

    /// Read `{ts, value}`.
    pub fn from_value(raw: &Value) -> Option<Self> {
        Some(Self {
            ts: raw.get("ts")?.as_i64()?,
            value: raw.get("value").cloned().unwrap_or(Value::Null),
        })
    }

    /// Serialize as `{ts, value}`.
    pub fn to_value(&self) -> Value {
        json!({"ts": self.ts, "value": self.value})
    }
}

/// A running reduction updated by every point of a stream.
pub trait Fold: Send + Sync {
    /// Fold one point in.
    fn update(&mut self, point: &Point);
    /// Current result (`null` before the first numeric point).
    fn value(&self) -> Value;
}

impl fmt::Debug for dyn Fold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fold({})", self.value())
    }
}

fn number(value: Option<f64>) -> Value {
    value.map_or(Value::Null, |v| json!(v))
}

/// Smallest numeric value.
#[derive(Debug, Clone, Default)]
pub struct Min(Option<f64>);

impl Fold for Min {
    fn update(&mut self, point: &Point) {
        if let Some(x) = point.value.as_f64() {
            self.0 = Some(self.0.map_or(x, |m| m.min(x)));
        }
    }

    fn value(&self) -> Value {
        number(self.0)
    }
}

/// Largest numeric value.
#[derive(Debug, Clone, Default)]
pub struct Max(Option<f64>);

impl Fold for Max {
    fn update(&mut self, point: &Point) {
        if let Some(x) = point.value.as_f64() {
            self.0 = Some(self.0.map_or(x, |m| m.max(x)));
        }
    }

    fn value(&self) -> Value {
        number(self.0)
    }
}

/// Most recent value, numeric or not.
#[derive(Debug, Clone, Default)]
pub struct Last(Option<Value>);

impl Fold for Last {
    fn update(&mut self, point: &Point) {
        self.0 = Some(point.value.clone());
    }

    fn value(&self) -> Value {
        self.0.clone().unwrap_or(Value::Null)
    }
}

/// Running arithmetic mean.
#[derive(Debug, Clone, Default)]
pub struct Mean {
    n: u64,
    mean: f64,
}

impl Fold for Mean {
    fn update(&mut self, point: &Point) {
        if let Some(x) = point.value.as_f64() {
            self.n += 1;
            self.mean += (x - self.mean) / self.n as f64;
        }
    }

    fn value(&self) -> Value {
        number((self.n > 0).then_some(self.mean))
    }
}

/// Jitter as the sample standard deviation, accumulated with Welford's
/// method. Zero until two points have arrived.
#[derive(Debug, Clone, Default)]
pub struct Jitter {
    n: u64,
    mean: f64,
    m2: f64,
}

impl Fold for Jitter {
    fn update(&mut self, point: &Point) {
        if let Some(x) = point.value.as_f64() {
            self.n += 1;
            let delta = x - self.mean;
            self.mean += delta / self.n as f64;
            self.m2 += delta * (x - self.mean);
        }
    }

    fn value(&self) -> Value {
        match self.n {
            0 => Value::Null,
            1 => json!(0.0),
            n => json!((self.m2 / (n - 1) as f64).sqrt()),
        }
    }
}

/// User reduction `(point value, prior) -> prior'`.
pub struct Custom<F> {
    prior: Value,
    f: F,
}

impl<F> Custom<F>
where
    F: FnMut(&Value, &Value) -> Value + Send + Sync,
{
    /// Start from `initial`.
    pub fn new(initial: Value, f: F) -> Self {
        Self { prior: initial, f }
    }
}

impl<F> Fold for Custom<F>
where
    F: FnMut(&Value, &Value) -> Value + Send + Sync,
{
    fn update(&mut self, point: &Point) {
        self.prior = (self.f)(&point.value, &self.prior);
    }

    fn value(&self) -> Value {
        self.prior.clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn feed(fold: &mut dyn Fold, values: &[Value]) -> Value {
        for (i, v) in values.iter().enumerate() {
            fold.update(&Point::new(i as i64, v.clone()));
        }
        fold.value()
    }

    #[test]
    fn builtins_reduce() {
        let xs = [json!(2), json!(4), json!("skip"), json!(4), json!(4), json!(5), json!(5), json!(7), json!(9)];
        assert_eq!(feed(&mut Min::default(), &xs), json!(2.0));
        assert_eq!(feed(&mut Max::default(), &xs), json!(9.0));
        assert_eq!(feed(&mut Last::default(), &xs), json!(9));
        assert_eq!(feed(&mut Mean::default(), &xs), json!(5.0));
        let jitter = feed(&mut Jitter::default(), &xs).as_f64().unwrap();
        assert!((jitter - (32.0f64 / 7.0).sqrt()).abs() < 1e-9);
    }

    #[test]
    fn empty_and_single_point_results() {
        assert_eq!(Mean::default().value(), Value::Null);
        assert_eq!(feed(&mut Jitter::default(), &[json!(3)]), json!(0.0));
    }

    #[test]
    fn custom_folds_thread_the_prior() {
        let mut count = Custom::new(json!(0), |_, prior| json!(prior.as_i64().unwrap_or(0) + 1));
        assert_eq!(feed(&mut count, &[json!(1), json!(null), json!("x")]), json!(3));
    }
}
