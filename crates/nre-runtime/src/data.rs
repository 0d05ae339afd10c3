// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Time-series data streams with running folds.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use nre_app_core::MeasurementSettings;
use nre_client::{Federation, StoreId};
use nre_proto::{now_micros, records, Envelope, Query, DATA_COLLECTION};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::RuntimeError;
use crate::fold::{Fold, Point};

#[derive(Default)]
struct FoldState {
    cursor: i64,
    folds: BTreeMap<String, Box<dyn Fold>>,
    catching_up: bool,
    backlog: Vec<Point>,
    applied: u64,
}

impl FoldState {
    /// Apply points newer than the cursor, in timestamp order. Points of
    /// one batch sharing a timestamp are all applied; the cursor moves to
    /// the batch maximum afterwards.
    fn ingest(&mut self, mut points: Vec<Point>) -> usize {
        let floor = self.cursor;
        points.retain(|p| p.ts > floor);
        points.sort_by_key(|p| p.ts);
        for point in &points {
            for fold in self.folds.values_mut() {
                fold.update(point);
            }
        }
        if let Some(last) = points.last() {
            self.cursor = last.ts;
        }
        self.applied += points.len() as u64;
        points.len()
    }
}

#[derive(Default)]
struct Outbound {
    points: Vec<Point>,
    oldest: Option<Instant>,
}

/// The infinite `{ts, value}` sequence of one metadata record.
///
/// The first fold read performs a catch-up `GET data/<mid>?ts=gt=<cursor>`
/// after attaching the subscription; points pushed while catching up are
/// held back and applied afterwards, so each point is folded once and in
/// order. The cursor starts at 0 with history on, or at "now" without.
pub struct DataStream {
    mid: String,
    store: Option<StoreId>,
    federation: Option<Arc<Federation>>,
    settings: MeasurementSettings,
    state: Mutex<FoldState>,
    outbound: Mutex<Outbound>,
    caught_up: tokio::sync::Mutex<bool>,
    weak: Weak<DataStream>,
}

impl fmt::Debug for DataStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataStream")
            .field("mid", &self.mid)
            .field("store", &self.store)
            .field("cursor", &self.cursor())
            .finish_non_exhaustive()
    }
}

impl DataStream {
    /// Stream for `mid` served by `store` (the default store when `None`).
    pub fn new(
        mid: &str,
        store: Option<StoreId>,
        federation: Option<Arc<Federation>>,
        settings: MeasurementSettings,
    ) -> Arc<Self> {
        let cursor = if settings.read_history { 0 } else { now_micros() };
        Arc::new_cyclic(|weak| Self {
            mid: mid.to_string(),
            store,
            federation,
            settings,
            state: Mutex::new(FoldState {
                cursor,
                ..FoldState::default()
            }),
            outbound: Mutex::new(Outbound::default()),
            caught_up: tokio::sync::Mutex::new(false),
            weak: weak.clone(),
        })
    }

    /// A stream with no store behind it.
    pub fn detached(mid: &str, settings: MeasurementSettings) -> Arc<Self> {
        Self::new(mid, None, None, settings)
    }

    /// Metadata id.
    pub fn mid(&self) -> &str {
        &self.mid
    }

    /// Timestamp of the last applied point.
    pub fn cursor(&self) -> i64 {
        self.state.lock().cursor
    }

    /// Points folded so far.
    pub fn applied(&self) -> u64 {
        self.state.lock().applied
    }

    /// Install a fold under `name`. Existing points are not replayed.
    pub fn add_fold(&self, name: &str, fold: impl Fold + 'static) {
        self.state.lock().folds.insert(name.to_string(), Box::new(fold));
    }

    /// Install min, max, last, mean, and jitter.
    pub fn add_standard_folds(&self) {
        self.add_fold("min", crate::fold::Min::default());
        self.add_fold("max", crate::fold::Max::default());
        self.add_fold("last", crate::fold::Last::default());
        self.add_fold("mean", crate::fold::Mean::default());
        self.add_fold("jitter", crate::fold::Jitter::default());
    }

    /// Fold points delivered by any source.
    pub fn ingest(&self, points: Vec<Point>) -> usize {
        let mut state = self.state.lock();
        if state.catching_up {
            state.backlog.extend(points);
            return 0;
        }
        state.ingest(points)
    }

    fn on_push(&self, data: &Value) {
        if data.get("mid").and_then(Value::as_str) != Some(self.mid.as_str()) {
            return;
        }
        let points: Vec<Point> = data
            .get("data")
            .cloned()
            .map(records)
            .unwrap_or_default()
            .iter()
            .filter_map(Point::from_value)
            .collect();
        self.ingest(points);
    }

    /// Attach the subscription and read everything after the cursor. Runs
    /// once; later calls return immediately.
    pub async fn catch_up(&self) -> Result<(), RuntimeError> {
        let mut done = self.caught_up.lock().await;
        if *done {
            return Ok(());
        }
        let Some(federation) = self.federation.clone() else {
            *done = true;
            return Ok(());
        };
        let client = federation.route(self.store.as_deref())?;
        self.state.lock().catching_up = true;
        if self.settings.subscribe {
            let weak = self.weak.clone();
            let subscribed = client.subscribe(
                &format!("{DATA_COLLECTION}/{}", self.mid),
                Arc::new(move |envelope: Envelope| {
                    if let Some(stream) = weak.upgrade() {
                        stream.on_push(&envelope.data);
                    }
                }),
            );
            if let Err(err) = subscribed {
                self.state.lock().catching_up = false;
                return Err(err.into());
            }
        }
        let cursor = self.cursor();
        let query = Query::new().ts_after(cursor).sort_ts_ascending();
        let fetched = client
            .get(&format!("{DATA_COLLECTION}/{}", self.mid), &query)
            .await;
        let mut state = self.state.lock();
        state.catching_up = false;
        let backlog = std::mem::take(&mut state.backlog);
        let body = match fetched {
            Ok(body) => body,
            Err(err) => {
                state.ingest(backlog);
                return Err(err.into());
            }
        };
        let points: Vec<Point> = records(body).iter().filter_map(Point::from_value).collect();
        let history = state.ingest(points);
        let live = state.ingest(backlog);
        debug!(mid = %self.mid, history, live, cursor = state.cursor, "data stream caught up");
        *done = true;
        Ok(())
    }

    /// Current value of one fold, catching up first.
    pub async fn fold(&self, name: &str) -> Result<Option<Value>, RuntimeError> {
        self.catch_up().await?;
        Ok(self.state.lock().folds.get(name).map(|f| f.value()))
    }

    /// Every fold value, catching up first.
    pub async fn folds(&self) -> Result<BTreeMap<String, Value>, RuntimeError> {
        self.catch_up().await?;
        Ok(self
            .state
            .lock()
            .folds
            .iter()
            .map(|(k, f)| (k.clone(), f.value()))
            .collect())
    }

    /// Record a locally measured value: fold it and buffer it for the store.
    ///
    /// The buffer is POSTed once it holds `measurements.batch_size` points or
    /// its oldest point is older than `measurements.batch_until` seconds.
    pub async fn append(&self, value: impl Into<Value>) -> Result<(), RuntimeError> {
        let ts = now_micros().max(self.cursor() + 1);
        let point = Point::new(ts, value);
        self.ingest(vec![point.clone()]);
        let due = {
            let mut out = self.outbound.lock();
            out.points.push(point);
            let oldest = *out.oldest.get_or_insert_with(Instant::now);
            out.points.len() >= self.settings.batch_size.max(1)
                || oldest.elapsed() >= Duration::from_secs(self.settings.batch_until)
        };
        if due {
            self.flush().await?;
        }
        Ok(())
    }

    /// Buffered points not yet POSTed.
    pub fn buffered(&self) -> usize {
        self.outbound.lock().points.len()
    }

    /// POST buffered points as `{mid, data: [...]}`. On failure the points
    /// are put back.
    pub async fn flush(&self) -> Result<usize, RuntimeError> {
        let points = {
            let mut out = self.outbound.lock();
            out.oldest = None;
            std::mem::take(&mut out.points)
        };
        if points.is_empty() {
            return Ok(0);
        }
        let Some(federation) = self.federation.clone() else {
            return Ok(0);
        };
        let body = json!({
            "mid": self.mid,
            "data": points.iter().map(Point::to_value).collect::<Vec<_>>(),
        });
        match federation
            .post(self.store.as_deref(), DATA_COLLECTION, &body)
            .await
        {
            Ok(_) => {
                info!(mid = %self.mid, points = points.len(), "data points published");
                Ok(points.len())
            }
            Err(err) => {
                warn!(mid = %self.mid, %err, "data publish failed");
                let mut out = self.outbound.lock();
                let mut restored = points;
                restored.append(&mut out.points);
                out.points = restored;
                out.oldest.get_or_insert_with(Instant::now);
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::fold::{Last, Max, Mean};

    #[tokio::test]
    async fn detached_stream_folds_in_order_once() {
        let stream = DataStream::detached("m1", MeasurementSettings::default());
        stream.add_fold("mean", Mean::default());
        stream.add_fold("last", Last::default());
        stream.ingest(vec![Point::new(3, 30), Point::new(1, 10), Point::new(2, 20)]);
        stream.ingest(vec![Point::new(2, 99)]);
        assert_eq!(stream.fold("mean").await.unwrap(), Some(json!(20.0)));
        assert_eq!(stream.fold("last").await.unwrap(), Some(json!(30)));
        assert_eq!(stream.fold("nope").await.unwrap(), None);
        assert_eq!(stream.applied(), 3);
        assert_eq!(stream.cursor(), 3);
    }

    #[tokio::test]
    async fn points_sharing_a_timestamp_are_all_folded() {
        let stream = DataStream::detached("m1", MeasurementSettings::default());
        stream.add_fold("mean", Mean::default());
        stream.add_fold("max", Max::default());
        assert_eq!(
            stream.ingest(vec![Point::new(5, 1.0), Point::new(5, 9.0), Point::new(6, 2.0)]),
            3
        );
        assert_eq!(stream.cursor(), 6);
        assert_eq!(stream.fold("mean").await.unwrap(), Some(json!(4.0)));
        assert_eq!(stream.fold("max").await.unwrap(), Some(json!(9.0)));

        assert_eq!(stream.ingest(vec![Point::new(6, 7.0), Point::new(7, 3.0)]), 1);
        assert_eq!(stream.applied(), 4);
        assert_eq!(stream.fold("mean").await.unwrap(), Some(json!(3.75)));
    }

    #[tokio::test]
    async fn history_off_starts_at_now() {
        let settings = MeasurementSettings {
            read_history: false,
            ..MeasurementSettings::default()
        };
        let stream = DataStream::detached("m1", settings);
        assert!(stream.cursor() > 0);
        stream.add_fold("last", Last::default());
        stream.ingest(vec![Point::new(1, 1)]);
        assert_eq!(stream.fold("last").await.unwrap(), Some(Value::Null));
    }

    #[test]
    fn pushes_for_other_metadata_are_ignored() {
        let stream = DataStream::detached("m1", MeasurementSettings::default());
        stream.add_fold("last", Last::default());
        stream.on_push(&json!({"mid": "m2", "data": [{"ts": 1, "value": 5}]}));
        stream.on_push(&json!({"mid": "m1", "data": [{"ts": 2, "value": 6}]}));
        assert_eq!(stream.applied(), 1);
    }
}
