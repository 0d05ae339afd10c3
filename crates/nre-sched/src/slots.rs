// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Mapping colors to time slots.

use chrono::{DateTime, TimeDelta, Utc};
use nre_proto::STORE_TIME_FORMAT;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::SchedError;

/// Seconds added to the wall clock so remote agents can pick the schedule
/// up before the first slot.
pub const PICKUP_GAP_SECS: i64 = 600;

/// A measurement's `schedule_params` block. Durations in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleParams {
    /// Period between repeats.
    pub every: i64,
    /// Length of one test.
    pub duration: i64,
    /// Number of repeats.
    pub num_tests: u32,
}

impl ScheduleParams {
    /// Read `{every, duration, num_tests}`; `None` when malformed or when
    /// `every`/`duration` are not positive.
    pub fn from_value(value: &Value) -> Option<Self> {
        let params: Self = serde_json::from_value(value.clone()).ok()?;
        (params.every > 0 && params.duration > 0).then_some(params)
    }
}

/// One reserved interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end.
    pub end: DateTime<Utc>,
}

impl Slot {
    /// `true` when the intervals share any instant.
    pub fn overlaps(&self, other: &Slot) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// `{"start": .., "end": ..}` in the store time format.
    pub fn to_value(&self) -> Value {
        json!({
            "start": self.start.format(STORE_TIME_FORMAT).to_string(),
            "end": self.end.format(STORE_TIME_FORMAT).to_string(),
        })
    }
}

/// Slots for a measurement colored `color`, starting from `now`:
/// `start = now + color * duration + r * every` for every repeat `r`.
///
/// Fails with [`SchedError::SlotOverflow`] when a slot falls outside the
/// representable calendar.
pub fn slots(now: DateTime<Utc>, color: usize, params: &ScheduleParams) -> Result<Vec<Slot>, SchedError> {
    let overflow = || SchedError::SlotOverflow {
        color,
        every: params.every,
        duration: params.duration,
    };
    let offset = i64::try_from(color)
        .ok()
        .and_then(|c| params.duration.checked_mul(c))
        .ok_or_else(overflow)?;
    let length = TimeDelta::try_seconds(params.duration).ok_or_else(overflow)?;
    (0..i64::from(params.num_tests))
        .map(|r| {
            let start = r
                .checked_mul(params.every)
                .and_then(|s| s.checked_add(offset))
                .and_then(TimeDelta::try_seconds)
                .and_then(|delta| now.checked_add_signed(delta))
                .ok_or_else(overflow)?;
            let end = start.checked_add_signed(length).ok_or_else(overflow)?;
            Ok(Slot { start, end })
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn slots_repeat_every_period_after_the_color_offset() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let params = ScheduleParams {
            every: 120,
            duration: 10,
            num_tests: 2,
        };
        let got: Vec<Value> = slots(now, 1, &params).unwrap().iter().map(Slot::to_value).collect();
        assert_eq!(
            got,
            vec![
                json!({"start": "2023-11-14T22:13:30Z", "end": "2023-11-14T22:13:40Z"}),
                json!({"start": "2023-11-14T22:15:30Z", "end": "2023-11-14T22:15:40Z"}),
            ]
        );
    }

    #[test]
    fn slots_past_the_calendar_are_refused() {
        let epoch = DateTime::from_timestamp(0, 0).unwrap();
        let huge_period = ScheduleParams {
            every: 100_000_000_000_000_000,
            duration: 10,
            num_tests: 2,
        };
        assert!(matches!(
            slots(epoch, 0, &huge_period),
            Err(SchedError::SlotOverflow { color: 0, .. })
        ));
        let huge_offset = ScheduleParams {
            every: 10,
            duration: i64::MAX / 2,
            num_tests: 1,
        };
        assert!(slots(epoch, 3, &huge_offset).is_err());
        assert!(slots(epoch, 0, &ScheduleParams { num_tests: 0, ..huge_period }).unwrap().is_empty());
    }

    #[test]
    fn params_must_be_positive() {
        assert!(ScheduleParams::from_value(&json!({"every": 0, "duration": 1, "num_tests": 1})).is_none());
        assert!(ScheduleParams::from_value(&json!({"every": 5})).is_none());
        assert_eq!(
            ScheduleParams::from_value(&json!({"every": 5, "duration": 1, "num_tests": 3})),
            Some(ScheduleParams {
                every: 5,
                duration: 1,
                num_tests: 3
            })
        );
    }
}
