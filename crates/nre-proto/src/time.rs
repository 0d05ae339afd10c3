// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Store timestamps: integer microseconds on records, ISO-8601 seconds on
//! schedules.

use chrono::{DateTime, NaiveDateTime, Utc};

/// `strftime` pattern used for schedule slots.
pub const STORE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Wall-clock microseconds since the Unix epoch.
pub fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

/// Format microseconds as `YYYY-MM-DDTHH:MM:SSZ` (sub-second part dropped).
pub fn micros_to_iso(micros: i64) -> String {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .unwrap_or_default()
        .format(STORE_TIME_FORMAT)
        .to_string()
}

/// Parse `YYYY-MM-DDTHH:MM:SSZ` back into microseconds.
pub fn iso_to_micros(text: &str) -> Option<i64> {
    NaiveDateTime::parse_from_str(text, STORE_TIME_FORMAT)
        .ok()
        .map(|t| t.and_utc().timestamp_micros())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso_format_is_second_precision_utc() {
        assert_eq!(micros_to_iso(0), "1970-01-01T00:00:00Z");
        assert_eq!(micros_to_iso(1_500_000), "1970-01-01T00:00:01Z");
        assert_eq!(iso_to_micros("1970-01-01T00:02:00Z"), Some(120_000_000));
        assert_eq!(iso_to_micros("yesterday"), None);
    }
}
