// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
use nre_runtime::RuntimeError;
use thiserror::Error;

/// Errors raised while scheduling measurements.
#[derive(Debug, Error)]
pub enum SchedError {
    /// Runtime operation failed.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    /// A collection the scheduler reads was not discovered.
    #[error("collection `{0}` is not available")]
    MissingCollection(String),
    /// A measurement's slots do not fit the calendar.
    #[error("slots for color {color} (every {every}s, duration {duration}s) overflow the calendar")]
    SlotOverflow {
        /// Assigned color.
        color: usize,
        /// Period in seconds.
        every: i64,
        /// Test length in seconds.
        duration: i64,
    },
}
