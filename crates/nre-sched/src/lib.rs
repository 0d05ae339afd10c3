// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Conflict-free measurement scheduling.
//!
//! Measurements that stress a common resource (an L2 port on their path)
//! must not run at the same time. A batch is turned into a
//! [`ConflictGraph`], colored along a smallest-last ordering, and each color
//! becomes a time offset inside the measurement period.
#![forbid(unsafe_code)]

mod error;
mod graph;
mod plan;
mod registry;
mod service;
mod slots;

pub use error::SchedError;
pub use graph::ConflictGraph;
pub use plan::{plan, Assignment, Request};
pub use registry::{ResourceRegistry, Scheduled};
pub use service::{resources_for, MeasurementScheduler};
pub use slots::{slots, ScheduleParams, Slot, PICKUP_GAP_SECS};
