// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Batch planning: pull in conflicting measurements, color, slot.

use std::collections::{BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::graph::ConflictGraph;
use crate::registry::{ResourceRegistry, Scheduled};
use crate::slots::{slots, ScheduleParams, Slot};

/// A measurement to schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Measurement id.
    pub id: String,
    /// Resources it stresses.
    pub resources: BTreeSet<String>,
    /// Its schedule parameters.
    pub params: ScheduleParams,
}

/// The outcome for one measurement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// Measurement id.
    pub id: String,
    /// Assigned color.
    pub color: usize,
    /// Reserved intervals, one per repeat.
    pub slots: Vec<Slot>,
    /// `true` for a previously scheduled measurement rescheduled because it
    /// shares a resource with the batch.
    pub pulled_in: bool,
}

/// Schedule `batch` starting at `now`.
///
/// Previously scheduled measurements sharing a resource with the batch
/// (directly or through another pulled-in measurement) join it. Every
/// vertex is colored and slotted, and the registry is updated. A
/// measurement whose slots cannot be computed is left out of the result
/// and the registry.
pub fn plan(registry: &mut ResourceRegistry, batch: Vec<Request>, now: DateTime<Utc>) -> Vec<Assignment> {
    let mut vertices: Vec<(Request, bool)> = Vec::with_capacity(batch.len());
    let mut members: BTreeSet<String> = BTreeSet::new();
    for request in batch {
        if members.insert(request.id.clone()) {
            vertices.push((request, false));
        }
    }

    let mut frontier: VecDeque<String> = vertices
        .iter()
        .flat_map(|(r, _)| r.resources.iter().cloned())
        .collect();
    let mut seen: BTreeSet<String> = frontier.iter().cloned().collect();
    while let Some(resource) = frontier.pop_front() {
        let users: Vec<String> = registry.users(&resource).map(str::to_string).collect();
        for id in users {
            if members.contains(&id) {
                continue;
            }
            let Some(held) = registry.get(&id) else {
                continue;
            };
            for r in &held.resources {
                if seen.insert(r.clone()) {
                    frontier.push_back(r.clone());
                }
            }
            members.insert(id.clone());
            vertices.push((
                Request {
                    id,
                    resources: held.resources.clone(),
                    params: held.params,
                },
                true,
            ));
        }
    }

    let graph = ConflictGraph::build(
        vertices
            .iter()
            .map(|(r, _)| (r.id.as_str(), &r.resources)),
    );
    let colors = graph.color();
    let used = colors.iter().max().map_or(0, |c| c + 1);
    info!(
        vertices = graph.len(),
        edges = graph.edges(),
        colors = used,
        "measurements scheduled"
    );

    vertices
        .into_iter()
        .zip(colors)
        .filter_map(|((request, pulled_in), color)| {
            let slots = match slots(now, color, &request.params) {
                Ok(slots) => slots,
                Err(err) => {
                    warn!(id = %request.id, %err, "measurement not scheduled");
                    registry.forget(&request.id);
                    return None;
                }
            };
            registry.register(
                &request.id,
                Scheduled {
                    resources: request.resources,
                    params: request.params,
                    color,
                },
            );
            Some(Assignment {
                slots,
                id: request.id,
                color,
                pulled_in,
            })
        })
        .collect()
}
