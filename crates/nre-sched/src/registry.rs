// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Which scheduled measurements stress which resources.

use std::collections::{BTreeMap, BTreeSet};

use crate::slots::ScheduleParams;

/// A measurement already holding slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scheduled {
    /// Resources the measurement stresses.
    pub resources: BTreeSet<String>,
    /// Its schedule parameters.
    pub params: ScheduleParams,
    /// Color it was assigned.
    pub color: usize,
}

/// `resource → measurement ids`, plus what each measurement holds.
#[derive(Debug, Clone, Default)]
pub struct ResourceRegistry {
    by_resource: BTreeMap<String, BTreeSet<String>>,
    scheduled: BTreeMap<String, Scheduled>,
}

impl ResourceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of scheduled measurements.
    pub fn len(&self) -> usize {
        self.scheduled.len()
    }

    /// `true` when nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty()
    }

    /// Record `id` on every resource it stresses, replacing any earlier
    /// registration.
    pub fn register(&mut self, id: &str, entry: Scheduled) {
        self.forget(id);
        for resource in &entry.resources {
            self.by_resource
                .entry(resource.clone())
                .or_default()
                .insert(id.to_string());
        }
        self.scheduled.insert(id.to_string(), entry);
    }

    /// Drop `id`. Returns its registration.
    pub fn forget(&mut self, id: &str) -> Option<Scheduled> {
        let entry = self.scheduled.remove(id)?;
        for resource in &entry.resources {
            if let Some(users) = self.by_resource.get_mut(resource) {
                users.remove(id);
                if users.is_empty() {
                    self.by_resource.remove(resource);
                }
            }
        }
        Some(entry)
    }

    /// Registration of `id`.
    pub fn get(&self, id: &str) -> Option<&Scheduled> {
        self.scheduled.get(id)
    }

    /// Measurements stressing `resource`.
    pub fn users(&self, resource: &str) -> impl Iterator<Item = &str> {
        self.by_resource
            .get(resource)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(resources: &[&str]) -> Scheduled {
        Scheduled {
            resources: resources.iter().map(|r| (*r).to_string()).collect(),
            params: ScheduleParams {
                every: 60,
                duration: 5,
                num_tests: 1,
            },
            color: 0,
        }
    }

    #[test]
    fn reregistering_moves_resources() {
        let mut reg = ResourceRegistry::new();
        reg.register("m1", entry(&["p1", "p2"]));
        reg.register("m2", entry(&["p2"]));
        assert_eq!(reg.users("p2").collect::<Vec<_>>(), vec!["m1", "m2"]);

        reg.register("m1", entry(&["p3"]));
        assert_eq!(reg.users("p1").count(), 0);
        assert_eq!(reg.users("p2").collect::<Vec<_>>(), vec!["m2"]);
        assert_eq!(reg.users("p3").collect::<Vec<_>>(), vec!["m1"]);
        assert_eq!(reg.len(), 2);

        assert!(reg.forget("m2").is_some());
        assert!(reg.forget("m2").is_none());
        assert_eq!(reg.users("p2").count(), 0);
    }
}
