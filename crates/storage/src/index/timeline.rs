#![forbid(unsafe_code)]

use ns_core::ids::JobId;
use std::collections::{BTreeSet, HashMap};

/// Run deadlines of active jobs, ordered by time. At most one entry per job.
#[derive(Clone, Debug, Default)]
pub struct ExecutionTimeline {
    by_deadline: BTreeSet<(i64, JobId)>,
    by_job: HashMap<JobId, i64>,
}

impl ExecutionTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_job.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_job.is_empty()
    }

    pub fn deadline(&self, id: JobId) -> Option<i64> {
        self.by_job.get(&id).copied()
    }

    /// Sets (or moves) the deadline of `id`.
    pub fn insert(&mut self, id: JobId, at_ms: i64) {
        if let Some(previous) = self.by_job.insert(id, at_ms) {
            self.by_deadline.remove(&(previous, id));
        }
        self.by_deadline.insert((at_ms, id));
    }

    pub fn remove(&mut self, id: JobId) -> Option<i64> {
        let previous = self.by_job.remove(&id)?;
        self.by_deadline.remove(&(previous, id));
        Some(previous)
    }

    /// Jobs whose deadline is at or before `now_ms`, earliest first. Entries
    /// stay in place until the owner removes them.
    pub fn due(&self, now_ms: i64) -> Vec<JobId> {
        self.by_deadline
            .range(..=(now_ms, JobId::MAX))
            .map(|(_, id)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_respects_moves_and_removals() {
        let mut timeline = ExecutionTimeline::new();
        timeline.insert(1, 100);
        timeline.insert(2, 50);
        timeline.insert(3, 200);
        assert_eq!(timeline.due(100), vec![2, 1]);

        timeline.insert(1, 300);
        assert_eq!(timeline.due(100), vec![2]);
        assert_eq!(timeline.deadline(1), Some(300));

        assert_eq!(timeline.remove(2), Some(50));
        assert_eq!(timeline.remove(2), None);
        assert_eq!(timeline.due(250), vec![3]);
        assert_eq!(timeline.len(), 2);
    }
}
