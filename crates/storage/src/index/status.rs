#![forbid(unsafe_code)]

use ns_core::ids::JobId;
use ns_core::{IdSet, JobStatus};

/// Status -> ids. A job id lives in exactly one set.
#[derive(Clone, Debug, Default)]
pub struct StatusIndex {
    sets: [IdSet; 8],
}

fn slot(status: JobStatus) -> usize {
    // A returned job is live in Pending.
    status
        .index()
        .or_else(|| JobStatus::Pending.index())
        .unwrap_or(0)
}

impl StatusIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status_of(&self, id: JobId) -> Option<JobStatus> {
        JobStatus::INDEXED
            .iter()
            .zip(self.sets.iter())
            .find(|(_, set)| set.contains(id))
            .map(|(status, _)| *status)
    }

    pub fn set(&self, status: JobStatus) -> &IdSet {
        &self.sets[slot(status)]
    }

    pub fn count(&self, status: JobStatus) -> u64 {
        self.set(status).len()
    }

    pub fn is_empty(&self, status: JobStatus) -> bool {
        self.set(status).is_empty()
    }

    pub fn all_jobs(&self) -> IdSet {
        let mut all = IdSet::new();
        for set in &self.sets {
            all.union_with(set);
        }
        all
    }

    /// Places `id` under `status`, dropping it from any other set.
    pub fn force(&mut self, id: JobId, status: JobStatus) {
        let target = slot(status);
        for (idx, set) in self.sets.iter_mut().enumerate() {
            if idx == target {
                set.insert(id);
            } else {
                set.remove(id);
            }
        }
    }

    /// Inserts a freshly submitted range.
    pub fn add_range(&mut self, lo: JobId, hi: JobId, status: JobStatus) {
        self.sets[slot(status)].insert_range(lo, hi);
    }

    /// Guarded move: applied only when `id` is still under `from`.
    /// On mismatch returns the status actually observed.
    pub fn change(
        &mut self,
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<(), Option<JobStatus>> {
        let from_slot = slot(from);
        if !self.sets[from_slot].contains(id) {
            return Err(self.status_of(id));
        }
        self.sets[from_slot].remove(id);
        self.sets[slot(to)].insert(id);
        Ok(())
    }

    /// Removes `id` from whichever set holds it.
    pub fn erase(&mut self, id: JobId) -> Option<JobStatus> {
        let mut found = None;
        for (status, set) in JobStatus::INDEXED.iter().zip(self.sets.iter_mut()) {
            if set.remove(id) {
                found = Some(*status);
            }
        }
        found
    }

    pub fn optimize(&mut self) {
        for set in &mut self.sets {
            set.optimize();
        }
    }

    pub fn memory_bytes(&self) -> usize {
        self.sets.iter().map(IdSet::memory_bytes).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guarded_change_rejects_stale_source() {
        let mut index = StatusIndex::new();
        index.add_range(1, 3, JobStatus::Pending);
        assert_eq!(index.change(2, JobStatus::Pending, JobStatus::Running), Ok(()));
        assert_eq!(
            index.change(2, JobStatus::Pending, JobStatus::Done),
            Err(Some(JobStatus::Running))
        );
        assert_eq!(index.status_of(2), Some(JobStatus::Running));
        assert_eq!(index.count(JobStatus::Pending), 2);
        assert_eq!(index.change(9, JobStatus::Pending, JobStatus::Running), Err(None));
    }

    #[test]
    fn force_and_erase_keep_exclusivity() {
        let mut index = StatusIndex::new();
        index.force(5, JobStatus::Done);
        index.force(5, JobStatus::Returned);
        assert_eq!(index.status_of(5), Some(JobStatus::Pending));
        assert_eq!(index.count(JobStatus::Done), 0);
        assert_eq!(index.erase(5), Some(JobStatus::Pending));
        assert_eq!(index.erase(5), None);
        assert!(index.all_jobs().is_empty());
    }
}
