#![forbid(unsafe_code)]

use ns_core::IdSet;
use ns_core::ids::JobId;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Clone, Debug)]
struct AffinityEntry {
    token: String,
    jobs: IdSet,
    workers: BTreeSet<String>,
    touched_ms: i64,
}

/// Token <-> id bijection plus the jobs and workers attached to each id.
#[derive(Clone, Debug, Default)]
pub struct AffinityRegistry {
    by_token: HashMap<String, u32>,
    entries: BTreeMap<u32, AffinityEntry>,
}

impl AffinityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn resolve(&self, token: &str) -> Option<u32> {
        self.by_token.get(token).copied()
    }

    pub fn token(&self, id: u32) -> Option<&str> {
        self.entries.get(&id).map(|entry| entry.token.as_str())
    }

    pub fn register(&mut self, id: u32, token: &str, now_ms: i64) {
        self.by_token.insert(token.to_string(), id);
        self.entries.entry(id).or_insert_with(|| AffinityEntry {
            token: token.to_string(),
            jobs: IdSet::new(),
            workers: BTreeSet::new(),
            touched_ms: now_ms,
        });
    }

    pub fn add_jobs(&mut self, id: u32, jobs: &IdSet, now_ms: i64) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.jobs.union_with(jobs);
            entry.touched_ms = now_ms;
        }
    }

    pub fn remove_job(&mut self, id: u32, job_id: JobId, now_ms: i64) {
        if let Some(entry) = self.entries.get_mut(&id) {
            if entry.jobs.remove(job_id) {
                entry.touched_ms = now_ms;
            }
        }
    }

    pub fn jobs(&self, id: u32) -> Option<&IdSet> {
        self.entries.get(&id).map(|entry| &entry.jobs)
    }

    pub fn pin_worker(&mut self, id: u32, worker: &str, now_ms: i64) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.workers.insert(worker.to_string());
            entry.touched_ms = now_ms;
        }
    }

    /// Unpins `worker` everywhere; returns the affinity ids it was pinned to.
    pub fn unpin_worker(&mut self, worker: &str) -> Vec<u32> {
        let mut unpinned = Vec::new();
        for (id, entry) in &mut self.entries {
            if entry.workers.remove(worker) {
                unpinned.push(*id);
            }
        }
        unpinned
    }

    pub fn workers(&self, id: u32) -> Vec<&str> {
        self.entries
            .get(&id)
            .map(|entry| entry.workers.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Ids whose job set is empty and which were last touched before
    /// `now_ms - grace_ms`.
    pub fn retirable(&self, now_ms: i64, grace_ms: i64) -> Vec<u32> {
        let cutoff = now_ms.saturating_sub(grace_ms);
        self.entries
            .iter()
            .filter(|(_, entry)| entry.jobs.is_empty() && entry.touched_ms <= cutoff)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn retire(&mut self, id: u32) {
        if let Some(entry) = self.entries.remove(&id) {
            self.by_token.remove(&entry.token);
        }
    }

    /// Drops job ids that no longer exist in `live`.
    pub fn prune_jobs(&mut self, live: &IdSet) {
        for entry in self.entries.values_mut() {
            entry.jobs.intersect_with(live);
            entry.jobs.optimize();
        }
    }

    pub fn memory_bytes(&self) -> usize {
        self.entries
            .values()
            .map(|entry| entry.jobs.memory_bytes() + entry.token.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retirement_needs_empty_jobs_and_grace() {
        let mut registry = AffinityRegistry::new();
        registry.register(1, "A", 1_000);
        registry.register(2, "B", 1_000);
        registry.add_jobs(1, &IdSet::from_range(10, 12), 1_000);

        assert!(registry.retirable(1_500, 1_000).is_empty());
        assert_eq!(registry.retirable(2_000, 1_000), vec![2]);

        registry.remove_job(1, 10, 3_000);
        registry.prune_jobs(&IdSet::new());
        assert_eq!(registry.jobs(1).map(IdSet::len), Some(0));
        assert_eq!(registry.retirable(3_500, 1_000), vec![2]);
        assert_eq!(registry.retirable(4_000, 1_000), vec![1, 2]);

        registry.retire(1);
        assert_eq!(registry.resolve("A"), None);
        assert_eq!(registry.resolve("B"), Some(2));
    }

    #[test]
    fn workers_pin_and_unpin() {
        let mut registry = AffinityRegistry::new();
        registry.register(1, "A", 0);
        registry.register(2, "B", 0);
        registry.pin_worker(1, "w1", 0);
        registry.pin_worker(2, "w1", 0);
        registry.pin_worker(2, "w2", 0);
        assert_eq!(registry.workers(2), vec!["w1", "w2"]);
        assert_eq!(registry.unpin_worker("w1"), vec![1, 2]);
        assert_eq!(registry.workers(2), vec!["w2"]);
    }
}
