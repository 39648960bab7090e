#![forbid(unsafe_code)]

use ns_core::IdSet;
use ns_core::ids::JobId;
use std::collections::HashMap;

/// key -> value -> job ids, mirrored by job -> tags for removal.
#[derive(Clone, Debug, Default)]
pub struct TagIndex {
    values: HashMap<String, HashMap<String, IdSet>>,
    by_job: HashMap<JobId, Vec<(String, String)>>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: JobId, tags: &[(String, String)]) {
        if tags.is_empty() {
            return;
        }
        for (key, value) in tags {
            self.values
                .entry(key.clone())
                .or_default()
                .entry(value.clone())
                .or_default()
                .insert(id);
        }
        self.by_job.entry(id).or_default().extend(tags.iter().cloned());
    }

    pub fn remove(&mut self, id: JobId) {
        let Some(tags) = self.by_job.remove(&id) else {
            return;
        };
        for (key, value) in tags {
            let Some(values) = self.values.get_mut(&key) else {
                continue;
            };
            if let Some(set) = values.get_mut(&value) {
                set.remove(id);
                if set.is_empty() {
                    values.remove(&value);
                }
            }
            if values.is_empty() {
                self.values.remove(&key);
            }
        }
    }

    pub fn jobs_with(&self, key: &str, value: &str) -> IdSet {
        self.values
            .get(key)
            .and_then(|values| values.get(value))
            .cloned()
            .unwrap_or_default()
    }

    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.values.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(key: &str, value: &str) -> (String, String) {
        (key.to_string(), value.to_string())
    }

    #[test]
    fn insert_lookup_remove() {
        let mut index = TagIndex::new();
        index.insert(1, &[tag("color", "red"), tag("size", "xl")]);
        index.insert(2, &[tag("color", "red")]);
        assert_eq!(index.jobs_with("color", "red").iter().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(index.keys(), vec!["color", "size"]);

        index.remove(1);
        assert_eq!(index.jobs_with("color", "red").iter().collect::<Vec<_>>(), vec![2]);
        assert!(index.jobs_with("size", "xl").is_empty());
        assert_eq!(index.keys(), vec!["color"]);
    }
}
