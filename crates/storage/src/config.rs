#![forbid(unsafe_code)]

use crate::error::QueueError;
use crate::retry::RetryPolicy;
use ns_core::ids::validate_name;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Tunables shared by every queue of one class.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueParams {
    /// Retention of a job counted from submission, in seconds.
    pub timeout_s: u64,
    /// Dispatch-to-completion deadline; 0 disables the watcher for the job.
    pub run_timeout_s: u64,
    pub read_timeout_s: u64,
    pub failed_retries: u32,
    pub read_failed_retries: u32,
    pub max_input_size: usize,
    pub max_output_size: usize,
    pub delete_on_done: bool,
    pub subm_hosts: Vec<String>,
    pub wnode_hosts: Vec<String>,
    pub reader_hosts: Vec<String>,
    pub log_job_state: bool,
    pub description: String,
}

impl Default for QueueParams {
    fn default() -> Self {
        Self {
            timeout_s: 3600,
            run_timeout_s: 600,
            read_timeout_s: 600,
            failed_retries: 0,
            read_failed_retries: 0,
            max_input_size: 2048,
            max_output_size: 2048,
            delete_on_done: false,
            subm_hosts: Vec::new(),
            wnode_hosts: Vec::new(),
            reader_hosts: Vec::new(),
            log_job_state: false,
            description: String::new(),
        }
    }
}

impl QueueParams {
    /// Applies `overrides` (field name -> value) on top of these params.
    pub fn merged(
        &self,
        overrides: &BTreeMap<String, serde_json::Value>,
    ) -> Result<Self, QueueError> {
        if overrides.is_empty() {
            return Ok(self.clone());
        }
        let mut value = serde_json::to_value(self)?;
        let Some(fields) = value.as_object_mut() else {
            return Err(QueueError::Config("queue params must be a mapping".into()));
        };
        for (key, override_value) in overrides {
            if !fields.contains_key(key) {
                return Err(QueueError::Config(format!("unknown queue parameter '{key}'")));
            }
            fields.insert(key.clone(), override_value.clone());
        }
        Ok(serde_json::from_value(value)?)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueDecl {
    pub class: Option<String>,
    pub comment: String,
    pub overrides: BTreeMap<String, serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PurgeConfig {
    pub interval_ms: u64,
    pub batch_size: usize,
    /// Compact in-memory indices every N purge passes.
    pub optimize_every: u32,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            batch_size: 100,
            optimize_every: 10,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub interval_ms: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub max_queues: usize,
    pub purge: PurgeConfig,
    pub notify: LoopConfig,
    pub watcher: LoopConfig,
    pub affinity_grace_s: u64,
    pub stop_on_error: bool,
    pub retry: RetryPolicy,
    pub queue_classes: BTreeMap<String, QueueParams>,
    pub queues: BTreeMap<String, QueueDecl>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_queues: 16,
            purge: PurgeConfig::default(),
            notify: LoopConfig::default(),
            watcher: LoopConfig { interval_ms: 500 },
            affinity_grace_s: 300,
            stop_on_error: false,
            retry: RetryPolicy::default(),
            queue_classes: BTreeMap::new(),
            queues: BTreeMap::new(),
        }
    }
}

impl RegistryConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self, QueueError> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.max_queues == 0 {
            return Err(QueueError::Config("max_queues must be positive".into()));
        }
        if self.queues.len() > self.max_queues {
            return Err(QueueError::Config(format!(
                "{} static queues configured but max_queues is {}",
                self.queues.len(),
                self.max_queues
            )));
        }
        for name in self.queue_classes.keys() {
            validate_name(name)
                .map_err(|err| QueueError::Config(format!("queue class '{name}': {err}")))?;
        }
        for name in self.queues.keys() {
            validate_name(name)
                .map_err(|err| QueueError::Config(format!("queue '{name}': {err}")))?;
            self.static_params(name)?;
        }
        Ok(())
    }

    pub fn class_params(&self, class: Option<&str>) -> Result<QueueParams, QueueError> {
        match class {
            None => Ok(QueueParams::default()),
            Some(class) => self
                .queue_classes
                .get(class)
                .cloned()
                .ok_or_else(|| QueueError::UnknownQueueClass(class.to_string())),
        }
    }

    /// Effective params of a static queue: its class merged with overrides.
    pub fn static_params(&self, name: &str) -> Result<QueueParams, QueueError> {
        let decl = self
            .queues
            .get(name)
            .ok_or_else(|| QueueError::UnknownQueue(name.to_string()))?;
        self.class_params(decl.class.as_deref())?
            .merged(&decl.overrides)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
max_queues: 4
watcher: { interval_ms: 250 }
queue_classes:
  fast:
    timeout_s: 60
    run_timeout_s: 10
    failed_retries: 2
queues:
  blast:
    class: fast
    overrides: { max_input_size: 4096, log_job_state: true }
  plain: {}
"#;

    #[test]
    fn yaml_classes_merge_with_overrides() {
        let config = RegistryConfig::from_yaml_str(SAMPLE).expect("parse");
        assert_eq!(config.max_queues, 4);
        assert_eq!(config.watcher.interval_ms, 250);
        assert_eq!(config.purge, PurgeConfig::default());

        let blast = config.static_params("blast").expect("blast");
        assert_eq!(blast.timeout_s, 60);
        assert_eq!(blast.run_timeout_s, 10);
        assert_eq!(blast.failed_retries, 2);
        assert_eq!(blast.max_input_size, 4096);
        assert!(blast.log_job_state);

        let plain = config.static_params("plain").expect("plain");
        assert_eq!(plain, QueueParams::default());
    }

    #[test]
    fn unknown_class_and_field_are_rejected() {
        let err = RegistryConfig::from_yaml_str("queues: { q: { class: nope } }").unwrap_err();
        assert!(matches!(err, QueueError::UnknownQueueClass(name) if name == "nope"));

        let err = RegistryConfig::from_yaml_str("queues: { q: { overrides: { bogus: 1 } } }")
            .unwrap_err();
        assert!(matches!(err, QueueError::Config(_)));
    }

    #[test]
    fn too_many_static_queues() {
        let err =
            RegistryConfig::from_yaml_str("max_queues: 1\nqueues: { a: {}, b: {} }").unwrap_err();
        assert!(matches!(err, QueueError::Config(_)));
    }
}
