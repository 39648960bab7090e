#![forbid(unsafe_code)]

use super::RegistryInner;
use crate::config::RegistryConfig;
use crate::error::QueueError;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info};

pub(crate) type IntervalFn = fn(&RegistryConfig) -> u64;
pub(crate) type PassFn = fn(&RegistryInner, &StopSignal) -> Result<usize, QueueError>;

/// Cooperative stop flag; loops check it between batches and while
/// sleeping.
#[derive(Debug, Default)]
pub(crate) struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn stop(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
    }

    pub(crate) fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleeps up to `timeout`; returns true once stopped.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.wake.wait_for(&mut stopped, timeout);
        }
        *stopped
    }
}

pub(crate) struct BackgroundLoop {
    name: &'static str,
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundLoop {
    pub(crate) fn spawn(
        name: &'static str,
        inner: Arc<RegistryInner>,
        interval: IntervalFn,
        pass: PassFn,
    ) -> Result<Self, QueueError> {
        let signal = Arc::new(StopSignal::new());
        let thread_signal = Arc::clone(&signal);
        let handle = std::thread::Builder::new()
            .name(format!("ns-{name}"))
            .spawn(move || run(name, &inner, &thread_signal, interval, pass))?;
        Ok(Self {
            name,
            signal,
            handle: Some(handle),
        })
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn stop(&mut self) {
        self.signal.stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(task = self.name, "background loop panicked");
            }
        }
    }
}

impl Drop for BackgroundLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    name: &'static str,
    inner: &RegistryInner,
    signal: &StopSignal,
    interval: IntervalFn,
    pass: PassFn,
) {
    info!(task = name, "background loop started");
    loop {
        // Re-read every round so a reconfigure takes effect without restart.
        let interval_ms = interval(&inner.config.read()).max(1);
        if signal.wait(Duration::from_millis(interval_ms)) {
            break;
        }
        if let Err(err) = pass(inner, signal) {
            error!(task = name, error = %err, "background pass failed");
            if inner.config.read().stop_on_error {
                error!(task = name, "stopping background loop after error");
                break;
            }
        }
    }
    info!(task = name, "background loop stopped");
}
