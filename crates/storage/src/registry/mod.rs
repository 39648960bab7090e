#![forbid(unsafe_code)]

//! The set of mounted queues over a fixed pool of block files, plus the
//! purge, notify and execution-watcher loops.
//!
//! Background passes take a snapshot of the mounted queues and release the
//! registry lock before touching any of them, so deleting a queue never
//! waits for a pass. A pass that still holds a deleted queue gets
//! `UnknownQueue` from it and moves on.

mod admin;
mod loops;

use crate::clock::{Clock, SystemClock, secs_to_ms};
use crate::config::{PurgeConfig, QueueParams, RegistryConfig};
use crate::error::QueueError;
use crate::listener::{JobEventListener, NoopListener};
use crate::queue::{Queue, QueueDescriptor, QueueKind, Tuning};
use crate::schema;
use admin::AdminRow;
use loops::{BackgroundLoop, StopSignal};
use ns_core::JobStatus;
use ns_core::ids::validate_name;
use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

const ADMIN_FILE: &str = "admin.db";

fn block_path(dir: &Path, position: usize) -> PathBuf {
    dir.join(format!("block_{position:03}.db"))
}

fn tuning_of(config: &RegistryConfig) -> Tuning {
    Tuning {
        retry: config.retry,
        affinity_grace_ms: secs_to_ms(config.affinity_grace_s),
    }
}

#[derive(Debug)]
struct SlotPool {
    capacity: usize,
    free: BTreeSet<usize>,
}

pub(crate) struct RegistryInner {
    dir: PathBuf,
    admin: Mutex<Connection>,
    config: RwLock<RegistryConfig>,
    queues: RwLock<BTreeMap<String, Arc<Queue>>>,
    slots: Mutex<SlotPool>,
    clock: Arc<dyn Clock>,
    listener: Arc<dyn JobEventListener>,
    purge_passes: AtomicU64,
}

pub struct QueueRegistry {
    inner: Arc<RegistryInner>,
    loops: Mutex<Vec<BackgroundLoop>>,
}

impl std::fmt::Debug for QueueRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRegistry")
            .field("dir", &self.inner.dir)
            .field("queues", &self.queue_names())
            .finish_non_exhaustive()
    }
}

impl QueueRegistry {
    pub fn open(dir: impl AsRef<Path>, config: RegistryConfig) -> Result<Self, QueueError> {
        Self::open_with(
            dir,
            config,
            Arc::new(SystemClock),
            Arc::new(NoopListener),
        )
    }

    /// Opens (or creates) the registry directory, mounts every queue
    /// recorded in `admin.db` and adds static queues new to `config`.
    pub fn open_with(
        dir: impl AsRef<Path>,
        config: RegistryConfig,
        clock: Arc<dyn Clock>,
        listener: Arc<dyn JobEventListener>,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let admin = schema::open_admin(&dir.join(ADMIN_FILE))?;
        let rows = admin::load(&admin)?;

        let stored_capacity = rows
            .iter()
            .map(|row| row.descr.position + 1)
            .max()
            .unwrap_or(0);
        if stored_capacity > config.max_queues {
            warn!(
                max_queues = config.max_queues,
                in_use = stored_capacity,
                "stored queues occupy slots beyond max_queues; keeping the larger pool"
            );
        }
        let capacity = stored_capacity.max(config.max_queues);
        for position in 0..capacity {
            drop(schema::open_block(&block_path(&dir, position))?);
        }

        let inner = Arc::new(RegistryInner {
            dir,
            admin: Mutex::new(admin),
            config: RwLock::new(config.clone()),
            queues: RwLock::new(BTreeMap::new()),
            slots: Mutex::new(SlotPool {
                capacity,
                free: (0..capacity).collect(),
            }),
            clock,
            listener,
            purge_passes: AtomicU64::new(0),
        });

        {
            let mut queues = inner.queues.write();
            inner.mount_stored(&config, rows, &mut queues)?;
            inner.sync_config(&config, &mut queues)?;
            info!(
                dir = %inner.dir.display(),
                queues = queues.len(),
                capacity,
                "registry opened"
            );
        }

        Ok(Self {
            inner,
            loops: Mutex::new(Vec::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn config(&self) -> RegistryConfig {
        self.inner.config.read().clone()
    }

    /// Looks a queue up by name. Callers should not hold the handle across
    /// unrelated requests; a deleted queue answers `UnknownQueue`.
    pub fn queue(&self, name: &str) -> Result<Arc<Queue>, QueueError> {
        self.inner
            .queues
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::UnknownQueue(name.to_string()))
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.inner.queues.read().keys().cloned().collect()
    }

    pub fn queues(&self) -> Vec<Arc<Queue>> {
        self.inner.snapshot()
    }

    /// Pool size and number of unused slots.
    pub fn capacity(&self) -> (usize, usize) {
        let slots = self.inner.slots.lock();
        (slots.capacity, slots.free.len())
    }

    /// Creates a dynamic queue of `class` in a free slot.
    pub fn create_queue(
        &self,
        name: &str,
        class: &str,
        comment: &str,
    ) -> Result<Arc<Queue>, QueueError> {
        validate_name(name)?;
        let (params, tuning) = {
            let config = self.inner.config.read();
            (config.class_params(Some(class))?, tuning_of(&config))
        };
        let mut queues = self.inner.queues.write();
        if queues.contains_key(name) {
            return Err(QueueError::DuplicateName(name.to_string()));
        }
        let queue = self.inner.create_in_slot(
            name,
            QueueKind::Dynamic,
            Some(class.to_string()),
            comment,
            params,
            tuning,
        )?;
        queues.insert(name.to_string(), Arc::clone(&queue));
        info!(queue = name, class, position = queue.descriptor().position, "queue created");
        Ok(queue)
    }

    /// Deletes a dynamic queue, dropping all its jobs and freeing its slot.
    pub fn delete_queue(&self, name: &str) -> Result<(), QueueError> {
        let mut queues = self.inner.queues.write();
        let queue = queues
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::UnknownQueue(name.to_string()))?;
        if queue.descriptor().kind == QueueKind::Static {
            return Err(QueueError::AccessDenied(format!(
                "static queue '{name}' cannot be deleted"
            )));
        }
        // The admin row goes first; if the block cannot be emptied it is
        // put back and the queue stays mounted.
        let row = AdminRow {
            descr: queue.descriptor().clone(),
            params: queue.params(),
        };
        {
            let admin = self.inner.admin.lock();
            admin::delete(&admin, name)?;
            if let Err(err) = queue.retire() {
                if let Err(restore) = admin::insert(&admin, &row, self.inner.clock.now_ms()) {
                    error!(queue = name, error = %restore, "failed to restore admin row");
                }
                warn!(queue = name, error = %err, "queue delete failed; queue kept");
                return Err(err);
            }
        }
        queues.remove(name);
        self.inner.release_slot(queue.descriptor().position);
        info!(queue = name, "queue deleted");
        Ok(())
    }

    /// Re-applies classes and static queue declarations without touching
    /// the background loops. Returns the smallest non-zero run timeout
    /// across all queues (0 when none is set).
    pub fn reconfigure(&self, config: RegistryConfig) -> Result<u64, QueueError> {
        config.validate()?;
        {
            let mut slots = self.inner.slots.lock();
            if config.max_queues > slots.capacity {
                for position in slots.capacity..config.max_queues {
                    drop(schema::open_block(&block_path(&self.inner.dir, position))?);
                    slots.free.insert(position);
                }
                info!(from = slots.capacity, to = config.max_queues, "block pool grown");
                slots.capacity = config.max_queues;
            } else if config.max_queues < slots.capacity {
                warn!(
                    max_queues = config.max_queues,
                    capacity = slots.capacity,
                    "block pool cannot shrink at run time"
                );
            }
        }
        {
            let mut queues = self.inner.queues.write();
            self.inner.sync_config(&config, &mut queues)?;
        }
        *self.inner.config.write() = config;
        let min_run_timeout_s = self.min_run_timeout();
        info!(
            queues = self.inner.queues.read().len(),
            min_run_timeout_s, "registry reconfigured"
        );
        Ok(min_run_timeout_s)
    }

    pub fn min_run_timeout(&self) -> u64 {
        self.inner
            .snapshot()
            .iter()
            .map(|queue| queue.params().run_timeout_s)
            .filter(|secs| *secs > 0)
            .min()
            .unwrap_or(0)
    }

    /// One purge round over every queue. Returns deleted job count.
    pub fn run_purge_pass(&self) -> Result<usize, QueueError> {
        self.inner.purge_pass(&StopSignal::new())
    }

    /// Returns how many queues had pending work to announce.
    pub fn run_notify_pass(&self) -> Result<usize, QueueError> {
        self.inner.notify_pass(&StopSignal::new())
    }

    /// Returns how many jobs were aged out.
    pub fn run_watcher_pass(&self) -> Result<usize, QueueError> {
        self.inner.watcher_pass(&StopSignal::new())
    }

    /// Starts the purge, notify and watcher threads. A no-op while they run.
    pub fn start_background(&self) -> Result<(), QueueError> {
        let mut loops = self.loops.lock();
        if !loops.is_empty() {
            return Ok(());
        }
        loops.push(BackgroundLoop::spawn(
            "purge",
            Arc::clone(&self.inner),
            |config| config.purge.interval_ms,
            RegistryInner::purge_pass,
        )?);
        loops.push(BackgroundLoop::spawn(
            "notify",
            Arc::clone(&self.inner),
            |config| config.notify.interval_ms,
            RegistryInner::notify_pass,
        )?);
        loops.push(BackgroundLoop::spawn(
            "watcher",
            Arc::clone(&self.inner),
            |config| config.watcher.interval_ms,
            RegistryInner::watcher_pass,
        )?);
        Ok(())
    }

    /// Signals every loop and waits for it to finish its current batch.
    pub fn stop_background(&self) {
        let mut loops = std::mem::take(&mut *self.loops.lock());
        for background in &mut loops {
            background.stop();
        }
    }

    pub fn running_loops(&self) -> Vec<&'static str> {
        self.loops.lock().iter().map(BackgroundLoop::name).collect()
    }

    pub fn close(self) {
        self.stop_background();
        info!(dir = %self.inner.dir.display(), "registry closed");
    }
}

impl Drop for QueueRegistry {
    fn drop(&mut self) {
        self.stop_background();
    }
}

impl RegistryInner {
    fn snapshot(&self) -> Vec<Arc<Queue>> {
        self.queues.read().values().cloned().collect()
    }

    fn mount(
        &self,
        descr: QueueDescriptor,
        params: QueueParams,
        tuning: Tuning,
    ) -> Result<Arc<Queue>, QueueError> {
        let conn = schema::open_block(&block_path(&self.dir, descr.position))?;
        let queue = Queue::mount(
            descr,
            conn,
            params,
            tuning,
            Arc::clone(&self.clock),
            Arc::clone(&self.listener),
        )?;
        Ok(Arc::new(queue))
    }

    fn mount_stored(
        &self,
        config: &RegistryConfig,
        rows: Vec<AdminRow>,
        queues: &mut BTreeMap<String, Arc<Queue>>,
    ) -> Result<(), QueueError> {
        let tuning = tuning_of(config);
        for row in rows {
            if row.descr.kind == QueueKind::Static && !config.queues.contains_key(&row.descr.name)
            {
                warn!(
                    queue = %row.descr.name,
                    "static queue no longer configured; keeping it with stored parameters"
                );
            }
            self.slots.lock().free.remove(&row.descr.position);
            let name = row.descr.name.clone();
            let queue = self.mount(row.descr, row.params, tuning)?;
            queues.insert(name, queue);
        }
        Ok(())
    }

    /// Brings mounted queues in line with `config`: new static queues are
    /// created, static and class-backed params refreshed. Dynamic queues
    /// are never removed.
    fn sync_config(
        &self,
        config: &RegistryConfig,
        queues: &mut BTreeMap<String, Arc<Queue>>,
    ) -> Result<(), QueueError> {
        let tuning = tuning_of(config);
        for (name, decl) in &config.queues {
            let params = config.static_params(name)?;
            match queues.get(name) {
                Some(queue) if queue.descriptor().kind == QueueKind::Dynamic => {
                    warn!(queue = %name, "static declaration shadowed by a dynamic queue; ignored");
                }
                Some(queue) => self.refresh_params(queue, params)?,
                None => {
                    let queue = self.create_in_slot(
                        name,
                        QueueKind::Static,
                        decl.class.clone(),
                        &decl.comment,
                        params,
                        tuning,
                    )?;
                    info!(queue = %name, position = queue.descriptor().position, "static queue added");
                    queues.insert(name.clone(), queue);
                }
            }
        }
        for queue in queues.values() {
            let descr = queue.descriptor();
            if descr.kind == QueueKind::Dynamic {
                if let Some(class) = descr.class.as_deref() {
                    match config.class_params(Some(class)) {
                        Ok(params) => self.refresh_params(queue, params)?,
                        Err(_) => warn!(
                            queue = %descr.name,
                            class,
                            "queue class no longer configured; keeping current parameters"
                        ),
                    }
                }
            }
            queue.set_tuning(tuning);
        }
        Ok(())
    }

    fn refresh_params(&self, queue: &Queue, params: QueueParams) -> Result<(), QueueError> {
        if queue.params() == params {
            return Ok(());
        }
        admin::update_params(&self.admin.lock(), queue.name(), &params)?;
        queue.set_params(params);
        debug!(queue = %queue.name(), "queue parameters updated");
        Ok(())
    }

    fn create_in_slot(
        &self,
        name: &str,
        kind: QueueKind,
        class: Option<String>,
        comment: &str,
        params: QueueParams,
        tuning: Tuning,
    ) -> Result<Arc<Queue>, QueueError> {
        let position = {
            let mut slots = self.slots.lock();
            let capacity = slots.capacity;
            slots
                .free
                .pop_first()
                .ok_or(QueueError::TooManyQueues(capacity))?
        };
        let descr = QueueDescriptor {
            name: name.to_string(),
            kind,
            class,
            comment: comment.to_string(),
            position,
        };
        let row = AdminRow {
            descr: descr.clone(),
            params: params.clone(),
        };

        let prepared = schema::open_block(&block_path(&self.dir, position))
            .and_then(|conn| schema::truncate_block(&conn))
            .and_then(|()| admin::insert(&self.admin.lock(), &row, self.clock.now_ms()));
        if let Err(err) = prepared {
            self.release_slot(position);
            return Err(err);
        }
        match self.mount(descr, params, tuning) {
            Ok(queue) => Ok(queue),
            Err(err) => {
                if let Err(cleanup) = admin::delete(&self.admin.lock(), name) {
                    error!(queue = name, error = %cleanup, "failed to drop admin row of unmounted queue");
                }
                self.release_slot(position);
                Err(err)
            }
        }
    }

    fn release_slot(&self, position: usize) {
        self.slots.lock().free.insert(position);
    }

    /// Runs `op` on every queue of a snapshot. Per-queue failures are
    /// logged and skipped unless `stop_on_error` is set.
    fn for_each_queue(
        &self,
        task: &'static str,
        signal: &StopSignal,
        mut op: impl FnMut(&Queue) -> Result<usize, QueueError>,
    ) -> Result<usize, QueueError> {
        let stop_on_error = self.config.read().stop_on_error;
        let mut total = 0;
        for queue in self.snapshot() {
            if signal.is_stopped() {
                break;
            }
            match op(queue.as_ref()) {
                Ok(count) => total += count,
                Err(QueueError::UnknownQueue(name)) => {
                    debug!(task, queue = %name, "queue deleted during pass");
                }
                Err(err) => {
                    error!(task, queue = %queue.name(), error = %err, "pass failed for queue");
                    if stop_on_error {
                        return Err(err);
                    }
                }
            }
        }
        Ok(total)
    }

    fn purge_pass(&self, signal: &StopSignal) -> Result<usize, QueueError> {
        let purge = self.config.read().purge.clone();
        let pass = self.purge_passes.fetch_add(1, Ordering::Relaxed) + 1;
        let optimize = purge.optimize_every > 0 && pass % u64::from(purge.optimize_every) == 0;
        self.for_each_queue("purge", signal, |queue| {
            purge_queue(queue, &purge, optimize, signal)
        })
    }

    fn notify_pass(&self, signal: &StopSignal) -> Result<usize, QueueError> {
        self.for_each_queue("notify", signal, |queue| {
            Ok(usize::from(queue.notify_listeners()))
        })
    }

    fn watcher_pass(&self, signal: &StopSignal) -> Result<usize, QueueError> {
        self.for_each_queue("watcher", signal, Queue::check_execution_timeout)
    }
}

fn purge_queue(
    queue: &Queue,
    purge: &PurgeConfig,
    optimize: bool,
    signal: &StopSignal,
) -> Result<usize, QueueError> {
    let batch_size = purge.batch_size.max(1);
    for status in JobStatus::INDEXED {
        if signal.is_stopped() {
            return Ok(0);
        }
        queue.check_jobs_expiry(batch_size, status)?;
    }
    let mut deleted = 0;
    while queue.erase_backlog() > 0 {
        if signal.is_stopped() {
            return Ok(deleted);
        }
        deleted += queue.do_delete_batch(batch_size)?;
    }
    if optimize {
        queue.optimize_indices();
    }
    queue.gc_affinities()?;
    if deleted > 0 {
        debug!(queue = %queue.name(), deleted, "purged expired jobs");
    }
    Ok(deleted)
}
