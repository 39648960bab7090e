#![forbid(unsafe_code)]

use ns_storage::{
    AffinityPrefs, ClientIdent, JobStatus, ManualClock, NewJob, NoopListener, QueueError,
    QueueRegistry, RegistryConfig,
};
use std::sync::Arc;
use tempfile::TempDir;

const START_MS: i64 = 1_700_000_000_000;

const CONFIG: &str = r#"
max_queues: 2
affinity_grace_s: 10
purge: { batch_size: 2 }
queue_classes:
  short: { timeout_s: 100, run_timeout_s: 20, failed_retries: 1 }
queues:
  q: { class: short }
"#;

fn setup() -> (TempDir, Arc<ManualClock>, QueueRegistry) {
    let dir = tempfile::tempdir().expect("temp dir");
    let clock = Arc::new(ManualClock::new(START_MS));
    let config = RegistryConfig::from_yaml_str(CONFIG).expect("config");
    let registry = QueueRegistry::open_with(dir.path(), config, clock.clone(), Arc::new(NoopListener))
        .expect("open registry");
    (dir, clock, registry)
}

fn client() -> ClientIdent {
    ClientIdent::new("", "localhost")
}

fn worker() -> ClientIdent {
    ClientIdent::new("w", "localhost")
}

#[test]
fn stalled_runs_retry_then_fail() {
    let (_dir, clock, registry) = setup();
    let queue = registry.queue("q").expect("queue");
    let id = queue.submit(&client(), NewJob::new("x")).expect("submit");

    queue
        .get_job(&worker(), &AffinityPrefs::any())
        .expect("get job")
        .expect("dispatched");
    assert_eq!(queue.run_deadline(id), Some(START_MS + 20_000));

    clock.advance_s(19);
    assert_eq!(queue.check_execution_timeout().expect("watch"), 0);
    clock.advance_s(1);
    assert_eq!(queue.check_execution_timeout().expect("watch"), 1);

    let job = queue.get_job_descr(id, None).expect("descr");
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.runs[0].status, JobStatus::Failed);
    assert_eq!(job.runs[0].err_msg, "Job execution timed out");
    assert_eq!(queue.run_deadline(id), None);

    queue
        .get_job(&worker(), &AffinityPrefs::any())
        .expect("get job")
        .expect("dispatched again");
    clock.advance_s(21);
    assert_eq!(registry.run_watcher_pass().expect("watcher"), 1);
    assert_eq!(
        queue.get_job_descr(id, None).expect("descr").status,
        JobStatus::Failed
    );
    assert_eq!(queue.count_status(JobStatus::Running), 0);
}

#[test]
fn finished_runs_are_not_timed_out() {
    let (_dir, clock, registry) = setup();
    let queue = registry.queue("q").expect("queue");
    let id = queue.submit(&client(), NewJob::new("x")).expect("submit");
    queue
        .get_job(&worker(), &AffinityPrefs::any())
        .expect("get job")
        .expect("dispatched");
    queue.put_result(&worker(), id, 0, "").expect("put result");

    clock.advance_s(60);
    assert_eq!(registry.run_watcher_pass().expect("watcher"), 0);
    assert_eq!(
        queue.get_job_descr(id, None).expect("descr").status,
        JobStatus::Done
    );
}

#[test]
fn expired_jobs_are_purged_in_batches() {
    let (_dir, clock, registry) = setup();
    let queue = registry.queue("q").expect("queue");
    let first = queue
        .submit_batch(
            &client(),
            (0..5).map(|n| NewJob::new(format!("{n}"))).collect(),
        )
        .expect("batch");
    queue
        .get_job(&worker(), &AffinityPrefs::any())
        .expect("get job")
        .expect("dispatched");
    queue.put_result(&worker(), first, 0, "").expect("put result");
    clock.advance_s(50);
    let young = queue
        .submit(&client(), NewJob::new("young"))
        .expect("submit");

    clock.advance_s(51);
    // Scans are bounded by the batch size and resume where they stopped.
    assert_eq!(queue.check_jobs_expiry(2, JobStatus::Pending).expect("scan"), 2);
    assert_eq!(queue.check_jobs_expiry(2, JobStatus::Pending).expect("scan"), 2);
    assert_eq!(queue.check_jobs_expiry(2, JobStatus::Pending).expect("scan"), 0);
    assert_eq!(queue.check_jobs_expiry(2, JobStatus::Done).expect("scan"), 1);
    assert_eq!(queue.erase_backlog(), 5);

    assert_eq!(queue.do_delete_batch(2).expect("delete"), 2);
    assert_eq!(queue.erase_backlog(), 3);
    assert_eq!(registry.run_purge_pass().expect("purge"), 3);
    assert_eq!(queue.erase_backlog(), 0);

    for id in first..first + 5 {
        assert!(matches!(
            queue.get_job_descr(id, None).unwrap_err(),
            QueueError::JobNotFound(_)
        ));
    }
    assert_eq!(queue.count_status(JobStatus::Pending), 1);
    assert_eq!(queue.count_status(JobStatus::Done), 0);
    assert_eq!(
        queue.get_job_descr(young, None).expect("descr").status,
        JobStatus::Pending
    );
}

#[test]
fn expiry_scan_fails_pending_jobs_at_once() {
    let (_dir, clock, registry) = setup();
    let queue = registry.queue("q").expect("queue");
    let id = queue
        .submit(&client(), NewJob::new("x").with_timeout(5))
        .expect("submit");
    clock.advance_s(6);

    assert_eq!(queue.check_jobs_expiry(10, JobStatus::Pending).expect("scan"), 1);
    assert_eq!(queue.count_status(JobStatus::Pending), 0);
    assert_eq!(queue.count_status(JobStatus::Failed), 1);
    assert!(!queue.notify_listeners());

    let job = queue.get_job_descr(id, None).expect("descr");
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.runs.len(), 1);
    assert_eq!(job.runs[0].status, JobStatus::Failed);
    assert_eq!(job.runs[0].err_msg, "Job expired before dispatch");
    assert_eq!(queue.erase_backlog(), 1);
}

#[test]
fn per_job_timeout_overrides_the_queue() {
    let (_dir, clock, registry) = setup();
    let queue = registry.queue("q").expect("queue");
    let short = queue
        .submit(&client(), NewJob::new("short").with_timeout(5))
        .expect("submit");
    let long = queue
        .submit(&client(), NewJob::new("long").with_timeout(1000))
        .expect("submit");

    clock.advance_s(200);
    registry.run_purge_pass().expect("purge");
    assert!(queue.get_job_descr(short, None).is_err());
    assert!(queue.get_job_descr(long, None).is_ok());
}

#[test]
fn deletion_follows_the_current_status() {
    let (_dir, clock, registry) = setup();
    let queue = registry.queue("q").expect("queue");
    let id = queue.submit(&client(), NewJob::new("x")).expect("submit");
    clock.advance_s(101);
    assert_eq!(queue.check_jobs_expiry(10, JobStatus::Pending).expect("scan"), 1);

    assert_eq!(
        queue.get_job_descr(id, None).expect("descr").status,
        JobStatus::Failed
    );

    // The job moves after it was queued; deletion must still clear it.
    assert_eq!(queue.cancel_all(&[JobStatus::Failed]).expect("cancel"), 1);
    assert_eq!(queue.count_status(JobStatus::Canceled), 1);
    assert_eq!(queue.do_delete_batch(10).expect("delete"), 1);
    for status in JobStatus::INDEXED {
        assert!(!queue.jobs_in_status(status).contains(id));
    }
}

#[test]
fn unused_affinities_retire_after_grace() {
    let (_dir, clock, registry) = setup();
    let queue = registry.queue("q").expect("queue");
    let id = queue
        .submit(&client(), NewJob::new("x").with_affinity("A"))
        .expect("submit");
    let old_affinity = queue.affinity_id("A").expect("affinity");

    clock.advance_s(101);
    registry.run_purge_pass().expect("purge");
    assert!(queue.get_job_descr(id, None).is_err());
    // Within grace the id survives.
    assert_eq!(queue.affinity_id("A"), Some(old_affinity));

    clock.advance_s(11);
    registry.run_purge_pass().expect("purge");
    assert_eq!(queue.affinity_id("A"), None);

    queue
        .submit(&client(), NewJob::new("y").with_affinity("A"))
        .expect("submit");
    let new_affinity = queue.affinity_id("A").expect("affinity");
    assert_ne!(new_affinity, old_affinity);
}

#[test]
fn affinity_gc_racing_submits_keeps_live_jobs() {
    let (_dir, clock, registry) = setup();
    let queue = registry.queue("q").expect("queue");
    queue
        .submit(&client(), NewJob::new("seed").with_affinity("A"))
        .expect("submit");
    let affinity = queue.affinity_id("A").expect("affinity");

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let collector = {
        let queue = Arc::clone(&queue);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            while !stop.load(std::sync::atomic::Ordering::Acquire) {
                queue.gc_affinities().expect("gc");
            }
        })
    };
    for n in 0..200 {
        queue
            .submit(&client(), NewJob::new(format!("{n}")).with_affinity("A"))
            .expect("submit");
    }
    stop.store(true, std::sync::atomic::Ordering::Release);
    collector.join().expect("collector");

    // Every job is still pending, so the id must survive past its grace.
    clock.advance_s(11);
    assert_eq!(queue.gc_affinities().expect("gc"), 0);
    assert_eq!(queue.affinity_id("A"), Some(affinity));
    assert_eq!(queue.count_status(JobStatus::Pending), 201);
}

#[test]
fn purge_retains_live_jobs_and_reports_info() {
    let (_dir, clock, registry) = setup();
    let queue = registry.queue("q").expect("queue");
    queue
        .submit_batch(&client(), vec![NewJob::new("a"), NewJob::new("b")])
        .expect("batch");
    clock.advance_s(10);
    assert_eq!(registry.run_purge_pass().expect("purge"), 0);

    let info = queue.queue_info();
    assert_eq!(info.descr.name, "q");
    assert_eq!(info.erase_backlog, 0);
    assert!(
        info.counts
            .iter()
            .any(|(status, count)| *status == JobStatus::Pending && *count == 2)
    );
    assert!(info.to_string().contains("Pending: 2"));
}
