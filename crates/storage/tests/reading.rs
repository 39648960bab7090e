#![forbid(unsafe_code)]

use ns_storage::{
    AffinityPrefs, ClientIdent, JobStatus, ManualClock, NewJob, NoopListener, Queue, QueueError,
    QueueRegistry, RegistryConfig,
};
use std::sync::Arc;
use tempfile::TempDir;

const START_MS: i64 = 1_700_000_000_000;

fn setup() -> (TempDir, Arc<ManualClock>, QueueRegistry) {
    let dir = tempfile::tempdir().expect("temp dir");
    let clock = Arc::new(ManualClock::new(START_MS));
    let config = RegistryConfig::from_yaml_str(
        r#"
max_queues: 2
queue_classes:
  results: { read_timeout_s: 30, read_failed_retries: 1, reader_hosts: [reader-host] }
queues:
  q: { class: results }
"#,
    )
    .expect("config");
    let registry = QueueRegistry::open_with(dir.path(), config, clock.clone(), Arc::new(NoopListener))
        .expect("open registry");
    (dir, clock, registry)
}

fn reader() -> ClientIdent {
    ClientIdent::new("reader", "reader-host")
}

/// Submits `count` jobs and completes all of them.
fn done_jobs(queue: &Queue, count: usize) -> Vec<u32> {
    let client = ClientIdent::new("", "localhost");
    let worker = ClientIdent::new("w", "localhost");
    let first = queue
        .submit_batch(
            &client,
            (0..count).map(|n| NewJob::new(format!("{n}"))).collect(),
        )
        .expect("batch");
    let ids: Vec<u32> = (first..first + count as u32).collect();
    for id in &ids {
        let job = queue
            .get_job(&worker, &AffinityPrefs::any())
            .expect("get job")
            .expect("dispatched");
        assert_eq!(job.id, *id);
        queue.put_result(&worker, *id, 0, "out").expect("put result");
    }
    ids
}

#[test]
fn read_group_confirms_as_a_unit() {
    let (_dir, _clock, registry) = setup();
    let queue = registry.queue("q").expect("queue");
    let ids = done_jobs(&queue, 3);

    let batch = queue
        .read_jobs(&reader(), 2)
        .expect("read")
        .expect("batch");
    assert_eq!(batch.job_ids, ids[..2].to_vec());
    assert_eq!(queue.count_status(JobStatus::Reading), 2);
    assert_eq!(queue.read_group_members(batch.group), Some(ids[..2].to_vec()));
    assert_eq!(queue.run_deadline(ids[0]), Some(START_MS + 30_000));

    assert_eq!(queue.confirm_read_group(&reader(), batch.group).expect("confirm"), 2);
    assert_eq!(queue.count_status(JobStatus::Confirmed), 2);
    assert_eq!(queue.count_status(JobStatus::Done), 1);
    assert_eq!(queue.read_group_members(batch.group), None);
    assert_eq!(queue.run_deadline(ids[0]), None);

    let second = queue
        .read_jobs(&reader(), 10)
        .expect("read")
        .expect("batch");
    assert_ne!(second.group, batch.group);
    assert_eq!(second.job_ids, vec![ids[2]]);
    assert!(queue.read_jobs(&reader(), 10).expect("read").is_none());
}

#[test]
fn failed_reads_retry_then_stick() {
    let (_dir, _clock, registry) = setup();
    let queue = registry.queue("q").expect("queue");
    let ids = done_jobs(&queue, 1);

    let group = queue.read_jobs(&reader(), 1).expect("read").expect("batch").group;
    assert_eq!(queue.fail_read_group(&reader(), group).expect("fail"), 1);
    assert_eq!(
        queue.get_job_descr(ids[0], None).expect("descr").status,
        JobStatus::Done
    );

    let group = queue.read_jobs(&reader(), 1).expect("read").expect("batch").group;
    assert_eq!(queue.fail_read_group(&reader(), group).expect("fail"), 1);
    let job = queue.get_job_descr(ids[0], None).expect("descr");
    assert_eq!(job.status, JobStatus::ReadFailed);
    assert_eq!(job.read_count, 2);
}

#[test]
fn rollback_does_not_count_the_read() {
    let (_dir, _clock, registry) = setup();
    let queue = registry.queue("q").expect("queue");
    let ids = done_jobs(&queue, 2);

    let group = queue.read_jobs(&reader(), 2).expect("read").expect("batch").group;
    assert_eq!(queue.rollback_read_group(&reader(), group).expect("rollback"), 2);
    for id in &ids {
        let job = queue.get_job_descr(*id, None).expect("descr");
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.read_count, 0);
        assert_eq!(job.read_group, 0);
    }
}

#[test]
fn read_errors() {
    let (_dir, _clock, registry) = setup();
    let queue = registry.queue("q").expect("queue");
    done_jobs(&queue, 1);

    assert!(matches!(
        queue.read_jobs(&reader(), 0).unwrap_err(),
        QueueError::InvalidInput(_)
    ));
    assert!(matches!(
        queue
            .read_jobs(&ClientIdent::new("r", "elsewhere"), 1)
            .unwrap_err(),
        QueueError::AccessDenied(_)
    ));
    assert!(matches!(
        queue.confirm_read_group(&reader(), 42).unwrap_err(),
        QueueError::InvalidInput(_)
    ));
}

#[test]
fn stalled_reader_times_out() {
    let (_dir, clock, registry) = setup();
    let queue = registry.queue("q").expect("queue");
    let ids = done_jobs(&queue, 1);
    queue.read_jobs(&reader(), 1).expect("read").expect("batch");

    clock.advance_s(29);
    assert_eq!(registry.run_watcher_pass().expect("watcher"), 0);
    clock.advance_s(2);
    assert_eq!(registry.run_watcher_pass().expect("watcher"), 1);

    // First read attempt is within read_failed_retries.
    let job = queue.get_job_descr(ids[0], None).expect("descr");
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.run_deadline_ms, None);
}

#[test]
fn reading_jobs_can_be_canceled_in_bulk() {
    let (_dir, _clock, registry) = setup();
    let queue = registry.queue("q").expect("queue");
    let ids = done_jobs(&queue, 2);
    let group = queue.read_jobs(&reader(), 1).expect("read").expect("batch").group;

    assert_eq!(queue.cancel_all(&[JobStatus::Reading]).expect("cancel"), 1);
    assert_eq!(
        queue.get_job_descr(ids[0], None).expect("descr").status,
        JobStatus::Canceled
    );
    assert_eq!(queue.read_group_members(group), None);
    assert_eq!(queue.count_status(JobStatus::Done), 1);
}
