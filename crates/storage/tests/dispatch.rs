#![forbid(unsafe_code)]

use ns_storage::{
    AffinityPrefs, BatchAffinity, ClientIdent, JobStatus, ManualClock, NewJob, NoopListener,
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
  plain: { timeout_s: 60 }
queues:
  q: { class: plain }
"#,
    )
    .expect("config");
    let registry = QueueRegistry::open_with(dir.path(), config, clock.clone(), Arc::new(NoopListener))
        .expect("open registry");
    (dir, clock, registry)
}

fn client() -> ClientIdent {
    ClientIdent::new("", "localhost")
}

fn worker(node: &str) -> ClientIdent {
    ClientIdent::new(node, "localhost")
}

#[test]
fn lower_ids_dispatch_first() {
    let (_dir, _clock, registry) = setup();
    let queue = registry.queue("q").expect("queue");
    let a = queue.submit(&client(), NewJob::new("a")).expect("submit");
    let b = queue.submit(&client(), NewJob::new("b")).expect("submit");
    assert!(a < b);

    let first = queue
        .get_job(&worker("w1"), &AffinityPrefs::any())
        .expect("get job")
        .expect("first");
    let second = queue
        .get_job(&worker("w2"), &AffinityPrefs::any())
        .expect("get job")
        .expect("second");
    assert_eq!(first.id, a);
    assert_eq!(second.id, b);
    assert!(
        queue
            .get_job(&worker("w3"), &AffinityPrefs::any())
            .expect("get job")
            .is_none()
    );
    assert_eq!(queue.count_status(JobStatus::Running), 2);
}

#[test]
fn affinity_batch_is_served_before_older_jobs() {
    let (_dir, _clock, registry) = setup();
    let queue = registry.queue("q").expect("queue");
    let older = queue.submit(&client(), NewJob::new("older")).expect("submit");

    let mut batch = vec![NewJob::new("a0").with_affinity("A")];
    for n in 1..5 {
        let mut job = NewJob::new(format!("a{n}"));
        job.affinity = BatchAffinity::SameAsPrevious;
        batch.push(job);
    }
    let first = queue.submit_batch(&client(), batch).expect("batch");
    assert_eq!(first, older + 1);

    let affinity_id = queue.affinity_id("A").expect("affinity registered");
    for k in 0..5 {
        let job = queue.get_job_descr(first + k, None).expect("descr");
        assert_eq!(job.affinity_id, affinity_id);
        assert_eq!(job.affinity_token.as_deref(), Some("A"));
    }

    let prefs = AffinityPrefs::prefer(["A"]);
    let mut served = Vec::new();
    for _ in 0..5 {
        let job = queue
            .get_job(&worker("wa"), &prefs)
            .expect("get job")
            .expect("dispatched");
        served.push(job.id);
    }
    assert_eq!(served, (first..first + 5).collect::<Vec<_>>());

    // Preferred affinity exhausted; falls back to the rest.
    let job = queue
        .get_job(&worker("wa"), &prefs)
        .expect("get job")
        .expect("fallback");
    assert_eq!(job.id, older);
    assert_eq!(queue.affinity_workers("A"), vec!["wa".to_string()]);
}

#[test]
fn only_affinity_never_falls_back() {
    let (_dir, _clock, registry) = setup();
    let queue = registry.queue("q").expect("queue");
    queue.submit(&client(), NewJob::new("plain")).expect("submit");
    let tagged = queue
        .submit(&client(), NewJob::new("b").with_affinity("B"))
        .expect("submit");

    let prefs = AffinityPrefs::only(["B"]);
    let job = queue
        .get_job(&worker("wb"), &prefs)
        .expect("get job")
        .expect("dispatched");
    assert_eq!(job.id, tagged);
    assert!(queue.get_job(&worker("wb"), &prefs).expect("get job").is_none());

    // Unknown token: nothing to hand out under "only".
    assert!(
        queue
            .get_job(&worker("wb"), &AffinityPrefs::only(["nope"]))
            .expect("get job")
            .is_none()
    );
    assert_eq!(queue.count_status(JobStatus::Pending), 1);
}

#[test]
fn put_result_and_get_next_in_one_step() {
    let (_dir, _clock, registry) = setup();
    let queue = registry.queue("q").expect("queue");
    let first = queue
        .submit_batch(&client(), vec![NewJob::new("1"), NewJob::new("2")])
        .expect("batch");
    let job = queue
        .get_job(&worker("w"), &AffinityPrefs::any())
        .expect("get job")
        .expect("dispatched");
    assert_eq!(job.id, first);

    let next = queue
        .put_result_get_job(&worker("w"), first, 0, "r1", &AffinityPrefs::any())
        .expect("put and get")
        .expect("next job");
    assert_eq!(next.id, first + 1);
    assert_eq!(
        queue.get_job_descr(first, None).expect("descr").status,
        JobStatus::Done
    );

    let none = queue
        .put_result_get_job(&worker("w"), first + 1, 0, "r2", &AffinityPrefs::any())
        .expect("put and get");
    assert!(none.is_none());
    assert_eq!(queue.count_status(JobStatus::Done), 2);
}

#[test]
fn expired_pending_jobs_are_never_dispatched() {
    let (_dir, clock, registry) = setup();
    let queue = registry.queue("q").expect("queue");
    let stale = queue.submit(&client(), NewJob::new("stale")).expect("submit");
    clock.advance_s(30);
    let fresh = queue.submit(&client(), NewJob::new("fresh")).expect("submit");
    clock.advance_s(31);

    let job = queue
        .get_job(&worker("w"), &AffinityPrefs::any())
        .expect("get job")
        .expect("dispatched");
    assert_eq!(job.id, fresh);
    assert_eq!(queue.erase_backlog(), 1);
    // The stale job left Pending in the same call.
    assert_eq!(
        queue.get_job_descr(stale, None).expect("descr").status,
        JobStatus::Failed
    );
    assert_eq!(queue.count_status(JobStatus::Pending), 0);
    assert_eq!(queue.count_status(JobStatus::Failed), 1);
    assert!(queue.get_job(&worker("w"), &AffinityPrefs::any()).expect("get job").is_none());

    registry.run_purge_pass().expect("purge");
    assert!(queue.get_job_descr(stale, None).is_err());
    assert_eq!(queue.erase_backlog(), 0);
}

#[test]
fn expired_job_is_failed_when_nothing_else_is_pending() {
    let (_dir, clock, registry) = setup();
    let queue = registry.queue("q").expect("queue");
    let id = queue
        .submit(&client(), NewJob::new("x").with_timeout(5))
        .expect("submit");
    clock.advance_s(6);

    assert!(queue.get_job(&worker("w"), &AffinityPrefs::any()).expect("get job").is_none());
    assert_eq!(queue.count_status(JobStatus::Pending), 0);
    assert_eq!(
        queue.get_job_descr(id, None).expect("descr").status,
        JobStatus::Failed
    );
    assert!(!queue.notify_listeners());
}

#[test]
fn clear_worker_returns_its_running_jobs() {
    let (_dir, _clock, registry) = setup();
    let queue = registry.queue("q").expect("queue");
    let first = queue
        .submit_batch(
            &client(),
            vec![
                NewJob::new("1").with_affinity("A"),
                NewJob::new("2").with_affinity("A"),
                NewJob::new("3"),
            ],
        )
        .expect("batch");
    queue
        .get_job(&worker("gone"), &AffinityPrefs::prefer(["A"]))
        .expect("get job")
        .expect("dispatched");
    queue
        .get_job(&worker("gone"), &AffinityPrefs::prefer(["A"]))
        .expect("get job")
        .expect("dispatched");
    queue
        .get_job(&worker("stays"), &AffinityPrefs::any())
        .expect("get job")
        .expect("dispatched");
    assert_eq!(queue.affinity_workers("A"), vec!["gone".to_string()]);

    assert_eq!(queue.clear_worker("gone").expect("clear"), 2);
    assert_eq!(queue.count_status(JobStatus::Pending), 2);
    assert_eq!(queue.count_status(JobStatus::Running), 1);
    assert!(queue.affinity_workers("A").is_empty());

    let job = queue.get_job_descr(first, None).expect("descr");
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.run_count, 0);
    assert_eq!(job.runs[0].status, JobStatus::Returned);
    assert_eq!(queue.run_deadline(first), None);
}
