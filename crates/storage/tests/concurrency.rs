#![forbid(unsafe_code)]

use ns_storage::{
    AffinityPrefs, ClientIdent, JobStatus, ManualClock, NewJob, NoopListener, QueueError,
    QueueRegistry, RegistryConfig,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::TempDir;

const CONFIG: &str = r#"
max_queues: 4
queue_classes:
  plain: {}
queues:
  q: { class: plain }
"#;

fn setup() -> (TempDir, Arc<QueueRegistry>) {
    let dir = tempfile::tempdir().expect("temp dir");
    let config = RegistryConfig::from_yaml_str(CONFIG).expect("config");
    let registry = QueueRegistry::open_with(
        dir.path(),
        config,
        Arc::new(ManualClock::new(1_700_000_000_000)),
        Arc::new(NoopListener),
    )
    .expect("open registry");
    (dir, Arc::new(registry))
}

fn client() -> ClientIdent {
    ClientIdent::new("", "localhost")
}

#[test]
fn put_result_and_return_race_has_one_winner() {
    let (_dir, registry) = setup();
    let queue = registry.queue("q").expect("queue");

    for round in 0..20 {
        let id = queue
            .submit(&client(), NewJob::new(format!("{round}")))
            .expect("submit");
        let worker = ClientIdent::new("w", "localhost");
        let job = queue
            .get_job(&worker, &AffinityPrefs::any())
            .expect("get job")
            .expect("dispatched");
        assert_eq!(job.id, id);

        let barrier = Arc::new(Barrier::new(2));
        let finisher = {
            let queue = Arc::clone(&queue);
            let barrier = Arc::clone(&barrier);
            let worker = worker.clone();
            thread::spawn(move || {
                barrier.wait();
                queue.put_result(&worker, id, 0, "done")
            })
        };
        let returner = {
            let queue = Arc::clone(&queue);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                queue.return_job(&worker, id)
            })
        };
        let put = finisher.join().expect("join");
        let ret = returner.join().expect("join");

        let status = queue.get_job_descr(id, None).expect("descr").status;
        match status {
            JobStatus::Done => {
                assert!(put.is_ok());
                assert!(matches!(ret, Err(QueueError::InvalidJobStatus { .. })));
            }
            JobStatus::Pending => {
                assert!(ret.is_ok());
                assert!(matches!(put, Err(QueueError::InvalidJobStatus { .. })));
                queue.cancel(id).expect("cancel leftover");
            }
            other => panic!("unexpected status {other}"),
        }

        let holders = JobStatus::INDEXED
            .iter()
            .filter(|s| queue.jobs_in_status(**s).contains(id))
            .count();
        assert_eq!(holders, 1);
    }
}

#[test]
fn concurrent_workers_never_share_a_job() {
    let (_dir, registry) = setup();
    let queue = registry.queue("q").expect("queue");
    let total = 200u32;
    queue
        .submit_batch(
            &client(),
            (0..total).map(|n| NewJob::new(format!("{n}"))).collect(),
        )
        .expect("batch");

    let handles: Vec<_> = (0..8)
        .map(|n| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let worker = ClientIdent::new(format!("w{n}"), "localhost");
                let mut taken = Vec::new();
                while let Some(job) = queue
                    .get_job(&worker, &AffinityPrefs::any())
                    .expect("get job")
                {
                    queue
                        .put_result(&worker, job.id, 0, "ok")
                        .expect("put result");
                    taken.push(job.id);
                }
                taken
            })
        })
        .collect();

    let mut seen = BTreeSet::new();
    for handle in handles {
        for id in handle.join().expect("join") {
            assert!(seen.insert(id), "job {id} dispatched twice");
        }
    }
    assert_eq!(seen.len(), total as usize);
    assert_eq!(queue.count_status(JobStatus::Done), u64::from(total));
    assert_eq!(queue.count_status(JobStatus::Pending), 0);
}

#[test]
fn concurrent_submitters_get_disjoint_ranges() {
    let (_dir, registry) = setup();
    let queue = registry.queue("q").expect("queue");

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                (0..10)
                    .map(|_| {
                        let first = queue
                            .submit_batch(
                                &client(),
                                (0..5).map(|n| NewJob::new(format!("{n}"))).collect(),
                            )
                            .expect("batch");
                        (first, first + 4)
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut ranges: Vec<(u32, u32)> = handles
        .into_iter()
        .flat_map(|handle| handle.join().expect("join"))
        .collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        assert_eq!(pair[0].1 + 1, pair[1].0);
    }
    assert_eq!(ranges.first().map(|r| r.0), Some(1));
    assert_eq!(queue.count_status(JobStatus::Pending), 200);
}

#[test]
fn passes_tolerate_concurrent_queue_deletion() {
    let (_dir, registry) = setup();
    let stop = Arc::new(AtomicBool::new(false));

    let passes = {
        let registry = Arc::clone(&registry);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut rounds = 0;
            loop {
                registry.run_purge_pass().expect("purge");
                registry.run_watcher_pass().expect("watcher");
                registry.run_notify_pass().expect("notify");
                rounds += 1;
                if stop.load(Ordering::Relaxed) {
                    break rounds;
                }
            }
        })
    };

    for round in 0..20 {
        let name = format!("dyn{round}");
        let queue = registry.create_queue(&name, "plain", "").expect("create");
        queue
            .submit_batch(&client(), (0..10).map(|n| NewJob::new(format!("{n}"))).collect())
            .expect("batch");
        registry.delete_queue(&name).expect("delete");
        assert_eq!(queue.count_status(JobStatus::Pending), 0);
    }
    stop.store(true, Ordering::Relaxed);
    assert!(passes.join().expect("join") > 0);
    assert_eq!(registry.queue_names(), vec!["q".to_string()]);
}
