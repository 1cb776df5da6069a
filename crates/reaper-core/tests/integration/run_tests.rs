use std::time::Duration;

use reaper_core::testutil::{MockAdapter, MockBehavior, MockKeyStore};
use reaper_core::{JobErrorKind, JobEvent, JobStatus, QueueError, RunSummary};
use tokio_util::sync::CancellationToken;

use crate::integration::common::{finish, setup_queue, source, statuses, wait_for_status};

#[tokio::test]
async fn one_failure_does_not_block_the_batch() {
    let adapter = MockAdapter::new().on("two", MockBehavior::Fail("source is down".into()));
    let (queue, sink) = setup_queue(adapter.clone(), MockKeyStore::new(), 1);
    let one = queue.add(source("one"));
    let two = queue.add(source("two"));
    let three = queue.add(source("three"));

    let summary = finish(queue.run().unwrap()).await;

    assert_eq!(
        statuses(&queue),
        vec![JobStatus::Succeeded, JobStatus::Failed, JobStatus::Succeeded]
    );
    assert_eq!(
        summary,
        RunSummary {
            succeeded: 2,
            failed: 1,
            cancelled: 0,
        }
    );
    assert_eq!(adapter.calls(), vec!["one", "two", "three"]);

    assert_eq!(sink.errors_for(two), vec!["adapter error: source is down"]);
    assert_eq!(sink.error_logs_for(two).len(), 1);
    assert!(sink.error_logs_for(two)[0].contains("two"));
    for ok in [one, three] {
        assert!(sink.errors_for(ok).is_empty());
        assert!(sink.error_logs_for(ok).is_empty());
    }

    let failed = queue.get(two).unwrap();
    assert_eq!(failed.error().unwrap().kind, JobErrorKind::AdapterError);
    assert!(queue.get(one).unwrap().error().is_none());
}

#[tokio::test]
async fn failed_job_emits_update_then_error_then_log() {
    let adapter = MockAdapter::new().with_default(MockBehavior::Fail("boom".into()));
    let (queue, sink) = setup_queue(adapter, MockKeyStore::new(), 1);
    let id = queue.add(source("only"));

    finish(queue.run().unwrap()).await;

    let kinds: Vec<&'static str> = sink
        .events_for(id)
        .iter()
        .map(|e| match e {
            JobEvent::Update { status, .. } => status.as_str(),
            JobEvent::Error { .. } => "error",
            JobEvent::ErrorLog { .. } => "error_log",
            JobEvent::Output { .. } => "output",
        })
        .collect();
    assert_eq!(
        kinds,
        vec!["pending", "running", "failed", "error", "error_log"]
    );
}

#[tokio::test]
async fn progress_is_monotonic_and_ends_at_100_only_on_success() {
    let adapter = MockAdapter::new()
        .on("good", MockBehavior::Succeed(vec![10, 40, 30, 100]))
        .on("bad", MockBehavior::Fail("late failure".into()));
    let (queue, sink) = setup_queue(adapter, MockKeyStore::new(), 1);
    let good = queue.add(source("good"));
    let bad = queue.add(source("bad"));

    finish(queue.run().unwrap()).await;

    let progress: Vec<u8> = sink.updates_for(good).iter().map(|(_, p)| *p).collect();
    assert_eq!(progress, vec![0, 0, 10, 40, 99, 100]);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(queue.get(good).unwrap().progress(), 100);

    let last_bad = *sink.updates_for(bad).last().unwrap();
    assert_eq!(last_bad.0, JobStatus::Failed);
    assert!(last_bad.1 < 100);
}

#[tokio::test]
async fn output_is_published_before_success() {
    let (queue, sink) = setup_queue(MockAdapter::new(), MockKeyStore::new(), 1);
    let id = queue.add(source("records"));

    finish(queue.run().unwrap()).await;

    let events = sink.events_for(id);
    let output_at = events
        .iter()
        .position(|e| matches!(e, JobEvent::Output { .. }))
        .unwrap();
    let success_at = events
        .iter()
        .position(|e| {
            matches!(
                e,
                JobEvent::Update {
                    status: JobStatus::Succeeded,
                    ..
                }
            )
        })
        .unwrap();
    assert!(output_at < success_at);
    assert_eq!(sink.outputs_for(id)[0].records[0]["source"], "records");
}

#[tokio::test]
async fn panicking_adapter_fails_only_its_job() {
    let adapter = MockAdapter::new().on("crash", MockBehavior::Panic("parser exploded".into()));
    let (queue, sink) = setup_queue(adapter, MockKeyStore::new(), 1);
    let crash = queue.add(source("crash"));
    let after = queue.add(source("after"));

    let summary = finish(queue.run().unwrap()).await;

    assert_eq!(summary.failed, 1);
    assert_eq!(queue.get(after).unwrap().status(), JobStatus::Succeeded);
    let error = queue.get(crash).unwrap().error().cloned().unwrap();
    assert_eq!(error.kind, JobErrorKind::AdapterError);
    assert!(error.message.contains("parser exploded"));
    assert_eq!(sink.errors_for(crash).len(), 1);
}

#[tokio::test]
async fn credential_failure_skips_the_adapter() {
    let adapter = MockAdapter::new();
    let keys = MockKeyStore::new().failing_for("secret");
    let lookups = keys.clone();
    let (queue, sink) = setup_queue(adapter.clone(), keys, 1);
    let locked = queue.add(source("locked").with_key("secret"));
    let open = queue.add(source("open"));

    finish(queue.run().unwrap()).await;

    let error = queue.get(locked).unwrap().error().cloned().unwrap();
    assert_eq!(error.kind, JobErrorKind::CredentialError);
    assert_eq!(sink.errors_for(locked).len(), 1);
    assert_eq!(queue.get(open).unwrap().status(), JobStatus::Succeeded);
    assert_eq!(adapter.calls(), vec!["open"]);
    assert_eq!(lookups.lookups(), vec!["locked", "open"]);
}

#[tokio::test]
async fn panicking_key_store_fails_only_its_job() {
    let adapter = MockAdapter::new();
    let keys = MockKeyStore::new().panicking_for("cursed");
    let (queue, sink) = setup_queue(adapter.clone(), keys, 2);
    let bad = queue.add(source("bad").with_key("cursed"));
    let good = queue.add(source("good"));

    let summary = finish(queue.run().unwrap()).await;

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(queue.get(good).unwrap().status(), JobStatus::Succeeded);

    let error = queue.get(bad).unwrap().error().cloned().unwrap();
    assert_eq!(queue.get(bad).unwrap().status(), JobStatus::Failed);
    assert_eq!(error.kind, JobErrorKind::CredentialError);
    assert!(error.message.contains("panicked"));
    assert!(error.diagnostic().contains("key store exploded for 'bad'"));
    assert_eq!(sink.error_logs_for(bad).len(), 1);
    assert_eq!(adapter.calls(), vec!["good"]);

    // The queue is usable afterwards.
    assert!(!queue.is_running());
    queue.remove(bad).unwrap();
    let again = queue.add(source("again"));
    finish(queue.run().unwrap()).await;
    assert_eq!(queue.get(again).unwrap().status(), JobStatus::Succeeded);
}

#[tokio::test]
async fn run_twice_is_rejected_while_active() {
    let gate = CancellationToken::new();
    let adapter = MockAdapter::new().with_default(MockBehavior::Gate(gate.clone()));
    let (queue, _) = setup_queue(adapter, MockKeyStore::new(), 1);
    let id = queue.add(source("slow"));

    let handle = queue.run().unwrap();
    assert!(queue.is_running());
    assert!(matches!(queue.run(), Err(QueueError::AlreadyRunning)));

    wait_for_status(&queue, id, JobStatus::Running).await;
    gate.cancel();
    finish(handle).await;
    assert!(!queue.is_running());

    // A finished run can be followed by a new one.
    let again = queue.add(source("again"));
    finish(queue.run().unwrap()).await;
    assert_eq!(queue.get(again).unwrap().status(), JobStatus::Succeeded);
}

#[tokio::test]
async fn empty_queue_run_finishes_immediately() {
    let (queue, _) = setup_queue(MockAdapter::new(), MockKeyStore::new(), 3);

    let summary = finish(queue.run().unwrap()).await;

    assert_eq!(summary, RunSummary::default());
    assert!(!queue.is_running());
}

#[tokio::test]
async fn runs_in_position_order() {
    let adapter = MockAdapter::new();
    let (queue, _) = setup_queue(adapter.clone(), MockKeyStore::new(), 1);
    queue.add(source("a"));
    queue.add(source("b"));
    let c = queue.add(source("c"));
    queue.move_up(c).unwrap();

    finish(queue.run().unwrap()).await;

    assert_eq!(adapter.calls(), vec!["a", "c", "b"]);
}

#[tokio::test]
async fn jobs_added_mid_run_are_picked_up() {
    let gate = CancellationToken::new();
    let adapter = MockAdapter::new().on("first", MockBehavior::Gate(gate.clone()));
    let (queue, _) = setup_queue(adapter.clone(), MockKeyStore::new(), 1);
    let first = queue.add(source("first"));

    let handle = queue.run().unwrap();
    wait_for_status(&queue, first, JobStatus::Running).await;
    let second = queue.add(source("second"));
    gate.cancel();

    let summary = finish(handle).await;
    assert_eq!(summary.succeeded, 2);
    assert_eq!(queue.get(second).unwrap().status(), JobStatus::Succeeded);
    assert_eq!(adapter.calls(), vec!["first", "second"]);
}

#[tokio::test]
async fn idle_slot_wakes_for_late_job() {
    let gate = CancellationToken::new();
    let adapter = MockAdapter::new().on("long", MockBehavior::Gate(gate.clone()));
    let (queue, _) = setup_queue(adapter.clone(), MockKeyStore::new(), 2);
    let long = queue.add(source("long"));

    let handle = queue.run().unwrap();
    wait_for_status(&queue, long, JobStatus::Running).await;

    // The second slot is idle; it should take this job while "long" is busy.
    let late = queue.add(source("late"));
    wait_for_status(&queue, late, JobStatus::Succeeded).await;
    assert_eq!(queue.get(long).unwrap().status(), JobStatus::Running);

    gate.cancel();
    finish(handle).await;
    assert_eq!(queue.get(long).unwrap().status(), JobStatus::Succeeded);
}

#[tokio::test]
async fn reordering_mid_run_changes_schedule() {
    let gate = CancellationToken::new();
    let adapter = MockAdapter::new().on("a", MockBehavior::Gate(gate.clone()));
    let (queue, _) = setup_queue(adapter.clone(), MockKeyStore::new(), 1);
    let a = queue.add(source("a"));
    queue.add(source("b"));
    let c = queue.add(source("c"));

    let handle = queue.run().unwrap();
    wait_for_status(&queue, a, JobStatus::Running).await;
    queue.move_up(c).unwrap();
    gate.cancel();
    finish(handle).await;

    assert_eq!(adapter.calls(), vec!["a", "c", "b"]);
}

#[tokio::test]
async fn slot_count_bounds_concurrency() {
    let adapter = MockAdapter::new().with_default(MockBehavior::Delay(Duration::from_millis(50)));
    let (queue, _) = setup_queue(adapter.clone(), MockKeyStore::new(), 2);
    for name in ["a", "b", "c", "d", "e"] {
        queue.add(source(name));
    }

    let summary = finish(queue.run().unwrap()).await;

    assert_eq!(summary.succeeded, 5);
    assert_eq!(adapter.max_in_flight(), 2);
}

#[tokio::test]
async fn single_slot_is_sequential() {
    let adapter = MockAdapter::new().with_default(MockBehavior::Delay(Duration::from_millis(10)));
    let (queue, _) = setup_queue(adapter.clone(), MockKeyStore::new(), 1);
    for name in ["a", "b", "c"] {
        queue.add(source(name));
    }

    finish(queue.run().unwrap()).await;

    assert_eq!(adapter.max_in_flight(), 1);
}

#[tokio::test]
async fn every_transition_emits_one_update() {
    let adapter = MockAdapter::new().with_default(MockBehavior::Succeed(vec![]));
    let (queue, sink) = setup_queue(adapter, MockKeyStore::new(), 1);
    let id = queue.add(source("plain"));

    finish(queue.run().unwrap()).await;

    assert_eq!(
        sink.updates_for(id),
        vec![
            (JobStatus::Pending, 0),
            (JobStatus::Running, 0),
            (JobStatus::Succeeded, 100),
        ]
    );
}
