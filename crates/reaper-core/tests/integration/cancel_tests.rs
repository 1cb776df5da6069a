use reaper_core::testutil::{MockAdapter, MockBehavior, MockKeyStore};
use reaper_core::{JobStatus, QueueError};
use tokio_util::sync::CancellationToken;

use crate::integration::common::{finish, setup_queue, source, statuses, wait_for_status};

#[tokio::test]
async fn cancel_all_mid_run() {
    let adapter = MockAdapter::new().on("busy", MockBehavior::WaitForCancel);
    let (queue, sink) = setup_queue(adapter.clone(), MockKeyStore::new(), 1);
    let busy = queue.add(source("busy"));
    let waiting: Vec<_> = (0..5).map(|i| queue.add(source(&format!("p{i}")))).collect();

    let handle = queue.run().unwrap();
    wait_for_status(&queue, busy, JobStatus::Running).await;

    assert_eq!(queue.cancel_all(), 6);

    // Pending jobs are cancelled on the spot; the running one waits for its adapter.
    for id in &waiting {
        assert_eq!(queue.get(*id).unwrap().status(), JobStatus::Cancelled);
    }
    assert_eq!(queue.get(busy).unwrap().status(), JobStatus::Running);

    let summary = finish(handle).await;

    assert_eq!(queue.get(busy).unwrap().status(), JobStatus::Cancelled);
    assert_eq!(summary.cancelled, 6);
    assert_eq!(summary.succeeded + summary.failed, 0);
    assert_eq!(adapter.calls(), vec!["busy"]);
    for id in &waiting {
        assert_eq!(
            sink.updates_for(*id),
            vec![(JobStatus::Pending, 0), (JobStatus::Cancelled, 0)]
        );
        assert!(sink.errors_for(*id).is_empty());
    }
    assert!(sink.errors_for(busy).is_empty());
}

#[tokio::test]
async fn cancel_running_job_lands_when_adapter_returns() {
    let adapter = MockAdapter::new().on("busy", MockBehavior::WaitForCancel);
    let (queue, sink) = setup_queue(adapter, MockKeyStore::new(), 1);
    let busy = queue.add(source("busy"));
    let next = queue.add(source("next"));

    let handle = queue.run().unwrap();
    wait_for_status(&queue, busy, JobStatus::Running).await;

    queue.cancel(busy).unwrap();
    // Nothing has yielded yet, so the adapter has not observed the token.
    assert_eq!(queue.get(busy).unwrap().status(), JobStatus::Running);

    finish(handle).await;

    assert_eq!(queue.get(busy).unwrap().status(), JobStatus::Cancelled);
    assert_eq!(queue.get(next).unwrap().status(), JobStatus::Succeeded);
    assert!(sink.errors_for(busy).is_empty());
    assert!(sink.outputs_for(busy).is_empty());
}

#[tokio::test]
async fn cancellation_discards_late_output() {
    let gate = CancellationToken::new();
    let adapter = MockAdapter::new().on("stubborn", MockBehavior::IgnoreCancel(gate.clone()));
    let (queue, sink) = setup_queue(adapter, MockKeyStore::new(), 1);
    let stubborn = queue.add(source("stubborn"));

    let handle = queue.run().unwrap();
    wait_for_status(&queue, stubborn, JobStatus::Running).await;
    queue.cancel(stubborn).unwrap();
    gate.cancel();
    finish(handle).await;

    assert_eq!(queue.get(stubborn).unwrap().status(), JobStatus::Cancelled);
    assert!(sink.outputs_for(stubborn).is_empty());
    assert!(queue.get(stubborn).unwrap().progress() < 100);
}

#[tokio::test]
async fn remove_running_job_after_cancel() {
    let adapter = MockAdapter::new().with_default(MockBehavior::WaitForCancel);
    let (queue, _) = setup_queue(adapter, MockKeyStore::new(), 1);
    let id = queue.add(source("busy"));

    let handle = queue.run().unwrap();
    wait_for_status(&queue, id, JobStatus::Running).await;

    assert!(matches!(
        queue.remove(id),
        Err(QueueError::InvalidState {
            status: JobStatus::Running,
            ..
        })
    ));

    queue.cancel(id).unwrap();
    wait_for_status(&queue, id, JobStatus::Cancelled).await;
    queue.remove(id).unwrap();
    assert!(queue.is_empty());

    finish(handle).await;
}

#[tokio::test]
async fn jobs_added_after_cancel_all_wait_for_next_run() {
    let adapter = MockAdapter::new().on("busy", MockBehavior::WaitForCancel);
    let (queue, _) = setup_queue(adapter, MockKeyStore::new(), 1);
    let busy = queue.add(source("busy"));

    let handle = queue.run().unwrap();
    wait_for_status(&queue, busy, JobStatus::Running).await;
    queue.cancel_all();
    let late = queue.add(source("late"));
    finish(handle).await;

    assert_eq!(statuses(&queue), vec![JobStatus::Cancelled, JobStatus::Pending]);

    finish(queue.run().unwrap()).await;
    assert_eq!(queue.get(late).unwrap().status(), JobStatus::Succeeded);
}

#[tokio::test]
async fn cancelling_pending_job_mid_run_skips_it() {
    let gate = CancellationToken::new();
    let adapter = MockAdapter::new().on("first", MockBehavior::Gate(gate.clone()));
    let (queue, _) = setup_queue(adapter.clone(), MockKeyStore::new(), 1);
    let first = queue.add(source("first"));
    let skipped = queue.add(source("skipped"));
    queue.add(source("last"));

    let handle = queue.run().unwrap();
    wait_for_status(&queue, first, JobStatus::Running).await;
    queue.cancel(skipped).unwrap();
    gate.cancel();
    let summary = finish(handle).await;

    assert_eq!(adapter.calls(), vec!["first", "last"]);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.cancelled, 1);
}
