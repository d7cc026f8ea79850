//! Contract Test: Task Queue
//!
//! Constraints verified:
//! - Metrics submissions reach the registered handler in FIFO order
//! - A failing or panicking job never takes the worker down
//! - Enqueueing never blocks; a full queue rejects
//! - Shutdown lets the in-flight job finish

mod common;

use common::*;
use meshplane_core::queue::TaskQueue;
use meshplane_core::traits::{Job, SUBMIT_METRICS_JOB};
use meshplane_core::{ControlPlane, Error};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn submitted_metrics_reach_the_handler_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let (plane, _events) = ControlPlane::start(test_config(dir.path(), &[]), harness.collaborators())
        .await
        .unwrap();
    let handlers = plane.handler_config();

    for run in 0..4 {
        handlers.submit_metrics(json!({ "run": run })).unwrap();
    }
    assert!(eventually(|| harness.handler.handled() == 4).await);
    assert_eq!(
        harness.handler.payloads(),
        (0..4).map(|run| json!({ "run": run })).collect::<Vec<_>>()
    );

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn failing_jobs_do_not_stop_the_worker() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let (plane, _events) = ControlPlane::start(test_config(dir.path(), &[]), harness.collaborators())
        .await
        .unwrap();
    let handlers = plane.handler_config();

    harness.handler.set_mode(HandlerMode::Fail);
    handlers.submit_metrics(json!(1)).unwrap();
    assert!(eventually(|| handlers.queue.stats().failed == 1).await);

    harness.handler.set_mode(HandlerMode::Panic);
    handlers.submit_metrics(json!(2)).unwrap();
    assert!(eventually(|| handlers.queue.stats().failed == 2).await);

    harness.handler.set_mode(HandlerMode::Succeed);
    handlers.submit_metrics(json!(3)).unwrap();
    assert!(eventually(|| handlers.queue.stats().processed == 1).await);
    assert_eq!(harness.handler.payloads(), vec![json!(3)]);

    plane.shutdown().await.unwrap();
}

#[tokio::test]
async fn full_queue_rejects_immediately() {
    let queue = TaskQueue::with_capacity("loadTestReporterQueue", 2);
    let handler = Arc::new(CountingJobHandler::with_delay(Duration::from_millis(200)));
    queue.register_handler(SUBMIT_METRICS_JOB, handler.clone()).unwrap();

    // One job in flight, two waiting
    queue.enqueue(Job::submit_metrics(json!(0))).unwrap();
    assert!(eventually(|| handler.handled() == 1).await);
    queue.enqueue(Job::submit_metrics(json!(1))).unwrap();
    queue.enqueue(Job::submit_metrics(json!(2))).unwrap();

    let started = tokio::time::Instant::now();
    let rejected = queue.enqueue(Job::submit_metrics(json!(3)));
    assert!(started.elapsed() < Duration::from_millis(50), "enqueue must not block");
    assert!(matches!(rejected, Err(Error::JobFailure { .. })));
    assert_eq!(queue.stats().rejected, 1);

    queue.shutdown().await;
}

#[tokio::test]
async fn shutdown_finishes_in_flight_job() {
    let queue = TaskQueue::with_capacity("loadTestReporterQueue", 8);
    let handler = Arc::new(CountingJobHandler::with_delay(Duration::from_millis(100)));
    queue.register_handler(SUBMIT_METRICS_JOB, handler.clone()).unwrap();

    queue.enqueue(Job::submit_metrics(json!("in-flight"))).unwrap();
    assert!(eventually(|| handler.handled() == 1).await);
    queue.enqueue(Job::submit_metrics(json!("waiting"))).unwrap();

    queue.shutdown().await;

    assert_eq!(handler.payloads(), vec![json!("in-flight")]);
    assert_eq!(handler.handled(), 1, "waiting jobs are discarded");
    assert_eq!(queue.stats().processed, 1);
}
