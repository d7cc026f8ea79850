//! In-process task queue
//!
//! A named FIFO queue with exactly one registered job handler. Enqueueing
//! never blocks: a full queue rejects the job. Each job runs at most once,
//! in its own task, so a failing or panicking job is logged and dropped
//! without affecting the worker or the caller.
//!
//! ## Shutdown
//!
//! `shutdown()` lets the in-flight job finish, discards jobs still waiting
//! and waits for the worker to exit.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::traits::job_handler::{Job, JobHandler};

/// Queue counters
#[derive(Debug, Default)]
struct QueueStats {
    enqueued: AtomicU64,
    rejected: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of the queue counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStatsSnapshot {
    /// Jobs accepted by `enqueue`
    pub enqueued: u64,
    /// Jobs refused by `enqueue` (full, stopped)
    pub rejected: u64,
    /// Jobs whose handler returned `Ok`
    pub processed: u64,
    /// Jobs that failed, panicked or had no matching handler
    pub failed: u64,
}

/// Named work queue with a single handler
pub struct TaskQueue {
    name: String,
    tx: mpsc::Sender<Job>,
    rx: Mutex<Option<mpsc::Receiver<Job>>>,
    shutdown_tx: watch::Sender<bool>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    stats: Arc<QueueStats>,
    closed: AtomicBool,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl TaskQueue {
    /// Create a queue from configuration
    pub fn new(config: &QueueConfig) -> Self {
        Self::with_capacity(config.name.clone(), config.capacity)
    }

    /// Create a queue holding at most `capacity` pending jobs
    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            tx,
            rx: Mutex::new(Some(rx)),
            shutdown_tx,
            worker: tokio::sync::Mutex::new(None),
            stats: Arc::new(QueueStats::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Counters
    pub fn stats(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            enqueued: self.stats.enqueued.load(Ordering::SeqCst),
            rejected: self.stats.rejected.load(Ordering::SeqCst),
            processed: self.stats.processed.load(Ordering::SeqCst),
            failed: self.stats.failed.load(Ordering::SeqCst),
        }
    }

    /// Whether `shutdown()` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Register the handler for jobs named `job_name` and start the worker
    ///
    /// # Errors
    ///
    /// - `Error::Config`: a handler is already registered or the queue is stopped
    pub fn register_handler(
        &self,
        job_name: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(Error::config(format!("Queue {} is stopped", self.name)));
        }

        let rx = self
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| {
                Error::config(format!("Queue {} already has a handler", self.name))
            })?;

        let worker = Worker {
            queue: self.name.clone(),
            job_name: job_name.into(),
            handler,
            stats: Arc::clone(&self.stats),
        };
        tracing::info!(queue = %self.name, job = %worker.job_name, "Job handler registered");

        let handle = tokio::spawn(worker.run(rx, self.shutdown_tx.subscribe()));
        match self.worker.try_lock() {
            Ok(mut slot) => *slot = Some(handle),
            Err(_) => {
                // Only shutdown() holds this lock, and it has already closed the queue
                handle.abort();
                return Err(Error::config(format!("Queue {} is stopping", self.name)));
            }
        }
        Ok(())
    }

    /// Submit a job without waiting
    ///
    /// # Errors
    ///
    /// - `Error::JobFailure`: the queue is full or stopped; the job is dropped
    pub fn enqueue(&self, job: Job) -> Result<()> {
        if self.is_closed() {
            self.stats.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(Error::job_failure(&job.name, format!("queue {} is stopped", self.name)));
        }

        match self.tx.try_send(job) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(TrySendError::Full(job)) => {
                self.stats.rejected.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(queue = %self.name, job = %job.name, "Task queue full, rejecting job");
                Err(Error::job_failure(job.name, format!("queue {} is full", self.name)))
            }
            Err(TrySendError::Closed(job)) => {
                self.stats.rejected.fetch_add(1, Ordering::SeqCst);
                Err(Error::job_failure(job.name, format!("queue {} is stopped", self.name)))
            }
        }
    }

    /// Stop the worker
    ///
    /// Idempotent. The job in flight completes; waiting jobs are discarded.
    pub async fn shutdown(&self) {
        let mut worker = self.worker.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) && worker.is_none() {
            return;
        }

        self.shutdown_tx.send_replace(true);
        if let Some(handle) = worker.take()
            && let Err(e) = handle.await
        {
            tracing::error!(queue = %self.name, "Task queue worker failed: {}", e);
        }

        tracing::info!(queue = %self.name, "Task queue stopped");
    }
}

struct Worker {
    queue: String,
    job_name: String,
    handler: Arc<dyn JobHandler>,
    stats: Arc<QueueStats>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<Job>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;

                // Only ever flips to true; a dropped sender also means stop
                _ = shutdown.changed() => break,

                job = rx.recv() => match job {
                    Some(job) => self.run_job(job).await,
                    None => break,
                },
            }
        }

        rx.close();
        let mut discarded = 0usize;
        while rx.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            tracing::warn!(queue = %self.queue, discarded, "Discarded pending jobs on shutdown");
        }
        tracing::debug!(queue = %self.queue, "Task queue worker exited");
    }

    async fn run_job(&self, job: Job) {
        if job.name != self.job_name {
            self.stats.failed.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(
                queue = %self.queue,
                job = %job.name,
                "No handler registered for job, dropping"
            );
            return;
        }

        let name = job.name.clone();
        let handler = Arc::clone(&self.handler);
        let task = tokio::spawn(async move { handler.handle(job).await });

        match task.await {
            Ok(Ok(())) => {
                self.stats.processed.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(queue = %self.queue, job = %name, "Job completed");
            }
            Ok(Err(e)) => {
                self.stats.failed.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(queue = %self.queue, job = %name, "Job failed: {}", e);
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::SeqCst);
                tracing::error!(queue = %self.queue, job = %name, "Job task aborted: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::job_handler::SUBMIT_METRICS_JOB;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct Recording {
        seen: Mutex<Vec<serde_json::Value>>,
    }

    #[async_trait]
    impl JobHandler for Recording {
        async fn handle(&self, job: Job) -> Result<()> {
            if job.payload == json!("boom") {
                return Err(Error::job_failure(job.name, "boom"));
            }
            if job.payload == json!("panic") {
                panic!("handler panicked");
            }
            self.seen.lock().unwrap().push(job.payload);
            Ok(())
        }
    }

    async fn settle(queue: &TaskQueue, done: u64) {
        for _ in 0..200 {
            let stats = queue.stats();
            if stats.processed + stats.failed >= done {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("queue did not settle: {:?}", queue.stats());
    }

    #[tokio::test]
    async fn test_jobs_run_in_fifo_order() {
        let queue = TaskQueue::with_capacity("test", 8);
        let handler = Arc::new(Recording { seen: Mutex::new(Vec::new()) });
        queue.register_handler(SUBMIT_METRICS_JOB, handler.clone()).unwrap();

        for i in 0..3 {
            queue.enqueue(Job::submit_metrics(json!(i))).unwrap();
        }
        settle(&queue, 3).await;

        assert_eq!(*handler.seen.lock().unwrap(), vec![json!(0), json!(1), json!(2)]);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_failures_and_panics_are_contained() {
        let queue = TaskQueue::with_capacity("test", 8);
        let handler = Arc::new(Recording { seen: Mutex::new(Vec::new()) });
        queue.register_handler(SUBMIT_METRICS_JOB, handler.clone()).unwrap();

        queue.enqueue(Job::submit_metrics(json!("boom"))).unwrap();
        queue.enqueue(Job::submit_metrics(json!("panic"))).unwrap();
        queue.enqueue(Job::new("unknownJob", json!(null))).unwrap();
        queue.enqueue(Job::submit_metrics(json!("ok"))).unwrap();
        settle(&queue, 4).await;

        let stats = queue.stats();
        assert_eq!(stats.failed, 3);
        assert_eq!(stats.processed, 1);
        assert_eq!(*handler.seen.lock().unwrap(), vec![json!("ok")]);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_queue_rejects_without_blocking() {
        // No handler yet, so nothing drains
        let queue = TaskQueue::with_capacity("test", 1);
        queue.enqueue(Job::submit_metrics(json!(1))).unwrap();

        let err = queue.enqueue(Job::submit_metrics(json!(2))).unwrap_err();
        assert!(matches!(err, Error::JobFailure { .. }));
        assert_eq!(queue.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_single_handler_and_idempotent_shutdown() {
        let queue = TaskQueue::with_capacity("test", 4);
        let handler = Arc::new(Recording { seen: Mutex::new(Vec::new()) });
        queue.register_handler(SUBMIT_METRICS_JOB, handler.clone()).unwrap();
        assert!(queue.register_handler(SUBMIT_METRICS_JOB, handler).is_err());

        queue.shutdown().await;
        queue.shutdown().await;
        assert!(queue.is_closed());
        assert!(queue.enqueue(Job::submit_metrics(json!(1))).is_err());
    }
}
