//! Bounded worker pool with fail-fast fan-in.
//!
//! Every phase of a batch runs through [`WorkerPool::run`]: a feeder task
//! pushes jobs into a bounded queue, a fixed number of workers pull from
//! it, and the calling task consumes the `progress` / `done` / `fail`
//! signals. The phase succeeds once one `done` per job has arrived and
//! fails on the first `fail`. After a failure the phase token is
//! cancelled and every worker is joined (or aborted after the drain
//! timeout) before `run` returns, so no task outlives its phase.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use recipes_events::{channels, Signal, TaskSignals};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// One unit of work queued for a phase.
#[derive(Debug, Clone)]
pub struct Job<T> {
    pub id: String,
    pub payload: T,
}

impl<T> Job<T> {
    pub fn new(id: impl Into<String>, payload: T) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

/// Work performed for each job of a phase.
///
/// Implementations must consume `signals` exactly once via
/// [`TaskSignals::done`] or [`TaskSignals::finish`]. `cancel` fires when
/// the phase has failed and the job should stop early.
#[async_trait]
pub trait JobHandler<T>: Send + Sync + 'static {
    async fn handle(&self, payload: T, signals: TaskSignals, cancel: CancellationToken);
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PhaseError {
    /// A task reported a batch-fatal failure. Carries its message verbatim.
    #[error("{0}")]
    Fatal(String),

    #[error("phase cancelled")]
    Cancelled,

    /// Every task ended but fewer completions than jobs arrived.
    #[error("phase ended with {completed} of {expected} tasks reporting")]
    Incomplete { expected: usize, completed: usize },
}

/// What a successful phase produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseReport {
    pub succeeded: Vec<String>,
    /// Jobs whose own unit failed without failing the phase, with the reason.
    pub failed: Vec<(String, String)>,
}

impl PhaseReport {
    pub fn completed(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

/// Shape of one phase's pool.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: &'static str,
    workers: usize,
    queue_capacity: usize,
    drain_timeout: Duration,
}

impl WorkerPool {
    pub fn new(name: &'static str, workers: usize) -> Self {
        Self {
            name,
            workers: workers.max(1),
            queue_capacity: workers.max(1),
            drain_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Run `handler` over every job and wait for the phase outcome.
    ///
    /// Cancelling `cancel` stops the phase; the phase itself only cancels a
    /// child of it.
    pub async fn run<T, H>(
        &self,
        jobs: Vec<Job<T>>,
        handler: Arc<H>,
        cancel: &CancellationToken,
    ) -> Result<PhaseReport, PhaseError>
    where
        T: Send + 'static,
        H: JobHandler<T>,
    {
        let expected = jobs.len();
        if expected == 0 {
            return Ok(PhaseReport::default());
        }

        let phase = self.name;
        let phase_cancel = cancel.child_token();
        let (signals, mut receiver) = channels();
        let (queue_tx, queue_rx) = mpsc::channel::<Job<T>>(self.queue_capacity);
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let mut tasks = JoinSet::new();

        // Blocks on a full queue until a worker takes a job.
        let feeder_cancel = phase_cancel.clone();
        tasks.spawn(async move {
            for job in jobs {
                tokio::select! {
                    _ = feeder_cancel.cancelled() => break,
                    sent = queue_tx.send(job) => if sent.is_err() { break },
                }
            }
        });

        let worker_count = self.workers.min(expected);
        for worker_id in 0..worker_count {
            let queue = Arc::clone(&queue_rx);
            let handler = Arc::clone(&handler);
            let signals = signals.clone();
            let cancel = phase_cancel.clone();
            tasks.spawn(async move {
                loop {
                    let next = {
                        let mut queue = queue.lock().await;
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => None,
                            job = queue.recv() => job,
                        }
                    };
                    let Some(job) = next else { break };
                    tracing::debug!(phase, worker_id, job = %job.id, "Job started");
                    let task = signals.task(job.id);
                    handler.handle(job.payload, task, cancel.clone()).await;
                }
                tracing::debug!(phase, worker_id, "Worker exiting");
            });
        }
        drop(signals);

        tracing::debug!(phase, jobs = expected, workers = worker_count, "Phase started");

        let mut report = PhaseReport::default();
        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(PhaseError::Cancelled),
                signal = receiver.recv() => match signal {
                    Some(Signal::Progress(message)) => {
                        tracing::info!(phase, "{message}");
                    }
                    Some(Signal::Done(completion)) => {
                        match completion.error {
                            Some(error) => {
                                tracing::warn!(phase, job = %completion.id, error = %error, "Job failed");
                                report.failed.push((completion.id, error));
                            }
                            None => report.succeeded.push(completion.id),
                        }
                        if report.completed() == expected {
                            break Ok(());
                        }
                    }
                    Some(Signal::Fail(message)) => {
                        tracing::error!(phase, "{message}");
                        break Err(PhaseError::Fatal(message));
                    }
                    None => {
                        break Err(PhaseError::Incomplete {
                            expected,
                            completed: report.completed(),
                        })
                    }
                },
            }
        };

        if outcome.is_err() {
            phase_cancel.cancel();
        }
        self.drain(&mut tasks).await;
        for message in receiver.drain_progress() {
            tracing::info!(phase, "{message}");
        }

        outcome.map(|()| report)
    }

    /// Join every task, aborting whatever is still running at the timeout.
    async fn drain(&self, tasks: &mut JoinSet<()>) {
        let joined = tokio::time::timeout(self.drain_timeout, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    if e.is_panic() {
                        tracing::error!(phase = self.name, error = %e, "Worker panicked");
                    }
                }
            }
        })
        .await;

        if joined.is_err() {
            tracing::warn!(
                phase = self.name,
                remaining = tasks.len(),
                timeout_secs = self.drain_timeout.as_secs(),
                "Drain timed out, aborting remaining tasks",
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }
}
