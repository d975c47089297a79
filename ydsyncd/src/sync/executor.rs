use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::context::SyncContext;
use super::ops::TaskError;
use super::status::{StatusManager, SyncState};
use super::task::{SyncTask, TaskOutcome};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("executor is shut down")]
    ShutDown,
    #[error("executor workers are already running")]
    AlreadyStarted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Run everything already queued, then stop.
    Drain,
    /// Cancel queued tasks and wait only for the running ones.
    Fast,
}

/// Executes one task. Implemented by the engine's operations layer.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &SyncTask) -> Result<(), TaskError>;
}

/// Two workers per core, at least one.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_mul(2))
        .unwrap_or(2)
        .max(1)
}

struct Job {
    task: SyncTask,
    done: oneshot::Sender<TaskOutcome>,
}

/// Resolves once the submitted task finished or was cancelled.
pub struct TaskHandle {
    rx: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    pub async fn outcome(self) -> TaskOutcome {
        self.rx.await.unwrap_or(TaskOutcome::Cancelled)
    }
}

struct Shared {
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    outstanding: Mutex<usize>,
    ctx: Arc<SyncContext>,
    status: Arc<StatusManager>,
}

impl Shared {
    fn submit(&self, task: SyncTask) -> Result<TaskHandle, ExecutorError> {
        let sender = lock(&self.sender);
        let sender = sender.as_ref().ok_or(ExecutorError::ShutDown)?;
        let (done, rx) = oneshot::channel();

        let mut outstanding = lock(&self.outstanding);
        tracing::debug!(task = %task, "task submitted");
        sender
            .send(Job { task, done })
            .map_err(|_| ExecutorError::ShutDown)?;
        *outstanding += 1;
        self.status.request(SyncState::Busy);
        self.status.progress(*outstanding);
        Ok(TaskHandle { rx })
    }

    /// Runs on the completing worker before the handle resolves.
    fn complete(&self, task: &SyncTask, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Success => tracing::debug!(task = %task, "task finished"),
            TaskOutcome::Failed(reason) => {
                tracing::warn!(task = %task, error = %reason, "task failed");
                self.ctx.set_error();
            }
            TaskOutcome::Cancelled => tracing::debug!(task = %task, "task cancelled"),
        }
        if let SyncTask::Download { path, .. } = task {
            self.ctx.finish_download(path);
        }

        let mut outstanding = lock(&self.outstanding);
        *outstanding = outstanding.saturating_sub(1);
        self.status.progress(*outstanding);
        if *outstanding == 0 {
            self.status.settle();
        }
    }
}

/// Cheap clonable handle for submitting tasks from inside running tasks.
#[derive(Clone)]
pub struct TaskSubmitter {
    shared: Arc<Shared>,
}

impl TaskSubmitter {
    pub fn submit(&self, task: SyncTask) -> Result<TaskHandle, ExecutorError> {
        self.shared.submit(task)
    }

    pub fn outstanding(&self) -> usize {
        *lock(&self.shared.outstanding)
    }
}

/// Fixed pool of worker tasks draining one shared queue.
pub struct TaskExecutor {
    shared: Arc<Shared>,
    queue: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: Mutex<bool>,
    size: usize,
}

impl TaskExecutor {
    /// Tasks submitted before [`TaskExecutor::start`] wait in the queue.
    pub fn new(size: usize, ctx: Arc<SyncContext>, status: Arc<StatusManager>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                sender: Mutex::new(Some(sender)),
                outstanding: Mutex::new(0),
                ctx,
                status,
            }),
            queue: Arc::new(tokio::sync::Mutex::new(receiver)),
            workers: Mutex::new(Vec::new()),
            started: Mutex::new(false),
            size: size.max(1),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn submitter(&self) -> TaskSubmitter {
        TaskSubmitter {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn start(&self, runner: Arc<dyn TaskRunner>) -> Result<(), ExecutorError> {
        let mut started = lock(&self.started);
        if *started {
            return Err(ExecutorError::AlreadyStarted);
        }
        if lock(&self.shared.sender).is_none() {
            return Err(ExecutorError::ShutDown);
        }
        *started = true;

        let mut workers = lock(&self.workers);
        for id in 0..self.size {
            workers.push(tokio::spawn(worker_loop(
                id,
                Arc::clone(&self.queue),
                Arc::clone(&runner),
                Arc::clone(&self.shared),
            )));
        }
        tracing::debug!(workers = self.size, "executor started");
        Ok(())
    }

    pub fn submit(&self, task: SyncTask) -> Result<TaskHandle, ExecutorError> {
        self.shared.submit(task)
    }

    pub fn outstanding(&self) -> usize {
        *lock(&self.shared.outstanding)
    }

    /// Refuses new submissions and stops the workers. Idempotent.
    pub async fn shutdown(&self, mode: ShutdownMode) {
        drop(lock(&self.shared.sender).take());

        if mode == ShutdownMode::Fast || !*lock(&self.started) {
            let mut queue = self.queue.lock().await;
            let mut cancelled = 0usize;
            while let Ok(job) = queue.try_recv() {
                self.shared.complete(&job.task, &TaskOutcome::Cancelled);
                let _ = job.done.send(TaskOutcome::Cancelled);
                cancelled += 1;
            }
            if cancelled > 0 {
                tracing::info!(cancelled, "queued tasks cancelled");
            }
        }

        let workers: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        for worker in workers {
            if let Err(err) = worker.await {
                tracing::error!(error = %err, "executor worker aborted");
            }
        }
    }
}

async fn worker_loop(
    id: usize,
    queue: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>,
    runner: Arc<dyn TaskRunner>,
    shared: Arc<Shared>,
) {
    loop {
        let job = queue.lock().await.recv().await;
        let Some(job) = job else {
            break;
        };
        let outcome = match AssertUnwindSafe(runner.run(&job.task))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => TaskOutcome::Success,
            Ok(Err(err)) => TaskOutcome::Failed(err.to_string()),
            Err(_) => TaskOutcome::Failed("task panicked".to_string()),
        };
        shared.complete(&job.task, &outcome);
        let _ = job.done.send(outcome);
    }
    tracing::trace!(worker = id, "executor worker stopped");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
#[path = "executor_tests.rs"]
mod tests;
