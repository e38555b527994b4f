mod worker;

use crate::{
    config::{Config, QueuePolicy},
    executor::worker::{Shared, run_worker},
    release::ReleaseError,
    scheduler::ReadyTask,
    taskpool::Taskpool,
};
use crossbeam_deque::{Injector, Worker};
use derive_more::Debug;
use std::{sync::Mutex, thread, time::Instant};
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExecutorError {
    #[error("task {task} failed")]
    TaskFailed { task: String },
    #[error(transparent)]
    Release(#[from] ReleaseError),
}

/// Summary of a completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Task bodies executed, per worker.
    pub executed: Vec<usize>,
    /// Activation messages sent to other ranks.
    pub activations: usize,
}

impl RunReport {
    #[must_use]
    pub fn total_executed(&self) -> usize {
        self.executed.iter().sum()
    }
}

/// Runs the ready instances of a taskpool on a fixed pool of worker
/// threads until no local work is left.
///
/// Every worker owns a deque served LIFO or FIFO according to the
/// taskpool's queue policy. Seeds go through a shared injector; idle
/// workers steal from the injector first, then from their peers. The run
/// ends when every submitted task has completed.
#[must_use]
#[derive(Debug)]
pub struct Executor<'p, C: Config> {
    taskpool: &'p Taskpool<C>,
    #[debug(skip)]
    body: C::Body,
}

impl<'p, C: Config> Executor<'p, C> {
    pub fn new(taskpool: &'p Taskpool<C>, body: C::Body) -> Self {
        Self { taskpool, body }
    }

    /// Run from the startup tasks of the taskpool.
    ///
    /// # Errors
    /// If a task body fails or a release fails; the run stops at the first
    /// error.
    pub fn run(&self) -> Result<RunReport, ExecutorError> {
        let seeds = self.taskpool.startup_tasks()?;
        self.run_with(seeds)
    }

    /// Run from the given ready tasks, e.g. the ones released by incoming
    /// activations.
    ///
    /// # Errors
    /// See [`Self::run`].
    pub fn run_with(&self, seeds: Vec<ReadyTask<'p>>) -> Result<RunReport, ExecutorError> {
        let Self { taskpool, body } = self;
        let config = taskpool.config();
        let nb_workers = config.nb_workers;
        let workers: Vec<_> = (0..nb_workers)
            .map(|_| match config.queue_policy {
                QueuePolicy::Lifo => Worker::new_lifo(),
                QueuePolicy::Fifo => Worker::new_fifo(),
            })
            .collect();
        let injector = Injector::new();
        let shared = Shared::new(
            *taskpool,
            body,
            &injector,
            workers.iter().map(Worker::stealer).collect(),
            config.queue_policy,
        );
        shared.seed(seeds);

        let started = Instant::now();
        info!(workers = nb_workers, pending = shared.pending(), "run started");
        let executed = thread::scope(|s| {
            let handles: Vec<_> = workers
                .into_iter()
                .enumerate()
                .map(|(unit, local)| {
                    let shared = &shared;
                    thread::Builder::new()
                        .name(format!("ptg-worker-{unit}"))
                        .spawn_scoped(s, move || run_worker(unit, &local, shared))
                        .expect("Executor::run_with: [1]")
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("Executor::run_with: [2]"))
                .collect::<Vec<_>>()
        });

        if let Some(e) = shared.take_error() {
            error!(error = %e, "run aborted");
            return Err(e);
        }
        let report = RunReport {
            executed,
            activations: shared.activations(),
        };
        info!(
            executed = report.total_executed(),
            activations = report.activations,
            elapsed_ms = started.elapsed().as_millis(),
            "run finished"
        );
        Ok(report)
    }
}

/// First error of a run.
#[derive(Debug, Default)]
pub(crate) struct FirstError(Mutex<Option<ExecutorError>>);

impl FirstError {
    pub(crate) fn record(&self, e: ExecutorError) {
        let mut slot = self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        slot.get_or_insert(e);
    }

    pub(crate) fn take(&self) -> Option<ExecutorError> {
        self.0
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }
}
