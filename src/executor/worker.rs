use crate::{
    config::{Config, QueuePolicy},
    context::ExecutionContext,
    executor::{ExecutorError, FirstError},
    scheduler::{ReadyTask, Scheduler, TaskBody, TaskStatus},
    taskpool::Taskpool,
    types::ExecutionUnitId,
};
use core::{
    iter,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};
use crossbeam_deque::{Injector, Stealer, Worker};
use std::thread;
use tracing::{debug, trace};

/// State shared by the workers of one run.
pub(super) struct Shared<'r, 'p, C: Config> {
    taskpool: &'p Taskpool<C>,
    body: &'r C::Body,
    injector: &'r Injector<ExecutionContext<'p>>,
    stealers: Vec<Stealer<ExecutionContext<'p>>>,
    policy: QueuePolicy,
    /// Tasks submitted and not yet completed.
    pending: AtomicUsize,
    activations: AtomicUsize,
    abort: AtomicBool,
    error: FirstError,
}

impl<'r, 'p, C: Config> Shared<'r, 'p, C> {
    pub(super) fn new(
        taskpool: &'p Taskpool<C>,
        body: &'r C::Body,
        injector: &'r Injector<ExecutionContext<'p>>,
        stealers: Vec<Stealer<ExecutionContext<'p>>>,
        policy: QueuePolicy,
    ) -> Self {
        Self {
            taskpool,
            body,
            injector,
            stealers,
            policy,
            pending: AtomicUsize::new(0),
            activations: AtomicUsize::new(0),
            abort: AtomicBool::new(false),
            error: FirstError::default(),
        }
    }

    pub(super) fn seed(&self, mut seeds: Vec<ReadyTask<'p>>) {
        // Highest priority first out of the injector.
        seeds.sort_by_key(|ready| core::cmp::Reverse(ready.priority));
        self.pending.fetch_add(seeds.len(), Ordering::AcqRel);
        for ready in seeds {
            self.injector.push(ready.task);
        }
    }

    pub(super) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub(super) fn activations(&self) -> usize {
        self.activations.load(Ordering::Acquire)
    }

    pub(super) fn take_error(&self) -> Option<ExecutorError> {
        self.error.take()
    }

    fn fail(&self, e: ExecutorError) {
        self.error.record(e);
        self.abort.store(true, Ordering::Release);
    }

    fn find_task(&self, local: &Worker<ExecutionContext<'p>>) -> Option<ExecutionContext<'p>> {
        local.pop().or_else(|| {
            iter::repeat_with(|| {
                self.injector
                    .steal_batch_and_pop(local)
                    .or_else(|| self.stealers.iter().map(Stealer::steal).collect())
            })
            .find(|steal| !steal.is_retry())
            .and_then(|steal| steal.success())
        })
    }
}

/// Scheduler handed to releases run by one worker. Collects the ready
/// tasks so they can be pushed in priority order.
struct WorkerScheduler<'p> {
    unit: ExecutionUnitId,
    ready: Vec<ReadyTask<'p>>,
}

impl<'p> Scheduler<'p> for WorkerScheduler<'p> {
    fn execution_unit(&self) -> ExecutionUnitId {
        self.unit
    }

    fn submit_ready(&mut self, hint: ExecutionUnitId, task: ExecutionContext<'p>, priority: i32) {
        self.ready.submit_ready(hint, task, priority);
    }
}

/// Worker loop. Returns the number of task bodies it executed.
pub(super) fn run_worker<'p, C: Config>(
    unit: ExecutionUnitId,
    local: &Worker<ExecutionContext<'p>>,
    shared: &Shared<'_, 'p, C>,
) -> usize {
    let mut scheduler = WorkerScheduler {
        unit,
        ready: Vec::new(),
    };
    let mut executed = 0;
    let mut idle_rounds = 0u32;
    while !shared.abort.load(Ordering::Acquire) {
        let Some(task) = shared.find_task(local) else {
            if shared.pending() == 0 {
                break;
            }
            idle_rounds = idle_rounds.saturating_add(1);
            if idle_rounds < 64 {
                core::hint::spin_loop();
            } else {
                thread::yield_now();
            }
            continue;
        };
        idle_rounds = 0;
        trace!(unit, task = %task, "executing");
        if shared.body.execute(&task) == TaskStatus::Failed {
            shared.fail(ExecutorError::TaskFailed {
                task: task.to_string(),
            });
            break;
        }
        executed += 1;
        match shared.taskpool.complete_execution(&task, &mut scheduler) {
            Ok(outcome) => {
                shared.activations.fetch_add(outcome.activations, Ordering::AcqRel);
            }
            Err(e) => {
                shared.fail(e.into());
                break;
            }
        }
        let ready = &mut scheduler.ready;
        // The popped end of the deque gets the highest priority.
        match shared.policy {
            QueuePolicy::Lifo => ready.sort_by_key(|ready| ready.priority),
            QueuePolicy::Fifo => ready.sort_by_key(|ready| core::cmp::Reverse(ready.priority)),
        }
        shared.pending.fetch_add(ready.len(), Ordering::AcqRel);
        for ready in ready.drain(..) {
            local.push(ready.task);
        }
        shared.pending.fetch_sub(1, Ordering::AcqRel);
    }
    debug!(unit, executed, "worker finished");
    executed
}
