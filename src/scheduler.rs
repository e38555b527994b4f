use crate::{context::ExecutionContext, types::ExecutionUnitId};

/// Accepts instances whose inputs are all satisfied.
pub trait Scheduler<'a> {
    /// Execution unit the caller runs on; passed back as the placement hint
    /// of every submission.
    fn execution_unit(&self) -> ExecutionUnitId {
        0
    }

    fn submit_ready(&mut self, hint: ExecutionUnitId, task: ExecutionContext<'a>, priority: i32);
}

/// A submission captured by a collecting scheduler.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ReadyTask<'a> {
    pub hint: ExecutionUnitId,
    pub task: ExecutionContext<'a>,
    pub priority: i32,
}

impl<'a> Scheduler<'a> for Vec<ReadyTask<'a>> {
    fn submit_ready(&mut self, hint: ExecutionUnitId, task: ExecutionContext<'a>, priority: i32) {
        self.push(ReadyTask { hint, task, priority });
    }
}

/// Outcome of a task body.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    /// Release the outputs of the instance.
    Done,
    /// Abort the run.
    Failed,
}

/// What a task does once it is ready.
pub trait TaskBody: Send + Sync {
    fn execute(&self, task: &ExecutionContext<'_>) -> TaskStatus;
}

impl<F> TaskBody for F
where
    F: Fn(&ExecutionContext<'_>) -> TaskStatus + Send + Sync,
{
    fn execute(&self, task: &ExecutionContext<'_>) -> TaskStatus {
        self(task)
    }
}

/// Body that does nothing, for graphs run only for their dependency
/// structure.
#[derive(Debug, Copy, Clone, Default)]
pub struct NoopBody;

impl TaskBody for NoopBody {
    fn execute(&self, _task: &ExecutionContext<'_>) -> TaskStatus {
        TaskStatus::Done
    }
}
