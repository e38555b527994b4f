//! Dependency release protocol.
//!
//! Releasing one outgoing edge of a finished instance walks the successor
//! instances the edge designates. Each candidate accepted by the
//! successor's predicates has the destination flow's bit OR'd into its cell
//! together with [`ACTIVATION_BIT`]. The thread that sets the activation bit
//! is the unique first visitor: it also ORs in the inputs fed by boundary
//! sources. Whichever OR turns the masked cell into the class's
//! dependencies mask hands the instance to the scheduler, so every instance
//! is dispatched exactly once.
//!
//! Candidates rejected by a predicate may belong to another rank. When
//! forwarding is enabled, each owning rank gets one activation message per
//! finished instance, naming the output flows with successors there.

use crate::{
    config::Config,
    context::ExecutionContext,
    deps::DependencyError,
    distribution::DataDistribution,
    enumerate::Instances,
    expr::ExprError,
    remote::{ActivationError, ActivationMessage, RemoteDeps},
    scheduler::Scheduler,
    symbol::RangeEvaluator,
    task_class::{Dep, DepTarget, TaskClass},
    taskpool::Taskpool,
    types::{ACTIVATION_BIT, DependencyMask, FlowIndex, LOCAL_SENTINEL, MAX_LOCAL_COUNT, TaskClassId},
};
use derive_more::{Add, AddAssign};
use thiserror::Error;
use tracing::{debug, trace, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReleaseError {
    #[error("task class {class}: {source}")]
    Evaluation { class: String, source: ExprError },
    #[error(transparent)]
    Dependency(#[from] DependencyError),
    #[error(transparent)]
    Activation(#[from] ActivationError),
    #[error("unknown task class {0}")]
    UnknownClass(TaskClassId),
    #[error("task class {class} has no outgoing dependency {dep} on flow {flow}")]
    UnknownDependency {
        class: String,
        flow: FlowIndex,
        dep: u8,
    },
}

impl ReleaseError {
    pub(crate) fn evaluation(class: &TaskClass, source: ExprError) -> Self {
        Self::Evaluation {
            class: class.name().to_owned(),
            source,
        }
    }
}

/// What one release produced.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Add, AddAssign)]
pub struct ReleaseOutcome {
    /// Instances handed to the scheduler.
    pub ready: usize,
    /// Activation messages sent to other ranks.
    pub activations: usize,
}

#[inline]
fn flow_bit(flow: FlowIndex) -> DependencyMask {
    1 << flow
}

/// `true` for the OR that completes the goal.
#[inline]
fn reaches_goal(pre: DependencyMask, post: DependencyMask, goal: DependencyMask) -> bool {
    pre & !ACTIVATION_BIT != goal && post & !ACTIVATION_BIT == goal
}

impl<C: Config> Taskpool<C> {
    /// Release edge `dep` of output flow `flow` of the finished instance
    /// `origin`, handing every successor that becomes ready to `scheduler`.
    ///
    /// # Errors
    /// On evaluation failure, dependency-tree failure, or an edge that does
    /// not exist.
    pub fn release_output_dependencies<'a, S: Scheduler<'a>>(
        &'a self,
        origin: &ExecutionContext<'_>,
        flow: FlowIndex,
        dep: u8,
        scheduler: &mut S,
    ) -> Result<ReleaseOutcome, ReleaseError> {
        let mut remote = self.remote_deps();
        let mut outcome = self.release_edge(origin, flow, dep, scheduler, remote.as_mut())?;
        outcome.activations += self.send_activations(origin, remote);
        Ok(outcome)
    }

    /// Release every outgoing edge of a finished instance.
    ///
    /// Each remote rank owning a successor receives a single activation
    /// naming all output flows that reach it.
    ///
    /// # Errors
    /// See [`Self::release_output_dependencies`].
    pub fn complete_execution<'a, S: Scheduler<'a>>(
        &'a self,
        task: &ExecutionContext<'_>,
        scheduler: &mut S,
    ) -> Result<ReleaseOutcome, ReleaseError> {
        let mut remote = self.remote_deps();
        let mut outcome = self.release_outputs(task, DependencyMask::MAX, scheduler, remote.as_mut())?;
        outcome.activations += self.send_activations(task, remote);
        trace!(task = %task, ready = outcome.ready, activations = outcome.activations, "execution completed");
        Ok(outcome)
    }

    /// Perform the local part of a release announced by another rank.
    ///
    /// Only instances this rank owns are touched; nothing is forwarded.
    ///
    /// # Errors
    /// On a malformed message, or see [`Self::release_output_dependencies`].
    pub fn handle_activation<'a, S: Scheduler<'a>>(
        &'a self,
        bytes: &[u8],
        scheduler: &mut S,
    ) -> Result<ReleaseOutcome, ReleaseError> {
        let message = ActivationMessage::decode(bytes)?;
        let class = self
            .registry
            .get(message.class)
            .ok_or(ActivationError::UnknownClass(message.class))?;
        let nb_locals = class.nb_locals();
        if message.locals[nb_locals..].iter().any(|&value| value != LOCAL_SENTINEL) {
            return Err(ActivationError::LocalCount {
                class: class.name().to_owned(),
                count: message.bound_locals().len(),
            }
            .into());
        }
        let outputs = class
            .flows()
            .iter()
            .filter(|flow| flow.access().is_output())
            .fold(0, |outputs, flow| outputs | flow_bit(flow.index()));
        if message.outputs == 0 || message.outputs & !outputs != 0 {
            return Err(ActivationError::UnknownOutputs {
                class: class.name().to_owned(),
                outputs: message.outputs,
            }
            .into());
        }
        let origin = ExecutionContext::with_values(class, &message.locals[..nb_locals]);
        trace!(origin = %origin, outputs = message.outputs, "activation received");
        self.release_outputs(&origin, message.outputs, scheduler, None)
    }

    /// Forwarding state for one finished instance, `None` when successors
    /// on other ranks are not activated from here.
    fn remote_deps(&self) -> Option<RemoteDeps> {
        let config = self.config();
        (config.forward_remote && config.nb_ranks > 1).then(RemoteDeps::new)
    }

    fn send_activations(&self, origin: &ExecutionContext<'_>, remote: Option<RemoteDeps>) -> usize {
        remote.map_or(0, |remote| {
            remote.activate(origin.class().id(), origin.values(), &self.transport, &self.in_flight)
        })
    }

    /// Release every edge of the output flows of `origin` selected by
    /// `outputs`.
    fn release_outputs<'a, S: Scheduler<'a>>(
        &'a self,
        origin: &ExecutionContext<'_>,
        outputs: DependencyMask,
        scheduler: &mut S,
        mut remote: Option<&mut RemoteDeps>,
    ) -> Result<ReleaseOutcome, ReleaseError> {
        let mut outcome = ReleaseOutcome::default();
        let flows = origin
            .class()
            .flows()
            .iter()
            .filter(|flow| flow.access().is_output() && outputs & flow_bit(flow.index()) != 0);
        for flow in flows {
            for dep in 0..flow.dep_out().len() {
                let dep = u8::try_from(dep).expect("Taskpool::release_outputs: [1]");
                outcome += self.release_edge(origin, flow.index(), dep, scheduler, remote.as_deref_mut())?;
            }
        }
        Ok(outcome)
    }

    fn release_edge<'a, S: Scheduler<'a>>(
        &'a self,
        origin: &ExecutionContext<'_>,
        flow_index: FlowIndex,
        dep_index: u8,
        scheduler: &mut S,
        mut remote: Option<&mut RemoteDeps>,
    ) -> Result<ReleaseOutcome, ReleaseError> {
        let class = origin.class();
        let mut outcome = ReleaseOutcome::default();
        let dep = class
            .flow(flow_index)
            .and_then(|flow| flow.dep_out().get(dep_index as usize))
            .ok_or_else(|| ReleaseError::UnknownDependency {
                class: class.name().to_owned(),
                flow: flow_index,
                dep: dep_index,
            })?;
        if let Some(cond) = dep.cond() {
            let holds = cond
                .holds(origin.locals())
                .map_err(|source| ReleaseError::evaluation(class, source))?;
            if !holds {
                return Ok(outcome);
            }
        }
        let DepTarget::Task {
            class: target,
            flow: dest_flow,
            bindings,
        } = dep.target()
        else {
            return Ok(outcome);
        };
        let successor = self.class(*target)?;
        if successor.is_boundary() {
            return Ok(outcome);
        }
        let dest_mask = successor
            .flow(*dest_flow)
            .map(|flow| flow.mask())
            .ok_or_else(|| ReleaseError::UnknownDependency {
                class: class.name().to_owned(),
                flow: flow_index,
                dep: dep_index,
            })?;

        let mut windows = [(0, 0); MAX_LOCAL_COUNT];
        for (window, binding) in windows.iter_mut().zip(bindings) {
            let (lo, hi) = binding
                .window(origin.locals())
                .map_err(|source| ReleaseError::evaluation(class, source))?;
            if lo > hi {
                return Ok(outcome);
            }
            *window = (lo, hi);
        }

        let candidates = Instances::with_evaluator(RangeEvaluator::without_predicates(successor))
            .within(&windows[..bindings.len()]);
        for candidate in candidates {
            let mut task = candidate.map_err(|source| ReleaseError::evaluation(successor, source))?;
            if !self.accepts(&task)? {
                if let Some(remote) = remote.as_deref_mut() {
                    self.forward(flow_index, &task, remote);
                }
                continue;
            }
            if self.deliver(&mut task, dest_mask)? {
                let priority = self.priority(&task);
                let hint = scheduler.execution_unit();
                debug!(task = %task, priority, "task ready");
                scheduler.submit_ready(hint, task, priority);
                outcome.ready += 1;
            }
        }
        Ok(outcome)
    }

    /// Record the owner of a rejected candidate, if it is another rank.
    fn forward(&self, flow: FlowIndex, task: &ExecutionContext<'_>, remote: &mut RemoteDeps) {
        let values = task.values();
        let owner = self
            .distribution
            .owning_rank(task.class(), &values[..task.nb_locals()]);
        if owner == self.rank() {
            warn!(task = %task, "instance rejected by its predicates is owned by this rank");
            return;
        }
        if remote.mark(owner, flow) {
            trace!(task = %task, rank = owner, flow, "remote successor");
        }
    }

    fn accepts(&self, task: &ExecutionContext<'_>) -> Result<bool, ReleaseError> {
        let class = task.class();
        for predicate in class.predicates() {
            let holds = predicate
                .holds(task.locals())
                .map_err(|source| ReleaseError::evaluation(class, source))?;
            if !holds {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn is_boundary_source(&self, dep: &Dep) -> Result<bool, ReleaseError> {
        match dep.target() {
            DepTarget::Collection(_) => Ok(true),
            DepTarget::Task { class, .. } => Ok(self.class(*class)?.is_boundary()),
        }
    }

    /// Input flows of `task` that no task will ever feed: the first incoming
    /// dependency whose condition holds reads from a boundary source, or no
    /// condition holds at all. A condition that cannot be evaluated counts
    /// as holding.
    pub(crate) fn boundary_inputs(&self, task: &ExecutionContext<'_>) -> Result<DependencyMask, ReleaseError> {
        let class = task.class();
        let mut mask = 0;
        for flow in class.flows().iter().filter(|flow| flow.access().is_input()) {
            let mut satisfied = true;
            for dep in flow.dep_in() {
                let active = dep.cond().is_none_or(|cond| {
                    cond.holds(task.locals()).unwrap_or_else(|e| {
                        warn!(task = %task, flow = flow.name(), error = %e, "cannot evaluate input condition, assuming it holds");
                        true
                    })
                });
                if active {
                    satisfied = self.is_boundary_source(dep)?;
                    break;
                }
            }
            if satisfied {
                mask |= flow.mask();
            }
        }
        Ok(mask)
    }

    /// OR `bits` into the cell of `task`. Returns whether this call made
    /// the instance ready.
    pub(crate) fn deliver(&self, task: &mut ExecutionContext<'_>, bits: DependencyMask) -> Result<bool, ReleaseError> {
        let class = task.class();
        let goal = class.dependencies_mask();
        let tree = &self.trees[class.id() as usize];
        let cell = tree.locate_or_create(task)?;
        let (pre, post) = cell.or(bits | ACTIVATION_BIT);
        let mut ready = reaches_goal(pre, post, goal);
        if pre & ACTIVATION_BIT == 0 {
            let boundary = self.boundary_inputs(task)? & !post;
            if boundary != 0 {
                let (pre, post) = cell.or(boundary);
                ready |= reaches_goal(pre, post, goal);
            } else if goal == 0 {
                ready = true;
            }
        }
        Ok(ready)
    }
}
