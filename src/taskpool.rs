use crate::{
    config::{Config, ConfigError, RuntimeConfig},
    context::ExecutionContext,
    deps::DependencyTree,
    enumerate::Instances,
    release::ReleaseError,
    registry::Registry,
    remote::{ActivationError, InFlight},
    scheduler::{ReadyTask, Scheduler},
    task_class::{DefinitionError, TaskClass},
    types::{Rank, TaskClassId},
};
use derive_more::Debug;
use rayon::prelude::*;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TaskpoolError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// One graph execution on one rank: the registry of task classes, their
/// dependency trees, and the collaborators releases talk to.
#[must_use]
#[derive(Debug)]
pub struct Taskpool<C: Config> {
    pub(crate) registry: Arc<Registry>,
    pub(crate) trees: Vec<DependencyTree>,
    pub(crate) config: RuntimeConfig,
    #[debug(skip)]
    pub(crate) distribution: C::Distribution,
    #[debug(skip)]
    pub(crate) transport: C::Transport,
    pub(crate) in_flight: InFlight,
}

impl<C: Config> Taskpool<C> {
    /// # Errors
    /// If the registry has a dangling dependency or the runtime config is
    /// invalid.
    pub fn new(
        registry: Arc<Registry>,
        config: RuntimeConfig,
        distribution: C::Distribution,
        transport: C::Transport,
    ) -> Result<Self, TaskpoolError> {
        registry.validate()?;
        config.validate()?;
        let trees = registry.iter().map(DependencyTree::new).collect();
        info!(
            classes = registry.len(),
            rank = config.rank,
            nb_ranks = config.nb_ranks,
            "taskpool created"
        );
        Ok(Self {
            registry,
            trees,
            config,
            distribution,
            transport,
            in_flight: InFlight::new(),
        })
    }

    #[inline]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[inline]
    pub fn rank(&self) -> Rank {
        self.config.rank
    }

    #[inline]
    pub fn distribution(&self) -> &C::Distribution {
        &self.distribution
    }

    #[inline]
    pub fn transport(&self) -> &C::Transport {
        &self.transport
    }

    #[inline]
    pub fn tree(&self, class: TaskClassId) -> Option<&DependencyTree> {
        self.trees.get(class as usize)
    }

    pub(crate) fn class(&self, id: TaskClassId) -> Result<&TaskClass, ReleaseError> {
        self.registry.get(id).ok_or(ReleaseError::UnknownClass(id))
    }

    /// Activations sent and not yet acknowledged.
    #[inline]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load()
    }

    /// Record the confirmation of a previously sent activation.
    ///
    /// # Errors
    /// If no activation is outstanding.
    pub fn acknowledge_activation(&self) -> Result<(), ActivationError> {
        self.in_flight.acknowledge()
    }

    /// No remote obligation is outstanding.
    #[inline]
    pub fn is_quiescent(&self) -> bool {
        self.in_flight() == 0
    }

    /// Priority hint of a ready instance.
    pub(crate) fn priority(&self, task: &ExecutionContext<'_>) -> i32 {
        let Some(priority) = task.class().priority() else {
            return 0;
        };
        priority.eval(task.locals()).unwrap_or_else(|e| {
            warn!(task = %task, error = %e, "cannot evaluate priority");
            0
        })
    }

    /// Instances of every class whose inputs are all satisfied up front.
    ///
    /// Each one is marked through the dependency tree so a later release
    /// towards it cannot dispatch it a second time. Classes are scanned in
    /// parallel.
    ///
    /// # Errors
    /// On evaluation failure or dependency-tree failure.
    pub fn startup_tasks(&self) -> Result<Vec<ReadyTask<'_>>, ReleaseError> {
        let per_class = self
            .registry
            .iter()
            .collect::<Vec<_>>()
            .into_par_iter()
            .filter(|class| !class.is_boundary())
            .map(|class| self.startup_tasks_of(class))
            .collect::<Result<Vec<_>, _>>()?;
        let ready: Vec<_> = per_class.into_iter().flatten().collect();
        info!(count = ready.len(), "startup tasks");
        Ok(ready)
    }

    fn startup_tasks_of<'a>(&'a self, class: &'a TaskClass) -> Result<Vec<ReadyTask<'a>>, ReleaseError> {
        let mut ready = Vec::new();
        for instance in Instances::new(class) {
            let mut task = instance.map_err(|source| ReleaseError::evaluation(class, source))?;
            let boundary = self.boundary_inputs(&task)?;
            if boundary != class.dependencies_mask() {
                continue;
            }
            if self.deliver(&mut task, 0)? {
                let priority = self.priority(&task);
                ready.submit_ready(0, task, priority);
            }
        }
        Ok(ready)
    }
}

#[cfg(all(test, not(feature = "loom")))]
pub(crate) mod tests {
    use super::*;
    use crate::{
        distribution::SingleRank,
        expr::Expr,
        remote::NullTransport,
        scheduler::NoopBody,
        symbol::Symbol,
        task_class::{Access, Binding, Dep, Flow, TaskClassBuilder},
    };

    pub(crate) struct SingleRankConfig;

    impl Config for SingleRankConfig {
        type Distribution = SingleRank;
        type Transport = NullTransport;
        type Body = NoopBody;
    }

    pub(crate) fn taskpool(registry: Registry) -> Taskpool<SingleRankConfig> {
        let config = RuntimeConfig {
            nb_workers: 1,
            ..RuntimeConfig::default()
        };
        Taskpool::new(Arc::new(registry), config, SingleRank, NullTransport).unwrap()
    }

    #[test]
    fn startup_marks_boundary_only_instances() {
        // STEP(i): i == 0 reads from the collection, later ones from STEP(i-1).
        let mut registry = Registry::new();
        registry
            .register(
                TaskClassBuilder::new("STEP")
                    .local(Symbol::new("i", 0, 3))
                    .flow(
                        Flow::new("X", Access::InOut)
                            .input(Dep::collection("A").when(Expr::local(0).equals(0)))
                            .input(
                                Dep::task(0, 0, vec![Binding::value(Expr::local(0) - 1)])
                                    .when(Expr::local(0).gt(0)),
                            )
                            .output(
                                Dep::task(0, 0, vec![Binding::value(Expr::local(0) + 1)])
                                    .when(Expr::local(0).lt(3)),
                            ),
                    )
                    .priority(-Expr::local(0)),
            )
            .unwrap();
        let pool = taskpool(registry);
        let ready = pool.startup_tasks().unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].task.to_string(), "STEP_0");
        assert_eq!(ready[0].priority, 0);
        assert!(pool.startup_tasks().unwrap().is_empty());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = RuntimeConfig {
            rank: 1,
            ..RuntimeConfig::default()
        };
        assert!(matches!(
            Taskpool::<SingleRankConfig>::new(Arc::new(Registry::new()), config, SingleRank, NullTransport),
            Err(TaskpoolError::Config(_))
        ));
    }
}
