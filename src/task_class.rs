use crate::{
    expr::{Expr, ExprError},
    symbol::{Symbol, absolute_ranges},
    types::{
        ACTIVATION_BIT, DependencyMask, FlowIndex, IndexSet, LocalValue, MAX_LOCAL_COUNT,
        MAX_PARAM_COUNT, TaskClassId,
    },
};
use core::fmt::{self, Display, Formatter};
use derive_more::{BitAnd, BitOr};
use thiserror::Error;
use tracing::error;

/// Task-class definition failure.
///
/// Raised while building a class or validating a registry; the graph must
/// not be executed after one of these.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum DefinitionError {
    #[error("task class {class}: {count} locals exceed the maximum of {MAX_LOCAL_COUNT}")]
    TooManyLocals { class: String, count: usize },
    #[error(
        "task class {class}: {count} flows exceed the {MAX_PARAM_COUNT} bits of the dependency mask"
    )]
    MaskOverflow { class: String, count: usize },
    #[error("task class {class}: symbol {symbol} refers to a local that is not bound before it")]
    UnboundSymbol { class: String, symbol: String },
    #[error("task class {class}: cannot evaluate the range of symbol {symbol}: {source}")]
    Evaluation {
        class: String,
        symbol: String,
        source: ExprError,
    },
    #[error("task class {class}: symbol {symbol} has non-positive step {step}")]
    InvalidStep {
        class: String,
        symbol: String,
        step: LocalValue,
    },
    #[error("task class {class}: predicate #{index} refers to an unknown local")]
    UnboundPredicate { class: String, index: usize },
    #[error("task class {class}: duplicate flow {flow}")]
    DuplicateFlow { class: String, flow: String },
    #[error("task class {class}: flow {flow} has more than 255 dependencies in one direction")]
    TooManyDependencies { class: String, flow: String },
    #[error("task class {class}: input flow {flow} has no incoming dependency")]
    InputWithoutSource { class: String, flow: String },
    #[error("task class {class}: flow {flow} has a dependency referring to an unknown local")]
    UnboundDependency { class: String, flow: String },
    #[error("task class {class}: flow {flow} targets an invalid task class or flow")]
    InvalidTarget { class: String, flow: String },
    #[error("task class {class} is already registered")]
    DuplicateClass { class: String },
    #[error("too many task classes")]
    TooManyClasses,
}

/// Direction of a flow.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Access {
    In,
    Out,
    InOut,
}

impl Access {
    #[must_use]
    pub fn is_input(self) -> bool {
        matches!(self, Self::In | Self::InOut)
    }

    #[must_use]
    pub fn is_output(self) -> bool {
        matches!(self, Self::Out | Self::InOut)
    }
}

/// How one local of a dependency's target task is bound, as an expression
/// over the locals of the task owning the dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    Value(Expr),
    /// Fan-out over an inclusive range.
    Range { min: Expr, max: Expr },
}

impl Binding {
    #[must_use]
    pub fn value(expr: impl Into<Expr>) -> Self {
        Self::Value(expr.into())
    }

    #[must_use]
    pub fn range(min: impl Into<Expr>, max: impl Into<Expr>) -> Self {
        Self::Range {
            min: min.into(),
            max: max.into(),
        }
    }

    /// Inclusive window of target values.
    ///
    /// # Errors
    /// If the expressions cannot be evaluated under `bindings`.
    pub fn window<B: crate::expr::Bindings + ?Sized>(
        &self,
        bindings: &B,
    ) -> Result<(LocalValue, LocalValue), ExprError> {
        match self {
            Self::Value(expr) => {
                let value = expr.eval(bindings)?;
                Ok((value, value))
            }
            Self::Range { min, max } => Ok((min.eval(bindings)?, max.eval(bindings)?)),
        }
    }

    fn deepest_local(&self) -> Option<usize> {
        match self {
            Self::Value(expr) => expr.deepest_local(),
            Self::Range { min, max } => min.deepest_local().max(max.deepest_local()),
        }
    }
}

/// Other end of a dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepTarget {
    /// Initial or final data held by a data collection; no task on the
    /// other side.
    Collection(String),
    Task {
        class: TaskClassId,
        flow: FlowIndex,
        bindings: Vec<Binding>,
    },
}

/// One dependency edge of a flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dep {
    cond: Option<Expr>,
    target: DepTarget,
}

impl Dep {
    #[must_use]
    pub fn collection(name: impl Into<String>) -> Self {
        Self {
            cond: None,
            target: DepTarget::Collection(name.into()),
        }
    }

    #[must_use]
    pub fn task(class: TaskClassId, flow: FlowIndex, bindings: Vec<Binding>) -> Self {
        Self {
            cond: None,
            target: DepTarget::Task {
                class,
                flow,
                bindings,
            },
        }
    }

    /// Only follow this edge when `cond` holds.
    #[must_use]
    pub fn when(mut self, cond: Expr) -> Self {
        self.cond = Some(cond);
        self
    }

    #[inline]
    #[must_use]
    pub fn cond(&self) -> Option<&Expr> {
        self.cond.as_ref()
    }

    #[inline]
    #[must_use]
    pub fn target(&self) -> &DepTarget {
        &self.target
    }

    #[must_use]
    pub fn is_collection(&self) -> bool {
        matches!(self.target, DepTarget::Collection(_))
    }

    fn deepest_local(&self) -> Option<usize> {
        let cond = self.cond.as_ref().and_then(Expr::deepest_local);
        match &self.target {
            DepTarget::Collection(_) => cond,
            DepTarget::Task { bindings, .. } => bindings
                .iter()
                .map(Binding::deepest_local)
                .fold(cond, Option::max),
        }
    }
}

/// A named data slot of a task class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flow {
    name: String,
    access: Access,
    index: FlowIndex,
    dep_in: Vec<Dep>,
    dep_out: Vec<Dep>,
}

impl Flow {
    #[must_use]
    pub fn new(name: impl Into<String>, access: Access) -> Self {
        Self {
            name: name.into(),
            access,
            index: 0,
            dep_in: Vec::new(),
            dep_out: Vec::new(),
        }
    }

    /// Add an incoming dependency.
    #[must_use]
    pub fn input(mut self, dep: Dep) -> Self {
        self.dep_in.push(dep);
        self
    }

    /// Add an outgoing dependency.
    #[must_use]
    pub fn output(mut self, dep: Dep) -> Self {
        self.dep_out.push(dep);
        self
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    #[must_use]
    pub fn access(&self) -> Access {
        self.access
    }

    #[inline]
    #[must_use]
    pub fn index(&self) -> FlowIndex {
        self.index
    }

    /// Bit of this flow in a dependency cell.
    #[inline]
    #[must_use]
    pub fn mask(&self) -> DependencyMask {
        1 << self.index
    }

    #[inline]
    #[must_use]
    pub fn dep_in(&self) -> &[Dep] {
        &self.dep_in
    }

    #[inline]
    #[must_use]
    pub fn dep_out(&self) -> &[Dep] {
        &self.dep_out
    }
}

/// Static properties of a task class.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, BitOr, BitAnd)]
pub struct TaskClassFlags(u8);

impl TaskClassFlags {
    pub const EMPTY: Self = Self(0);
    /// Some input is produced by another task.
    pub const HAS_IN_IN_DEPENDENCIES: Self = Self(1);
    /// Some output flow has several conditional successors, so distinct
    /// instances may write the same successor slot.
    pub const HAS_OUT_OUT_DEPENDENCIES: Self = Self(1 << 1);
    /// Some input is unconditionally fed by a data collection.
    pub const HAS_IN_STRONG_DEPENDENCIES: Self = Self(1 << 2);

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Display for TaskClassFlags {
    /// `I`/`O`/`S` when set, `N` otherwise.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let show = |flag, c| if self.contains(flag) { c } else { 'N' };
        write!(
            f,
            "{}/{}/{}",
            show(Self::HAS_IN_IN_DEPENDENCIES, 'I'),
            show(Self::HAS_OUT_OUT_DEPENDENCIES, 'O'),
            show(Self::HAS_IN_STRONG_DEPENDENCIES, 'S'),
        )
    }
}

/// A parameterized family of tasks. Immutable once built.
#[derive(Debug, Clone)]
pub struct TaskClass {
    id: TaskClassId,
    name: String,
    locals: Vec<Symbol>,
    predicates: Vec<Expr>,
    /// Loop level at which each predicate becomes evaluable.
    predicate_levels: Vec<usize>,
    flows: Vec<Flow>,
    priority: Option<Expr>,
    dependencies_mask: DependencyMask,
    flags: TaskClassFlags,
    absolute: Vec<Option<(LocalValue, LocalValue)>>,
}

impl TaskClass {
    #[inline]
    #[must_use]
    pub fn id(&self) -> TaskClassId {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    #[must_use]
    pub fn nb_locals(&self) -> usize {
        self.locals.len()
    }

    #[inline]
    #[must_use]
    pub fn locals(&self) -> &[Symbol] {
        &self.locals
    }

    #[inline]
    #[must_use]
    pub fn predicates(&self) -> &[Expr] {
        &self.predicates
    }

    /// Predicates whose innermost referenced local is `level`. Predicates
    /// referring to no local at all belong to level 0.
    pub fn predicates_at(&self, level: usize) -> impl Iterator<Item = &Expr> {
        self.predicates
            .iter()
            .zip(&self.predicate_levels)
            .filter(move |&(_, &at)| at == level)
            .map(|(predicate, _)| predicate)
    }

    #[inline]
    #[must_use]
    pub fn flows(&self) -> &[Flow] {
        &self.flows
    }

    #[inline]
    #[must_use]
    pub fn flow(&self, index: FlowIndex) -> Option<&Flow> {
        self.flows.get(index as usize)
    }

    #[must_use]
    pub fn flow_by_name(&self, name: &str) -> Option<&Flow> {
        self.flows.iter().find(|flow| flow.name == name)
    }

    #[inline]
    #[must_use]
    pub fn priority(&self) -> Option<&Expr> {
        self.priority.as_ref()
    }

    /// Input bits that must all be set for an instance to be ready.
    #[inline]
    #[must_use]
    pub fn dependencies_mask(&self) -> DependencyMask {
        self.dependencies_mask
    }

    #[inline]
    #[must_use]
    pub fn flags(&self) -> TaskClassFlags {
        self.flags
    }

    /// Range of local `level` over all bindings of the enclosing locals,
    /// predicates ignored.
    #[inline]
    #[must_use]
    pub fn absolute_range(&self, level: usize) -> Option<(LocalValue, LocalValue)> {
        self.absolute.get(level).copied().flatten()
    }

    /// Boundary classes stand for a collection's initial or final data and
    /// have no instance space.
    #[inline]
    #[must_use]
    pub fn is_boundary(&self) -> bool {
        self.locals.is_empty()
    }
}

/// Builder performing the definition-time checks of a [`TaskClass`].
#[must_use]
#[derive(Debug, Clone)]
pub struct TaskClassBuilder {
    name: String,
    locals: Vec<Symbol>,
    predicates: Vec<Expr>,
    flows: Vec<Flow>,
    priority: Option<Expr>,
}

impl TaskClassBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            locals: Vec::new(),
            predicates: Vec::new(),
            flows: Vec::new(),
            priority: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append the next (inner) local of the loop nest.
    pub fn local(mut self, symbol: Symbol) -> Self {
        self.locals.push(symbol);
        self
    }

    pub fn predicate(mut self, predicate: Expr) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// Append a flow; its bit is its position.
    pub fn flow(mut self, flow: Flow) -> Self {
        self.flows.push(flow);
        self
    }

    pub fn priority(mut self, priority: Expr) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Check the definition and compute the dependency mask, flags and
    /// absolute ranges.
    ///
    /// # Errors
    /// See [`DefinitionError`]; the error is also logged.
    pub fn build(self, id: TaskClassId) -> Result<TaskClass, DefinitionError> {
        self.build_inner(id).inspect_err(|e| error!(error = %e, "invalid task class"))
    }

    fn build_inner(self, id: TaskClassId) -> Result<TaskClass, DefinitionError> {
        let Self {
            name,
            locals,
            predicates,
            mut flows,
            priority,
        } = self;
        let class = || name.clone();
        let nb_locals = locals.len();

        if nb_locals > MAX_LOCAL_COUNT {
            return Err(DefinitionError::TooManyLocals {
                class: class(),
                count: nb_locals,
            });
        }
        if flows.len() > MAX_PARAM_COUNT {
            return Err(DefinitionError::MaskOverflow {
                class: class(),
                count: flows.len(),
            });
        }
        for (level, symbol) in locals.iter().enumerate() {
            let deepest = symbol
                .min_expr()
                .deepest_local()
                .max(symbol.max_expr().deepest_local());
            if deepest.is_some_and(|deepest| deepest >= level) {
                return Err(DefinitionError::UnboundSymbol {
                    class: class(),
                    symbol: symbol.name().to_owned(),
                });
            }
            if symbol.step() <= 0 {
                return Err(DefinitionError::InvalidStep {
                    class: class(),
                    symbol: symbol.name().to_owned(),
                    step: symbol.step(),
                });
            }
        }

        let mut predicate_levels = Vec::with_capacity(predicates.len());
        for (index, predicate) in predicates.iter().enumerate() {
            let level = predicate.deepest_local().unwrap_or(0);
            if level >= nb_locals.max(1) {
                return Err(DefinitionError::UnboundPredicate {
                    class: class(),
                    index,
                });
            }
            predicate_levels.push(level);
        }

        let mut names = IndexSet::default();
        let mut dependencies_mask = 0;
        let mut flags = TaskClassFlags::EMPTY;
        for (index, flow) in flows.iter_mut().enumerate() {
            if !names.insert(flow.name.clone()) {
                return Err(DefinitionError::DuplicateFlow {
                    class: class(),
                    flow: flow.name.clone(),
                });
            }
            flow.index = index.try_into().expect("TaskClassBuilder::build: [1]");
            if flow.dep_in.len() > usize::from(u8::MAX) || flow.dep_out.len() > usize::from(u8::MAX) {
                return Err(DefinitionError::TooManyDependencies {
                    class: class(),
                    flow: flow.name.clone(),
                });
            }
            let unbound = flow
                .dep_in
                .iter()
                .chain(&flow.dep_out)
                .any(|dep| dep.deepest_local().is_some_and(|deepest| deepest >= nb_locals));
            if unbound {
                return Err(DefinitionError::UnboundDependency {
                    class: class(),
                    flow: flow.name.clone(),
                });
            }
            if flow.access.is_input() {
                if flow.dep_in.is_empty() {
                    return Err(DefinitionError::InputWithoutSource {
                        class: class(),
                        flow: flow.name.clone(),
                    });
                }
                dependencies_mask |= flow.mask();
                if flow.dep_in.iter().any(|dep| !dep.is_collection()) {
                    flags = flags | TaskClassFlags::HAS_IN_IN_DEPENDENCIES;
                }
                if flow
                    .dep_in
                    .iter()
                    .any(|dep| dep.is_collection() && dep.cond.is_none())
                {
                    flags = flags | TaskClassFlags::HAS_IN_STRONG_DEPENDENCIES;
                }
            }
            if flow.access.is_output()
                && flow.dep_out.iter().filter(|dep| dep.cond.is_some()).count() > 1
            {
                flags = flags | TaskClassFlags::HAS_OUT_OUT_DEPENDENCIES;
            }
        }
        debug_assert_eq!(dependencies_mask & ACTIVATION_BIT, 0);

        let absolute = absolute_ranges(&locals).map_err(|(level, source)| {
            DefinitionError::Evaluation {
                class: class(),
                symbol: locals[level].name().to_owned(),
                source,
            }
        })?;

        Ok(TaskClass {
            id,
            name,
            locals,
            predicates,
            predicate_levels,
            flows,
            priority,
            dependencies_mask,
            flags,
            absolute,
        })
    }
}
