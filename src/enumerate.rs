//! Odometer-style walk over the instance space of a task class.
//!
//! Position 0 is the outermost local. Advancing bumps the innermost level;
//! on exhaustion the walk moves up one level, bumps it, and re-seeds every
//! level below it from its first value. A level that has no first value
//! under the new outer bindings makes the walk move up again.

use crate::{
    context::ExecutionContext,
    expr::ExprError,
    symbol::RangeEvaluator,
    task_class::TaskClass,
    types::{LocalValue, MAX_LOCAL_COUNT},
};
use core::iter::FusedIterator;

type Window = (LocalValue, LocalValue);

const UNBOUNDED: Window = (LocalValue::MIN, LocalValue::MAX);

/// Per-level cursor operations, restricted to the given windows.
struct Odometer<'e, 'a> {
    eval: &'e RangeEvaluator<'a>,
    windows: &'e [Window],
}

impl Odometer<'_, '_> {
    fn clamp(&self, level: usize, ctx: &mut ExecutionContext<'_>, value: Option<LocalValue>) -> bool {
        let (lo, hi) = self.windows[level];
        match value {
            Some(value) if value <= hi => {
                let local = ctx.local_mut(level);
                local.min = local.min.max(lo);
                local.max = local.max.min(hi);
                true
            }
            _ => false,
        }
    }

    fn first(&self, level: usize, ctx: &mut ExecutionContext<'_>) -> Result<bool, ExprError> {
        let (lo, _) = self.windows[level];
        let value = self.eval.first_value_from(level, ctx, lo)?;
        Ok(self.clamp(level, ctx, value))
    }

    fn next(&self, level: usize, ctx: &mut ExecutionContext<'_>) -> Result<bool, ExprError> {
        let value = self.eval.next_value(level, ctx)?;
        Ok(self.clamp(level, ctx, value))
    }

    /// Bump the deepest level below `top` that can still advance. Returns
    /// the first level that needs re-seeding.
    fn bump(&self, mut top: usize, ctx: &mut ExecutionContext<'_>) -> Result<Option<usize>, ExprError> {
        while top > 0 {
            top -= 1;
            if self.next(top, ctx)? {
                return Ok(Some(top + 1));
            }
        }
        Ok(None)
    }

    /// Seed levels `from..` with their first values, backtracking upwards
    /// when a level turns out empty.
    fn settle(&self, mut level: usize, ctx: &mut ExecutionContext<'_>) -> Result<bool, ExprError> {
        let nb_locals = ctx.nb_locals();
        while level < nb_locals {
            if self.first(level, ctx)? {
                level += 1;
                continue;
            }
            match self.bump(level, ctx)? {
                Some(from) => level = from,
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    fn advance(&self, ctx: &mut ExecutionContext<'_>) -> Result<bool, ExprError> {
        match self.bump(ctx.nb_locals(), ctx)? {
            Some(from) => self.settle(from, ctx),
            None => Ok(false),
        }
    }
}

/// Bind `ctx` to the first valid instance of its class.
///
/// Returns `false` if the instance space is empty.
///
/// # Errors
/// On evaluation failure of a bound or predicate.
pub fn set_initial(eval: &RangeEvaluator<'_>, ctx: &mut ExecutionContext<'_>) -> Result<bool, ExprError> {
    let windows = [UNBOUNDED; MAX_LOCAL_COUNT];
    Odometer {
        eval,
        windows: &windows,
    }
    .settle(0, ctx)
}

/// Move a fully bound `ctx` to the next valid instance.
///
/// Returns `false` once the instance space is exhausted; `ctx` is then left
/// in an unspecified state.
///
/// # Errors
/// On evaluation failure of a bound or predicate.
pub fn next_instance(eval: &RangeEvaluator<'_>, ctx: &mut ExecutionContext<'_>) -> Result<bool, ExprError> {
    let windows = [UNBOUNDED; MAX_LOCAL_COUNT];
    Odometer {
        eval,
        windows: &windows,
    }
    .advance(ctx)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    Fresh,
    Active,
    Done,
}

/// Lazy, finite and non-restartable sequence of the instances of a class,
/// in lexicographic order with the outermost local most significant.
///
/// Yields `Err` at most once, then ends.
#[must_use]
#[derive(Debug, Clone)]
pub struct Instances<'a> {
    eval: RangeEvaluator<'a>,
    ctx: ExecutionContext<'a>,
    windows: [Window; MAX_LOCAL_COUNT],
    state: State,
}

impl<'a> Instances<'a> {
    /// All instances accepted by the predicates of `class`.
    pub fn new(class: &'a TaskClass) -> Self {
        Self::with_evaluator(RangeEvaluator::new(class))
    }

    pub fn with_evaluator(eval: RangeEvaluator<'a>) -> Self {
        Self {
            ctx: ExecutionContext::new(eval.class()),
            eval,
            windows: [UNBOUNDED; MAX_LOCAL_COUNT],
            state: State::Fresh,
        }
    }

    /// Restrict each local to an inclusive window on top of its own range.
    /// Missing trailing windows are unbounded.
    pub fn within(mut self, windows: &[Window]) -> Self {
        for (slot, &window) in self.windows.iter_mut().zip(windows) {
            *slot = window;
        }
        self
    }

    fn step(&mut self) -> Result<bool, ExprError> {
        let Self {
            eval,
            ctx,
            windows,
            state,
        } = self;
        let odometer = Odometer {
            eval: &*eval,
            windows: &windows[..],
        };
        match state {
            State::Fresh => odometer.settle(0, ctx),
            State::Active => odometer.advance(ctx),
            State::Done => Ok(false),
        }
    }
}

impl<'a> Iterator for Instances<'a> {
    type Item = Result<ExecutionContext<'a>, ExprError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.state == State::Done {
            return None;
        }
        // A class without locals has exactly one (empty) instance.
        if self.ctx.nb_locals() == 0 {
            self.state = State::Done;
            return Some(Ok(self.ctx));
        }
        match self.step() {
            Ok(true) => {
                self.state = State::Active;
                Some(Ok(self.ctx))
            }
            Ok(false) => {
                self.state = State::Done;
                None
            }
            Err(e) => {
                self.state = State::Done;
                Some(Err(e))
            }
        }
    }
}

impl FusedIterator for Instances<'_> {}

/// Number of instances of `class` accepted by its predicates.
///
/// # Errors
/// On evaluation failure of a bound or predicate.
pub fn count_instances(class: &TaskClass) -> Result<usize, ExprError> {
    Instances::new(class).try_fold(0, |count, instance| instance.map(|_| count + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{expr::Expr, symbol::Symbol, task_class::TaskClassBuilder};

    fn values(instances: Instances<'_>) -> Vec<Vec<LocalValue>> {
        instances.map(|ctx| ctx.unwrap().value_vec()).collect()
    }

    #[test]
    fn lexicographic_order() {
        let class = TaskClassBuilder::new("T")
            .local(Symbol::new("i", 0, 2))
            .local(Symbol::new("j", 0, 1))
            .build(0)
            .unwrap();
        assert_eq!(
            values(Instances::new(&class)),
            [[0, 0], [0, 1], [1, 0], [1, 1], [2, 0], [2, 1]]
        );
        assert_eq!(count_instances(&class), Ok(6));
    }

    #[test]
    fn empty_inner_levels_are_skipped() {
        // m in [k+1, 2]: k = 2 has no m at all.
        let class = TaskClassBuilder::new("T")
            .local(Symbol::new("k", 0, 2))
            .local(Symbol::new("m", Expr::local(0) + 1, 2))
            .build(0)
            .unwrap();
        assert_eq!(values(Instances::new(&class)), [[0, 1], [0, 2], [1, 2]]);
    }

    #[test]
    fn empty_class_yields_nothing() {
        let class = TaskClassBuilder::new("T")
            .local(Symbol::new("k", 3, 2))
            .build(0)
            .unwrap();
        assert_eq!(count_instances(&class), Ok(0));
    }

    #[test]
    fn predicates_and_windows() {
        let class = TaskClassBuilder::new("T")
            .local(Symbol::new("i", 0, 5))
            .local(Symbol::new("j", 0, 5))
            .predicate(Expr::local(0).equals(Expr::local(1)))
            .build(0)
            .unwrap();
        assert_eq!(count_instances(&class), Ok(6));
        let windowed = Instances::new(&class).within(&[(2, 3), (0, 9)]);
        assert_eq!(values(windowed), [[2, 2], [3, 3]]);

        let unfiltered = Instances::with_evaluator(RangeEvaluator::without_predicates(&class))
            .within(&[(4, 4), (4, 9)]);
        let contexts: Vec<_> = unfiltered.map(Result::unwrap).collect();
        assert_eq!(contexts.len(), 2);
        assert_eq!((contexts[1].local(1).min, contexts[1].local(1).max), (4, 5));
    }

    #[test]
    fn set_initial_then_next() {
        let class = TaskClassBuilder::new("T")
            .local(Symbol::new("i", 1, 2))
            .local(Symbol::new("j", Expr::local(0), 2))
            .build(0)
            .unwrap();
        let eval = RangeEvaluator::new(&class);
        let mut ctx = ExecutionContext::new(&class);
        assert_eq!(set_initial(&eval, &mut ctx), Ok(true));
        assert_eq!(ctx.value_vec(), [1, 1]);
        assert_eq!(next_instance(&eval, &mut ctx), Ok(true));
        assert_eq!(next_instance(&eval, &mut ctx), Ok(true));
        assert_eq!(ctx.value_vec(), [2, 2]);
        assert_eq!(next_instance(&eval, &mut ctx), Ok(false));
    }

    #[test]
    fn evaluation_errors_end_the_walk() {
        let class = TaskClassBuilder::new("T")
            .local(Symbol::new("i", 0, 1))
            .predicate((Expr::constant(1) / Expr::local(0)).equals(1))
            .build(0)
            .unwrap();
        let mut instances = Instances::new(&class);
        assert_eq!(instances.next().map(|r| r.err()), Some(Some(ExprError::DivisionByZero)));
        assert!(instances.next().is_none());
    }
}
