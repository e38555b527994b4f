//! Local symbols and the symbolic range evaluator.
//!
//! A symbol's range is given by `min`/`max` expressions over the locals that
//! enclose it and walked with a constant step. Predicates of the task class
//! are checked at the level of the innermost local they reference, so a
//! partially bound context only ever evaluates what it can evaluate.

use crate::{
    context::ExecutionContext,
    expr::{Expr, ExprError},
    task_class::TaskClass,
    types::{LocalValue, MAX_LOCAL_COUNT},
};

/// Definition of one local symbol of a task class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    name: String,
    min: Expr,
    max: Expr,
    step: LocalValue,
}

impl Symbol {
    /// Symbol ranging over `min..=max` with unit step.
    #[must_use]
    pub fn new(name: impl Into<String>, min: impl Into<Expr>, max: impl Into<Expr>) -> Self {
        Self {
            name: name.into(),
            min: min.into(),
            max: max.into(),
            step: 1,
        }
    }

    #[must_use]
    pub fn with_step(mut self, step: LocalValue) -> Self {
        self.step = step;
        self
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    #[must_use]
    pub fn min_expr(&self) -> &Expr {
        &self.min
    }

    #[inline]
    #[must_use]
    pub fn max_expr(&self) -> &Expr {
        &self.max
    }

    #[inline]
    #[must_use]
    pub fn step(&self) -> LocalValue {
        self.step
    }

    /// `true` if neither bound depends on another local.
    #[must_use]
    pub fn is_standalone(&self) -> bool {
        self.min.deepest_local().is_none() && self.max.deepest_local().is_none()
    }
}

/// Result of validating the currently bound value of a local.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Validity {
    Valid,
    /// Outside the symbol's `[min, max]` under the current outer bindings,
    /// or not on the step grid.
    OutOfRange,
    /// Within range, but a predicate evaluable at this level is false.
    Rejected,
}

/// Evaluates ranges of the locals of one task class.
#[derive(Debug, Copy, Clone)]
pub struct RangeEvaluator<'a> {
    class: &'a TaskClass,
    use_predicates: bool,
}

impl<'a> RangeEvaluator<'a> {
    #[must_use]
    pub fn new(class: &'a TaskClass) -> Self {
        Self {
            class,
            use_predicates: true,
        }
    }

    /// Evaluator that ignores the predicates of the class.
    #[must_use]
    pub fn without_predicates(class: &'a TaskClass) -> Self {
        Self {
            class,
            use_predicates: false,
        }
    }

    #[inline]
    #[must_use]
    pub fn class(&self) -> &'a TaskClass {
        self.class
    }

    #[inline]
    #[must_use]
    pub fn uses_predicates(&self) -> bool {
        self.use_predicates
    }

    /// Range of local `level` under the outer locals bound in `ctx`.
    ///
    /// # Errors
    /// If the bounds refer to a local that is not bound yet.
    pub fn range(
        &self,
        level: usize,
        ctx: &ExecutionContext<'_>,
    ) -> Result<(LocalValue, LocalValue), ExprError> {
        let symbol = &self.class.locals()[level];
        let bound = ctx.bound(level);
        Ok((symbol.min.eval(bound)?, symbol.max.eval(bound)?))
    }

    fn predicates_hold(&self, level: usize, ctx: &ExecutionContext<'_>) -> Result<bool, ExprError> {
        if !self.use_predicates {
            return Ok(true);
        }
        let bound = ctx.bound(level + 1);
        for predicate in self.class.predicates_at(level) {
            if !predicate.holds(bound)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Scan `from..=max` along the step grid for the first value accepted by
    /// the predicates; binds it on success.
    fn scan_from(
        &self,
        level: usize,
        ctx: &mut ExecutionContext<'_>,
        from: LocalValue,
    ) -> Result<Option<LocalValue>, ExprError> {
        let (min, max) = self.range(level, ctx)?;
        let step = self.class.locals()[level].step;
        {
            let local = ctx.local_mut(level);
            local.min = min;
            local.max = max;
        }
        let mut value = from;
        while value <= max {
            ctx.local_mut(level).value = value;
            if self.predicates_hold(level, ctx)? {
                return Ok(Some(value));
            }
            value = match value.checked_add(step) {
                Some(next) => next,
                None => break,
            };
        }
        Ok(None)
    }

    /// Bind local `level` to its first valid value.
    ///
    /// # Errors
    /// On evaluation failure of a bound or predicate.
    pub fn first_value(
        &self,
        level: usize,
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<Option<LocalValue>, ExprError> {
        let (min, _) = self.range(level, ctx)?;
        self.scan_from(level, ctx, min)
    }

    /// Bind local `level` to its first valid value not below `from`.
    ///
    /// # Errors
    /// On evaluation failure of a bound or predicate.
    pub fn first_value_from(
        &self,
        level: usize,
        ctx: &mut ExecutionContext<'_>,
        from: LocalValue,
    ) -> Result<Option<LocalValue>, ExprError> {
        let (min, _) = self.range(level, ctx)?;
        if from <= min {
            return self.scan_from(level, ctx, min);
        }
        let step = i64::from(self.class.locals()[level].step);
        let gap = i64::from(from) - i64::from(min);
        let aligned = i64::from(min) + (gap + step - 1) / step * step;
        match LocalValue::try_from(aligned) {
            Ok(start) => self.scan_from(level, ctx, start),
            Err(_) => Ok(None),
        }
    }

    /// Bind local `level` to the first valid value strictly after the
    /// current one.
    ///
    /// # Errors
    /// On evaluation failure of a bound or predicate.
    pub fn next_value(
        &self,
        level: usize,
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<Option<LocalValue>, ExprError> {
        let step = self.class.locals()[level].step;
        match ctx.local(level).value.checked_add(step) {
            Some(from) => self.scan_from(level, ctx, from),
            None => Ok(None),
        }
    }

    /// Last valid value of local `level`, leaving the context bound to it.
    ///
    /// # Errors
    /// On evaluation failure of a bound or predicate.
    pub fn last_value(
        &self,
        level: usize,
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<Option<LocalValue>, ExprError> {
        let mut last = self.first_value(level, ctx)?;
        if let Some(mut value) = last {
            while let Some(next) = self.next_value(level, ctx)? {
                value = next;
            }
            ctx.local_mut(level).value = value;
            last = Some(value);
        }
        Ok(last)
    }

    /// Smallest value local `level` can take over every binding of the
    /// enclosing locals, ignoring predicates. `None` if the symbol can never
    /// be bound.
    #[must_use]
    pub fn absolute_min(&self, level: usize) -> Option<LocalValue> {
        self.class.absolute_range(level).map(|(min, _)| min)
    }

    /// Largest value local `level` can take, see [`Self::absolute_min`].
    #[must_use]
    pub fn absolute_max(&self, level: usize) -> Option<LocalValue> {
        self.class.absolute_range(level).map(|(_, max)| max)
    }

    /// Check the value currently bound to local `level` against its range
    /// and the predicates evaluable at this level.
    ///
    /// # Errors
    /// On evaluation failure of a bound or predicate.
    pub fn validate(&self, level: usize, ctx: &ExecutionContext<'_>) -> Result<Validity, ExprError> {
        let (min, max) = self.range(level, ctx)?;
        let step = self.class.locals()[level].step;
        let value = ctx.local(level).value;
        let off_grid = (i64::from(value) - i64::from(min)) % i64::from(step) != 0;
        if value < min || value > max || off_grid {
            return Ok(Validity::OutOfRange);
        }
        if self.predicates_hold(level, ctx)? {
            Ok(Validity::Valid)
        } else {
            Ok(Validity::Rejected)
        }
    }
}

/// Absolute range of every symbol of a loop nest, ignoring predicates.
///
/// Bounds are propagated level by level with interval arithmetic over the
/// ranges of the enclosing symbols. Nests using an operator without an
/// interval rule fall back to walking every binding of the enclosing symbols.
///
/// On failure returns the level of the offending symbol.
pub(crate) fn absolute_ranges(
    locals: &[Symbol],
) -> Result<Vec<Option<(LocalValue, LocalValue)>>, (usize, ExprError)> {
    match interval_ranges(locals)? {
        Some(ranges) => Ok(ranges),
        None => walked_ranges(locals),
    }
}

/// `Ok(None)` if some bound has no interval rule.
fn interval_ranges(
    locals: &[Symbol],
) -> Result<Option<Vec<Option<(LocalValue, LocalValue)>>>, (usize, ExprError)> {
    let mut hulls: Vec<(LocalValue, LocalValue)> = Vec::with_capacity(locals.len());
    for (level, symbol) in locals.iter().enumerate() {
        let min = symbol.min.interval(&hulls).map_err(|e| (level, e))?;
        let max = symbol.max.interval(&hulls).map_err(|e| (level, e))?;
        let (Some((lo, _)), Some((_, hi))) = (min, max) else {
            return Ok(None);
        };
        // Empty for every binding: no deeper symbol is ever bound either.
        if lo > hi {
            break;
        }
        hulls.push((lo, hi));
    }
    let mut ranges: Vec<_> = hulls.into_iter().map(Some).collect();
    ranges.resize(locals.len(), None);
    Ok(Some(ranges))
}

fn walked_ranges(locals: &[Symbol]) -> Result<Vec<Option<(LocalValue, LocalValue)>>, (usize, ExprError)> {
    fn visit(
        locals: &[Symbol],
        level: usize,
        prefix: &mut [LocalValue; MAX_LOCAL_COUNT],
        ranges: &mut [Option<(LocalValue, LocalValue)>],
    ) -> Result<(), (usize, ExprError)> {
        let symbol = &locals[level];
        let bound = &prefix[..level];
        let min = symbol.min.eval(bound).map_err(|e| (level, e))?;
        let max = symbol.max.eval(bound).map_err(|e| (level, e))?;
        if min > max {
            return Ok(());
        }
        ranges[level] = Some(match ranges[level] {
            Some((lo, hi)) => (lo.min(min), hi.max(max)),
            None => (min, max),
        });
        if level + 1 == locals.len() {
            return Ok(());
        }
        let mut value = min;
        while value <= max {
            prefix[level] = value;
            visit(locals, level + 1, prefix, ranges)?;
            value = match value.checked_add(symbol.step) {
                Some(next) => next,
                None => break,
            };
        }
        Ok(())
    }

    let mut ranges = vec![None; locals.len()];
    if !locals.is_empty() {
        let mut prefix = [0; MAX_LOCAL_COUNT];
        visit(locals, 0, &mut prefix, &mut ranges)?;
    }
    Ok(ranges)
}
