use crate::{symbol::Symbol, types::LocalValue};
use core::{
    fmt::{self, Display, Formatter},
    ops,
};
use thiserror::Error;

/// Failure to evaluate an expression.
///
/// Distinct from an expression that evaluates to "false": an evaluation
/// failure is a contract violation of the task-class definition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExprError {
    /// The expression refers to a local that is not bound yet.
    #[error("expression refers to unbound local #{0}")]
    UnboundLocal(usize),
    /// Integer division or remainder by zero.
    #[error("division by zero")]
    DivisionByZero,
    /// Integer overflow while evaluating.
    #[error("integer overflow")]
    Overflow,
}

/// Read access to the locals bound so far.
pub trait Bindings {
    /// Value of local `index`, or `None` if it is not bound.
    fn value_of(&self, index: usize) -> Option<LocalValue>;
}

impl Bindings for [LocalValue] {
    #[inline]
    fn value_of(&self, index: usize) -> Option<LocalValue> {
        self.get(index).copied()
    }
}

impl<const N: usize> Bindings for [LocalValue; N] {
    #[inline]
    fn value_of(&self, index: usize) -> Option<LocalValue> {
        self.get(index).copied()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Min,
    Max,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
            Self::Min => "min",
            Self::Max => "max",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::And => "&&",
            Self::Or => "||",
        }
    }
}

/// Integer expression over the locals of a task class.
///
/// Booleans are integers: zero is false, anything else is true. Comparisons
/// and logical operators produce `0` or `1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Const(LocalValue),
    /// Value of the local symbol at this position of the loop nest.
    Local(usize),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// `cond ? then : otherwise`
    Select(Box<Expr>, Box<Expr>, Box<Expr>),
}

impl Expr {
    #[must_use]
    pub fn constant(value: LocalValue) -> Self {
        Self::Const(value)
    }

    #[must_use]
    pub fn local(index: usize) -> Self {
        Self::Local(index)
    }

    fn binary(op: BinaryOp, lhs: Self, rhs: impl Into<Self>) -> Self {
        Self::Binary(op, Box::new(lhs), Box::new(rhs.into()))
    }

    #[must_use]
    pub fn equals(self, rhs: impl Into<Self>) -> Self {
        Self::binary(BinaryOp::Eq, self, rhs)
    }

    #[must_use]
    pub fn not_equals(self, rhs: impl Into<Self>) -> Self {
        Self::binary(BinaryOp::Ne, self, rhs)
    }

    #[must_use]
    pub fn lt(self, rhs: impl Into<Self>) -> Self {
        Self::binary(BinaryOp::Lt, self, rhs)
    }

    #[must_use]
    pub fn le(self, rhs: impl Into<Self>) -> Self {
        Self::binary(BinaryOp::Le, self, rhs)
    }

    #[must_use]
    pub fn gt(self, rhs: impl Into<Self>) -> Self {
        Self::binary(BinaryOp::Gt, self, rhs)
    }

    #[must_use]
    pub fn ge(self, rhs: impl Into<Self>) -> Self {
        Self::binary(BinaryOp::Ge, self, rhs)
    }

    #[must_use]
    pub fn and(self, rhs: impl Into<Self>) -> Self {
        Self::binary(BinaryOp::And, self, rhs)
    }

    #[must_use]
    pub fn or(self, rhs: impl Into<Self>) -> Self {
        Self::binary(BinaryOp::Or, self, rhs)
    }

    #[must_use]
    pub fn min_with(self, rhs: impl Into<Self>) -> Self {
        Self::binary(BinaryOp::Min, self, rhs)
    }

    #[must_use]
    pub fn max_with(self, rhs: impl Into<Self>) -> Self {
        Self::binary(BinaryOp::Max, self, rhs)
    }

    #[must_use]
    pub fn select(cond: Self, then: impl Into<Self>, otherwise: impl Into<Self>) -> Self {
        Self::Select(
            Box::new(cond),
            Box::new(then.into()),
            Box::new(otherwise.into()),
        )
    }

    /// Evaluate under the given bindings.
    ///
    /// # Errors
    /// If a referenced local is unbound, or on division by zero / overflow.
    pub fn eval<B: Bindings + ?Sized>(&self, bindings: &B) -> Result<LocalValue, ExprError> {
        match self {
            Self::Const(value) => Ok(*value),
            Self::Local(index) => bindings
                .value_of(*index)
                .ok_or(ExprError::UnboundLocal(*index)),
            Self::Unary(op, operand) => {
                let value = operand.eval(bindings)?;
                match op {
                    UnaryOp::Neg => value.checked_neg().ok_or(ExprError::Overflow),
                    UnaryOp::Not => Ok(LocalValue::from(value == 0)),
                }
            }
            Self::Binary(op, lhs, rhs) => {
                let lhs = lhs.eval(bindings)?;
                // Short-circuit like the C operators so guards such as
                // `n != 0 && k % n == 0` stay evaluable.
                match op {
                    BinaryOp::And if lhs == 0 => return Ok(0),
                    BinaryOp::Or if lhs != 0 => return Ok(1),
                    _ => {}
                }
                let rhs = rhs.eval(bindings)?;
                let flag = |b: bool| Ok(LocalValue::from(b));
                match op {
                    BinaryOp::Add => lhs.checked_add(rhs).ok_or(ExprError::Overflow),
                    BinaryOp::Sub => lhs.checked_sub(rhs).ok_or(ExprError::Overflow),
                    BinaryOp::Mul => lhs.checked_mul(rhs).ok_or(ExprError::Overflow),
                    BinaryOp::Div if rhs == 0 => Err(ExprError::DivisionByZero),
                    BinaryOp::Div => lhs.checked_div(rhs).ok_or(ExprError::Overflow),
                    BinaryOp::Rem if rhs == 0 => Err(ExprError::DivisionByZero),
                    BinaryOp::Rem => lhs.checked_rem(rhs).ok_or(ExprError::Overflow),
                    BinaryOp::Min => Ok(lhs.min(rhs)),
                    BinaryOp::Max => Ok(lhs.max(rhs)),
                    BinaryOp::Eq => flag(lhs == rhs),
                    BinaryOp::Ne => flag(lhs != rhs),
                    BinaryOp::Lt => flag(lhs < rhs),
                    BinaryOp::Le => flag(lhs <= rhs),
                    BinaryOp::Gt => flag(lhs > rhs),
                    BinaryOp::Ge => flag(lhs >= rhs),
                    BinaryOp::And | BinaryOp::Or => flag(rhs != 0),
                }
            }
            Self::Select(cond, then, otherwise) => {
                if cond.eval(bindings)? != 0 {
                    then.eval(bindings)
                } else {
                    otherwise.eval(bindings)
                }
            }
        }
    }

    /// Evaluate as a boolean.
    ///
    /// # Errors
    /// See [`Expr::eval`].
    pub fn holds<B: Bindings + ?Sized>(&self, bindings: &B) -> Result<bool, ExprError> {
        self.eval(bindings).map(|value| value != 0)
    }

    /// Smallest and largest value over every binding drawn from `ranges`,
    /// where `ranges[i]` bounds local `i`. The result may be wider than the
    /// exact one since operands vary independently.
    ///
    /// `Ok(None)` if an operator has no interval rule here (division,
    /// remainder, comparisons, logic, select) or on overflow.
    ///
    /// # Errors
    /// If the expression refers to a local with no entry in `ranges`.
    pub(crate) fn interval(
        &self,
        ranges: &[(LocalValue, LocalValue)],
    ) -> Result<Option<(LocalValue, LocalValue)>, ExprError> {
        let pair = |lhs: &Self, rhs: &Self| -> Result<Option<_>, ExprError> {
            Ok(lhs.interval(ranges)?.zip(rhs.interval(ranges)?))
        };
        Ok(match self {
            Self::Const(value) => Some((*value, *value)),
            Self::Local(index) => Some(*ranges.get(*index).ok_or(ExprError::UnboundLocal(*index))?),
            Self::Unary(UnaryOp::Neg, operand) => operand
                .interval(ranges)?
                .and_then(|(lo, hi)| Some((hi.checked_neg()?, lo.checked_neg()?))),
            Self::Binary(BinaryOp::Add, lhs, rhs) => pair(lhs, rhs)?
                .and_then(|((a, b), (c, d))| Some((a.checked_add(c)?, b.checked_add(d)?))),
            Self::Binary(BinaryOp::Sub, lhs, rhs) => pair(lhs, rhs)?
                .and_then(|((a, b), (c, d))| Some((a.checked_sub(d)?, b.checked_sub(c)?))),
            Self::Binary(BinaryOp::Mul, lhs, rhs) => pair(lhs, rhs)?.and_then(|((a, b), (c, d))| {
                let corners = [a.checked_mul(c)?, a.checked_mul(d)?, b.checked_mul(c)?, b.checked_mul(d)?];
                Some((*corners.iter().min()?, *corners.iter().max()?))
            }),
            Self::Binary(BinaryOp::Min, lhs, rhs) => pair(lhs, rhs)?.map(|((a, b), (c, d))| (a.min(c), b.min(d))),
            Self::Binary(BinaryOp::Max, lhs, rhs) => pair(lhs, rhs)?.map(|((a, b), (c, d))| (a.max(c), b.max(d))),
            Self::Unary(UnaryOp::Not, _) | Self::Binary(..) | Self::Select(..) => None,
        })
    }

    /// Position of the innermost local this expression refers to, `None` if
    /// it refers to no local at all.
    #[must_use]
    pub fn deepest_local(&self) -> Option<usize> {
        match self {
            Self::Const(_) => None,
            Self::Local(index) => Some(*index),
            Self::Unary(_, operand) => operand.deepest_local(),
            Self::Binary(_, lhs, rhs) => lhs.deepest_local().max(rhs.deepest_local()),
            Self::Select(cond, then, otherwise) => cond
                .deepest_local()
                .max(then.deepest_local())
                .max(otherwise.deepest_local()),
        }
    }

    /// Render with the symbol names of a task class.
    #[must_use]
    pub fn display<'a>(&'a self, locals: &'a [Symbol]) -> ExprDisplay<'a> {
        ExprDisplay { expr: self, locals }
    }
}

impl From<LocalValue> for Expr {
    fn from(value: LocalValue) -> Self {
        Self::Const(value)
    }
}

macro_rules! arith_op {
    ($trait:ident, $method:ident, $op:expr) => {
        impl<R: Into<Expr>> ops::$trait<R> for Expr {
            type Output = Expr;

            fn $method(self, rhs: R) -> Expr {
                Expr::binary($op, self, rhs)
            }
        }
    };
}

arith_op!(Add, add, BinaryOp::Add);
arith_op!(Sub, sub, BinaryOp::Sub);
arith_op!(Mul, mul, BinaryOp::Mul);
arith_op!(Div, div, BinaryOp::Div);
arith_op!(Rem, rem, BinaryOp::Rem);

impl ops::Neg for Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        Expr::Unary(UnaryOp::Neg, Box::new(self))
    }
}

impl ops::Not for Expr {
    type Output = Expr;

    fn not(self) -> Expr {
        Expr::Unary(UnaryOp::Not, Box::new(self))
    }
}

/// [`Display`] adapter returned by [`Expr::display`].
pub struct ExprDisplay<'a> {
    expr: &'a Expr,
    locals: &'a [Symbol],
}

impl Display for ExprDisplay<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let &Self { expr, locals } = self;
        match expr {
            Expr::Const(value) => write!(f, "{value}"),
            Expr::Local(index) => match locals.get(*index) {
                Some(symbol) => f.write_str(symbol.name()),
                None => write!(f, "L{index}"),
            },
            Expr::Unary(UnaryOp::Neg, operand) => write!(f, "-{}", operand.display(locals)),
            Expr::Unary(UnaryOp::Not, operand) => write!(f, "!{}", operand.display(locals)),
            Expr::Binary(op @ (BinaryOp::Min | BinaryOp::Max), lhs, rhs) => write!(
                f,
                "{}({}, {})",
                op.symbol(),
                lhs.display(locals),
                rhs.display(locals)
            ),
            Expr::Binary(op, lhs, rhs) => write!(
                f,
                "({} {} {})",
                lhs.display(locals),
                op.symbol(),
                rhs.display(locals)
            ),
            Expr::Select(cond, then, otherwise) => write!(
                f,
                "({} ? {} : {})",
                cond.display(locals),
                then.display(locals),
                otherwise.display(locals)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_and_comparisons() {
        let k = Expr::local(0);
        let m = Expr::local(1);
        let e = (k.clone() + 1).le(m.clone() * 2);
        assert_eq!(e.eval(&[3, 2][..]), Ok(1));
        assert_eq!(e.eval(&[4, 2][..]), Ok(0));
        assert_eq!((m % 3).eval(&[0, 7][..]), Ok(1));
        assert_eq!(Expr::select(k.clone().gt(0), 10, 20).eval(&[0][..]), Ok(20));
        assert_eq!((!k).eval(&[0][..]), Ok(1));
    }

    #[test]
    fn unbound_local_is_an_error_not_false() {
        let e = Expr::local(2).equals(0);
        assert_eq!(e.eval(&[1, 2][..]), Err(ExprError::UnboundLocal(2)));
    }

    #[test]
    fn logical_operators_short_circuit() {
        let guard = Expr::local(0)
            .not_equals(0)
            .and((Expr::constant(6) % Expr::local(0)).equals(0));
        assert_eq!(guard.eval(&[0][..]), Ok(0));
        assert_eq!(guard.eval(&[3][..]), Ok(1));
        assert_eq!((Expr::constant(1) / 0).eval(&[0; 0][..]), Err(ExprError::DivisionByZero));
    }

    #[test]
    fn intervals_cover_every_binding() {
        let ranges = [(0, 3), (-2, 5)];
        let k = Expr::local(0);
        let m = Expr::local(1);
        assert_eq!((k.clone() + 1).interval(&ranges), Ok(Some((1, 4))));
        assert_eq!((k.clone() - m.clone()).interval(&ranges), Ok(Some((-5, 5))));
        assert_eq!((k.clone() * m.clone()).interval(&ranges), Ok(Some((-6, 15))));
        assert_eq!((-m.clone()).interval(&ranges), Ok(Some((-5, 2))));
        assert_eq!(k.clone().min_with(m.clone()).interval(&ranges), Ok(Some((-2, 3))));
        assert_eq!((k.clone() / 2).interval(&ranges), Ok(None));
        assert_eq!((Expr::constant(LocalValue::MAX) + k).interval(&ranges), Ok(None));
        assert_eq!((m + Expr::local(2)).interval(&ranges), Err(ExprError::UnboundLocal(2)));
    }

    #[test]
    fn deepest_local() {
        assert_eq!(Expr::constant(4).deepest_local(), None);
        assert_eq!(
            (Expr::local(0) + Expr::local(2)).max_with(Expr::local(1)).deepest_local(),
            Some(2)
        );
    }
}
