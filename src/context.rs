use crate::{
    expr::Bindings,
    task_class::TaskClass,
    types::{LOCAL_SENTINEL, LocalValue, MAX_LOCAL_COUNT},
};
use core::fmt::{self, Debug, Display, Formatter};

/// One bound local of an execution context.
///
/// `min`/`max` is the window the value is drawn from. It starts as the range
/// requested by whoever built the context and may be clamped to the storage
/// bounds of the dependency tree.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Local {
    pub value: LocalValue,
    pub min: LocalValue,
    pub max: LocalValue,
}

impl Local {
    #[must_use]
    pub fn fixed(value: LocalValue) -> Self {
        Self {
            value,
            min: value,
            max: value,
        }
    }
}

impl Bindings for [Local] {
    #[inline]
    fn value_of(&self, index: usize) -> Option<LocalValue> {
        self.get(index).map(|local| local.value)
    }
}

/// A (possibly partially bound) instance of a task class.
#[derive(Copy, Clone)]
pub struct ExecutionContext<'a> {
    class: &'a TaskClass,
    locals: [Local; MAX_LOCAL_COUNT],
}

impl<'a> ExecutionContext<'a> {
    /// Context with every local unbound (zeroed).
    #[must_use]
    pub fn new(class: &'a TaskClass) -> Self {
        Self {
            class,
            locals: [Local::default(); MAX_LOCAL_COUNT],
        }
    }

    /// Fully bound context with fixed windows.
    ///
    /// # Panics
    /// If `values.len()` differs from the number of locals of `class`.
    #[must_use]
    pub fn with_values(class: &'a TaskClass, values: &[LocalValue]) -> Self {
        assert_eq!(
            values.len(),
            class.nb_locals(),
            "ExecutionContext::with_values: {} expects {} locals",
            class.name(),
            class.nb_locals()
        );
        let mut ctx = Self::new(class);
        for (local, &value) in ctx.locals.iter_mut().zip(values) {
            *local = Local::fixed(value);
        }
        ctx
    }

    #[inline]
    #[must_use]
    pub fn class(&self) -> &'a TaskClass {
        self.class
    }

    #[inline]
    #[must_use]
    pub fn nb_locals(&self) -> usize {
        self.class.nb_locals()
    }

    #[inline]
    #[must_use]
    pub fn locals(&self) -> &[Local] {
        &self.locals[..self.nb_locals()]
    }

    #[inline]
    pub(crate) fn locals_mut(&mut self) -> &mut [Local] {
        let nb_locals = self.nb_locals();
        &mut self.locals[..nb_locals]
    }

    #[inline]
    #[must_use]
    pub fn local(&self, index: usize) -> &Local {
        &self.locals()[index]
    }

    #[inline]
    pub(crate) fn local_mut(&mut self, index: usize) -> &mut Local {
        &mut self.locals_mut()[index]
    }

    /// The first `depth` locals, i.e. the bindings visible to an expression
    /// evaluated at loop level `depth`.
    #[inline]
    #[must_use]
    pub fn bound(&self, depth: usize) -> &[Local] {
        &self.locals[..depth]
    }

    /// Values of all locals, unused slots padded with [`LOCAL_SENTINEL`].
    #[must_use]
    pub fn values(&self) -> [LocalValue; MAX_LOCAL_COUNT] {
        let mut values = [LOCAL_SENTINEL; MAX_LOCAL_COUNT];
        for (slot, local) in values.iter_mut().zip(self.locals()) {
            *slot = local.value;
        }
        values
    }

    /// Values of the bound locals as a freshly allocated vector.
    #[must_use]
    pub fn value_vec(&self) -> Vec<LocalValue> {
        self.locals().iter().map(|local| local.value).collect()
    }
}

impl PartialEq for ExecutionContext<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.class.id() == other.class.id()
            && self
                .locals()
                .iter()
                .zip(other.locals())
                .all(|(lhs, rhs)| lhs.value == rhs.value)
    }
}

impl Eq for ExecutionContext<'_> {}

/// Renders `name_v1_v2_..._vN`.
impl Display for ExecutionContext<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.class.name())?;
        for local in self.locals() {
            write!(f, "_{}", local.value)?;
        }
        Ok(())
    }
}

impl Debug for ExecutionContext<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("class", &self.class.name())
            .field("locals", &self.locals())
            .finish()
    }
}
