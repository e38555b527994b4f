//! Lazily built, per-class tree of dependency bitmasks.
//!
//! One level per local. Every node's storage covers the absolute range of
//! its symbol and is indexed by `value - absolute_min`, so a cell never
//! moves once handed out. On top of that, each node records the window of
//! values actually requested through it; the window only ever widens.
//!
//! Nodes are installed with a single compare-and-swap on the parent slot.
//! The losing thread frees its speculative node and continues with the
//! winner's. Nodes are only freed when the whole tree is dropped.

use crate::{
    context::ExecutionContext,
    sync::{AtomicI32, AtomicPtr, AtomicU32, AtomicUsize, Ordering},
    task_class::TaskClass,
    types::{ACTIVATION_BIT, DependencyMask, LocalValue},
};
use core::ptr;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DependencyError {
    /// Fatal for the run: the class cannot make further progress.
    #[error("task class {class}: failed to allocate {len} dependency slots for symbol {symbol}")]
    AllocationFailed {
        class: String,
        symbol: String,
        len: usize,
    },
    #[error("task class {class}: value {value} of symbol {symbol} is outside [{min}, {max}]")]
    OutOfBounds {
        class: String,
        symbol: String,
        value: LocalValue,
        min: LocalValue,
        max: LocalValue,
    },
    #[error("task class {class}: symbol {symbol} never has a value")]
    EmptyRange { class: String, symbol: String },
    #[error("task class {class} has no locals and tracks no dependencies")]
    Boundary { class: String },
}

/// Lifecycle of an instance as recorded in its cell.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InstanceState {
    Unvisited,
    /// Visited at least once; some input is still missing.
    InDepsPending,
    /// All inputs are present. The instance has been handed to the
    /// scheduler by the release that completed it.
    Ready,
}

/// Handle to the bitmask of one instance.
#[derive(Debug, Copy, Clone)]
pub struct DependencyCell<'t>(&'t AtomicU32);

impl DependencyCell<'_> {
    #[inline]
    #[must_use]
    pub fn load(self) -> DependencyMask {
        self.0.load(Ordering::Acquire)
    }

    /// Atomically OR `bits` in and return the value before and after.
    #[inline]
    pub fn or(self, bits: DependencyMask) -> (DependencyMask, DependencyMask) {
        let pre = self.0.fetch_or(bits, Ordering::AcqRel);
        let post = pre | bits;
        trace!(pre, post, "dependency cell updated");
        (pre, post)
    }

    #[must_use]
    pub fn state(self, goal: DependencyMask) -> InstanceState {
        let mask = self.load();
        if mask & ACTIVATION_BIT == 0 {
            InstanceState::Unvisited
        } else if mask & !ACTIVATION_BIT == goal {
            InstanceState::Ready
        } else {
            InstanceState::InDepsPending
        }
    }
}

enum Slots {
    Leaf(Box<[AtomicU32]>),
    Internal(Box<[AtomicPtr<Node>]>),
}

struct Node {
    /// Absolute minimum of the symbol; index origin of `slots`.
    base: LocalValue,
    min: AtomicI32,
    max: AtomicI32,
    slots: Slots,
}

impl Node {
    #[inline]
    fn offset(&self, value: LocalValue) -> usize {
        (i64::from(value) - i64::from(self.base))
            .try_into()
            .expect("Node::offset: [1]")
    }

    fn window(&self) -> (LocalValue, LocalValue) {
        (self.min.load(Ordering::Relaxed), self.max.load(Ordering::Relaxed))
    }

    /// Widen the observed window to include `lo..=hi`.
    fn widen(&self, lo: LocalValue, hi: LocalValue) -> (LocalValue, LocalValue) {
        let min = self.min.fetch_min(lo, Ordering::Relaxed).min(lo);
        let max = self.max.fetch_max(hi, Ordering::Relaxed).max(hi);
        (min, max)
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Slots::Internal(children) = &self.slots {
            for child in children.iter() {
                let child = child.load(Ordering::Acquire);
                if !child.is_null() {
                    // SAFETY: non-null children were produced by `Box::into_raw` in
                    // `DependencyTree::install` and are owned by this node only.
                    drop(unsafe { Box::from_raw(child) });
                }
            }
        }
    }
}

/// Dependency-tracking structure of one task class.
pub struct DependencyTree {
    class: String,
    symbols: Vec<String>,
    ranges: Vec<Option<(LocalValue, LocalValue)>>,
    root: AtomicPtr<Node>,
    nodes: AtomicUsize,
}

impl core::fmt::Debug for DependencyTree {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DependencyTree")
            .field("class", &self.class)
            .field("ranges", &self.ranges)
            .field("nodes", &self.node_count())
            .finish_non_exhaustive()
    }
}

// SAFETY: nodes are only reachable through atomic pointers, their contents
// are atomics, and they are freed only when the tree itself is dropped.
unsafe impl Send for DependencyTree {}
// SAFETY: see above.
unsafe impl Sync for DependencyTree {}

impl DependencyTree {
    #[must_use]
    pub fn new(class: &TaskClass) -> Self {
        Self {
            class: class.name().to_owned(),
            symbols: class.locals().iter().map(|s| s.name().to_owned()).collect(),
            ranges: (0..class.nb_locals()).map(|level| class.absolute_range(level)).collect(),
            root: AtomicPtr::new(ptr::null_mut()),
            nodes: AtomicUsize::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub fn depth(&self) -> usize {
        self.ranges.len()
    }

    /// Number of nodes installed so far.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.load(Ordering::Relaxed)
    }

    fn bounds(&self, level: usize, value: LocalValue) -> Result<(LocalValue, LocalValue), DependencyError> {
        let Some((min, max)) = self.ranges[level] else {
            return Err(DependencyError::EmptyRange {
                class: self.class.clone(),
                symbol: self.symbols[level].clone(),
            });
        };
        if value < min || value > max {
            return Err(DependencyError::OutOfBounds {
                class: self.class.clone(),
                symbol: self.symbols[level].clone(),
                value,
                min,
                max,
            });
        }
        Ok((min, max))
    }

    fn allocate<T>(&self, level: usize, len: usize, make: impl FnMut() -> T) -> Result<Box<[T]>, DependencyError> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(len)
            .map_err(|_| DependencyError::AllocationFailed {
                class: self.class.clone(),
                symbol: self.symbols[level].clone(),
                len,
            })?;
        slots.extend(core::iter::repeat_with(make).take(len));
        Ok(slots.into_boxed_slice())
    }

    /// Return the node in `slot`, installing a fresh one seeded with the
    /// window `lo..=hi` if the slot is empty.
    fn install<'t>(
        &'t self,
        slot: &'t AtomicPtr<Node>,
        level: usize,
        (base, top): (LocalValue, LocalValue),
        (lo, hi): (LocalValue, LocalValue),
    ) -> Result<&'t Node, DependencyError> {
        let current = slot.load(Ordering::Acquire);
        if !current.is_null() {
            // SAFETY: installed nodes live until the tree is dropped.
            return Ok(unsafe { &*current });
        }
        let len = usize::try_from(i64::from(top) - i64::from(base) + 1).expect("DependencyTree::install: [1]");
        let slots = if level + 1 == self.depth() {
            Slots::Leaf(self.allocate(level, len, || AtomicU32::new(0))?)
        } else {
            Slots::Internal(self.allocate(level, len, || AtomicPtr::new(ptr::null_mut()))?)
        };
        let fresh = Box::into_raw(Box::new(Node {
            base,
            min: AtomicI32::new(lo),
            max: AtomicI32::new(hi),
            slots,
        }));
        match slot.compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                self.nodes.fetch_add(1, Ordering::Relaxed);
                debug!(class = %self.class, symbol = %self.symbols[level], lo, hi, len, "dependency node installed");
                // SAFETY: `fresh` is now owned by the tree.
                Ok(unsafe { &*fresh })
            }
            Err(winner) => {
                // SAFETY: `fresh` was never published.
                drop(unsafe { Box::from_raw(fresh) });
                // SAFETY: installed nodes live until the tree is dropped.
                Ok(unsafe { &*winner })
            }
        }
    }

    /// Locate the cell of the fully bound instance `ctx`, creating the
    /// missing nodes on the way.
    ///
    /// Each binding window of `ctx` is reconciled with the node it indexes:
    /// the node's observed window is widened to include the value, then
    /// copied back into the binding.
    ///
    /// # Errors
    /// If a value is outside its absolute range, or a node cannot be
    /// allocated.
    pub fn locate_or_create(&self, ctx: &mut ExecutionContext<'_>) -> Result<DependencyCell<'_>, DependencyError> {
        if self.depth() == 0 {
            return Err(DependencyError::Boundary {
                class: self.class.clone(),
            });
        }
        debug_assert_eq!(ctx.nb_locals(), self.depth(), "DependencyTree::locate_or_create: [1]");
        let mut slot = &self.root;
        for level in 0..self.depth() {
            let local = *ctx.local(level);
            let (base, top) = self.bounds(level, local.value)?;
            let seed = (local.min.max(base).min(local.value), local.max.min(top).max(local.value));
            let node = self.install(slot, level, (base, top), seed)?;
            let (min, max) = node.widen(local.value, local.value);
            {
                let local = ctx.local_mut(level);
                local.min = min;
                local.max = max;
            }
            let offset = node.offset(local.value);
            match &node.slots {
                Slots::Leaf(cells) => return Ok(DependencyCell(&cells[offset])),
                Slots::Internal(children) => slot = &children[offset],
            }
        }
        unreachable!("DependencyTree::locate_or_create: [2]")
    }

    fn index(&self, node: &Node, level: usize, value: LocalValue) -> Option<usize> {
        self.bounds(level, value).ok()?;
        Some(node.offset(value))
    }

    fn node_at(&self, prefix: &[LocalValue]) -> Option<&Node> {
        let mut slot = &self.root;
        for (level, &value) in prefix.iter().enumerate() {
            let current = slot.load(Ordering::Acquire);
            if current.is_null() {
                return None;
            }
            // SAFETY: installed nodes live until the tree is dropped.
            let current = unsafe { &*current };
            if level + 1 == prefix.len() {
                return Some(current);
            }
            let Slots::Internal(children) = &current.slots else {
                return None;
            };
            slot = &children[self.index(current, level, value)?];
        }
        None
    }

    /// Cell of an instance, if it was ever created.
    #[must_use]
    pub fn lookup(&self, values: &[LocalValue]) -> Option<DependencyCell<'_>> {
        let (&last, _) = values.split_last()?;
        if values.len() != self.depth() {
            return None;
        }
        let node = self.node_at(values)?;
        match &node.slots {
            Slots::Leaf(cells) => Some(DependencyCell(&cells[self.index(node, values.len() - 1, last)?])),
            Slots::Internal(_) => None,
        }
    }

    /// Observed window of the node selected by `prefix`; `prefix` holds the
    /// values of the enclosing locals followed by any value of the symbol
    /// itself.
    #[must_use]
    pub fn observed_range(&self, prefix: &[LocalValue]) -> Option<(LocalValue, LocalValue)> {
        self.node_at(prefix).map(Node::window)
    }

    #[must_use]
    pub fn instance_state(&self, values: &[LocalValue], goal: DependencyMask) -> InstanceState {
        self.lookup(values)
            .map_or(InstanceState::Unvisited, |cell| cell.state(goal))
    }
}

impl Drop for DependencyTree {
    fn drop(&mut self) {
        let root = self.root.load(Ordering::Acquire);
        if !root.is_null() {
            // SAFETY: the root was produced by `Box::into_raw` and is owned by the tree.
            drop(unsafe { Box::from_raw(root) });
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::{context::Local, expr::Expr, symbol::Symbol, task_class::TaskClassBuilder};
    use std::{sync::Barrier, thread};

    fn single(max: LocalValue) -> TaskClass {
        TaskClassBuilder::new("K")
            .local(Symbol::new("k", 0, max))
            .build(0)
            .unwrap()
    }

    #[test]
    fn widening_keeps_stored_cells() {
        let class = single(9);
        let tree = DependencyTree::new(&class);

        let mut first = ExecutionContext::new(&class);
        *first.local_mut(0) = Local {
            value: 5,
            min: 3,
            max: 7,
        };
        tree.locate_or_create(&mut first).unwrap().or(0b1 | ACTIVATION_BIT);
        assert_eq!(tree.observed_range(&[5]), Some((3, 7)));

        let mut second = ExecutionContext::with_values(&class, &[1]);
        tree.locate_or_create(&mut second).unwrap();
        assert_eq!(tree.observed_range(&[1]), Some((1, 7)));
        assert_eq!((second.local(0).min, second.local(0).max), (1, 7));

        let cell = tree.lookup(&[5]).unwrap();
        assert_eq!(cell.load(), 0b1 | ACTIVATION_BIT);
        assert_eq!(tree.lookup(&[1]).unwrap().load(), 0);
        assert_eq!(tree.node_count(), 1);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let class = single(3);
        let tree = DependencyTree::new(&class);
        let mut ctx = ExecutionContext::with_values(&class, &[4]);
        assert!(matches!(
            tree.locate_or_create(&mut ctx),
            Err(DependencyError::OutOfBounds { value: 4, min: 0, max: 3, .. })
        ));
        assert_eq!(tree.node_count(), 0);
    }

    #[test]
    fn dependent_ranges_share_absolute_storage() {
        let class = TaskClassBuilder::new("T")
            .local(Symbol::new("k", 0, 3))
            .local(Symbol::new("m", Expr::local(0) + 1, 4))
            .build(0)
            .unwrap();
        let tree = DependencyTree::new(&class);
        for values in [[0, 1], [0, 4], [2, 3]] {
            let mut ctx = ExecutionContext::with_values(&class, &values);
            tree.locate_or_create(&mut ctx).unwrap().or(1);
        }
        assert_eq!(tree.node_count(), 3);
        assert_eq!(tree.lookup(&[0, 4]).map(DependencyCell::load), Some(1));
        assert!(tree.lookup(&[1, 2]).is_none());
        assert_eq!(tree.instance_state(&[2, 3], 1), InstanceState::Unvisited);
        assert_eq!(tree.observed_range(&[0, 0]), Some((1, 4)));
    }

    #[test]
    fn concurrent_creation_installs_one_node_per_prefix() {
        let class = TaskClassBuilder::new("T")
            .local(Symbol::new("i", 0, 7))
            .local(Symbol::new("j", 0, 7))
            .build(0)
            .unwrap();
        let tree = DependencyTree::new(&class);
        let barrier = Barrier::new(4);
        thread::scope(|s| {
            for t in 0..4 {
                let (tree, class, barrier) = (&tree, &class, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    for i in 0..8 {
                        let mut ctx = ExecutionContext::with_values(class, &[i, t]);
                        tree.locate_or_create(&mut ctx).unwrap().or(1 << t);
                    }
                });
            }
        });
        assert_eq!(tree.node_count(), 1 + 8);
        for i in 0..8 {
            for t in 0..4 {
                assert_eq!(tree.lookup(&[i, t]).unwrap().load(), 1 << t);
            }
        }
    }

    #[test]
    fn cell_states() {
        let class = single(1);
        let tree = DependencyTree::new(&class);
        let mut ctx = ExecutionContext::with_values(&class, &[0]);
        let cell = tree.locate_or_create(&mut ctx).unwrap();
        assert_eq!(cell.state(0b11), InstanceState::Unvisited);
        assert_eq!(cell.or(0b01 | ACTIVATION_BIT), (0, 0b01 | ACTIVATION_BIT));
        assert_eq!(cell.state(0b11), InstanceState::InDepsPending);
        cell.or(0b10);
        assert_eq!(cell.state(0b11), InstanceState::Ready);
    }
}
