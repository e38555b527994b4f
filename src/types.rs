use indexmap::{IndexMap as _IndexMap, IndexSet as _IndexSet};
use rustc_hash::FxBuildHasher;
use std::collections::HashMap as _HashMap;

/// Maximum number of local symbols (loop nest depth) of a task class.
pub const MAX_LOCAL_COUNT: usize = 8;
/// Maximum number of flows of a task class.
///
/// Every flow owns one bit of the dependency bitmask; the highest bit of the
/// 32-bit word is reserved for [`ACTIVATION_BIT`].
pub const MAX_PARAM_COUNT: usize = 31;
/// Reserved bit of a dependency cell recording that the instance has been
/// visited once and its trivially satisfied inputs accounted for.
pub const ACTIVATION_BIT: DependencyMask = 1 << 31;
/// Value used to pad unused local slots in serialized instance descriptors.
pub const LOCAL_SENTINEL: LocalValue = LocalValue::MIN;

/// Concrete value of a local symbol.
pub type LocalValue = i32;
/// Per-instance dependency bitmask.
pub type DependencyMask = u32;
/// Index of a task class inside its registry.
pub type TaskClassId = u16;
/// Index of a flow inside its task class; also the flow's bit position.
pub type FlowIndex = u8;
/// Process rank.
pub type Rank = u32;
/// Identifier of an execution unit (worker thread).
pub type ExecutionUnitId = usize;

pub(crate) type HashMap<K, V> = _HashMap<K, V, FxBuildHasher>;
/// `IndexMap` type with fast hasher.
pub type IndexMap<K, V> = _IndexMap<K, V, FxBuildHasher>;
pub(crate) type IndexSet<T> = _IndexSet<T, FxBuildHasher>;
