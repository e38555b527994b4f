//! Remote activation hand-off.
//!
//! A finished instance whose successors live on other ranks produces one
//! activation message per destination rank, naming the output flows with
//! successors there. The receiving rank re-runs the release of those flows
//! restricted to the instances it owns.

use crate::{
    sync::{AtomicUsize, Ordering},
    types::{DependencyMask, FlowIndex, IndexMap, LOCAL_SENTINEL, LocalValue, MAX_LOCAL_COUNT, Rank, TaskClassId},
};
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ActivationError {
    #[error("activation message has {0} bytes, expected {ENCODED_LEN}")]
    Malformed(usize),
    #[error("activation names unknown task class {0}")]
    UnknownClass(TaskClassId),
    #[error("activation names {outputs:#x}, which are not output flows of task class {class}")]
    UnknownOutputs { class: String, outputs: DependencyMask },
    #[error("activation for task class {class} carries {count} locals")]
    LocalCount { class: String, count: usize },
    #[error("more activations acknowledged than sent")]
    Underflow,
}

/// Fire-and-forget delivery of encoded activation messages.
pub trait Transport: Send + Sync {
    fn send_activation(&self, rank: Rank, message: &[u8]);
}

impl<F> Transport for F
where
    F: Fn(Rank, &[u8]) + Send + Sync,
{
    fn send_activation(&self, rank: Rank, message: &[u8]) {
        self(rank, message);
    }
}

/// Transport of a single-rank run. Never expected to be used.
#[derive(Debug, Copy, Clone, Default)]
pub struct NullTransport;

impl Transport for NullTransport {
    fn send_activation(&self, rank: Rank, _message: &[u8]) {
        tracing::warn!(rank, "activation dropped: no transport configured");
    }
}

/// Size of an encoded [`ActivationMessage`].
pub const ENCODED_LEN: usize = 2 + 4 * MAX_LOCAL_COUNT + 4;

/// Origin side of a remote release: the finished instance and the output
/// flows whose outgoing dependencies reach the destination rank.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ActivationMessage {
    pub class: TaskClassId,
    /// Padded with [`LOCAL_SENTINEL`].
    pub locals: [LocalValue; MAX_LOCAL_COUNT],
    /// Bit `f` set for output flow `f`.
    pub outputs: DependencyMask,
}

impl ActivationMessage {
    /// Fixed-width little-endian encoding.
    #[must_use]
    pub fn encode(&self) -> [u8; ENCODED_LEN] {
        let Self { class, locals, outputs } = self;
        let mut out = [0; ENCODED_LEN];
        out[..2].copy_from_slice(&class.to_le_bytes());
        for (chunk, value) in out[2..2 + 4 * MAX_LOCAL_COUNT].chunks_exact_mut(4).zip(locals) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        out[ENCODED_LEN - 4..].copy_from_slice(&outputs.to_le_bytes());
        out
    }

    /// # Errors
    /// If `bytes` is not exactly [`ENCODED_LEN`] long.
    pub fn decode(bytes: &[u8]) -> Result<Self, ActivationError> {
        let bytes: &[u8; ENCODED_LEN] = bytes
            .try_into()
            .map_err(|_| ActivationError::Malformed(bytes.len()))?;
        let mut locals = [LOCAL_SENTINEL; MAX_LOCAL_COUNT];
        for (value, chunk) in locals.iter_mut().zip(bytes[2..ENCODED_LEN - 4].chunks_exact(4)) {
            *value = LocalValue::from_le_bytes(chunk.try_into().expect("ActivationMessage::decode: [1]"));
        }
        let outputs = &bytes[ENCODED_LEN - 4..];
        Ok(Self {
            class: TaskClassId::from_le_bytes([bytes[0], bytes[1]]),
            locals,
            outputs: DependencyMask::from_le_bytes(outputs.try_into().expect("ActivationMessage::decode: [2]")),
        })
    }

    /// Bound locals, i.e. the values before the first sentinel.
    #[must_use]
    pub fn bound_locals(&self) -> &[LocalValue] {
        let count = self
            .locals
            .iter()
            .position(|&value| value == LOCAL_SENTINEL)
            .unwrap_or(MAX_LOCAL_COUNT);
        &self.locals[..count]
    }
}

/// Outstanding remote obligations of a taskpool.
///
/// Incremented before an activation is sent, decremented when the remote
/// side confirms it. A run is only globally finished once this is zero.
#[derive(Debug)]
pub struct InFlight(AtomicUsize);

impl Default for InFlight {
    fn default() -> Self {
        Self::new()
    }
}

impl InFlight {
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    #[inline]
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    /// # Errors
    /// If no activation is outstanding.
    pub fn acknowledge(&self) -> Result<(), ActivationError> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1))
            .map(drop)
            .map_err(|_| ActivationError::Underflow)
    }

    #[inline]
    #[must_use]
    pub fn load(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

/// Remote destinations of one finished instance: every rank owning a
/// successor, with the output flows that reach it.
///
/// Owned by the thread releasing the instance. Ranks keep the order in which
/// they were first recorded.
#[derive(Debug, Clone, Default)]
pub struct RemoteDeps {
    targets: IndexMap<Rank, DependencyMask>,
}

impl RemoteDeps {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that output flow `flow` has a successor on `rank`; `true` the
    /// first time for this pair.
    pub fn mark(&mut self, rank: Rank, flow: FlowIndex) -> bool {
        let bit: DependencyMask = 1 << flow;
        let outputs = self.targets.entry(rank).or_default();
        let fresh = *outputs & bit == 0;
        *outputs |= bit;
        fresh
    }

    #[must_use]
    pub fn contains(&self, rank: Rank) -> bool {
        self.targets.contains_key(&rank)
    }

    /// Output flows recorded for `rank`.
    #[must_use]
    pub fn outputs(&self, rank: Rank) -> DependencyMask {
        self.targets.get(&rank).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Send one activation per recorded rank on behalf of the instance
    /// `class(locals)`. Returns the number of messages sent.
    pub fn activate(
        self,
        class: TaskClassId,
        locals: [LocalValue; MAX_LOCAL_COUNT],
        transport: &impl Transport,
        in_flight: &InFlight,
    ) -> usize {
        let Self { targets } = self;
        for (&rank, &outputs) in &targets {
            let message = ActivationMessage { class, locals, outputs };
            in_flight.increment();
            trace!(rank, class, outputs, "activation sent");
            transport.send_activation(rank, &message.encode());
        }
        targets.len()
    }
}
