//! Dependency resolution and task readiness for parameterized task graphs.
//!
//! A parameterized task graph describes a DAG compactly: each task class is
//! a loop nest of integer locals (`k in 0..N`, `m in k+1..N`) whose flows
//! name, by symbolic expressions, the instances they read from and write
//! to. This crate never materializes the DAG. It:
//! - Enumerates the valid instances of a class by walking its locals as an
//!   odometer, evaluating ranges and predicates level by level.
//! - Tracks, for every instance that has been touched, a bitmask of the
//!   input flows already satisfied. The masks live in a per-class tree of
//!   atomically installed nodes, one level per local, created on demand
//!   and never removed while the graph runs.
//! - Releases the outputs of a finished instance by OR-ing the destination
//!   flow's bit into each successor's mask. The one OR that completes a
//!   mask hands the successor to the scheduler, so every instance is
//!   dispatched exactly once however many threads race on it.
//! - Sends one activation message per remote rank and finished instance
//!   when successors belong to another process.
//!
//! Key modules:
//! - `task_class`, `registry`: immutable graph definition.
//! - `symbol`, `enumerate`: range evaluation and instance enumeration.
//! - `deps`: the lazy dependency tree.
//! - `release`, `taskpool`: the release protocol and the per-rank state it
//!   runs against.
//! - `remote`, `distribution`: activation messages and instance ownership.
//! - `executor`: a work-stealing thread pool driving a taskpool to
//!   completion.
//!
//! Quick start:
//! 1. Register task classes built with `TaskClassBuilder` in a `Registry`.
//! 2. Implement `Config` with the distribution, transport and task body of
//!    the run, and create a `Taskpool`.
//! 3. Hand the taskpool to an `Executor`, or call `startup_tasks` and
//!    `complete_execution` from a scheduler of your own.

/// Compile-time and runtime configuration of a taskpool.
///
/// Exposes the `Config` trait binding the collaborator types of a run and
/// `RuntimeConfig`, loaded from TOML.
pub mod config;
/// Execution contexts: one instance of a task class, or a partially bound
/// one during enumeration.
pub mod context;
/// Lazy per-class tree of dependency bitmasks.
pub mod deps;
/// Text dumps of task classes, ranges and dependencies.
pub mod diagnostics;
/// Mapping from instances to owning ranks.
pub mod distribution;
/// Odometer enumeration of the instances of a task class.
pub mod enumerate;
/// Work-stealing execution of a taskpool on worker threads.
#[cfg(not(feature = "loom"))]
pub mod executor;
/// Integer expressions over the locals of a task class.
pub mod expr;
/// Installation of the global `tracing` subscriber.
pub mod logging;
/// Registry of the task classes of one graph.
pub mod registry;
/// Release of output dependencies and readiness detection.
pub mod release;
/// Activation messages exchanged between ranks.
pub mod remote;
/// Interface through which ready instances leave the engine.
pub mod scheduler;
/// Local symbols and the symbolic range evaluator.
pub mod symbol;
mod sync;
/// Task classes, flows and dependencies.
pub mod task_class;
/// Per-rank state of one graph execution.
pub mod taskpool;
/// Limits, aliases and collection types used across the crate.
pub mod types;
