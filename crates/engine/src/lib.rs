//! Task-based parallel particle engine core.
//!
//! Turns a neighbour-finding problem over a large particle population into
//! a data-parallel dependency graph and drains it over worker threads, with
//! cross-node exchange behind a transport abstraction.
//!
//! # Modules
//! - [`space`], [`cell`], [`sort`] -- hierarchical spatial decomposition,
//!   particle membership, pair-axis sorting.
//! - [`task`], [`graph`], [`scheduler`] -- the per-step dependency graph and
//!   its queues.
//! - [`runner`], [`pool`], [`threadpool`] -- task dispatch, the worker pool
//!   with its launch barrier, and the parallel-for used by the cell-wide
//!   passes.
//! - [`proxy`], [`exchange`], [`transport`] -- foreign-cell shadows,
//!   stray-particle redistribution, and the node-to-node messaging seam.
//! - [`partition`] -- the cell-to-node ownership black box and the
//!   imbalance trigger.
//! - [`engine`] -- the step loop gluing it all together.

#![warn(missing_docs)]

pub mod cell;
pub mod config;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod graph;
pub mod partition;
pub mod pool;
pub mod proxy;
pub mod runner;
pub mod scheduler;
pub mod sort;
pub mod space;
pub mod task;
pub mod threadpool;
pub mod transport;

pub use cell::{Cell, CellId, TaskId};
pub use config::EngineParams;
pub use engine::{
    unskip_pass, Engine, EnginePolicy, JsonSnapshotSink, NullSink, SnapshotSink, StepInfo,
};
pub use error::{EngineError, Result};
pub use graph::GraphPolicy;
pub use partition::{Partitioner, WeightedSlabPartitioner};
pub use runner::RunnerParams;
pub use scheduler::Scheduler;
pub use space::Space;
pub use task::{Task, TaskSubtype, TaskType};
pub use transport::{memory_cluster, MemoryTransport, Transport};
