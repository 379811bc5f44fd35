//! Engine error type.
//!
//! Errors are fail-fast: a task that hits one aborts the whole step, and the
//! engine surfaces a single diagnostic line identifying the node, the
//! location and the offending values. There is no in-step recovery.

use thiserror::Error;

/// Everything that can go fatally wrong inside the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A structural invariant does not hold (particle outside its cell,
    /// broken gas/gravity linkage, unsorted cell in a pair sweep, ...).
    #[error("[{node:04}] invariant violated in {location}: {detail}")]
    InvariantViolation {
        /// Node on which the violation was detected.
        node: usize,
        /// Component and condition.
        location: &'static str,
        /// Offending values.
        detail: String,
    },

    /// A preallocated structure (link table, proxy table, task list) ran out
    /// of room; indicates a mis-sized preallocation.
    #[error("[{node:04}] {what} overflow: capacity {capacity}")]
    GraphOverflow {
        /// Node reporting the overflow.
        node: usize,
        /// Which structure overflowed.
        what: &'static str,
        /// Its capacity.
        capacity: usize,
    },

    /// A point-to-point or collective exchange failed or timed out.
    #[error("[{node:04}] communication with node {peer} failed: {detail}")]
    Communication {
        /// Node reporting the failure.
        node: usize,
        /// Peer involved.
        peer: usize,
        /// What happened.
        detail: String,
    },

    /// Parameter validation failed; reported before any particle is touched.
    #[error("invalid parameter {key}: {detail}")]
    Parameter {
        /// Offending parameter key, section-qualified.
        key: String,
        /// Why it is invalid.
        detail: String,
    },

    /// The unlock graph is not acyclic.
    #[error("[{node:04}] task graph contains a cycle ({remaining} tasks unrankable)")]
    CyclicGraph {
        /// Node reporting the cycle.
        node: usize,
        /// Number of tasks left without a rank.
        remaining: usize,
    },

    /// A worker aborted the step.
    #[error("[{node:04}] step aborted: {detail}")]
    StepAborted {
        /// Node reporting the abort.
        node: usize,
        /// First error recorded.
        detail: String,
    },

    /// File or serialisation problem on a config, snapshot or statistics path.
    #[error("i/o error on {path}: {detail}")]
    Io {
        /// The path involved.
        path: String,
        /// Underlying error.
        detail: String,
    },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;
