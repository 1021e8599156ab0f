//! Typed error surface for the coordination core.
//!
//! Internal plumbing (row mapping, SQL errors) uses `anyhow::Result` and is
//! converted to `CoreError` at component boundaries — the same split the
//! teacher draws between `anyhow` internals and typed error codes at its
//! RPC boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// A uniqueness constraint lost the race (e.g. two agents reserving the
    /// same task, or the same file path, concurrently).
    #[error("contended: {0}")]
    Contended(String),

    /// Adding a dependency edge would break acyclicity of the hard-edge
    /// subgraph.
    #[error("would create a cycle: {0}")]
    WouldCycle(String),

    /// A lease renewal found no lease owned by the caller.
    #[error("lease lost for task {task_id}")]
    LeaseLost { task_id: String },

    /// Entity missing (task, dependency, reservation, agent).
    #[error("not found: {0}")]
    NotFound(String),

    /// Internal consistency violation. Should never occur; fatal.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Caller-supplied deadline elapsed before the operation completed.
    #[error("deadline exceeded")]
    Deadline,

    /// File reservation conflict; lists the offending paths.
    #[error("file reservation conflict: {0:?}")]
    Conflict(Vec<String>),

    /// Anything else — wraps the underlying store/IO error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
