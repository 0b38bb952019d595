//! Error types for gradgraph.

use thiserror::Error;

/// Errors that can occur during graph construction or a backward pass.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Node reference does not belong to the graph being operated on.
    #[error("unknown node: index {index} is out of range for graph with {len} nodes")]
    UnknownNode { index: usize, len: usize },

    /// Leaf created with a malformed value.
    #[error("invalid leaf value: {message}")]
    InvalidValue { message: String },

    /// Operand count incompatible with the operation's arity.
    #[error("{op} expects {expected} operand(s), got {actual}")]
    ShapeMismatch {
        op: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Undefined result in an operation's forward function.
    #[error("domain error in {op}: {message}")]
    Domain { op: &'static str, message: String },

    /// Operation kind tag not registered in this graph's registry.
    #[error("unknown operation kind {kind}")]
    UnknownOp { kind: u32 },

    /// Counting pass found an operand edge that does not point backward.
    #[error("cycle detected: node {index} consumes a node not created before it")]
    GraphCycle { index: usize },

    /// Backward called without a seed on a value type that has no unit seed.
    #[error("backward on a non-scalar root requires an explicit seed gradient")]
    MissingSeed,

    /// Counting-pass/backward-engine mismatch.
    #[error("internal invariant violated: {message}")]
    InternalInvariant { message: String },
}
