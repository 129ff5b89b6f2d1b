use kiln_graph::GraphError;

/// Errors produced by the solver and the contracts it consumes.
///
/// These are kinds, not types: callers match on the variant to decide policy.
/// [`SolverError::NotFound`] during cache lookup degrades to a miss; every
/// other kind propagates up the DAG, so a vertex fails iff one of its inputs
/// fails or its own operation fails.
///
/// The enum is `Clone` so a terminal failure can be broadcast to every waiter
/// of a shared computation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SolverError {
    /// Malformed or empty graph, missing input digests, cycle detected.
    #[error("invalid definition: {0}")]
    InvalidDefinition(String),
    /// A cache record or stored result is missing despite a link.
    #[error("not found: {0}")]
    NotFound(String),
    /// The operation returned an error or a non-zero exit code.
    #[error("operation failed: {0}")]
    OperationFailed(String),
    /// Cooperative cancellation reached this vertex.
    #[error("canceled")]
    Canceled,
    /// The reference registry detected a misuse.
    #[error("invalid handle: {0}")]
    InvalidHandle(String),
    /// Invariant violation inside the solver.
    #[error("internal: {0}")]
    Internal(String),
}

impl From<GraphError> for SolverError {
    fn from(err: GraphError) -> Self {
        SolverError::InvalidDefinition(err.to_string())
    }
}

/// Result alias used throughout the solver.
pub type Result<T, E = SolverError> = std::result::Result<T, E>;
