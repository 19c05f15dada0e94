//! Runtime error types.

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors produced by the state runtime and the workflow executor.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// An `at_most_once` step previously failed (or crashed between its two
    /// commit fences); the side effect must not be re-attempted.
    #[error("at-most-once step '{label}' failed before completing")]
    AtMostOnceFailedBeforeCompleting {
        /// The step label.
        label: String,
    },

    /// An event alias was used twice within one handler invocation.
    #[error("duplicate event alias '{alias}' within one invocation")]
    DuplicateEventAlias {
        /// The offending alias.
        alias: String,
    },

    /// A record invariant was violated (e.g. `client_info` stored twice).
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The backing store failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Step-result (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An application-level failure propagated through a workflow step.
    #[error("{0}")]
    App(String),
}

impl RuntimeError {
    /// Application-level error carried through the executor combinators.
    pub fn app(message: impl Into<String>) -> Self {
        Self::App(message.into())
    }
}
