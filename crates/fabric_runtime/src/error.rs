//! Runtime Errors
//!
//! Topology errors (duplicate names, conflicting contexts) are fatal at
//! startup. Per-event failures never cross a queue boundary and are logged
//! by the component loop instead of being returned here.

/// Errors returned by the loader and the runtime
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    #[error("Component already registered: {0}")]
    DuplicateRegistration(String),

    #[error("Context '{key}' bound to both {existing} and {requested}")]
    ContextConflict {
        key: String,
        existing: &'static str,
        requested: &'static str,
    },

    #[error("Context already created: {0}")]
    DuplicateContext(String),

    #[error("Context '{key}' is not available as {expected}")]
    ContextUnavailable { key: String, expected: &'static str },

    #[error("Unknown component: {0}")]
    UnknownComponent(String),

    #[error("Failed to construct component {name}: {reason}")]
    Construction { name: String, reason: String },

    #[error("Request to {destination} was dropped before a reply was sent")]
    RequestDropped { destination: String },

    #[error("Request already answered")]
    AlreadyReplied,

    #[error("Event was not delivered as a request")]
    NoPendingRequest,

    #[error("Component task panicked: {0}")]
    TaskPanicked(String),
}

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;
