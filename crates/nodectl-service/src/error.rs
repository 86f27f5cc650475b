//! Service-layer error types.
//!
//! `ServiceError` is what the management-plane client sees. Device-limit
//! and rule rejections are not errors: they terminate the connection and
//! are logged and counted instead.

use nodectl_engine::EngineError;

/// Error returned by controller, limiter and counter operations.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Invalid argument (empty tag, empty user identity).
    #[error("{0}")]
    BadRequest(String),

    /// Unknown inbound tag, user or counter.
    #[error("{0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("{0}")]
    Conflict(String),

    /// A handler lacks a capability the controller relies on.
    #[error("handler '{tag}' does not implement {capability}")]
    CapabilityMismatch {
        tag: String,
        capability: &'static str,
    },

    /// One item of a user batch failed. Items before it were applied and
    /// stay applied.
    #[error("user '{identity}' on inbound '{tag}' failed: {source}")]
    BatchFailed {
        tag: String,
        identity: String,
        #[source]
        source: Box<ServiceError>,
    },

    /// Error reported by the proxy engine.
    #[error(transparent)]
    Engine(#[from] EngineError),
}
