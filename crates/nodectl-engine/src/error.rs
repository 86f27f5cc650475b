//! Errors reported by the proxy engine.

/// Error returned by engine capabilities (factory, registries, user managers).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// No handler is registered under the tag.
    #[error("handler '{0}' not found")]
    HandlerNotFound(String),

    /// A handler with the same tag is already registered.
    #[error("handler '{0}' already exists")]
    DuplicateTag(String),

    /// The inbound already has a user with this identity.
    #[error("user '{0}' already exists")]
    UserExists(String),

    /// The inbound has no user with this identity.
    #[error("user '{0}' not found")]
    UserNotFound(String),

    /// The handler configuration was rejected by the factory.
    #[error("invalid handler config: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Other(String),
}
