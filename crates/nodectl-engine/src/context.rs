//! Per-connection session context handed to outbound dispatch.

use std::net::IpAddr;

/// Whether the engine may move bytes with kernel splice instead of the
/// userland copy loop. Splice bypasses the per-user counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpliceCopy {
    /// Engine decides per protocol.
    #[default]
    Auto,
    /// Userland copy only.
    Disabled,
}

/// The inbound side of a session: which entry point accepted it and who
/// authenticated on it.
#[derive(Debug, Clone)]
pub struct InboundSession {
    /// Tag of the inbound that accepted the connection.
    pub tag: String,
    /// Authenticated user identity. `None` for unauthenticated paths.
    pub user: Option<String>,
    /// Remote address of the client.
    pub source: IpAddr,
    pub splice_copy: SpliceCopy,
}

impl InboundSession {
    pub fn new(tag: impl Into<String>, source: IpAddr) -> Self {
        Self {
            tag: tag.into(),
            user: None,
            source,
            splice_copy: SpliceCopy::Auto,
        }
    }

    #[must_use]
    pub fn with_user(mut self, email: impl Into<String>) -> Self {
        self.user = Some(email.into());
        self
    }

    /// Returns the user identity if one is attached and non-empty.
    pub fn email(&self) -> Option<&str> {
        self.user.as_deref().filter(|e| !e.is_empty())
    }
}

/// Context for one outbound dispatch.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub inbound: Option<InboundSession>,
    /// Routed destination (`host:port`), when the engine knows it.
    pub destination: Option<String>,
}

impl SessionContext {
    pub fn new(inbound: InboundSession) -> Self {
        Self {
            inbound: Some(inbound),
            destination: None,
        }
    }

    #[must_use]
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }
}
