//! Users provisioned on inbound handlers.

use serde::{Deserialize, Serialize};

/// A user provisioned on an inbound.
///
/// `email` is the identity every accounting and limiting structure keys on.
/// `account` carries protocol credentials the engine interprets; nodectl
/// never looks inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub email: String,
    #[serde(default)]
    pub level: u32,
    #[serde(default)]
    pub account: serde_json::Value,
}

impl User {
    /// Creates a user with no account payload.
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            level: 0,
            account: serde_json::Value::Null,
        }
    }
}
