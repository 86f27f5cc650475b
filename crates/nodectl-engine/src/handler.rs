//! Handler capabilities.
//!
//! A handler is an inbound or an outbound depending on which trait object
//! the factory hands back. Optional capabilities (a user table on an
//! inbound) are exposed through accessors returning `Option`, so callers
//! check them once instead of downcasting at run time.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::SessionContext;
use crate::error::EngineError;
use crate::link::Link;
use crate::user::User;

/// Configuration for one inbound handler. `settings` is protocol-specific.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundHandlerConfig {
    pub tag: String,
    pub protocol: String,
    #[serde(default)]
    pub settings: serde_json::Value,
}

/// Configuration for one outbound handler. `settings` is protocol-specific.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundHandlerConfig {
    pub tag: String,
    pub protocol: String,
    #[serde(default)]
    pub settings: serde_json::Value,
}

/// Configuration handed to the factory.
#[derive(Debug, Clone, Copy)]
pub enum HandlerConfig<'a> {
    Inbound(&'a InboundHandlerConfig),
    Outbound(&'a OutboundHandlerConfig),
}

impl HandlerConfig<'_> {
    pub fn tag(&self) -> &str {
        match self {
            Self::Inbound(c) => &c.tag,
            Self::Outbound(c) => &c.tag,
        }
    }
}

/// Add/remove users on a running inbound.
#[async_trait]
pub trait UserManager: Send + Sync {
    async fn add_user(&self, user: User) -> Result<(), EngineError>;
    async fn remove_user(&self, email: &str) -> Result<(), EngineError>;
}

pub trait InboundHandler: Send + Sync {
    fn tag(&self) -> &str;

    /// The inbound's user table, if its protocol has one.
    fn user_manager(&self) -> Option<&dyn UserManager>;
}

#[async_trait]
pub trait OutboundHandler: Send + Sync {
    fn tag(&self) -> &str;

    /// Carries one connection to its destination. Returns when the
    /// connection is finished.
    async fn dispatch(&self, ctx: SessionContext, link: Link);
}

/// Object produced by the factory.
pub enum HandlerObject {
    Inbound(Arc<dyn InboundHandler>),
    Outbound(Arc<dyn OutboundHandler>),
}

impl HandlerObject {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Inbound(_) => "inbound",
            Self::Outbound(_) => "outbound",
        }
    }
}

/// Turns configuration into handler objects.
pub trait HandlerFactory: Send + Sync {
    fn create(&self, config: HandlerConfig<'_>) -> Result<HandlerObject, EngineError>;
}

/// Registry of running inbound handlers.
pub trait InboundManager: Send + Sync {
    fn add_handler(&self, handler: Arc<dyn InboundHandler>) -> Result<(), EngineError>;
    fn get_handler(&self, tag: &str) -> Result<Arc<dyn InboundHandler>, EngineError>;
    fn remove_handler(&self, tag: &str) -> Result<(), EngineError>;
}

/// Registry of running outbound handlers.
pub trait OutboundManager: Send + Sync {
    fn add_handler(&self, handler: Arc<dyn OutboundHandler>) -> Result<(), EngineError>;
    fn get_handler(&self, tag: &str) -> Result<Arc<dyn OutboundHandler>, EngineError>;
    fn remove_handler(&self, tag: &str) -> Result<(), EngineError>;
}
