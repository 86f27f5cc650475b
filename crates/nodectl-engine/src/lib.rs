//! nodectl Engine: the proxy-engine surface consumed by the control layer.
//!
//! Protocol implementations, transports and the handler factory live in the
//! proxy engine itself. This crate only describes the capabilities nodectl
//! needs from them: creating handlers from configuration, dispatching a
//! connection on an outbound, managing users on an inbound, and the
//! bidirectional link that carries a connection's bytes.
//!
//! An in-memory [`HandlerRegistry`] is provided for embedders that do not
//! bring their own inbound/outbound managers.

pub mod context;
pub mod error;
pub mod handler;
pub mod link;
pub mod registry;
pub mod user;

pub use context::{InboundSession, SessionContext, SpliceCopy};
pub use error::EngineError;
pub use handler::{
    HandlerConfig, HandlerFactory, HandlerObject, InboundHandler, InboundHandlerConfig,
    InboundManager, OutboundHandler, OutboundHandlerConfig, OutboundManager, UserManager,
};
pub use link::{Link, LinkReader, LinkWriter};
pub use registry::HandlerRegistry;
pub use user::User;
