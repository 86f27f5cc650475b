//! In-memory handler registry.
//!
//! One `DashMap` per role keyed by tag. Handlers are stored as `Arc` so a
//! lookup can release the shard lock before the caller uses the handler.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::error::EngineError;
use crate::handler::{InboundHandler, InboundManager, OutboundHandler, OutboundManager};

/// Thread-safe registry of handlers of one role.
pub struct HandlerRegistry<H: ?Sized> {
    handlers: DashMap<String, Arc<H>>,
}

impl<H: ?Sized> Default for HandlerRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: ?Sized> HandlerRegistry<H> {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Returns the registered tags, unordered.
    pub fn tags(&self) -> Vec<String> {
        self.handlers.iter().map(|e| e.key().clone()).collect()
    }

    fn insert(&self, tag: &str, handler: Arc<H>) -> Result<(), EngineError> {
        match self.handlers.entry(tag.to_owned()) {
            Entry::Occupied(_) => Err(EngineError::DuplicateTag(tag.to_owned())),
            Entry::Vacant(slot) => {
                slot.insert(handler);
                Ok(())
            }
        }
    }

    fn get(&self, tag: &str) -> Result<Arc<H>, EngineError> {
        self.handlers
            .get(tag)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| EngineError::HandlerNotFound(tag.to_owned()))
    }

    fn remove(&self, tag: &str) -> Result<(), EngineError> {
        self.handlers
            .remove(tag)
            .map(|_| ())
            .ok_or_else(|| EngineError::HandlerNotFound(tag.to_owned()))
    }
}

impl InboundManager for HandlerRegistry<dyn InboundHandler> {
    fn add_handler(&self, handler: Arc<dyn InboundHandler>) -> Result<(), EngineError> {
        let tag = handler.tag().to_owned();
        self.insert(&tag, handler)?;
        tracing::debug!(tag = %tag, "inbound handler registered");
        Ok(())
    }

    fn get_handler(&self, tag: &str) -> Result<Arc<dyn InboundHandler>, EngineError> {
        self.get(tag)
    }

    fn remove_handler(&self, tag: &str) -> Result<(), EngineError> {
        self.remove(tag)
    }
}

impl OutboundManager for HandlerRegistry<dyn OutboundHandler> {
    fn add_handler(&self, handler: Arc<dyn OutboundHandler>) -> Result<(), EngineError> {
        let tag = handler.tag().to_owned();
        self.insert(&tag, handler)?;
        tracing::debug!(tag = %tag, "outbound handler registered");
        Ok(())
    }

    fn get_handler(&self, tag: &str) -> Result<Arc<dyn OutboundHandler>, EngineError> {
        self.get(tag)
    }

    fn remove_handler(&self, tag: &str) -> Result<(), EngineError> {
        self.remove(tag)
    }
}
