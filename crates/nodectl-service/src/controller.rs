//! Handler and user lifecycle.
//!
//! The controller creates inbound/outbound handlers through the engine's
//! factory, wraps every outbound in [`StatsOutbound`], provisions users on
//! inbound user tables, and exposes the administrative surface the
//! management-plane client drives: limiter and rule lifecycle plus traffic
//! query/reset.
//!
//! Every operation either completes or leaves state as it was, except user
//! batches: a batch stops at the first failing user and reports it, while
//! users before it stay provisioned.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use nodectl_engine::{
    EngineError, HandlerConfig, HandlerFactory, HandlerObject, HandlerRegistry, InboundHandler,
    InboundHandlerConfig, InboundManager, OutboundHandler, OutboundHandlerConfig,
    OutboundManager, User, UserManager,
};

use crate::SharedState;
use crate::config::{ControllerConfig, InboundPolicy};
use crate::error::ServiceError;
use crate::rule::{DetectResult, DetectRule};
use crate::stats::{Counter, StatsManager, traffic_counter_name};
use crate::types::{Direction, OnlineDevice, UserLimit, UserTraffic};
use crate::wrapper::StatsOutbound;

/// Orchestrates handlers, users and enforcement state of one proxy node.
pub struct Controller {
    factory: Arc<dyn HandlerFactory>,
    inbounds: Arc<dyn InboundManager>,
    outbounds: Arc<dyn OutboundManager>,
    stats: Arc<StatsManager>,
    state: SharedState,
    /// Users provisioned through this controller, per inbound tag.
    provisioned: DashMap<String, HashSet<String>>,
}

fn check_tag(tag: &str) -> Result<(), ServiceError> {
    if tag.is_empty() {
        return Err(ServiceError::BadRequest("inbound tag must not be empty".into()));
    }
    Ok(())
}

/// Maps a registry miss to `NotFound`; anything else stays an engine error.
fn not_found(kind: &str, tag: &str) -> impl FnOnce(EngineError) -> ServiceError {
    let message = format!("no such {kind} tag: {tag}");
    move |e| match e {
        EngineError::HandlerNotFound(_) => ServiceError::NotFound(message),
        other => ServiceError::Engine(other),
    }
}

/// Reads a counter once; a zero value drops the handle.
fn nonzero(counter: Option<Arc<Counter>>) -> (i64, Option<Arc<Counter>>) {
    match counter {
        Some(counter) => match counter.value() {
            0 => (0, None),
            value => (value, Some(counter)),
        },
        None => (0, None),
    }
}

impl Controller {
    pub fn new(
        factory: Arc<dyn HandlerFactory>,
        inbounds: Arc<dyn InboundManager>,
        outbounds: Arc<dyn OutboundManager>,
        stats: Arc<StatsManager>,
        state: SharedState,
    ) -> Self {
        Self {
            factory,
            inbounds,
            outbounds,
            stats,
            state,
            provisioned: DashMap::new(),
        }
    }

    /// Creates a controller backed by in-memory handler registries and a
    /// fresh counter store.
    pub fn in_memory(factory: Arc<dyn HandlerFactory>, config: &ControllerConfig) -> Self {
        let inbounds: Arc<HandlerRegistry<dyn InboundHandler>> = Arc::new(HandlerRegistry::new());
        let outbounds: Arc<HandlerRegistry<dyn OutboundHandler>> =
            Arc::new(HandlerRegistry::new());
        Self::new(
            factory,
            inbounds,
            outbounds,
            Arc::new(StatsManager::new()),
            SharedState::new(config),
        )
    }

    // --- Accessors ---

    pub fn shared(&self) -> &SharedState {
        &self.state
    }

    pub fn stats(&self) -> &Arc<StatsManager> {
        &self.stats
    }

    /// Users provisioned on `tag` through this controller, unordered.
    pub fn provisioned_users(&self, tag: &str) -> Vec<String> {
        self.provisioned
            .get(tag)
            .map(|users| users.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Renders interception metrics in Prometheus text format.
    pub fn render_metrics(&self) -> String {
        self.state
            .metrics()
            .render(self.state.limiter().tags().len(), self.stats.len())
    }

    // --- Handlers ---

    pub fn add_inbound(&self, config: &InboundHandlerConfig) -> Result<(), ServiceError> {
        check_tag(&config.tag)?;
        let handler = match self.factory.create(HandlerConfig::Inbound(config))? {
            HandlerObject::Inbound(handler) => handler,
            other => {
                tracing::warn!(
                    tag = %config.tag,
                    got = other.kind(),
                    "factory returned the wrong handler kind"
                );
                return Err(ServiceError::CapabilityMismatch {
                    tag: config.tag.clone(),
                    capability: "InboundHandler",
                });
            }
        };
        self.inbounds.add_handler(handler)?;
        tracing::info!(tag = %config.tag, protocol = %config.protocol, "inbound added");
        Ok(())
    }

    /// Removes an inbound and everything scoped to its tag: limiter state,
    /// rules, detection results and the counters of its users.
    pub fn remove_inbound(&self, tag: &str) -> Result<(), ServiceError> {
        check_tag(tag)?;
        self.inbounds
            .remove_handler(tag)
            .map_err(not_found("inbound", tag))?;

        if self.state.limiter().contains(tag) {
            // NotFound here only means a concurrent delete got there first.
            let _ = self.state.limiter().delete_inbound_limiter(tag);
        }
        self.state.rules().remove_tag(tag);
        if let Some((_, users)) = self.provisioned.remove(tag) {
            for email in &users {
                self.unregister_counters(email);
            }
        }
        tracing::info!(tag = %tag, "inbound removed");
        Ok(())
    }

    /// Creates an outbound, wraps it for accounting and enforcement, and
    /// installs the wrapper.
    pub fn add_outbound(&self, config: &OutboundHandlerConfig) -> Result<(), ServiceError> {
        check_tag(&config.tag)?;
        let handler = match self.factory.create(HandlerConfig::Outbound(config))? {
            HandlerObject::Outbound(handler) => handler,
            other => {
                tracing::warn!(
                    tag = %config.tag,
                    got = other.kind(),
                    "factory returned the wrong handler kind"
                );
                return Err(ServiceError::CapabilityMismatch {
                    tag: config.tag.clone(),
                    capability: "OutboundHandler",
                });
            }
        };
        let wrapped = StatsOutbound::new(handler, self.state.clone());
        self.outbounds.add_handler(Arc::new(wrapped))?;
        tracing::info!(tag = %config.tag, protocol = %config.protocol, "outbound added");
        Ok(())
    }

    pub fn remove_outbound(&self, tag: &str) -> Result<(), ServiceError> {
        check_tag(tag)?;
        self.outbounds
            .remove_handler(tag)
            .map_err(not_found("outbound", tag))?;
        tracing::info!(tag = %tag, "outbound removed");
        Ok(())
    }

    // --- Users ---

    fn inbound(&self, tag: &str) -> Result<Arc<dyn InboundHandler>, ServiceError> {
        check_tag(tag)?;
        self.inbounds
            .get_handler(tag)
            .map_err(not_found("inbound", tag))
    }

    /// Provisions users on an inbound and pre-registers their traffic
    /// counters. Stops at the first failure; earlier users stay.
    pub async fn add_users(&self, users: &[User], tag: &str) -> Result<(), ServiceError> {
        let handler = self.inbound(tag)?;
        let manager = handler
            .user_manager()
            .ok_or_else(|| ServiceError::CapabilityMismatch {
                tag: tag.to_owned(),
                capability: "UserManager",
            })?;

        for user in users {
            self.add_user(manager, user, tag)
                .await
                .map_err(|source| ServiceError::BatchFailed {
                    tag: tag.to_owned(),
                    identity: user.email.clone(),
                    source: Box::new(source),
                })?;
        }
        tracing::info!(tag = %tag, count = users.len(), "users added");
        Ok(())
    }

    async fn add_user(
        &self,
        manager: &dyn UserManager,
        user: &User,
        tag: &str,
    ) -> Result<(), ServiceError> {
        if user.email.is_empty() {
            return Err(ServiceError::BadRequest("user identity must not be empty".into()));
        }
        manager.add_user(user.clone()).await?;

        // The inbound is re-checked under the tag's entry guard:
        // `remove_inbound` drops the handler before it clears `provisioned`.
        let entry = self.provisioned.entry(tag.to_owned());
        self.inbounds
            .get_handler(tag)
            .map_err(not_found("inbound", tag))?;
        for direction in [Direction::Uplink, Direction::Downlink] {
            self.stats
                .get_or_register_counter(&traffic_counter_name(&user.email, direction));
        }
        entry.or_default().insert(user.email.clone());
        Ok(())
    }

    /// Deprovisions users and drops their traffic counters. Stops at the
    /// first failure; earlier users stay removed.
    pub async fn remove_users(&self, emails: &[String], tag: &str) -> Result<(), ServiceError> {
        let handler = self.inbound(tag)?;
        let manager = handler
            .user_manager()
            .ok_or_else(|| ServiceError::CapabilityMismatch {
                tag: tag.to_owned(),
                capability: "UserManager",
            })?;

        for email in emails {
            manager
                .remove_user(email)
                .await
                .map_err(|e| ServiceError::BatchFailed {
                    tag: tag.to_owned(),
                    identity: email.clone(),
                    source: Box::new(e.into()),
                })?;
            self.unregister_counters(email);
            if let Some(mut users) = self.provisioned.get_mut(tag) {
                users.remove(email);
            }
        }
        tracing::info!(tag = %tag, count = emails.len(), "users removed");
        Ok(())
    }

    fn unregister_counters(&self, email: &str) {
        for direction in [Direction::Uplink, Direction::Downlink] {
            self.stats
                .unregister_counter(&traffic_counter_name(email, direction));
        }
    }

    // --- Traffic ---

    /// Reads a user's traffic.
    ///
    /// `None` means the user has no counters (never provisioned, or
    /// removed). Otherwise a direction whose counter reads zero has no
    /// handle, so the reporter only collects handles worth resetting.
    pub fn get_traffic(&self, email: &str) -> Option<UserTraffic> {
        let up = self
            .stats
            .get_counter(&traffic_counter_name(email, Direction::Uplink));
        let down = self
            .stats
            .get_counter(&traffic_counter_name(email, Direction::Downlink));
        if up.is_none() && down.is_none() {
            return None;
        }

        let (up, up_counter) = nonzero(up);
        let (down, down_counter) = nonzero(down);
        Some(UserTraffic {
            up,
            down,
            up_counter,
            down_counter,
        })
    }

    /// Zeroes the given counters. Increments racing with the reset may land
    /// on either side of it.
    pub fn reset_traffic(&self, up_counters: &[Arc<Counter>], down_counters: &[Arc<Counter>]) {
        for counter in up_counters.iter().chain(down_counters) {
            counter.set(0);
        }
    }

    // --- Limiter and rules ---

    pub fn add_inbound_limiter(
        &self,
        tag: &str,
        node_speed_limit: u64,
        users: &[UserLimit],
        policy: &InboundPolicy,
    ) -> Result<(), ServiceError> {
        check_tag(tag)?;
        self.state
            .limiter()
            .add_inbound_limiter(tag, node_speed_limit, users, policy)
    }

    pub fn update_inbound_limiter(
        &self,
        tag: &str,
        updated: &[UserLimit],
    ) -> Result<(), ServiceError> {
        check_tag(tag)?;
        self.state.limiter().update_inbound_limiter(tag, updated)
    }

    pub fn delete_inbound_limiter(&self, tag: &str) -> Result<(), ServiceError> {
        check_tag(tag)?;
        self.state.limiter().delete_inbound_limiter(tag)
    }

    pub fn get_online_device(&self, tag: &str) -> Result<Vec<OnlineDevice>, ServiceError> {
        check_tag(tag)?;
        self.state.limiter().get_online_device(tag)
    }

    pub fn update_rule(&self, tag: &str, rules: Vec<DetectRule>) -> Result<(), ServiceError> {
        check_tag(tag)?;
        self.state.rules().update_rule(tag, rules);
        Ok(())
    }

    pub fn get_detect_result(&self, tag: &str) -> Result<Vec<DetectResult>, ServiceError> {
        check_tag(tag)?;
        Ok(self.state.rules().get_detect_result(tag))
    }
}
