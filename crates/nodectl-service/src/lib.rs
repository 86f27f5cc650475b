//! nodectl Service: traffic accounting and admission control for a
//! multi-tenant proxy node.
//!
//! Sits between the proxy engine's data plane and the management plane:
//! every outbound dispatch goes through [`wrapper::StatsOutbound`], which
//! consults the per-inbound [`limiter::LimiterRegistry`] and
//! [`rule::RuleManager`] before the real handler sees the connection.
//! The [`controller::Controller`] drives handler and user lifecycle and
//! exposes traffic counters from the [`stats::StatsManager`].
//!
//! **No protocol code.** Handlers, links and registries come from the
//! engine through the traits in `nodectl-engine`.

pub mod config;
pub mod controller;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod rate_limit;
pub mod rule;
pub mod stats;
pub mod types;
pub mod wrapper;

use std::sync::Arc;

use config::ControllerConfig;
use limiter::LimiterRegistry;
use metrics::Metrics;
use rule::RuleManager;

pub use controller::Controller;
pub use error::ServiceError;
pub use stats::{Counter, StatsManager};
pub use wrapper::StatsOutbound;

/// Enforcement state shared by every wrapped outbound and the controller.
///
/// Wrapped outbounds never own limiter or rule state; they hold a clone of
/// this and look state up by inbound tag on each dispatch.
#[derive(Clone)]
pub struct SharedState {
    inner: Arc<Inner>,
}

struct Inner {
    limiter: LimiterRegistry,
    rules: RuleManager,
    metrics: Metrics,
    config: ControllerConfig,
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new(&ControllerConfig::default())
    }
}

impl SharedState {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                limiter: LimiterRegistry::new(),
                rules: RuleManager::new(config.detect_result_capacity),
                metrics: Metrics::new(),
                config: config.clone(),
            }),
        }
    }

    // --- Accessors ---

    pub fn limiter(&self) -> &LimiterRegistry {
        &self.inner.limiter
    }

    pub fn rules(&self) -> &RuleManager {
        &self.inner.rules
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    // --- Maintenance ---

    /// Drops rate buckets of users without live devices. Returns count removed.
    pub fn cleanup(&self) -> usize {
        self.inner.limiter.cleanup()
    }
}
