//! Configuration for the control layer.
//!
//! Node-level settings are deserialized from whatever format the embedder
//! uses; every field has a default so an empty document is valid.

use serde::Deserialize;

/// Default upper bound on unreported detection results per inbound.
pub const DEFAULT_DETECT_RESULT_CAPACITY: usize = 1024;

/// Settings shared by every wrapped outbound and the rule manager.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Force the userland copy path on intercepted sessions so that
    /// engine-side byte counting sees every byte.
    pub disable_splice: bool,
    /// Upper bound on buffered detection results per inbound tag.
    pub detect_result_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            disable_splice: true,
            detect_result_capacity: DEFAULT_DETECT_RESULT_CAPACITY,
        }
    }
}

/// Limiter policy for one inbound tag.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InboundPolicy {
    /// Reject new source addresses once a user reaches its device limit.
    /// When false, devices are still tracked for online reporting.
    pub enforce_device_limit: bool,
    /// Aggregate downlink cap shared by all users of the inbound, in bytes
    /// per second. 0 = none.
    pub inbound_speed_limit: u64,
}

impl Default for InboundPolicy {
    fn default() -> Self {
        Self {
            enforce_device_limit: true,
            inbound_speed_limit: 0,
        }
    }
}
