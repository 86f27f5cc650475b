//! Types shared between the limiter, rule manager and controller.

use std::net::IpAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::stats::Counter;

/// Traffic direction of a user counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Uplink,
    Downlink,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uplink => "uplink",
            Self::Downlink => "downlink",
        }
    }
}

/// Limits applied to one user on one inbound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLimit {
    pub email: String,
    #[serde(default)]
    pub uid: u32,
    /// Bytes per second, 0 = unlimited.
    #[serde(default)]
    pub speed_limit: u64,
    /// Maximum distinct concurrent source addresses, 0 = unlimited.
    #[serde(default)]
    pub device_limit: u32,
}

impl UserLimit {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            uid: 0,
            speed_limit: 0,
            device_limit: 0,
        }
    }

    #[must_use]
    pub fn with_uid(mut self, uid: u32) -> Self {
        self.uid = uid;
        self
    }

    #[must_use]
    pub fn with_speed_limit(mut self, bytes_per_sec: u64) -> Self {
        self.speed_limit = bytes_per_sec;
        self
    }

    #[must_use]
    pub fn with_device_limit(mut self, devices: u32) -> Self {
        self.device_limit = devices;
        self
    }
}

/// One live connection origin of a user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct OnlineDevice {
    pub user: String,
    pub uid: u32,
    pub address: IpAddr,
}

/// A provisioned user's traffic as seen by the reporting component.
///
/// A direction whose counter reads zero carries no handle: there is
/// nothing to report or reset for it.
#[derive(Debug, Clone, Default)]
pub struct UserTraffic {
    pub up: i64,
    pub down: i64,
    pub up_counter: Option<Arc<Counter>>,
    pub down_counter: Option<Arc<Counter>>,
}

impl UserTraffic {
    /// Whether either direction has something to report.
    pub fn has_traffic(&self) -> bool {
        self.up_counter.is_some() || self.down_counter.is_some()
    }
}
