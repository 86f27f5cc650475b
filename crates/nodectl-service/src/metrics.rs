//! Lightweight Prometheus-compatible metrics using atomic counters.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Why a flow was turned away at the interception point.
#[derive(Clone, Copy)]
pub enum RejectReason {
    DeviceLimit,
    DetectRule,
}

impl RejectReason {
    pub fn label(self) -> &'static str {
        match self {
            Self::DeviceLimit => "device_limit",
            Self::DetectRule => "detect_rule",
        }
    }
}

const ALL_REASONS: [RejectReason; 2] = [RejectReason::DeviceLimit, RejectReason::DetectRule];

/// Interception-point counters.
pub struct Metrics {
    dispatches_total: AtomicU64,
    anonymous_total: AtomicU64,
    throttled_total: AtomicU64,
    device_rejections_total: AtomicU64,
    rule_rejections_total: AtomicU64,
    detect_results_dropped_total: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            dispatches_total: AtomicU64::new(0),
            anonymous_total: AtomicU64::new(0),
            throttled_total: AtomicU64::new(0),
            device_rejections_total: AtomicU64::new(0),
            rule_rejections_total: AtomicU64::new(0),
            detect_results_dropped_total: AtomicU64::new(0),
        }
    }

    /// A dispatch entered the wrapper.
    pub fn record_dispatch(&self) {
        self.dispatches_total.fetch_add(1, Ordering::Relaxed);
    }

    /// A dispatch had no user identity and was passed through.
    pub fn record_anonymous(&self) {
        self.anonymous_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_throttled(&self) {
        self.throttled_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejection(&self, reason: RejectReason) {
        self.rejections(reason).fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_detect_result_dropped(&self) {
        self.detect_results_dropped_total
            .fetch_add(1, Ordering::Relaxed);
    }

    fn rejections(&self, reason: RejectReason) -> &AtomicU64 {
        match reason {
            RejectReason::DeviceLimit => &self.device_rejections_total,
            RejectReason::DetectRule => &self.rule_rejections_total,
        }
    }

    pub fn dispatches(&self) -> u64 {
        self.dispatches_total.load(Ordering::Relaxed)
    }

    pub fn throttled(&self) -> u64 {
        self.throttled_total.load(Ordering::Relaxed)
    }

    pub fn rejected(&self, reason: RejectReason) -> u64 {
        self.rejections(reason).load(Ordering::Relaxed)
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self, inbound_limiters: usize, counters: usize) -> String {
        let mut out = String::with_capacity(1024);

        gauge(
            &mut out,
            "nodectl_inbound_limiters",
            "Inbound tags with limiter state",
            inbound_limiters,
        );
        gauge(
            &mut out,
            "nodectl_traffic_counters",
            "Registered traffic counters",
            counters,
        );

        counter(
            &mut out,
            "nodectl_dispatches_total",
            "Dispatches seen by the interception wrapper.",
            self.dispatches_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "nodectl_anonymous_dispatches_total",
            "Dispatches without a user identity.",
            self.anonymous_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "nodectl_throttled_total",
            "Dispatches whose downlink was rate limited.",
            self.throttled_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "nodectl_detect_results_dropped_total",
            "Detection hits not recorded because the result set was full.",
            self.detect_results_dropped_total.load(Ordering::Relaxed),
        );

        let _ = writeln!(
            out,
            "# HELP nodectl_rejections_total Dispatches closed before reaching the outbound."
        );
        let _ = writeln!(out, "# TYPE nodectl_rejections_total counter");
        for reason in ALL_REASONS {
            let label = reason.label();
            let total = self.rejected(reason);
            let _ = writeln!(out, "nodectl_rejections_total{{reason=\"{label}\"}} {total}");
        }

        out
    }
}

fn gauge(out: &mut String, name: &str, help: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}
