//! Outbound interception wrapper.
//!
//! Every outbound the controller installs is wrapped in [`StatsOutbound`].
//! It is the one place all protocols sharing an outbound pass through, so
//! it never looks at the protocol: it only reads the session's inbound
//! tag, user and source address.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use nodectl_engine::{Link, OutboundHandler, SessionContext, SpliceCopy};

use crate::SharedState;
use crate::limiter::Admission;
use crate::metrics::RejectReason;
use crate::rate_limit::RateLimitedWriter;
use crate::rule::Detection;

/// Decorates an outbound with device limiting, speed limiting and
/// destination detection.
pub struct StatsOutbound {
    inner: Arc<dyn OutboundHandler>,
    state: SharedState,
}

struct Identity {
    tag: String,
    email: String,
    source: IpAddr,
}

impl StatsOutbound {
    pub fn new(inner: Arc<dyn OutboundHandler>, state: SharedState) -> Self {
        Self { inner, state }
    }

    /// Extracts who the flow belongs to. Disables splice on every inbound
    /// session so the engine's byte counting stays on the copy path.
    fn identify(&self, ctx: &mut SessionContext) -> Option<Identity> {
        let session = ctx.inbound.as_mut()?;
        if self.state.config().disable_splice {
            session.splice_copy = SpliceCopy::Disabled;
        }
        let email = session.email()?.to_owned();
        Some(Identity {
            tag: session.tag.clone(),
            email,
            source: session.source,
        })
    }
}

#[async_trait]
impl OutboundHandler for StatsOutbound {
    fn tag(&self) -> &str {
        self.inner.tag()
    }

    async fn dispatch(&self, mut ctx: SessionContext, mut link: Link) {
        let metrics = self.state.metrics();
        metrics.record_dispatch();

        let Some(who) = self.identify(&mut ctx) else {
            metrics.record_anonymous();
            self.inner.dispatch(ctx, link).await;
            return;
        };

        if let Some(destination) = ctx.destination.as_deref() {
            let detection = self
                .state
                .rules()
                .detect(&who.tag, destination, &who.email);
            if let Detection::Hit { rule_id } | Detection::HitUnrecorded { rule_id } = detection {
                if matches!(detection, Detection::HitUnrecorded { .. }) {
                    metrics.record_detect_result_dropped();
                }
                tracing::warn!(
                    tag = %who.tag,
                    user = %who.email,
                    destination,
                    rule_id,
                    "destination matched detection rule, closing connection"
                );
                metrics.record_rejection(RejectReason::DetectRule);
                link.abort().await;
                return;
            }
        }

        let _lease = match self
            .state
            .limiter()
            .admit(&who.tag, &who.email, who.source)
        {
            Admission::Reject => {
                tracing::warn!(
                    tag = %who.tag,
                    user = %who.email,
                    source = %who.source,
                    "device limit reached, closing connection"
                );
                metrics.record_rejection(RejectReason::DeviceLimit);
                link.abort().await;
                return;
            }
            Admission::Throttle(lease, buckets) => {
                metrics.record_throttled();
                link.writer = Box::new(RateLimitedWriter::new(link.writer, buckets));
                lease
            }
            Admission::Admit(lease) => lease,
        };

        self.inner.dispatch(ctx, link).await;
    }
}
