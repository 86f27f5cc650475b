//! Engine doubles shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use nodectl_engine::{
    EngineError, HandlerConfig, HandlerFactory, HandlerObject, InboundHandler, InboundSession,
    Link, LinkReader, LinkWriter, OutboundHandler, SessionContext, User, UserManager,
};
use parking_lot::Mutex;
use tokio::sync::Notify;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn ip(addr: &str) -> IpAddr {
    addr.parse().unwrap()
}

/// A session accepted on `tag` for `user` from `source`.
pub fn session(tag: &str, user: &str, source: &str) -> SessionContext {
    SessionContext::new(InboundSession::new(tag, ip(source)).with_user(user))
}

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

/// What happened to a link after it was handed to dispatch.
#[derive(Default)]
pub struct LinkRecord {
    pub closes: AtomicUsize,
    pub interrupts: AtomicUsize,
    pub written: Mutex<Vec<usize>>,
}

impl LinkRecord {
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn interrupts(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }

    pub fn written(&self) -> Vec<usize> {
        self.written.lock().clone()
    }
}

struct RecordingReader(Arc<LinkRecord>);

#[async_trait]
impl LinkReader for RecordingReader {
    async fn read_buffer(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn interrupt(&mut self) {
        self.0.interrupts.fetch_add(1, Ordering::SeqCst);
    }
}

struct RecordingWriter(Arc<LinkRecord>);

#[async_trait]
impl LinkWriter for RecordingWriter {
    async fn write_buffer(&mut self, buf: Vec<u8>) -> io::Result<()> {
        self.0.written.lock().push(buf.len());
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        self.0.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn link() -> (Link, Arc<LinkRecord>) {
    let record = Arc::new(LinkRecord::default());
    let link = Link::new(
        Box::new(RecordingReader(Arc::clone(&record))),
        Box::new(RecordingWriter(Arc::clone(&record))),
    );
    (link, record)
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Outbound that records every dispatch and writes a fixed downlink
/// payload. With a hold set, dispatch parks until the hold is notified.
pub struct MockOutbound {
    tag: String,
    writes: Vec<usize>,
    hold: Option<Arc<Notify>>,
    pub entered: Notify,
    pub seen: Mutex<Vec<SessionContext>>,
}

impl MockOutbound {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_owned(),
            writes: Vec::new(),
            hold: None,
            entered: Notify::new(),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn writing(mut self, sizes: &[usize]) -> Self {
        self.writes = sizes.to_vec();
        self
    }

    pub fn holding(mut self, hold: Arc<Notify>) -> Self {
        self.hold = Some(hold);
        self
    }

    pub fn dispatched(&self) -> usize {
        self.seen.lock().len()
    }
}

#[async_trait]
impl OutboundHandler for MockOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn dispatch(&self, ctx: SessionContext, mut link: Link) {
        self.seen.lock().push(ctx);
        self.entered.notify_one();
        if let Some(hold) = &self.hold {
            hold.notified().await;
        }
        for &size in &self.writes {
            link.writer.write_buffer(vec![0; size]).await.unwrap();
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// In-memory user table. Adding `fail_on` is refused by the "engine".
/// With a gate, `add_user` signals the first `Notify` and parks on the
/// second before touching the table.
#[derive(Default)]
pub struct MockUsers {
    users: Mutex<HashSet<String>>,
    fail_on: Option<String>,
    gate: Option<(Arc<Notify>, Arc<Notify>)>,
}

impl MockUsers {
    pub fn contains(&self, email: &str) -> bool {
        self.users.lock().contains(email)
    }
}

#[async_trait]
impl UserManager for MockUsers {
    async fn add_user(&self, user: User) -> Result<(), EngineError> {
        if let Some((entered, release)) = &self.gate {
            entered.notify_one();
            release.notified().await;
        }
        if self.fail_on.as_deref() == Some(user.email.as_str()) {
            return Err(EngineError::Other(format!("account of {} rejected", user.email)));
        }
        if !self.users.lock().insert(user.email.clone()) {
            return Err(EngineError::UserExists(user.email));
        }
        Ok(())
    }

    async fn remove_user(&self, email: &str) -> Result<(), EngineError> {
        if !self.users.lock().remove(email) {
            return Err(EngineError::UserNotFound(email.to_owned()));
        }
        Ok(())
    }
}

pub struct MockInbound {
    tag: String,
    pub users: Option<MockUsers>,
}

impl InboundHandler for MockInbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn user_manager(&self) -> Option<&dyn UserManager> {
        self.users.as_ref().map(|u| u as &dyn UserManager)
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Builds mock handlers by protocol name and keeps them for inspection.
///
/// Inbounds: `vmess` has a user table (settings `{"fail_on": email}`
/// makes that user fail, `{"gated": true}` parks `add_user` on
/// `user_entered`/`user_release`), `dokodemo-door` has none, `freedom`
/// yields an outbound. Outbounds: `freedom` (settings
/// `{"writes": [n, ..]}`), `vmess` yields an inbound. Anything else is an
/// invalid config.
#[derive(Default)]
pub struct MockFactory {
    inbounds: DashMap<String, Arc<MockInbound>>,
    outbounds: DashMap<String, Arc<MockOutbound>>,
    pub user_entered: Arc<Notify>,
    pub user_release: Arc<Notify>,
}

impl MockFactory {
    pub fn inbound(&self, tag: &str) -> Arc<MockInbound> {
        Arc::clone(self.inbounds.get(tag).unwrap().value())
    }

    pub fn outbound(&self, tag: &str) -> Arc<MockOutbound> {
        Arc::clone(self.outbounds.get(tag).unwrap().value())
    }

    fn make_inbound(&self, tag: &str, users: Option<MockUsers>) -> HandlerObject {
        let handler = Arc::new(MockInbound {
            tag: tag.to_owned(),
            users,
        });
        self.inbounds.insert(tag.to_owned(), Arc::clone(&handler));
        HandlerObject::Inbound(handler)
    }

    fn make_outbound(&self, tag: &str, writes: &[usize]) -> HandlerObject {
        let handler = Arc::new(MockOutbound::new(tag).writing(writes));
        self.outbounds.insert(tag.to_owned(), Arc::clone(&handler));
        HandlerObject::Outbound(handler)
    }
}

impl HandlerFactory for MockFactory {
    fn create(&self, config: HandlerConfig<'_>) -> Result<HandlerObject, EngineError> {
        match config {
            HandlerConfig::Inbound(c) => match c.protocol.as_str() {
                "vmess" => {
                    let fail_on = c.settings["fail_on"].as_str().map(str::to_owned);
                    let gate = c.settings["gated"].as_bool().unwrap_or(false).then(|| {
                        (Arc::clone(&self.user_entered), Arc::clone(&self.user_release))
                    });
                    Ok(self.make_inbound(
                        &c.tag,
                        Some(MockUsers {
                            fail_on,
                            gate,
                            ..MockUsers::default()
                        }),
                    ))
                }
                "dokodemo-door" => Ok(self.make_inbound(&c.tag, None)),
                "freedom" => Ok(self.make_outbound(&c.tag, &[])),
                other => Err(EngineError::InvalidConfig(format!("unknown protocol {other}"))),
            },
            HandlerConfig::Outbound(c) => match c.protocol.as_str() {
                "freedom" => {
                    let writes: Vec<usize> = c.settings["writes"]
                        .as_array()
                        .map(|a| a.iter().filter_map(|v| v.as_u64()).map(|v| v as usize).collect())
                        .unwrap_or_default();
                    Ok(self.make_outbound(&c.tag, &writes))
                }
                "vmess" => Ok(self.make_inbound(&c.tag, None)),
                other => Err(EngineError::InvalidConfig(format!("unknown protocol {other}"))),
            },
        }
    }
}
