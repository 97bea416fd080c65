use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::api::TwitchApi;
use crate::connection::{Connection, ConnectionError, Connector, Received};
use crate::pubsub::{Inbound, MessageHandler};
use crate::types::{ChannelId, ChannelMetadata, ChannelRef, Stream};

// ── Connector ──────────────────────────────────────────────────────

/// Hands out pre-scripted connections in order. Once the script runs out
/// every connect attempt fails.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    inner: Arc<Mutex<ConnectorState>>,
}

#[derive(Default)]
struct ConnectorState {
    scripts: VecDeque<ScriptedConnection>,
    /// One log per connect attempt, failed attempts included.
    sent: Vec<Arc<Mutex<Vec<String>>>>,
}

struct ScriptedConnection {
    inbox: mpsc::UnboundedReceiver<Received>,
    outbox: mpsc::UnboundedSender<Received>,
    auto_pong: bool,
}

/// Test-side control over one scripted connection.
pub struct ConnectionControl {
    tx: mpsc::UnboundedSender<Received>,
}

impl ConnectionControl {
    pub fn push_text(&self, text: &str) {
        let _ = self.tx.send(Received::Text(text.to_string()));
    }

    pub fn close(&self) {
        let _ = self.tx.send(Received::Closed);
    }
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a connection. With `auto_pong` every PING is answered at once.
    pub fn push_connection(&self, auto_pong: bool) -> ConnectionControl {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().unwrap().scripts.push_back(ScriptedConnection {
            inbox: rx,
            outbox: tx.clone(),
            auto_pong,
        });
        ConnectionControl { tx }
    }

    /// Frames sent on the `attempt`-th connect (0-based).
    pub fn sent(&self, attempt: usize) -> Vec<String> {
        let state = self.inner.lock().unwrap();
        state
            .sent
            .get(attempt)
            .map(|log| log.lock().unwrap().clone())
            .unwrap_or_default()
    }

    pub fn connects(&self) -> usize {
        self.inner.lock().unwrap().sent.len()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>, ConnectionError> {
        let mut state = self.inner.lock().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        state.sent.push(log.clone());
        match state.scripts.pop_front() {
            Some(script) => Ok(Box::new(FakeConnection { script, log })),
            None => Err(ConnectionError::Connect {
                url: "scripted".to_string(),
                reason: "no scripted connection left".to_string(),
            }),
        }
    }
}

struct FakeConnection {
    script: ScriptedConnection,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn send(&mut self, payload: String) -> Result<(), ConnectionError> {
        let is_ping = payload.contains(r#""type":"PING""#);
        self.log.lock().unwrap().push(payload);
        if is_ping && self.script.auto_pong {
            let _ = self
                .script
                .outbox
                .send(Received::Text(r#"{"type":"PONG"}"#.to_string()));
        }
        Ok(())
    }

    async fn recv_timeout(&mut self, timeout: Duration) -> Received {
        match tokio::time::timeout(timeout, self.script.inbox.recv()).await {
            Ok(Some(received)) => received,
            Ok(None) => Received::Closed,
            Err(_) => Received::Timeout,
        }
    }

    async fn close(&mut self) {}
}

// ── Handler ────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingHandler {
    messages: Mutex<Vec<Inbound>>,
}

impl RecordingHandler {
    pub fn received(&self) -> Vec<Inbound> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, message: Inbound) {
        self.messages.lock().unwrap().push(message);
    }
}

// ── Twitch API ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    Resolve(String),
    IsFollowing(ChannelId),
    Follow(ChannelId),
    AvailableClaim(ChannelId),
    Claim(ChannelId, String),
    Watch(ChannelId, u64),
}

/// Answers from canned channel data and records every call.
#[derive(Default)]
pub struct FakeApi {
    channels: Mutex<HashMap<String, ChannelMetadata>>,
    following: Mutex<HashSet<ChannelId>>,
    claims: Mutex<HashMap<ChannelId, String>>,
    failing_watches: Mutex<HashSet<ChannelId>>,
    fail_claims: AtomicBool,
    calls: Mutex<Vec<ApiCall>>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel(self, meta: ChannelMetadata) -> Self {
        self.channels.lock().unwrap().insert(meta.login.clone(), meta);
        self
    }

    pub fn set_channel(&self, meta: ChannelMetadata) {
        self.channels.lock().unwrap().insert(meta.login.clone(), meta);
    }

    pub fn set_following(&self, channel: ChannelId) {
        self.following.lock().unwrap().insert(channel);
    }

    pub fn set_claim(&self, channel: ChannelId, claim_id: &str) {
        self.claims.lock().unwrap().insert(channel, claim_id.to_string());
    }

    pub fn fail_watch(&self, channel: ChannelId) {
        self.failing_watches.lock().unwrap().insert(channel);
    }

    pub fn fail_claims(&self, fail: bool) {
        self.fail_claims.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&ApiCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: ApiCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl TwitchApi for FakeApi {
    async fn resolve_channel(&self, login: &str) -> Result<Option<ChannelMetadata>> {
        self.record(ApiCall::Resolve(login.to_string()));
        Ok(self.channels.lock().unwrap().get(login).cloned())
    }

    async fn is_following(&self, channel: &ChannelRef) -> Result<bool> {
        self.record(ApiCall::IsFollowing(channel.id));
        Ok(self.following.lock().unwrap().contains(&channel.id))
    }

    async fn follow(&self, channel: &ChannelRef) -> Result<()> {
        self.record(ApiCall::Follow(channel.id));
        self.following.lock().unwrap().insert(channel.id);
        Ok(())
    }

    async fn available_claim(&self, channel: &ChannelRef) -> Result<Option<String>> {
        self.record(ApiCall::AvailableClaim(channel.id));
        Ok(self.claims.lock().unwrap().get(&channel.id).cloned())
    }

    async fn claim_points(&self, channel: &ChannelRef, claim_id: &str) -> Result<()> {
        self.record(ApiCall::Claim(channel.id, claim_id.to_string()));
        if self.fail_claims.load(Ordering::SeqCst) {
            bail!("claim rejected");
        }
        self.claims.lock().unwrap().remove(&channel.id);
        Ok(())
    }

    async fn watch_minute(&self, channel: &ChannelRef, broadcast_id: u64) -> Result<()> {
        self.record(ApiCall::Watch(channel.id, broadcast_id));
        if self.failing_watches.lock().unwrap().contains(&channel.id) {
            bail!("beacon rejected");
        }
        Ok(())
    }
}

/// A live stream with the given broadcast id and a fixed category.
pub fn live_stream(broadcast_id: u64) -> Stream {
    Stream {
        broadcast_id,
        title: Some("speedruns".to_string()),
        viewers: 120,
        started_at: None,
        category: Some("Celeste".to_string()),
    }
}

pub fn channel_meta(id: u64, login: &str, stream: Option<Stream>) -> ChannelMetadata {
    ChannelMetadata {
        id: ChannelId(id),
        login: login.to_string(),
        display_name: login.to_uppercase(),
        stream,
    }
}
