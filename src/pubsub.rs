use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::AppConfig;
use crate::connection::{Connection, ConnectionError, Connector, Received};
use crate::types::Topic;

/// LISTEN nonces are correlation tokens only; never verified.
const NONCE_LEN: usize = 30;

// ── Wire protocol ──────────────────────────────────────────────────

/// Client → server control frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum Outbound {
    Ping,
    Listen { nonce: String, data: ListenData },
}

#[derive(Debug, Clone, Serialize)]
pub struct ListenData {
    pub topics: Vec<String>,
    pub auth_token: String,
}

/// Server → client frame. `data.message` is itself JSON text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Inbound {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub data: Option<InboundData>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct InboundData {
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl Inbound {
    pub fn topic(&self) -> Option<&str> {
        self.data.as_ref()?.topic.as_deref()
    }

    pub fn payload(&self) -> Option<&str> {
        self.data.as_ref()?.message.as_deref()
    }
}

pub fn generate_nonce(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub fn ping_frame() -> String {
    // Serializing a unit variant can't fail.
    serde_json::to_string(&Outbound::Ping).unwrap_or_else(|_| r#"{"type":"PING"}"#.to_string())
}

pub fn listen_frame(topic: &Topic, auth_token: &str) -> Result<String> {
    let frame = Outbound::Listen {
        nonce: generate_nonce(NONCE_LEN),
        data: ListenData {
            topics: vec![topic.to_string()],
            auth_token: auth_token.to_string(),
        },
    };
    Ok(serde_json::to_string(&frame)?)
}

// ── Keepalive ──────────────────────────────────────────────────────

/// Tracks ping cadence and outstanding PONGs for one connection.
#[derive(Debug, Clone)]
pub struct KeepaliveTimer {
    interval: Duration,
    pong_timeout: Duration,
    last_ping: Instant,
    awaiting_pong: Option<Instant>,
}

impl KeepaliveTimer {
    pub fn new(interval: Duration, pong_timeout: Duration, now: Instant) -> Self {
        Self {
            interval,
            pong_timeout,
            last_ping: now,
            awaiting_pong: None,
        }
    }

    /// True once `interval` has passed since the previous ping.
    pub fn ping_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_ping) >= self.interval
    }

    pub fn record_ping(&mut self, now: Instant) {
        self.last_ping = now;
        self.awaiting_pong.get_or_insert(now);
    }

    /// Returns whether a ping was outstanding.
    pub fn record_pong(&mut self) -> bool {
        self.awaiting_pong.take().is_some()
    }

    /// An unanswered ping older than `pong_timeout` means the socket is dead.
    pub fn pong_overdue(&self, now: Instant) -> bool {
        self.awaiting_pong
            .is_some_and(|sent| now.saturating_duration_since(sent) >= self.pong_timeout)
    }
}

/// Exponential reconnect backoff with an optional attempt limit.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    /// Consecutive failures tolerated; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Backoff {
    pub fn delay(&self, failures: u32) -> Duration {
        let pow = failures.min(16);
        let ms = self.initial.as_millis().saturating_mul(1u128 << pow);
        let d = Duration::from_millis(ms.min(u64::MAX as u128) as u64);
        d.min(self.max).max(self.initial)
    }

    pub fn exhausted(&self, failures: u32) -> bool {
        self.max_attempts.is_some_and(|limit| failures >= limit)
    }
}

/// Timing knobs for a subscription client.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub receive_timeout: Duration,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub backoff: Backoff,
}

impl FeedSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            receive_timeout: config.feed.receive_timeout(),
            ping_interval: config.feed.ping_interval(),
            pong_timeout: config.feed.pong_timeout(),
            backoff: Backoff {
                initial: config.reconnect.initial_delay(),
                max: config.reconnect.max_delay(),
                max_attempts: config.reconnect.attempt_limit(),
            },
        }
    }
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

// ── Client ─────────────────────────────────────────────────────────

/// Receives every decoded frame, in arrival order.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Inbound);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Disconnected,
    Connecting,
    /// Connected and pinged; waiting for the first PONG.
    Active,
    /// First PONG received on the current connection.
    Ready,
    /// Reconnect attempts exhausted. The task has exited.
    Failed,
}

#[derive(Debug)]
enum Command {
    Listen(Vec<Topic>),
}

/// Everything needed to (re)start a feed for one account.
#[derive(Clone)]
pub struct SubscriptionClient {
    label: String,
    auth_token: String,
    connector: Arc<dyn Connector>,
    handler: Arc<dyn MessageHandler>,
    settings: FeedSettings,
    cancel: CancellationToken,
}

impl SubscriptionClient {
    pub fn new(
        label: impl Into<String>,
        auth_token: impl Into<String>,
        connector: Arc<dyn Connector>,
        handler: Arc<dyn MessageHandler>,
        settings: FeedSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            label: label.into(),
            auth_token: auth_token.into(),
            connector,
            handler,
            settings,
            cancel,
        }
    }

    /// Start the receive loop. `topics` are LISTENed on every connection.
    pub fn spawn(&self, topics: Vec<Topic>) -> FeedHandle {
        self.spawn_with_counter(topics, Arc::new(AtomicU64::new(0)))
    }

    fn spawn_with_counter(&self, topics: Vec<Topic>, reconnects: Arc<AtomicU64>) -> FeedHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(FeedState::Disconnected);
        let worker = Worker {
            client: self.clone(),
            commands: commands_rx,
            state: state_tx,
            topics: topics.clone(),
            reconnects: reconnects.clone(),
        };
        let task = tokio::spawn(worker.run());
        FeedHandle {
            client: self.clone(),
            commands: commands_tx,
            state: state_rx,
            topics,
            reconnects,
            task,
        }
    }
}

/// Owner-side handle on a running subscription client.
pub struct FeedHandle {
    client: SubscriptionClient,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<FeedState>,
    topics: Vec<Topic>,
    reconnects: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl FeedHandle {
    pub fn state(&self) -> FeedState {
        *self.state.borrow()
    }

    /// Number of connections lost and re-established so far.
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Block until the first PONG, a terminal failure, or `timeout`.
    pub async fn wait_ready(&mut self, timeout: Duration) -> Result<()> {
        let waited = tokio::time::timeout(
            timeout,
            self.state
                .wait_for(|s| matches!(s, FeedState::Ready | FeedState::Failed)),
        )
        .await;
        match waited {
            Ok(Ok(state)) if *state == FeedState::Ready => Ok(()),
            Ok(Ok(_)) => bail!("feed gave up reconnecting"),
            Ok(Err(_)) => bail!("feed task exited"),
            Err(_) => bail!("feed not ready after {timeout:?}"),
        }
    }

    /// Subscribe to additional topics; remembered across reconnects.
    pub fn listen(&mut self, topics: &[Topic]) -> Result<()> {
        let fresh: Vec<Topic> = topics
            .iter()
            .filter(|t| !self.topics.contains(t))
            .cloned()
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }
        self.commands
            .send(Command::Listen(fresh.clone()))
            .map_err(|_| anyhow!("feed task exited"))?;
        self.topics.extend(fresh);
        Ok(())
    }

    /// Replace a failed worker with a fresh one carrying the same topics.
    pub fn restart(&mut self) {
        self.task.abort();
        let fresh = self
            .client
            .spawn_with_counter(self.topics.clone(), self.reconnects.clone());
        *self = fresh;
    }

    /// Wait for the worker to exit (after cancellation).
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

enum Step {
    Cancelled,
    Command(Command),
    Received(Received),
}

enum SessionEnd {
    Cancelled,
    Lost { reason: String, was_ready: bool },
}

struct Worker {
    client: SubscriptionClient,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<FeedState>,
    topics: Vec<Topic>,
    reconnects: Arc<AtomicU64>,
}

impl Worker {
    async fn run(mut self) {
        let cancel = self.client.cancel.clone();
        let backoff = self.client.settings.backoff.clone();
        let label = self.client.label.clone();
        let mut failures: u32 = 0;
        let mut first = true;

        loop {
            if !first {
                let delay = backoff.delay(failures);
                debug!(account = %label, ?delay, attempt = failures + 1, "Reconnecting");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            first = false;

            self.state.send_replace(FeedState::Connecting);
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                c = self.client.connector.connect() => c,
            };

            let end = match connected {
                Ok(conn) => self.session(conn).await,
                Err(e) => SessionEnd::Lost {
                    reason: e.to_string(),
                    was_ready: false,
                },
            };

            match end {
                SessionEnd::Cancelled => break,
                SessionEnd::Lost { reason, was_ready } => {
                    self.state.send_replace(FeedState::Disconnected);
                    if was_ready {
                        failures = 0;
                        self.reconnects.fetch_add(1, Ordering::Relaxed);
                        info!(account = %label, %reason, "PubSub connection lost");
                    } else {
                        failures = failures.saturating_add(1);
                        warn!(account = %label, %reason, attempt = failures, "PubSub connection failed");
                    }
                    if backoff.exhausted(failures) {
                        error!(account = %label, attempts = failures, "Giving up on PubSub connection");
                        self.state.send_replace(FeedState::Failed);
                        return;
                    }
                }
            }
        }

        self.state.send_replace(FeedState::Disconnected);
        debug!(account = %label, "PubSub client stopped");
    }

    async fn session(&mut self, mut conn: Box<dyn Connection>) -> SessionEnd {
        let settings = self.client.settings.clone();
        let cancel = self.client.cancel.clone();
        let mut timer =
            KeepaliveTimer::new(settings.ping_interval, settings.pong_timeout, Instant::now());
        let mut was_ready = false;

        let lost = |reason: String, was_ready: bool| SessionEnd::Lost { reason, was_ready };

        if let Err(e) = conn.send(ping_frame()).await {
            return lost(e.to_string(), false);
        }
        timer.record_ping(Instant::now());
        self.state.send_replace(FeedState::Active);

        for topic in self.topics.clone() {
            if let Err(e) = self.send_listen(conn.as_mut(), &topic).await {
                return lost(e.to_string(), false);
            }
        }

        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                Some(cmd) = self.commands.recv() => Step::Command(cmd),
                r = conn.recv_timeout(settings.receive_timeout) => Step::Received(r),
            };

            match step {
                Step::Cancelled => {
                    conn.close().await;
                    return SessionEnd::Cancelled;
                }
                Step::Command(Command::Listen(topics)) => {
                    for topic in topics {
                        if !self.topics.contains(&topic) {
                            self.topics.push(topic.clone());
                        }
                        if let Err(e) = self.send_listen(conn.as_mut(), &topic).await {
                            return lost(e.to_string(), was_ready);
                        }
                    }
                }
                Step::Received(Received::Text(text)) => {
                    trace!(account = %self.client.label, frame = %text, "PubSub frame");
                    match serde_json::from_str::<Inbound>(text.trim()) {
                        Ok(message) => {
                            if let Some(reason) = self.on_message(&message, &mut timer, &mut was_ready) {
                                return lost(reason, was_ready);
                            }
                            self.client.handler.handle(message).await;
                        }
                        Err(e) => {
                            debug!(account = %self.client.label, error = %e, "Dropping undecodable frame");
                        }
                    }
                }
                // Only a quiet socket is judged; a queued frame may be the PONG.
                Step::Received(Received::Timeout) => {
                    if timer.pong_overdue(Instant::now()) {
                        return lost(
                            format!("no PONG within {:?}", settings.pong_timeout),
                            was_ready,
                        );
                    }
                }
                Step::Received(Received::Closed) => {
                    return lost(ConnectionError::Closed.to_string(), was_ready);
                }
            }

            let now = Instant::now();
            if timer.ping_due(now) {
                if let Err(e) = conn.send(ping_frame()).await {
                    return lost(e.to_string(), was_ready);
                }
                timer.record_ping(now);
                trace!(account = %self.client.label, "Keepalive PING sent");
            }
        }
    }

    /// Liveness bookkeeping for control frames. Returns a reason when the
    /// connection must be dropped.
    fn on_message(
        &self,
        message: &Inbound,
        timer: &mut KeepaliveTimer,
        was_ready: &mut bool,
    ) -> Option<String> {
        match message.kind.as_str() {
            "PONG" => {
                timer.record_pong();
                if !*was_ready {
                    *was_ready = true;
                    self.state.send_replace(FeedState::Ready);
                    debug!(account = %self.client.label, "PubSub ready");
                }
                None
            }
            "RECONNECT" => Some("server requested reconnect".to_string()),
            "RESPONSE" => {
                match message.error.as_deref() {
                    Some(err) if !err.is_empty() => warn!(
                        account = %self.client.label,
                        nonce = message.nonce.as_deref().unwrap_or_default(),
                        error = err,
                        "LISTEN rejected"
                    ),
                    _ => trace!(account = %self.client.label, "LISTEN acknowledged"),
                }
                None
            }
            _ => None,
        }
    }

    async fn send_listen(&self, conn: &mut dyn Connection, topic: &Topic) -> Result<()> {
        let frame = listen_frame(topic, &self.client.auth_token)?;
        conn.send(frame).await?;
        debug!(account = %self.client.label, %topic, "LISTEN sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingHandler, ScriptedConnector};
    use crate::types::AccountId;
    use serde_json::Value;

    fn settings() -> FeedSettings {
        FeedSettings {
            receive_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(240),
            pong_timeout: Duration::from_secs(10),
            backoff: Backoff {
                initial: Duration::from_secs(1),
                max: Duration::from_secs(60),
                max_attempts: Some(3),
            },
        }
    }

    fn client(connector: &ScriptedConnector, handler: Arc<dyn MessageHandler>) -> SubscriptionClient {
        SubscriptionClient::new(
            "farmer",
            "tok",
            Arc::new(connector.clone()),
            handler,
            settings(),
            CancellationToken::new(),
        )
    }

    fn frame_types(frames: &[String]) -> Vec<String> {
        frames
            .iter()
            .map(|f| {
                let v: Value = serde_json::from_str(f).unwrap();
                v["type"].as_str().unwrap().to_string()
            })
            .collect()
    }

    fn listened_topics(frames: &[String]) -> Vec<String> {
        frames
            .iter()
            .filter_map(|f| {
                let v: Value = serde_json::from_str(f).unwrap();
                (v["type"] == "LISTEN").then(|| v["data"]["topics"][0].as_str().unwrap().to_string())
            })
            .collect()
    }

    // ── protocol ───────────────────────────────────────────────────

    #[test]
    fn ping_and_listen_frames() {
        assert_eq!(ping_frame(), r#"{"type":"PING"}"#);

        let topic = Topic::parse("stream-change-v1.55").unwrap();
        let frame: Value = serde_json::from_str(&listen_frame(&topic, "tok").unwrap()).unwrap();
        assert_eq!(frame["type"], "LISTEN");
        assert_eq!(frame["data"]["topics"][0], "stream-change-v1.55");
        assert_eq!(frame["data"]["auth_token"], "tok");
        let nonce = frame["nonce"].as_str().unwrap();
        assert_eq!(nonce.len(), NONCE_LEN);
        assert!(nonce.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn nonces_differ() {
        assert_ne!(generate_nonce(30), generate_nonce(30));
    }

    #[test]
    fn inbound_decoding() {
        let pong: Inbound = serde_json::from_str(r#"{"type":"PONG"}"#).unwrap();
        assert_eq!(pong.kind, "PONG");
        assert!(pong.topic().is_none() && pong.payload().is_none());

        let msg: Inbound = serde_json::from_str(
            r#"{"type":"MESSAGE","data":{"topic":"stream-change-v1.55","message":"{\"type\":\"stream_up\"}"}}"#,
        )
        .unwrap();
        assert_eq!(msg.topic(), Some("stream-change-v1.55"));
        assert_eq!(msg.payload(), Some(r#"{"type":"stream_up"}"#));

        let resp: Inbound =
            serde_json::from_str(r#"{"type":"RESPONSE","nonce":"abc","error":"ERR_BADAUTH"}"#).unwrap();
        assert_eq!(resp.error.as_deref(), Some("ERR_BADAUTH"));
    }

    // ── keepalive timer ────────────────────────────────────────────

    #[test]
    fn one_ping_per_interval_across_timeout_cycles() {
        let start = Instant::now();
        let mut timer = KeepaliveTimer::new(Duration::from_secs(240), Duration::from_secs(10), start);
        let mut pings = 0;
        for cycle in 1..=47u64 {
            let now = start + Duration::from_secs(cycle * 10);
            if timer.ping_due(now) {
                pings += 1;
                timer.record_ping(now);
                timer.record_pong();
            }
            if cycle == 24 {
                assert_eq!(pings, 1);
            }
        }
        assert_eq!(pings, 1);
        assert!(timer.ping_due(start + Duration::from_secs(480)));
    }

    #[test]
    fn pong_overdue_only_while_waiting() {
        let start = Instant::now();
        let mut timer = KeepaliveTimer::new(Duration::from_secs(240), Duration::from_secs(10), start);
        assert!(!timer.pong_overdue(start + Duration::from_secs(60)));

        timer.record_ping(start);
        assert!(!timer.pong_overdue(start + Duration::from_secs(9)));
        assert!(timer.pong_overdue(start + Duration::from_secs(10)));
        assert!(timer.record_pong());
        assert!(!timer.pong_overdue(start + Duration::from_secs(30)));
        assert!(!timer.record_pong());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let backoff = Backoff {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(10),
            max_attempts: None,
        };
        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(3), Duration::from_secs(8));
        assert_eq!(backoff.delay(4), Duration::from_secs(10));
        assert_eq!(backoff.delay(40), Duration::from_secs(10));
        assert!(!backoff.exhausted(1_000));

        let limited = Backoff {
            max_attempts: Some(2),
            ..backoff
        };
        assert!(!limited.exhausted(1));
        assert!(limited.exhausted(2));
    }

    // ── client loop ────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn ready_after_first_pong() {
        let connector = ScriptedConnector::new();
        let conn = connector.push_connection(false);
        let handler = Arc::new(RecordingHandler::default());
        let mut feed = client(&connector, handler.clone()).spawn(Vec::new());

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(feed.state(), FeedState::Active);
        assert_eq!(frame_types(&connector.sent(0)), vec!["PING"]);

        conn.push_text(r#"{"type":"PONG"}"#);
        feed.wait_ready(Duration::from_secs(5)).await.unwrap();
        assert_eq!(feed.state(), FeedState::Ready);
        // PONG is still forwarded; the dispatcher drops it.
        assert_eq!(handler.received().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn listen_then_forward_messages_in_order() {
        let connector = ScriptedConnector::new();
        let conn = connector.push_connection(true);
        let handler = Arc::new(RecordingHandler::default());
        let mut feed = client(&connector, handler.clone()).spawn(Vec::new());
        feed.wait_ready(Duration::from_secs(5)).await.unwrap();

        feed.listen(&Topic::for_account(AccountId(55))).unwrap();
        conn.push_text(r#"{"type":"MESSAGE","data":{"topic":"stream-change-v1.55","message":"{}"}}"#);
        conn.push_text(r#"{"type":"MESSAGE","data":{"topic":"community-points-user-v1.55","message":"{}"}}"#);
        conn.push_text("not json");
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(
            listened_topics(&connector.sent(0)),
            vec!["stream-change-v1.55", "community-points-user-v1.55"]
        );
        let topics: Vec<Option<String>> = handler
            .received()
            .iter()
            .map(|m| m.topic().map(str::to_string))
            .collect();
        assert_eq!(
            topics,
            vec![
                None,
                Some("stream-change-v1.55".to_string()),
                Some("community-points-user-v1.55".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_pings_every_interval() {
        let connector = ScriptedConnector::new();
        let _conn = connector.push_connection(true);
        let handler = Arc::new(RecordingHandler::default());
        let mut feed = client(&connector, handler).spawn(Vec::new());
        feed.wait_ready(Duration::from_secs(5)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(235)).await;
        assert_eq!(frame_types(&connector.sent(0)), vec!["PING"]);

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(frame_types(&connector.sent(0)), vec!["PING", "PING"]);

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert_eq!(connector.sent(0).len(), 2);
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_resubscribes_each_topic_once() {
        let connector = ScriptedConnector::new();
        let first = connector.push_connection(true);
        let _second = connector.push_connection(true);
        let handler = Arc::new(RecordingHandler::default());
        let mut feed = client(&connector, handler).spawn(Vec::new());
        feed.wait_ready(Duration::from_secs(5)).await.unwrap();
        feed.listen(&Topic::for_account(AccountId(55))).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        first.close();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(connector.connects(), 2);
        assert_eq!(feed.reconnects(), 1);
        assert_eq!(feed.state(), FeedState::Ready);
        let resent = connector.sent(1);
        assert_eq!(frame_types(&resent), vec!["PING", "LISTEN", "LISTEN"]);
        assert_eq!(
            listened_topics(&resent),
            vec!["stream-change-v1.55", "community-points-user-v1.55"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missing_pong_forces_reconnect() {
        let connector = ScriptedConnector::new();
        let _silent = connector.push_connection(false);
        let _healthy = connector.push_connection(true);
        let handler = Arc::new(RecordingHandler::default());
        let mut feed = client(&connector, handler).spawn(Vec::new());

        feed.wait_ready(Duration::from_secs(60)).await.unwrap();
        assert_eq!(connector.connects(), 2);
        assert_eq!(frame_types(&connector.sent(0)), vec!["PING"]);
        // the silent socket never became ready, so it isn't counted as a reconnect
        assert_eq!(feed.reconnects(), 0);
    }

    /// Takes its time over every event.
    #[derive(Default)]
    struct SlowHandler {
        handled: AtomicU64,
    }

    #[async_trait]
    impl MessageHandler for SlowHandler {
        async fn handle(&self, message: Inbound) {
            if message.kind == "MESSAGE" {
                tokio::time::sleep(Duration::from_secs(20)).await;
                self.handled.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pong_queued_behind_slow_event_keeps_socket() {
        let connector = ScriptedConnector::new();
        let conn = connector.push_connection(false);
        let handler = Arc::new(SlowHandler::default());
        let mut feed = client(&connector, handler.clone()).spawn(Vec::new());
        conn.push_text(r#"{"type":"PONG"}"#);
        feed.wait_ready(Duration::from_secs(5)).await.unwrap();

        // second PING goes out at t=240; its PONG lands right behind an event
        tokio::time::sleep(Duration::from_millis(240_500)).await;
        assert_eq!(frame_types(&connector.sent(0)), vec!["PING", "PING"]);
        conn.push_text(
            r#"{"type":"MESSAGE","data":{"topic":"stream-change-v1.55","message":"{\"type\":\"stream_up\"}"}}"#,
        );
        conn.push_text(r#"{"type":"PONG"}"#);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
        assert_eq!(connector.connects(), 1);
        assert_eq!(feed.reconnects(), 0);
        assert_eq!(feed.state(), FeedState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn server_reconnect_request() {
        let connector = ScriptedConnector::new();
        let first = connector.push_connection(true);
        let _second = connector.push_connection(true);
        let handler = Arc::new(RecordingHandler::default());
        let mut feed = client(&connector, handler).spawn(Vec::new());
        feed.wait_ready(Duration::from_secs(5)).await.unwrap();

        first.push_text(r#"{"type":"RECONNECT"}"#);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(connector.connects(), 2);
        assert_eq!(feed.reconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_attempt_limit_then_restarts() {
        let connector = ScriptedConnector::new();
        let handler = Arc::new(RecordingHandler::default());
        let mut feed = client(&connector, handler)
            .spawn(Topic::for_account(AccountId(7)).to_vec());

        let err = feed.wait_ready(Duration::from_secs(60)).await.unwrap_err();
        assert!(err.to_string().contains("gave up"));
        assert_eq!(feed.state(), FeedState::Failed);
        assert_eq!(connector.connects(), 3);

        let _conn = connector.push_connection(true);
        feed.restart();
        feed.wait_ready(Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            listened_topics(&connector.sent(3)),
            vec!["stream-change-v1.7", "community-points-user-v1.7"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_loop() {
        let connector = ScriptedConnector::new();
        let _conn = connector.push_connection(true);
        let handler = Arc::new(RecordingHandler::default());
        let cancel = CancellationToken::new();
        let mut feed = SubscriptionClient::new(
            "farmer",
            "tok",
            Arc::new(connector.clone()),
            handler,
            settings(),
            cancel.clone(),
        )
        .spawn(Vec::new());
        feed.wait_ready(Duration::from_secs(5)).await.unwrap();

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), feed.join())
            .await
            .unwrap();
    }
}
