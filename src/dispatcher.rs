use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::pubsub::{Inbound, MessageHandler};
use crate::registry::{Account, Channel, Registry};
use crate::reporter::FarmStats;
use crate::types::{AccountId, ChannelId, Topic, TopicKind, deserialize_channel_id};

// ── Payloads ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct StreamChange {
    #[serde(rename = "type")]
    kind: String,
    #[serde(deserialize_with = "deserialize_channel_id")]
    channel_id: ChannelId,
}

#[derive(Debug, Deserialize)]
struct PointsMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct PointsEarned {
    balance: Balance,
    point_gain: PointGain,
}

#[derive(Debug, Deserialize)]
struct Balance {
    #[serde(deserialize_with = "deserialize_channel_id")]
    channel_id: ChannelId,
    balance: i64,
}

#[derive(Debug, Deserialize)]
struct PointGain {
    total_points: i64,
    #[serde(default)]
    reason_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClaimAvailable {
    claim: Claim,
}

#[derive(Debug, Deserialize)]
struct Claim {
    id: String,
    #[serde(deserialize_with = "deserialize_channel_id")]
    channel_id: ChannelId,
}

// ── Classification ─────────────────────────────────────────────────

/// What a message asks the farm to do.
pub enum Decision {
    StreamUp {
        account: Arc<Account>,
        channel: Arc<Channel>,
    },
    StreamDown {
        channel: Arc<Channel>,
    },
    /// Informational; `channel` is `None` for channels we don't track.
    PointsEarned {
        account: Arc<Account>,
        channel_id: ChannelId,
        channel: Option<Arc<Channel>>,
        gained: i64,
        balance: i64,
        reason: Option<String>,
    },
    ClaimAvailable {
        account: Arc<Account>,
        channel: Arc<Channel>,
        claim_id: String,
    },
}

/// Why a message was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Skip {
    /// No topic and no payload: PONG, RESPONSE and friends.
    Keepalive,
    BadTopic(String),
    UnknownAccount(AccountId),
    UnknownChannel(ChannelId),
    Malformed { topic: String, error: String },
    /// A topic or payload type we don't act on.
    Unmodeled(String),
}

pub fn classify(registry: &Registry, message: &Inbound) -> Result<Decision, Skip> {
    let (raw_topic, payload) = match (message.topic(), message.payload()) {
        (None, None) => return Err(Skip::Keepalive),
        (Some(topic), Some(payload)) => (topic, payload),
        (topic, _) => {
            return Err(Skip::Malformed {
                topic: topic.unwrap_or_default().to_string(),
                error: "topic and message must both be present".to_string(),
            });
        }
    };

    let topic = Topic::parse(raw_topic).ok_or_else(|| Skip::BadTopic(raw_topic.to_string()))?;
    let account = registry
        .account(topic.target)
        .ok_or(Skip::UnknownAccount(topic.target))?;
    let malformed = |e: serde_json::Error| Skip::Malformed {
        topic: raw_topic.to_string(),
        error: e.to_string(),
    };

    match topic.kind {
        TopicKind::StreamStatus => {
            let change: StreamChange = serde_json::from_str(payload).map_err(malformed)?;
            let channel = registry
                .channel(change.channel_id)
                .ok_or(Skip::UnknownChannel(change.channel_id))?;
            match change.kind.as_str() {
                "stream_up" => Ok(Decision::StreamUp { account, channel }),
                "stream_down" => Ok(Decision::StreamDown { channel }),
                other => Err(Skip::Unmodeled(other.to_string())),
            }
        }
        TopicKind::PointsUser => {
            let points: PointsMessage = serde_json::from_str(payload).map_err(malformed)?;
            let data = points.data.unwrap_or(Value::Null);
            match points.kind.as_str() {
                "points-earned" => {
                    let earned: PointsEarned = serde_json::from_value(data).map_err(malformed)?;
                    let channel_id = earned.balance.channel_id;
                    Ok(Decision::PointsEarned {
                        account,
                        channel_id,
                        channel: registry.channel(channel_id),
                        gained: earned.point_gain.total_points,
                        balance: earned.balance.balance,
                        reason: earned.point_gain.reason_code,
                    })
                }
                "claim-available" => {
                    let available: ClaimAvailable =
                        serde_json::from_value(data).map_err(malformed)?;
                    let channel = registry
                        .channel(available.claim.channel_id)
                        .ok_or(Skip::UnknownChannel(available.claim.channel_id))?;
                    Ok(Decision::ClaimAvailable {
                        account,
                        channel,
                        claim_id: available.claim.id,
                    })
                }
                other => Err(Skip::Unmodeled(other.to_string())),
            }
        }
        TopicKind::Other(name) => Err(Skip::Unmodeled(name)),
    }
}

// ── Claims ─────────────────────────────────────────────────────────

/// Redeem a bonus chest once. A failed claim is forgotten so a later
/// notification or the next setup pass can retry it.
pub async fn claim_bonus(account: &Account, channel: &Channel, claim_id: &str, stats: &FarmStats) {
    if !account.begin_claim(claim_id) {
        debug!(account = %account.login, channel = %channel.display_name, claim_id, "Claim already handled");
        return;
    }
    match account.api().claim_points(&channel.channel_ref(), claim_id).await {
        Ok(()) => {
            stats.record_claim(true);
            info!(account = %account.login, channel = %channel.display_name, "Claimed bonus points");
        }
        Err(e) => {
            account.forget_claim(claim_id);
            stats.record_claim(false);
            warn!(account = %account.login, channel = %channel.display_name, error = %e, "Failed to claim bonus points");
        }
    }
}

// ── Dispatcher ─────────────────────────────────────────────────────

pub struct EventDispatcher {
    registry: Arc<Registry>,
    stats: Arc<FarmStats>,
    claims: TaskTracker,
}

impl EventDispatcher {
    pub fn new(registry: Arc<Registry>, stats: Arc<FarmStats>) -> Self {
        Self {
            registry,
            stats,
            claims: TaskTracker::new(),
        }
    }

    pub async fn apply(&self, decision: Decision) {
        match decision {
            Decision::StreamUp { account, channel } => {
                self.stream_up(&account, &channel).await;
            }
            Decision::StreamDown { channel } => {
                let mut update = channel.begin_update().await;
                match update.clear() {
                    Some(_) => info!(channel = %channel.display_name, "Stopped streaming"),
                    None => debug!(channel = %channel.display_name, "stream_down for offline channel"),
                }
            }
            Decision::PointsEarned {
                account,
                channel_id,
                channel,
                gained,
                balance,
                reason,
            } => {
                self.stats.record_points(gained);
                let channel_name = channel
                    .map(|c| c.display_name.clone())
                    .unwrap_or_else(|| channel_id.to_string());
                info!(
                    account = %account.login,
                    channel = %channel_name,
                    reason = reason.as_deref().unwrap_or("unknown"),
                    "Gained {gained} points ({balance} total)"
                );
            }
            Decision::ClaimAvailable {
                account,
                channel,
                claim_id,
            } => {
                // Off the receive loop: a slow claim must not stall the feed.
                let stats = self.stats.clone();
                self.claims.spawn(async move {
                    claim_bonus(&account, &channel, &claim_id, &stats).await;
                });
            }
        }
    }

    /// Attach the current broadcast. The update lock is held across the
    /// lookup so a racing stream_down lands after it.
    async fn stream_up(&self, account: &Account, channel: &Channel) {
        let mut update = channel.begin_update().await;
        if update.is_live() {
            debug!(channel = %channel.display_name, "stream_up for channel already live");
            return;
        }
        match account.api().resolve_channel(&channel.login).await {
            Ok(Some(meta)) => match meta.stream {
                Some(stream) => {
                    info!(channel = %channel.display_name, "Started streaming {}", stream.category_label());
                    update.attach(stream);
                }
                None => warn!(channel = %channel.display_name, "stream_up but lookup reports offline"),
            },
            Ok(None) => warn!(channel = %channel.display_name, "Channel no longer resolves"),
            Err(e) => warn!(channel = %channel.display_name, error = %e, "Channel lookup failed"),
        }
    }

    /// Wait for in-flight claims. Called once at shutdown.
    pub async fn drain(&self) {
        self.claims.close();
        self.claims.wait().await;
    }
}

#[async_trait]
impl MessageHandler for EventDispatcher {
    async fn handle(&self, message: Inbound) {
        match classify(&self.registry, &message) {
            Ok(decision) => self.apply(decision).await,
            Err(Skip::Keepalive) => {}
            Err(Skip::Unmodeled(kind)) => trace!(%kind, "Ignoring message"),
            Err(Skip::UnknownAccount(id)) => warn!(account_id = %id, "Event for unknown account"),
            Err(Skip::UnknownChannel(id)) => warn!(channel_id = %id, "Event for untracked channel"),
            Err(Skip::BadTopic(topic)) => warn!(%topic, "Unparseable topic"),
            Err(Skip::Malformed { topic, error }) => warn!(%topic, %error, "Malformed payload"),
        }
    }
}
