use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Numeric Twitch user id of a farming account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub u64);

/// Numeric Twitch user id of a tracked channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u64);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for AccountId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl FromStr for ChannelId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Twitch serializes ids as strings in most payloads and as numbers in a few.
pub fn deserialize_id<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Num(u64),
        Str(String),
    }

    match Repr::deserialize(deserializer)? {
        Repr::Num(n) => Ok(n),
        Repr::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

pub fn deserialize_channel_id<'de, D>(deserializer: D) -> Result<ChannelId, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_id(deserializer).map(ChannelId)
}

/// Stream status transitions for a user's followed channels.
pub const STREAM_STATUS_TOPIC: &str = "stream-change-v1";

/// Channel points balance and claim notifications for a user.
pub const POINTS_USER_TOPIC: &str = "community-points-user-v1";

/// Event category half of a PubSub topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicKind {
    StreamStatus,
    PointsUser,
    Other(String),
}

impl TopicKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::StreamStatus => STREAM_STATUS_TOPIC,
            Self::PointsUser => POINTS_USER_TOPIC,
            Self::Other(name) => name,
        }
    }

    fn from_name(name: &str) -> Self {
        match name {
            STREAM_STATUS_TOPIC => Self::StreamStatus,
            POINTS_USER_TOPIC => Self::PointsUser,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A PubSub topic: `"<kind>.<account id>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    pub kind: TopicKind,
    pub target: AccountId,
}

impl Topic {
    pub fn new(kind: TopicKind, target: AccountId) -> Self {
        Self { kind, target }
    }

    /// The two topics every farming account listens on.
    pub fn for_account(target: AccountId) -> [Topic; 2] {
        [
            Topic::new(TopicKind::StreamStatus, target),
            Topic::new(TopicKind::PointsUser, target),
        ]
    }

    /// Split on the last `.`; the suffix must be a numeric account id.
    pub fn parse(raw: &str) -> Option<Self> {
        let (kind, target) = raw.rsplit_once('.')?;
        let target = target.parse().ok()?;
        Some(Self::new(TopicKind::from_name(kind), target))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind.as_str(), self.target)
    }
}

/// A live broadcast attached to a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stream {
    /// Broadcast id; tags every minute-watched beacon.
    pub broadcast_id: u64,
    pub title: Option<String>,
    pub viewers: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub category: Option<String>,
}

impl Stream {
    pub fn category_label(&self) -> &str {
        self.category.as_deref().unwrap_or("an unknown category")
    }
}

/// Minimal handle on a channel for API calls: some operations key on the
/// login, others on the id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelRef {
    pub id: ChannelId,
    pub login: String,
}

/// Result of resolving a channel login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMetadata {
    pub id: ChannelId,
    pub login: String,
    pub display_name: String,
    pub stream: Option<Stream>,
}

/// Outcome of one minute-watched batch, emitted as a JSON line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub timestamp: String,
    pub issued: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Totals printed when the farm shuts down.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FarmSummary {
    pub batches: u64,
    pub minutes_watched: u64,
    pub watch_failures: u64,
    pub claims: u64,
    pub claim_failures: u64,
    pub points_earned: u64,
    pub reconnects: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_parse_known_kinds() {
        let topic = Topic::parse("stream-change-v1.55").unwrap();
        assert_eq!(topic.kind, TopicKind::StreamStatus);
        assert_eq!(topic.target, AccountId(55));

        let topic = Topic::parse("community-points-user-v1.1234").unwrap();
        assert_eq!(topic.kind, TopicKind::PointsUser);
        assert_eq!(topic.target, AccountId(1234));
    }

    #[test]
    fn topic_parse_keeps_dotted_kind() {
        let topic = Topic::parse("video-playback.by-id.77").unwrap();
        assert_eq!(topic.kind, TopicKind::Other("video-playback.by-id".to_string()));
        assert_eq!(topic.target, AccountId(77));
    }

    #[test]
    fn topic_parse_rejects_garbage() {
        assert!(Topic::parse("no-target").is_none());
        assert!(Topic::parse("stream-change-v1.abc").is_none());
        assert!(Topic::parse("").is_none());
    }

    #[test]
    fn topic_display_round_trips_wire_name() {
        let [status, points] = Topic::for_account(AccountId(9));
        assert_eq!(status.to_string(), "stream-change-v1.9");
        assert_eq!(points.to_string(), "community-points-user-v1.9");
    }

    #[test]
    fn ids_accept_strings_and_numbers() {
        #[derive(Deserialize)]
        struct Probe {
            #[serde(deserialize_with = "deserialize_channel_id")]
            id: ChannelId,
        }
        let a: Probe = serde_json::from_str(r#"{"id":"900"}"#).unwrap();
        let b: Probe = serde_json::from_str(r#"{"id":900}"#).unwrap();
        assert_eq!(a.id, ChannelId(900));
        assert_eq!(b.id, ChannelId(900));
        assert!(serde_json::from_str::<Probe>(r#"{"id":"x9"}"#).is_err());
    }
}
