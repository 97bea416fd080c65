use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde_json::{Value, json};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::config::HttpConfig;
use crate::cookies::Session;
use crate::types::{ChannelId, ChannelMetadata, ChannelRef, Stream, deserialize_id};
use crate::{GQL_URL, HOMEPAGE_URL, SETTINGS_URL};

/// Persisted query hashes for the web client's GraphQL operations.
const CHANNEL_POINTS_CONTEXT: (&str, &str) = (
    "ChannelPointsContext",
    "9988086babc615a918a1e9a722ff41d98847acac822645209ac7379eecb27152",
);
const CLAIM_COMMUNITY_POINTS: (&str, &str) = (
    "ClaimCommunityPoints",
    "46aaeebe02c99afdf4fc97c7c0cba964124bf6b0af229395f1f6d1feed05b3d0",
);
const CHAT_RESTRICTIONS: (&str, &str) = (
    "ChatRestrictions",
    "c951818670b7beab0f9332303f5a3824316e8d78423e6c6336f4235207b09e54",
);
const FOLLOW_USER: (&str, &str) = (
    "FollowButton_FollowUser",
    "3efee1acda90efdff9fef6e6b4a29213be3ee490781c5b54469717b6131ffdfe",
);

const FIND_CHANNEL_QUERY: &str = "query FindChannel($login: String!) { \
    user(login: $login) { id login displayName \
    stream { id title viewersCount createdAt game { name } } } }";

/// Account-scoped operations against Twitch, used by setup reconciliation,
/// the event dispatcher, and the watch loop.
#[async_trait]
pub trait TwitchApi: Send + Sync {
    /// Look up a channel by login. `Ok(None)` when no such user exists.
    async fn resolve_channel(&self, login: &str) -> Result<Option<ChannelMetadata>>;

    async fn is_following(&self, channel: &ChannelRef) -> Result<bool>;

    async fn follow(&self, channel: &ChannelRef) -> Result<()>;

    /// Id of the bonus-points claim currently waiting on the channel, if any.
    async fn available_claim(&self, channel: &ChannelRef) -> Result<Option<String>>;

    async fn claim_points(&self, channel: &ChannelRef, claim_id: &str) -> Result<()>;

    /// Report one minute of viewership of the given broadcast.
    async fn watch_minute(&self, channel: &ChannelRef, broadcast_id: u64) -> Result<()>;
}

// ── GraphQL response shapes ────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GqlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GqlError>,
}

#[derive(Debug, Deserialize)]
struct GqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct FindChannelData {
    user: Option<UserNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserNode {
    #[serde(deserialize_with = "deserialize_id")]
    id: u64,
    login: String,
    display_name: Option<String>,
    stream: Option<StreamNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamNode {
    #[serde(deserialize_with = "deserialize_id")]
    id: u64,
    title: Option<String>,
    viewers_count: Option<u64>,
    created_at: Option<DateTime<Utc>>,
    game: Option<GameNode>,
}

#[derive(Debug, Deserialize)]
struct GameNode {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ChatRestrictionsData {
    channel: Option<ViewerEdge<FollowerNode>>,
}

#[derive(Debug, Deserialize)]
struct ViewerEdge<T> {
    #[serde(rename = "self")]
    viewer: Option<T>,
}

#[derive(Debug, Deserialize)]
struct FollowerNode {
    follower: Option<IgnoredAny>,
}

#[derive(Debug, Deserialize)]
struct PointsContextData {
    community: Option<CommunityNode>,
}

#[derive(Debug, Deserialize)]
struct CommunityNode {
    channel: Option<ViewerEdge<PointsViewerNode>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PointsViewerNode {
    community_points: Option<CommunityPointsNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommunityPointsNode {
    available_claim: Option<ClaimNode>,
}

#[derive(Debug, Deserialize)]
struct ClaimNode {
    id: String,
}

impl From<UserNode> for ChannelMetadata {
    fn from(user: UserNode) -> Self {
        let display_name = user.display_name.unwrap_or_else(|| user.login.clone());
        ChannelMetadata {
            id: ChannelId(user.id),
            login: user.login,
            display_name,
            stream: user.stream.map(|s| Stream {
                broadcast_id: s.id,
                title: s.title,
                viewers: s.viewers_count.unwrap_or(0),
                started_at: s.created_at,
                category: s.game.map(|g| g.name),
            }),
        }
    }
}

/// Decode a batched GQL reply (`[ {data, errors} ]`) into its first `data`.
fn parse_gql_response<T: DeserializeOwned>(operation: &str, body: &[u8]) -> Result<T> {
    let mut replies: Vec<GqlResponse<T>> = serde_json::from_slice(body)
        .with_context(|| format!("{operation}: malformed GQL response"))?;
    if replies.is_empty() {
        bail!("{operation}: empty GQL response");
    }
    let reply = replies.swap_remove(0);
    if !reply.errors.is_empty() {
        let messages: Vec<&str> = reply.errors.iter().map(|e| e.message.as_str()).collect();
        bail!("{operation}: {}", messages.join("; "));
    }
    reply
        .data
        .ok_or_else(|| anyhow!("{operation}: GQL response has no data"))
}

fn persisted(operation: (&str, &str), variables: Value) -> Value {
    json!({
        "operationName": operation.0,
        "variables": variables,
        "extensions": {
            "persistedQuery": {
                "version": 1,
                "sha256Hash": operation.1,
            }
        }
    })
}

/// Find the web client's Client-ID in the home page markup.
pub fn extract_client_id(html: &str) -> Option<String> {
    [r#""Client-ID":"(.*?)""#, r#"clientId="(.*?)""#]
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .find_map(|re| re.captures(html).map(|c| c[1].to_string()))
        .filter(|id| !id.is_empty())
}

/// Pull `spade_url` out of `settings.js` (`window.__twilightSettings = {...}`).
pub fn parse_spade_url(script: &str) -> Result<String> {
    let start = script
        .find('{')
        .ok_or_else(|| anyhow!("settings script has no JSON object"))?;
    let object = script[start..].trim_end().trim_end_matches(';');
    let settings: Value = serde_json::from_str(object).context("settings script is not JSON")?;
    settings
        .get("spade_url")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("settings script has no spade_url"))
}

/// Base64 body of a minute-watched beacon.
pub fn minute_watched_payload(channel: ChannelId, broadcast_id: u64, user_id: u64) -> String {
    let event = json!([{
        "event": "minute-watched",
        "properties": {
            "channel_id": channel.0,
            "broadcast_id": broadcast_id,
            "user_id": user_id,
            "player": "site",
        }
    }]);
    BASE64.encode(event.to_string())
}

/// GraphQL + Spade client acting as one logged-in account.
pub struct GqlClient {
    http: reqwest::Client,
    session: Session,
    client_id: String,
    spade_url: OnceCell<String>,
}

impl GqlClient {
    /// Build a client for `session`, scraping the Client-ID unless configured.
    pub async fn connect(session: Session, config: &HttpConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout())
            .connect_timeout(config.connect_timeout())
            .build()
            .context("failed to build HTTP client")?;
        let client_id = match &config.client_id {
            Some(id) => id.clone(),
            None => fetch_client_id(&http, &session).await?,
        };
        debug!(account = %session.login, %client_id, "Resolved client id");
        Ok(Self {
            http,
            session,
            client_id,
            spade_url: OnceCell::new(),
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    async fn gql<T: DeserializeOwned>(&self, operation: &str, request: Value) -> Result<T> {
        let mut builder = self
            .http
            .post(GQL_URL)
            .header("Authorization", format!("OAuth {}", self.session.auth_token))
            .header("Client-Id", &self.client_id)
            .json(&json!([request]));
        if let Some(device_id) = &self.session.device_id {
            builder = builder.header("X-Device-Id", device_id);
        }
        let body = builder
            .send()
            .await
            .with_context(|| format!("{operation}: request failed"))?
            .error_for_status()
            .with_context(|| format!("{operation}: bad status"))?
            .bytes()
            .await
            .with_context(|| format!("{operation}: failed to read body"))?;
        debug!(account = %self.session.login, operation, "GQL call completed");
        parse_gql_response(operation, &body)
    }

    async fn spade_url(&self) -> Result<&str> {
        let url = self
            .spade_url
            .get_or_try_init(|| async {
                let script = self
                    .http
                    .get(SETTINGS_URL)
                    .send()
                    .await?
                    .error_for_status()?
                    .text()
                    .await?;
                parse_spade_url(&script)
            })
            .await?;
        Ok(url.as_str())
    }
}

async fn fetch_client_id(http: &reqwest::Client, session: &Session) -> Result<String> {
    let html = http
        .get(HOMEPAGE_URL)
        .header("Cookie", session.cookie_header())
        .send()
        .await
        .context("failed to fetch home page")?
        .error_for_status()?
        .text()
        .await?;
    extract_client_id(&html).ok_or_else(|| anyhow!("no Client-ID found on the home page"))
}

#[async_trait]
impl TwitchApi for GqlClient {
    async fn resolve_channel(&self, login: &str) -> Result<Option<ChannelMetadata>> {
        let request = json!({
            "query": FIND_CHANNEL_QUERY,
            "variables": { "login": login },
        });
        let data: FindChannelData = self.gql("FindChannel", request).await?;
        Ok(data.user.map(ChannelMetadata::from))
    }

    async fn is_following(&self, channel: &ChannelRef) -> Result<bool> {
        let request = persisted(CHAT_RESTRICTIONS, json!({ "channelLogin": channel.login }));
        let data: ChatRestrictionsData = self.gql(CHAT_RESTRICTIONS.0, request).await?;
        Ok(data
            .channel
            .and_then(|c| c.viewer)
            .is_some_and(|v| v.follower.is_some()))
    }

    async fn follow(&self, channel: &ChannelRef) -> Result<()> {
        let request = persisted(
            FOLLOW_USER,
            json!({
                "input": {
                    "disableNotifications": false,
                    "targetID": channel.id.to_string(),
                }
            }),
        );
        let _: IgnoredAny = self.gql(FOLLOW_USER.0, request).await?;
        Ok(())
    }

    async fn available_claim(&self, channel: &ChannelRef) -> Result<Option<String>> {
        let request = persisted(
            CHANNEL_POINTS_CONTEXT,
            json!({ "channelLogin": channel.login }),
        );
        let data: PointsContextData = self.gql(CHANNEL_POINTS_CONTEXT.0, request).await?;
        Ok(data
            .community
            .and_then(|c| c.channel)
            .and_then(|c| c.viewer)
            .and_then(|v| v.community_points)
            .and_then(|p| p.available_claim)
            .map(|claim| claim.id))
    }

    async fn claim_points(&self, channel: &ChannelRef, claim_id: &str) -> Result<()> {
        let request = persisted(
            CLAIM_COMMUNITY_POINTS,
            json!({
                "input": {
                    "channelID": channel.id.to_string(),
                    "claimID": claim_id,
                }
            }),
        );
        let _: IgnoredAny = self.gql(CLAIM_COMMUNITY_POINTS.0, request).await?;
        Ok(())
    }

    async fn watch_minute(&self, channel: &ChannelRef, broadcast_id: u64) -> Result<()> {
        let url = self.spade_url().await?;
        let body = minute_watched_payload(channel.id, broadcast_id, self.session.user_id.0);
        self.http
            .post(url)
            .body(body)
            .send()
            .await
            .context("minute-watched: request failed")?
            .error_for_status()
            .context("minute-watched: bad status")?;
        Ok(())
    }
}
