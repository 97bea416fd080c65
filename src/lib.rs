pub mod api;
pub mod config;
pub mod connection;
pub mod cookies;
pub mod dispatcher;
pub mod pubsub;
pub mod registry;
pub mod reporter;
pub mod scheduler;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

/// Twitch PubSub WebSocket URL (stream status and channel points topics)
pub const PUBSUB_WS_URL: &str = "wss://pubsub-edge.twitch.tv/v1";

/// Twitch GraphQL endpoint used by the web client
pub const GQL_URL: &str = "https://gql.twitch.tv/gql";

/// Twitch home page, scraped for the web client's Client-ID
pub const HOMEPAGE_URL: &str = "https://www.twitch.tv/";

/// Web client settings script; carries the Spade (analytics beacon) URL
pub const SETTINGS_URL: &str = "https://static.twitchcdn.net/config/settings.js";
