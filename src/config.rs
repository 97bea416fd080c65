use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::PUBSUB_WS_URL;

/// Default config file path.
pub const CONFIG_PATH: &str = "config.toml";

/// Top-level application config deserialized from `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Channel logins to farm. Merged with `--channels`.
    #[serde(default)]
    pub channels: Vec<String>,
    /// Cookie files or directories of cookie files, one account per file.
    #[serde(default)]
    pub cookies: Vec<PathBuf>,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

/// PubSub connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_feed_url")]
    pub url: String,
    /// Receive poll granularity; each timeout is a keepalive check.
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout_secs: u64,
    /// Idle time between keepalive pings.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// How long a ping may go unanswered before the socket is considered dead.
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,
    /// Upper bound on waiting for a fresh client to become ready during setup.
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
}

/// Reconnect backoff policy for the PubSub client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
    /// Consecutive failed attempts before giving up; 0 retries forever.
    #[serde(default)]
    pub max_attempts: u32,
}

/// Watch loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_watch_interval")]
    pub interval_secs: u64,
}

/// HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Fixed Client-ID. When absent it is scraped from the home page per account.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Upper bound on a whole request, body included.
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_feed_url() -> String {
    PUBSUB_WS_URL.to_string()
}

fn default_receive_timeout() -> u64 {
    10
}

fn default_ping_interval() -> u64 {
    4 * 60
}

fn default_pong_timeout() -> u64 {
    10
}

fn default_ready_timeout() -> u64 {
    30
}

fn default_initial_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    60
}

fn default_watch_interval() -> u64 {
    60
}

fn default_http_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0".to_string()
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: default_feed_url(),
            receive_timeout_secs: default_receive_timeout(),
            ping_interval_secs: default_ping_interval(),
            pong_timeout_secs: default_pong_timeout(),
            ready_timeout_secs: default_ready_timeout(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_secs: default_max_delay(),
            max_attempts: 0,
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_watch_interval(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            client_id: None,
            timeout_secs: default_http_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl FeedConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

impl ReconnectConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }

    /// `None` means retry forever.
    pub fn attempt_limit(&self) -> Option<u32> {
        (self.max_attempts > 0).then_some(self.max_attempts)
    }
}

impl WatchConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl AppConfig {
    /// Load config from the given TOML file path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Load config if the file exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write config to the given TOML file path.
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Reject settings the loops cannot run with.
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.feed.url)
            .with_context(|| format!("invalid feed url {}", self.feed.url))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            bail!("feed url must use ws:// or wss://, got {}", url.scheme());
        }
        if self.feed.receive_timeout_secs == 0 {
            bail!("feed.receive_timeout_secs must be positive");
        }
        if self.feed.ping_interval_secs == 0 {
            bail!("feed.ping_interval_secs must be positive");
        }
        if self.feed.pong_timeout_secs == 0 {
            bail!("feed.pong_timeout_secs must be positive");
        }
        if self.feed.ready_timeout_secs == 0 {
            bail!("feed.ready_timeout_secs must be positive");
        }
        if self.watch.interval_secs == 0 {
            bail!("watch.interval_secs must be positive");
        }
        if self.http.timeout_secs == 0 {
            bail!("http.timeout_secs must be positive");
        }
        if self.http.connect_timeout_secs == 0 {
            bail!("http.connect_timeout_secs must be positive");
        }
        if self.reconnect.initial_delay_ms == 0 {
            bail!("reconnect.initial_delay_ms must be positive");
        }
        if self.reconnect.max_delay() < self.reconnect.initial_delay() {
            bail!("reconnect.max_delay_secs must not be below reconnect.initial_delay_ms");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert!(config.channels.is_empty());
        assert_eq!(config.feed.url, PUBSUB_WS_URL);
        assert_eq!(config.feed.receive_timeout(), Duration::from_secs(10));
        assert_eq!(config.feed.ping_interval(), Duration::from_secs(240));
        assert_eq!(config.watch.interval(), Duration::from_secs(60));
        assert_eq!(config.reconnect.attempt_limit(), None);
        assert!(config.http.client_id.is_none());
        assert_eq!(config.http.timeout(), Duration::from_secs(30));
        assert_eq!(config.http.connect_timeout(), Duration::from_secs(10));
        config.validate().unwrap();
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            channels = ["alpha", "beta"]
            cookies = ["cookies"]

            [reconnect]
            max_attempts = 5

            [watch]
            interval_secs = 30

            [http]
            timeout_secs = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.channels, vec!["alpha", "beta"]);
        assert_eq!(config.cookies, vec![PathBuf::from("cookies")]);
        assert_eq!(config.reconnect.attempt_limit(), Some(5));
        assert_eq!(config.reconnect.initial_delay(), Duration::from_millis(1000));
        assert_eq!(config.watch.interval(), Duration::from_secs(30));
        assert_eq!(config.feed.pong_timeout(), Duration::from_secs(10));
        assert_eq!(config.http.timeout(), Duration::from_secs(5));
        assert_eq!(config.http.connect_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.feed.url = "https://example.com".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.watch.interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.reconnect.max_delay_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.http.timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = AppConfig::default();
        config.channels.push("gamma".to_string());
        config.http.client_id = Some("abc".to_string());
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.channels, vec!["gamma"]);
        assert_eq!(loaded.http.client_id.as_deref(), Some("abc"));
    }

    #[test]
    fn missing_default_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert!(config.cookies.is_empty());
        assert!(AppConfig::load(&dir.path().join("absent.toml")).is_err());
    }
}
