use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{GqlClient, TwitchApi};
use crate::config::{AppConfig, HttpConfig};
use crate::connection::Connector;
use crate::cookies::Session;
use crate::dispatcher::{EventDispatcher, claim_bonus};
use crate::pubsub::{FeedSettings, FeedState, SubscriptionClient};
use crate::registry::{Account, Channel, Registry};
use crate::reporter::{self, FarmStats};
use crate::types::{AccountId, BatchReport, FarmSummary, Topic};

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("no accounts configured")]
    NoAccounts,
    #[error("failed to load account {source_label}: {reason}")]
    Identity { source_label: String, reason: String },
    #[error("PubSub for {login} never became ready: {reason}")]
    FeedNotReady { login: String, reason: String },
    #[error("failed to subscribe {login}: {reason}")]
    Subscribe { login: String, reason: String },
    #[error("none of the configured channels could be resolved")]
    NoChannels,
}

/// An account whose identity is known and whose API client is ready.
pub struct ResolvedAccount {
    pub id: AccountId,
    pub login: String,
    pub auth_token: String,
    pub api: Arc<dyn TwitchApi>,
}

/// Where an account's identity comes from.
#[async_trait]
pub trait AccountSource: Send + Sync {
    fn label(&self) -> String;
    async fn resolve(&self) -> Result<ResolvedAccount>;
}

/// An exported browser cookie jar.
pub struct CookieAccount {
    pub path: PathBuf,
    pub http: HttpConfig,
}

#[async_trait]
impl AccountSource for CookieAccount {
    fn label(&self) -> String {
        self.path.display().to_string()
    }

    async fn resolve(&self) -> Result<ResolvedAccount> {
        let session = Session::load(&self.path)?;
        let client = GqlClient::connect(session, &self.http).await?;
        let (id, login, auth_token) = {
            let session = client.session();
            (session.user_id, session.login.clone(), session.auth_token.clone())
        };
        Ok(ResolvedAccount {
            id,
            login,
            auth_token,
            api: Arc::new(client),
        })
    }
}

#[derive(Debug, Clone)]
pub struct FarmSettings {
    pub feed: FeedSettings,
    pub ready_timeout: Duration,
    pub watch_interval: Duration,
}

impl FarmSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            feed: FeedSettings::from_config(config),
            ready_timeout: config.feed.ready_timeout(),
            watch_interval: config.watch.interval(),
        }
    }
}

pub struct Farm {
    settings: FarmSettings,
    registry: Arc<Registry>,
    dispatcher: Arc<EventDispatcher>,
    stats: Arc<FarmStats>,
    connector: Arc<dyn Connector>,
    cancel: CancellationToken,
}

impl Farm {
    pub fn new(settings: FarmSettings, connector: Arc<dyn Connector>, cancel: CancellationToken) -> Self {
        let registry = Arc::new(Registry::new());
        let stats = Arc::new(FarmStats::default());
        let dispatcher = Arc::new(EventDispatcher::new(registry.clone(), stats.clone()));
        Self {
            settings,
            registry,
            dispatcher,
            stats,
            connector,
            cancel,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Set up, then farm until cancelled. Returns early only on a setup error.
    pub async fn run(&self, sources: &[Box<dyn AccountSource>], channels: &[String]) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => {
                info!("Cancelled during setup");
                return Ok(());
            }
            setup = self.setup(sources, channels) => setup?,
        }
        self.watch_loop().await;
        Ok(())
    }

    /// Register accounts with live feeds, resolve channels, then follow and
    /// claim what's pending.
    pub async fn setup(&self, sources: &[Box<dyn AccountSource>], channels: &[String]) -> Result<(), SetupError> {
        if sources.is_empty() {
            return Err(SetupError::NoAccounts);
        }

        for source in sources {
            self.add_account(source.as_ref()).await?;
        }

        self.resolve_channels(channels).await?;
        self.reconcile().await;
        Ok(())
    }

    async fn add_account(&self, source: &dyn AccountSource) -> Result<(), SetupError> {
        let identity = |e: anyhow::Error| SetupError::Identity {
            source_label: source.label(),
            reason: format!("{e:#}"),
        };
        let resolved = source.resolve().await.map_err(identity)?;
        let account = self
            .registry
            .add_account(Account::new(
                resolved.id,
                resolved.login,
                resolved.auth_token,
                resolved.api,
            ))
            .map_err(identity)?;
        info!(account = %account.login, id = %account.id, "Account loaded");

        let client = SubscriptionClient::new(
            account.login.clone(),
            account.auth_token(),
            self.connector.clone(),
            self.dispatcher.clone(),
            self.settings.feed.clone(),
            self.cancel.clone(),
        );
        let mut feed = client.spawn(Vec::new());
        feed.wait_ready(self.settings.ready_timeout)
            .await
            .map_err(|e| SetupError::FeedNotReady {
                login: account.login.clone(),
                reason: format!("{e:#}"),
            })?;
        feed.listen(&Topic::for_account(account.id))
            .map_err(|e| SetupError::Subscribe {
                login: account.login.clone(),
                reason: format!("{e:#}"),
            })?;
        debug!(account = %account.login, "Subscribed to stream and points topics");
        account.attach_feed(feed).await;
        Ok(())
    }

    /// Look each login up through the first account that answers.
    async fn resolve_channels(&self, logins: &[String]) -> Result<(), SetupError> {
        let accounts = self.registry.accounts();
        for login in logins {
            let login = login.trim().to_lowercase();
            if login.is_empty() {
                continue;
            }
            let mut resolved = None;
            for account in &accounts {
                match account.api().resolve_channel(&login).await {
                    Ok(meta) => {
                        resolved = meta;
                        break;
                    }
                    Err(e) => warn!(account = %account.login, channel = %login, error = %e, "Channel lookup failed"),
                }
            }
            match resolved {
                Some(meta) => {
                    let channel = self.registry.add_channel(Channel::from_metadata(meta));
                    match channel.stream() {
                        Some(stream) => info!(
                            channel = %channel.display_name,
                            "Tracking channel, live in {}", stream.category_label()
                        ),
                        None => info!(channel = %channel.display_name, "Tracking channel, offline"),
                    }
                }
                None => warn!(channel = %login, "Channel not found; skipping"),
            }
        }
        if self.registry.channels().is_empty() {
            return Err(SetupError::NoChannels);
        }
        Ok(())
    }

    /// Follow every tracked channel from every account and collect any
    /// bonus chest that was already waiting.
    async fn reconcile(&self) {
        for account in self.registry.accounts() {
            for channel in self.registry.channels() {
                let target = channel.channel_ref();
                match account.api().is_following(&target).await {
                    Ok(true) => {}
                    Ok(false) => match account.api().follow(&target).await {
                        Ok(()) => info!(account = %account.login, channel = %channel.display_name, "Followed channel"),
                        Err(e) => warn!(account = %account.login, channel = %channel.display_name, error = %e, "Failed to follow"),
                    },
                    Err(e) => warn!(account = %account.login, channel = %channel.display_name, error = %e, "Failed to check follow"),
                }
                match account.api().available_claim(&target).await {
                    Ok(Some(claim_id)) => claim_bonus(&account, &channel, &claim_id, &self.stats).await,
                    Ok(None) => {}
                    Err(e) => warn!(account = %account.login, channel = %channel.display_name, error = %e, "Failed to check for bonus"),
                }
            }
        }
    }

    async fn watch_loop(&self) {
        let interval = self.settings.watch_interval;
        info!(?interval, "Watching");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            self.supervise_feeds().await;
            let report = self.watch_batch().await;
            reporter::report_batch(&report);
        }
    }

    /// Restart any feed that gave up reconnecting.
    pub async fn supervise_feeds(&self) {
        for account in self.registry.accounts() {
            let mut feed = account.feed().await;
            if let Some(handle) = feed.as_mut()
                && handle.state() == FeedState::Failed
            {
                error!(account = %account.login, "PubSub gave up; restarting");
                handle.restart();
            }
        }
    }

    /// One minute-watched beacon per live (account, channel) pair, sent
    /// concurrently. Always runs to completion.
    pub async fn watch_batch(&self) -> BatchReport {
        let pairs = self.registry.live_pairs();
        let beacons = pairs.iter().map(|(account, channel, stream)| async move {
            match account
                .api()
                .watch_minute(&channel.channel_ref(), stream.broadcast_id)
                .await
            {
                Ok(()) => {
                    debug!(account = %account.login, channel = %channel.display_name, "Watched one minute");
                    true
                }
                Err(e) => {
                    warn!(account = %account.login, channel = %channel.display_name, error = %e, "Minute-watched beacon failed");
                    false
                }
            }
        });
        let outcomes = join_all(beacons).await;
        let succeeded = outcomes.iter().filter(|ok| **ok).count();
        let report = BatchReport {
            timestamp: chrono::Utc::now().to_rfc3339(),
            issued: outcomes.len(),
            succeeded,
            failed: outcomes.len() - succeeded,
        };
        self.stats.record_batch(&report);
        report
    }

    /// Stop feeds, wait for in-flight claims, and total up.
    pub async fn shutdown(&self) -> FarmSummary {
        self.cancel.cancel();
        let mut reconnects = 0;
        for account in self.registry.accounts() {
            if let Some(feed) = account.take_feed().await {
                reconnects += feed.reconnects();
                feed.join().await;
            }
        }
        self.dispatcher.drain().await;
        self.stats.summary(reconnects)
    }
}
