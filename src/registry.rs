use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use anyhow::{Result, bail};
use tokio::sync::MutexGuard;

use crate::api::TwitchApi;
use crate::pubsub::FeedHandle;
use crate::types::{AccountId, ChannelId, ChannelMetadata, ChannelRef, Stream};

/// Claim ids remembered per account for de-duplication.
const RECENT_CLAIMS: usize = 64;

/// A logged-in farming account.
pub struct Account {
    pub id: AccountId,
    pub login: String,
    auth_token: String,
    api: Arc<dyn TwitchApi>,
    recent_claims: Mutex<VecDeque<String>>,
    feed: tokio::sync::Mutex<Option<FeedHandle>>,
}

impl Account {
    pub fn new(
        id: AccountId,
        login: impl Into<String>,
        auth_token: impl Into<String>,
        api: Arc<dyn TwitchApi>,
    ) -> Self {
        Self {
            id,
            login: login.into(),
            auth_token: auth_token.into(),
            api,
            recent_claims: Mutex::new(VecDeque::with_capacity(RECENT_CLAIMS)),
            feed: tokio::sync::Mutex::new(None),
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    pub fn api(&self) -> &dyn TwitchApi {
        self.api.as_ref()
    }

    /// Returns false if this claim id is already in flight or done.
    pub fn begin_claim(&self, claim_id: &str) -> bool {
        let mut recent = self
            .recent_claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if recent.iter().any(|id| id == claim_id) {
            return false;
        }
        if recent.len() == RECENT_CLAIMS {
            recent.pop_front();
        }
        recent.push_back(claim_id.to_string());
        true
    }

    /// Drop a claim id so a later notification can retry it.
    pub fn forget_claim(&self, claim_id: &str) {
        self.recent_claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|id| id != claim_id);
    }

    pub async fn attach_feed(&self, handle: FeedHandle) {
        *self.feed.lock().await = Some(handle);
    }

    /// The account's PubSub feed, once started.
    pub async fn feed(&self) -> MutexGuard<'_, Option<FeedHandle>> {
        self.feed.lock().await
    }

    pub async fn take_feed(&self) -> Option<FeedHandle> {
        self.feed.lock().await.take()
    }
}

/// A tracked channel. The live stream is swapped as a whole value so
/// readers never observe a half-updated broadcast.
pub struct Channel {
    pub id: ChannelId,
    pub login: String,
    pub display_name: String,
    stream: RwLock<Option<Arc<Stream>>>,
    updates: tokio::sync::Mutex<()>,
}

impl Channel {
    pub fn from_metadata(meta: ChannelMetadata) -> Self {
        Self {
            id: meta.id,
            login: meta.login,
            display_name: meta.display_name,
            stream: RwLock::new(meta.stream.map(Arc::new)),
            updates: tokio::sync::Mutex::new(()),
        }
    }

    pub fn channel_ref(&self) -> ChannelRef {
        ChannelRef {
            id: self.id,
            login: self.login.clone(),
        }
    }

    /// Snapshot of the current broadcast.
    pub fn stream(&self) -> Option<Arc<Stream>> {
        self.stream
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_live(&self) -> bool {
        self.stream().is_some()
    }

    /// Serialize with other writers of this channel. Held across the
    /// lookup round trip on stream-up.
    pub async fn begin_update(&self) -> ChannelUpdate<'_> {
        ChannelUpdate {
            channel: self,
            _guard: self.updates.lock().await,
        }
    }

    fn swap_stream(&self, stream: Option<Arc<Stream>>) -> Option<Arc<Stream>> {
        let mut slot = self.stream.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, stream)
    }
}

/// Exclusive write access to one channel's stream.
pub struct ChannelUpdate<'a> {
    channel: &'a Channel,
    _guard: MutexGuard<'a, ()>,
}

impl ChannelUpdate<'_> {
    pub fn is_live(&self) -> bool {
        self.channel.is_live()
    }

    pub fn attach(&mut self, stream: Stream) {
        self.channel.swap_stream(Some(Arc::new(stream)));
    }

    /// Returns the stream that was live, if any.
    pub fn clear(&mut self) -> Option<Arc<Stream>> {
        self.channel.swap_stream(None)
    }
}

/// Accounts and channels, addressed by their Twitch ids.
#[derive(Default)]
pub struct Registry {
    accounts: RwLock<Vec<Arc<Account>>>,
    channels: RwLock<Vec<Arc<Channel>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_account(&self, account: Account) -> Result<Arc<Account>> {
        let mut accounts = self.accounts.write().unwrap_or_else(PoisonError::into_inner);
        if accounts.iter().any(|a| a.id == account.id) {
            bail!("account {} ({}) is already registered", account.login, account.id);
        }
        let account = Arc::new(account);
        accounts.push(account.clone());
        Ok(account)
    }

    /// Insert a channel; an id that is already tracked keeps its entry.
    pub fn add_channel(&self, channel: Channel) -> Arc<Channel> {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = channels.iter().find(|c| c.id == channel.id) {
            return existing.clone();
        }
        let channel = Arc::new(channel);
        channels.push(channel.clone());
        channel
    }

    pub fn account(&self, id: AccountId) -> Option<Arc<Account>> {
        self.accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|a| a.id == id)
            .cloned()
    }

    pub fn channel(&self, id: ChannelId) -> Option<Arc<Channel>> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    pub fn accounts(&self) -> Vec<Arc<Account>> {
        self.accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Every (account, channel, stream) triple for channels live right now.
    /// The stream is the snapshot taken here, not re-read later.
    pub fn live_pairs(&self) -> Vec<(Arc<Account>, Arc<Channel>, Arc<Stream>)> {
        let accounts = self.accounts();
        let mut pairs = Vec::new();
        for channel in self.channels() {
            let Some(stream) = channel.stream() else {
                continue;
            };
            for account in &accounts {
                pairs.push((account.clone(), channel.clone(), stream.clone()));
            }
        }
        pairs
    }
}
