//! Tracked feeds and their delivery targets.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use regex::Regex;
use tokio::time::Instant;
use tracing::info;

use crate::error::{PlatformError, TrackError};
use crate::ledger::NotificationLedger;
use crate::model::{Feed, NewTarget, Platform, Target};
use crate::platforms::AccountLookup;
use crate::store::{FeatureStore, TrackerStore};

/// Item ids recently notified for one feed, bounded by age and count.
#[derive(Debug, Default)]
struct SeenItems {
    order: VecDeque<(String, Instant)>,
    ids: HashSet<String>,
}

impl SeenItems {
    fn insert(&mut self, item: &str, capacity: usize) {
        if !self.ids.insert(item.to_string()) {
            return;
        }
        self.order.push_back((item.to_string(), Instant::now()));
        while self.order.len() > capacity {
            if let Some((old, _)) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
    }

    fn evict_older_than(&mut self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut evicted = 0;
        while let Some((_, seen_at)) = self.order.front() {
            if now.duration_since(*seen_at) < ttl {
                break;
            }
            if let Some((old, _)) = self.order.pop_front() {
                self.ids.remove(&old);
                evicted += 1;
            }
        }
        evicted
    }
}

pub struct TrackRequest {
    pub platform: Platform,
    pub identifier: String,
    pub channel_id: u64,
    pub guild_id: Option<u64>,
    pub tracked_by: u64,
}

pub struct FeedRegistry {
    store: Arc<dyn TrackerStore>,
    features: Arc<dyn FeatureStore>,
    seen: Mutex<HashMap<i64, SeenItems>>,
    seen_ttl: Duration,
    seen_capacity: usize,
}

fn identifier_pattern(platform: Platform) -> &'static Regex {
    static TWITCH: OnceLock<Regex> = OnceLock::new();
    static TWITTER: OnceLock<Regex> = OnceLock::new();
    match platform {
        Platform::Twitch => TWITCH.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]{1,25}$").unwrap()),
        Platform::Twitter => TWITTER.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]{1,15}$").unwrap()),
    }
}

/// Strips a leading `@` or profile URL and checks the remaining handle.
pub fn normalize_identifier(platform: Platform, raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    let handle = trimmed
        .rsplit('/')
        .next()
        .unwrap_or(trimmed)
        .trim_start_matches('@');

    identifier_pattern(platform)
        .is_match(handle)
        .then(|| handle.to_string())
}

impl FeedRegistry {
    pub fn new(
        store: Arc<dyn TrackerStore>,
        features: Arc<dyn FeatureStore>,
        seen_ttl: Duration,
        seen_capacity: usize,
    ) -> Self {
        Self {
            store,
            features,
            seen: Mutex::new(HashMap::new()),
            seen_ttl,
            seen_capacity,
        }
    }

    pub async fn feeds(&self, platform: Platform) -> Result<Vec<Feed>> {
        self.store.feeds_for_platform(platform).await
    }

    /// Opens the unit of work for one feed's processing task.
    pub fn scope(&self, feed: Feed) -> FeedScope {
        FeedScope {
            feed,
            store: self.store.clone(),
            features: self.features.clone(),
        }
    }

    pub async fn untrack_feed(&self, feed: &Feed) -> Result<()> {
        self.store.delete_feed(feed.id).await?;
        self.seen.lock().remove(&feed.id);
        Ok(())
    }

    pub fn is_seen(&self, feed_id: i64, item: &str) -> bool {
        self.seen
            .lock()
            .get(&feed_id)
            .is_some_and(|items| items.ids.contains(item))
    }

    pub fn mark_seen(&self, feed_id: i64, item: &str) {
        self.seen
            .lock()
            .entry(feed_id)
            .or_default()
            .insert(item, self.seen_capacity);
    }

    /// Drops seen entries older than the TTL; returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let mut seen = self.seen.lock();
        let evicted = seen
            .values_mut()
            .map(|items| items.evict_older_than(self.seen_ttl))
            .sum();
        seen.retain(|_, items| !items.order.is_empty());
        evicted
    }

    pub async fn track(
        &self,
        lookup: &dyn AccountLookup,
        request: TrackRequest,
    ) -> Result<(Feed, Target), TrackError> {
        let handle = normalize_identifier(request.platform, &request.identifier)
            .ok_or_else(|| TrackError::InvalidIdentifier(request.identifier.clone()))?;

        let account = match lookup.lookup_account(&handle).await {
            Ok(account) => account,
            Err(PlatformError::NotFound) => return Err(TrackError::UnknownAccount(handle)),
            Err(e) => return Err(TrackError::Platform(e)),
        };

        let feed = match self
            .store
            .find_feed(request.platform, &account.external_id)
            .await?
        {
            Some(feed) => feed,
            None => {
                self.store
                    .create_feed(
                        request.platform,
                        &account.external_id,
                        Some(&account.display_name),
                    )
                    .await?
            }
        };

        if self
            .store
            .find_target(feed.id, request.channel_id)
            .await?
            .is_some()
        {
            return Err(TrackError::AlreadyTracked(account.display_name));
        }

        let target = self
            .store
            .create_target(NewTarget {
                feed_id: feed.id,
                channel_id: request.channel_id,
                guild_id: request.guild_id,
                tracked_by: request.tracked_by,
            })
            .await?;

        info!(
            "[TRACKER] {} feed '{}' now tracked in channel {} by {}",
            request.platform.as_str(),
            account.display_name,
            request.channel_id,
            request.tracked_by
        );
        Ok((feed, target))
    }

    /// Removes one channel's subscription; the feed goes with its last target.
    pub async fn untrack(
        &self,
        lookup: &dyn AccountLookup,
        platform: Platform,
        identifier: &str,
        channel_id: u64,
    ) -> Result<(), TrackError> {
        let handle = normalize_identifier(platform, identifier)
            .ok_or_else(|| TrackError::InvalidIdentifier(identifier.to_string()))?;

        let account = match lookup.lookup_account(&handle).await {
            Ok(account) => account,
            Err(PlatformError::NotFound) => return Err(TrackError::UnknownAccount(handle)),
            Err(e) => return Err(TrackError::Platform(e)),
        };

        let feed = self
            .store
            .find_feed(platform, &account.external_id)
            .await?
            .ok_or_else(|| TrackError::NotTracked(account.display_name.clone()))?;
        let target = self
            .store
            .find_target(feed.id, channel_id)
            .await?
            .ok_or_else(|| TrackError::NotTracked(account.display_name.clone()))?;

        self.store.delete_target(target.id).await?;
        if self.store.targets_for_feed(feed.id).await?.is_empty() {
            self.untrack_feed(&feed).await?;
            info!(
                "[TRACKER] {} feed '{}' untracked, no channels left",
                platform.as_str(),
                account.display_name
            );
        }
        Ok(())
    }
}

/// Unit of work for one feed inside a pass.
///
/// Every read and write a feed task performs goes through its scope, so the
/// rows touched by concurrent tasks never overlap.
pub struct FeedScope {
    pub feed: Feed,
    store: Arc<dyn TrackerStore>,
    features: Arc<dyn FeatureStore>,
}

impl FeedScope {
    pub fn store(&self) -> &dyn TrackerStore {
        self.store.as_ref()
    }

    pub fn features(&self) -> &dyn FeatureStore {
        self.features.as_ref()
    }

    /// Owned store handle for work that must outlive the feed task.
    pub(crate) fn store_handle(&self) -> Arc<dyn TrackerStore> {
        self.store.clone()
    }

    pub fn ledger(&self) -> NotificationLedger<'_> {
        NotificationLedger::new(self)
    }

    pub async fn targets(&self) -> Result<Vec<Target>> {
        self.store.targets_for_feed(self.feed.id).await
    }

    pub async fn delete_target(&self, target: &Target) -> Result<()> {
        self.store.delete_target(target.id).await
    }

    pub async fn set_cursor(&mut self, cursor: &str) -> Result<()> {
        self.store.set_feed_cursor(self.feed.id, cursor).await?;
        self.feed.last_cursor = Some(cursor.to_string());
        Ok(())
    }

    /// Writes back an upstream display-name change.
    pub async fn refresh_name(&mut self, name: &str) -> Result<()> {
        if self.feed.display_name.as_deref() != Some(name) {
            self.store.set_feed_name(self.feed.id, name).await?;
            self.feed.display_name = Some(name.to_string());
        }
        Ok(())
    }
}
