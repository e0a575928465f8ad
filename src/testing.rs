//! In-memory fakes for the store, Discord and platform seams.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::delivery::{ChannelInfo, ChatDelivery, OutgoingMessage};
use crate::error::{DeliveryError, PlatformError};
use crate::model::{
    ChannelFeatures, Feed, LiveSession, MentionConfig, MessageRef, NewTarget, NotificationRecord,
    Platform, Target,
};
use crate::platforms::twitch::{StreamBatch, TwitchApi, TwitchStream, TwitchUser};
use crate::platforms::twitter::{Timeline, TimelineQuery, TwitterApi};
use crate::platforms::{AccountInfo, AccountLookup, CallSpacer};
use crate::store::{FeatureStore, TrackerStore};

#[derive(Default)]
struct Tables {
    next_id: i64,
    feeds: Vec<Feed>,
    targets: Vec<Target>,
    mentions: Vec<MentionConfig>,
    notifications: Vec<NotificationRecord>,
    sessions: HashMap<i64, LiveSession>,
    features: HashMap<(u64, u64), ChannelFeatures>,
    unwritable_feeds: HashSet<i64>,
}

impl Tables {
    fn id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn drop_target_rows(&mut self, target_id: i64) {
        self.mentions.retain(|m| m.target_id != target_id);
        self.notifications.retain(|n| n.target_id != target_id);
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn add_feed(&self, platform: Platform, external_id: &str) -> Feed {
        let mut t = self.tables.lock();
        let feed = Feed {
            id: t.id(),
            platform,
            external_id: external_id.to_string(),
            display_name: None,
            last_cursor: None,
        };
        t.feeds.push(feed.clone());
        feed
    }

    pub fn add_target(&self, feed_id: i64, channel_id: u64, guild_id: Option<u64>) -> Target {
        let mut t = self.tables.lock();
        let target = Target {
            id: t.id(),
            feed_id,
            channel_id,
            guild_id,
            tracked_by: 1,
        };
        t.targets.push(target.clone());
        target
    }

    pub fn add_mention(
        &self,
        target_id: i64,
        role_id: Option<u64>,
        text: Option<&str>,
        last_mention: Option<DateTime<Utc>>,
    ) -> MentionConfig {
        let mut t = self.tables.lock();
        let config = MentionConfig {
            id: t.id(),
            target_id,
            role_id,
            text: text.map(str::to_string),
            embed_color: None,
            last_mention,
        };
        t.mentions.push(config.clone());
        config
    }

    pub fn set_features(&self, guild_id: u64, channel_id: u64, features: ChannelFeatures) {
        self.tables
            .lock()
            .features
            .insert((guild_id, channel_id), features);
    }

    pub fn feed(&self, feed_id: i64) -> Option<Feed> {
        self.tables
            .lock()
            .feeds
            .iter()
            .find(|f| f.id == feed_id)
            .cloned()
    }

    /// Deleting the feed or moving its cursor fails from now on.
    pub fn lock_feed_writes(&self, feed_id: i64) {
        self.tables.lock().unwritable_feeds.insert(feed_id);
    }

    pub fn backdate_notifications(&self, by: chrono::Duration) {
        for n in self.tables.lock().notifications.iter_mut() {
            n.created_at = n.created_at - by;
        }
    }
}

#[async_trait]
impl TrackerStore for MemoryStore {
    async fn feeds_for_platform(&self, platform: Platform) -> Result<Vec<Feed>> {
        Ok(self
            .tables
            .lock()
            .feeds
            .iter()
            .filter(|f| f.platform == platform)
            .cloned()
            .collect())
    }

    async fn find_feed(&self, platform: Platform, external_id: &str) -> Result<Option<Feed>> {
        Ok(self
            .tables
            .lock()
            .feeds
            .iter()
            .find(|f| f.platform == platform && f.external_id == external_id)
            .cloned())
    }

    async fn create_feed(
        &self,
        platform: Platform,
        external_id: &str,
        display_name: Option<&str>,
    ) -> Result<Feed> {
        let mut feed = self.add_feed(platform, external_id);
        if let Some(name) = display_name {
            self.set_feed_name(feed.id, name).await?;
            feed.display_name = Some(name.to_string());
        }
        Ok(feed)
    }

    async fn delete_feed(&self, feed_id: i64) -> Result<()> {
        let mut t = self.tables.lock();
        if t.unwritable_feeds.contains(&feed_id) {
            return Err(anyhow!("feed {} is locked", feed_id));
        }
        let target_ids: Vec<i64> = t
            .targets
            .iter()
            .filter(|target| target.feed_id == feed_id)
            .map(|target| target.id)
            .collect();
        for id in target_ids {
            t.drop_target_rows(id);
        }
        t.targets.retain(|target| target.feed_id != feed_id);
        t.notifications.retain(|n| n.feed_id != feed_id);
        t.sessions.remove(&feed_id);
        t.feeds.retain(|f| f.id != feed_id);
        Ok(())
    }

    async fn set_feed_cursor(&self, feed_id: i64, cursor: &str) -> Result<()> {
        let mut t = self.tables.lock();
        if t.unwritable_feeds.contains(&feed_id) {
            return Err(anyhow!("feed {} is locked", feed_id));
        }
        let feed = t
            .feeds
            .iter_mut()
            .find(|f| f.id == feed_id)
            .ok_or_else(|| anyhow!("no feed {}", feed_id))?;
        feed.last_cursor = Some(cursor.to_string());
        Ok(())
    }

    async fn set_feed_name(&self, feed_id: i64, name: &str) -> Result<()> {
        let mut t = self.tables.lock();
        if let Some(feed) = t.feeds.iter_mut().find(|f| f.id == feed_id) {
            feed.display_name = Some(name.to_string());
        }
        Ok(())
    }

    async fn targets_for_feed(&self, feed_id: i64) -> Result<Vec<Target>> {
        Ok(self
            .tables
            .lock()
            .targets
            .iter()
            .filter(|t| t.feed_id == feed_id)
            .cloned()
            .collect())
    }

    async fn find_target(&self, feed_id: i64, channel_id: u64) -> Result<Option<Target>> {
        Ok(self
            .tables
            .lock()
            .targets
            .iter()
            .find(|t| t.feed_id == feed_id && t.channel_id == channel_id)
            .cloned())
    }

    async fn create_target(&self, target: NewTarget) -> Result<Target> {
        let mut t = self.tables.lock();
        let created = Target {
            id: t.id(),
            feed_id: target.feed_id,
            channel_id: target.channel_id,
            guild_id: target.guild_id,
            tracked_by: target.tracked_by,
        };
        t.targets.push(created.clone());
        Ok(created)
    }

    async fn delete_target(&self, target_id: i64) -> Result<()> {
        let mut t = self.tables.lock();
        t.drop_target_rows(target_id);
        t.targets.retain(|target| target.id != target_id);
        Ok(())
    }

    async fn mention_for_target(&self, target_id: i64) -> Result<Option<MentionConfig>> {
        Ok(self
            .tables
            .lock()
            .mentions
            .iter()
            .find(|m| m.target_id == target_id)
            .cloned())
    }

    async fn clear_mention_role(&self, mention_id: i64) -> Result<()> {
        if let Some(m) = self
            .tables
            .lock()
            .mentions
            .iter_mut()
            .find(|m| m.id == mention_id)
        {
            m.role_id = None;
        }
        Ok(())
    }

    async fn delete_mention(&self, mention_id: i64) -> Result<()> {
        self.tables.lock().mentions.retain(|m| m.id != mention_id);
        Ok(())
    }

    async fn touch_mention(&self, mention_id: i64, at: DateTime<Utc>) -> Result<()> {
        if let Some(m) = self
            .tables
            .lock()
            .mentions
            .iter_mut()
            .find(|m| m.id == mention_id)
        {
            m.last_mention = Some(at);
        }
        Ok(())
    }

    async fn notification_for_target(
        &self,
        feed_id: i64,
        target_id: i64,
    ) -> Result<Option<NotificationRecord>> {
        Ok(self
            .tables
            .lock()
            .notifications
            .iter()
            .filter(|n| n.feed_id == feed_id && n.target_id == target_id)
            .max_by_key(|n| n.id)
            .cloned())
    }

    async fn notification_for_event(
        &self,
        target_id: i64,
        event_id: &str,
    ) -> Result<Option<NotificationRecord>> {
        Ok(self
            .tables
            .lock()
            .notifications
            .iter()
            .find(|n| n.target_id == target_id && n.event_id == event_id)
            .cloned())
    }

    async fn notifications_for_feed(&self, feed_id: i64) -> Result<Vec<NotificationRecord>> {
        Ok(self
            .tables
            .lock()
            .notifications
            .iter()
            .filter(|n| n.feed_id == feed_id)
            .cloned()
            .collect())
    }

    async fn create_notification(
        &self,
        feed_id: i64,
        target_id: i64,
        event_id: &str,
        message: MessageRef,
    ) -> Result<NotificationRecord> {
        let mut t = self.tables.lock();
        let record = NotificationRecord {
            id: t.id(),
            target_id,
            feed_id,
            event_id: event_id.to_string(),
            message,
            deleted: false,
            created_at: Utc::now(),
        };
        t.notifications.push(record.clone());
        Ok(record)
    }

    async fn mark_notification_deleted(&self, notification_id: i64) -> Result<()> {
        if let Some(n) = self
            .tables
            .lock()
            .notifications
            .iter_mut()
            .find(|n| n.id == notification_id)
        {
            n.deleted = true;
        }
        Ok(())
    }

    async fn delete_notification(&self, notification_id: i64) -> Result<()> {
        self.tables
            .lock()
            .notifications
            .retain(|n| n.id != notification_id);
        Ok(())
    }

    async fn prune_post_notifications(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut t = self.tables.lock();
        let post_feeds: HashSet<i64> = t
            .feeds
            .iter()
            .filter(|f| f.platform == Platform::Twitter)
            .map(|f| f.id)
            .collect();
        let count = t.notifications.len();
        t.notifications
            .retain(|n| !(post_feeds.contains(&n.feed_id) && n.created_at < before));
        Ok((count - t.notifications.len()) as u64)
    }

    async fn live_session(&self, feed_id: i64) -> Result<Option<LiveSession>> {
        Ok(self.tables.lock().sessions.get(&feed_id).cloned())
    }

    async fn save_live_session(&self, session: &LiveSession) -> Result<()> {
        self.tables
            .lock()
            .sessions
            .insert(session.feed_id, session.clone());
        Ok(())
    }

    async fn delete_live_session(&self, feed_id: i64) -> Result<()> {
        self.tables.lock().sessions.remove(&feed_id);
        Ok(())
    }

    async fn live_feeds_in_channel(&self, channel_id: u64) -> Result<Vec<Feed>> {
        let t = self.tables.lock();
        Ok(t.feeds
            .iter()
            .filter(|f| t.sessions.contains_key(&f.id))
            .filter(|f| {
                t.targets
                    .iter()
                    .any(|target| target.feed_id == f.id && target.channel_id == channel_id)
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl FeatureStore for MemoryStore {
    async fn channel_features(
        &self,
        guild_id: u64,
        channel_id: u64,
    ) -> Result<Option<ChannelFeatures>> {
        Ok(self
            .tables
            .lock()
            .features
            .get(&(guild_id, channel_id))
            .cloned())
    }

    async fn set_tracking_enabled(
        &self,
        guild_id: u64,
        channel_id: u64,
        platform: Platform,
        enabled: bool,
    ) -> Result<()> {
        self.tables
            .lock()
            .features
            .entry((guild_id, channel_id))
            .or_default()
            .set_tracking(platform, enabled);
        Ok(())
    }
}

#[derive(Default)]
struct DeliveryState {
    channel_failures: HashMap<u64, DeliveryError>,
    send_failures: HashMap<u64, DeliveryError>,
    edit_failure: Option<DeliveryError>,
    send_delays: HashMap<u64, Duration>,
    nsfw: HashSet<u64>,
    announcement: HashSet<u64>,
    names: HashMap<u64, String>,
    roles: HashSet<(u64, u64)>,
    next_message: u64,
    sent: Vec<(u64, OutgoingMessage)>,
    edits: Vec<(MessageRef, OutgoingMessage)>,
    deletes: Vec<MessageRef>,
    pinned: HashSet<MessageRef>,
    crossposts: Vec<MessageRef>,
    renames: Vec<(u64, String)>,
}

/// Records every outbound call; failures are scripted per channel.
#[derive(Default)]
pub struct FakeDelivery {
    state: Mutex<DeliveryState>,
    channel_lookups: AtomicUsize,
    edit_attempts: AtomicUsize,
}

impl FakeDelivery {
    pub fn fail_channel(&self, channel_id: u64, error: DeliveryError) {
        self.state.lock().channel_failures.insert(channel_id, error);
    }

    pub fn fail_send(&self, channel_id: u64, error: DeliveryError) {
        self.state.lock().send_failures.insert(channel_id, error);
    }

    pub fn fail_edits(&self, error: DeliveryError) {
        self.state.lock().edit_failure = Some(error);
    }

    /// Sends to `channel_id` succeed only after `delay`.
    pub fn slow_sends(&self, channel_id: u64, delay: Duration) {
        self.state.lock().send_delays.insert(channel_id, delay);
    }

    pub fn set_nsfw(&self, channel_id: u64) {
        self.state.lock().nsfw.insert(channel_id);
    }

    pub fn set_announcement(&self, channel_id: u64) {
        self.state.lock().announcement.insert(channel_id);
    }

    pub fn set_channel_name(&self, channel_id: u64, name: &str) {
        self.state.lock().names.insert(channel_id, name.to_string());
    }

    pub fn is_pinned(&self, message: MessageRef) -> bool {
        self.state.lock().pinned.contains(&message)
    }

    pub fn crossposts(&self) -> Vec<MessageRef> {
        self.state.lock().crossposts.clone()
    }

    pub fn renames(&self) -> Vec<(u64, String)> {
        self.state.lock().renames.clone()
    }

    pub fn add_role(&self, guild_id: u64, role_id: u64) {
        self.state.lock().roles.insert((guild_id, role_id));
    }

    pub fn channel_lookups(&self) -> usize {
        self.channel_lookups.load(Ordering::SeqCst)
    }

    pub fn edit_attempts(&self) -> usize {
        self.edit_attempts.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(u64, OutgoingMessage)> {
        self.state.lock().sent.clone()
    }

    pub fn sent_to(&self, channel_id: u64) -> usize {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|(c, _)| *c == channel_id)
            .count()
    }

    pub fn edits(&self) -> Vec<(MessageRef, OutgoingMessage)> {
        self.state.lock().edits.clone()
    }

    pub fn deletes(&self) -> Vec<MessageRef> {
        self.state.lock().deletes.clone()
    }
}

#[async_trait]
impl ChatDelivery for FakeDelivery {
    async fn fetch_channel(&self, channel_id: u64) -> Result<ChannelInfo, DeliveryError> {
        self.channel_lookups.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        if let Some(err) = state.channel_failures.get(&channel_id) {
            return Err(err.clone());
        }
        Ok(ChannelInfo {
            channel_id,
            guild_id: Some(1),
            name: state
                .names
                .get(&channel_id)
                .cloned()
                .unwrap_or_else(|| format!("channel-{}", channel_id)),
            nsfw: state.nsfw.contains(&channel_id),
            announcement: state.announcement.contains(&channel_id),
        })
    }

    async fn send_message(
        &self,
        channel_id: u64,
        message: &OutgoingMessage,
    ) -> Result<MessageRef, DeliveryError> {
        let delay = self.state.lock().send_delays.get(&channel_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        if let Some(err) = state.send_failures.get(&channel_id) {
            return Err(err.clone());
        }
        state.next_message += 1;
        let message_ref = MessageRef {
            channel_id,
            message_id: state.next_message,
        };
        state.sent.push((channel_id, message.clone()));
        Ok(message_ref)
    }

    async fn edit_message(
        &self,
        message_ref: MessageRef,
        message: &OutgoingMessage,
    ) -> Result<(), DeliveryError> {
        self.edit_attempts.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if let Some(err) = &state.edit_failure {
            return Err(err.clone());
        }
        state.edits.push((message_ref, message.clone()));
        Ok(())
    }

    async fn delete_message(&self, message_ref: MessageRef) -> Result<(), DeliveryError> {
        let mut state = self.state.lock();
        state.pinned.remove(&message_ref);
        state.deletes.push(message_ref);
        Ok(())
    }

    async fn pin_message(&self, message_ref: MessageRef) -> Result<(), DeliveryError> {
        self.state.lock().pinned.insert(message_ref);
        Ok(())
    }

    async fn unpin_message(&self, message_ref: MessageRef) -> Result<(), DeliveryError> {
        self.state.lock().pinned.remove(&message_ref);
        Ok(())
    }

    async fn crosspost_message(&self, message_ref: MessageRef) -> Result<(), DeliveryError> {
        self.state.lock().crossposts.push(message_ref);
        Ok(())
    }

    async fn rename_channel(&self, channel_id: u64, name: &str) -> Result<(), DeliveryError> {
        let mut state = self.state.lock();
        state.names.insert(channel_id, name.to_string());
        state.renames.push((channel_id, name.to_string()));
        Ok(())
    }

    async fn verify_role(&self, guild_id: u64, role_id: u64) -> Result<(), DeliveryError> {
        if self.state.lock().roles.contains(&(guild_id, role_id)) {
            Ok(())
        } else {
            Err(DeliveryError::NotFound)
        }
    }
}

#[derive(Default)]
pub struct FakeLookup {
    accounts: HashMap<String, AccountInfo>,
}

impl FakeLookup {
    pub fn with_account(handle: &str, external_id: &str, display_name: &str) -> Self {
        let mut accounts = HashMap::new();
        accounts.insert(
            handle.to_lowercase(),
            AccountInfo {
                external_id: external_id.to_string(),
                display_name: display_name.to_string(),
            },
        );
        Self { accounts }
    }
}

#[async_trait]
impl AccountLookup for FakeLookup {
    async fn lookup_account(&self, handle: &str) -> Result<AccountInfo, PlatformError> {
        self.accounts
            .get(&handle.to_lowercase())
            .cloned()
            .ok_or(PlatformError::NotFound)
    }
}

#[derive(Default)]
pub struct FakeTwitch {
    live: Mutex<HashMap<String, TwitchStream>>,
    users: Mutex<HashMap<String, TwitchUser>>,
    batch_failure: Mutex<Option<PlatformError>>,
    spacer: Option<CallSpacer>,
    fetches: AtomicUsize,
    user_batches: AtomicUsize,
    user_calls: AtomicUsize,
}

impl FakeTwitch {
    /// Every API call waits on a spacer, like the real client.
    pub fn with_call_delay(delay: Duration) -> Self {
        Self {
            spacer: Some(CallSpacer::new(delay)),
            ..Default::default()
        }
    }

    async fn space(&self) {
        if let Some(spacer) = &self.spacer {
            spacer.wait().await;
        }
    }

    pub fn add_user(&self, user: TwitchUser) {
        self.users.lock().insert(user.id.clone(), user);
    }

    pub fn go_live(&self, stream: TwitchStream) {
        self.live.lock().insert(stream.user_id.clone(), stream);
    }

    pub fn go_offline(&self, user_id: &str) {
        self.live.lock().remove(user_id);
    }

    /// The next bulk fetch fails with `error`.
    pub fn fail_next_batch(&self, error: PlatformError) {
        *self.batch_failure.lock() = Some(error);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn user_calls(&self) -> usize {
        self.user_calls.load(Ordering::SeqCst)
    }

    pub fn user_batches(&self) -> usize {
        self.user_batches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TwitchApi for FakeTwitch {
    async fn fetch_streams(&self, ids: &[String]) -> Result<StreamBatch, PlatformError> {
        self.space().await;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.batch_failure.lock().take() {
            return Err(err);
        }
        let live = self.live.lock();
        Ok(ids
            .iter()
            .map(|id| (id.clone(), Ok(live.get(id).cloned())))
            .collect())
    }

    async fn fetch_users(&self, ids: &[String]) -> Result<HashMap<String, TwitchUser>, PlatformError> {
        self.space().await;
        self.user_batches.fetch_add(1, Ordering::SeqCst);
        let users = self.users.lock();
        Ok(ids
            .iter()
            .filter_map(|id| users.get(id).map(|user| (id.clone(), user.clone())))
            .collect())
    }

    async fn get_user(&self, id: &str) -> Result<TwitchUser, PlatformError> {
        self.space().await;
        self.user_calls.fetch_add(1, Ordering::SeqCst);
        self.users
            .lock()
            .get(id)
            .cloned()
            .ok_or(PlatformError::NotFound)
    }
}

#[derive(Default)]
pub struct FakeTwitter {
    timelines: Mutex<HashMap<String, Result<Timeline, PlatformError>>>,
    queries: Mutex<Vec<(String, TimelineQuery)>>,
}

impl FakeTwitter {
    pub fn set_timeline(&self, user_id: &str, timeline: Timeline) {
        self.timelines
            .lock()
            .insert(user_id.to_string(), Ok(timeline));
    }

    pub fn fail(&self, user_id: &str, error: PlatformError) {
        self.timelines
            .lock()
            .insert(user_id.to_string(), Err(error));
    }

    pub fn queries(&self) -> Vec<(String, TimelineQuery)> {
        self.queries.lock().clone()
    }
}

#[async_trait]
impl TwitterApi for FakeTwitter {
    async fn recent_posts(
        &self,
        user_id: &str,
        query: TimelineQuery,
    ) -> Result<Timeline, PlatformError> {
        self.queries.lock().push((user_id.to_string(), query));
        self.timelines
            .lock()
            .get(user_id)
            .cloned()
            .unwrap_or(Err(PlatformError::NotFound))
    }
}
