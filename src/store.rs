//! Persistence interfaces consumed by the tracker engine.
//!
//! `Database` (MySQL) implements both traits in production; tests use an
//! in-memory store.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{
    ChannelFeatures, Feed, LiveSession, MentionConfig, MessageRef, NewTarget, NotificationRecord,
    Platform, Target,
};

#[async_trait]
pub trait TrackerStore: Send + Sync {
    async fn feeds_for_platform(&self, platform: Platform) -> Result<Vec<Feed>>;
    async fn find_feed(&self, platform: Platform, external_id: &str) -> Result<Option<Feed>>;
    async fn create_feed(
        &self,
        platform: Platform,
        external_id: &str,
        display_name: Option<&str>,
    ) -> Result<Feed>;
    /// Deletes the feed and cascades to its targets, mentions, notifications and session.
    async fn delete_feed(&self, feed_id: i64) -> Result<()>;
    async fn set_feed_cursor(&self, feed_id: i64, cursor: &str) -> Result<()>;
    async fn set_feed_name(&self, feed_id: i64, name: &str) -> Result<()>;

    async fn targets_for_feed(&self, feed_id: i64) -> Result<Vec<Target>>;
    async fn find_target(&self, feed_id: i64, channel_id: u64) -> Result<Option<Target>>;
    async fn create_target(&self, target: NewTarget) -> Result<Target>;
    /// Deletes the target and cascades to its mention config and notifications.
    async fn delete_target(&self, target_id: i64) -> Result<()>;

    async fn mention_for_target(&self, target_id: i64) -> Result<Option<MentionConfig>>;
    async fn clear_mention_role(&self, mention_id: i64) -> Result<()>;
    async fn delete_mention(&self, mention_id: i64) -> Result<()>;
    async fn touch_mention(&self, mention_id: i64, at: DateTime<Utc>) -> Result<()>;

    /// Newest non-finalized notification of `target` for `feed_id`.
    async fn notification_for_target(
        &self,
        feed_id: i64,
        target_id: i64,
    ) -> Result<Option<NotificationRecord>>;
    async fn notification_for_event(
        &self,
        target_id: i64,
        event_id: &str,
    ) -> Result<Option<NotificationRecord>>;
    async fn notifications_for_feed(&self, feed_id: i64) -> Result<Vec<NotificationRecord>>;
    async fn create_notification(
        &self,
        feed_id: i64,
        target_id: i64,
        event_id: &str,
        message: MessageRef,
    ) -> Result<NotificationRecord>;
    async fn mark_notification_deleted(&self, notification_id: i64) -> Result<()>;
    async fn delete_notification(&self, notification_id: i64) -> Result<()>;
    /// Drops post notifications created before `before`; returns how many.
    async fn prune_post_notifications(&self, before: DateTime<Utc>) -> Result<u64>;

    async fn live_session(&self, feed_id: i64) -> Result<Option<LiveSession>>;
    async fn save_live_session(&self, session: &LiveSession) -> Result<()>;
    async fn delete_live_session(&self, feed_id: i64) -> Result<()>;
    /// Feeds with an open live session and a target in `channel_id`.
    async fn live_feeds_in_channel(&self, channel_id: u64) -> Result<Vec<Feed>>;
}

/// Per-channel feature flags and settings.
#[async_trait]
pub trait FeatureStore: Send + Sync {
    async fn channel_features(&self, guild_id: u64, channel_id: u64)
        -> Result<Option<ChannelFeatures>>;
    async fn set_tracking_enabled(
        &self,
        guild_id: u64,
        channel_id: u64,
        platform: Platform,
        enabled: bool,
    ) -> Result<()>;

    /// DM targets have no channel features and are always enabled.
    async fn is_tracking_enabled(&self, target: &Target, platform: Platform) -> Result<bool> {
        match target.guild_id {
            None => Ok(true),
            Some(guild_id) => Ok(self
                .channel_features(guild_id, target.channel_id)
                .await?
                .map(|f| f.tracking_enabled(platform))
                .unwrap_or(true)),
        }
    }

    /// Settings for a target channel, defaults for DMs and unconfigured channels.
    async fn features_for(&self, target: &Target) -> Result<ChannelFeatures> {
        match target.guild_id {
            None => Ok(ChannelFeatures::default()),
            Some(guild_id) => Ok(self
                .channel_features(guild_id, target.channel_id)
                .await?
                .unwrap_or_default()),
        }
    }
}
