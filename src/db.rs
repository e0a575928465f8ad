use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, MySql, Pool};

use crate::model::{
    ChannelFeatures, Feed, LiveSession, MentionConfig, MessageRef, NewTarget, NotificationRecord,
    Platform, PostSettings, StreamSettings, Target,
};
use crate::store::{FeatureStore, TrackerStore};

#[derive(Clone)]
pub struct Database {
    pub pool: Pool<MySql>,
}

#[derive(FromRow)]
struct FeedRow {
    id: i64,
    platform: String,
    external_id: String,
    display_name: Option<String>,
    last_cursor: Option<String>,
}

impl TryFrom<FeedRow> for Feed {
    type Error = anyhow::Error;

    fn try_from(row: FeedRow) -> Result<Self> {
        Ok(Feed {
            id: row.id,
            platform: row.platform.parse()?,
            external_id: row.external_id,
            display_name: row.display_name,
            last_cursor: row.last_cursor,
        })
    }
}

#[derive(FromRow)]
struct TargetRow {
    id: i64,
    feed_id: i64,
    channel_id: i64,
    guild_id: Option<i64>,
    tracked_by: i64,
}

impl From<TargetRow> for Target {
    fn from(row: TargetRow) -> Self {
        Target {
            id: row.id,
            feed_id: row.feed_id,
            channel_id: row.channel_id as u64,
            guild_id: row.guild_id.map(|g| g as u64),
            tracked_by: row.tracked_by as u64,
        }
    }
}

#[derive(FromRow)]
struct MentionRow {
    id: i64,
    target_id: i64,
    role_id: Option<i64>,
    mention_text: Option<String>,
    embed_color: Option<i64>,
    last_mention: Option<DateTime<Utc>>,
}

impl From<MentionRow> for MentionConfig {
    fn from(row: MentionRow) -> Self {
        MentionConfig {
            id: row.id,
            target_id: row.target_id,
            role_id: row.role_id.map(|r| r as u64),
            text: row.mention_text,
            embed_color: row.embed_color.map(|c| c as u32),
            last_mention: row.last_mention,
        }
    }
}

#[derive(FromRow)]
struct NotificationRow {
    id: i64,
    target_id: i64,
    feed_id: i64,
    event_id: String,
    channel_id: i64,
    message_id: i64,
    deleted: bool,
    created_at: DateTime<Utc>,
}

impl From<NotificationRow> for NotificationRecord {
    fn from(row: NotificationRow) -> Self {
        NotificationRecord {
            id: row.id,
            target_id: row.target_id,
            feed_id: row.feed_id,
            event_id: row.event_id,
            message: MessageRef {
                channel_id: row.channel_id as u64,
                message_id: row.message_id as u64,
            },
            deleted: row.deleted,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct SessionRow {
    feed_id: i64,
    started_at: DateTime<Utc>,
    peak_viewers: i64,
    average_viewers: i64,
    uptime_ticks: i64,
    last_title: String,
    last_game: String,
}

impl From<SessionRow> for LiveSession {
    fn from(row: SessionRow) -> Self {
        LiveSession {
            feed_id: row.feed_id,
            started_at: row.started_at,
            peak_viewers: row.peak_viewers as u64,
            average_viewers: row.average_viewers as u64,
            uptime_ticks: row.uptime_ticks as u64,
            last_title: row.last_title,
            last_game: row.last_game,
        }
    }
}

#[derive(FromRow)]
struct FeaturesRow {
    stream_tracking: bool,
    post_tracking: bool,
    stream_settings: String,
    post_settings: String,
}

const NOTIFICATION_COLUMNS: &str =
    "id, target_id, feed_id, event_id, channel_id, message_id, deleted, created_at";

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = sqlx::mysql::MySqlPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tracked_feeds (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                platform VARCHAR(16) NOT NULL,
                external_id VARCHAR(64) NOT NULL,
                display_name VARCHAR(255),
                last_cursor VARCHAR(64),
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                UNIQUE KEY uq_platform_external (platform, external_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_targets (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                feed_id BIGINT NOT NULL,
                channel_id BIGINT NOT NULL,
                guild_id BIGINT,
                tracked_by BIGINT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                UNIQUE KEY uq_feed_channel (feed_id, channel_id),
                INDEX idx_channel_id (channel_id),
                FOREIGN KEY (feed_id) REFERENCES tracked_feeds(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS target_mentions (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                target_id BIGINT NOT NULL UNIQUE,
                role_id BIGINT,
                mention_text VARCHAR(255),
                embed_color BIGINT,
                last_mention DATETIME,
                FOREIGN KEY (target_id) REFERENCES feed_targets(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS notifications (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                target_id BIGINT NOT NULL,
                feed_id BIGINT NOT NULL,
                event_id VARCHAR(64) NOT NULL,
                channel_id BIGINT NOT NULL,
                message_id BIGINT NOT NULL,
                deleted BOOLEAN NOT NULL DEFAULT FALSE,
                created_at DATETIME NOT NULL,
                UNIQUE KEY uq_target_event (target_id, event_id),
                INDEX idx_feed_id (feed_id),
                INDEX idx_created_at (created_at),
                FOREIGN KEY (target_id) REFERENCES feed_targets(id) ON DELETE CASCADE,
                FOREIGN KEY (feed_id) REFERENCES tracked_feeds(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS live_sessions (
                feed_id BIGINT PRIMARY KEY,
                started_at DATETIME NOT NULL,
                peak_viewers BIGINT NOT NULL,
                average_viewers BIGINT NOT NULL,
                uptime_ticks BIGINT NOT NULL,
                last_title TEXT NOT NULL,
                last_game VARCHAR(255) NOT NULL,
                FOREIGN KEY (feed_id) REFERENCES tracked_feeds(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS channel_features (
                guild_id BIGINT NOT NULL,
                channel_id BIGINT NOT NULL,
                stream_tracking BOOLEAN NOT NULL DEFAULT TRUE,
                post_tracking BOOLEAN NOT NULL DEFAULT TRUE,
                stream_settings TEXT NOT NULL,
                post_settings TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP,
                PRIMARY KEY (guild_id, channel_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl TrackerStore for Database {
    async fn feeds_for_platform(&self, platform: Platform) -> Result<Vec<Feed>> {
        let rows = sqlx::query_as::<_, FeedRow>(
            "SELECT id, platform, external_id, display_name, last_cursor FROM tracked_feeds WHERE platform = ?",
        )
        .bind(platform.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Feed::try_from).collect()
    }

    async fn find_feed(&self, platform: Platform, external_id: &str) -> Result<Option<Feed>> {
        let row = sqlx::query_as::<_, FeedRow>(
            "SELECT id, platform, external_id, display_name, last_cursor FROM tracked_feeds WHERE platform = ? AND external_id = ?",
        )
        .bind(platform.as_str())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Feed::try_from).transpose()
    }

    async fn create_feed(
        &self,
        platform: Platform,
        external_id: &str,
        display_name: Option<&str>,
    ) -> Result<Feed> {
        let result = sqlx::query(
            "INSERT INTO tracked_feeds (platform, external_id, display_name) VALUES (?, ?, ?)",
        )
        .bind(platform.as_str())
        .bind(external_id)
        .bind(display_name)
        .execute(&self.pool)
        .await?;

        Ok(Feed {
            id: result.last_insert_id() as i64,
            platform,
            external_id: external_id.to_string(),
            display_name: display_name.map(str::to_string),
            last_cursor: None,
        })
    }

    async fn delete_feed(&self, feed_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM tracked_feeds WHERE id = ?")
            .bind(feed_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn set_feed_cursor(&self, feed_id: i64, cursor: &str) -> Result<()> {
        sqlx::query("UPDATE tracked_feeds SET last_cursor = ? WHERE id = ?")
            .bind(cursor)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn set_feed_name(&self, feed_id: i64, name: &str) -> Result<()> {
        sqlx::query("UPDATE tracked_feeds SET display_name = ? WHERE id = ?")
            .bind(name)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn targets_for_feed(&self, feed_id: i64) -> Result<Vec<Target>> {
        let rows = sqlx::query_as::<_, TargetRow>(
            "SELECT id, feed_id, channel_id, guild_id, tracked_by FROM feed_targets WHERE feed_id = ?",
        )
        .bind(feed_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Target::from).collect())
    }

    async fn find_target(&self, feed_id: i64, channel_id: u64) -> Result<Option<Target>> {
        let row = sqlx::query_as::<_, TargetRow>(
            "SELECT id, feed_id, channel_id, guild_id, tracked_by FROM feed_targets WHERE feed_id = ? AND channel_id = ?",
        )
        .bind(feed_id)
        .bind(channel_id as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Target::from))
    }

    async fn create_target(&self, target: NewTarget) -> Result<Target> {
        let result = sqlx::query(
            "INSERT INTO feed_targets (feed_id, channel_id, guild_id, tracked_by) VALUES (?, ?, ?, ?)",
        )
        .bind(target.feed_id)
        .bind(target.channel_id as i64)
        .bind(target.guild_id.map(|g| g as i64))
        .bind(target.tracked_by as i64)
        .execute(&self.pool)
        .await?;

        Ok(Target {
            id: result.last_insert_id() as i64,
            feed_id: target.feed_id,
            channel_id: target.channel_id,
            guild_id: target.guild_id,
            tracked_by: target.tracked_by,
        })
    }

    async fn delete_target(&self, target_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM feed_targets WHERE id = ?")
            .bind(target_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn mention_for_target(&self, target_id: i64) -> Result<Option<MentionConfig>> {
        let row = sqlx::query_as::<_, MentionRow>(
            "SELECT id, target_id, role_id, mention_text, embed_color, last_mention FROM target_mentions WHERE target_id = ?",
        )
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(MentionConfig::from))
    }

    async fn clear_mention_role(&self, mention_id: i64) -> Result<()> {
        sqlx::query("UPDATE target_mentions SET role_id = NULL WHERE id = ?")
            .bind(mention_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn delete_mention(&self, mention_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM target_mentions WHERE id = ?")
            .bind(mention_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn touch_mention(&self, mention_id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE target_mentions SET last_mention = ? WHERE id = ?")
            .bind(at)
            .bind(mention_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn notification_for_target(
        &self,
        feed_id: i64,
        target_id: i64,
    ) -> Result<Option<NotificationRecord>> {
        let row = sqlx::query_as::<_, NotificationRow>(&format!(
            "SELECT {} FROM notifications WHERE feed_id = ? AND target_id = ? ORDER BY id DESC LIMIT 1",
            NOTIFICATION_COLUMNS
        ))
        .bind(feed_id)
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(NotificationRecord::from))
    }

    async fn notification_for_event(
        &self,
        target_id: i64,
        event_id: &str,
    ) -> Result<Option<NotificationRecord>> {
        let row = sqlx::query_as::<_, NotificationRow>(&format!(
            "SELECT {} FROM notifications WHERE target_id = ? AND event_id = ?",
            NOTIFICATION_COLUMNS
        ))
        .bind(target_id)
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(NotificationRecord::from))
    }

    async fn notifications_for_feed(&self, feed_id: i64) -> Result<Vec<NotificationRecord>> {
        let rows = sqlx::query_as::<_, NotificationRow>(&format!(
            "SELECT {} FROM notifications WHERE feed_id = ? ORDER BY id",
            NOTIFICATION_COLUMNS
        ))
        .bind(feed_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(NotificationRecord::from).collect())
    }

    async fn create_notification(
        &self,
        feed_id: i64,
        target_id: i64,
        event_id: &str,
        message: MessageRef,
    ) -> Result<NotificationRecord> {
        let created_at = Utc::now();
        let result = sqlx::query(
            "INSERT INTO notifications (target_id, feed_id, event_id, channel_id, message_id, deleted, created_at) VALUES (?, ?, ?, ?, ?, FALSE, ?)",
        )
        .bind(target_id)
        .bind(feed_id)
        .bind(event_id)
        .bind(message.channel_id as i64)
        .bind(message.message_id as i64)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        Ok(NotificationRecord {
            id: result.last_insert_id() as i64,
            target_id,
            feed_id,
            event_id: event_id.to_string(),
            message,
            deleted: false,
            created_at,
        })
    }

    async fn mark_notification_deleted(&self, notification_id: i64) -> Result<()> {
        sqlx::query("UPDATE notifications SET deleted = TRUE WHERE id = ?")
            .bind(notification_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn delete_notification(&self, notification_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM notifications WHERE id = ?")
            .bind(notification_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn prune_post_notifications(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE n FROM notifications n
            JOIN tracked_feeds f ON n.feed_id = f.id
            WHERE f.platform = ? AND n.created_at < ?
            "#,
        )
        .bind(Platform::Twitter.as_str())
        .bind(before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn live_session(&self, feed_id: i64) -> Result<Option<LiveSession>> {
        let row = sqlx::query_as::<_, SessionRow>(
            "SELECT feed_id, started_at, peak_viewers, average_viewers, uptime_ticks, last_title, last_game FROM live_sessions WHERE feed_id = ?",
        )
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(LiveSession::from))
    }

    async fn save_live_session(&self, session: &LiveSession) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO live_sessions (feed_id, started_at, peak_viewers, average_viewers, uptime_ticks, last_title, last_game)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON DUPLICATE KEY UPDATE
                peak_viewers = VALUES(peak_viewers),
                average_viewers = VALUES(average_viewers),
                uptime_ticks = VALUES(uptime_ticks),
                last_title = VALUES(last_title),
                last_game = VALUES(last_game)
            "#,
        )
        .bind(session.feed_id)
        .bind(session.started_at)
        .bind(session.peak_viewers as i64)
        .bind(session.average_viewers as i64)
        .bind(session.uptime_ticks as i64)
        .bind(&session.last_title)
        .bind(&session.last_game)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_live_session(&self, feed_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM live_sessions WHERE feed_id = ?")
            .bind(feed_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn live_feeds_in_channel(&self, channel_id: u64) -> Result<Vec<Feed>> {
        let rows = sqlx::query_as::<_, FeedRow>(
            r#"
            SELECT DISTINCT f.id, f.platform, f.external_id, f.display_name, f.last_cursor
            FROM tracked_feeds f
            JOIN feed_targets t ON t.feed_id = f.id
            JOIN live_sessions s ON s.feed_id = f.id
            WHERE t.channel_id = ?
            ORDER BY f.id
            "#,
        )
        .bind(channel_id as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Feed::try_from).collect()
    }
}

#[async_trait]
impl FeatureStore for Database {
    async fn channel_features(
        &self,
        guild_id: u64,
        channel_id: u64,
    ) -> Result<Option<ChannelFeatures>> {
        let row = sqlx::query_as::<_, FeaturesRow>(
            "SELECT stream_tracking, post_tracking, stream_settings, post_settings FROM channel_features WHERE guild_id = ? AND channel_id = ?",
        )
        .bind(guild_id as i64)
        .bind(channel_id as i64)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let streams: StreamSettings = serde_json::from_str(&row.stream_settings)
            .with_context(|| format!("bad stream settings for channel {}", channel_id))?;
        let posts: PostSettings = serde_json::from_str(&row.post_settings)
            .with_context(|| format!("bad post settings for channel {}", channel_id))?;

        Ok(Some(ChannelFeatures {
            stream_tracking: row.stream_tracking,
            post_tracking: row.post_tracking,
            streams,
            posts,
        }))
    }

    async fn set_tracking_enabled(
        &self,
        guild_id: u64,
        channel_id: u64,
        platform: Platform,
        enabled: bool,
    ) -> Result<()> {
        let mut features = self
            .channel_features(guild_id, channel_id)
            .await?
            .unwrap_or_default();
        features.set_tracking(platform, enabled);

        sqlx::query(
            r#"
            INSERT INTO channel_features (guild_id, channel_id, stream_tracking, post_tracking, stream_settings, post_settings)
            VALUES (?, ?, ?, ?, ?, ?)
            ON DUPLICATE KEY UPDATE
                stream_tracking = VALUES(stream_tracking),
                post_tracking = VALUES(post_tracking)
            "#,
        )
        .bind(guild_id as i64)
        .bind(channel_id as i64)
        .bind(features.stream_tracking)
        .bind(features.post_tracking)
        .bind(serde_json::to_string(&features.streams)?)
        .bind(serde_json::to_string(&features.posts)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
