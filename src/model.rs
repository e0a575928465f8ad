use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    Twitch,
    Twitter,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Twitch => "twitch",
            Platform::Twitter => "twitter",
        }
    }

    /// Bracketed tag used in log lines.
    pub fn tag(&self) -> &'static str {
        match self {
            Platform::Twitch => "[TWITCH]",
            Platform::Twitter => "[TWITTER]",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "twitch" => Ok(Platform::Twitch),
            "twitter" => Ok(Platform::Twitter),
            other => anyhow::bail!("unknown platform: {}", other),
        }
    }
}

/// One tracked external account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feed {
    pub id: i64,
    pub platform: Platform,
    pub external_id: String,
    pub display_name: Option<String>,
    /// Last handled item id (Twitter: newest tweet id).
    pub last_cursor: Option<String>,
}

impl Feed {
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.external_id)
    }

    pub fn cursor_id(&self) -> Option<u64> {
        self.last_cursor.as_deref().and_then(|c| c.parse().ok())
    }
}

/// One Discord channel subscribed to a feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub id: i64,
    pub feed_id: i64,
    pub channel_id: u64,
    /// `None` for DM targets.
    pub guild_id: Option<u64>,
    pub tracked_by: u64,
}

impl Target {
    pub fn is_dm(&self) -> bool {
        self.guild_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTarget {
    pub feed_id: i64,
    pub channel_id: u64,
    pub guild_id: Option<u64>,
    pub tracked_by: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionConfig {
    pub id: i64,
    pub target_id: i64,
    /// Cleared when the role disappears upstream.
    pub role_id: Option<u64>,
    pub text: Option<String>,
    pub embed_color: Option<u32>,
    pub last_mention: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub channel_id: u64,
    pub message_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRecord {
    pub id: i64,
    pub target_id: i64,
    pub feed_id: i64,
    /// Upstream stream id or post id this message was created for.
    pub event_id: String,
    pub message: MessageRef,
    /// The message is confirmed gone; lookups short-circuit.
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
}

/// Statistics for the live session of one feed.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveSession {
    pub feed_id: i64,
    pub started_at: DateTime<Utc>,
    pub peak_viewers: u64,
    pub average_viewers: u64,
    pub uptime_ticks: u64,
    pub last_title: String,
    pub last_game: String,
}

impl LiveSession {
    pub fn begin(feed_id: i64, started_at: DateTime<Utc>, viewers: u64, title: &str, game: &str) -> Self {
        Self {
            feed_id,
            started_at,
            peak_viewers: viewers,
            average_viewers: viewers,
            uptime_ticks: 1,
            last_title: title.to_string(),
            last_game: game.to_string(),
        }
    }

    pub fn update_viewers(&mut self, viewers: u64) {
        if viewers > self.peak_viewers {
            self.peak_viewers = viewers;
        }
        let total = self.average_viewers * self.uptime_ticks + viewers;
        self.uptime_ticks += 1;
        self.average_viewers = total / self.uptime_ticks;
    }

    /// Records the current title/game, returning whether either changed.
    pub fn update_details(&mut self, title: &str, game: &str) -> bool {
        if self.last_title != title || self.last_game != game {
            self.last_title = title.to_string();
            self.last_game = game.to_string();
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PostKind {
    Post,
    Retweet,
    Reply,
    Quote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Edit the notification into a statistics summary instead of deleting it.
    pub summaries: bool,
    pub thumbnails: bool,
    pub end_title: bool,
    pub end_game: bool,
    pub peak_viewers: bool,
    pub average_viewers: bool,
    pub mention_roles: bool,
    /// Keep the live notification pinned until the stream ends.
    pub pin_active: bool,
    pub publish: bool,
    /// Rename the channel to reflect which tracked streams are live.
    pub rename_channel: bool,
    pub offline_channel_name: Option<String>,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            summaries: true,
            thumbnails: true,
            end_title: true,
            end_game: true,
            peak_viewers: false,
            average_viewers: false,
            mention_roles: true,
            pin_active: false,
            publish: false,
            rename_channel: false,
            offline_channel_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostSettings {
    pub display_posts: bool,
    pub display_retweets: bool,
    pub display_replies: bool,
    pub display_quotes: bool,
    pub media_only: bool,
    pub mention_roles: bool,
    pub mention_posts: bool,
    pub mention_retweets: bool,
    pub mention_replies: bool,
    pub mention_quotes: bool,
    /// Publish notifications sent to announcement channels.
    pub publish: bool,
}

impl Default for PostSettings {
    fn default() -> Self {
        Self {
            display_posts: true,
            display_retweets: false,
            display_replies: false,
            display_quotes: true,
            media_only: false,
            mention_roles: true,
            mention_posts: true,
            mention_retweets: false,
            mention_replies: false,
            mention_quotes: true,
            publish: false,
        }
    }
}

impl PostSettings {
    pub fn displays(&self, kind: PostKind) -> bool {
        match kind {
            PostKind::Post => self.display_posts,
            PostKind::Retweet => self.display_retweets,
            PostKind::Reply => self.display_replies,
            PostKind::Quote => self.display_quotes,
        }
    }

    pub fn mentions(&self, kind: PostKind) -> bool {
        self.mention_roles
            && match kind {
                PostKind::Post => self.mention_posts,
                PostKind::Retweet => self.mention_retweets,
                PostKind::Reply => self.mention_replies,
                PostKind::Quote => self.mention_quotes,
            }
    }
}

/// Per-channel feature configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelFeatures {
    pub stream_tracking: bool,
    pub post_tracking: bool,
    pub streams: StreamSettings,
    pub posts: PostSettings,
}

impl Default for ChannelFeatures {
    fn default() -> Self {
        Self {
            stream_tracking: true,
            post_tracking: true,
            streams: StreamSettings::default(),
            posts: PostSettings::default(),
        }
    }
}

impl ChannelFeatures {
    pub fn tracking_enabled(&self, platform: Platform) -> bool {
        match platform {
            Platform::Twitch => self.stream_tracking,
            Platform::Twitter => self.post_tracking,
        }
    }

    pub fn set_tracking(&mut self, platform: Platform, enabled: bool) {
        match platform {
            Platform::Twitch => self.stream_tracking = enabled,
            Platform::Twitter => self.post_tracking = enabled,
        }
    }
}
