//! Rendering of tracker notifications into [`OutgoingMessage`]s.

use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::{Captures, Regex};

use crate::delivery::{EmbedAuthor, EmbedSpec, OutgoingMessage};
use crate::mention::Mention;
use crate::model::{LiveSession, PostKind, StreamSettings};
use crate::platforms::twitch::{TwitchStream, TwitchUser};
use crate::platforms::twitter::{MediaKind, Tweet, TwitterUser};

pub const TWITCH_PURPLE: u32 = 0x6441A5;
pub const STREAM_ENDED: u32 = 0x3C2662;
pub const TWITTER_BLUE: u32 = 0x1DA1F2;

const LIVE_CHANNEL_PREFIX: &str = "🔴-live";
const OFFLINE_CHANNEL_NAME: &str = "no-streams-live";
/// Discord rejects longer channel names.
const CHANNEL_NAME_LIMIT: usize = 100;

fn plural(n: u64, unit: &str) -> String {
    if n == 1 {
        format!("1 {}", unit)
    } else {
        format!("{} {}s", n, unit)
    }
}

/// Compact uptime, e.g. `2h 05m`.
pub fn format_uptime(elapsed: Duration) -> String {
    let minutes = elapsed.as_secs() / 60;
    match (minutes / 60, minutes % 60) {
        (0, m) => format!("{}m", m),
        (h, m) => format!("{}h {:02}m", h, m),
    }
}

/// Long form, e.g. `2 hours, 5 minutes`.
pub fn format_duration(elapsed: Duration) -> String {
    let minutes = elapsed.as_secs() / 60;
    match (minutes / 60, minutes % 60) {
        (0, m) => plural(m, "minute"),
        (h, 0) => plural(h, "hour"),
        (h, m) => format!("{}, {}", plural(h, "hour"), plural(m, "minute")),
    }
}

fn since(start: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    now.signed_duration_since(start).to_std().unwrap_or_default()
}

/// Channel name for a channel whose listed streams are live, already in the
/// lowercase, hyphenated form Discord stores.
pub fn channel_name(live: &[&str], offline: Option<&str>) -> String {
    let raw = if live.is_empty() {
        offline.unwrap_or(OFFLINE_CHANNEL_NAME).to_string()
    } else {
        format!("{}-{}", LIVE_CHANNEL_PREFIX, live.join("-"))
    };
    raw.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .chars()
        .take(CHANNEL_NAME_LIMIT)
        .collect()
}

pub fn twitch_author(user: &TwitchUser) -> EmbedAuthor {
    EmbedAuthor {
        name: user.display_name.clone(),
        url: Some(user.url()),
        icon_url: (!user.profile_image_url.is_empty()).then(|| user.profile_image_url.clone()),
    }
}

pub fn live_stream(
    user: &TwitchUser,
    stream: &TwitchStream,
    settings: &StreamSettings,
    now: DateTime<Utc>,
) -> EmbedSpec {
    let url = user.url();
    let game = if stream.game_name.is_empty() {
        "nothing"
    } else {
        stream.game_name.as_str()
    };

    EmbedSpec {
        author: Some(EmbedAuthor {
            name: format!(
                "{} playing {} for {} viewers",
                user.display_name, game, stream.viewer_count
            ),
            url: Some(url.clone()),
            icon_url: twitch_author(user).icon_url,
        }),
        description: Some(format!("[{}]({})", stream.title, url)),
        color: TWITCH_PURPLE,
        thumbnail: stream.box_art(),
        image: settings
            .thumbnails
            .then(|| stream.thumbnail(1280, 720))
            .filter(|t| !t.is_empty()),
        footer: Some(format!(
            "Uptime: {} - Live since",
            format_uptime(since(stream.started_at, now))
        )),
        timestamp: Some(stream.started_at),
        ..Default::default()
    }
}

/// Post-stream statistics the live notification is edited into.
pub fn stream_summary(
    author: EmbedAuthor,
    session: &LiveSession,
    settings: &StreamSettings,
    now: DateTime<Utc>,
) -> EmbedSpec {
    let mut description = String::new();
    if settings.end_title && !session.last_title.trim().is_empty() {
        description.push_str(&format!("Last stream title: {}\n", session.last_title));
    }
    if settings.end_game {
        description.push_str(&format!("Last game played: {}\n", session.last_game));
    }
    if settings.peak_viewers {
        description.push_str(&format!("Peak viewers: {}\n", session.peak_viewers));
    }
    if settings.average_viewers {
        description.push_str(&format!("Average viewers: {}\n", session.average_viewers));
    }

    EmbedSpec {
        author: Some(EmbedAuthor {
            name: format!(
                "{} was live for {}",
                author.name,
                format_duration(since(session.started_at, now))
            ),
            ..author
        }),
        description: (!description.trim().is_empty()).then_some(description),
        color: STREAM_ENDED,
        footer: Some("Stream ended".to_string()),
        timestamp: Some(now),
        ..Default::default()
    }
}

fn html_entity() -> &'static Regex {
    static ENTITY: OnceLock<Regex> = OnceLock::new();
    ENTITY.get_or_init(|| Regex::new(r"&(#[0-9]+|#[xX][0-9a-fA-F]+|amp|lt|gt|quot|apos);").unwrap())
}

/// Twitter returns tweet text HTML-escaped.
pub fn unescape_html(text: &str) -> String {
    html_entity()
        .replace_all(text, |caps: &Captures| {
            let entity = &caps[1];
            let decoded = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                _ => {
                    let code = entity.trim_start_matches('#');
                    let value = match code.strip_prefix(|c: char| c == 'x' || c == 'X') {
                        Some(hex) => u32::from_str_radix(hex, 16).ok(),
                        None => code.parse::<u32>().ok(),
                    };
                    value.and_then(char::from_u32)
                }
            };
            decoded
                .map(String::from)
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

pub fn post_action(tweet: &Tweet) -> String {
    let reference = tweet
        .referenced_author
        .as_ref()
        .map(|u| u.username.as_str())
        .unwrap_or("unknown");
    match tweet.kind {
        PostKind::Post => "posted a new Tweet".to_string(),
        PostKind::Retweet => "retweeted \u{1F501}".to_string(),
        PostKind::Reply => format!("replied to a Tweet from **@{}** \u{1F4AC}", reference),
        PostKind::Quote => format!("quoted a Tweet from **@{}** \u{1F5E8}", reference),
    }
}

fn post_url(user: &TwitterUser, tweet: &Tweet) -> String {
    format!("https://twitter.com/{}/status/{}", user.username, tweet.id)
}

/// Full notification for a post. `outdated` posts keep their mention text
/// but never ping the role.
pub fn post_message(
    user: &TwitterUser,
    tweet: &Tweet,
    mention: Option<&Mention>,
    outdated: bool,
) -> OutgoingMessage {
    let prefix = mention.map(Mention::render).unwrap_or_default();
    let content = format!(
        "{}**@{}** {} <t:{}:R>: {}",
        prefix,
        user.username,
        post_action(tweet),
        tweet.created_at.timestamp(),
        post_url(user, tweet)
    );

    let mut footer = String::new();
    match tweet.media.first().map(|m| m.kind) {
        Some(MediaKind::Video | MediaKind::Gif) => {
            footer.push_str("(Open on Twitter to view video)\n");
        }
        Some(MediaKind::Photo) if tweet.media.len() > 1 => {
            footer.push_str(&format!(
                "(Open on Twitter to view {} images)\n",
                tweet.media.len()
            ));
        }
        _ => {}
    }
    if outdated && mention.is_some() {
        footer.push_str("Skipping ping for old Tweet.\n");
    }

    let author = match (tweet.kind, &tweet.referenced_author) {
        (PostKind::Retweet, Some(original)) => original,
        _ => user,
    };

    let embed = EmbedSpec {
        author: Some(EmbedAuthor {
            name: format!("{} (@{})", author.name, author.username),
            url: Some(author.url()),
            icon_url: author.profile_image_url.clone(),
        }),
        description: Some(unescape_html(&tweet.text)),
        color: mention.and_then(|m| m.embed_color).unwrap_or(TWITTER_BLUE),
        image: tweet
            .media
            .iter()
            .find_map(|m| m.url.clone())
            .or_else(|| tweet.fallback_image.clone()),
        footer: (!footer.trim().is_empty()).then(|| footer.trim_end().to_string()),
        ..Default::default()
    };

    OutgoingMessage {
        content: Some(content),
        embed: Some(embed),
    }
}

/// Sent instead of the post to channels that are not age-restricted.
pub fn sensitive_notice(user: &TwitterUser, tweet: &Tweet) -> OutgoingMessage {
    OutgoingMessage {
        content: None,
        embed: Some(EmbedSpec {
            description: Some(format!(
                "[**@{}**]({}) {} which may contain sensitive content.",
                user.username,
                user.url(),
                post_action(tweet)
            )),
            color: TWITTER_BLUE,
            ..Default::default()
        }),
    }
}
