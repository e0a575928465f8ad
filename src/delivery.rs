//! Outbound Discord delivery.
//!
//! Everything the tracker sends goes through [`ChatDelivery`], which reports
//! failures as a [`DeliveryError`] so callers can tell a missing permission
//! from a deleted channel from a network blip.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serenity::all::{
    Channel, ChannelId, ChannelType, CreateEmbed, CreateEmbedAuthor, CreateEmbedFooter,
    CreateMessage, EditChannel, EditMessage, GuildId, MessageId, Timestamp,
};
use serenity::http::Http;

use crate::error::DeliveryError;
use crate::model::MessageRef;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmbedAuthor {
    pub name: String,
    pub url: Option<String>,
    pub icon_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmbedSpec {
    pub author: Option<EmbedAuthor>,
    pub title: Option<String>,
    pub url: Option<String>,
    pub description: Option<String>,
    pub color: u32,
    pub thumbnail: Option<String>,
    pub image: Option<String>,
    pub fields: Vec<(String, String, bool)>,
    pub footer: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// A rendered notification, independent of the Discord library.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub content: Option<String>,
    pub embed: Option<EmbedSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub channel_id: u64,
    pub guild_id: Option<u64>,
    pub name: String,
    pub nsfw: bool,
    /// Announcement channels can publish messages to following servers.
    pub announcement: bool,
}

#[async_trait]
pub trait ChatDelivery: Send + Sync {
    /// Looks the channel up; `NotFound` means it was deleted.
    async fn fetch_channel(&self, channel_id: u64) -> Result<ChannelInfo, DeliveryError>;
    async fn send_message(
        &self,
        channel_id: u64,
        message: &OutgoingMessage,
    ) -> Result<MessageRef, DeliveryError>;
    async fn edit_message(
        &self,
        message_ref: MessageRef,
        message: &OutgoingMessage,
    ) -> Result<(), DeliveryError>;
    async fn delete_message(&self, message_ref: MessageRef) -> Result<(), DeliveryError>;
    async fn pin_message(&self, message_ref: MessageRef) -> Result<(), DeliveryError>;
    async fn unpin_message(&self, message_ref: MessageRef) -> Result<(), DeliveryError>;
    /// Publishes a message sent in an announcement channel.
    async fn crosspost_message(&self, message_ref: MessageRef) -> Result<(), DeliveryError>;
    async fn rename_channel(&self, channel_id: u64, name: &str) -> Result<(), DeliveryError>;
    /// `NotFound` when the role (or its guild) no longer exists.
    async fn verify_role(&self, guild_id: u64, role_id: u64) -> Result<(), DeliveryError>;
}

/// Runs one outbound call with a hard limit; elapsing is a soft `Timeout` failure.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, DeliveryError>
where
    F: Future<Output = Result<T, DeliveryError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(DeliveryError::Timeout),
    }
}

pub fn role_mention(role_id: u64) -> String {
    format!("<@&{}>", role_id)
}

/// [`ChatDelivery`] over serenity's REST client.
#[derive(Clone)]
pub struct DiscordDelivery {
    http: Arc<Http>,
}

impl DiscordDelivery {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

fn classify(e: serenity::Error) -> DeliveryError {
    if let serenity::Error::Http(http) = &e {
        match http.status_code().map(|s| s.as_u16()) {
            Some(401) => return DeliveryError::Unauthorized,
            Some(403) => return DeliveryError::Forbidden,
            Some(404) => return DeliveryError::NotFound,
            _ => {}
        }
    }
    DeliveryError::Transient(e.to_string())
}

fn build_embed(spec: &EmbedSpec) -> CreateEmbed {
    let mut embed = CreateEmbed::new().colour(spec.color);

    if let Some(author) = &spec.author {
        let mut builder = CreateEmbedAuthor::new(&author.name);
        if let Some(url) = &author.url {
            builder = builder.url(url);
        }
        if let Some(icon) = &author.icon_url {
            builder = builder.icon_url(icon);
        }
        embed = embed.author(builder);
    }
    if let Some(title) = &spec.title {
        embed = embed.title(title);
    }
    if let Some(url) = &spec.url {
        embed = embed.url(url);
    }
    if let Some(description) = &spec.description {
        embed = embed.description(description);
    }
    if let Some(thumbnail) = &spec.thumbnail {
        embed = embed.thumbnail(thumbnail);
    }
    if let Some(image) = &spec.image {
        embed = embed.image(image);
    }
    for (name, value, inline) in &spec.fields {
        embed = embed.field(name, value, *inline);
    }
    if let Some(footer) = &spec.footer {
        embed = embed.footer(CreateEmbedFooter::new(footer));
    }
    if let Some(ts) = spec.timestamp {
        if let Ok(ts) = Timestamp::from_unix_timestamp(ts.timestamp()) {
            embed = embed.timestamp(ts);
        }
    }

    embed
}

#[async_trait]
impl ChatDelivery for DiscordDelivery {
    async fn fetch_channel(&self, channel_id: u64) -> Result<ChannelInfo, DeliveryError> {
        let channel = self
            .http
            .get_channel(ChannelId::new(channel_id))
            .await
            .map_err(classify)?;

        let info = match channel {
            Channel::Guild(guild_channel) => ChannelInfo {
                channel_id,
                guild_id: Some(guild_channel.guild_id.get()),
                announcement: guild_channel.kind == ChannelType::News,
                nsfw: guild_channel.nsfw,
                name: guild_channel.name,
            },
            _ => ChannelInfo {
                channel_id,
                guild_id: None,
                name: String::new(),
                nsfw: false,
                announcement: false,
            },
        };
        Ok(info)
    }

    async fn send_message(
        &self,
        channel_id: u64,
        message: &OutgoingMessage,
    ) -> Result<MessageRef, DeliveryError> {
        let mut builder = CreateMessage::new();
        if let Some(content) = &message.content {
            builder = builder.content(content);
        }
        if let Some(embed) = &message.embed {
            builder = builder.embed(build_embed(embed));
        }

        let sent = ChannelId::new(channel_id)
            .send_message(&self.http, builder)
            .await
            .map_err(classify)?;

        Ok(MessageRef {
            channel_id: sent.channel_id.get(),
            message_id: sent.id.get(),
        })
    }

    async fn edit_message(
        &self,
        message_ref: MessageRef,
        message: &OutgoingMessage,
    ) -> Result<(), DeliveryError> {
        let mut builder = EditMessage::new();
        if let Some(content) = &message.content {
            builder = builder.content(content);
        }
        if let Some(embed) = &message.embed {
            builder = builder.embed(build_embed(embed));
        }

        ChannelId::new(message_ref.channel_id)
            .edit_message(&self.http, MessageId::new(message_ref.message_id), builder)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn delete_message(&self, message_ref: MessageRef) -> Result<(), DeliveryError> {
        ChannelId::new(message_ref.channel_id)
            .delete_message(&self.http, MessageId::new(message_ref.message_id))
            .await
            .map_err(classify)
    }

    async fn pin_message(&self, message_ref: MessageRef) -> Result<(), DeliveryError> {
        ChannelId::new(message_ref.channel_id)
            .pin(&self.http, MessageId::new(message_ref.message_id))
            .await
            .map_err(classify)
    }

    async fn unpin_message(&self, message_ref: MessageRef) -> Result<(), DeliveryError> {
        ChannelId::new(message_ref.channel_id)
            .unpin(&self.http, MessageId::new(message_ref.message_id))
            .await
            .map_err(classify)
    }

    async fn crosspost_message(&self, message_ref: MessageRef) -> Result<(), DeliveryError> {
        ChannelId::new(message_ref.channel_id)
            .crosspost(&self.http, MessageId::new(message_ref.message_id))
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn rename_channel(&self, channel_id: u64, name: &str) -> Result<(), DeliveryError> {
        ChannelId::new(channel_id)
            .edit(&self.http, EditChannel::new().name(name))
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn verify_role(&self, guild_id: u64, role_id: u64) -> Result<(), DeliveryError> {
        let roles = self
            .http
            .get_guild_roles(GuildId::new(guild_id))
            .await
            .map_err(classify)?;

        if roles.iter().any(|role| role.id.get() == role_id) {
            Ok(())
        } else {
            Err(DeliveryError::NotFound)
        }
    }
}
