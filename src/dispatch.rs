//! NotificationDispatcher: turns one observed upstream event into sends,
//! edits and deletes across a feed's targets.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::delivery::{with_timeout, ChatDelivery, EmbedAuthor, OutgoingMessage};
use crate::embeds;
use crate::error::DeliveryError;
use crate::mention::{resolve_mention, Mention, MentionPolicy};
use crate::model::{LiveSession, MessageRef, NotificationRecord, StreamSettings, Target};
use crate::platforms::twitch::{TwitchStream, TwitchUser};
use crate::platforms::twitter::{Tweet, TwitterUser};
use crate::registry::FeedScope;

/// Streams that started longer ago than this never ping.
const STREAM_MENTION_WINDOW: Duration = Duration::from_secs(15 * 60);
/// Posts older than this keep their mention text but skip the role ping.
const POST_PING_WINDOW: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent: usize,
    pub edited: usize,
    pub deleted: usize,
    pub skipped: usize,
    /// Targets removed because the bot lost send permission.
    pub disabled: usize,
    pub failed: usize,
}

impl DispatchReport {
    pub fn merge(&mut self, other: DispatchReport) {
        self.sent += other.sent;
        self.edited += other.edited;
        self.deleted += other.deleted;
        self.skipped += other.skipped;
        self.disabled += other.disabled;
        self.failed += other.failed;
    }
}

/// The upstream stream is live.
pub struct LiveEvent<'a> {
    pub user: &'a TwitchUser,
    pub stream: &'a TwitchStream,
    /// Title or game changed since the previous pass.
    pub changed: bool,
}

/// One message to send and record against `event_id`.
struct PendingSend {
    feed_id: i64,
    target_id: i64,
    channel_id: u64,
    event_id: String,
    message: OutgoingMessage,
    /// Mention config stamped with the ping time once the message is out.
    ping: Option<(i64, DateTime<Utc>)>,
}

impl PendingSend {
    fn new(scope: &FeedScope, target: &Target, event_id: &str, message: OutgoingMessage) -> Self {
        Self {
            feed_id: scope.feed.id,
            target_id: target.id,
            channel_id: target.channel_id,
            event_id: event_id.to_string(),
            message,
            ping: None,
        }
    }

    fn pinging(mut self, mention: Option<&Mention>, now: DateTime<Utc>) -> Self {
        self.ping = mention
            .filter(|m| m.pings_role())
            .map(|m| (m.config_id, now));
        self
    }
}

fn age(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    now.signed_duration_since(at).to_std().unwrap_or_default()
}

pub struct NotificationDispatcher {
    delivery: Arc<dyn ChatDelivery>,
    call_timeout: Duration,
    mention_cooldown: Duration,
}

impl NotificationDispatcher {
    pub fn new(
        delivery: Arc<dyn ChatDelivery>,
        call_timeout: Duration,
        mention_cooldown: Duration,
    ) -> Self {
        Self {
            delivery,
            call_timeout,
            mention_cooldown,
        }
    }

    /// Missing send permission: switch the feature off for the channel and
    /// drop the target. The feed itself stays tracked.
    async fn disable_target(&self, scope: &FeedScope, target: &Target) -> Result<()> {
        let platform = scope.feed.platform;
        warn!(
            "{} Unable to send notification for '{}' to channel {}. Disabling feature in channel.",
            platform.tag(),
            scope.feed.label(),
            target.channel_id
        );
        if let Some(guild_id) = target.guild_id {
            scope
                .features()
                .set_tracking_enabled(guild_id, target.channel_id, platform, false)
                .await?;
        }
        scope.delete_target(target).await
    }

    /// Sends and records on a task of its own: once a send starts, its ledger
    /// row is written even if the calling feed task is dropped.
    async fn deliver(
        &self,
        scope: &FeedScope,
        pending: PendingSend,
    ) -> Result<Result<MessageRef, DeliveryError>> {
        let delivery = self.delivery.clone();
        let store = scope.store_handle();
        let call_timeout = self.call_timeout;

        let task = tokio::spawn(async move {
            let sent = with_timeout(
                call_timeout,
                delivery.send_message(pending.channel_id, &pending.message),
            )
            .await;
            let message = match sent {
                Ok(message) => message,
                Err(e) => return Ok(Err(e)),
            };
            store
                .create_notification(pending.feed_id, pending.target_id, &pending.event_id, message)
                .await?;
            if let Some((mention_id, at)) = pending.ping {
                store.touch_mention(mention_id, at).await?;
            }
            Ok::<_, anyhow::Error>(Ok(message))
        });
        task.await?
    }

    /// Returns the sent message when delivery succeeded.
    async fn after_send(
        &self,
        scope: &FeedScope,
        target: &Target,
        result: Result<MessageRef, DeliveryError>,
        report: &mut DispatchReport,
    ) -> Result<Option<MessageRef>> {
        match result {
            Ok(message) => {
                report.sent += 1;
                return Ok(Some(message));
            }
            Err(DeliveryError::Forbidden) => {
                self.disable_target(scope, target).await?;
                report.disabled += 1;
            }
            Err(e) => {
                warn!(
                    "{} Error sending notification for '{}' to channel {}: {}",
                    scope.feed.platform.tag(),
                    scope.feed.label(),
                    target.channel_id,
                    e
                );
                report.failed += 1;
            }
        }
        Ok(None)
    }

    async fn pin(&self, scope: &FeedScope, message: MessageRef, pin: bool) {
        let result = if pin {
            with_timeout(self.call_timeout, self.delivery.pin_message(message)).await
        } else {
            with_timeout(self.call_timeout, self.delivery.unpin_message(message)).await
        };
        if let Err(e) = result {
            debug!(
                "{} Could not {} notification {}: {}",
                scope.feed.platform.tag(),
                if pin { "pin" } else { "unpin" },
                message.message_id,
                e
            );
        }
    }

    /// Crossposts the message when it landed in an announcement channel.
    async fn publish(&self, scope: &FeedScope, message: MessageRef) {
        let channel =
            with_timeout(self.call_timeout, self.delivery.fetch_channel(message.channel_id)).await;
        let published = match channel {
            Ok(channel) if channel.announcement => {
                with_timeout(self.call_timeout, self.delivery.crosspost_message(message)).await
            }
            Ok(_) => return,
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            debug!(
                "{} Could not publish notification {}: {}",
                scope.feed.platform.tag(),
                message.message_id,
                e
            );
        }
    }

    /// Renames a channel after the live state of its tracked streams changed.
    async fn sync_channel_name(
        &self,
        scope: &FeedScope,
        channel_id: u64,
        settings: &StreamSettings,
    ) -> Result<()> {
        let live = scope.store().live_feeds_in_channel(channel_id).await?;
        let labels: Vec<&str> = live.iter().map(|feed| feed.label()).collect();
        let name = embeds::channel_name(&labels, settings.offline_channel_name.as_deref());

        match with_timeout(self.call_timeout, self.delivery.fetch_channel(channel_id)).await {
            Ok(channel) if channel.name == name => return Ok(()),
            Ok(_) => {}
            Err(e) => {
                debug!("{} Could not look up channel {}: {}", scope.feed.platform.tag(), channel_id, e);
                return Ok(());
            }
        }

        match with_timeout(self.call_timeout, self.delivery.rename_channel(channel_id, &name)).await {
            Ok(()) => info!(
                "{} Renamed channel {} to '{}'",
                scope.feed.platform.tag(),
                channel_id,
                name
            ),
            Err(e) => warn!(
                "{} Unable to rename channel {}: {}",
                scope.feed.platform.tag(),
                channel_id,
                e
            ),
        }
        Ok(())
    }

    async fn live_for_target(
        &self,
        scope: &FeedScope,
        target: &Target,
        event: &LiveEvent<'_>,
        now: DateTime<Utc>,
        report: &mut DispatchReport,
    ) -> Result<()> {
        let settings = scope.features().features_for(target).await?.streams;
        let embed = embeds::live_stream(event.user, event.stream, &settings, now);

        match scope.ledger().active_for(target).await? {
            None => {
                let policy = MentionPolicy {
                    enabled: settings.mention_roles
                        && !target.is_dm()
                        && age(event.stream.started_at, now) <= STREAM_MENTION_WINDOW,
                    cooldown: Some(self.mention_cooldown),
                    suppress_role: false,
                };
                let mention = resolve_mention(
                    scope,
                    self.delivery.as_ref(),
                    self.call_timeout,
                    target,
                    policy,
                    now,
                )
                .await?;

                let message = OutgoingMessage {
                    content: mention
                        .as_ref()
                        .map(Mention::render)
                        .filter(|c| !c.is_empty()),
                    embed: Some(embed),
                };
                let pending = PendingSend::new(scope, target, &event.stream.id, message)
                    .pinging(mention.as_ref(), now);
                let result = self.deliver(scope, pending).await?;
                let Some(sent) = self.after_send(scope, target, result, report).await? else {
                    return Ok(());
                };

                if settings.pin_active {
                    self.pin(scope, sent, true).await;
                }
                if settings.publish {
                    self.publish(scope, sent).await;
                }
                if settings.rename_channel && !target.is_dm() {
                    self.sync_channel_name(scope, target.channel_id, &settings).await?;
                }
                Ok(())
            }
            Some(record) if record.deleted || !event.changed => {
                report.skipped += 1;
                Ok(())
            }
            Some(record) => {
                let message = OutgoingMessage {
                    content: None,
                    embed: Some(embed),
                };
                let edited = with_timeout(
                    self.call_timeout,
                    self.delivery.edit_message(record.message, &message),
                )
                .await;
                self.settle_edit(scope, &record, edited, report).await
            }
        }
    }

    async fn settle_edit(
        &self,
        scope: &FeedScope,
        record: &NotificationRecord,
        result: Result<(), DeliveryError>,
        report: &mut DispatchReport,
    ) -> Result<()> {
        match result {
            Ok(()) => report.edited += 1,
            Err(DeliveryError::NotFound | DeliveryError::Forbidden) => {
                debug!(
                    "{} Notification {} for '{}' is gone, marking deleted",
                    scope.feed.platform.tag(),
                    record.message.message_id,
                    scope.feed.label()
                );
                scope.ledger().mark_deleted(record).await?;
                report.failed += 1;
            }
            Err(e) => {
                warn!(
                    "{} Could not edit notification {}: {}",
                    scope.feed.platform.tag(),
                    record.message.message_id,
                    e
                );
                report.failed += 1;
            }
        }
        Ok(())
    }

    /// Posts or refreshes the live notification in every target.
    pub async fn stream_live(
        &self,
        scope: &FeedScope,
        targets: &[Target],
        event: LiveEvent<'_>,
        now: DateTime<Utc>,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        for target in targets {
            if let Err(e) = self
                .live_for_target(scope, target, &event, now, &mut report)
                .await
            {
                warn!(
                    "{} Error updating target {} for '{}': {:#}",
                    scope.feed.platform.tag(),
                    target.channel_id,
                    scope.feed.label(),
                    e
                );
                report.failed += 1;
            }
        }
        report
    }

    async fn end_record(
        &self,
        scope: &FeedScope,
        record: &NotificationRecord,
        settings: &StreamSettings,
        summary: Option<(&EmbedAuthor, &LiveSession)>,
        now: DateTime<Utc>,
        report: &mut DispatchReport,
    ) {
        if record.deleted {
            return;
        }

        match summary {
            Some((author, session)) if settings.summaries => {
                let message = OutgoingMessage {
                    content: None,
                    embed: Some(embeds::stream_summary(author.clone(), session, settings, now)),
                };
                let edited = with_timeout(
                    self.call_timeout,
                    self.delivery.edit_message(record.message, &message),
                )
                .await;
                match edited {
                    Ok(()) => {
                        report.edited += 1;
                        if settings.pin_active {
                            self.pin(scope, record.message, false).await;
                        }
                    }
                    Err(e) => {
                        debug!("{} Summary edit failed: {}", scope.feed.platform.tag(), e);
                        report.failed += 1;
                    }
                }
            }
            _ => {
                let removed =
                    with_timeout(self.call_timeout, self.delivery.delete_message(record.message))
                        .await;
                match removed {
                    Ok(()) => report.deleted += 1,
                    Err(e) => {
                        debug!("{} Notification delete failed: {}", scope.feed.platform.tag(), e);
                        report.failed += 1;
                    }
                }
            }
        }
    }

    /// Finalizes every notification of an ended stream and closes its session.
    ///
    /// Without session statistics nothing can be summarized, so messages are
    /// removed outright.
    pub async fn stream_ended(
        &self,
        scope: &FeedScope,
        author: &EmbedAuthor,
        now: DateTime<Utc>,
    ) -> Result<DispatchReport> {
        let mut report = DispatchReport::default();
        let ledger = scope.ledger();
        let records = ledger.all().await?;
        if records.is_empty() {
            ledger.end_session().await?;
            return Ok(report);
        }

        let session = ledger.session().await?;
        if session.is_none() {
            info!(
                "{} Abandoning {} notification(s) for '{}', stream statistics are missing",
                scope.feed.platform.tag(),
                records.len(),
                scope.feed.label()
            );
        }
        let targets = scope.targets().await?;
        let mut renames: Vec<(u64, StreamSettings)> = Vec::new();

        for record in &records {
            let target = targets.iter().find(|t| t.id == record.target_id);
            let settings = match target {
                Some(target) => match scope.features().features_for(target).await {
                    Ok(features) => features.streams,
                    Err(e) => {
                        warn!(
                            "{} Error reading settings for channel {}: {:#}",
                            scope.feed.platform.tag(),
                            record.message.channel_id,
                            e
                        );
                        StreamSettings::default()
                    }
                },
                None => StreamSettings::default(),
            };

            let summary = session.as_ref().map(|s| (author, s));
            self.end_record(scope, record, &settings, summary, now, &mut report)
                .await;
            ledger.remove(record).await?;

            let renamed = target.is_some_and(|t| !t.is_dm()) && settings.rename_channel;
            if renamed && !renames.iter().any(|(c, _)| *c == record.message.channel_id) {
                renames.push((record.message.channel_id, settings));
            }
        }

        ledger.end_session().await?;

        for (channel_id, settings) in renames {
            if let Err(e) = self.sync_channel_name(scope, channel_id, &settings).await {
                warn!(
                    "{} Error renaming channel {}: {:#}",
                    scope.feed.platform.tag(),
                    channel_id,
                    e
                );
            }
        }
        Ok(report)
    }

    async fn post_for_target(
        &self,
        scope: &FeedScope,
        target: &Target,
        user: &TwitterUser,
        tweet: &Tweet,
        now: DateTime<Utc>,
        report: &mut DispatchReport,
    ) -> Result<()> {
        let event_id = tweet.id.to_string();
        if scope.ledger().handled(target, &event_id).await? {
            report.skipped += 1;
            return Ok(());
        }

        let settings = scope.features().features_for(target).await?.posts;
        let has_media = tweet.media.iter().any(|m| m.url.is_some());
        if !settings.displays(tweet.kind) || (settings.media_only && !has_media) {
            report.skipped += 1;
            return Ok(());
        }

        if tweet.sensitive && !target.is_dm() {
            let nsfw = with_timeout(self.call_timeout, self.delivery.fetch_channel(target.channel_id))
                .await
                .map(|channel| channel.nsfw)
                .unwrap_or(false);
            if !nsfw {
                let notice = embeds::sensitive_notice(user, tweet);
                let pending = PendingSend::new(scope, target, &event_id, notice);
                let result = self.deliver(scope, pending).await?;
                if let Some(sent) = self.after_send(scope, target, result, report).await? {
                    if settings.publish {
                        self.publish(scope, sent).await;
                    }
                }
                return Ok(());
            }
        }

        let outdated = age(tweet.created_at, now) > POST_PING_WINDOW;
        let policy = MentionPolicy {
            enabled: settings.mentions(tweet.kind),
            cooldown: None,
            suppress_role: outdated,
        };
        let mention = resolve_mention(
            scope,
            self.delivery.as_ref(),
            self.call_timeout,
            target,
            policy,
            now,
        )
        .await?;

        let message = embeds::post_message(user, tweet, mention.as_ref(), outdated);
        let pending =
            PendingSend::new(scope, target, &event_id, message).pinging(mention.as_ref(), now);
        let result = self.deliver(scope, pending).await?;
        if let Some(sent) = self.after_send(scope, target, result, report).await? {
            if settings.publish {
                self.publish(scope, sent).await;
            }
        }
        Ok(())
    }

    /// Delivers one new post to every target that wants it.
    pub async fn post(
        &self,
        scope: &FeedScope,
        targets: &[Target],
        user: &TwitterUser,
        tweet: &Tweet,
        now: DateTime<Utc>,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        for target in targets {
            if let Err(e) = self
                .post_for_target(scope, target, user, tweet, now, &mut report)
                .await
            {
                warn!(
                    "{} Error sending post {} to channel {}: {:#}",
                    scope.feed.platform.tag(),
                    tweet.id,
                    target.channel_id,
                    e
                );
                report.failed += 1;
            }
        }
        report
    }
}
