use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::OnceCell;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::TrackerContext;
use crate::delivery::EmbedAuthor;
use crate::dispatch::LiveEvent;
use crate::embeds;
use crate::error::PlatformError;
use crate::model::{Feed, Platform};
use crate::platforms::twitch::{TwitchApi, TwitchStream, TwitchUser};
use crate::scheduler::{Checker, PassReport};

type UserLookup = Result<TwitchUser, PlatformError>;

/// Fetch-on-first-use user lookup, scoped to one feed task. Live feeds arrive
/// with the user already taken from the pass-wide bulk lookup.
struct UserMemo {
    api: Arc<dyn TwitchApi>,
    user_id: String,
    cell: OnceCell<UserLookup>,
}

impl UserMemo {
    fn new(api: Arc<dyn TwitchApi>, user_id: &str, prefetched: Option<UserLookup>) -> Self {
        Self {
            api,
            user_id: user_id.to_string(),
            cell: OnceCell::new_with(prefetched),
        }
    }

    async fn get(&self) -> &UserLookup {
        self.cell
            .get_or_init(|| async { self.api.get_user(&self.user_id).await })
            .await
    }
}

pub struct TwitchChecker {
    ctx: TrackerContext,
    api: Arc<dyn TwitchApi>,
    repeat: Duration,
    feed_timeout: Duration,
}

impl TwitchChecker {
    pub fn new(
        ctx: TrackerContext,
        api: Arc<dyn TwitchApi>,
        repeat: Duration,
        feed_timeout: Duration,
    ) -> Self {
        Self {
            ctx,
            api,
            repeat,
            feed_timeout,
        }
    }
}

/// Handles one feed after the bulk fetch. Returns `Ok(false)` when the feed
/// turned out to be gone and was untracked.
async fn update_feed(
    ctx: TrackerContext,
    api: Arc<dyn TwitchApi>,
    feed: Feed,
    stream: Option<TwitchStream>,
    prefetched: Option<UserLookup>,
) -> Result<bool> {
    let mut scope = ctx.registry.scope(feed);
    let Some(targets) = ctx.active_targets(&scope).await? else {
        return Ok(false);
    };
    let user = UserMemo::new(api, &scope.feed.external_id, prefetched);
    let now = Utc::now();

    let Some(stream) = stream else {
        // Offline: only feeds with outstanding notifications need any work.
        let ledger = scope.ledger();
        if ledger.all().await?.is_empty() {
            ledger.end_session().await?;
            return Ok(true);
        }

        let author = match user.get().await {
            Ok(user) => embeds::twitch_author(user),
            Err(PlatformError::NotFound) => {
                info!("[TWITCH] Invalid Twitch user: {}. Untracking user...", scope.feed.external_id);
                ctx.registry.untrack_feed(&scope.feed).await?;
                return Ok(false);
            }
            Err(e) => {
                warn!("[TWITCH] Error getting Twitch user {}: {}", scope.feed.external_id, e);
                EmbedAuthor {
                    name: scope.feed.label().to_string(),
                    ..Default::default()
                }
            }
        };

        let report = ctx.dispatcher.stream_ended(&scope, &author, now).await?;
        info!(
            "[TWITCH] Stream ended for '{}': {} summarized, {} removed",
            scope.feed.label(),
            report.edited,
            report.deleted
        );
        return Ok(true);
    };

    let changed = scope
        .ledger()
        .observe_live(stream.started_at, stream.viewer_count, &stream.title, &stream.game_name)
        .await?;
    if targets.is_empty() {
        return Ok(true);
    }

    let user = match user.get().await {
        Ok(user) => user,
        Err(PlatformError::NotFound) => {
            info!("[TWITCH] Invalid Twitch user: {}. Untracking user...", scope.feed.external_id);
            ctx.registry.untrack_feed(&scope.feed).await?;
            return Ok(false);
        }
        Err(e) => {
            error!("[TWITCH] Error getting Twitch user {}: {}", scope.feed.external_id, e);
            return Ok(true);
        }
    };
    scope.refresh_name(&user.display_name).await?;

    let report = ctx
        .dispatcher
        .stream_live(
            &scope,
            &targets,
            LiveEvent {
                user,
                stream: &stream,
                changed,
            },
            now,
        )
        .await;
    debug!(
        "[TWITCH] '{}' live: {} sent, {} edited, {} failed",
        scope.feed.label(),
        report.sent,
        report.edited,
        report.failed
    );
    Ok(true)
}

#[async_trait]
impl Checker for TwitchChecker {
    fn name(&self) -> &'static str {
        "TWITCH"
    }

    fn min_interval(&self) -> Duration {
        self.repeat
    }

    async fn run_pass(&self) -> Result<PassReport> {
        let mut report = PassReport::default();
        let feeds = self.ctx.registry.feeds(Platform::Twitch).await?;
        if feeds.is_empty() {
            return Ok(report);
        }

        let ids: Vec<String> = feeds.iter().map(|f| f.external_id.clone()).collect();
        let mut batch = match self.api.fetch_streams(&ids).await {
            Ok(batch) => batch,
            Err(PlatformError::RateLimited { reset_after }) => {
                warn!("[TWITCH] Rate limit reached, pausing for {}s", reset_after.as_secs());
                report.rate_limited = Some(reset_after);
                return Ok(report);
            }
            Err(e) => return Err(anyhow!("bulk stream fetch failed: {}", e)),
        };

        let mut updates = Vec::with_capacity(feeds.len());
        for feed in feeds {
            match batch.remove(&feed.external_id) {
                Some(Ok(stream)) => updates.push((feed, stream)),
                Some(Err(e)) => {
                    warn!("[TWITCH] Error contacting Twitch :: {}: {}", feed.external_id, e);
                    report.failed += 1;
                }
                None => {
                    warn!("[TWITCH] No result for {}", feed.external_id);
                    report.failed += 1;
                }
            }
        }

        // One spaced call for every live user, so feed tasks never queue on the spacer.
        let live_ids: Vec<String> = updates
            .iter()
            .filter(|(_, stream)| stream.is_some())
            .map(|(feed, _)| feed.external_id.clone())
            .collect();
        let users: Option<HashMap<String, TwitchUser>> = if live_ids.is_empty() {
            None
        } else {
            match self.api.fetch_users(&live_ids).await {
                Ok(users) => Some(users),
                Err(PlatformError::RateLimited { reset_after }) => {
                    warn!("[TWITCH] Rate limit reached, pausing for {}s", reset_after.as_secs());
                    report.rate_limited = Some(reset_after);
                    return Ok(report);
                }
                Err(e) => {
                    warn!("[TWITCH] Bulk user lookup failed, falling back to single lookups: {}", e);
                    None
                }
            }
        };

        let mut tasks = JoinSet::new();
        for (feed, stream) in updates {
            let prefetched = match (&users, &stream) {
                (Some(users), Some(_)) => Some(
                    users
                        .get(&feed.external_id)
                        .cloned()
                        .ok_or(PlatformError::NotFound),
                ),
                _ => None,
            };

            let ctx = self.ctx.clone();
            let api = self.api.clone();
            let limit = self.feed_timeout;
            tasks.spawn(async move {
                let id = feed.external_id.clone();
                let update = update_feed(ctx, api, feed, stream, prefetched);
                let outcome = tokio::time::timeout(limit, update).await;
                (id, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(Ok(_)))) => report.processed += 1,
                Ok((id, Ok(Err(e)))) => {
                    warn!("[TWITCH] Error updating Twitch channel {}: {:#}", id, e);
                    report.failed += 1;
                }
                Ok((id, Err(_))) => {
                    warn!("[TWITCH] Updating Twitch channel {} timed out", id);
                    report.failed += 1;
                }
                Err(e) => {
                    error!("[TWITCH] Feed task failed: {}", e);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}
