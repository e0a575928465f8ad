use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::TrackerContext;
use crate::dispatch::DispatchReport;
use crate::error::PlatformError;
use crate::model::{Platform, Target};
use crate::platforms::twitter::{Timeline, TimelineQuery, TwitterApi};
use crate::registry::FeedScope;
use crate::scheduler::{Checker, PassReport};

pub struct TwitterChecker {
    ctx: TrackerContext,
    api: Arc<dyn TwitterApi>,
    repeat: Duration,
    feed_timeout: Duration,
    max_age: Duration,
}

impl TwitterChecker {
    pub fn new(
        ctx: TrackerContext,
        api: Arc<dyn TwitterApi>,
        repeat: Duration,
        feed_timeout: Duration,
        max_age: Duration,
    ) -> Self {
        Self {
            ctx,
            api,
            repeat,
            feed_timeout,
            max_age,
        }
    }

    /// Only asks for retweets/replies when some target displays them.
    async fn query_for(&self, scope: &FeedScope, targets: &[Target]) -> Result<TimelineQuery> {
        let mut query = TimelineQuery {
            since_id: scope.feed.cursor_id(),
            ..Default::default()
        };
        for target in targets {
            let posts = scope.features().features_for(target).await?.posts;
            query.include_retweets |= posts.display_retweets;
            query.include_replies |= posts.display_replies;
        }
        Ok(query)
    }

    /// Notifies new posts oldest-first and advances the cursor. Returns the
    /// newest post id in the timeline.
    async fn notify_timeline(
        &self,
        scope: &mut FeedScope,
        targets: &[Target],
        timeline: Timeline,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        scope.refresh_name(&timeline.user.username).await?;

        let feed_id = scope.feed.id;
        let cursor = scope.feed.cursor_id().unwrap_or(0);
        let mut latest = cursor;
        let mut report = DispatchReport::default();

        let mut tweets = timeline.tweets;
        tweets.sort_by_key(|t| t.id);
        for tweet in &tweets {
            latest = latest.max(tweet.id);

            let age = now
                .signed_duration_since(tweet.created_at)
                .to_std()
                .unwrap_or_default();
            let seen = tweet.id.to_string();
            // already handled or too old: skip, the cursor still moves past it
            if tweet.id <= cursor || age > self.max_age || self.ctx.registry.is_seen(feed_id, &seen) {
                continue;
            }

            report.merge(
                self.ctx
                    .dispatcher
                    .post(scope, targets, &timeline.user, tweet, now)
                    .await,
            );
            // a post cut short by the feed timeout stays unseen; the ledger dedups it next pass
            self.ctx.registry.mark_seen(feed_id, &seen);
        }

        if latest > cursor {
            scope.set_cursor(&latest.to_string()).await?;
        }
        if report.sent > 0 || report.failed > 0 {
            debug!(
                "[TWITTER] @{}: {} sent, {} failed",
                timeline.user.username, report.sent, report.failed
            );
        }
        Ok(latest)
    }
}

#[async_trait]
impl Checker for TwitterChecker {
    fn name(&self) -> &'static str {
        "TWITTER"
    }

    fn min_interval(&self) -> Duration {
        self.repeat
    }

    async fn run_pass(&self) -> Result<PassReport> {
        let mut report = PassReport::default();
        let feeds = self.ctx.registry.feeds(Platform::Twitter).await?;

        // feeds whose since_id fell out of the queryable range
        let mut stale = Vec::new();
        let mut newest_seen = 0u64;

        for feed in feeds {
            let mut scope = self.ctx.registry.scope(feed);
            let targets = match self.ctx.active_targets(&scope).await {
                Ok(Some(targets)) if !targets.is_empty() => targets,
                Ok(_) => continue,
                Err(e) => {
                    warn!("[TWITTER] Error resolving targets for '{}': {:#}", scope.feed.label(), e);
                    report.failed += 1;
                    continue;
                }
            };

            let query = match self.query_for(&scope, &targets).await {
                Ok(query) => query,
                Err(e) => {
                    warn!("[TWITTER] Error reading settings for '{}': {:#}", scope.feed.label(), e);
                    report.failed += 1;
                    continue;
                }
            };
            let timeline = match self.api.recent_posts(&scope.feed.external_id, query).await {
                Ok(timeline) => timeline,
                Err(PlatformError::StaleCursor) => {
                    info!(
                        "[TWITTER] Twitter feed '{}' is far out of date and the since_id query was rejected",
                        scope.feed.external_id
                    );
                    stale.push(scope);
                    continue;
                }
                Err(PlatformError::RateLimited { reset_after }) => {
                    warn!("[TWITTER] Twitter rate limit reached: pausing {}s", reset_after.as_secs());
                    report.rate_limited = Some(reset_after);
                    break;
                }
                Err(PlatformError::NotFound) => {
                    info!("[TWITTER] Twitter user {} no longer exists, untracking", scope.feed.external_id);
                    if let Err(e) = self.ctx.registry.untrack_feed(&scope.feed).await {
                        warn!("[TWITTER] Error untracking '{}': {:#}", scope.feed.label(), e);
                        report.failed += 1;
                    }
                    continue;
                }
                Err(PlatformError::Unauthorized) => bail!("Twitter rejected the bearer token"),
                Err(PlatformError::Transient(e)) => {
                    warn!("[TWITTER] Error in Twitter call for {}: {}", scope.feed.external_id, e);
                    report.failed += 1;
                    continue;
                }
            };

            let now = Utc::now();
            let notified = tokio::time::timeout(
                self.feed_timeout,
                self.notify_timeline(&mut scope, &targets, timeline, now),
            )
            .await;
            match notified {
                Ok(Ok(latest)) => {
                    newest_seen = newest_seen.max(latest);
                    report.processed += 1;
                }
                Ok(Err(e)) => {
                    warn!("[TWITTER] Error notifying '{}': {:#}", scope.feed.label(), e);
                    report.failed += 1;
                }
                Err(_) => {
                    warn!("[TWITTER] Notifying '{}' timed out", scope.feed.label());
                    report.failed += 1;
                }
            }
        }

        if newest_seen > 0 {
            for mut scope in stale {
                if let Err(e) = scope.set_cursor(&newest_seen.to_string()).await {
                    warn!("[TWITTER] Error fast-forwarding '{}': {:#}", scope.feed.label(), e);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}
