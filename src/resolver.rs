use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::delivery::{with_timeout, ChatDelivery};
use crate::error::DeliveryError;
use crate::model::Target;
use crate::registry::FeedScope;

/// Computes the targets a feed should currently notify.
pub struct TargetResolver {
    delivery: Arc<dyn ChatDelivery>,
    call_timeout: Duration,
}

impl TargetResolver {
    pub fn new(delivery: Arc<dyn ChatDelivery>, call_timeout: Duration) -> Self {
        Self {
            delivery,
            call_timeout,
        }
    }

    /// Returns `None` only when the feed has no targets left at all, in which
    /// case the caller untracks it. `Some(vec![])` means nothing to notify right
    /// now but the feed stays tracked.
    pub async fn resolve(&self, scope: &FeedScope) -> Result<Option<Vec<Target>>> {
        let feed = &scope.feed;
        let targets = scope.targets().await?;
        if targets.is_empty() {
            return Ok(None);
        }

        let total = targets.len();
        let mut deleted = 0;
        let mut existing = Vec::with_capacity(total);
        for target in targets {
            // DM channels are not checked
            if target.is_dm() {
                existing.push(target);
                continue;
            }

            let lookup = with_timeout(
                self.call_timeout,
                self.delivery.fetch_channel(target.channel_id),
            )
            .await;

            match lookup {
                Ok(_) => existing.push(target),
                // The bot itself is failing; never mass-untrack on this.
                Err(DeliveryError::Unauthorized) => {
                    warn!(
                        "{} Discord rejected our token while resolving '{}', skipping feed",
                        feed.platform.tag(),
                        feed.label()
                    );
                    return Ok(Some(Vec::new()));
                }
                Err(DeliveryError::NotFound) => {
                    info!(
                        "{} Untracking feed '{}' in {} as the channel seems to be deleted.",
                        feed.platform.tag(),
                        feed.label(),
                        target.channel_id
                    );
                    scope.delete_target(&target).await?;
                    deleted += 1;
                }
                Err(e) => {
                    warn!(
                        "{} Could not check channel {} for feed '{}': {}",
                        feed.platform.tag(),
                        target.channel_id,
                        feed.label(),
                        e
                    );
                }
            }
        }

        if deleted == total {
            return Ok(None);
        }

        // ignore, but do not untrack, targets with the feature disabled
        let mut active = Vec::with_capacity(existing.len());
        for target in existing {
            if scope
                .features()
                .is_tracking_enabled(&target, feed.platform)
                .await?
            {
                active.push(target);
            }
        }
        Ok(Some(active))
    }
}
