//! Per-platform pass logic driven by the [`PollingScheduler`](crate::scheduler::PollingScheduler).

pub mod twitch;
pub mod twitter;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::dispatch::NotificationDispatcher;
use crate::model::Target;
use crate::registry::{FeedRegistry, FeedScope};
use crate::resolver::TargetResolver;

/// Collaborators shared by every checker and its feed tasks.
#[derive(Clone)]
pub struct TrackerContext {
    pub registry: Arc<FeedRegistry>,
    pub resolver: Arc<TargetResolver>,
    pub dispatcher: Arc<NotificationDispatcher>,
}

impl TrackerContext {
    /// Resolves the feed's targets, untracking the feed when none exist.
    pub async fn active_targets(&self, scope: &FeedScope) -> Result<Option<Vec<Target>>> {
        match self.resolver.resolve(scope).await? {
            Some(targets) => Ok(Some(targets)),
            None => {
                info!(
                    "{} Untracking feed '{}' as it has no targets.",
                    scope.feed.platform.tag(),
                    scope.feed.label()
                );
                self.registry.untrack_feed(&scope.feed).await?;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fixture {
    use std::time::Duration;

    use super::*;
    use crate::testing::{FakeDelivery, MemoryStore};

    pub struct Harness {
        pub store: Arc<MemoryStore>,
        pub delivery: Arc<FakeDelivery>,
        pub ctx: TrackerContext,
    }

    pub fn harness() -> Harness {
        let store = Arc::new(MemoryStore::default());
        let delivery = Arc::new(FakeDelivery::default());
        let timeout = Duration::from_secs(6);
        let ctx = TrackerContext {
            registry: Arc::new(FeedRegistry::new(
                store.clone(),
                store.clone(),
                Duration::from_secs(3600),
                50,
            )),
            resolver: Arc::new(TargetResolver::new(delivery.clone(), timeout)),
            dispatcher: Arc::new(NotificationDispatcher::new(
                delivery.clone(),
                timeout,
                Duration::from_secs(6 * 3600),
            )),
        };
        Harness {
            store,
            delivery,
            ctx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixture::harness;
    use crate::model::Platform;
    use crate::store::TrackerStore;

    #[tokio::test]
    async fn feed_without_targets_is_untracked() {
        let h = harness();
        let feed = h.store.add_feed(Platform::Twitter, "10");
        h.ctx.registry.mark_seen(feed.id, "1");

        let scope = h.ctx.registry.scope(feed.clone());
        assert_eq!(h.ctx.active_targets(&scope).await.unwrap(), None);
        assert!(h.store.find_feed(Platform::Twitter, "10").await.unwrap().is_none());
        assert!(!h.ctx.registry.is_seen(feed.id, "1"));
    }
}
