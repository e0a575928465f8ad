use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::delivery::{role_mention, with_timeout, ChatDelivery};
use crate::error::DeliveryError;
use crate::model::Target;
use crate::registry::FeedScope;

/// What a notification may ping for one target.
#[derive(Debug, Clone, Copy, Default)]
pub struct MentionPolicy {
    /// Channel settings enable mentions for this event kind.
    pub enabled: bool,
    /// Minimum gap between role pings for recurring events.
    pub cooldown: Option<Duration>,
    /// Keep the free text but never ping the role (e.g. stale posts).
    pub suppress_role: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mention {
    pub config_id: i64,
    pub role_id: Option<u64>,
    pub text: Option<String>,
    pub embed_color: Option<u32>,
}

impl Mention {
    /// Message prefix, e.g. `"<@&1> going live "`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(role) = self.role_id {
            out.push_str(&role_mention(role));
            out.push(' ');
        }
        if let Some(text) = &self.text {
            out.push_str(text);
            out.push(' ');
        }
        out
    }

    pub fn pings_role(&self) -> bool {
        self.role_id.is_some()
    }
}

pub async fn resolve_mention(
    scope: &FeedScope,
    delivery: &dyn ChatDelivery,
    call_timeout: Duration,
    target: &Target,
    policy: MentionPolicy,
    now: DateTime<Utc>,
) -> Result<Option<Mention>> {
    if !policy.enabled {
        return Ok(None);
    }
    let store = scope.store();
    let Some(config) = store.mention_for_target(target.id).await? else {
        return Ok(None);
    };

    let mut role_id = None;
    if let (Some(role), Some(guild_id)) = (config.role_id, target.guild_id) {
        match with_timeout(call_timeout, delivery.verify_role(guild_id, role)).await {
            Ok(()) => role_id = Some(role),
            Err(DeliveryError::NotFound) => {
                // role has been deleted upstream
                if config.text.is_some() {
                    info!(
                        "[TRACKER] Mention role {} for channel {} is gone, keeping text",
                        role, target.channel_id
                    );
                    store.clear_mention_role(config.id).await?;
                } else {
                    info!(
                        "[TRACKER] Mention role {} for channel {} is gone, removing mention",
                        role, target.channel_id
                    );
                    store.delete_mention(config.id).await?;
                    return Ok(None);
                }
            }
            Err(e) => {
                warn!("[TRACKER] Could not verify mention role {}: {}", role, e);
            }
        }
    }

    if policy.suppress_role {
        role_id = None;
    }

    if let (Some(cooldown), Some(last)) = (policy.cooldown, config.last_mention) {
        let since = now.signed_duration_since(last).to_std().unwrap_or_default();
        if since < cooldown {
            role_id = None;
        }
    }

    Ok(Some(Mention {
        config_id: config.id,
        role_id,
        text: config.text,
        embed_color: config.embed_color,
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::model::Platform;
    use crate::registry::FeedRegistry;
    use crate::store::TrackerStore;
    use crate::testing::{FakeDelivery, MemoryStore};

    const SIX_HOURS: Duration = Duration::from_secs(6 * 60 * 60);

    struct Fixture {
        store: Arc<MemoryStore>,
        delivery: FakeDelivery,
        scope: FeedScope,
        target: Target,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::default());
        let feed = store.add_feed(Platform::Twitch, "1");
        let target = store.add_target(feed.id, 100, Some(1));
        let registry = FeedRegistry::new(store.clone(), store.clone(), Duration::from_secs(60), 10);
        Fixture {
            scope: registry.scope(feed),
            store,
            delivery: FakeDelivery::default(),
            target,
        }
    }

    fn recurring() -> MentionPolicy {
        MentionPolicy {
            enabled: true,
            cooldown: Some(SIX_HOURS),
            suppress_role: false,
        }
    }

    #[tokio::test]
    async fn recent_ping_suppresses_role_but_keeps_text() {
        let f = fixture();
        let now = Utc::now();
        f.store.add_mention(
            f.target.id,
            Some(55),
            Some("stream time"),
            Some(now - chrono::Duration::hours(2)),
        );
        f.delivery.add_role(1, 55);

        let mention = resolve_mention(&f.scope, &f.delivery, SIX_HOURS, &f.target, recurring(), now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mention.role_id, None);
        assert_eq!(mention.render(), "stream time ");
    }

    #[tokio::test]
    async fn ping_allowed_after_cooldown() {
        let f = fixture();
        let now = Utc::now();
        f.store.add_mention(
            f.target.id,
            Some(55),
            None,
            Some(now - chrono::Duration::hours(7)),
        );
        f.delivery.add_role(1, 55);

        let mention = resolve_mention(&f.scope, &f.delivery, SIX_HOURS, &f.target, recurring(), now)
            .await
            .unwrap()
            .unwrap();
        assert!(mention.pings_role());
        assert_eq!(mention.render(), "<@&55> ");
    }

    #[tokio::test]
    async fn disabled_policy_returns_nothing() {
        let f = fixture();
        f.store.add_mention(f.target.id, Some(55), Some("hi"), None);

        let policy = MentionPolicy::default();
        let mention = resolve_mention(&f.scope, &f.delivery, SIX_HOURS, &f.target, policy, Utc::now())
            .await
            .unwrap();
        assert_eq!(mention, None);
    }

    #[tokio::test]
    async fn deleted_role_with_text_only_clears_role() {
        let f = fixture();
        let config = f.store.add_mention(f.target.id, Some(55), Some("hi"), None);

        let mention = resolve_mention(&f.scope, &f.delivery, SIX_HOURS, &f.target, recurring(), Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mention.role_id, None);
        assert_eq!(mention.text.as_deref(), Some("hi"));

        let stored = f.store.mention_for_target(f.target.id).await.unwrap().unwrap();
        assert_eq!(stored.id, config.id);
        assert_eq!(stored.role_id, None);
        assert_eq!(stored.text.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn deleted_role_without_text_removes_config() {
        let f = fixture();
        f.store.add_mention(f.target.id, Some(55), None, None);

        let mention = resolve_mention(&f.scope, &f.delivery, SIX_HOURS, &f.target, recurring(), Utc::now())
            .await
            .unwrap();
        assert_eq!(mention, None);
        assert!(f.store.mention_for_target(f.target.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn suppressed_role_keeps_text() {
        let f = fixture();
        f.store.add_mention(f.target.id, Some(55), Some("new post"), None);
        f.delivery.add_role(1, 55);

        let policy = MentionPolicy {
            enabled: true,
            cooldown: None,
            suppress_role: true,
        };
        let mention = resolve_mention(&f.scope, &f.delivery, SIX_HOURS, &f.target, policy, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mention.render(), "new post ");
    }
}
