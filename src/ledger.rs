//! Persisted link between upstream events and the Discord messages sent for them.

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::model::{LiveSession, MessageRef, NotificationRecord, Target};
use crate::registry::FeedScope;

/// Ledger view restricted to the rows of one feed.
pub struct NotificationLedger<'a> {
    scope: &'a FeedScope,
}

impl<'a> NotificationLedger<'a> {
    pub(crate) fn new(scope: &'a FeedScope) -> Self {
        Self { scope }
    }

    fn feed_id(&self) -> i64 {
        self.scope.feed.id
    }

    /// Current notification for a target in the live session, if any.
    pub async fn active_for(&self, target: &Target) -> Result<Option<NotificationRecord>> {
        self.scope
            .store()
            .notification_for_target(self.feed_id(), target.id)
            .await
    }

    /// Whether `event_id` was already delivered to `target`.
    pub async fn handled(&self, target: &Target, event_id: &str) -> Result<bool> {
        Ok(self
            .scope
            .store()
            .notification_for_event(target.id, event_id)
            .await?
            .is_some())
    }

    pub async fn all(&self) -> Result<Vec<NotificationRecord>> {
        self.scope.store().notifications_for_feed(self.feed_id()).await
    }

    pub async fn record(
        &self,
        target: &Target,
        event_id: &str,
        message: MessageRef,
    ) -> Result<NotificationRecord> {
        self.scope
            .store()
            .create_notification(self.feed_id(), target.id, event_id, message)
            .await
    }

    /// The message is gone upstream; stop trying to edit it.
    pub async fn mark_deleted(&self, record: &NotificationRecord) -> Result<()> {
        self.scope
            .store()
            .mark_notification_deleted(record.id)
            .await
    }

    pub async fn remove(&self, record: &NotificationRecord) -> Result<()> {
        self.scope.store().delete_notification(record.id).await
    }

    pub async fn session(&self) -> Result<Option<LiveSession>> {
        self.scope.store().live_session(self.feed_id()).await
    }

    /// Starts or continues the live session; returns whether title/game changed.
    pub async fn observe_live(
        &self,
        started_at: DateTime<Utc>,
        viewers: u64,
        title: &str,
        game: &str,
    ) -> Result<bool> {
        let changed = match self.session().await? {
            Some(mut session) => {
                session.update_viewers(viewers);
                let changed = session.update_details(title, game);
                self.scope.store().save_live_session(&session).await?;
                changed
            }
            None => {
                let session = LiveSession::begin(self.feed_id(), started_at, viewers, title, game);
                self.scope.store().save_live_session(&session).await?;
                false
            }
        };
        Ok(changed)
    }

    pub async fn end_session(&self) -> Result<()> {
        self.scope.store().delete_live_session(self.feed_id()).await
    }
}
