use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lkf_core::LocalNotification;
use lkf_storage::{AttachmentStore, EntityStore, StoreError};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Delivery seam for local notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn schedule(&self, notification: &LocalNotification) -> anyhow::Result<()>;
}

/// What the outbox notifier writes per notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEnvelope {
    pub id: Uuid,
    pub listing_external_id: String,
    pub title: String,
    pub body: String,
    pub badge: u32,
    pub deliver_at: DateTime<Utc>,
    /// Relative to the outbox directory.
    pub attachment: Option<PathBuf>,
}

/// Host notifier: one JSON envelope per notification in an outbox directory, with the
/// thumbnail stored next to it.
#[derive(Debug, Clone)]
pub struct OutboxNotifier {
    outbox: PathBuf,
    attachments: AttachmentStore,
}

impl OutboxNotifier {
    pub const ATTACHMENT_DIR: &'static str = "attachments";

    pub fn new(outbox: impl Into<PathBuf>) -> Self {
        let outbox = outbox.into();
        let attachments = AttachmentStore::new(outbox.join(Self::ATTACHMENT_DIR));
        Self {
            outbox,
            attachments,
        }
    }

    pub fn outbox(&self) -> &Path {
        &self.outbox
    }
}

fn image_extension(bytes: &[u8]) -> &'static str {
    match bytes {
        [0xff, 0xd8, ..] => "jpg",
        [0x89, b'P', b'N', b'G', ..] => "png",
        [b'G', b'I', b'F', ..] => "gif",
        _ => "bin",
    }
}

#[async_trait]
impl Notifier for OutboxNotifier {
    async fn schedule(&self, notification: &LocalNotification) -> anyhow::Result<()> {
        let attachment = match &notification.attachment {
            Some(bytes) => {
                let stored = self
                    .attachments
                    .put(
                        &notification.listing_external_id,
                        image_extension(bytes),
                        bytes,
                    )
                    .await?;
                Some(PathBuf::from(Self::ATTACHMENT_DIR).join(stored.relative_path))
            }
            None => None,
        };

        let deliver_at = Utc::now()
            + chrono::Duration::from_std(notification.deliver_after)
                .context("notification delay out of range")?;
        let envelope = OutboxEnvelope {
            id: notification.id,
            listing_external_id: notification.listing_external_id.clone(),
            title: notification.title.clone(),
            body: notification.body.clone(),
            badge: notification.badge,
            deliver_at,
            attachment,
        };

        fs::create_dir_all(&self.outbox)
            .await
            .with_context(|| format!("creating outbox {}", self.outbox.display()))?;
        let path = self.outbox.join(format!(
            "{}_{}.json",
            deliver_at.format("%Y%m%dT%H%M%S"),
            notification.id
        ));
        let json = serde_json::to_vec_pretty(&envelope).context("encoding outbox envelope")?;
        fs::write(&path, json)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        debug!(path = %path.display(), "notification written to outbox");
        Ok(())
    }
}

/// Tests unevaluated listings against the alert filters and notifies on the first match.
pub struct NotificationEngine {
    store: EntityStore,
    notifier: Arc<dyn Notifier>,
    enabled: bool,
}

impl NotificationEngine {
    pub fn new(store: EntityStore, notifier: Arc<dyn Notifier>, enabled: bool) -> Self {
        Self {
            store,
            notifier,
            enabled,
        }
    }

    pub async fn evaluate_and_notify(&self) -> Result<u32, StoreError> {
        self.evaluate_and_notify_at(Utc::now()).await
    }

    /// Marks every unevaluated listing evaluated in one transaction, then hands the
    /// notifications for matched listings to the notifier. Returns how many the notifier
    /// accepted.
    pub async fn evaluate_and_notify_at(&self, now: DateTime<Utc>) -> Result<u32, StoreError> {
        let mut tx = self.store.begin().await?;
        let listings = tx.unevaluated_listings().await?;
        let alerts = tx.alert_filters().await?;

        let mut pending = Vec::new();
        for listing in &listings {
            if let Some(filter) = alerts.iter().find(|f| f.matches(listing, now)) {
                debug!(
                    external_id = listing.external_id(),
                    filter_id = filter.id,
                    "listing matches alert"
                );
                if self.enabled {
                    pending.push(LocalNotification::for_listing(listing));
                }
            }
            tx.mark_evaluated(listing.id).await?;
        }
        tx.commit().await?;

        let mut sent = 0;
        for notification in &pending {
            match self.notifier.schedule(notification).await {
                Ok(()) => sent += 1,
                Err(err) => warn!(
                    external_id = %notification.listing_external_id,
                    error = %err,
                    "failed to schedule notification"
                ),
            }
        }

        info!(evaluated = listings.len(), matched = pending.len(), sent, "notification pass finished");
        Ok(sent)
    }
}
