use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use lkf_core::FetchOutcome;
use lkf_storage::EntityStore;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::engine::{SyncEngine, SyncOrigin};
use crate::notify::NotificationEngine;
use crate::SyncConfig;

/// Runs one fetch, sync, enrich, notify cycle on behalf of a background host.
pub struct BackgroundFetchCoordinator {
    store: EntityStore,
    engine: Arc<SyncEngine>,
    notifications: NotificationEngine,
    running: Mutex<()>,
}

impl BackgroundFetchCoordinator {
    pub fn new(store: EntityStore, engine: Arc<SyncEngine>, notifications: NotificationEngine) -> Self {
        Self {
            store,
            engine,
            notifications,
            running: Mutex::new(()),
        }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Never fails: errors are logged and reported as [`FetchOutcome::Failed`]. Cycles are
    /// serialized.
    pub async fn run_background_cycle(&self) -> FetchOutcome {
        let _running = self.running.lock().await;
        let span = info_span!("background_cycle", cycle_id = %Uuid::new_v4());
        let outcome = self.cycle().instrument(span).await;
        info!(%outcome, "background cycle finished");
        outcome
    }

    async fn cycle(&self) -> FetchOutcome {
        let before = match self.store.count_listings().await {
            Ok(n) => n,
            Err(err) => {
                warn!(error = %err, "could not count listings");
                return FetchOutcome::Failed;
            }
        };

        if let Err(err) = self.engine.update(SyncOrigin::Background).await {
            warn!(error = %err, "listing update failed");
            return FetchOutcome::Failed;
        }

        let after = match self.store.count_listings().await {
            Ok(n) => n,
            Err(err) => {
                warn!(error = %err, "could not count listings");
                return FetchOutcome::Failed;
            }
        };

        let audit = match self
            .store
            .insert_audit(Utc::now(), clamp_count(before), clamp_count(after))
            .await
        {
            Ok(audit) => audit,
            Err(err) => {
                warn!(error = %err, "could not write sync audit");
                return FetchOutcome::Failed;
            }
        };

        if before == after {
            info!(objects = after, "no new listings");
            return FetchOutcome::NoData;
        }

        self.engine.wait_for_enrichment().await;

        match self.notifications.evaluate_and_notify().await {
            Ok(sent) => {
                let sent = i32::try_from(sent).unwrap_or(i32::MAX);
                if let Err(err) = self.store.record_notifications(audit.id, sent).await {
                    warn!(error = %err, audit_id = audit.id, "could not record notification count");
                }
            }
            Err(err) => warn!(error = %err, "notification pass failed"),
        }

        FetchOutcome::NewData
    }
}

fn clamp_count(count: i64) -> i32 {
    i32::try_from(count).unwrap_or(i32::MAX)
}

/// Cron-driven background cycles. Each run also waits for the enrichment it started.
pub async fn build_scheduler(
    cron: &str,
    coordinator: Arc<BackgroundFetchCoordinator>,
) -> anyhow::Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let coordinator = Arc::clone(&coordinator);
        Box::pin(async move {
            coordinator.run_background_cycle().await;
            coordinator.engine().wait_for_enrichment().await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    coordinator: Arc<BackgroundFetchCoordinator>,
) -> anyhow::Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(&config.sync_cron, coordinator).await.map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{remote, FakeGeocoder, FakeProvider, RecordingNotifier};
    use lkf_core::FilterCriteria;

    struct Harness {
        store: EntityStore,
        provider: Arc<FakeProvider>,
        notifier: Arc<RecordingNotifier>,
        coordinator: BackgroundFetchCoordinator,
    }

    async fn harness(initial: Vec<lkf_core::RemoteListing>) -> Harness {
        let store = EntityStore::open_in_memory().await.expect("store");
        let provider = Arc::new(FakeProvider::with(initial));
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            provider.clone(),
            Arc::new(FakeGeocoder::default()),
        ));
        let notifications = NotificationEngine::new(store.clone(), notifier.clone(), true);
        let coordinator = BackgroundFetchCoordinator::new(store.clone(), engine, notifications);
        Harness {
            store,
            provider,
            notifier,
            coordinator,
        }
    }

    /// Store holding one already evaluated listing, plus a rent alert.
    async fn seeded() -> Harness {
        let h = harness(vec![remote("A", 9000, 90, 4)]).await;
        h.coordinator.engine().update(SyncOrigin::Background).await.expect("seed");
        h.coordinator.engine().wait_for_enrichment().await;
        h.coordinator
            .notifications
            .evaluate_and_notify()
            .await
            .expect("seed evaluation");
        h.store
            .insert_filter(&FilterCriteria {
                max_rent: 4500,
                ..Default::default()
            })
            .await
            .expect("alert");
        h
    }

    #[tokio::test]
    async fn new_matching_listing_reports_new_data_and_audits() {
        let h = seeded().await;
        h.provider
            .replace(vec![remote("A", 9000, 90, 4), remote("B", 4200, 38, 1)]);

        assert_eq!(h.coordinator.run_background_cycle().await, FetchOutcome::NewData);

        let audit = h.store.audit_records(10).await.expect("audit");
        assert_eq!(audit.len(), 1);
        assert_eq!(
            (audit[0].objects_before, audit[0].objects_after, audit[0].notifications_sent),
            (1, 2, 1)
        );
        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].listing_external_id, "B");
        // Enrichment finished before matching, so the thumbnail is attached.
        assert_eq!(sent[0].attachment.as_deref(), Some(&b"image:B"[..]));
    }

    #[tokio::test]
    async fn unchanged_count_reports_no_data_without_evaluation() {
        let h = harness(vec![remote("A", 4000, 40, 1)]).await;
        h.coordinator.engine().update(SyncOrigin::Background).await.expect("seed");
        h.coordinator.engine().wait_for_enrichment().await;
        h.store
            .insert_filter(&FilterCriteria {
                max_rent: 4500,
                ..Default::default()
            })
            .await
            .expect("alert");
        // Same count, changed content.
        h.provider.replace(vec![remote("A", 4100, 40, 1)]);

        assert_eq!(h.coordinator.run_background_cycle().await, FetchOutcome::NoData);

        let audit = h.store.audit_records(10).await.expect("audit");
        assert_eq!(audit.len(), 1);
        assert_eq!(
            (audit[0].objects_before, audit[0].objects_after, audit[0].notifications_sent),
            (1, 1, 0)
        );
        assert!(h.notifier.sent().is_empty());

        let listing = h.store.find_listing("A").await.expect("q").expect("p");
        assert_eq!(listing.remote.cost, 4100);
        assert!(!listing.evaluated_for_notification);
    }

    #[tokio::test]
    async fn listings_seen_in_a_foreground_refresh_are_not_alerted_later() {
        let h = harness(vec![remote("SEEN", 4000, 40, 1)]).await;
        h.store
            .insert_filter(&FilterCriteria {
                max_rent: 4500,
                ..Default::default()
            })
            .await
            .expect("alert");
        h.coordinator
            .engine()
            .update(SyncOrigin::Foreground)
            .await
            .expect("refresh");
        h.coordinator.engine().wait_for_enrichment().await;

        h.provider
            .replace(vec![remote("SEEN", 4000, 40, 1), remote("NEW", 4200, 38, 1)]);
        assert_eq!(h.coordinator.run_background_cycle().await, FetchOutcome::NewData);

        let notified: Vec<_> = h
            .notifier
            .sent()
            .into_iter()
            .map(|n| n.listing_external_id)
            .collect();
        assert_eq!(notified, vec!["NEW"]);
    }

    #[tokio::test]
    async fn provider_failure_reports_failed_without_audit() {
        let h = seeded().await;
        h.provider.set_failing(true);

        assert_eq!(h.coordinator.run_background_cycle().await, FetchOutcome::Failed);
        assert!(h.store.audit_records(10).await.expect("audit").is_empty());
        assert_eq!(h.store.count_listings().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn first_cycle_on_empty_store_is_new_data() {
        let h = harness(vec![remote("A", 4000, 40, 1), remote("B", 5000, 50, 2)]).await;
        h.store
            .insert_filter(&FilterCriteria::default())
            .await
            .expect("catch-all alert");

        assert_eq!(h.coordinator.run_background_cycle().await, FetchOutcome::NewData);
        let audit = h.store.audit_records(1).await.expect("audit");
        assert_eq!(
            (audit[0].objects_before, audit[0].objects_after, audit[0].notifications_sent),
            (0, 2, 2)
        );

        assert_eq!(h.coordinator.run_background_cycle().await, FetchOutcome::NoData);
        assert_eq!(h.notifier.sent().len(), 2);
    }

    #[tokio::test]
    async fn scheduler_is_only_built_when_enabled() {
        let h = harness(Vec::new()).await;
        let coordinator = Arc::new(h.coordinator);
        let mut config = SyncConfig::default();
        config.scheduler_enabled = false;
        assert!(maybe_build_scheduler(&config, Arc::clone(&coordinator))
            .await
            .expect("build")
            .is_none());

        config.scheduler_enabled = true;
        assert!(maybe_build_scheduler(&config, Arc::clone(&coordinator))
            .await
            .expect("build")
            .is_some());

        config.sync_cron = "not a cron".to_string();
        assert!(maybe_build_scheduler(&config, coordinator).await.is_err());
    }
}
