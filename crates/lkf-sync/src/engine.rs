use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use lkf_adapters::{Geocoder, ListingProvider};
use lkf_core::{Listing, RemoteListing};
use lkf_storage::{EntityStore, StoreError, StoreTransaction};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::work_group::WorkGroup;
use crate::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnrichmentKind {
    Coordinates,
    Image,
    PlanDocument,
}

impl EnrichmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentKind::Coordinates => "coordinates",
            EnrichmentKind::Image => "image",
            EnrichmentKind::PlanDocument => "plan_document",
        }
    }
}

/// Who asked for an update. A foreground update is one the user is looking at: the
/// listings it saves count as already seen and are never alerted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOrigin {
    Foreground,
    Background,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    pub fetched: usize,
    pub reconcile: ReconcileSummary,
    pub enrichment_scheduled: usize,
}

type InFlight = Arc<Mutex<HashSet<(i64, EnrichmentKind)>>>;

/// Releases an in-flight claim when the enrichment task ends.
struct InFlightSlot {
    set: InFlight,
    key: (i64, EnrichmentKind),
}

impl InFlightSlot {
    fn claim(set: &InFlight, key: (i64, EnrichmentKind)) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key);
        inserted.then(|| Self {
            set: Arc::clone(set),
            key,
        })
    }
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Reconciles provider records into the store and keeps listings enriched.
pub struct SyncEngine {
    store: EntityStore,
    provider: Arc<dyn ListingProvider>,
    geocoder: Arc<dyn Geocoder>,
    work: WorkGroup,
    in_flight: InFlight,
}

impl SyncEngine {
    pub fn new(
        store: EntityStore,
        provider: Arc<dyn ListingProvider>,
        geocoder: Arc<dyn Geocoder>,
    ) -> Self {
        Self {
            store,
            provider,
            geocoder,
            work: WorkGroup::new(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn work_group(&self) -> &WorkGroup {
        &self.work
    }

    /// Fetch, reconcile, then schedule enrichment. Enrichment keeps running after this
    /// returns; see [`SyncEngine::wait_for_enrichment`].
    pub async fn update(&self, origin: SyncOrigin) -> Result<UpdateSummary, SyncError> {
        let remote = self.provider.fetch_listings().await?;
        let fetched = remote.len();
        let reconcile = self.reconcile(remote, Utc::now(), origin).await?;
        let enrichment_scheduled = self.schedule_enrichment().await?;
        info!(
            fetched,
            inserted = reconcile.inserted,
            updated = reconcile.updated,
            skipped = reconcile.skipped,
            enrichment_scheduled,
            ?origin,
            "listing update finished"
        );
        Ok(UpdateSummary {
            fetched,
            reconcile,
            enrichment_scheduled,
        })
    }

    /// Upserts every record by external id in a single transaction. A record that fails to
    /// save is logged and skipped. Foreground records are marked evaluated in the same
    /// transaction.
    pub async fn reconcile(
        &self,
        remote: Vec<RemoteListing>,
        now: DateTime<Utc>,
        origin: SyncOrigin,
    ) -> Result<ReconcileSummary, StoreError> {
        let mut summary = ReconcileSummary::default();
        let mut tx = self.store.begin().await?;

        for record in remote {
            if record.external_id.trim().is_empty() {
                warn!("skipping provider record without id");
                summary.skipped += 1;
                continue;
            }
            let external_id = record.external_id.clone();
            match upsert(&mut tx, record, now, origin).await {
                Ok(true) => summary.inserted += 1,
                Ok(false) => summary.updated += 1,
                Err(err) => {
                    warn!(%external_id, error = %err, "failed to save listing, skipping");
                    summary.skipped += 1;
                }
            }
        }

        tx.commit().await?;
        Ok(summary)
    }

    /// Starts enrichment tasks for every listing missing coordinates, image or floor plan.
    /// Returns how many tasks were started; pairs already in flight are not started again.
    pub async fn schedule_enrichment(&self) -> Result<usize, StoreError> {
        let mut scheduled = 0;
        for listing in self.store.listings_needing_enrichment().await? {
            if let Some(query) = listing
                .needs_coordinates()
                .then(|| listing.geocode_query.clone())
                .flatten()
            {
                let task = resolve_coordinates(self.store.clone(), Arc::clone(&self.geocoder), listing.id, query);
                scheduled += usize::from(self.spawn(listing.id, EnrichmentKind::Coordinates, task));
            }

            if let Some(url) = listing.needs_image().then(|| listing.image_url.clone()).flatten() {
                let task = fetch_image(self.store.clone(), Arc::clone(&self.provider), listing.id, url);
                scheduled += usize::from(self.spawn(listing.id, EnrichmentKind::Image, task));
            }

            if listing.needs_plan_document() {
                let task = fetch_plan_document(
                    self.store.clone(),
                    Arc::clone(&self.provider),
                    listing.id,
                    listing.external_id.clone(),
                );
                scheduled += usize::from(self.spawn(listing.id, EnrichmentKind::PlanDocument, task));
            }
        }
        Ok(scheduled)
    }

    pub async fn wait_for_enrichment(&self) {
        self.work.wait().await;
    }

    fn spawn<F>(&self, listing_id: i64, kind: EnrichmentKind, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Some(slot) = InFlightSlot::claim(&self.in_flight, (listing_id, kind)) else {
            debug!(listing_id, kind = kind.as_str(), "enrichment already in flight");
            return false;
        };
        let guard = self.work.enter();
        let span = info_span!("enrichment", listing_id, kind = kind.as_str());
        tokio::spawn(
            async move {
                let _guard = guard;
                let _slot = slot;
                task.await;
            }
            .instrument(span),
        );
        true
    }
}

async fn upsert(
    tx: &mut StoreTransaction,
    record: RemoteListing,
    now: DateTime<Utc>,
    origin: SyncOrigin,
) -> Result<bool, StoreError> {
    let seen = origin == SyncOrigin::Foreground;
    match tx.find_listing(&record.external_id).await? {
        Some(mut existing) => {
            existing.apply_remote(record);
            tx.update_remote_fields(existing.id, &existing.remote).await?;
            if seen {
                tx.mark_evaluated(existing.id).await?;
            }
            Ok(false)
        }
        None => {
            let mut listing = Listing::from_remote(record, now);
            listing.evaluated_for_notification = seen;
            tx.insert_listing(&listing).await?;
            Ok(true)
        }
    }
}

async fn resolve_coordinates(
    store: EntityStore,
    geocoder: Arc<dyn Geocoder>,
    listing_id: i64,
    query: String,
) {
    match geocoder.geocode(&query).await {
        Ok(Some(coordinates)) if coordinates.is_resolved() => {
            match store.set_coordinates(listing_id, coordinates).await {
                Ok(true) => debug!(%query, "coordinates resolved"),
                Ok(false) => debug!("coordinates were already resolved"),
                Err(err) => warn!(error = %err, "failed to save coordinates"),
            }
        }
        Ok(_) => debug!(%query, "no geocode hit"),
        Err(err) => warn!(%query, error = %err, "geocoding failed"),
    }
}

async fn fetch_image(
    store: EntityStore,
    provider: Arc<dyn ListingProvider>,
    listing_id: i64,
    url: String,
) {
    match provider.fetch_image(&url).await {
        Ok(bytes) => {
            if let Err(err) = store.set_image_data(listing_id, &bytes).await {
                warn!(error = %err, "failed to save image");
            }
        }
        Err(err) => warn!(%url, error = %err, "image fetch failed"),
    }
}

async fn fetch_plan_document(
    store: EntityStore,
    provider: Arc<dyn ListingProvider>,
    listing_id: i64,
    external_id: String,
) {
    match provider.fetch_plan_document(&external_id).await {
        Ok(bytes) => {
            if let Err(err) = store.set_plan_document(listing_id, &bytes).await {
                warn!(error = %err, "failed to save floor plan");
            }
        }
        Err(err) => warn!(%external_id, error = %err, "floor plan fetch failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{remote, FakeGeocoder, FakeProvider};
    use lkf_core::Coordinates;
    use std::sync::atomic::Ordering;

    async fn engine_with(
        provider: Arc<FakeProvider>,
        geocoder: Arc<FakeGeocoder>,
    ) -> (EntityStore, SyncEngine) {
        let store = EntityStore::open_in_memory().await.expect("store");
        let engine = SyncEngine::new(store.clone(), provider, geocoder);
        (store, engine)
    }

    #[tokio::test]
    async fn unseen_listing_is_inserted_unevaluated() {
        let provider = Arc::new(FakeProvider::with(vec![remote("A", 5000, 50, 2)]));
        let (store, engine) = engine_with(provider, Arc::new(FakeGeocoder::default())).await;

        let summary = engine.update(SyncOrigin::Background).await.expect("update");
        assert_eq!(summary.fetched, 1);
        assert_eq!(summary.reconcile, ReconcileSummary { inserted: 1, updated: 0, skipped: 0 });

        let listing = store.find_listing("A").await.expect("query").expect("present");
        assert!(!listing.evaluated_for_notification);
        assert!(listing.imported_at <= Utc::now());
        assert_eq!(store.count_listings().await.expect("count"), 1);
        engine.wait_for_enrichment().await;
    }

    #[tokio::test]
    async fn known_listing_is_updated_in_place_keeping_enrichment() {
        let provider = Arc::new(FakeProvider::with(vec![remote("A", 5000, 50, 2)]));
        let geocoder = Arc::new(FakeGeocoder::default());
        let (store, engine) = engine_with(Arc::clone(&provider), Arc::clone(&geocoder)).await;

        engine.update(SyncOrigin::Background).await.expect("first update");
        engine.wait_for_enrichment().await;
        let first = store.find_listing("A").await.expect("query").expect("present");
        assert_eq!(first.coordinates, Coordinates::new(55.7, 13.2));
        assert_eq!(first.image_data.as_deref(), Some(&b"image:A"[..]));
        assert_eq!(first.plan_document.as_deref(), Some(&b"plan:A"[..]));

        provider.replace(vec![remote("A", 5400, 50, 2)]);
        let summary = engine.update(SyncOrigin::Background).await.expect("second update");
        engine.wait_for_enrichment().await;
        assert_eq!(summary.reconcile.updated, 1);
        assert_eq!(summary.enrichment_scheduled, 0);

        let second = store.find_listing("A").await.expect("query").expect("present");
        assert_eq!(second.id, first.id);
        assert_eq!(second.remote.cost, 5400);
        assert_eq!(second.imported_at, first.imported_at);
        assert_eq!(second.coordinates, first.coordinates);
        assert_eq!(second.image_data, first.image_data);
        assert_eq!(second.plan_document, first.plan_document);
    }

    #[tokio::test]
    async fn unchanged_payload_is_idempotent() {
        let provider = Arc::new(FakeProvider::with(vec![
            remote("A", 5000, 50, 2),
            remote("B", 6000, 60, 3),
        ]));
        let geocoder = Arc::new(FakeGeocoder::default());
        let (store, engine) = engine_with(Arc::clone(&provider), Arc::clone(&geocoder)).await;

        engine.update(SyncOrigin::Background).await.expect("first");
        engine.wait_for_enrichment().await;
        let before = store.all_listings().await.expect("listings");

        engine.update(SyncOrigin::Background).await.expect("second");
        engine.wait_for_enrichment().await;
        let after = store.all_listings().await.expect("listings");

        assert_eq!(before, after);
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 2);
        assert_eq!(provider.image_calls.load(Ordering::SeqCst), 2);
        assert_eq!(provider.plan_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn duplicate_and_blank_ids_in_one_payload() {
        let provider = Arc::new(FakeProvider::with(vec![
            remote("A", 5000, 50, 2),
            remote("A", 5100, 50, 2),
            remote(" ", 1000, 10, 1),
        ]));
        let (store, engine) = engine_with(provider, Arc::new(FakeGeocoder::default())).await;

        let summary = engine.update(SyncOrigin::Background).await.expect("update");
        assert_eq!(summary.reconcile, ReconcileSummary { inserted: 1, updated: 1, skipped: 1 });
        let listing = store.find_listing("A").await.expect("query").expect("present");
        assert_eq!(listing.remote.cost, 5100);
        engine.wait_for_enrichment().await;
    }

    #[tokio::test]
    async fn incomplete_address_is_never_geocoded() {
        let mut record = remote("A", 5000, 50, 2);
        record.address2 = None;
        record.image_url = None;
        let provider = Arc::new(FakeProvider::with(vec![record]));
        let geocoder = Arc::new(FakeGeocoder::default());
        let (store, engine) = engine_with(provider, Arc::clone(&geocoder)).await;

        let summary = engine.update(SyncOrigin::Background).await.expect("update");
        engine.wait_for_enrichment().await;
        assert_eq!(summary.enrichment_scheduled, 1);
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 0);
        let listing = store.find_listing("A").await.expect("query").expect("present");
        assert!(!listing.coordinates.is_resolved());
    }

    #[tokio::test]
    async fn failed_enrichment_is_retried_on_the_next_pass() {
        let provider = Arc::new(FakeProvider::with(vec![remote("A", 5000, 50, 2)]));
        let geocoder = Arc::new(FakeGeocoder::failing());
        let (store, engine) = engine_with(provider, Arc::clone(&geocoder)).await;

        engine.update(SyncOrigin::Background).await.expect("update");
        engine.wait_for_enrichment().await;
        assert!(!store.find_listing("A").await.expect("q").expect("p").coordinates.is_resolved());

        geocoder.fail.store(false, Ordering::SeqCst);
        assert_eq!(engine.schedule_enrichment().await.expect("schedule"), 1);
        engine.wait_for_enrichment().await;
        assert!(store.find_listing("A").await.expect("q").expect("p").coordinates.is_resolved());
    }

    #[tokio::test]
    async fn in_flight_enrichment_is_not_scheduled_twice() {
        let mut record = remote("A", 5000, 50, 2);
        record.image_url = None;
        let provider = Arc::new(FakeProvider::with(vec![record]));
        let geocoder = Arc::new(FakeGeocoder::gated());
        let (_store, engine) = engine_with(Arc::clone(&provider), Arc::clone(&geocoder)).await;

        engine.update(SyncOrigin::Background).await.expect("update");
        // The plan fetch may or may not have finished; the gated geocode has not.
        engine.schedule_enrichment().await.expect("second pass");
        assert!(engine.work_group().pending() >= 1);

        geocoder.release();
        engine.wait_for_enrichment().await;
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.work_group().pending(), 0);
    }

    #[tokio::test]
    async fn foreground_update_marks_inserted_and_updated_listings_seen() {
        let provider = Arc::new(FakeProvider::with(vec![remote("A", 5000, 50, 2)]));
        let geocoder = Arc::new(FakeGeocoder::default());
        let (store, engine) = engine_with(Arc::clone(&provider), geocoder).await;

        engine.update(SyncOrigin::Background).await.expect("background");
        assert!(!store.find_listing("A").await.expect("q").expect("p").evaluated_for_notification);

        provider.replace(vec![remote("A", 5200, 50, 2), remote("B", 6000, 60, 3)]);
        let summary = engine.update(SyncOrigin::Foreground).await.expect("foreground");
        engine.wait_for_enrichment().await;
        assert_eq!(summary.reconcile, ReconcileSummary { inserted: 1, updated: 1, skipped: 0 });

        for id in ["A", "B"] {
            let listing = store.find_listing(id).await.expect("q").expect("p");
            assert!(listing.evaluated_for_notification, "{id}");
        }
        let mut tx = store.begin().await.expect("begin");
        assert!(tx.unevaluated_listings().await.expect("pending").is_empty());
        tx.commit().await.expect("commit");
    }

    #[tokio::test]
    async fn rejected_record_is_skipped_and_the_rest_commit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("lkf.db");
        let store = EntityStore::open(&path).await.expect("store");

        let side = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(sqlx::sqlite::SqliteConnectOptions::new().filename(&path))
            .await
            .expect("second connection");
        sqlx::query(
            "CREATE TRIGGER reject_bad BEFORE INSERT ON listings \
             WHEN NEW.external_id = 'BAD' BEGIN SELECT RAISE(ABORT, 'rejected'); END",
        )
        .execute(&side)
        .await
        .expect("trigger");
        side.close().await;

        let engine = SyncEngine::new(
            store.clone(),
            Arc::new(FakeProvider::default()),
            Arc::new(FakeGeocoder::default()),
        );
        let payload = vec![
            remote("A", 5000, 50, 2),
            remote("BAD", 5500, 55, 2),
            remote("C", 6000, 60, 3),
        ];
        let summary = engine
            .reconcile(payload, Utc::now(), SyncOrigin::Background)
            .await
            .expect("reconcile");

        assert_eq!(summary, ReconcileSummary { inserted: 2, updated: 0, skipped: 1 });
        assert_eq!(store.count_listings().await.expect("count"), 2);
        assert!(store.find_listing("A").await.expect("q").is_some());
        assert!(store.find_listing("BAD").await.expect("q").is_none());
        assert!(store.find_listing("C").await.expect("q").is_some());
    }

    #[tokio::test]
    async fn provider_failure_surfaces_and_writes_nothing() {
        let provider = Arc::new(FakeProvider::failing());
        let (store, engine) = engine_with(provider, Arc::new(FakeGeocoder::default())).await;

        assert!(matches!(engine.update(SyncOrigin::Background).await, Err(SyncError::Provider(_))));
        assert_eq!(store.count_listings().await.expect("count"), 0);
    }
}
