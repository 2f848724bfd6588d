//! SQLite-backed entity store for listings, filters and sync audit rows.

use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use lkf_core::{
    geocode_query, Condition, Coordinates, EnrichmentCandidate, Filter, FilterCriteria, Listing,
    ListingPredicate, RemoteListing, Sorting, SyncAuditRecord,
};
use sqlx::migrate::Migrator;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tracing::{debug, info};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("io error preparing database: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt value in column {column}: {reason}")]
    Corrupt { column: &'static str, reason: String },
    #[error("filter {0} not found")]
    FilterNotFound(i64),
    #[error("the primary filter cannot be deleted")]
    PrimaryFilterProtected,
}

/// Provider-owned columns, in the order [`bind_remote`] binds them.
const REMOTE_COLUMNS: [&str; 41] = [
    "object_group",
    "object_type",
    "show_date_start",
    "show_date_end",
    "move_in_date",
    "move_out_date",
    "available_date",
    "address1",
    "address2",
    "address3",
    "cost",
    "price",
    "size",
    "rooms",
    "floor",
    "description",
    "planning_description",
    "built_year",
    "rebuilt_year",
    "flat_no",
    "url",
    "image_url",
    "planning_image_url",
    "state_id",
    "state_name",
    "area_id",
    "area_name",
    "street_view_pitch",
    "street_view_heading",
    "street_view_zoom",
    "show_web",
    "direct_search",
    "random_sort",
    "residents_only",
    "focus",
    "elevator",
    "balcony",
    "date_created",
    "date_changed",
    "date_imported",
    "cost_per_area",
];

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn millis_to_datetime(column: &'static str, millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| StoreError::Corrupt {
        column,
        reason: format!("timestamp {millis} out of range"),
    })
}

fn get_datetime(row: &SqliteRow, column: &'static str) -> Result<DateTime<Utc>, StoreError> {
    millis_to_datetime(column, row.try_get(column)?)
}

fn get_opt_datetime(row: &SqliteRow, column: &'static str) -> Result<Option<DateTime<Utc>>, StoreError> {
    row.try_get::<Option<i64>, _>(column)?
        .map(|millis| millis_to_datetime(column, millis))
        .transpose()
}

fn bind_remote<'q>(query: SqliteQuery<'q>, remote: &'q RemoteListing) -> SqliteQuery<'q> {
    query
        .bind(remote.object_group)
        .bind(remote.object_type)
        .bind(remote.show_date_start.map(to_millis))
        .bind(remote.show_date_end.map(to_millis))
        .bind(remote.move_in_date.map(to_millis))
        .bind(remote.move_out_date.map(to_millis))
        .bind(remote.available_date.map(to_millis))
        .bind(remote.address1.as_deref())
        .bind(remote.address2.as_deref())
        .bind(remote.address3.as_deref())
        .bind(remote.cost)
        .bind(remote.price)
        .bind(remote.size)
        .bind(remote.rooms)
        .bind(remote.floor)
        .bind(remote.description.as_deref())
        .bind(remote.planning_description.as_deref())
        .bind(remote.built_year)
        .bind(remote.rebuilt_year)
        .bind(remote.flat_no.as_deref())
        .bind(remote.url.as_deref())
        .bind(remote.image_url.as_deref())
        .bind(remote.planning_image_url.as_deref())
        .bind(remote.state_id.as_deref())
        .bind(remote.state_name.as_deref())
        .bind(remote.area_id.as_deref())
        .bind(remote.area_name.as_deref())
        .bind(remote.street_view_pitch)
        .bind(remote.street_view_heading)
        .bind(remote.street_view_zoom)
        .bind(remote.show_web)
        .bind(remote.direct_search)
        .bind(remote.random_sort)
        .bind(remote.residents_only)
        .bind(remote.focus)
        .bind(remote.elevator)
        .bind(remote.balcony)
        .bind(remote.date_created.map(to_millis))
        .bind(remote.date_changed.map(to_millis))
        .bind(remote.date_imported.map(to_millis))
        .bind(remote.cost_per_area())
}

fn insert_listing_sql() -> String {
    let placeholders = vec!["?"; REMOTE_COLUMNS.len()].join(", ");
    format!(
        "INSERT INTO listings (external_id, {}, latitude, longitude, image_data, plan_document, imported_at, evaluated_for_notification) \
         VALUES (?, {placeholders}, ?, ?, ?, ?, ?, ?)",
        REMOTE_COLUMNS.join(", ")
    )
}

fn update_remote_sql() -> String {
    let assignments = REMOTE_COLUMNS
        .iter()
        .map(|column| format!("{column} = ?"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("UPDATE listings SET {assignments} WHERE id = ?")
}

fn listing_from_row(row: &SqliteRow) -> Result<Listing, StoreError> {
    let remote = RemoteListing {
        external_id: row.try_get("external_id")?,
        object_group: row.try_get("object_group")?,
        object_type: row.try_get("object_type")?,
        show_date_start: get_opt_datetime(row, "show_date_start")?,
        show_date_end: get_opt_datetime(row, "show_date_end")?,
        move_in_date: get_opt_datetime(row, "move_in_date")?,
        move_out_date: get_opt_datetime(row, "move_out_date")?,
        available_date: get_opt_datetime(row, "available_date")?,
        address1: row.try_get("address1")?,
        address2: row.try_get("address2")?,
        address3: row.try_get("address3")?,
        cost: row.try_get("cost")?,
        price: row.try_get("price")?,
        size: row.try_get("size")?,
        rooms: row.try_get("rooms")?,
        floor: row.try_get("floor")?,
        description: row.try_get("description")?,
        planning_description: row.try_get("planning_description")?,
        built_year: row.try_get("built_year")?,
        rebuilt_year: row.try_get("rebuilt_year")?,
        flat_no: row.try_get("flat_no")?,
        url: row.try_get("url")?,
        image_url: row.try_get("image_url")?,
        planning_image_url: row.try_get("planning_image_url")?,
        state_id: row.try_get("state_id")?,
        state_name: row.try_get("state_name")?,
        area_id: row.try_get("area_id")?,
        area_name: row.try_get("area_name")?,
        street_view_pitch: row.try_get("street_view_pitch")?,
        street_view_heading: row.try_get("street_view_heading")?,
        street_view_zoom: row.try_get("street_view_zoom")?,
        show_web: row.try_get("show_web")?,
        direct_search: row.try_get("direct_search")?,
        random_sort: row.try_get("random_sort")?,
        residents_only: row.try_get("residents_only")?,
        focus: row.try_get("focus")?,
        elevator: row.try_get("elevator")?,
        balcony: row.try_get("balcony")?,
        date_created: get_opt_datetime(row, "date_created")?,
        date_changed: get_opt_datetime(row, "date_changed")?,
        date_imported: get_opt_datetime(row, "date_imported")?,
    };

    Ok(Listing {
        id: row.try_get("id")?,
        remote,
        coordinates: Coordinates::new(row.try_get("latitude")?, row.try_get("longitude")?),
        image_data: row.try_get("image_data")?,
        plan_document: row.try_get("plan_document")?,
        imported_at: get_datetime(row, "imported_at")?,
        evaluated_for_notification: row.try_get("evaluated_for_notification")?,
    })
}

fn candidate_from_row(row: &SqliteRow) -> Result<EnrichmentCandidate, StoreError> {
    let address1: Option<String> = row.try_get("address1")?;
    let address2: Option<String> = row.try_get("address2")?;
    let address3: Option<String> = row.try_get("address3")?;
    let has_image: i64 = row.try_get("has_image")?;
    let has_plan_document: i64 = row.try_get("has_plan_document")?;

    Ok(EnrichmentCandidate {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        geocode_query: geocode_query([
            address1.as_deref(),
            address2.as_deref(),
            address3.as_deref(),
        ]),
        image_url: row.try_get("image_url")?,
        coordinates: Coordinates::new(row.try_get("latitude")?, row.try_get("longitude")?),
        has_image: has_image != 0,
        has_plan_document: has_plan_document != 0,
    })
}

fn filter_from_row(row: &SqliteRow) -> Result<Filter, StoreError> {
    let rooms_json: String = row.try_get("rooms")?;
    let rooms: BTreeSet<i32> =
        serde_json::from_str(&rooms_json).map_err(|e| StoreError::Corrupt {
            column: "rooms",
            reason: e.to_string(),
        })?;
    let sorting_raw: String = row.try_get("sorting")?;
    let sorting = Sorting::from_str(&sorting_raw).map_err(|e| StoreError::Corrupt {
        column: "sorting",
        reason: e.to_string(),
    })?;

    Ok(Filter {
        id: row.try_get("id")?,
        created_at: get_datetime(row, "created_at")?,
        is_primary: row.try_get("is_primary")?,
        criteria: FilterCriteria {
            rooms,
            min_area: row.try_get("min_area")?,
            max_rent: row.try_get("max_rent")?,
            sorting,
        },
    })
}

fn audit_from_row(row: &SqliteRow) -> Result<SyncAuditRecord, StoreError> {
    Ok(SyncAuditRecord {
        id: row.try_get("id")?,
        recorded_at: get_datetime(row, "recorded_at")?,
        objects_before: row.try_get("objects_before")?,
        objects_after: row.try_get("objects_after")?,
        notifications_sent: row.try_get("notifications_sent")?,
    })
}

fn rooms_to_json(rooms: &BTreeSet<i32>) -> Result<String, StoreError> {
    serde_json::to_string(rooms).map_err(|e| StoreError::Corrupt {
        column: "rooms",
        reason: e.to_string(),
    })
}

/// Appends the predicate as `AND` clauses with bound values.
fn push_predicate(builder: &mut QueryBuilder<'_, Sqlite>, predicate: &ListingPredicate) {
    for condition in predicate.conditions() {
        match condition {
            Condition::CostAtMost(max_rent) => {
                builder.push(" AND cost <= ").push_bind(*max_rent);
            }
            Condition::SizeAtLeast(min_area) => {
                builder.push(" AND size >= ").push_bind(*min_area);
            }
            Condition::RoomsIn(rooms) => {
                builder.push(" AND rooms IN (");
                let mut separated = builder.separated(", ");
                for rooms in rooms {
                    separated.push_bind(*rooms);
                }
                separated.push_unseparated(")");
            }
            Condition::ShowDateEndAfter(at) => {
                builder.push(" AND show_date_end > ").push_bind(to_millis(*at));
            }
        }
    }
}

fn order_by(sorting: Sorting) -> &'static str {
    match sorting {
        Sorting::NewestAscending => "show_date_end ASC, imported_at ASC",
        Sorting::NewestDescending => "show_date_end DESC, imported_at DESC",
        Sorting::PriceAscending => "cost ASC",
        Sorting::PriceDescending => "cost DESC",
        Sorting::SizeAscending => "size ASC",
        Sorting::SizeDescending => "size DESC",
        Sorting::CostPerAreaAscending => "cost_per_area ASC",
        Sorting::CostPerAreaDescending => "cost_per_area DESC",
    }
}

/// Shared persistent store. Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct EntityStore {
    pool: SqlitePool,
}

impl EntityStore {
    /// Opens (creating if needed) the database file, runs migrations and makes sure the
    /// primary filter exists.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        info!(path = %path.display(), "opened listing store");
        Self::initialize(pool).await
    }

    /// Single-connection in-memory database, for tests and dry runs.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::initialize(pool).await
    }

    async fn initialize(pool: SqlitePool) -> Result<Self, StoreError> {
        MIGRATOR.run(&pool).await?;
        let store = Self { pool };
        store.ensure_primary_filter().await?;
        Ok(store)
    }

    pub async fn begin(&self) -> Result<StoreTransaction, StoreError> {
        Ok(StoreTransaction {
            tx: self.pool.begin().await?,
        })
    }

    pub async fn count_listings(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM listings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn find_listing(&self, external_id: &str) -> Result<Option<Listing>, StoreError> {
        let row = sqlx::query("SELECT * FROM listings WHERE external_id = ?")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(listing_from_row).transpose()
    }

    pub async fn all_listings(&self) -> Result<Vec<Listing>, StoreError> {
        let rows = sqlx::query("SELECT * FROM listings ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(listing_from_row).collect()
    }

    /// Listings missing at least one enrichment field. Cached blobs are not loaded.
    pub async fn listings_needing_enrichment(&self) -> Result<Vec<EnrichmentCandidate>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, external_id, address1, address2, address3, image_url, latitude, longitude, \
                    image_data IS NOT NULL AS has_image, \
                    plan_document IS NOT NULL AS has_plan_document \
             FROM listings \
             WHERE (latitude = 0 AND longitude = 0) OR image_data IS NULL OR plan_document IS NULL \
             ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(candidate_from_row).collect()
    }

    /// Write-once: returns `false` when the coordinates were already resolved.
    pub async fn set_coordinates(&self, id: i64, coordinates: Coordinates) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE listings SET latitude = ?, longitude = ? \
             WHERE id = ? AND latitude = 0 AND longitude = 0",
        )
        .bind(coordinates.latitude)
        .bind(coordinates.longitude)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_image_data(&self, id: i64, bytes: &[u8]) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE listings SET image_data = ? WHERE id = ? AND image_data IS NULL")
            .bind(bytes)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_plan_document(&self, id: i64, bytes: &[u8]) -> Result<bool, StoreError> {
        let result =
            sqlx::query("UPDATE listings SET plan_document = ? WHERE id = ? AND plan_document IS NULL")
                .bind(bytes)
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Listings matching the criteria at `now`, in the criteria's sort order.
    pub async fn query_listings(
        &self,
        criteria: &FilterCriteria,
        now: DateTime<Utc>,
    ) -> Result<Vec<Listing>, StoreError> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT * FROM listings WHERE 1 = 1");
        push_predicate(&mut builder, &criteria.predicate(now));
        builder.push(" ORDER BY ").push(order_by(criteria.sorting));
        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(listing_from_row).collect()
    }

    /// Find-or-create of the singleton primary filter.
    pub async fn ensure_primary_filter(&self) -> Result<Filter, StoreError> {
        if let Some(row) = sqlx::query("SELECT * FROM filters WHERE is_primary = 1")
            .fetch_optional(&self.pool)
            .await?
        {
            return filter_from_row(&row);
        }

        // The partial unique index turns a concurrent second insert into a no-op.
        sqlx::query("INSERT OR IGNORE INTO filters (created_at, is_primary, rooms, min_area, max_rent, sorting) VALUES (?, 1, '[]', 0, 0, ?)")
            .bind(to_millis(Utc::now()))
            .bind(Sorting::default().as_str())
            .execute(&self.pool)
            .await?;
        info!("created primary filter");

        let row = sqlx::query("SELECT * FROM filters WHERE is_primary = 1")
            .fetch_one(&self.pool)
            .await?;
        filter_from_row(&row)
    }

    pub async fn filter(&self, id: i64) -> Result<Option<Filter>, StoreError> {
        let row = sqlx::query("SELECT * FROM filters WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(filter_from_row).transpose()
    }

    /// Primary filter first, then alerts in creation order.
    pub async fn filters(&self) -> Result<Vec<Filter>, StoreError> {
        let rows = sqlx::query("SELECT * FROM filters ORDER BY is_primary DESC, id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(filter_from_row).collect()
    }

    pub async fn alert_filters(&self) -> Result<Vec<Filter>, StoreError> {
        let rows = sqlx::query("SELECT * FROM filters WHERE is_primary = 0 ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(filter_from_row).collect()
    }

    /// Saves a new alert filter.
    pub async fn insert_filter(&self, criteria: &FilterCriteria) -> Result<Filter, StoreError> {
        let result = sqlx::query(
            "INSERT INTO filters (created_at, is_primary, rooms, min_area, max_rent, sorting) VALUES (?, 0, ?, ?, ?, ?)",
        )
        .bind(to_millis(Utc::now()))
        .bind(rooms_to_json(&criteria.rooms)?)
        .bind(criteria.min_area)
        .bind(criteria.max_rent)
        .bind(criteria.sorting.as_str())
        .execute(&self.pool)
        .await?;
        let id = result.last_insert_rowid();
        debug!(id, "inserted alert filter");
        self.filter(id).await?.ok_or(StoreError::FilterNotFound(id))
    }

    pub async fn update_filter(&self, id: i64, criteria: &FilterCriteria) -> Result<Filter, StoreError> {
        let result = sqlx::query(
            "UPDATE filters SET rooms = ?, min_area = ?, max_rent = ?, sorting = ? WHERE id = ?",
        )
        .bind(rooms_to_json(&criteria.rooms)?)
        .bind(criteria.min_area)
        .bind(criteria.max_rent)
        .bind(criteria.sorting.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::FilterNotFound(id));
        }
        self.filter(id).await?.ok_or(StoreError::FilterNotFound(id))
    }

    pub async fn delete_filter(&self, id: i64) -> Result<(), StoreError> {
        let filter = self.filter(id).await?.ok_or(StoreError::FilterNotFound(id))?;
        if filter.is_primary {
            return Err(StoreError::PrimaryFilterProtected);
        }
        sqlx::query("DELETE FROM filters WHERE id = ? AND is_primary = 0")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_audit(
        &self,
        recorded_at: DateTime<Utc>,
        objects_before: i32,
        objects_after: i32,
    ) -> Result<SyncAuditRecord, StoreError> {
        let result = sqlx::query(
            "INSERT INTO sync_audit (recorded_at, objects_before, objects_after, notifications_sent) VALUES (?, ?, ?, 0)",
        )
        .bind(to_millis(recorded_at))
        .bind(objects_before)
        .bind(objects_after)
        .execute(&self.pool)
        .await?;
        let row = sqlx::query("SELECT * FROM sync_audit WHERE id = ?")
            .bind(result.last_insert_rowid())
            .fetch_one(&self.pool)
            .await?;
        audit_from_row(&row)
    }

    pub async fn record_notifications(&self, audit_id: i64, notifications_sent: i32) -> Result<(), StoreError> {
        sqlx::query("UPDATE sync_audit SET notifications_sent = ? WHERE id = ?")
            .bind(notifications_sent)
            .bind(audit_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Newest first.
    pub async fn audit_records(&self, limit: i64) -> Result<Vec<SyncAuditRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM sync_audit ORDER BY recorded_at DESC, id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(audit_from_row).collect()
    }
}

/// Writable unit of work. Nothing is visible to other readers until [`commit`].
///
/// [`commit`]: StoreTransaction::commit
pub struct StoreTransaction {
    tx: Transaction<'static, Sqlite>,
}

impl StoreTransaction {
    pub async fn find_listing(&mut self, external_id: &str) -> Result<Option<Listing>, StoreError> {
        let row = sqlx::query("SELECT * FROM listings WHERE external_id = ?")
            .bind(external_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(listing_from_row).transpose()
    }

    /// Inserts a listing and returns its new row id.
    pub async fn insert_listing(&mut self, listing: &Listing) -> Result<i64, StoreError> {
        let sql = insert_listing_sql();
        let query = sqlx::query(&sql).bind(listing.remote.external_id.as_str());
        let result = bind_remote(query, &listing.remote)
            .bind(listing.coordinates.latitude)
            .bind(listing.coordinates.longitude)
            .bind(listing.image_data.as_deref())
            .bind(listing.plan_document.as_deref())
            .bind(to_millis(listing.imported_at))
            .bind(listing.evaluated_for_notification)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// Overwrites only the provider-owned columns of an existing row.
    pub async fn update_remote_fields(&mut self, id: i64, remote: &RemoteListing) -> Result<(), StoreError> {
        let sql = update_remote_sql();
        bind_remote(sqlx::query(&sql), remote)
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    pub async fn unevaluated_listings(&mut self) -> Result<Vec<Listing>, StoreError> {
        let rows = sqlx::query("SELECT * FROM listings WHERE evaluated_for_notification = 0 ORDER BY id")
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter().map(listing_from_row).collect()
    }

    pub async fn alert_filters(&mut self) -> Result<Vec<Filter>, StoreError> {
        let rows = sqlx::query("SELECT * FROM filters WHERE is_primary = 0 ORDER BY id")
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter().map(filter_from_row).collect()
    }

    /// Flips the evaluation mark; `false` when the listing was already evaluated.
    pub async fn mark_evaluated(&mut self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE listings SET evaluated_for_notification = 1 WHERE id = ? AND evaluated_for_notification = 0",
        )
        .bind(id)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}
