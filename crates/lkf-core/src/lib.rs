//! Core domain model for LKF Rental Watch: listings, saved filters and their predicates.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "lkf-core";

/// Appended to every geocoding query; the provider only lists Swedish addresses.
pub const GEOCODE_COUNTRY: &str = "Sweden";

/// Timestamp handling for the provider payload.
pub mod provider_time {
    use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
    use chrono_tz::Europe::Stockholm;
    use chrono_tz::Tz;
    use serde::{Deserialize, Deserializer};
    use tracing::warn;

    /// Tried in order. The provider sends Swedish wall-clock time without an offset.
    pub const FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"];

    pub const PROVIDER_TZ: Tz = Stockholm;

    pub fn parse(value: &str) -> Option<DateTime<Utc>> {
        let value = value.trim();
        FORMATS
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
            .and_then(from_provider_local)
    }

    /// Ambiguous autumn times take the earlier instant; times inside the spring gap are
    /// moved forward by the skipped hour.
    pub fn from_provider_local(naive: NaiveDateTime) -> Option<DateTime<Utc>> {
        PROVIDER_TZ
            .from_local_datetime(&naive)
            .earliest()
            .or_else(|| PROVIDER_TZ.from_local_datetime(&(naive + Duration::hours(1))).earliest())
            .map(|local| local.with_timezone(&Utc))
    }

    /// `null` or a missing field stays `None`; a present but unreadable date becomes "now".
    pub fn deserialize_lenient<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.map(|value| {
            parse(&value).unwrap_or_else(|| {
                warn!(%value, "unparseable provider date, falling back to current time");
                Utc::now()
            })
        }))
    }
}

/// One record of the provider's "available objects" payload.
///
/// This is also the part of a [`Listing`] that every sync overwrites.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RemoteListing {
    #[serde(rename = "id")]
    pub external_id: String,
    #[serde(rename = "objectgroup", default)]
    pub object_group: i32,
    #[serde(rename = "objecttype", default)]
    pub object_type: i32,
    #[serde(rename = "showdatestart", default, deserialize_with = "provider_time::deserialize_lenient")]
    pub show_date_start: Option<DateTime<Utc>>,
    #[serde(rename = "showdateend", default, deserialize_with = "provider_time::deserialize_lenient")]
    pub show_date_end: Option<DateTime<Utc>>,
    #[serde(rename = "moveindate", default, deserialize_with = "provider_time::deserialize_lenient")]
    pub move_in_date: Option<DateTime<Utc>>,
    #[serde(rename = "moveoutdate", default, deserialize_with = "provider_time::deserialize_lenient")]
    pub move_out_date: Option<DateTime<Utc>>,
    #[serde(rename = "availabledate", default, deserialize_with = "provider_time::deserialize_lenient")]
    pub available_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub address1: Option<String>,
    #[serde(default)]
    pub address2: Option<String>,
    #[serde(default)]
    pub address3: Option<String>,
    pub cost: i32,
    #[serde(default)]
    pub price: i32,
    pub size: i32,
    pub rooms: i32,
    #[serde(default)]
    pub floor: i32,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "planningdescription", default)]
    pub planning_description: Option<String>,
    #[serde(rename = "builtyear", default)]
    pub built_year: Option<i32>,
    #[serde(rename = "rebuiltyear", default)]
    pub rebuilt_year: Option<i32>,
    #[serde(rename = "flatno", default)]
    pub flat_no: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(rename = "imageurl", default)]
    pub image_url: Option<String>,
    #[serde(rename = "planningimageurl", default)]
    pub planning_image_url: Option<String>,
    #[serde(rename = "stateid", default)]
    pub state_id: Option<String>,
    #[serde(rename = "statename", default)]
    pub state_name: Option<String>,
    #[serde(rename = "areaid", default)]
    pub area_id: Option<String>,
    #[serde(rename = "areaname", default)]
    pub area_name: Option<String>,
    #[serde(rename = "streetviewpitch", default)]
    pub street_view_pitch: f64,
    #[serde(rename = "streetviewheading", default)]
    pub street_view_heading: f64,
    #[serde(rename = "streetviewzoom", default)]
    pub street_view_zoom: f64,
    #[serde(rename = "showweb", default)]
    pub show_web: bool,
    #[serde(rename = "directsearch", default)]
    pub direct_search: bool,
    #[serde(rename = "randomsort", default)]
    pub random_sort: bool,
    #[serde(rename = "residentsonly", default)]
    pub residents_only: bool,
    #[serde(default)]
    pub focus: bool,
    #[serde(default)]
    pub elevator: bool,
    #[serde(default)]
    pub balcony: bool,
    #[serde(rename = "datecreated", default, deserialize_with = "provider_time::deserialize_lenient")]
    pub date_created: Option<DateTime<Utc>>,
    #[serde(rename = "datechanged", default, deserialize_with = "provider_time::deserialize_lenient")]
    pub date_changed: Option<DateTime<Utc>>,
    #[serde(rename = "dateimported", default, deserialize_with = "provider_time::deserialize_lenient")]
    pub date_imported: Option<DateTime<Utc>>,
}

impl RemoteListing {
    /// Monthly cost per square metre; absent when the size is unknown.
    pub fn cost_per_area(&self) -> Option<f64> {
        if self.size == 0 {
            None
        } else {
            Some(f64::from(self.cost) / f64::from(self.size))
        }
    }

    pub fn geocode_query(&self) -> Option<String> {
        geocode_query([
            self.address1.as_deref(),
            self.address2.as_deref(),
            self.address3.as_deref(),
        ])
    }
}

/// `"address1, address2, address3, Sweden"`, only when all three lines are present.
pub fn geocode_query(address_lines: [Option<&str>; 3]) -> Option<String> {
    let mut parts = Vec::with_capacity(4);
    for line in address_lines {
        parts.push(line.map(str::trim).filter(|l| !l.is_empty())?);
    }
    parts.push(GEOCODE_COUNTRY);
    Some(parts.join(", "))
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub const UNRESOLVED: Coordinates = Coordinates {
        latitude: 0.0,
        longitude: 0.0,
    };

    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    pub fn is_resolved(&self) -> bool {
        !(self.latitude == 0.0 && self.longitude == 0.0)
    }
}

/// Persisted listing: the provider's data plus locally owned enrichment and bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Listing {
    /// Store row id; `0` until the store assigns one on insert.
    pub id: i64,
    pub remote: RemoteListing,
    pub coordinates: Coordinates,
    #[serde(skip)]
    pub image_data: Option<Vec<u8>>,
    #[serde(skip)]
    pub plan_document: Option<Vec<u8>>,
    pub imported_at: DateTime<Utc>,
    pub evaluated_for_notification: bool,
}

impl Listing {
    pub fn from_remote(remote: RemoteListing, imported_at: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            remote,
            coordinates: Coordinates::UNRESOLVED,
            image_data: None,
            plan_document: None,
            imported_at,
            evaluated_for_notification: false,
        }
    }

    /// Full overwrite of the provider-owned fields. Enrichment, `imported_at` and the
    /// evaluation mark survive.
    pub fn apply_remote(&mut self, remote: RemoteListing) {
        self.remote = remote;
    }

    pub fn external_id(&self) -> &str {
        &self.remote.external_id
    }

}

/// The slice of a stored listing that enrichment scheduling looks at; cached blobs are
/// reduced to presence flags.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichmentCandidate {
    pub id: i64,
    pub external_id: String,
    pub geocode_query: Option<String>,
    pub image_url: Option<String>,
    pub coordinates: Coordinates,
    pub has_image: bool,
    pub has_plan_document: bool,
}

impl EnrichmentCandidate {
    pub fn needs_coordinates(&self) -> bool {
        !self.coordinates.is_resolved() && self.geocode_query.is_some()
    }

    pub fn needs_image(&self) -> bool {
        !self.has_image && self.image_url.is_some()
    }

    pub fn needs_plan_document(&self) -> bool {
        !self.has_plan_document
    }

    pub fn needs_any(&self) -> bool {
        self.needs_coordinates() || self.needs_image() || self.needs_plan_document()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sorting {
    #[default]
    NewestAscending,
    NewestDescending,
    PriceAscending,
    PriceDescending,
    SizeAscending,
    SizeDescending,
    CostPerAreaAscending,
    CostPerAreaDescending,
}

impl Sorting {
    pub const ALL: [Sorting; 8] = [
        Sorting::NewestAscending,
        Sorting::NewestDescending,
        Sorting::PriceAscending,
        Sorting::PriceDescending,
        Sorting::SizeAscending,
        Sorting::SizeDescending,
        Sorting::CostPerAreaAscending,
        Sorting::CostPerAreaDescending,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Sorting::NewestAscending => "newest_ascending",
            Sorting::NewestDescending => "newest_descending",
            Sorting::PriceAscending => "price_ascending",
            Sorting::PriceDescending => "price_descending",
            Sorting::SizeAscending => "size_ascending",
            Sorting::SizeDescending => "size_descending",
            Sorting::CostPerAreaAscending => "cost_per_area_ascending",
            Sorting::CostPerAreaDescending => "cost_per_area_descending",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Sorting::NewestAscending => "Nyast ↑",
            Sorting::NewestDescending => "Nyast ↓",
            Sorting::PriceAscending => "Pris ↑",
            Sorting::PriceDescending => "Pris ↓",
            Sorting::SizeAscending => "Störst ↑",
            Sorting::SizeDescending => "Störst ↓",
            Sorting::CostPerAreaAscending => "kr/kvm ↑",
            Sorting::CostPerAreaDescending => "kr/kvm ↓",
        }
    }

    pub fn is_ascending(&self) -> bool {
        matches!(
            self,
            Sorting::NewestAscending
                | Sorting::PriceAscending
                | Sorting::SizeAscending
                | Sorting::CostPerAreaAscending
        )
    }

    /// In-memory ordering, identical to the store's `ORDER BY` for the same sort.
    pub fn compare(&self, a: &Listing, b: &Listing) -> Ordering {
        let ordering = match self {
            Sorting::NewestAscending | Sorting::NewestDescending => a
                .remote
                .show_date_end
                .cmp(&b.remote.show_date_end)
                .then(a.imported_at.cmp(&b.imported_at)),
            Sorting::PriceAscending | Sorting::PriceDescending => a.remote.cost.cmp(&b.remote.cost),
            Sorting::SizeAscending | Sorting::SizeDescending => a.remote.size.cmp(&b.remote.size),
            Sorting::CostPerAreaAscending | Sorting::CostPerAreaDescending => a
                .remote
                .cost_per_area()
                .partial_cmp(&b.remote.cost_per_area())
                .unwrap_or(Ordering::Equal),
        };
        if self.is_ascending() {
            ordering
        } else {
            ordering.reverse()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown sort order `{0}`")]
pub struct UnknownSorting(pub String);

impl FromStr for Sorting {
    type Err = UnknownSorting;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Sorting::ALL
            .into_iter()
            .find(|sorting| sorting.as_str() == s)
            .ok_or_else(|| UnknownSorting(s.to_string()))
    }
}

/// A single typed comparison against a listing.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    CostAtMost(i32),
    SizeAtLeast(i32),
    RoomsIn(BTreeSet<i32>),
    ShowDateEndAfter(DateTime<Utc>),
}

impl Condition {
    pub fn matches(&self, listing: &Listing) -> bool {
        let remote = &listing.remote;
        match self {
            Condition::CostAtMost(max) => remote.cost <= *max,
            Condition::SizeAtLeast(min) => remote.size >= *min,
            Condition::RoomsIn(rooms) => rooms.contains(&remote.rooms),
            Condition::ShowDateEndAfter(at) => remote.show_date_end.is_some_and(|end| end > *at),
        }
    }
}

/// Conjunction of [`Condition`]s. The empty predicate matches everything.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ListingPredicate {
    conditions: Vec<Condition>,
}

impl ListingPredicate {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn and(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn matches(&self, listing: &Listing) -> bool {
        self.conditions.iter().all(|c| c.matches(listing))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FilterCriteria {
    /// Acceptable room counts; empty means any.
    pub rooms: BTreeSet<i32>,
    /// Square metres; `0` means no lower bound.
    pub min_area: i32,
    /// Monthly rent; `0` means no upper bound.
    pub max_rent: i32,
    pub sorting: Sorting,
}

impl FilterCriteria {
    pub fn predicate(&self, now: DateTime<Utc>) -> ListingPredicate {
        let mut predicate = ListingPredicate::all();
        if self.max_rent > 0 {
            predicate = predicate.and(Condition::CostAtMost(self.max_rent));
        }
        if self.min_area > 0 {
            predicate = predicate.and(Condition::SizeAtLeast(self.min_area));
        }
        if !self.rooms.is_empty() {
            predicate = predicate.and(Condition::RoomsIn(self.rooms.clone()));
        }
        predicate.and(Condition::ShowDateEndAfter(now))
    }

    pub fn matches(&self, listing: &Listing, now: DateTime<Utc>) -> bool {
        self.predicate(now).matches(listing)
    }

    pub fn rent_description(&self) -> Option<String> {
        (self.max_rent > 0).then(|| format!("max {}", format_sek(self.max_rent)))
    }

    pub fn area_description(&self) -> Option<String> {
        (self.min_area > 0).then(|| format!("{}+ kvm", self.min_area))
    }

    /// Consecutive room counts collapse into ranges: `{1, 2, 3, 5}` -> `"1-3+5 rum"`.
    pub fn rooms_description(&self) -> Option<String> {
        let mut runs: Vec<(i32, i32)> = Vec::new();
        for &rooms in &self.rooms {
            match runs.last_mut() {
                Some((_, end)) if *end + 1 == rooms => *end = rooms,
                _ => runs.push((rooms, rooms)),
            }
        }
        if runs.is_empty() {
            return None;
        }
        let text = runs
            .iter()
            .map(|(start, end)| {
                if start == end {
                    start.to_string()
                } else {
                    format!("{start}-{end}")
                }
            })
            .collect::<Vec<_>>()
            .join("+");
        Some(format!("{text} rum"))
    }

    pub fn summary(&self) -> String {
        let parts = [
            self.rooms_description(),
            self.area_description(),
            self.rent_description(),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();
        if parts.is_empty() {
            "alla objekt".to_string()
        } else {
            parts.join(", ")
        }
    }
}

/// Saved query. Exactly one filter is primary; the others are notification alerts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub is_primary: bool,
    pub criteria: FilterCriteria,
}

impl Filter {
    pub fn matches(&self, listing: &Listing, now: DateTime<Utc>) -> bool {
        self.criteria.matches(listing, now)
    }
}

/// One row per completed background cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncAuditRecord {
    pub id: i64,
    pub recorded_at: DateTime<Utc>,
    pub objects_before: i32,
    pub objects_after: i32,
    pub notifications_sent: i32,
}

/// Coarse result reported to the host after a background cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchOutcome {
    NoData,
    NewData,
    Failed,
}

impl FetchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchOutcome::NoData => "no-data",
            FetchOutcome::NewData => "new-data",
            FetchOutcome::Failed => "failed",
        }
    }
}

impl fmt::Display for FetchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalNotification {
    pub id: Uuid,
    pub listing_external_id: String,
    pub title: String,
    pub body: String,
    pub badge: u32,
    pub deliver_after: Duration,
    /// Thumbnail bytes, attached when the listing image is cached.
    pub attachment: Option<Vec<u8>>,
}

impl LocalNotification {
    pub const DELIVERY_DELAY: Duration = Duration::from_secs(1);

    pub fn for_listing(listing: &Listing) -> Self {
        let remote = &listing.remote;
        let address = remote.address1.as_deref().unwrap_or("Okänd adress");
        let area = remote.area_name.as_deref().unwrap_or("Okänd plats");
        Self {
            id: Uuid::new_v4(),
            listing_external_id: remote.external_id.clone(),
            title: format!("{address}, {area}"),
            body: format!(
                "{} rum, {} / mån, {} kvm, vån {}",
                remote.rooms,
                format_sek(remote.cost),
                remote.size,
                remote.floor
            ),
            badge: 1,
            deliver_after: Self::DELIVERY_DELAY,
            attachment: listing.image_data.clone(),
        }
    }
}

/// `6469` -> `"6 469 kr"`.
pub fn format_sek(amount: i32) -> String {
    let digits = amount.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(' ');
        }
        grouped.push(ch);
    }
    let sign = if amount < 0 { "-" } else { "" };
    format!("{sign}{grouped} kr")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 7, 3, 12, 0, 0).single().unwrap()
    }

    fn listing(cost: i32, size: i32, rooms: i32) -> Listing {
        Listing::from_remote(
            RemoteListing {
                external_id: format!("1305-97-{cost}"),
                cost,
                size,
                rooms,
                show_date_end: Some(now() + ChronoDuration::days(3)),
                ..Default::default()
            },
            now(),
        )
    }

    #[test]
    fn max_rent_excludes_more_expensive_listings_regardless_of_rooms_or_size() {
        let criteria = FilterCriteria {
            max_rent: 4500,
            ..Default::default()
        };
        assert!(criteria.matches(&listing(4500, 10, 1), now()));
        assert!(!criteria.matches(&listing(4501, 120, 5), now()));
        assert!(!criteria.matches(&listing(9000, 30, 2), now()));
    }

    #[test]
    fn zero_and_empty_constraints_are_ignored() {
        let criteria = FilterCriteria::default();
        let predicate = criteria.predicate(now());
        assert_eq!(predicate.conditions().len(), 1);
        assert!(predicate.matches(&listing(25_000, 0, 9)));
    }

    #[test]
    fn min_area_and_rooms_are_conjunctive() {
        let criteria = FilterCriteria {
            rooms: BTreeSet::from([2, 3]),
            min_area: 60,
            ..Default::default()
        };
        assert!(criteria.matches(&listing(6000, 77, 3), now()));
        assert!(!criteria.matches(&listing(6000, 59, 3), now()));
        assert!(!criteria.matches(&listing(6000, 77, 4), now()));
    }

    #[test]
    fn expired_or_undated_listings_never_match() {
        let criteria = FilterCriteria::default();
        let mut expired = listing(5000, 40, 2);
        expired.remote.show_date_end = Some(now() - ChronoDuration::minutes(1));
        assert!(!criteria.matches(&expired, now()));

        let mut undated = listing(5000, 40, 2);
        undated.remote.show_date_end = None;
        assert!(!criteria.matches(&undated, now()));
    }

    #[test]
    fn cost_per_area_guards_against_zero_size() {
        assert_eq!(listing(6000, 0, 2).remote.cost_per_area(), None);
        assert_eq!(listing(6000, 60, 2).remote.cost_per_area(), Some(100.0));
    }

    #[test]
    fn apply_remote_preserves_local_state() {
        let mut existing = listing(6000, 60, 2);
        existing.coordinates = Coordinates::new(55.7, 13.2);
        existing.image_data = Some(vec![1, 2, 3]);
        existing.plan_document = Some(vec![4]);
        existing.evaluated_for_notification = true;
        let imported_at = existing.imported_at;

        let refreshed = RemoteListing {
            external_id: existing.remote.external_id.clone(),
            cost: 6200,
            size: 60,
            rooms: 2,
            ..Default::default()
        };
        existing.apply_remote(refreshed);

        assert_eq!(existing.remote.cost, 6200);
        assert_eq!(existing.coordinates, Coordinates::new(55.7, 13.2));
        assert_eq!(existing.image_data.as_deref(), Some(&[1u8, 2, 3][..]));
        assert_eq!(existing.plan_document.as_deref(), Some(&[4u8][..]));
        assert_eq!(existing.imported_at, imported_at);
        assert!(existing.evaluated_for_notification);
    }

    #[test]
    fn geocode_query_requires_all_address_lines() {
        let mut remote = RemoteListing {
            address1: Some("Örnvägen 102".into()),
            address2: Some("227 31".into()),
            address3: Some("Lund".into()),
            ..Default::default()
        };
        assert_eq!(
            remote.geocode_query().as_deref(),
            Some("Örnvägen 102, 227 31, Lund, Sweden")
        );
        remote.address2 = Some("  ".into());
        assert_eq!(remote.geocode_query(), None);
    }

    #[test]
    fn provider_dates_accept_both_formats() {
        // Summer time: Stockholm is UTC+2.
        let plain = provider_time::parse("2019-07-01T00:00:00").expect("plain");
        assert_eq!(plain, Utc.with_ymd_and_hms(2019, 6, 30, 22, 0, 0).single().unwrap());

        // Winter time: UTC+1.
        let winter = provider_time::parse("2019-01-15T12:00:00").expect("winter");
        assert_eq!(winter, Utc.with_ymd_and_hms(2019, 1, 15, 11, 0, 0).single().unwrap());

        let fractional = provider_time::parse("2019-07-01T08:06:58.67").expect("fractional");
        assert_eq!(fractional.timestamp_subsec_millis(), 670);

        assert!(provider_time::parse("01/07/2019").is_none());
    }

    #[test]
    fn show_end_in_local_evening_has_expired_by_utc_late_evening() {
        let end = provider_time::parse("2019-07-15T23:59:00").expect("end");
        assert_eq!(end, Utc.with_ymd_and_hms(2019, 7, 15, 21, 59, 0).single().unwrap());

        let mut l = listing(5000, 40, 2);
        l.remote.show_date_end = Some(end);
        let half_past_ten_utc = Utc.with_ymd_and_hms(2019, 7, 15, 22, 30, 0).single().unwrap();
        assert!(!FilterCriteria::default().matches(&l, half_past_ten_utc));
        let half_past_nine_utc = Utc.with_ymd_and_hms(2019, 7, 15, 21, 30, 0).single().unwrap();
        assert!(FilterCriteria::default().matches(&l, half_past_nine_utc));
    }

    #[test]
    fn dst_edges_resolve_to_an_instant() {
        // 02:30 does not exist on 2019-03-31; 02:30 happens twice on 2019-10-27.
        let gap = provider_time::parse("2019-03-31T02:30:00").expect("gap");
        assert_eq!(gap, Utc.with_ymd_and_hms(2019, 3, 31, 1, 30, 0).single().unwrap());
        let fold = provider_time::parse("2019-10-27T02:30:00").expect("fold");
        assert_eq!(fold, Utc.with_ymd_and_hms(2019, 10, 27, 0, 30, 0).single().unwrap());
    }

    #[test]
    fn remote_listing_decodes_with_lenient_dates() {
        let before = Utc::now();
        let json = r#"{
            "id": "1305-97-0121",
            "objectgroup": 1,
            "objecttype": 7,
            "showdatestart": "2019-07-01T00:00:00",
            "showdateend": "not a date",
            "moveoutdate": null,
            "address1": "Örnvägen 102",
            "cost": 6469,
            "price": 0,
            "size": 77,
            "rooms": 3,
            "floor": 2,
            "builtyear": null,
            "balcony": true,
            "datechanged": "2019-07-01T08:06:58.67"
        }"#;
        let remote: RemoteListing = serde_json::from_str(json).expect("decode");

        assert_eq!(remote.external_id, "1305-97-0121");
        assert_eq!(remote.object_type, 7);
        assert!(remote.show_date_start.is_some());
        assert!(remote.show_date_end.expect("fallback") >= before);
        assert_eq!(remote.move_out_date, None);
        assert_eq!(remote.move_in_date, None);
        assert_eq!(remote.built_year, None);
        assert!(remote.balcony);
    }

    #[test]
    fn remote_listing_requires_reconciliation_key() {
        let json = r#"{"cost": 1, "size": 1, "rooms": 1}"#;
        assert!(serde_json::from_str::<RemoteListing>(json).is_err());
    }

    #[test]
    fn filter_descriptions_follow_app_wording() {
        let criteria = FilterCriteria {
            rooms: BTreeSet::from([1, 2, 3, 5]),
            min_area: 40,
            max_rent: 12_500,
            sorting: Sorting::PriceAscending,
        };
        assert_eq!(criteria.rooms_description().as_deref(), Some("1-3+5 rum"));
        assert_eq!(criteria.area_description().as_deref(), Some("40+ kvm"));
        assert_eq!(criteria.rent_description().as_deref(), Some("max 12 500 kr"));
        assert_eq!(FilterCriteria::default().summary(), "alla objekt");
    }

    #[test]
    fn enrichment_needs_follow_missing_fields() {
        let candidate = EnrichmentCandidate {
            id: 1,
            external_id: "A".into(),
            geocode_query: Some("Örnvägen 102, 227 31, Lund, Sweden".into()),
            image_url: None,
            coordinates: Coordinates::UNRESOLVED,
            has_image: false,
            has_plan_document: true,
        };
        assert!(candidate.needs_coordinates());
        assert!(!candidate.needs_image());
        assert!(!candidate.needs_plan_document());

        let resolved = EnrichmentCandidate {
            coordinates: Coordinates::new(55.7, 13.2),
            ..candidate
        };
        assert!(!resolved.needs_any());
    }

    #[test]
    fn unknown_sorting_message_names_the_input() {
        let err = "cheapest".parse::<Sorting>().expect_err("unknown");
        assert_eq!(err.to_string(), "unknown sort order `cheapest`");
    }

    #[test]
    fn sorting_names_round_trip() {
        for sorting in Sorting::ALL {
            assert_eq!(sorting.as_str().parse::<Sorting>(), Ok(sorting));
        }
        assert!("cheapest".parse::<Sorting>().is_err());
    }

    #[test]
    fn descending_sort_reverses_order() {
        let cheap = listing(4000, 40, 1);
        let dear = listing(9000, 40, 1);
        assert_eq!(Sorting::PriceAscending.compare(&cheap, &dear), Ordering::Less);
        assert_eq!(Sorting::PriceDescending.compare(&cheap, &dear), Ordering::Greater);
    }

    #[test]
    fn notification_text_uses_address_area_and_facts() {
        let mut l = listing(6469, 77, 3);
        l.remote.address1 = Some("Örnvägen 102".into());
        l.remote.area_name = Some("Lövsångaren 5 m fl".into());
        l.remote.floor = 2;
        l.image_data = Some(vec![0xff, 0xd8]);

        let notification = LocalNotification::for_listing(&l);
        assert_eq!(notification.title, "Örnvägen 102, Lövsångaren 5 m fl");
        assert_eq!(notification.body, "3 rum, 6 469 kr / mån, 77 kvm, vån 2");
        assert_eq!(notification.badge, 1);
        assert_eq!(notification.attachment.as_deref(), Some(&[0xffu8, 0xd8][..]));
    }

    #[test]
    fn sek_formatting_groups_thousands() {
        assert_eq!(format_sek(0), "0 kr");
        assert_eq!(format_sek(950), "950 kr");
        assert_eq!(format_sek(6469), "6 469 kr");
        assert_eq!(format_sek(1_234_567), "1 234 567 kr");
    }
}
