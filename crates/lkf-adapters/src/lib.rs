//! Provider contracts and implementations: the LKF listing API, floor-plan scraping and
//! geocoding.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use anyhow::Context;
use async_trait::async_trait;
use lkf_core::{Coordinates, RemoteListing};
use lkf_storage::{FetchError, HttpFetcher};
use regex::Regex;
use reqwest::Url;
use scraper::{Html, Selector};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "lkf-adapters";

pub const DEFAULT_API_BASE: &str = "https://www.lkf.se/";
pub const DEFAULT_PLAN_BASE: &str = "https://cqwih2.se/his_lkf/";
pub const DEFAULT_GEOCODER_URL: &str = "https://nominatim.openstreetmap.org/";

const AVAILABLE_OBJECTS_PATH: &str = "api/AvailableObjects/Type/?id=1";
const PLAN_IMAGE_MARKER: &str = "ReturnImageP.asp";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error(transparent)]
    Network(#[from] FetchError),
    #[error("could not decode provider payload: {0}")]
    Decode(String),
    #[error("floor plan marker not found for {0}")]
    Scrape(String),
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("reading fixture {path}: {source}")]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} is not available offline")]
    Offline(&'static str),
}

/// Remote source of listings and their attachments.
#[async_trait]
pub trait ListingProvider: Send + Sync {
    async fn fetch_listings(&self) -> Result<Vec<RemoteListing>, ProviderError>;

    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, ProviderError>;

    /// Resolves the floor-plan image for a listing and returns its bytes.
    async fn fetch_plan_document(&self, external_id: &str) -> Result<Vec<u8>, ProviderError>;
}

/// Forward geocoding. `Ok(None)` means the service answered without a hit.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, query: &str) -> Result<Option<Coordinates>, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_base: String,
    pub plan_base: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            plan_base: DEFAULT_PLAN_BASE.to_string(),
        }
    }
}

fn join_url(base: &str, path: &str) -> Result<Url, ProviderError> {
    let base = if base.ends_with('/') {
        base.to_string()
    } else {
        format!("{base}/")
    };
    let invalid = |reason: String| ProviderError::InvalidUrl {
        url: format!("{base}{path}"),
        reason,
    };
    Url::parse(&base)
        .and_then(|b| b.join(path))
        .map_err(|e| invalid(e.to_string()))
}

pub fn available_objects_url(api_base: &str) -> Result<Url, ProviderError> {
    join_url(api_base, AVAILABLE_OBJECTS_PATH)
}

/// Print page of the floor-plan viewer for one object.
pub fn plan_print_url(plan_base: &str, external_id: &str) -> Result<Url, ProviderError> {
    let id = external_id.trim();
    let path = format!(
        "HOPAGetPrint4Object.asp?PT=hopamall&O=P\
         &HN1=HDocHierarchyDef2&OC1=HDV_H2_OBJECT&MM1=2&SMP1=100&UV1=1&SM1=3&S1=100&SC1=%23FFFFFF&ID1={id}\
         &HN2=HDocHierarchyDef2&DFS2=1&UV=0&SC2=%23008000&OC2=HDV_H2_OBJECT&ID2={id}\
         &HN3=HDocHierarchyDef3&DFO3=1&OC3=HDV_H3_OBJECT&ID3={id}\
         &HN4=HDocHierarchyDef2&DFO4=1&OC4=HDV_H2_OBJECT&ID4={id}&DN4=2"
    );
    join_url(plan_base, &path)
}

/// The API answers with a JSON string holding the real array. A one-element array
/// around that string, or a plain array of objects, is accepted too.
pub fn decode_available_listings(body: &[u8]) -> Result<Vec<RemoteListing>, ProviderError> {
    let value: JsonValue =
        serde_json::from_slice(body).map_err(|e| ProviderError::Decode(e.to_string()))?;

    let inner = match value {
        JsonValue::String(text) => text,
        JsonValue::Array(items) => match <[JsonValue; 1]>::try_from(items) {
            Ok([JsonValue::String(text)]) => text,
            Ok(single) => return decode_records(JsonValue::Array(Vec::from(single))),
            Err(items) => return decode_records(JsonValue::Array(items)),
        },
        other => {
            return Err(ProviderError::Decode(format!(
                "expected a string or array payload, got {}",
                json_kind(&other)
            )))
        }
    };

    serde_json::from_str(&inner).map_err(|e| ProviderError::Decode(e.to_string()))
}

fn decode_records(value: JsonValue) -> Result<Vec<RemoteListing>, ProviderError> {
    serde_json::from_value(value).map_err(|e| ProviderError::Decode(e.to_string()))
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn plan_image_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"ReturnImageP\.asp[^"]+"#).ok())
        .as_ref()
}

/// Finds the floor-plan image path (`ReturnImageP.asp?...`) in a print page.
pub fn extract_plan_image_path(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let from_img = Selector::parse(r#"img[src*="ReturnImageP.asp"]"#)
        .ok()
        .and_then(|sel| {
            document
                .select(&sel)
                .filter_map(|n| n.value().attr("src"))
                .find_map(|src| src.find(PLAN_IMAGE_MARKER).map(|at| src[at..].to_string()))
        });
    if from_img.is_some() {
        return from_img;
    }

    plan_image_regex()?
        .find(html)
        .map(|m| m.as_str().replace("&amp;", "&"))
}

/// Coordinates of the first hit of a Nominatim `jsonv2` search response.
pub fn parse_geocode_response(body: &[u8]) -> Result<Option<Coordinates>, ProviderError> {
    let value: JsonValue =
        serde_json::from_slice(body).map_err(|e| ProviderError::Decode(e.to_string()))?;
    let Some(first) = value.as_array().and_then(|hits| hits.first()) else {
        return Ok(None);
    };
    let coordinate = |key: &str| -> Option<f64> {
        match first.get(key)? {
            JsonValue::String(s) => s.trim().parse().ok(),
            JsonValue::Number(n) => n.as_f64(),
            _ => None,
        }
    };
    match (coordinate("lat"), coordinate("lon")) {
        (Some(latitude), Some(longitude)) => Ok(Some(Coordinates::new(latitude, longitude))),
        _ => Err(ProviderError::Decode("geocode hit without lat/lon".to_string())),
    }
}

/// HTTP client for the LKF listing API and the floor-plan viewer.
#[derive(Debug, Clone)]
pub struct LkfProvider {
    http: Arc<HttpFetcher>,
    config: ProviderConfig,
}

impl LkfProvider {
    pub fn new(http: Arc<HttpFetcher>, config: ProviderConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl ListingProvider for LkfProvider {
    async fn fetch_listings(&self) -> Result<Vec<RemoteListing>, ProviderError> {
        let url = available_objects_url(&self.config.api_base)?;
        let response = self.http.fetch_once("provider", url.as_str()).await?;
        let listings = decode_available_listings(&response.body)?;
        info!(count = listings.len(), "fetched available objects");
        Ok(listings)
    }

    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, ProviderError> {
        Ok(self.http.fetch_bytes("images", url).await?.body)
    }

    async fn fetch_plan_document(&self, external_id: &str) -> Result<Vec<u8>, ProviderError> {
        let print_url = plan_print_url(&self.config.plan_base, external_id)?;
        let page = self.http.fetch_bytes("plans", print_url.as_str()).await?;
        let html = String::from_utf8_lossy(&page.body);
        let image_path = extract_plan_image_path(&html)
            .ok_or_else(|| ProviderError::Scrape(external_id.to_string()))?;
        debug!(external_id, %image_path, "resolved floor plan");
        let image_url = join_url(&self.config.plan_base, &image_path)?;
        Ok(self.http.fetch_bytes("plans", image_url.as_str()).await?.body)
    }
}

/// Nominatim-compatible forward geocoder.
#[derive(Debug, Clone)]
pub struct NominatimGeocoder {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl NominatimGeocoder {
    /// `http` should carry the service's rate limit (one request per second for the
    /// public instance).
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn search_url(&self, query: &str) -> Result<Url, ProviderError> {
        let mut url = join_url(&self.base_url, "search")?;
        url.query_pairs_mut()
            .append_pair("format", "jsonv2")
            .append_pair("limit", "1")
            .append_pair("q", query);
        Ok(url)
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn geocode(&self, query: &str) -> Result<Option<Coordinates>, ProviderError> {
        let url = self.search_url(query)?;
        let response = self.http.fetch_bytes("geocoder", url.as_str()).await?;
        let hit = parse_geocode_response(&response.body)?;
        if hit.is_none() {
            warn!(query, "geocoder returned no hit");
        }
        Ok(hit)
    }
}

/// Reads a recorded `AvailableObjects` body from disk.
pub fn load_fixture_payload(path: impl AsRef<Path>) -> anyhow::Result<Vec<RemoteListing>> {
    let path = path.as_ref();
    let body = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    decode_available_listings(&body).with_context(|| format!("decoding {}", path.display()))
}

/// Offline provider serving a recorded payload. Attachments are not available.
#[derive(Debug, Clone)]
pub struct FixtureProvider {
    payload_path: PathBuf,
}

impl FixtureProvider {
    pub fn new(payload_path: impl Into<PathBuf>) -> Self {
        Self {
            payload_path: payload_path.into(),
        }
    }

    pub fn payload_path(&self) -> &Path {
        &self.payload_path
    }
}

#[async_trait]
impl ListingProvider for FixtureProvider {
    async fn fetch_listings(&self) -> Result<Vec<RemoteListing>, ProviderError> {
        let body = tokio::fs::read(&self.payload_path)
            .await
            .map_err(|source| ProviderError::Fixture {
                path: self.payload_path.clone(),
                source,
            })?;
        let listings = decode_available_listings(&body)?;
        info!(count = listings.len(), path = %self.payload_path.display(), "loaded fixture payload");
        Ok(listings)
    }

    async fn fetch_image(&self, _url: &str) -> Result<Vec<u8>, ProviderError> {
        Err(ProviderError::Offline("listing image"))
    }

    async fn fetch_plan_document(&self, _external_id: &str) -> Result<Vec<u8>, ProviderError> {
        Err(ProviderError::Offline("floor plan"))
    }
}
