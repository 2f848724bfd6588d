//! Listing sync pipeline: reconcile, enrich, match alerts and notify.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use lkf_adapters::{
    FixtureProvider, ListingProvider, LkfProvider, NominatimGeocoder, ProviderConfig,
    ProviderError, DEFAULT_API_BASE, DEFAULT_GEOCODER_URL, DEFAULT_PLAN_BASE,
};
use lkf_storage::{EntityStore, HttpClientConfig, HttpFetcher, RateLimit, StoreError};
use thiserror::Error;
use tracing::info;

mod coordinator;
mod engine;
mod notify;
mod work_group;

pub use coordinator::{build_scheduler, maybe_build_scheduler, BackgroundFetchCoordinator};
pub use engine::{EnrichmentKind, ReconcileSummary, SyncEngine, SyncOrigin, UpdateSummary};
pub use notify::{NotificationEngine, Notifier, OutboxEnvelope, OutboxNotifier};
pub use tokio_cron_scheduler::JobScheduler;
pub use work_group::{WorkGroup, WorkGuard};

pub const CRATE_NAME: &str = "lkf-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("provider: {0}")]
    Provider(#[from] ProviderError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_path: PathBuf,
    pub api_base: String,
    pub plan_base: String,
    pub geocoder_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub notifications_enabled: bool,
    pub outbox_dir: PathBuf,
    pub scheduler_enabled: bool,
    /// Six-field cron expression (seconds first).
    pub sync_cron: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./lkf.db"),
            api_base: DEFAULT_API_BASE.to_string(),
            plan_base: DEFAULT_PLAN_BASE.to_string(),
            geocoder_url: DEFAULT_GEOCODER_URL.to_string(),
            user_agent: "lkf-rental-watch/0.1".to_string(),
            http_timeout_secs: 20,
            notifications_enabled: true,
            outbox_dir: PathBuf::from("./outbox"),
            scheduler_enabled: false,
            sync_cron: "0 0 * * * *".to_string(),
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| {
        matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_path: std::env::var("LKF_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            api_base: std::env::var("LKF_API_BASE").unwrap_or(defaults.api_base),
            plan_base: std::env::var("LKF_PLAN_BASE").unwrap_or(defaults.plan_base),
            geocoder_url: std::env::var("LKF_GEOCODER_URL").unwrap_or(defaults.geocoder_url),
            user_agent: std::env::var("LKF_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("LKF_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            notifications_enabled: env_flag("LKF_NOTIFICATIONS_ENABLED")
                .unwrap_or(defaults.notifications_enabled),
            outbox_dir: std::env::var("LKF_OUTBOX_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.outbox_dir),
            scheduler_enabled: env_flag("LKF_SCHEDULER_ENABLED")
                .unwrap_or(defaults.scheduler_enabled),
            sync_cron: std::env::var("LKF_SYNC_CRON").unwrap_or(defaults.sync_cron),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    /// One request per second, one at a time.
    pub fn geocoder_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            max_in_flight_per_lane: 1,
            rate_limit: Some(RateLimit {
                burst: 1,
                interval: Duration::from_secs(1),
            }),
            ..self.http_client_config()
        }
    }
}

/// Everything a host needs to run cycles against one database.
pub struct SyncContext {
    pub config: SyncConfig,
    pub store: EntityStore,
    pub engine: Arc<SyncEngine>,
    pub coordinator: Arc<BackgroundFetchCoordinator>,
}

impl SyncContext {
    /// Wires the live services. With `fixture`, listings come from that recorded payload
    /// instead of the provider API.
    pub async fn open(config: SyncConfig, fixture: Option<&Path>) -> anyhow::Result<Self> {
        let store = EntityStore::open(&config.database_path)
            .await
            .with_context(|| format!("opening store {}", config.database_path.display()))?;

        let provider: Arc<dyn ListingProvider> = match fixture {
            Some(path) => {
                info!(path = %path.display(), "using fixture provider");
                Arc::new(FixtureProvider::new(path))
            }
            None => {
                let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
                Arc::new(LkfProvider::new(
                    http,
                    ProviderConfig {
                        api_base: config.api_base.clone(),
                        plan_base: config.plan_base.clone(),
                    },
                ))
            }
        };
        let geocoder = Arc::new(NominatimGeocoder::new(
            Arc::new(HttpFetcher::new(config.geocoder_client_config())?),
            config.geocoder_url.clone(),
        ));
        let notifier = Arc::new(OutboxNotifier::new(config.outbox_dir.clone()));

        let engine = Arc::new(SyncEngine::new(store.clone(), provider, geocoder));
        let notifications =
            NotificationEngine::new(store.clone(), notifier, config.notifications_enabled);
        let coordinator = Arc::new(BackgroundFetchCoordinator::new(
            store.clone(),
            Arc::clone(&engine),
            notifications,
        ));

        Ok(Self {
            config,
            store,
            engine,
            coordinator,
        })
    }
}
