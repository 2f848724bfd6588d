use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{Local, Utc};
use clap::{Parser, Subcommand};
use lkf_core::{format_sek, Filter, FilterCriteria, Listing, Sorting, SyncAuditRecord};
use lkf_storage::EntityStore;
use lkf_sync::{
    build_scheduler, maybe_build_scheduler, JobScheduler, SyncConfig, SyncContext, SyncOrigin,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "lkf-cli")]
#[command(about = "Watches LKF rental listings and notifies on saved alerts")]
struct Cli {
    /// Serve listings from a recorded payload instead of the provider API.
    #[arg(long, global = true)]
    fixture: Option<PathBuf>,

    /// Overrides LKF_DATABASE_PATH.
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one background cycle and print no-data, new-data or failed.
    Background,
    /// Fetch and sync listings and wait for enrichment. Everything fetched counts as seen
    /// and is never alerted on.
    Refresh,
    /// Run background cycles on LKF_SYNC_CRON until Ctrl-C.
    Schedule,
    /// Show listings matching a filter (the primary filter by default).
    Listings {
        #[arg(long)]
        filter: Option<i64>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    #[command(subcommand)]
    Filters(FilterCommands),
    /// Show recent sync cycles, newest first.
    Audit {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[derive(Debug, Subcommand)]
enum FilterCommands {
    List,
    /// Save a new alert filter.
    Add {
        #[arg(long, value_delimiter = ',')]
        rooms: Vec<i32>,
        #[arg(long, default_value_t = 0)]
        min_area: i32,
        #[arg(long, default_value_t = 0)]
        max_rent: i32,
        #[arg(long, default_value = "newest_ascending")]
        sort: String,
    },
    Remove { id: i64 },
    /// Change a filter's sort order.
    Sort { id: i64, sort: String },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_sorting(raw: &str) -> Result<Sorting> {
    raw.parse::<Sorting>().with_context(|| {
        let known = Sorting::ALL.map(|s| s.as_str()).join(", ");
        format!("expected one of: {known}")
    })
}

fn render_listing(listing: &Listing) -> String {
    let remote = &listing.remote;
    let ends = remote
        .show_date_end
        .map(|at| at.with_timezone(&Local).format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "-".to_string());
    let per_area = remote
        .cost_per_area()
        .map(|v| format!("{v:.0} kr/kvm"))
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{:<14} {:<28} {:<18} {} rum {:>4} kvm {:>10} {:>11}  t.o.m. {}",
        remote.external_id,
        remote.address1.as_deref().unwrap_or("Okänd adress"),
        remote.area_name.as_deref().unwrap_or("Okänd plats"),
        remote.rooms,
        remote.size,
        format_sek(remote.cost),
        per_area,
        ends
    )
}

fn render_filter(filter: &Filter) -> String {
    let kind = if filter.is_primary { "primary" } else { "alert" };
    format!(
        "{:>4}  {:<8} {:<40} {}",
        filter.id,
        kind,
        filter.criteria.summary(),
        filter.criteria.sorting.label()
    )
}

fn render_audit(record: &SyncAuditRecord) -> String {
    format!(
        "{}  before={} after={} notifications={}",
        record.recorded_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
        record.objects_before,
        record.objects_after,
        record.notifications_sent
    )
}

async fn run_filters(store: &EntityStore, command: FilterCommands) -> Result<()> {
    match command {
        FilterCommands::List => {
            for filter in store.filters().await? {
                println!("{}", render_filter(&filter));
            }
        }
        FilterCommands::Add {
            rooms,
            min_area,
            max_rent,
            sort,
        } => {
            let criteria = FilterCriteria {
                rooms: rooms.into_iter().collect::<BTreeSet<_>>(),
                min_area,
                max_rent,
                sorting: parse_sorting(&sort)?,
            };
            let filter = store.insert_filter(&criteria).await?;
            println!("{}", render_filter(&filter));
        }
        FilterCommands::Remove { id } => {
            store
                .delete_filter(id)
                .await
                .with_context(|| format!("removing filter {id}"))?;
            println!("removed filter {id}");
        }
        FilterCommands::Sort { id, sort } => {
            let existing = store
                .filter(id)
                .await?
                .with_context(|| format!("filter {id} not found"))?;
            let criteria = FilterCriteria {
                sorting: parse_sorting(&sort)?,
                ..existing.criteria
            };
            let filter = store.update_filter(id, &criteria).await?;
            println!("{}", render_filter(&filter));
        }
    }
    Ok(())
}

async fn run_scheduler(context: &SyncContext, mut scheduler: JobScheduler) -> Result<()> {
    scheduler.start().await.context("starting scheduler")?;
    info!(cron = %context.config.sync_cron, "scheduler running, Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutting down scheduler");
    scheduler.shutdown().await.context("stopping scheduler")?;
    context.engine.wait_for_enrichment().await;
    Ok(())
}

async fn run_background(context: &SyncContext) {
    let outcome = context.coordinator.run_background_cycle().await;
    context.engine.wait_for_enrichment().await;
    println!("{outcome}");
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = SyncConfig::from_env();
    if let Some(database) = cli.database {
        config.database_path = database;
    }
    let context = SyncContext::open(config, cli.fixture.as_deref()).await?;

    let Some(command) = cli.command else {
        // Bare invocation: the configured scheduler if enabled, otherwise one cycle.
        match maybe_build_scheduler(&context.config, context.coordinator.clone()).await? {
            Some(scheduler) => run_scheduler(&context, scheduler).await?,
            None => run_background(&context).await,
        }
        return Ok(());
    };

    match command {
        Commands::Background => run_background(&context).await,
        Commands::Refresh => {
            let summary = context.engine.update(SyncOrigin::Foreground).await?;
            context.engine.wait_for_enrichment().await;
            println!(
                "refreshed: fetched={} inserted={} updated={} skipped={} enrichment={}",
                summary.fetched,
                summary.reconcile.inserted,
                summary.reconcile.updated,
                summary.reconcile.skipped,
                summary.enrichment_scheduled
            );
        }
        Commands::Schedule => {
            let scheduler =
                build_scheduler(&context.config.sync_cron, context.coordinator.clone()).await?;
            run_scheduler(&context, scheduler).await?;
        }
        Commands::Listings { filter, limit } => {
            let filter = match filter {
                Some(id) => context
                    .store
                    .filter(id)
                    .await?
                    .with_context(|| format!("filter {id} not found"))?,
                None => context.store.ensure_primary_filter().await?,
            };
            let listings = context
                .store
                .query_listings(&filter.criteria, Utc::now())
                .await?;
            println!("{} ({} träffar)", filter.criteria.summary(), listings.len());
            for listing in listings.iter().take(limit) {
                println!("{}", render_listing(listing));
            }
        }
        Commands::Filters(command) => run_filters(&context.store, command).await?,
        Commands::Audit { limit } => {
            for record in context.store.audit_records(limit).await? {
                println!("{}", render_audit(&record));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_names_are_validated() {
        assert_eq!(parse_sorting("price_descending").expect("known"), Sorting::PriceDescending);
        let err = parse_sorting("cheapest").expect_err("unknown").to_string();
        assert!(err.contains("newest_ascending"));
    }

    #[test]
    fn filter_add_parses_room_lists() {
        let cli = Cli::parse_from([
            "lkf-cli", "filters", "add", "--rooms", "1,2,3", "--max-rent", "6500",
        ]);
        match cli.command {
            Some(Commands::Filters(FilterCommands::Add { rooms, max_rent, min_area, sort })) => {
                assert_eq!(rooms, vec![1, 2, 3]);
                assert_eq!((max_rent, min_area), (6500, 0));
                assert_eq!(sort, "newest_ascending");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn bare_invocation_has_no_subcommand() {
        let cli = Cli::parse_from(["lkf-cli", "--fixture", "fixtures/lkf/available_objects.json"]);
        assert!(cli.command.is_none());
        assert!(cli.fixture.is_some());
    }
}
