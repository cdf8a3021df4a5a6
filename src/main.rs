use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use bond_rate_sync::api::{CouponDateClient, SecurityRateClient};
use bond_rate_sync::config::ConfigLoader;
use bond_rate_sync::database::SqlRateStore;
use bond_rate_sync::logging;
use bond_rate_sync::orchestrator::{resolve_as_of, Orchestrator};
use bond_rate_sync::secrets::HelperProcessProvider;

/// Pull current bond coupon rates from the security and coupon APIs and
/// write them onto the re-rate reconciliation table.
#[derive(Parser, Debug)]
#[command(name = "bond-rate-sync", version, about)]
struct Cli {
    /// As-of date (YYYY-MM-DD). Defaults to today.
    as_of_date: Option<String>,

    /// Configuration file. Defaults to config.ini next to the executable.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log = logging::init();

    if let Err(e) = run(cli, &log).await {
        error!("Rate reconciliation failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli, log: &logging::LogHandle) -> Result<()> {
    let as_of = resolve_as_of(cli.as_of_date.as_deref())?;

    let loader = cli
        .config
        .map(ConfigLoader::new)
        .unwrap_or_else(ConfigLoader::beside_executable);
    info!("Loading configuration from {}", loader.path().display());
    let raw = loader.load()?;

    let secrets =
        HelperProcessProvider::new(raw.secrets.helper_path.clone(), raw.secrets.timeout());
    let config = raw.resolve(&secrets).await?;
    log.attach_file(&config.log)?;

    let store = SqlRateStore::connect(&config.db)
        .await
        .context("opening database connection")?;
    let security_client = SecurityRateClient::new(&config.security_api)?;
    let coupon_client = CouponDateClient::new(&config.coupon_api, config.coupon.cutoff)?;

    let mut orchestrator =
        Orchestrator::new(store, security_client, coupon_client, config.dispatch.clone());
    orchestrator.run(as_of).await?;

    if log.contains_error() {
        info!("Run completed, but errors were logged; check the log file");
    }
    Ok(())
}
