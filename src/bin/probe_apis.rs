//! Operator check of both rate APIs: fetches the given bonds through the
//! normal dispatcher, merges the results and prints the rows as JSON.
//! The database is never touched.

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use bond_rate_sync::api::{CouponDateClient, SecurityRateClient};
use bond_rate_sync::concurrent_fetcher::fetch_all;
use bond_rate_sync::config::ConfigLoader;
use bond_rate_sync::logging;
use bond_rate_sync::merge::merge;
use bond_rate_sync::models::SecurityId;
use bond_rate_sync::orchestrator::resolve_as_of;
use bond_rate_sync::secrets::HelperProcessProvider;

#[derive(Parser, Debug)]
#[command(
    name = "probe-apis",
    about = "Fetch and merge rates for a few bonds without writing anything"
)]
struct Cli {
    /// Comma-separated bond identifiers
    #[arg(long, value_delimiter = ',')]
    ids: Vec<String>,

    /// As-of date (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    as_of: Option<String>,

    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log = logging::init();

    if let Err(e) = run(cli, &log).await {
        error!("API probe failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli, log: &logging::LogHandle) -> Result<()> {
    let ids: Vec<SecurityId> = cli
        .ids
        .iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .map(SecurityId::new)
        .collect();
    if ids.is_empty() {
        bail!("no bond identifiers given, use --ids A,B,C");
    }
    let as_of = resolve_as_of(cli.as_of.as_deref())?;

    let loader = cli
        .config
        .map(ConfigLoader::new)
        .unwrap_or_else(ConfigLoader::beside_executable);
    let raw = loader.load()?;
    let secrets =
        HelperProcessProvider::new(raw.secrets.helper_path.clone(), raw.secrets.timeout());
    let config = raw.resolve(&secrets).await?;
    log.attach_file(&config.log)?;

    info!("🔍 Probing rate APIs for {} bonds as of {}", ids.len(), as_of);
    let security = Arc::new(SecurityRateClient::new(&config.security_api)?);
    let coupon = Arc::new(CouponDateClient::new(&config.coupon_api, config.coupon.cutoff)?);

    let (security_rates, coupon_records) = tokio::try_join!(
        fetch_all(security, &ids, as_of, &config.dispatch),
        fetch_all(coupon, &ids, as_of, &config.dispatch),
    )?;
    info!(
        "✅ {} security rates, {} coupon records",
        security_rates.len(),
        coupon_records.len()
    );

    let rows = merge(&security_rates, &coupon_records, as_of)?;
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}
