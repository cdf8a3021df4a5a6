use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{Any, AnyPool, QueryBuilder, Row};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::DatabaseConfig;
use crate::error::StoreError;
use crate::models::{ReconciledRow, SecurityId};

/// Outcome of the re-rate flagging call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagStatus {
    pub as_of_date: NaiveDate,
    pub completed_at: DateTime<Utc>,
}

/// Database operations the reconciliation run needs.
#[async_trait]
pub trait RateStore: Send + Sync {
    /// Bonds pending a rate check on `as_of`.
    async fn fetch_eligible_securities(
        &self,
        as_of: NaiveDate,
    ) -> Result<Vec<SecurityId>, StoreError>;

    /// Write API rate and coupon effective date onto the matching recon rows.
    /// When a bond appears more than once the last row wins. Returns the
    /// number of rows submitted; rows that match nothing are no-ops.
    async fn save_rates(
        &self,
        rows: &[ReconciledRow],
        as_of: NaiveDate,
    ) -> Result<usize, StoreError>;

    /// Flag trades whose rate changed.
    async fn flag_rerated(&self, as_of: NaiveDate) -> Result<FlagStatus, StoreError>;
}

/// Open a single-connection pool using the first profile that connects.
pub async fn connect(
    profiles: &[String],
    acquire_timeout: Duration,
) -> Result<AnyPool, StoreError> {
    sqlx::any::install_default_drivers();

    let mut last_error = None;
    for (index, profile) in profiles.iter().enumerate() {
        let target = redact_profile(profile);
        debug!("Attempting to connect db using {}", target);

        let attempt = AnyPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(acquire_timeout)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(profile)
            .await;

        match attempt {
            Ok(pool) => {
                info!("Connected to db using {}", target);
                return Ok(pool);
            }
            Err(e) => {
                if index + 1 < profiles.len() {
                    info!("Failed to connect using {}, trying next profile: {}", target, e);
                } else {
                    warn!("Failed to connect using {}: {}", target, e);
                }
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(source) => Err(StoreError::Connect {
            attempts: profiles.len(),
            source,
        }),
        None => Err(StoreError::NoProfiles),
    }
}

/// Connection URL with any password removed, for log lines.
pub fn redact_profile(profile: &str) -> String {
    match Url::parse(profile) {
        Ok(mut url) if url.password().is_some() => {
            let _ = url.set_password(Some("***"));
            url.to_string()
        }
        Ok(url) => url.to_string(),
        Err(_) => "<unparseable connection profile>".to_string(),
    }
}

fn date_param(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// One row per bond, the last one given winning, in order of first appearance.
/// A CASE expression takes the first matching WHEN, so duplicates must not
/// reach the statement.
fn last_per_bond(rows: &[ReconciledRow]) -> Vec<&ReconciledRow> {
    let mut position: HashMap<&str, usize> = HashMap::with_capacity(rows.len());
    let mut unique: Vec<&ReconciledRow> = Vec::with_capacity(rows.len());
    for row in rows {
        match position.get(row.bond_id.as_str()) {
            Some(&index) => unique[index] = row,
            None => {
                position.insert(row.bond_id.as_str(), unique.len());
                unique.push(row);
            }
        }
    }
    unique
}

/// [`RateStore`] over an sqlx `Any` pool. Runs in autocommit mode.
#[derive(Clone)]
pub struct SqlRateStore {
    pool: AnyPool,
    eligible_statement: String,
    flag_statement: String,
    recon_table: String,
    write_chunk_size: usize,
}

impl SqlRateStore {
    pub fn new(pool: AnyPool, config: &DatabaseConfig) -> Self {
        Self {
            pool,
            eligible_statement: config.eligible_securities_statement.clone(),
            flag_statement: config.rerate_flag_statement.clone(),
            recon_table: config.recon_table.clone(),
            write_chunk_size: config.write_chunk_size.max(1),
        }
    }

    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = connect(&config.profiles(), config.acquire_timeout()).await?;
        Ok(Self::new(pool, config))
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// One UPDATE for a whole chunk:
    ///
    /// ```sql
    /// UPDATE recon
    /// SET api_rate = CASE bond WHEN ? THEN ? ... ELSE api_rate END,
    ///     cpn_effective_date = CASE bond WHEN ? THEN ? ... ELSE cpn_effective_date END
    /// WHERE as_of_date = ? AND bond IN (?, ...)
    /// ```
    fn build_update<'a>(
        &self,
        chunk: &[&'a ReconciledRow],
        as_of: &str,
    ) -> QueryBuilder<'a, Any> {
        let mut builder = QueryBuilder::new(format!(
            "UPDATE {} SET api_rate = CASE bond",
            self.recon_table
        ));
        for &row in chunk {
            builder
                .push(" WHEN ")
                .push_bind(row.bond_id.as_str())
                .push(" THEN ")
                .push_bind(row.rate);
        }
        builder.push(" ELSE api_rate END, cpn_effective_date = CASE bond");
        for &row in chunk {
            builder
                .push(" WHEN ")
                .push_bind(row.bond_id.as_str())
                .push(" THEN ")
                .push_bind(row.effective_date.as_deref());
        }
        builder
            .push(" ELSE cpn_effective_date END WHERE as_of_date = ")
            .push_bind(as_of.to_string())
            .push(" AND bond IN (");
        let mut ids = builder.separated(", ");
        for &row in chunk {
            ids.push_bind(row.bond_id.as_str());
        }
        ids.push_unseparated(")");
        builder
    }
}

#[async_trait]
impl RateStore for SqlRateStore {
    async fn fetch_eligible_securities(
        &self,
        as_of: NaiveDate,
    ) -> Result<Vec<SecurityId>, StoreError> {
        info!("Fetching bonds for rate check on {}", as_of);
        debug!("{}", self.eligible_statement);

        let rows: Vec<AnyRow> = sqlx::query(&self.eligible_statement)
            .bind(date_param(as_of))
            .fetch_all(&self.pool)
            .await
            .map_err(|source| {
                warn!("Fetching securities for rate check failed: {}", source);
                StoreError::Query {
                    operation: "fetch eligible securities",
                    source,
                }
            })?;

        let ids = rows
            .iter()
            .map(|row| row.try_get::<String, _>(0).map(|id| SecurityId::new(id.trim())))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| StoreError::Query {
                operation: "read eligible securities",
                source,
            })?;

        info!("Found {} bonds for rate check on {}", ids.len(), as_of);
        Ok(ids)
    }

    async fn save_rates(
        &self,
        rows: &[ReconciledRow],
        as_of: NaiveDate,
    ) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let unique = last_per_bond(rows);
        if unique.len() < rows.len() {
            debug!(
                "{} duplicate bond rows collapsed, keeping the last of each",
                rows.len() - unique.len()
            );
        }
        info!("Saving {} rates for {}", unique.len(), as_of);
        let as_of = date_param(as_of);
        let mut affected = 0u64;

        for chunk in unique.chunks(self.write_chunk_size) {
            let mut builder = self.build_update(chunk, &as_of);
            let result = builder
                .build()
                .execute(&self.pool)
                .await
                .map_err(|source| {
                    warn!("Database write error: {}", source);
                    StoreError::Query {
                        operation: "save rates",
                        source,
                    }
                })?;
            affected += result.rows_affected();
        }

        debug!("{} rows submitted, {} recon rows updated", unique.len(), affected);
        Ok(unique.len())
    }

    async fn flag_rerated(&self, as_of: NaiveDate) -> Result<FlagStatus, StoreError> {
        info!("Flagging re-rated trades for {}", as_of);

        sqlx::query(&self.flag_statement)
            .execute(&self.pool)
            .await
            .map_err(|source| {
                warn!("Error while flagging rerated data: {}", source);
                StoreError::Query {
                    operation: "flag rerated trades",
                    source,
                }
            })?;

        Ok(FlagStatus {
            as_of_date: as_of,
            completed_at: Utc::now(),
        })
    }
}
