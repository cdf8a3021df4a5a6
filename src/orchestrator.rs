//! One reconciliation run, driven as a small state machine.
//!
//! ```text
//! Init -> FetchSecurities -> FetchRates -> Merge -> Persist -> Done
//!   \__________\________________\___________\________\______-> Aborted
//! ```
//!
//! There is no checkpointing. A re-run starts again from `Init`.

use chrono::{Local, NaiveDate};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::api::BatchSource;
use crate::concurrent_fetcher::fetch_all;
use crate::config::DispatchConfig;
use crate::database::RateStore;
use crate::error::SyncError;
use crate::merge::merge;
use crate::models::{RateRecord, RunSummary, SecurityRateRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    FetchSecurities,
    FetchRates,
    Merge,
    Persist,
    Done,
    Aborted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Init => "init",
            RunState::FetchSecurities => "fetch-securities",
            RunState::FetchRates => "fetch-rates",
            RunState::Merge => "merge",
            RunState::Persist => "persist",
            RunState::Done => "done",
            RunState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Parse the as-of date argument, defaulting to today when absent.
pub fn resolve_as_of(arg: Option<&str>) -> Result<NaiveDate, SyncError> {
    match arg.map(str::trim) {
        None | Some("") => Ok(Local::now().date_naive()),
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map_err(|_| SyncError::InvalidAsOfDate(raw.to_string())),
    }
}

/// Wires the store and both API clients together for a run.
pub struct Orchestrator<D, S, C> {
    store: D,
    security_source: Arc<S>,
    coupon_source: Arc<C>,
    dispatch: DispatchConfig,
    state: RunState,
}

impl<D, S, C> Orchestrator<D, S, C>
where
    D: RateStore,
    S: BatchSource<Record = SecurityRateRecord>,
    C: BatchSource<Record = RateRecord>,
{
    pub fn new(store: D, security_source: S, coupon_source: C, dispatch: DispatchConfig) -> Self {
        Self {
            store,
            security_source: Arc::new(security_source),
            coupon_source: Arc::new(coupon_source),
            dispatch,
            state: RunState::Init,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn store(&self) -> &D {
        &self.store
    }

    fn enter(&mut self, next: RunState) {
        debug!("Run state {} -> {}", self.state, next);
        self.state = next;
    }

    /// Run every step for `as_of`. Any failure moves the run to
    /// [`RunState::Aborted`] and is returned unchanged.
    pub async fn run(&mut self, as_of: NaiveDate) -> Result<RunSummary, SyncError> {
        let started = Instant::now();
        self.state = RunState::Init;
        info!("Starting rate reconciliation for {}", as_of);

        match self.steps(as_of).await {
            Ok(summary) => {
                self.enter(RunState::Done);
                info!(
                    as_of = %as_of,
                    eligible = summary.eligible_securities,
                    security_rates = summary.security_rates,
                    coupon_records = summary.coupon_records,
                    rows_submitted = summary.rows_submitted,
                    rerate_flagged = summary.rerate_flagged,
                    "Rate reconciliation finished in {:.2?}",
                    started.elapsed()
                );
                Ok(summary)
            }
            Err(e) => {
                warn!("Rate reconciliation for {} aborted during {}", as_of, self.state);
                self.enter(RunState::Aborted);
                Err(e)
            }
        }
    }

    async fn steps(&mut self, as_of: NaiveDate) -> Result<RunSummary, SyncError> {
        let mut summary = RunSummary {
            as_of_date: Some(as_of),
            ..RunSummary::default()
        };

        self.enter(RunState::FetchSecurities);
        let eligible = self.store.fetch_eligible_securities(as_of).await?;
        summary.eligible_securities = eligible.len();
        if eligible.is_empty() {
            info!("No bonds eligible for rate check on {}, nothing to check", as_of);
            return Ok(summary);
        }

        self.enter(RunState::FetchRates);
        let (security_rates, coupon_records) = tokio::try_join!(
            async {
                fetch_all(Arc::clone(&self.security_source), &eligible, as_of, &self.dispatch)
                    .await
                    .map_err(SyncError::SecurityFetch)
            },
            async {
                fetch_all(Arc::clone(&self.coupon_source), &eligible, as_of, &self.dispatch)
                    .await
                    .map_err(SyncError::CouponFetch)
            }
        )?;
        summary.security_rates = security_rates.len();
        summary.coupon_records = coupon_records.len();

        self.enter(RunState::Merge);
        let rows = merge(&security_rates, &coupon_records, as_of)?;

        self.enter(RunState::Persist);
        summary.rows_submitted = self.store.save_rates(&rows, as_of).await?;
        let flagged = self.store.flag_rerated(as_of).await?;
        debug!("Re-rate flag for {} completed at {}", flagged.as_of_date, flagged.completed_at);
        summary.rerate_flagged = true;

        Ok(summary)
    }
}
