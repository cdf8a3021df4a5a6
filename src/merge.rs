//! Left join of security rates onto coupon effective dates.

use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::error::MergeError;
use crate::models::{RateRecord, ReconciledRow, SecurityRateRecord};

/// Join `security_rates` (left) with `rate_records` (right) on bond id.
///
/// Every security rate yields exactly one row, in input order. The effective
/// date comes from the coupon record with the same bond id, or is `None`.
/// If the coupon side holds the same bond more than once the last one wins.
pub fn merge(
    security_rates: &[SecurityRateRecord],
    rate_records: &[RateRecord],
    as_of_date: NaiveDate,
) -> Result<Vec<ReconciledRow>, MergeError> {
    if rate_records.is_empty() {
        info!("No security with coupon data available for {}", as_of_date);
    }

    let effective_dates: HashMap<&str, NaiveDate> = rate_records
        .iter()
        .map(|record| (record.bond_id.as_str(), record.effective_date))
        .collect();

    let rows = security_rates
        .iter()
        .map(|security| {
            let rate = security
                .rate
                .to_f64()
                .filter(|r| r.is_finite())
                .ok_or_else(|| MergeError::RateCoercion {
                    bond_id: security.bond_id.to_string(),
                    rate: security.rate.to_string(),
                })?;

            Ok(ReconciledRow {
                as_of_date,
                bond_id: security.bond_id.to_string(),
                rate,
                effective_date: effective_dates
                    .get(security.bond_id.as_str())
                    .map(|date| date.format("%Y-%m-%d").to_string()),
            })
        })
        .collect::<Result<Vec<_>, MergeError>>()?;

    let matched = rows.iter().filter(|row| row.effective_date.is_some()).count();
    debug!(
        "Merged {} security rates with {} coupon records: {} matched, {} without effective date",
        rows.len(),
        rate_records.len(),
        matched,
        rows.len() - matched
    );
    Ok(rows)
}
