use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque bond identifier ("bondId") used as the join key across both APIs
/// and the reconciliation table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecurityId(String);

impl SecurityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for SecurityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SecurityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SecurityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Coupon type discriminator from the security API (`cpnType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CouponType {
    Fixed,
    Floating,
}

impl CouponType {
    /// `"F"` (or a missing field) means fixed; any other code is floating.
    pub fn from_code(code: Option<&str>) -> Self {
        match code {
            None | Some("F") => CouponType::Fixed,
            Some(_) => CouponType::Floating,
        }
    }
}

/// Current coupon rate of one bond as reported by the security API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityRateRecord {
    pub bond_id: SecurityId,
    pub rate: Decimal,
}

/// Latest dated coupon entry (effective on or before the cutoff) of one bond,
/// as reported by the coupon-date API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateRecord {
    pub bond_id: SecurityId,
    pub rate: Decimal,
    pub effective_date: NaiveDate,
    pub source: String,
}

/// Write-ready row produced by the merge step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciledRow {
    pub as_of_date: NaiveDate,
    pub bond_id: String,
    pub rate: f64,
    /// `YYYY-MM-DD`, or `None` when the coupon API had nothing for this bond.
    pub effective_date: Option<String>,
}

/// Counters reported at the end of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub as_of_date: Option<NaiveDate>,
    pub eligible_securities: usize,
    pub security_rates: usize,
    pub coupon_records: usize,
    pub rows_submitted: usize,
    pub rerate_flagged: bool,
}
