use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{decimal_from_json, ApiTransport, BatchSource};
use crate::config::{ApiConfig, CouponCutoff};
use crate::error::ApiError;
use crate::models::{RateRecord, SecurityId};

/// Client for the coupon API, which reports the dated coupon history of each bond.
pub struct CouponDateClient {
    transport: ApiTransport,
    cutoff: CouponCutoff,
}

impl CouponDateClient {
    pub fn new(config: &ApiConfig, cutoff: CouponCutoff) -> Result<Self, ApiError> {
        Ok(Self {
            transport: ApiTransport::new(config)?,
            cutoff,
        })
    }

    fn cutoff_date(&self, as_of: NaiveDate) -> NaiveDate {
        match self.cutoff {
            CouponCutoff::AsOf => as_of,
            CouponCutoff::Today => Local::now().date_naive(),
        }
    }
}

#[async_trait]
impl BatchSource for CouponDateClient {
    type Record = RateRecord;

    fn name(&self) -> &'static str {
        "coupon"
    }

    async fn fetch_batch(
        &self,
        ids: &[SecurityId],
        as_of: NaiveDate,
    ) -> Result<Vec<RateRecord>, ApiError> {
        let body = self.transport.get_batch(ids).await?;
        let records = parse_coupon_records(&body, self.cutoff_date(as_of));
        debug!(
            "Retrieved {} coupon records for {} {} ids from {}",
            records.len(),
            ids.len(),
            self.transport.asset_class(),
            self.transport.url()
        );
        Ok(records)
    }
}

/// Pick, for every asset of a `couponDataByAssetId` response, the dated
/// coupon entry with the latest effective date on or before `cutoff`.
///
/// Assets with no qualifying entry are left out. So are assets whose date
/// keys or selected entry cannot be read.
pub fn parse_coupon_records(body: &Value, cutoff: NaiveDate) -> Vec<RateRecord> {
    let assets = match body.get("couponDataByAssetId").and_then(Value::as_object) {
        Some(assets) if !assets.is_empty() => assets,
        _ => {
            info!("No coupon data found in response, skipping batch");
            return Vec::new();
        }
    };

    let mut records = Vec::with_capacity(assets.len());
    for (asset_key, asset) in assets {
        match latest_coupon(asset_key, asset, cutoff) {
            Ok(Some(record)) => records.push(record),
            Ok(None) => debug!("No coupon effective on or before {} for {}", cutoff, asset_key),
            Err(reason) => warn!("Skipping coupon data for {}: {}", asset_key, reason),
        }
    }
    records
}

fn latest_coupon(
    asset_key: &str,
    asset: &Value,
    cutoff: NaiveDate,
) -> Result<Option<RateRecord>, String> {
    let bond_id = asset
        .get("assetId")
        .and_then(Value::as_str)
        .unwrap_or(asset_key);

    let Some(dated) = asset
        .get("couponEffectiveDate")
        .and_then(Value::as_object)
        .filter(|m| !m.is_empty())
    else {
        info!("No coupon effective date for {}, skipping", bond_id);
        return Ok(None);
    };

    let mut latest: Option<(NaiveDate, &serde_json::Map<String, Value>)> = None;
    for (date_key, entry) in dated {
        let Some(entry) = entry.as_object() else {
            continue;
        };
        let effective = NaiveDate::parse_from_str(date_key, "%Y-%m-%d")
            .map_err(|e| format!("bad effective date '{}': {}", date_key, e))?;

        if effective > cutoff {
            continue;
        }
        // Later date always wins, regardless of map order.
        if latest.map_or(true, |(best, _)| effective > best) {
            latest = Some((effective, entry));
        }
    }

    let Some((effective_date, entry)) = latest else {
        return Ok(None);
    };

    let rate = entry
        .get("cpn")
        .and_then(decimal_from_json)
        .ok_or_else(|| format!("missing or invalid cpn for {}", effective_date))?;
    let source = entry
        .get("cpnSource")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Ok(Some(RateRecord {
        bond_id: SecurityId::new(bond_id),
        rate,
        effective_date,
        source,
    }))
}
