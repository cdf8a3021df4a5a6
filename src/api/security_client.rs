use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::{decimal_from_json, ApiTransport, BatchSource};
use crate::config::ApiConfig;
use crate::error::ApiError;
use crate::models::{CouponType, SecurityId, SecurityRateRecord};

/// Client for the security API, which reports the current coupon of each bond.
pub struct SecurityRateClient {
    transport: ApiTransport,
}

impl SecurityRateClient {
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        Ok(Self {
            transport: ApiTransport::new(config)?,
        })
    }
}

#[async_trait]
impl BatchSource for SecurityRateClient {
    type Record = SecurityRateRecord;

    fn name(&self) -> &'static str {
        "security"
    }

    async fn fetch_batch(
        &self,
        ids: &[SecurityId],
        _as_of: NaiveDate,
    ) -> Result<Vec<SecurityRateRecord>, ApiError> {
        let body = self.transport.get_batch(ids).await?;
        let records = parse_security_rates(&body);
        debug!(
            "Retrieved {} security rates for {} {} ids from {}",
            records.len(),
            ids.len(),
            self.transport.asset_class(),
            self.transport.url()
        );
        Ok(records)
    }
}

/// Extract one rate per asset from a `bondByAssetId` response.
///
/// Assets whose record is missing or malformed are skipped with a log line.
pub fn parse_security_rates(body: &Value) -> Vec<SecurityRateRecord> {
    let Some(assets) = body.get("bondByAssetId").and_then(Value::as_object) else {
        info!("No security data in response, skipping batch");
        return Vec::new();
    };

    assets
        .iter()
        .filter_map(|(asset_key, asset)| match parse_asset(asset_key, asset) {
            Ok(record) => Some(record),
            Err(reason) => {
                warn!("Skipping security {}: {}", asset_key, reason);
                None
            }
        })
        .collect()
}

fn parse_asset(asset_key: &str, asset: &Value) -> Result<SecurityRateRecord, String> {
    let asset = asset
        .as_object()
        .ok_or_else(|| "asset entry is not an object".to_string())?;
    let outer_id = asset.get("bondId").and_then(Value::as_str);

    let record = first_record(asset).ok_or_else(|| "no rate record".to_string())?;

    let bond_id = record
        .get("BOND")
        .and_then(Value::as_str)
        .or(outer_id)
        .unwrap_or(asset_key);

    let coupon_type = match record.get("cpnType") {
        None | Some(Value::Null) => CouponType::from_code(None),
        Some(Value::String(code)) => CouponType::from_code(Some(code.as_str())),
        Some(other) => return Err(format!("unexpected cpnType {}", other)),
    };

    let field = match coupon_type {
        CouponType::Fixed => "couponFix",
        CouponType::Floating => "couponFloat",
    };
    let rate = record
        .get(field)
        .and_then(decimal_from_json)
        .ok_or_else(|| format!("missing or invalid {}", field))?;

    Ok(SecurityRateRecord {
        bond_id: SecurityId::new(bond_id),
        rate,
    })
}

/// First nested object beside the `bondId` field.
fn first_record(asset: &Map<String, Value>) -> Option<&Map<String, Value>> {
    asset
        .iter()
        .filter(|(key, _)| key.as_str() != "bondId")
        .find_map(|(_, value)| value.as_object())
}
