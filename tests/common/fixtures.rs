//! Config, identifiers and canned API bodies

use bond_rate_sync::config::{ApiConfig, DispatchConfig};
use bond_rate_sync::models::SecurityId;
use bond_rate_sync::secrets::Secret;
use chrono::NaiveDate;
use serde_json::{json, Map, Value};
use std::time::Duration;
use url::Url;
use wiremock::MockServer;

pub const API_KEY: &str = "test-token";
pub const API_USER: &str = "svc_rates";
pub const API_PASSWORD: &str = "hunter2";
/// base64 of `svc_rates:hunter2`
pub const BASIC_AUTH: &str = "Basic c3ZjX3JhdGVzOmh1bnRlcjI=";

pub fn as_of() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
}

pub fn bond_ids(n: usize) -> Vec<SecurityId> {
    (0..n).map(|i| SecurityId::new(format!("US{:04}", i))).collect()
}

pub fn dispatch() -> DispatchConfig {
    DispatchConfig {
        batch_size: 50,
        workers: 5,
    }
}

/// Client config pointing at `path` on the mock server.
pub fn api_config(server: &MockServer, path: &str) -> ApiConfig {
    ApiConfig {
        url: Url::parse(&format!("{}{}", server.uri(), path)).unwrap(),
        token: Secret::new(API_KEY),
        user: Secret::new(API_USER),
        password: Secret::new(API_PASSWORD),
        request_id: 12_345_678_910,
        timeout: Duration::from_secs(5),
        asset_class: "BOND".to_string(),
    }
}

/// `bondByAssetId` body with one fixed-rate record per `(id, rate)`.
pub fn security_body(rates: &[(&str, f64)]) -> Value {
    let mut assets = Map::new();
    for (id, rate) in rates {
        assets.insert(
            id.to_string(),
            json!({
                "bondId": id,
                "rec": { "BOND": id, "couponFix": rate, "cpnType": "F" }
            }),
        );
    }
    json!({ "bondByAssetId": assets })
}

/// `couponDataByAssetId` body with a single coupon dated `effective` per id.
pub fn coupon_body(entries: &[(&str, &str, f64)]) -> Value {
    let mut assets = Map::new();
    for (id, effective, cpn) in entries {
        let mut dated = Map::new();
        dated.insert(
            effective.to_string(),
            json!({ "cpn": cpn, "EffectiveDate": effective, "cpnSource": "BBG" }),
        );
        assets.insert(id.to_string(), json!({ "couponEffectiveDate": dated }));
    }
    json!({ "couponDataByAssetId": assets })
}
