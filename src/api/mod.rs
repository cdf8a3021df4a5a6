use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;
use tracing::debug;
use url::Url;

use crate::config::ApiConfig;
use crate::error::ApiError;
use crate::models::SecurityId;
use crate::secrets::Secret;

pub mod coupon_client;
pub mod security_client;

pub use coupon_client::CouponDateClient;
pub use security_client::SecurityRateClient;

/// One REST endpoint that answers for a batch of bond identifiers.
///
/// Implementations turn transport and top-level decode failures into
/// [`ApiError`]; a malformed entry for a single identifier is logged and
/// left out of the result instead.
#[async_trait]
pub trait BatchSource: Send + Sync + 'static {
    type Record: Send + 'static;

    /// Short name used in log lines.
    fn name(&self) -> &'static str;

    async fn fetch_batch(
        &self,
        ids: &[SecurityId],
        as_of: NaiveDate,
    ) -> Result<Vec<Self::Record>, ApiError>;
}

/// Authenticated GET shared by both API clients.
pub struct ApiTransport {
    client: Client,
    url: Url,
    api_key: Secret,
    user: Secret,
    password: Secret,
    request_id: u64,
    asset_class: String,
}

impl ApiTransport {
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent("bond-rate-sync/1.0")
            .build()
            .map_err(|source| ApiError::Transport {
                url: config.url.to_string(),
                source,
            })?;

        debug!(
            "initialized api client {}@{}",
            config.user.expose(),
            config.url
        );

        Ok(Self {
            client,
            url: config.url.clone(),
            api_key: config.token.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
            request_id: config.request_id,
            asset_class: config.asset_class.clone(),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Sent as `bondIdType` with every request.
    pub fn asset_class(&self) -> &str {
        &self.asset_class
    }

    fn headers(&self) -> Result<HeaderMap, ApiError> {
        let basic = general_purpose::STANDARD.encode(format!(
            "{}:{}",
            self.user.expose(),
            self.password.expose()
        ));

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "Request-ID",
            HeaderValue::from_str(&self.request_id.to_string())
                .map_err(|_| ApiError::Header { header: "Request-ID" })?,
        );
        headers.insert(
            "Origin-Timestamp",
            HeaderValue::from_str(&origin_timestamp(Utc::now()))
                .map_err(|_| ApiError::Header { header: "Origin-Timestamp" })?,
        );
        headers.insert(
            "API-Key",
            HeaderValue::from_str(self.api_key.expose())
                .map_err(|_| ApiError::Header { header: "API-Key" })?,
        );
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&format!("Basic {}", basic))
                .map_err(|_| ApiError::Header { header: "Authorization" })?,
        );
        Ok(headers)
    }

    /// GET `?bondId=<ids>&bondIdType=<asset_class>` and decode the JSON body.
    pub async fn get_batch(&self, ids: &[SecurityId]) -> Result<Value, ApiError> {
        let id_list = join_ids(ids);
        let url = self.url.to_string();
        debug!("Making request to {} for {}", url, id_list);

        let response = self
            .client
            .get(self.url.clone())
            .headers(self.headers()?)
            .query(&[
                ("bondId", id_list.as_str()),
                ("bondIdType", self.asset_class.as_str()),
            ])
            .send()
            .await
            .map_err(|source| {
                debug!("Request error on {} for {}: {}", url, id_list, source);
                ApiError::Transport {
                    url: url.clone(),
                    source,
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!("Request error on {} for {}: status {}", url, id_list, status);
            return Err(ApiError::Status { url, status, body });
        }

        let text = response.text().await.map_err(|source| ApiError::Transport {
            url: url.clone(),
            source,
        })?;
        let json: Value = serde_json::from_str(&text).map_err(|source| {
            debug!("Mapping error for {}: {}", id_list, source);
            ApiError::Decode {
                url: url.clone(),
                source,
            }
        })?;

        debug!("API response received: {} bytes", text.len());
        Ok(json)
    }
}

/// Identifier list as the APIs expect it: every id followed by a comma.
pub fn join_ids(ids: &[SecurityId]) -> String {
    let mut joined = String::with_capacity(ids.len() * 13);
    for id in ids {
        joined.push_str(id.as_str());
        joined.push(',');
    }
    joined
}

/// ISO-8601 with millisecond precision and a trailing `Z`.
pub fn origin_timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Rates arrive as JSON numbers, occasionally as strings.
pub(crate) fn decimal_from_json(value: &Value) -> Option<Decimal> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return None,
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}
