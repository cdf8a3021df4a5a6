//! Typed configuration.
//!
//! The file (INI by default) only names secrets; [`RawConfig::resolve`] turns
//! every `*_key` field into a [`Secret`] through a [`SecretProvider`] and
//! validates the rest.

use config::{Config as ConfigSource, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use url::Url;

use crate::error::ConfigError;
use crate::secrets::{Secret, SecretProvider};

pub const DEFAULT_CONFIG_FILE: &str = "config.ini";
const ENV_PREFIX: &str = "BOND_SYNC";

#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    pub db: DatabaseConfig,
    pub security_api: RawApiConfig,
    pub coupon_api: RawApiConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub log: LogConfig,
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub coupon: CouponConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Comma-separated connection URLs, tried in order.
    pub connection_profiles: String,
    #[serde(default = "default_eligible_statement")]
    pub eligible_securities_statement: String,
    #[serde(default = "default_flag_statement")]
    pub rerate_flag_statement: String,
    #[serde(default = "default_recon_table")]
    pub recon_table: String,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_write_chunk_size")]
    pub write_chunk_size: usize,
}

impl DatabaseConfig {
    pub fn profiles(&self) -> Vec<String> {
        self.connection_profiles
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

/// API section as written in the file: credentials are secret names.
#[derive(Debug, Clone, Deserialize)]
pub struct RawApiConfig {
    pub url: String,
    pub token_key: String,
    pub user_key: String,
    pub pwd_key: String,
    #[serde(default = "default_request_id")]
    pub request_id: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_asset_class")]
    pub asset_class: String,
}

/// API section with credentials resolved.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub url: Url,
    pub token: Secret,
    pub user: Secret,
    pub password: Secret,
    pub request_id: u64,
    pub timeout: Duration,
    pub asset_class: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            workers: default_workers(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_path")]
    pub path: String,
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: default_log_path(),
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecretsConfig {
    pub helper_path: PathBuf,
    #[serde(default = "default_secret_timeout_secs")]
    pub timeout_secs: u64,
}

impl SecretsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Which date bounds the "latest effective coupon" selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouponCutoff {
    #[default]
    AsOf,
    Today,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CouponConfig {
    #[serde(default)]
    pub cutoff: CouponCutoff,
}

/// Fully resolved configuration of one run.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db: DatabaseConfig,
    pub security_api: ApiConfig,
    pub coupon_api: ApiConfig,
    pub dispatch: DispatchConfig,
    pub log: LogConfig,
    pub coupon: CouponConfig,
}

fn default_eligible_statement() -> String {
    "CALL sp_get_bond_for_rates(?)".to_string()
}
fn default_flag_statement() -> String {
    "CALL sp_set_rerate_flag()".to_string()
}
fn default_recon_table() -> String {
    "rerate_recon".to_string()
}
fn default_acquire_timeout_secs() -> u64 {
    30
}
fn default_write_chunk_size() -> usize {
    500
}
fn default_request_id() -> u64 {
    12_345_678_910
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_asset_class() -> String {
    "BOND".to_string()
}
fn default_batch_size() -> usize {
    50
}
fn default_workers() -> usize {
    5
}
fn default_log_path() -> String {
    "logs/bond-rate-sync-{date}.log".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_secret_timeout_secs() -> u64 {
    60
}

/// Reads the configuration file plus `.env` and `BOND_SYNC__SECTION__KEY`
/// environment overrides.
pub struct ConfigLoader {
    path: PathBuf,
}

impl ConfigLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `config.ini` next to the running executable.
    pub fn beside_executable() -> Self {
        let path = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(DEFAULT_CONFIG_FILE)))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<RawConfig, ConfigError> {
        dotenvy::dotenv().ok();
        info!("Reading configuration from {}", self.path.display());

        let source = ConfigSource::builder()
            .add_source(File::from(self.path.as_path()))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        Ok(source.try_deserialize()?)
    }
}

impl RawConfig {
    /// Resolve secrets and validate. Nothing here is retried.
    pub async fn resolve(self, secrets: &dyn SecretProvider) -> Result<AppConfig, ConfigError> {
        if self.db.profiles().is_empty() {
            return Err(ConfigError::Invalid {
                field: "db.connection_profiles",
                reason: "no connection profile given".to_string(),
            });
        }
        if !is_plain_identifier(&self.db.recon_table) {
            return Err(ConfigError::Invalid {
                field: "db.recon_table",
                reason: format!("'{}' is not a plain table name", self.db.recon_table),
            });
        }
        if self.db.write_chunk_size == 0 {
            return Err(ConfigError::Invalid {
                field: "db.write_chunk_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.dispatch.batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "dispatch.batch_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.dispatch.workers == 0 {
            return Err(ConfigError::Invalid {
                field: "dispatch.workers",
                reason: "must be greater than zero".to_string(),
            });
        }

        let security_api = resolve_api("security_api", self.security_api, secrets).await?;
        let coupon_api = resolve_api("coupon_api", self.coupon_api, secrets).await?;

        Ok(AppConfig {
            db: self.db,
            security_api,
            coupon_api,
            dispatch: self.dispatch,
            log: self.log,
            coupon: self.coupon,
        })
    }
}

/// Letters, digits, `_` and `.` (for schema-qualified names), not starting with a digit.
fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

async fn resolve_api(
    section: &'static str,
    raw: RawApiConfig,
    secrets: &dyn SecretProvider,
) -> Result<ApiConfig, ConfigError> {
    let url = Url::parse(&raw.url).map_err(|e| ConfigError::Invalid {
        field: section,
        reason: format!("url '{}': {}", raw.url, e),
    })?;

    let lookup = |key: String| async move {
        secrets
            .get(&key)
            .await
            .map_err(|source| ConfigError::Secret {
                field: section,
                source,
            })
    };

    Ok(ApiConfig {
        url,
        token: lookup(raw.token_key).await?,
        user: lookup(raw.user_key).await?,
        password: lookup(raw.pwd_key).await?,
        request_id: raw.request_id,
        timeout: Duration::from_secs(raw.timeout_secs),
        asset_class: raw.asset_class,
    })
}
