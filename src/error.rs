use thiserror::Error;

/// Transport and protocol failures from either REST API. All of them abort the run.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered with status {status}: {body}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("could not decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid header value for {header}")]
    Header { header: &'static str },
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("batch {batch} of {total} ({size} ids) failed: {source}")]
    Batch {
        batch: usize,
        total: usize,
        size: usize,
        #[source]
        source: ApiError,
    },

    #[error("batch worker panicked or was cancelled: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("rate {rate} for {bond_id} cannot be represented as a float")]
    RateCoercion { bond_id: String, rate: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no database connection profiles configured")]
    NoProfiles,

    #[error("could not connect using any of {attempts} profiles: {source}")]
    Connect {
        attempts: usize,
        #[source]
        source: sqlx::Error,
    },

    #[error("{operation} failed: {source}")]
    Query {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

#[derive(Error, Debug)]
pub enum SecretError {
    #[error("secret helper for '{key}' could not be started: {source}")]
    Spawn {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("secret helper for '{key}' timed out after {secs}s")]
    Timeout { key: String, secs: u64 },

    #[error("secret helper for '{key}' failed (status {status:?}): {stderr}")]
    Helper {
        key: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("secret helper returned no value for '{key}'")]
    Empty { key: String },

    #[error("unknown secret '{key}'")]
    Unknown { key: String },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("could not resolve secret for {field}: {source}")]
    Secret {
        field: &'static str,
        #[source]
        source: SecretError,
    },

    #[error("could not open log file {path}: {source}")]
    LogFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Top-level error of one reconciliation run
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("invalid as-of date '{0}', expected YYYY-MM-DD")]
    InvalidAsOfDate(String),

    #[error("security rate fetch failed: {0}")]
    SecurityFetch(#[source] DispatchError),

    #[error("coupon date fetch failed: {0}")]
    CouponFetch(#[source] DispatchError),

    #[error("merge failed: {0}")]
    Merge(#[from] MergeError),

    #[error("database error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}
