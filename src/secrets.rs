//! Secret retrieval.
//!
//! Credentials never live in the configuration file. The file names a key for
//! each of them and a [`SecretProvider`] turns the key into the value. In
//! production that is an external helper executable called as
//! `<helper> <key>` which prints the secret on stdout.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::SecretError;

/// A resolved secret value. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn get(&self, key: &str) -> Result<Secret, SecretError>;
}

/// Resolves secrets by running the configured helper executable.
pub struct HelperProcessProvider {
    helper_path: PathBuf,
    timeout: Duration,
    cache: Mutex<HashMap<String, Secret>>,
}

impl HelperProcessProvider {
    pub fn new(helper_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            helper_path: helper_path.into(),
            timeout,
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn run_helper(&self, key: &str) -> Result<Secret, SecretError> {
        debug!(helper = %self.helper_path.display(), key, "invoking secret helper");

        let child = Command::new(&self.helper_path)
            .arg(key)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SecretError::Spawn {
                key: key.to_string(),
                source,
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| SecretError::Timeout {
                key: key.to_string(),
                secs: self.timeout.as_secs(),
            })?
            .map_err(|source| SecretError::Spawn {
                key: key.to_string(),
                source,
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() || !stderr.is_empty() {
            return Err(SecretError::Helper {
                key: key.to_string(),
                status: output.status.code(),
                stderr,
            });
        }

        let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if value.is_empty() {
            return Err(SecretError::Empty {
                key: key.to_string(),
            });
        }

        Ok(Secret(value))
    }
}

#[async_trait]
impl SecretProvider for HelperProcessProvider {
    async fn get(&self, key: &str) -> Result<Secret, SecretError> {
        if let Some(secret) = self.cache.lock().await.get(key) {
            return Ok(secret.clone());
        }

        let secret = self.run_helper(key).await?;
        self.cache
            .lock()
            .await
            .insert(key.to_string(), secret.clone());
        Ok(secret)
    }
}

/// In-memory provider, used by tests and local tooling.
#[derive(Debug, Default, Clone)]
pub struct StaticSecrets {
    values: HashMap<String, Secret>,
}

impl StaticSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), Secret::new(value));
        self
    }
}

#[async_trait]
impl SecretProvider for StaticSecrets {
    async fn get(&self, key: &str) -> Result<Secret, SecretError> {
        self.values
            .get(key)
            .cloned()
            .ok_or_else(|| SecretError::Unknown {
                key: key.to_string(),
            })
    }
}
