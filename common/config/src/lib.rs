// Licensed under the Apache-2.0 license

pub mod boot;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Bytes read from the image source per request.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Smallest chunk able to carry the image header, first segment header and
/// application descriptor in one read.
pub const MIN_CHUNK_SIZE: usize = 512;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Which failure categories end the update task instead of scheduling
/// another attempt.
///
/// Connectivity loss and an inconsistent partition layout are always fatal,
/// and up-to-date or known-bad outcomes are always retried, so they have no
/// switch here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FailurePolicy {
    pub fatal_on_fetch_error: bool,
    pub fatal_on_bad_transfer: bool,
    pub fatal_on_write_error: bool,
    pub fatal_on_validation_error: bool,
    pub fatal_on_activation_error: bool,
}

impl FailurePolicy {
    /// Every per-attempt failure schedules another attempt.
    pub const fn retry_forever() -> Self {
        FailurePolicy {
            fatal_on_fetch_error: false,
            fatal_on_bad_transfer: false,
            fatal_on_write_error: false,
            fatal_on_validation_error: false,
            fatal_on_activation_error: false,
        }
    }

    /// Every per-attempt failure ends the update task.
    pub const fn fail_fast() -> Self {
        FailurePolicy {
            fatal_on_fetch_error: true,
            fatal_on_bad_transfer: true,
            fatal_on_write_error: true,
            fatal_on_validation_error: true,
            fatal_on_activation_error: true,
        }
    }
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::retry_forever()
    }
}

/// Ordering of the boot-time diagnostic gate relative to the update loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticOrdering {
    /// The gate finishes before the first update attempt starts.
    #[default]
    BeforeUpdates,
    /// The gate and the update loop start together.
    Concurrent,
}

/// Settings handed to the update orchestrator and the startup sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpdateConfig {
    /// Location of the firmware image.
    pub firmware_url: String,
    /// PEM file holding the trust anchor for the image server.
    pub server_cert_pem: Option<PathBuf>,
    /// Accept a server certificate whose name does not match the URL host.
    pub skip_common_name_check: bool,
    /// Skip an attempt when the offered image has the running version.
    pub version_check_enabled: bool,
    pub recv_timeout_ms: u64,
    pub retry_interval_secs: u64,
    /// Delay after an up-to-date or known-bad outcome. Falls back to
    /// `retry_interval_secs` when unset.
    pub policy_retry_interval_secs: Option<u64>,
    pub chunk_size: usize,
    /// Wait between reads that returned no data.
    pub poll_interval_ms: u64,
    pub link_timeout_ms: u64,
    pub diagnostic_timeout_ms: u64,
    pub diagnostic_ordering: DiagnosticOrdering,
    pub failure_policy: FailurePolicy,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        UpdateConfig {
            firmware_url: String::new(),
            server_cert_pem: None,
            skip_common_name_check: false,
            version_check_enabled: true,
            recv_timeout_ms: 5_000,
            retry_interval_secs: 10,
            policy_retry_interval_secs: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            poll_interval_ms: 50,
            link_timeout_ms: 30_000,
            diagnostic_timeout_ms: 10_000,
            diagnostic_ordering: DiagnosticOrdering::default(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl UpdateConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: UpdateConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size < MIN_CHUNK_SIZE {
            return Err(ConfigError::Invalid(
                "chunk_size cannot hold a complete image header",
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be at least 1"));
        }
        if let Some(secs) = self.policy_retry_interval_secs {
            if secs < self.retry_interval_secs {
                return Err(ConfigError::Invalid(
                    "policy_retry_interval_secs is shorter than retry_interval_secs",
                ));
            }
        }
        Ok(())
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn policy_retry_delay(&self) -> Duration {
        Duration::from_secs(
            self.policy_retry_interval_secs
                .unwrap_or(self.retry_interval_secs),
        )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn link_timeout(&self) -> Duration {
        Duration::from_millis(self.link_timeout_ms)
    }

    pub fn diagnostic_timeout(&self) -> Duration {
        Duration::from_millis(self.diagnostic_timeout_ms)
    }
}
