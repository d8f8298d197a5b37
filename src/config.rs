//! WolfRecovery Configuration
//!
//! This module provides the configuration structures for the recovery
//! coordinator. A configuration is built once, validated, and shared
//! read-only with every recovery session; changing an option means building
//! a new configuration with the `with_*` methods.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::channel::TransportOptions;
use crate::group::MemberVersion;

/// Main recovery configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Local member identity
    #[serde(default)]
    pub node: NodeConfig,

    /// Recovery behaviour
    #[serde(default)]
    pub recovery: RecoverySettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Local member configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Member uuid (generated when absent)
    #[serde(default)]
    pub uuid: Option<Uuid>,

    /// Server version of the local member
    #[serde(default = "default_version")]
    pub version: String,
}

/// What "caught up" means once the applier resumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionPolicy {
    /// Backlog has been certified and queued for execution
    Certified,
    /// Backlog has also been executed
    Executed,
}

/// Recovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySettings {
    /// Maximum number of donor connection attempts per session
    #[serde(default = "default_donor_retry_count")]
    pub donor_retry_count: u32,

    /// Sleep between donor list rebuilds in milliseconds
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    /// Maximum wait for recovery metadata in milliseconds
    #[serde(default = "default_metadata_timeout_ms")]
    pub metadata_timeout_ms: u64,

    /// Sampling interval of the applier backlog in milliseconds
    #[serde(default = "default_applier_poll_interval_ms")]
    pub applier_poll_interval_ms: u64,

    /// Bound on waiting for the recovery task to exit in milliseconds
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Completion policy for the applier backlog
    #[serde(default = "default_completion_policy")]
    pub completion_policy: CompletionPolicy,

    /// Accept donors running a higher version than the local member
    #[serde(default)]
    pub allow_local_lower_version_join: bool,

    /// TLS options for the recovery channel
    #[serde(default)]
    pub ssl: SslConfig,

    /// Credentials for the recovery channel
    #[serde(default)]
    pub auth: AuthConfig,

    /// Compression options for the recovery channel
    #[serde(default)]
    pub compression: CompressionConfig,
}

/// TLS options for the recovery channel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SslConfig {
    #[serde(default)]
    pub enabled: bool,
    pub ca: Option<String>,
    pub capath: Option<String>,
    pub cert: Option<String>,
    pub cipher: Option<String>,
    pub key: Option<String>,
    pub crl: Option<String>,
    pub crlpath: Option<String>,
    #[serde(default)]
    pub verify_server_cert: bool,
    pub tls_version: Option<String>,
    pub tls_ciphersuites: Option<String>,
}

/// Credentials for the recovery channel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub user: Option<String>,
    pub password: Option<String>,
    pub public_key_path: Option<String>,
    #[serde(default)]
    pub get_public_key: bool,
}

/// Compression options for the recovery channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Allowed algorithms, in order of preference
    #[serde(default = "default_compression_algorithms")]
    pub algorithms: Vec<String>,

    /// zstd level (1-22)
    #[serde(default = "default_zstd_level")]
    pub zstd_level: u8,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

const COMPRESSION_ALGORITHMS: &[&str] = &["zlib", "zstd", "uncompressed"];

const LOG_FORMATS: &[&str] = &["pretty", "json"];

// Default value functions
fn default_version() -> String {
    "8.4.2".to_string()
}

fn default_donor_retry_count() -> u32 {
    10
}

fn default_reconnect_interval_ms() -> u64 {
    60_000
}

fn default_metadata_timeout_ms() -> u64 {
    600_000
}

fn default_applier_poll_interval_ms() -> u64 {
    100
}

fn default_stop_timeout_ms() -> u64 {
    30_000
}

fn default_completion_policy() -> CompletionPolicy {
    CompletionPolicy::Certified
}

fn default_compression_algorithms() -> Vec<String> {
    vec!["uncompressed".to_string()]
}

fn default_zstd_level() -> u8 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            uuid: None,
            version: default_version(),
        }
    }
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            donor_retry_count: default_donor_retry_count(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            metadata_timeout_ms: default_metadata_timeout_ms(),
            applier_poll_interval_ms: default_applier_poll_interval_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            completion_policy: default_completion_policy(),
            allow_local_lower_version_join: false,
            ssl: SslConfig::default(),
            auth: AuthConfig::default(),
            compression: CompressionConfig::default(),
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithms: default_compression_algorithms(),
            zstd_level: default_zstd_level(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl RecoveryConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: RecoveryConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        self.local_version()?;

        let recovery = &self.recovery;
        if recovery.donor_retry_count == 0 {
            return Err(crate::Error::Config("recovery.donor_retry_count must be at least 1".into()));
        }

        if recovery.applier_poll_interval_ms == 0 {
            return Err(crate::Error::Config("recovery.applier_poll_interval_ms cannot be 0".into()));
        }

        if !(1..=22).contains(&recovery.compression.zstd_level) {
            return Err(crate::Error::Config(format!(
                "recovery.compression.zstd_level must be between 1 and 22, got {}",
                recovery.compression.zstd_level
            )));
        }

        if recovery.compression.algorithms.is_empty() {
            return Err(crate::Error::Config("recovery.compression.algorithms cannot be empty".into()));
        }

        for algorithm in &recovery.compression.algorithms {
            if !COMPRESSION_ALGORITHMS.contains(&algorithm.as_str()) {
                return Err(crate::Error::Config(format!(
                    "unknown compression algorithm '{}'",
                    algorithm
                )));
            }
        }

        if !LOG_FORMATS.contains(&self.logging.format.as_str()) {
            return Err(crate::Error::Config(format!(
                "logging.format must be one of {:?}, got '{}'",
                LOG_FORMATS, self.logging.format
            )));
        }

        let ssl = &recovery.ssl;
        if !ssl.enabled && (ssl.ca.is_some() || ssl.cert.is_some() || ssl.key.is_some()) {
            tracing::warn!("recovery.ssl file options are set but ssl is disabled; they will be ignored");
        }

        Ok(())
    }

    /// Parsed local member version
    pub fn local_version(&self) -> crate::Result<MemberVersion> {
        self.node.version.parse()
    }

    /// Local member uuid, generating one when not configured
    pub fn member_uuid(&self) -> Uuid {
        self.node.uuid.unwrap_or_else(Uuid::new_v4)
    }

    /// Get the reconnect interval as Duration
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.recovery.reconnect_interval_ms)
    }

    /// Get the metadata timeout as Duration
    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery.metadata_timeout_ms)
    }

    /// Get the applier sampling interval as Duration
    pub fn applier_poll_interval(&self) -> Duration {
        Duration::from_millis(self.recovery.applier_poll_interval_ms)
    }

    /// Get the stop timeout as Duration
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery.stop_timeout_ms)
    }

    /// Build the transport options handed to the recovery channel
    pub fn transport_options(&self) -> TransportOptions {
        let recovery = &self.recovery;
        TransportOptions {
            ssl: recovery.ssl.enabled.then(|| recovery.ssl.clone()),
            auth: recovery.auth.clone(),
            compression_algorithms: recovery.compression.algorithms.clone(),
            zstd_level: recovery.compression.zstd_level,
        }
    }

    /// Return a copy with a different donor retry count
    pub fn with_donor_retry_count(mut self, count: u32) -> Self {
        self.recovery.donor_retry_count = count;
        self
    }

    /// Return a copy with a different reconnect interval
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.recovery.reconnect_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Return a copy with a different metadata timeout
    pub fn with_metadata_timeout(mut self, timeout: Duration) -> Self {
        self.recovery.metadata_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Return a copy with a different applier sampling interval
    pub fn with_applier_poll_interval(mut self, interval: Duration) -> Self {
        self.recovery.applier_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Return a copy with a different stop timeout
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.recovery.stop_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Return a copy with a different completion policy
    pub fn with_completion_policy(mut self, policy: CompletionPolicy) -> Self {
        self.recovery.completion_policy = policy;
        self
    }

    /// Return a copy with a different local identity
    pub fn with_node(mut self, uuid: Uuid, version: &str) -> Self {
        self.node.uuid = Some(uuid);
        self.node.version = version.to_string();
        self
    }
}
