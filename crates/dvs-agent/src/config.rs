//! Agent configuration.
//!
//! Loads and validates the agent configuration from a TOML file with
//! `[agent]`, `[ml2_vmware]` and `[retry]` sections. Every field has a
//! default, so an empty file is a valid configuration for standalone runs.
//!
//! Default location: /etc/neutron/plugins/ml2/vmware_dvs_agent.toml

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dvs_agent_common::{parse_mappings, Backoff, MappingError, RetryPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/neutron/plugins/ml2/vmware_dvs_agent.toml";

/// Errors raised while loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML or has wrongly typed fields.
    #[error("Failed to parse config file {path}: {message}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// Parser message.
        message: String,
    },

    /// `network_maps` could not be parsed.
    #[error("Parsing network_maps failed: {0}.")]
    NetworkMaps(#[from] MappingError),

    /// A value is out of range.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// `[agent]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    /// Host name reported to the control plane.
    #[serde(default = "default_host")]
    pub host: String,

    /// Seconds between reconciliation loop iterations.
    #[serde(default = "default_polling_interval")]
    pub polling_interval_secs: u64,

    /// Only process ports when something changed.
    #[serde(default)]
    pub minimize_polling: bool,

    /// Seconds between state reports; 0 disables the heartbeat.
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,

    /// Log the full state report on every heartbeat.
    #[serde(default)]
    pub log_agent_heartbeats: bool,

    /// Seconds to drain pending notifications on shutdown.
    #[serde(default = "default_quitting_rpc_timeout")]
    pub quitting_rpc_timeout_secs: u64,
}

/// `[ml2_vmware]` section.
#[derive(Clone, Serialize, Deserialize)]
pub struct VmwareSection {
    /// vCenter address.
    #[serde(default = "default_vsphere_hostname")]
    pub vsphere_hostname: String,

    /// vCenter user.
    #[serde(default)]
    pub vsphere_login: String,

    /// vCenter password.
    #[serde(default)]
    pub vsphere_password: String,

    /// `physnet:dvs_name` entries.
    #[serde(default)]
    pub network_maps: Vec<String>,
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    /// Total attempts per switch call.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Cap for a single delay, in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// `fixed` or `exponential`.
    #[serde(default)]
    pub backoff: Backoff,
}

/// Complete agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent loop and heartbeat settings.
    #[serde(default)]
    pub agent: AgentSection,

    /// vSphere connection and segment mapping.
    #[serde(default)]
    pub ml2_vmware: VmwareSection,

    /// Switch call retry policy.
    #[serde(default)]
    pub retry: RetrySection,
}

// Default functions
fn default_host() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn default_polling_interval() -> u64 {
    2
}

fn default_report_interval() -> u64 {
    30
}

fn default_quitting_rpc_timeout() -> u64 {
    10
}

fn default_vsphere_hostname() -> String {
    "127.0.0.1".to_string()
}

fn default_max_attempts() -> u32 {
    10
}

fn default_initial_delay() -> u64 {
    500
}

fn default_max_delay() -> u64 {
    10_000
}

// Default implementations
impl Default for AgentSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            polling_interval_secs: default_polling_interval(),
            minimize_polling: false,
            report_interval_secs: default_report_interval(),
            log_agent_heartbeats: false,
            quitting_rpc_timeout_secs: default_quitting_rpc_timeout(),
        }
    }
}

impl Default for VmwareSection {
    fn default() -> Self {
        Self {
            vsphere_hostname: default_vsphere_hostname(),
            vsphere_login: String::new(),
            vsphere_password: String::new(),
            network_maps: Vec::new(),
        }
    }
}

impl std::fmt::Debug for VmwareSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmwareSection")
            .field("vsphere_hostname", &self.vsphere_hostname)
            .field("vsphere_login", &self.vsphere_login)
            .field("vsphere_password", &"***")
            .field("network_maps", &self.network_maps)
            .finish()
    }
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff: Backoff::default(),
        }
    }
}

impl AgentConfig {
    /// Loads the configuration from `path`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Loads the configuration from `path`, falling back to defaults if the
    /// file does not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        match Self::from_file(path.as_ref()) {
            Err(ConfigError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Checks value ranges and the segment mapping.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".to_string()));
        }
        if self.agent.polling_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "polling_interval_secs must be > 0".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry max_attempts must be > 0".to_string(),
            ));
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return Err(ConfigError::Invalid(
                "retry max_delay_ms must be >= initial_delay_ms".to_string(),
            ));
        }
        self.bridge_mappings()?;
        Ok(())
    }

    /// Parsed `network_maps`: physical network name to switch name.
    pub fn bridge_mappings(&self) -> Result<BTreeMap<String, String>, ConfigError> {
        Ok(parse_mappings(&self.ml2_vmware.network_maps)?)
    }

    /// Identifier the agent uses in control-plane lookups.
    pub fn agent_id(&self) -> String {
        format!("dvs-agent-{}", self.agent.host)
    }

    /// Reconciliation loop interval.
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.agent.polling_interval_secs)
    }

    /// Heartbeat interval, `None` when reporting is disabled.
    pub fn report_interval(&self) -> Option<Duration> {
        match self.agent.report_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Time allowed to drain notifications on shutdown.
    pub fn quitting_rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.quitting_rpc_timeout_secs)
    }

    /// Retry policy for switch calls.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            backoff: self.retry.backoff,
        }
    }
}
