use crate::metadata::DEFAULT_METADATA_FILE;
use crate::platform::parse_signal;
use crate::stats::StatsBackend;
use crate::terminator::TerminatePolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "lights.toml";

/// Top-level configuration loaded from lights.toml.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
#[derive(Default)]
pub struct LightsConfig {
    pub metadata: MetadataConfig,
    pub launch: LaunchConfig,
    pub terminate: TerminateConfig,
    pub stats: StatsConfig,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetadataConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct LaunchConfig {
    /// Cap the instance count at the number of available CPUs.
    pub cap_to_cpus: bool,
    /// Binary used when `--binary` is not given.
    pub default_binary: Option<String>,
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct TerminateConfig {
    pub signal: String,
    pub grace_period_ms: u64,
    pub escalate_to_kill: bool,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
#[derive(Default)]
pub struct StatsConfig {
    pub backend: StatsBackend,
}

// --- Default implementations ---

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_METADATA_FILE),
        }
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            cap_to_cpus: true,
            default_binary: None,
            log_dir: None,
        }
    }
}

impl Default for TerminateConfig {
    fn default() -> Self {
        Self {
            signal: "SIGINT".to_string(),
            grace_period_ms: 0,
            escalate_to_kill: false,
        }
    }
}

impl LightsConfig {
    /// Load config from `path`.
    ///
    /// A missing file yields defaults unless the path was given explicitly.
    pub fn load(path: &Path, explicit: bool) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.terminate_policy()?;
        Ok(config)
    }

    /// The `[terminate]` section as a policy.
    pub fn terminate_policy(&self) -> Result<TerminatePolicy, ConfigError> {
        let signal = parse_signal(&self.terminate.signal).ok_or_else(|| {
            ConfigError::InvalidSignal {
                value: self.terminate.signal.clone(),
            }
        })?;
        Ok(TerminatePolicy {
            signal,
            grace_period: Duration::from_millis(self.terminate.grace_period_ms),
            escalate_to_kill: self.terminate.escalate_to_kill,
        })
    }
}

/// Errors from loading lights.toml.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    InvalidSignal {
        value: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::InvalidSignal { value } => write!(f, "unknown signal: {value}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::InvalidSignal { .. } => None,
        }
    }
}
