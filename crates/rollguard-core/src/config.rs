//! rollguard.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 8443;
pub const DEFAULT_DATA_DIR: &str = "/var/lib/rollguard";
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_ROLLBACK_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_PROBE_PATH: &str = "/healthz";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Every section is optional; missing values fall back to the defaults above.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollguardConfig {
    pub server: Option<ServerConfig>,
    pub monitor: Option<MonitorConfig>,
    pub probe: Option<ProbeConfig>,
    pub rollback: Option<RollbackConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub failure_threshold: Option<u32>,
    pub probe_timeout: Option<String>,
    pub rollback_timeout: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// HTTP path probed on each instance.
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollbackConfig {
    /// Endpoint the rollback request is POSTed to.
    pub webhook_url: Option<String>,
}

impl RollguardConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Override the listen port (CLI flag).
    pub fn set_port(&mut self, port: u16) {
        self.server.get_or_insert_with(ServerConfig::default).port = Some(port);
    }

    /// Override the data directory (CLI flag).
    pub fn set_data_dir(&mut self, dir: PathBuf) {
        self.server.get_or_insert_with(ServerConfig::default).data_dir = Some(dir);
    }

    pub fn port(&self) -> u16 {
        self.server.as_ref().and_then(|s| s.port).unwrap_or(DEFAULT_PORT)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.server
            .as_ref()
            .and_then(|s| s.data_dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
    }

    pub fn failure_threshold(&self) -> u32 {
        self.monitor
            .as_ref()
            .and_then(|m| m.failure_threshold)
            .unwrap_or(DEFAULT_FAILURE_THRESHOLD)
    }

    pub fn probe_timeout(&self) -> Duration {
        self.monitor
            .as_ref()
            .and_then(|m| m.probe_timeout.as_deref())
            .and_then(parse_duration)
            .unwrap_or(DEFAULT_PROBE_TIMEOUT)
    }

    pub fn rollback_timeout(&self) -> Duration {
        self.monitor
            .as_ref()
            .and_then(|m| m.rollback_timeout.as_deref())
            .and_then(parse_duration)
            .unwrap_or(DEFAULT_ROLLBACK_TIMEOUT)
    }

    pub fn probe_path(&self) -> &str {
        self.probe
            .as_ref()
            .and_then(|p| p.path.as_deref())
            .unwrap_or(DEFAULT_PROBE_PATH)
    }

    pub fn webhook_url(&self) -> Option<&str> {
        self.rollback.as_ref().and_then(|r| r.webhook_url.as_deref())
    }

    /// Collect every problem in the file. Accessors still return defaults
    /// for the offending values, so callers decide whether to refuse or warn.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut problems = Vec::new();

        if let Some(monitor) = &self.monitor {
            if monitor.failure_threshold == Some(0) {
                problems.push(ConfigError::Invalid {
                    field: "monitor.failure_threshold",
                    reason: "must be at least 1".to_string(),
                });
            }
            for (field, value) in [
                ("monitor.probe_timeout", &monitor.probe_timeout),
                ("monitor.rollback_timeout", &monitor.rollback_timeout),
            ] {
                if let Some(raw) = value {
                    match parse_duration(raw) {
                        Some(d) if d.is_zero() => problems.push(ConfigError::Invalid {
                            field,
                            reason: "must be greater than zero".to_string(),
                        }),
                        Some(_) => {}
                        None => problems.push(ConfigError::Invalid {
                            field,
                            reason: format!("cannot parse duration {raw:?}"),
                        }),
                    }
                }
            }
        }

        if let Some(path) = self.probe.as_ref().and_then(|p| p.path.as_deref())
            && !path.starts_with('/')
        {
            problems.push(ConfigError::Invalid {
                field: "probe.path",
                reason: format!("{path:?} must start with '/'"),
            });
        }

        if let Some(url) = self.webhook_url()
            && !url.starts_with("http://")
        {
            problems.push(ConfigError::Invalid {
                field: "rollback.webhook_url",
                reason: format!("{url:?} must be an http:// URL"),
            });
        }

        problems
    }
}

/// Parse a duration string like "500ms", "10s", "2m", or bare seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
