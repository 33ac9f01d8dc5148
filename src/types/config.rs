//! Configuration structures.
//!
//! Configuration is built from defaults or deserialized from JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::errors::Result;

/// Default request window before a pending entry expires.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(120_000);

/// Global configuration shared by hosts, workers and clients.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Request/response correlation settings.
    #[serde(default)]
    pub requests: RequestConfig,

    /// Stdio wire transport settings.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Front-end channel bridge settings.
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Parse a JSON document; missing sections take their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Request/response correlation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Window after which an unanswered request is rejected.
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Stdio wire transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Maximum frame payload size in bytes.
    pub max_frame_bytes: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 5 * 1024 * 1024,
        }
    }
}

/// Front-end channel bridge settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// How long a front-end waits for its channel grant.
    #[serde(with = "humantime_serde")]
    pub grant_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            grant_timeout: Duration::from_secs(30),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,

    /// Write logs to stderr instead of stdout. Required for workers whose
    /// stdout is the data link.
    pub log_to_stderr: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            log_to_stderr: false,
        }
    }
}

/// Debug-attach setting handed opaquely to the spawner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InspectConfig {
    /// Attach on this port.
    Port(u16),
    /// Attach on this port, optionally pausing before the entry runs.
    Detailed { port: u16, break_on_start: bool },
}

impl InspectConfig {
    /// Command-line flag form understood by inspector-capable runtimes.
    pub fn to_flag(&self) -> String {
        match self {
            InspectConfig::Port(port) => format!("--inspect={}", port),
            InspectConfig::Detailed {
                port,
                break_on_start,
            } => {
                let ext = if *break_on_start { "-brk" } else { "" };
                format!("--inspect{}={}", ext, port)
            }
        }
    }
}

/// Options passed through to the worker spawner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpawnOptions {
    /// Name the worker is told it runs as. Defaults to the service name.
    #[serde(default)]
    pub service_name: Option<String>,

    /// Extra arguments for the worker entry.
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment for the worker.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Debug-attach setting, if any.
    #[serde(default)]
    pub inspect: Option<InspectConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.requests.default_timeout, Duration::from_secs(120));
        assert_eq!(config.transport.max_frame_bytes, 5 * 1024 * 1024);
        assert!(!config.observability.log_to_stderr);
    }

    #[test]
    fn test_from_json_humantime() {
        let config = Config::from_json_str(
            r#"{ "requests": { "default_timeout": "2s 500ms" }, "bridge": { "grant_timeout": "1m" } }"#,
        )
        .unwrap();
        assert_eq!(config.requests.default_timeout, Duration::from_millis(2500));
        assert_eq!(config.bridge.grant_timeout, Duration::from_secs(60));
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn test_inspect_flags() {
        assert_eq!(InspectConfig::Port(9229).to_flag(), "--inspect=9229");
        let brk = InspectConfig::Detailed {
            port: 9230,
            break_on_start: true,
        };
        assert_eq!(brk.to_flag(), "--inspect-brk=9230");
    }

    #[test]
    fn test_inspect_untagged_forms() {
        let plain: InspectConfig = serde_json::from_str("9229").unwrap();
        assert_eq!(plain, InspectConfig::Port(9229));
        let detailed: InspectConfig =
            serde_json::from_str(r#"{ "port": 1, "break_on_start": false }"#).unwrap();
        assert_eq!(detailed.to_flag(), "--inspect=1");
    }
}
