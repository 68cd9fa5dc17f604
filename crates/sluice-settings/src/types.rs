//! Settings type definitions.
//!
//! Field names are camelCase on the wire. Every section implements
//! [`Default`] and is `#[serde(default)]`, so partial JSON is accepted.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::SettingsError;

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 8080, "mode": "stateless" },
///   "sessions": { "staleTimeoutSecs": 600 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SluiceSettings {
    /// HTTP listener settings.
    pub server: ServerSettings,
    /// Stateful session lifecycle settings.
    pub sessions: SessionSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
}

impl SluiceSettings {
    /// Reject combinations that would make the server misbehave.
    pub fn validate(&self) -> crate::Result<()> {
        if self.sessions.gc_interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "sessions.gcIntervalSecs must be greater than 0".into(),
            ));
        }
        if !self.server.endpoint_path.starts_with('/') {
            return Err(SettingsError::InvalidValue(format!(
                "server.endpointPath must start with '/': {}",
                self.server.endpoint_path
            )));
        }
        Ok(())
    }
}

/// Which transport manager the server wires behind its endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Persistent per-client sessions.
    #[default]
    Stateful,
    /// One connection pair per call.
    Stateless,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stateful => f.write_str("stateful"),
            Self::Stateless => f.write_str("stateless"),
        }
    }
}

impl FromStr for TransportMode {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stateful" => Ok(Self::Stateful),
            "stateless" => Ok(Self::Stateless),
            other => Err(SettingsError::InvalidValue(format!(
                "unknown transport mode: {other}"
            ))),
        }
    }
}

/// HTTP listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` auto-assigns).
    pub port: u16,
    /// Path the protocol endpoint is mounted on.
    pub endpoint_path: String,
    /// Stateful or stateless operation.
    pub mode: TransportMode,
    /// Maximum accepted request body size in bytes.
    pub max_body_bytes: usize,
    /// How long graceful shutdown waits for in-flight work.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            endpoint_path: "/mcp".to_string(),
            mode: TransportMode::Stateful,
            max_body_bytes: 4 * 1024 * 1024,
            shutdown_timeout_secs: 30,
        }
    }
}

/// Stateful session lifecycle settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Idle time after which a session without in-flight requests is collected.
    pub stale_timeout_secs: u64,
    /// Period of the stale-session sweep.
    pub gc_interval_secs: u64,
    /// Maximum registered sessions (`0` = unlimited).
    pub max_sessions: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            stale_timeout_secs: 1800,
            gc_interval_secs: 60,
            max_sessions: 0,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("Stateless".parse::<TransportMode>().unwrap(), TransportMode::Stateless);
        assert_eq!("STATEFUL".parse::<TransportMode>().unwrap(), TransportMode::Stateful);
        assert!("sticky".parse::<TransportMode>().is_err());
    }

    #[test]
    fn mode_serializes_lowercase() {
        let json = serde_json::to_string(&TransportMode::Stateless).unwrap();
        assert_eq!(json, "\"stateless\"");
        assert_eq!(TransportMode::Stateful.to_string(), "stateful");
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings: SluiceSettings =
            serde_json::from_str(r#"{"server": {"port": 9000}}"#).unwrap();
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.endpoint_path, "/mcp");
        assert_eq!(settings.sessions.gc_interval_secs, 60);
    }

    #[test]
    fn camel_case_wire_names() {
        let value = serde_json::to_value(SluiceSettings::default()).unwrap();
        assert!(value["server"].get("endpointPath").is_some());
        assert!(value["sessions"].get("staleTimeoutSecs").is_some());
        assert!(value["server"].get("endpoint_path").is_none());
    }

    #[test]
    fn validate_rejects_zero_gc_interval() {
        let mut settings = SluiceSettings::default();
        settings.sessions.gc_interval_secs = 0;
        assert!(matches!(settings.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn validate_rejects_relative_endpoint() {
        let mut settings = SluiceSettings::default();
        settings.server.endpoint_path = "mcp".into();
        assert!(settings.validate().is_err());
        assert!(SluiceSettings::default().validate().is_ok());
    }
}
