//! Server configuration.

use std::time::Duration;

use sluice_settings::{SluiceSettings, TransportMode};
use sluice_transport::StatefulConfig;

/// Runtime configuration for [`SluiceServer`](crate::server::SluiceServer).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (`0` auto-assigns).
    pub port: u16,
    /// Path the protocol endpoint is mounted on.
    pub endpoint_path: String,
    /// Which manager sits behind the endpoint.
    pub mode: TransportMode,
    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,
    /// How long shutdown waits for the listener to drain.
    pub shutdown_timeout: Duration,
    /// Session lifecycle settings, used in stateful mode.
    pub sessions: StatefulConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&SluiceSettings::default())
    }
}

impl From<&SluiceSettings> for ServerConfig {
    fn from(settings: &SluiceSettings) -> Self {
        let server = &settings.server;
        Self {
            host: server.host.clone(),
            port: server.port,
            endpoint_path: server.endpoint_path.clone(),
            mode: server.mode,
            max_body_bytes: server.max_body_bytes,
            shutdown_timeout: Duration::from_secs(server.shutdown_timeout_secs),
            sessions: StatefulConfig {
                stale_timeout: Duration::from_secs(settings.sessions.stale_timeout_secs),
                gc_interval: Duration::from_secs(settings.sessions.gc_interval_secs),
                endpoint_path: server.endpoint_path.clone(),
                max_sessions: settings.sessions.max_sessions,
            },
        }
    }
}
