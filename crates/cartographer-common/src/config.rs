//! Settings shared by Cartographer services

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Telemetry/observability settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySettings {
    /// Log filter directive (trace, debug, info, warn, error or a full EnvFilter expression)
    pub log_level: String,
    /// Enable JSON log format
    pub json_logs: bool,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            json_logs: false,
        }
    }
}

/// Admission webhook listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSettings {
    /// Address the webhook server binds to
    pub bind_addr: SocketAddr,
    /// Path to the PEM certificate chain
    pub cert_path: Option<PathBuf>,
    /// Path to the PEM private key
    pub key_path: Option<PathBuf>,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9443)),
            cert_path: None,
            key_path: None,
        }
    }
}

impl WebhookSettings {
    /// Certificate and key paths, when both are configured.
    pub fn tls_paths(&self) -> Option<(&PathBuf, &PathBuf)> {
        self.cert_path.as_ref().zip(self.key_path.as_ref())
    }
}
