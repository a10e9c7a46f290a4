//! Tracing subscriber initialisation

use crate::config::TelemetrySettings;
use crate::error::{Error, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize structured logging.
///
/// `RUST_LOG` takes precedence over the configured log level.
pub fn init(settings: &TelemetrySettings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .map_err(|e| Error::Telemetry(format!("invalid log filter '{}': {}", settings.log_level, e)))?;

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = if settings.json_logs {
        subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        subscriber.with(tracing_subscriber::fmt::layer()).try_init()
    };

    installed.map_err(|e| Error::Telemetry(e.to_string()))
}
