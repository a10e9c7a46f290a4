//! Cartographer Common Library
//!
//! Shared error type, settings, resource-quantity helpers, TLS loading and
//! telemetry setup for the Cartographer services.

pub mod config;
pub mod error;
pub mod quantity;
pub mod telemetry;
pub mod tls;

// Re-export commonly used types
pub use config::{TelemetrySettings, WebhookSettings};
pub use error::{Error, Result};
pub use tls::TlsConfig;
