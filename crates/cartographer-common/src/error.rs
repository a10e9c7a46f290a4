//! Error types shared by Cartographer services

/// Result type alias using the common [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the shared infrastructure (TLS, settings, telemetry)
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// TLS material could not be loaded or assembled
    #[error("TLS error: {0}")]
    Tls(String),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Telemetry pipeline could not be installed
    #[error("Telemetry error: {0}")]
    Telemetry(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Error::Tls(_) => "TLS_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Telemetry(_) => "TELEMETRY_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::Tls("bad key".into()).code(), "TLS_ERROR");
        assert_eq!(Error::Config("missing".into()).code(), "CONFIG_ERROR");
        assert_eq!(Error::Telemetry("already set".into()).code(), "TELEMETRY_ERROR");
    }

    #[test]
    fn test_io_error_conversion() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "cert.pem").into();
        assert_eq!(err.code(), "IO_ERROR");
        assert!(err.to_string().contains("cert.pem"));
    }
}
