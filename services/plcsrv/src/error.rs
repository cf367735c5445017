//! Error handling for the PLC service
//!
//! One error type covers address translation, transport and signal access. Every
//! variant is cheap to clone so the transport can keep the last one around and
//! broadcast it to listeners.

use thiserror::Error;

/// PLC Service Error Type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlcError {
    // ------------------------------------------------------------------
    // Address translation
    // ------------------------------------------------------------------
    /// Area name not recognized, or not mapped for the active vendor
    #[error("Unknown PLC area: {0}")]
    UnknownArea(String),

    /// Address does not fall inside the area's Modbus window
    #[error("Address {address} out of range for area {area}")]
    AddressOutOfRange { area: String, address: i64 },

    // ------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------
    #[error("Not connected")]
    NotConnected,

    /// Modbus exception response or malformed reply
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout error: {0}")]
    TimeoutError(String),

    /// Link-level failure (socket closed, connect refused)
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Read completed but produced no data
    #[error("Transport returned no data: {0}")]
    TransportFailure(String),

    // ------------------------------------------------------------------
    // Signals
    // ------------------------------------------------------------------
    #[error("Signal not found: {0}")]
    NotFound(String),

    #[error("Signal inactive: {0}")]
    Inactive(String),

    #[error("Signal not writable: {0}")]
    NotWritable(String),

    #[error("Decode error: {0}")]
    DecodeFailure(String),

    // ------------------------------------------------------------------
    // Service plumbing
    // ------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Data error: {0}")]
    DataError(String),
}

/// Result type alias for the PLC service
pub type Result<T> = std::result::Result<T, PlcError>;

impl PlcError {
    pub fn config(msg: impl Into<String>) -> Self {
        PlcError::ConfigError(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        PlcError::ProtocolError(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        PlcError::ConnectionError(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        PlcError::TimeoutError(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        PlcError::ValidationError(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        PlcError::DecodeFailure(msg.into())
    }

    pub fn not_found(code: impl std::fmt::Display) -> Self {
        PlcError::NotFound(code.to_string())
    }

    pub fn out_of_range(area: impl Into<String>, address: i64) -> Self {
        PlcError::AddressOutOfRange {
            area: area.into(),
            address,
        }
    }

    /// Whether the error came from the wire rather than from local validation
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            PlcError::NotConnected
                | PlcError::ProtocolError(_)
                | PlcError::TimeoutError(_)
                | PlcError::ConnectionError(_)
                | PlcError::TransportFailure(_)
        )
    }
}

// ============================================================================
// From implementations for external error types
// ============================================================================

impl From<std::io::Error> for PlcError {
    fn from(err: std::io::Error) -> Self {
        PlcError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for PlcError {
    fn from(err: serde_json::Error) -> Self {
        PlcError::DataError(format!("JSON: {err}"))
    }
}

impl From<figment::Error> for PlcError {
    fn from(err: figment::Error) -> Self {
        PlcError::ConfigError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(PlcError::NotConnected.to_string(), "Not connected");
        assert_eq!(
            PlcError::out_of_range("DM", 40000).to_string(),
            "Address 40000 out of range for area DM"
        );
        assert_eq!(PlcError::not_found("P1").to_string(), "Signal not found: P1");
    }

    #[test]
    fn test_transport_classification() {
        assert!(PlcError::timeout("read").is_transport());
        assert!(PlcError::NotConnected.is_transport());
        assert!(!PlcError::NotWritable("P1".into()).is_transport());
        assert!(!PlcError::UnknownArea("ZZ".into()).is_transport());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(PlcError::from(io), PlcError::IoError(msg) if msg.contains("refused")));
    }
}
