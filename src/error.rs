//! Transport error types

use thiserror::Error;

/// Errors that can occur while talking to the BLED112 dongle
#[derive(Error, Debug)]
pub enum TransportError {
    /// The serial link died. The adapter is terminal once this is seen.
    #[error("Serial transport lost")]
    TransportLost,

    #[error("Command timed out")]
    Timeout,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Malformed packet or a reply we cannot make sense of. Non-fatal.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The dongle or the peripheral refused the request.
    #[error("Device rejected request: {0}")]
    DeviceRejected(String),

    /// The link dropped while the connection was still being prepared.
    #[error("Early disconnect: {0}")]
    EarlyDisconnect(String),

    // Serial-port specific
    #[error("Serial error: {0}")]
    Serial(String),
}

impl From<serialport::Error> for TransportError {
    fn from(e: serialport::Error) -> Self {
        TransportError::Serial(e.to_string())
    }
}
