//! Error types for the NMEP library

use nmep_proto::ProtocolError;
use thiserror::Error;
use std::time::Duration;

/// Main error type for NMEP operations
#[derive(Debug, Error)]
pub enum NmepError {
    /// Wire format, handshake or message construction errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection is closed or was never established
    #[error("Connection closed")]
    ConnectionClosed,

    /// Server has no registered connection with this id
    #[error("Unknown connection: {0}")]
    UnknownConnection(u32),

    /// A response slot for this message id is still pending
    #[error("Message id {0} is already awaiting a response")]
    IdentifierInUse(u16),

    /// Every usable message id is awaiting a response
    #[error("No free message identifiers")]
    IdentifierSpaceExhausted,

    /// Timeout errors
    #[error("Timeout after {duration:?}")]
    Timeout {
        /// Duration that was exceeded
        duration: Duration,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl NmepError {
    /// True when the error means the peer or transport went away
    pub fn is_connection_closed(&self) -> bool {
        match self {
            Self::ConnectionClosed => true,
            Self::Io(e) | Self::Protocol(ProtocolError::Io(e)) => is_disconnect(e),
            _ => false,
        }
    }
}

/// I/O error kinds that signal a closed or disposed transport
pub(crate) fn is_disconnect(error: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        error.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_connection_closed_classification() {
        assert!(NmepError::ConnectionClosed.is_connection_closed());
        assert!(NmepError::Io(io::Error::from(io::ErrorKind::BrokenPipe)).is_connection_closed());
        assert!(NmepError::Protocol(ProtocolError::Io(io::Error::from(io::ErrorKind::ConnectionReset)))
            .is_connection_closed());
        assert!(!NmepError::Io(io::Error::from(io::ErrorKind::PermissionDenied)).is_connection_closed());
        assert!(!NmepError::IdentifierInUse(3).is_connection_closed());
    }

    #[test]
    fn test_protocol_error_conversion() {
        let err: NmepError = ProtocolError::InvalidFrame("zero message id").into();
        assert!(matches!(err, NmepError::Protocol(ProtocolError::InvalidFrame(_))));
        assert_eq!(err.to_string(), "Protocol error: Invalid frame: zero message id");
    }
}
