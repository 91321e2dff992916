//! Error types for throttle acquisition and command dispatch

use loco_protocol::Address;
use thiserror::Error;

/// Errors surfaced to throttle and manager callers
#[derive(Debug, Error)]
pub enum ThrottleError {
    /// Address is outside the connection's addressing space
    #[error("address {0} is out of range for this connection")]
    AddressOutOfRange(Address),

    /// The command station refused the address or never answered
    #[error("could not acquire {address}: {reason}")]
    AcquisitionFailed {
        /// Requested address
        address: Address,
        /// Why the acquisition failed
        reason: String,
    },

    /// Shared control asked of a protocol or address that cannot share
    #[error("shared control is not supported for this address")]
    UnsupportedSharingMode,

    /// Handle no longer holds its address
    #[error("throttle no longer holds its address")]
    NotHeld,

    /// Command is outside what the protocol can express
    #[error("not supported by the command station: {0}")]
    Capability(String),

    /// Input failed validation
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// No confirmation after every retry
    #[error("no response after {attempts} attempts")]
    RequestTimeout {
        /// Number of times the frame was written
        attempts: u32,
    },

    /// Command station answered with a refusal
    #[error("command rejected: {0}")]
    CommandRejected(String),

    /// Request was withdrawn before transmission
    #[error("request cancelled")]
    Cancelled,

    /// Connection is gone
    #[error("connection lost")]
    ConnectionLost,

    /// Encoding error from the vendor adapter
    #[error("protocol error: {0}")]
    Protocol(#[from] loco_protocol::ProtocolError),

    /// I/O error opening or using a transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ThrottleError {
    /// Map an adapter encoding error onto the caller-facing taxonomy
    pub(crate) fn from_encode(err: loco_protocol::ProtocolError) -> Self {
        match err {
            loco_protocol::ProtocolError::Unsupported { protocol, what } => {
                Self::Capability(format!("{} cannot express {}", protocol, what))
            }
            other => Self::Protocol(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loco_protocol::ProtocolError;

    #[test]
    fn test_unsupported_maps_to_capability() {
        let err = ThrottleError::from_encode(ProtocolError::Unsupported {
            protocol: "LocoNet",
            what: "function F12".into(),
        });
        assert!(matches!(err, ThrottleError::Capability(ref m) if m.contains("F12")));

        let err = ThrottleError::from_encode(ProtocolError::Unbound(3));
        assert!(matches!(err, ThrottleError::Protocol(_)));
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            ThrottleError::RequestTimeout { attempts: 3 }.to_string(),
            "no response after 3 attempts"
        );
        assert_eq!(
            ThrottleError::AddressOutOfRange(Address::short(0)).to_string(),
            "address 0(S) is out of range for this connection"
        );
    }
}
