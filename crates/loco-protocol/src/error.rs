//! Error types for command-station frame parsing and encoding

use thiserror::Error;

/// Errors that can occur while parsing a frame
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Frame is shorter than its opcode requires
    #[error("incomplete frame: need {needed} more bytes")]
    Incomplete { needed: usize },

    /// Invalid frame structure
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Numeric field could not be parsed
    #[error("invalid field {field}: {value}")]
    InvalidField { field: &'static str, value: String },

    /// Checksum mismatch
    #[error("checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },
}

/// Higher-level protocol errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Parse error
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// Command is outside the space this protocol family supports
    #[error("not supported by {protocol}: {what}")]
    Unsupported {
        /// Protocol name
        protocol: &'static str,
        /// What was asked for
        what: String,
    },

    /// Command needs a vendor binding (slot) that was never established
    #[error("address {0} has no vendor binding")]
    Unbound(u16),
}
