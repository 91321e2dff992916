//! Simulator errors

use thiserror::Error;

/// Errors from virtual command stations
#[derive(Debug, Error)]
pub enum SimError {
    /// The station has never seen this address
    #[error("no locomotive {0} on the virtual layout")]
    UnknownLoco(u16),

    /// Stream to the connection failed
    #[error("station stream error: {0}")]
    Io(#[from] std::io::Error),
}
