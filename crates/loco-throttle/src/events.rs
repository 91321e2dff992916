//! Events delivered to throttle and connection listeners
//!
//! Throttle listeners see confirmed state changes for one address. Connection
//! listeners see everything crossing the wire, which is what a traffic
//! monitor needs.

use loco_protocol::{Address, Direction, FaultKind, Protocol, VendorEvent};

/// Notification delivered to the listeners of one throttle
#[derive(Debug, Clone, PartialEq)]
pub enum ThrottleEvent {
    /// Speed confirmed by the command station
    SpeedChanged {
        /// Locomotive address
        address: Address,
        /// Speed as a fraction of full speed
        speed: f32,
    },

    /// Direction confirmed
    DirectionChanged {
        /// Locomotive address
        address: Address,
        /// New direction
        direction: Direction,
    },

    /// Function output confirmed
    FunctionChanged {
        /// Locomotive address
        address: Address,
        /// Function number
        index: u8,
        /// New state
        on: bool,
    },

    /// Control was taken over by another requester
    Dispossessed {
        /// Locomotive address
        address: Address,
    },

    /// The connection went away; the throttle is no longer usable
    ConnectionLost {
        /// Locomotive address
        address: Address,
    },

    /// A command issued through this throttle failed
    CommandFailed {
        /// Locomotive address
        address: Address,
        /// Command name
        command: &'static str,
        /// Failure description
        reason: String,
    },
}

impl ThrottleEvent {
    /// Address the event concerns
    pub fn address(&self) -> Address {
        match self {
            ThrottleEvent::SpeedChanged { address, .. }
            | ThrottleEvent::DirectionChanged { address, .. }
            | ThrottleEvent::FunctionChanged { address, .. }
            | ThrottleEvent::Dispossessed { address }
            | ThrottleEvent::ConnectionLost { address }
            | ThrottleEvent::CommandFailed { address, .. } => *address,
        }
    }

    /// Whether the throttle stops being usable after this event
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ThrottleEvent::Dispossessed { .. } | ThrottleEvent::ConnectionLost { .. }
        )
    }
}

/// Connection-wide activity
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Frame written to the command station
    FrameOut {
        /// Raw frame
        data: Vec<u8>,
        /// Protocol of the connection
        protocol: Protocol,
    },

    /// Frame read from the command station
    FrameIn {
        /// Raw frame
        data: Vec<u8>,
        /// Protocol of the connection
        protocol: Protocol,
    },

    /// Decoded frame that answered no outstanding request
    Unsolicited(VendorEvent),

    /// Transport-level fault (overload, power off, malformed frame, refusal)
    Fault(FaultKind),

    /// An address request was refused or timed out
    AcquisitionFailed {
        /// Requested address
        address: Address,
        /// Why it failed
        reason: String,
    },

    /// The connection closed; nothing further will be delivered
    Disconnected,
}

impl ConnectionEvent {
    /// Check if this is a raw traffic event (for traffic monitor filtering)
    pub fn is_traffic(&self) -> bool {
        matches!(
            self,
            ConnectionEvent::FrameOut { .. } | ConnectionEvent::FrameIn { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_address_and_terminal() {
        let a = Address::short(3);
        assert_eq!(ThrottleEvent::Dispossessed { address: a }.address(), a);
        assert!(ThrottleEvent::ConnectionLost { address: a }.is_terminal());
        assert!(!ThrottleEvent::SpeedChanged {
            address: a,
            speed: 0.5
        }
        .is_terminal());
    }

    #[test]
    fn test_traffic_filter() {
        assert!(ConnectionEvent::FrameIn {
            data: vec![0x83, 0x7C],
            protocol: Protocol::LocoNet
        }
        .is_traffic());
        assert!(!ConnectionEvent::Disconnected.is_traffic());
    }
}
