//! Locomotive Command Station Protocol Library
//!
//! This crate provides the generic command model and the vendor adapters
//! that translate it to and from model-railroad command station protocols:
//!
//! - **DCC-EX**: ASCII `<...>` frames, shared addressing, no acquisition step
//! - **LocoNet**: binary opcode frames with XOR checksum, slot-based exclusive
//!   ownership acquired with a round-trip, commands confirmed by bus echo
//!
//! # Architecture
//!
//! Each protocol module provides:
//! - A streaming frame buffer that splits a byte stream into whole frames
//! - A stateless [`VendorAdapter`] that encodes [`ThrottleCommand`]s,
//!   decodes frames into [`VendorEvent`]s and builds response matchers
//!
//! # Example
//!
//! ```rust
//! use loco_protocol::{create_adapter, Address, Decoded, Protocol, VendorEvent};
//!
//! let adapter = create_adapter(Protocol::DccEx);
//! let mut frames = adapter.frame_buffer();
//! frames.push_bytes(b"<l 3 0 130 0>");
//!
//! let frame = frames.next_frame().unwrap();
//! match adapter.decode(&frame) {
//!     Decoded::Event(VendorEvent::LocoUpdate { update, .. }) => {
//!         assert_eq!(update.speed_step, Some(1));
//!     }
//!     other => panic!("unexpected {:?}", other),
//! }
//! ```

use std::sync::Arc;

pub mod command;
pub mod dccex;
pub mod error;
pub mod loconet;

pub use command::{
    Address, AddressMode, Binding, Decoded, Direction, EventClass, FaultKind, FunctionSet,
    LocoRef, LocoState, MatchOutcome, ResponseMatcher, StateUpdate, ThrottleCommand, VendorEvent,
};
pub use error::{ParseError, ProtocolError};

/// Identifies which command station protocol family a connection speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Protocol {
    /// DCC-EX native ASCII protocol
    DccEx,
    /// Digitrax LocoNet
    LocoNet,
}

impl Protocol {
    /// Returns a human-readable name for the protocol
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::DccEx => "DCC-EX",
            Protocol::LocoNet => "LocoNet",
        }
    }
}

/// Splits an incoming byte stream into complete frames
pub trait FrameBuffer: Send {
    /// Push raw bytes into the buffer
    fn push_bytes(&mut self, data: &[u8]);

    /// Try to extract the next complete frame
    fn next_frame(&mut self) -> Option<Vec<u8>>;

    /// Clear the internal buffer
    fn clear(&mut self);
}

/// Contract every protocol family implements
///
/// Adapters hold no mutable state, so one instance is shared by every task
/// of a connection as `Arc<dyn VendorAdapter>`.
pub trait VendorAdapter: Send + Sync {
    /// Protocol family
    fn protocol(&self) -> Protocol;

    /// Encode a generic command to one frame
    ///
    /// Commands outside the advertised capability space return
    /// [`ProtocolError::Unsupported`].
    fn encode(&self, cmd: &ThrottleCommand) -> Result<Vec<u8>, ProtocolError>;

    /// Decode one complete frame
    fn decode(&self, frame: &[u8]) -> Decoded;

    /// Matcher for the reply that confirms `cmd`
    ///
    /// `None` means the command station never answers this command and the
    /// request is complete once written.
    fn response_matcher(&self, cmd: &ThrottleCommand) -> Option<ResponseMatcher>;

    /// Whether several throttles may drive one address at once
    fn supports_shared_addressing(&self) -> bool;

    /// Whether an address must be requested from the command station first
    fn requires_acquisition_round_trip(&self) -> bool;

    /// Number of speed steps above stop
    fn speed_steps(&self) -> u8;

    /// Highest function index the protocol can switch
    fn max_function(&self) -> u8;

    /// Whether `address` exists in this protocol's addressing space
    fn supports_address(&self, address: Address) -> bool {
        dcc_address_valid(address)
    }

    /// Fresh frame buffer for one connection
    fn frame_buffer(&self) -> Box<dyn FrameBuffer>;
}

/// Standard DCC ranges: short 1..=127, long 128..=10239
pub fn dcc_address_valid(address: Address) -> bool {
    match address.mode() {
        AddressMode::Short => (1..=127).contains(&address.number()),
        AddressMode::Long => (128..=10239).contains(&address.number()),
    }
}

/// Convert a speed fraction in [0, 1] to a protocol step
pub fn speed_to_step(fraction: f32, steps: u8) -> u8 {
    let clamped = fraction.clamp(0.0, 1.0);
    (clamped * steps as f32).round() as u8
}

/// Convert a protocol step back to a speed fraction
pub fn step_to_speed(step: u8, steps: u8) -> f32 {
    if steps == 0 {
        return 0.0;
    }
    step.min(steps) as f32 / steps as f32
}

/// Create the adapter for the given protocol
pub fn create_adapter(protocol: Protocol) -> Arc<dyn VendorAdapter> {
    match protocol {
        Protocol::DccEx => Arc::new(dccex::DccExAdapter::new()),
        Protocol::LocoNet => Arc::new(loconet::LocoNetAdapter::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dcc_address_ranges() {
        assert!(dcc_address_valid(Address::short(3)));
        assert!(!dcc_address_valid(Address::short(0)));
        assert!(!dcc_address_valid(Address::short(128)));
        assert!(dcc_address_valid(Address::long(128)));
        assert!(dcc_address_valid(Address::long(10239)));
        assert!(!dcc_address_valid(Address::long(10240)));
        assert!(!dcc_address_valid(Address::long(100)));
    }

    #[test]
    fn test_speed_step_conversion() {
        assert_eq!(speed_to_step(0.0, 126), 0);
        assert_eq!(speed_to_step(1.0, 126), 126);
        assert_eq!(speed_to_step(0.5, 126), 63);
        assert_eq!(speed_to_step(2.0, 126), 126);
        assert!((step_to_speed(63, 126) - 0.5).abs() < f32::EPSILON);
        assert_eq!(step_to_speed(5, 0), 0.0);
    }

    #[test]
    fn test_factory_matches_protocol() {
        for protocol in [Protocol::DccEx, Protocol::LocoNet] {
            assert_eq!(create_adapter(protocol).protocol(), protocol);
        }
        assert!(create_adapter(Protocol::DccEx).supports_shared_addressing());
        assert!(create_adapter(Protocol::LocoNet).requires_acquisition_round_trip());
    }
}
