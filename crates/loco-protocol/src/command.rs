//! Normalized locomotive command and event representation
//!
//! `ThrottleCommand` is what the core asks a command station to do and
//! `VendorEvent` is what a decoded frame means, independent of vendor.

use std::fmt;

/// DCC addressing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AddressMode {
    /// Primary (short) address
    Short,
    /// Extended (long) address
    Long,
}

/// Locomotive address within one connection's addressing space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Address {
    number: u16,
    mode: AddressMode,
}

impl Address {
    /// Create an address with an explicit mode
    pub const fn new(number: u16, mode: AddressMode) -> Self {
        Self { number, mode }
    }

    /// Short (primary) address
    pub const fn short(number: u16) -> Self {
        Self::new(number, AddressMode::Short)
    }

    /// Long (extended) address
    pub const fn long(number: u16) -> Self {
        Self::new(number, AddressMode::Long)
    }

    /// Infer the mode the way most command stations do: above 127 is long
    pub const fn infer(number: u16) -> Self {
        if number > 127 {
            Self::long(number)
        } else {
            Self::short(number)
        }
    }

    /// Numeric address
    pub fn number(&self) -> u16 {
        self.number
    }

    /// Addressing mode
    pub fn mode(&self) -> AddressMode {
        self.mode
    }

    /// Returns true for extended addresses
    pub fn is_long(&self) -> bool {
        self.mode == AddressMode::Long
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            AddressMode::Short => write!(f, "{}(S)", self.number),
            AddressMode::Long => write!(f, "{}(L)", self.number),
        }
    }
}

/// Direction of travel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
}

impl Direction {
    /// The opposite direction
    pub fn reversed(self) -> Self {
        match self {
            Self::Forward => Self::Reverse,
            Self::Reverse => Self::Forward,
        }
    }
}

/// Bit set of function outputs F0..F127
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FunctionSet(pub u128);

impl FunctionSet {
    /// Highest representable function index
    pub const MAX_INDEX: u8 = 127;

    /// Whether function `index` is on
    pub fn get(&self, index: u8) -> bool {
        index <= Self::MAX_INDEX && self.0 & (1u128 << index) != 0
    }

    /// Switch function `index` on or off
    pub fn set(&mut self, index: u8, on: bool) {
        if index > Self::MAX_INDEX {
            return;
        }
        if on {
            self.0 |= 1u128 << index;
        } else {
            self.0 &= !(1u128 << index);
        }
    }

    /// Copy with function `index` changed
    pub fn with(mut self, index: u8, on: bool) -> Self {
        self.set(index, on);
        self
    }
}

/// Complete control state of one locomotive as the core tracks it
///
/// `speed_step` counts in the protocol's own steps (0 = stop).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LocoState {
    pub speed_step: u8,
    pub direction: Direction,
    pub functions: FunctionSet,
}

/// Address plus whatever vendor handle the command station assigned to it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Binding {
    /// Locomotive address
    pub address: Address,
    /// Command-station slot (LocoNet style), if the vendor uses slots
    pub slot: Option<u8>,
}

impl Binding {
    /// Binding without a vendor slot
    pub fn unslotted(address: Address) -> Self {
        Self { address, slot: None }
    }
}

/// Generic command the core asks a command station to perform
///
/// Mutating commands carry the full *target* state so adapters that pack
/// several fields into one frame never have to remember anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThrottleCommand {
    /// Ask the command station for control of an address
    Acquire { address: Address },
    /// Hand an address back to the command station
    Release { binding: Binding },
    /// Change speed
    SetSpeed { binding: Binding, target: LocoState },
    /// Change direction
    SetDirection { binding: Binding, target: LocoState },
    /// Change one function output
    SetFunction {
        binding: Binding,
        index: u8,
        target: LocoState,
    },
    /// Stop immediately, bypassing momentum
    EmergencyStop { binding: Binding, target: LocoState },
}

impl ThrottleCommand {
    /// Address the command concerns
    pub fn address(&self) -> Address {
        match self {
            Self::Acquire { address } => *address,
            Self::Release { binding }
            | Self::SetSpeed { binding, .. }
            | Self::SetDirection { binding, .. }
            | Self::SetFunction { binding, .. }
            | Self::EmergencyStop { binding, .. } => binding.address,
        }
    }

    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Acquire { .. } => "acquire",
            Self::Release { .. } => "release",
            Self::SetSpeed { .. } => "speed",
            Self::SetDirection { .. } => "direction",
            Self::SetFunction { .. } => "function",
            Self::EmergencyStop { .. } => "estop",
        }
    }
}

/// How a broadcast identifies the locomotive it is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocoRef {
    Address(Address),
    Slot(u8),
}

/// Partial locomotive state carried by a broadcast or echo
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StateUpdate {
    pub speed_step: Option<u8>,
    /// Set when the broadcast reports an emergency stop
    pub emergency_stop: bool,
    pub direction: Option<Direction>,
    /// Function bits the frame actually reports, as (index, on)
    pub functions: Vec<(u8, bool)>,
}

impl StateUpdate {
    /// Apply the known fields on top of `state`
    pub fn apply_to(&self, state: &mut LocoState) {
        if let Some(step) = self.speed_step {
            state.speed_step = step;
        }
        if let Some(direction) = self.direction {
            state.direction = direction;
        }
        for &(index, on) in &self.functions {
            state.functions.set(index, on);
        }
    }

    /// Reported value of function `index`, if the frame carries it
    pub fn function(&self, index: u8) -> Option<bool> {
        self.functions
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, on)| *on)
    }
}

/// Transport-level problems reported by the command station or the framer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultKind {
    /// Track short / booster overload
    Overload,
    /// Track power switched off
    PowerOff,
    /// Frame could not be parsed
    Malformed(String),
    /// Command station refused the last command
    Rejected(String),
}

/// Generic meaning of one decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VendorEvent {
    /// Slot contents for an address (acquisition reply or status change)
    SlotData {
        slot: u8,
        address: Address,
        in_use: bool,
        state: LocoState,
    },
    /// Slot status written (release echo or another throttle's change)
    SlotStatus { slot: u8, in_use: bool },
    /// Locomotive state broadcast or command echo
    LocoUpdate { loco: LocoRef, update: StateUpdate },
    /// Transport-level fault
    Fault(FaultKind),
}

/// The three unsolicited frame classes the core distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    AddressStatus,
    LocoState,
    TransportError,
}

impl VendorEvent {
    /// Classify the event
    pub fn class(&self) -> EventClass {
        match self {
            Self::SlotData { .. } | Self::SlotStatus { .. } => EventClass::AddressStatus,
            Self::LocoUpdate { .. } => EventClass::LocoState,
            Self::Fault(_) => EventClass::TransportError,
        }
    }
}

/// Result of decoding one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Event(VendorEvent),
    Unrecognized,
}

impl Decoded {
    /// The event, if the frame was recognized
    pub fn event(self) -> Option<VendorEvent> {
        match self {
            Self::Event(event) => Some(event),
            Self::Unrecognized => None,
        }
    }
}

/// Verdict of a response matcher on one decoded event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// The event confirms the request
    Complete,
    /// The event is a negative answer to the request
    Reject(String),
    /// Not related to this request
    NoMatch,
}

type MatchFn = dyn Fn(&VendorEvent) -> MatchOutcome + Send + Sync;

/// Predicate deciding whether an event answers an outstanding request
pub struct ResponseMatcher(Box<MatchFn>);

impl ResponseMatcher {
    /// Wrap a matching closure
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&VendorEvent) -> MatchOutcome + Send + Sync + 'static,
    {
        Self(Box::new(f))
    }

    /// Evaluate the matcher against an event
    pub fn check(&self, event: &VendorEvent) -> MatchOutcome {
        (self.0)(event)
    }
}

impl fmt::Debug for ResponseMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResponseMatcher(<fn>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display_and_inference() {
        assert_eq!(Address::short(3).to_string(), "3(S)");
        assert_eq!(Address::long(1234).to_string(), "1234(L)");
        assert_eq!(Address::infer(127), Address::short(127));
        assert_eq!(Address::infer(128), Address::long(128));
        assert_ne!(Address::short(3), Address::long(3));
    }

    #[test]
    fn test_function_set_bits() {
        let mut f = FunctionSet::default();
        f.set(0, true);
        f.set(68, true);
        assert!(f.get(0));
        assert!(f.get(68));
        assert!(!f.get(1));
        f.set(0, false);
        assert!(!f.get(0));
        // out of range is ignored
        f.set(200, true);
        assert!(!f.get(200));
    }

    #[test]
    fn test_state_update_applies_known_fields_only() {
        let mut state = LocoState {
            speed_step: 10,
            direction: Direction::Forward,
            functions: FunctionSet::default().with(3, true),
        };
        let update = StateUpdate {
            speed_step: None,
            emergency_stop: false,
            direction: Some(Direction::Reverse),
            functions: vec![(1, true)],
        };
        update.apply_to(&mut state);
        assert_eq!(state.speed_step, 10);
        assert_eq!(state.direction, Direction::Reverse);
        assert!(state.functions.get(1));
        assert!(state.functions.get(3));
        assert_eq!(update.function(1), Some(true));
        assert_eq!(update.function(2), None);
    }

    #[test]
    fn test_event_classes() {
        let status = VendorEvent::SlotStatus {
            slot: 4,
            in_use: false,
        };
        assert_eq!(status.class(), EventClass::AddressStatus);
        let fault = VendorEvent::Fault(FaultKind::Overload);
        assert_eq!(fault.class(), EventClass::TransportError);
        let update = VendorEvent::LocoUpdate {
            loco: LocoRef::Slot(4),
            update: StateUpdate::default(),
        };
        assert_eq!(update.class(), EventClass::LocoState);
    }

    #[test]
    fn test_response_matcher_closure() {
        let m = ResponseMatcher::new(|ev| match ev {
            VendorEvent::SlotStatus { slot: 2, .. } => MatchOutcome::Complete,
            _ => MatchOutcome::NoMatch,
        });
        assert_eq!(
            m.check(&VendorEvent::SlotStatus {
                slot: 2,
                in_use: false
            }),
            MatchOutcome::Complete
        );
        assert_eq!(
            m.check(&VendorEvent::Fault(FaultKind::PowerOff)),
            MatchOutcome::NoMatch
        );
    }
}
