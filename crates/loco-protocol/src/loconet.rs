//! LocoNet Protocol Implementation
//!
//! LocoNet is a binary peer-to-peer bus. Every message starts with an opcode
//! byte (bit 7 set), followed by data bytes (bit 7 clear) and a checksum.
//!
//! # Format
//! - Opcode bits 6-5 give the length: `00` = 2, `01` = 4, `10` = 6,
//!   `11` = variable (count in the second byte)
//! - Checksum: XOR of every byte in the message, checksum included, is `0xFF`
//!
//! # Locomotive control
//! The command station keeps a *slot* per active locomotive. A throttle asks
//! for an address with `OPC_LOCO_ADR`, the station answers with the slot
//! contents (`OPC_SL_RD_DATA`) or a `OPC_LONG_ACK` refusal, and all further
//! commands address the slot number. The bus echoes every message back to
//! its sender, which is the only confirmation a speed or function command
//! ever gets.

use tracing::debug;

use crate::command::{
    Address, AddressMode, Decoded, Direction, FaultKind, FunctionSet, LocoRef, LocoState,
    MatchOutcome, ResponseMatcher, StateUpdate, ThrottleCommand, VendorEvent,
};
use crate::error::{ParseError, ProtocolError};
use crate::{FrameBuffer, Protocol, VendorAdapter};

/// Global power off
pub const OPC_GPOFF: u8 = 0x82;
/// Global power on
pub const OPC_GPON: u8 = 0x83;
/// Slot speed
pub const OPC_LOCO_SPD: u8 = 0xA0;
/// Slot direction and F0-F4
pub const OPC_LOCO_DIRF: u8 = 0xA1;
/// Slot F5-F8
pub const OPC_LOCO_SND: u8 = 0xA2;
/// Long acknowledge
pub const OPC_LONG_ACK: u8 = 0xB4;
/// Write slot status byte
pub const OPC_SLOT_STAT1: u8 = 0xB5;
/// Request a slot for an address
pub const OPC_LOCO_ADR: u8 = 0xBF;
/// Slot read data
pub const OPC_SL_RD_DATA: u8 = 0xE7;

/// Slot status busy/active bits
const STAT1_USE_MASK: u8 = 0x30;
/// Both bits set means a throttle owns the slot
const STAT1_IN_USE: u8 = 0x30;
/// Slot returned to the station for refresh only, 128-step mode
pub const STAT1_COMMON_128: u8 = 0x13;

/// DIRF direction bit (set = reverse)
const DIRF_DIR: u8 = 0x20;
/// DIRF F0 bit
const DIRF_F0: u8 = 0x10;

/// Speed steps above stop (128-step mode: 0 = stop, 1 = estop)
pub const SPEED_STEPS: u8 = 126;

/// Highest function a slot can carry in DIRF + SND
pub const MAX_FUNCTION: u8 = 8;

/// Highest 14-bit address
const MAX_LONG_ADDRESS: u16 = 0x3FFF;

/// Checksum byte for the given message body
pub fn checksum(body: &[u8]) -> u8 {
    body.iter().fold(0xFF, |acc, b| acc ^ b)
}

/// Whether a full message (checksum included) is intact
pub fn checksum_ok(message: &[u8]) -> bool {
    message.iter().fold(0u8, |acc, b| acc ^ b) == 0xFF
}

/// Append the checksum to a message body
pub fn with_checksum(mut body: Vec<u8>) -> Vec<u8> {
    let chk = checksum(&body);
    body.push(chk);
    body
}

/// Message length implied by an opcode, or `None` for variable length
pub fn opcode_length(opcode: u8) -> Option<usize> {
    match opcode & 0x60 {
        0x00 => Some(2),
        0x20 => Some(4),
        0x40 => Some(6),
        _ => None,
    }
}

/// Encode a speed step into the slot SPD byte
pub fn spd_byte(step: u8, emergency: bool) -> u8 {
    if emergency {
        1
    } else if step == 0 {
        0
    } else {
        step.min(SPEED_STEPS) + 1
    }
}

/// Decode a slot SPD byte into (step, emergency)
pub fn split_spd_byte(spd: u8) -> (u8, bool) {
    match spd & 0x7F {
        0 => (0, false),
        1 => (0, true),
        n => (n - 1, false),
    }
}

/// Pack direction and F0-F4 into a DIRF byte
pub fn dirf_byte(direction: Direction, functions: FunctionSet) -> u8 {
    let mut dirf = 0;
    if direction == Direction::Reverse {
        dirf |= DIRF_DIR;
    }
    if functions.get(0) {
        dirf |= DIRF_F0;
    }
    for f in 1..=4u8 {
        if functions.get(f) {
            dirf |= 1 << (f - 1);
        }
    }
    dirf
}

/// Pack F5-F8 into a SND byte
pub fn snd_byte(functions: FunctionSet) -> u8 {
    (5..=8u8)
        .filter(|&f| functions.get(f))
        .fold(0, |acc, f| acc | 1 << (f - 5))
}

fn dirf_update(dirf: u8) -> StateUpdate {
    let direction = if dirf & DIRF_DIR != 0 {
        Direction::Reverse
    } else {
        Direction::Forward
    };
    let mut functions = vec![(0, dirf & DIRF_F0 != 0)];
    functions.extend((1..=4u8).map(|f| (f, dirf & (1 << (f - 1)) != 0)));
    StateUpdate {
        direction: Some(direction),
        functions,
        ..Default::default()
    }
}

fn snd_update(snd: u8) -> StateUpdate {
    StateUpdate {
        functions: (5..=8u8).map(|f| (f, snd & (1 << (f - 5)) != 0)).collect(),
        ..Default::default()
    }
}

/// Streaming LocoNet message splitter
///
/// Resynchronizes on any byte with bit 7 set, since only opcodes carry it.
pub struct LocoNetCodec {
    buffer: Vec<u8>,
}

impl LocoNetCodec {
    /// Create a new LocoNet codec
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(32),
        }
    }
}

impl Default for LocoNetCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer for LocoNetCodec {
    fn push_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            let Some(start) = self.buffer.iter().position(|&b| b & 0x80 != 0) else {
                self.buffer.clear();
                return None;
            };
            if start > 0 {
                debug!("LocoNet discarding {} stray bytes", start);
                self.buffer.drain(..start);
            }

            let len = match opcode_length(self.buffer[0]) {
                Some(len) => len,
                None => match self.buffer.get(1) {
                    Some(&count) if count & 0x80 == 0 && count >= 2 => count as usize,
                    Some(_) => {
                        // Bad count byte: drop the opcode and resync
                        self.buffer.remove(0);
                        continue;
                    }
                    None => return None,
                },
            };

            // A new opcode before the message is complete truncates it
            let available = self.buffer.len().min(len);
            if let Some(pos) = self.buffer[1..available].iter().position(|&b| b & 0x80 != 0) {
                debug!("LocoNet message truncated by new opcode, resyncing");
                self.buffer.drain(..=pos);
                continue;
            }

            if self.buffer.len() < len {
                return None;
            }
            return Some(self.buffer.drain(..len).collect());
        }
    }

    fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Adapter for LocoNet command stations
#[derive(Debug, Clone, Default)]
pub struct LocoNetAdapter;

impl LocoNetAdapter {
    /// Create a new adapter
    pub fn new() -> Self {
        Self
    }

    fn unsupported(what: impl Into<String>) -> ProtocolError {
        ProtocolError::Unsupported {
            protocol: Protocol::LocoNet.name(),
            what: what.into(),
        }
    }

    fn slot(binding: &crate::command::Binding) -> Result<u8, ProtocolError> {
        binding
            .slot
            .ok_or(ProtocolError::Unbound(binding.address.number()))
    }

    fn decode_message(&self, frame: &[u8]) -> Result<Decoded, ParseError> {
        let opcode = frame[0];
        let expected = match opcode_length(opcode) {
            Some(len) => len,
            None => *frame.get(1).ok_or(ParseError::Incomplete { needed: 1 })? as usize,
        };
        if frame.len() < expected {
            return Err(ParseError::Incomplete {
                needed: expected - frame.len(),
            });
        }
        if !checksum_ok(frame) {
            let body = &frame[..frame.len() - 1];
            return Err(ParseError::ChecksumMismatch {
                expected: checksum(body),
                actual: frame[frame.len() - 1],
            });
        }

        let event = match opcode {
            OPC_GPOFF => VendorEvent::Fault(FaultKind::PowerOff),
            OPC_LOCO_SPD => {
                let (step, emergency) = split_spd_byte(frame[2]);
                VendorEvent::LocoUpdate {
                    loco: LocoRef::Slot(frame[1]),
                    update: StateUpdate {
                        speed_step: Some(step),
                        emergency_stop: emergency,
                        ..Default::default()
                    },
                }
            }
            OPC_LOCO_DIRF => VendorEvent::LocoUpdate {
                loco: LocoRef::Slot(frame[1]),
                update: dirf_update(frame[2]),
            },
            OPC_LOCO_SND => VendorEvent::LocoUpdate {
                loco: LocoRef::Slot(frame[1]),
                update: snd_update(frame[2]),
            },
            OPC_SLOT_STAT1 => VendorEvent::SlotStatus {
                slot: frame[1],
                in_use: frame[2] & STAT1_USE_MASK == STAT1_IN_USE,
            },
            OPC_LONG_ACK if frame[2] == 0 => VendorEvent::Fault(FaultKind::Rejected(format!(
                "LACK refused opcode 0x{:02X}",
                frame[1] | 0x80
            ))),
            OPC_SL_RD_DATA => {
                if frame[1] != 0x0E {
                    return Err(ParseError::InvalidFrame(format!(
                        "slot read length {}",
                        frame[1]
                    )));
                }
                // E7 0E slot stat adr spd dirf trk ss2 adr2 snd id1 id2 chk
                let (slot, stat, adr, spd, dirf, adr2, snd) =
                    (frame[2], frame[3], frame[4], frame[5], frame[6], frame[9], frame[10]);
                let number = (u16::from(adr2) << 7) | u16::from(adr);
                let address = if adr2 == 0 {
                    Address::short(number)
                } else {
                    Address::long(number)
                };
                let (speed_step, _) = split_spd_byte(spd);
                let mut state = LocoState {
                    speed_step,
                    ..Default::default()
                };
                dirf_update(dirf).apply_to(&mut state);
                snd_update(snd).apply_to(&mut state);
                VendorEvent::SlotData {
                    slot,
                    address,
                    in_use: stat & STAT1_USE_MASK == STAT1_IN_USE,
                    state,
                }
            }
            _ => return Ok(Decoded::Unrecognized),
        };
        Ok(Decoded::Event(event))
    }
}

/// Build a slot read reply (used by command station simulators and tests)
pub fn slot_read_data(slot: u8, address: Address, in_use: bool, state: &LocoState) -> Vec<u8> {
    let number = address.number() & MAX_LONG_ADDRESS;
    let adr = (number & 0x7F) as u8;
    let adr2 = match address.mode() {
        AddressMode::Short => 0,
        AddressMode::Long => (number >> 7) as u8,
    };
    let stat = if in_use { STAT1_IN_USE | 0x03 } else { STAT1_COMMON_128 };
    with_checksum(vec![
        OPC_SL_RD_DATA,
        0x0E,
        slot,
        stat,
        adr,
        spd_byte(state.speed_step, false),
        dirf_byte(state.direction, state.functions),
        0x07,
        0x00,
        adr2,
        snd_byte(state.functions),
        0x00,
        0x00,
    ])
}

fn is_rejection(event: &VendorEvent) -> bool {
    matches!(event, VendorEvent::Fault(FaultKind::Rejected(_)))
}

/// Matcher that accepts the bus echo for `slot` passing `check`
fn echo_matcher<F>(slot: u8, check: F) -> ResponseMatcher
where
    F: Fn(&StateUpdate) -> bool + Send + Sync + 'static,
{
    ResponseMatcher::new(move |event| match event {
        VendorEvent::LocoUpdate {
            loco: LocoRef::Slot(s),
            update,
        } if *s == slot && check(update) => MatchOutcome::Complete,
        _ => MatchOutcome::NoMatch,
    })
}

impl VendorAdapter for LocoNetAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::LocoNet
    }

    fn encode(&self, cmd: &ThrottleCommand) -> Result<Vec<u8>, ProtocolError> {
        let body = match cmd {
            ThrottleCommand::Acquire { address } => {
                if !self.supports_address(*address) {
                    return Err(Self::unsupported(format!("address {}", address)));
                }
                let number = address.number();
                let hi = match address.mode() {
                    AddressMode::Short => 0,
                    AddressMode::Long => ((number >> 7) & 0x7F) as u8,
                };
                vec![OPC_LOCO_ADR, hi, (number & 0x7F) as u8]
            }
            ThrottleCommand::Release { binding } => {
                vec![OPC_SLOT_STAT1, Self::slot(binding)?, STAT1_COMMON_128]
            }
            ThrottleCommand::SetSpeed { binding, target } => {
                if target.speed_step > SPEED_STEPS {
                    return Err(Self::unsupported(format!(
                        "speed step {}",
                        target.speed_step
                    )));
                }
                vec![
                    OPC_LOCO_SPD,
                    Self::slot(binding)?,
                    spd_byte(target.speed_step, false),
                ]
            }
            ThrottleCommand::EmergencyStop { binding, .. } => {
                vec![OPC_LOCO_SPD, Self::slot(binding)?, spd_byte(0, true)]
            }
            ThrottleCommand::SetDirection { binding, target } => vec![
                OPC_LOCO_DIRF,
                Self::slot(binding)?,
                dirf_byte(target.direction, target.functions),
            ],
            ThrottleCommand::SetFunction {
                binding,
                index,
                target,
            } => match index {
                0..=4 => vec![
                    OPC_LOCO_DIRF,
                    Self::slot(binding)?,
                    dirf_byte(target.direction, target.functions),
                ],
                5..=8 => vec![
                    OPC_LOCO_SND,
                    Self::slot(binding)?,
                    snd_byte(target.functions),
                ],
                _ => return Err(Self::unsupported(format!("function F{}", index))),
            },
        };
        Ok(with_checksum(body))
    }

    fn decode(&self, frame: &[u8]) -> Decoded {
        if frame.is_empty() || frame[0] & 0x80 == 0 {
            return Decoded::Event(VendorEvent::Fault(FaultKind::Malformed(
                "message does not start with an opcode".into(),
            )));
        }
        match self.decode_message(frame) {
            Ok(decoded) => decoded,
            Err(e) => Decoded::Event(VendorEvent::Fault(FaultKind::Malformed(e.to_string()))),
        }
    }

    fn response_matcher(&self, cmd: &ThrottleCommand) -> Option<ResponseMatcher> {
        let matcher = match cmd.clone() {
            ThrottleCommand::Acquire { address } => ResponseMatcher::new(move |event| match event {
                VendorEvent::SlotData {
                    slot,
                    address: a,
                    in_use,
                    ..
                } if *a == address => {
                    if *in_use {
                        MatchOutcome::Reject(format!("slot {} is in use by another throttle", slot))
                    } else {
                        MatchOutcome::Complete
                    }
                }
                e if is_rejection(e) => MatchOutcome::Reject("no free slot".into()),
                _ => MatchOutcome::NoMatch,
            }),
            ThrottleCommand::Release { binding } => {
                let slot = binding.slot?;
                ResponseMatcher::new(move |event| match event {
                    VendorEvent::SlotStatus { slot: s, in_use } if *s == slot && !in_use => {
                        MatchOutcome::Complete
                    }
                    _ => MatchOutcome::NoMatch,
                })
            }
            ThrottleCommand::SetSpeed { binding, target } => {
                echo_matcher(binding.slot?, move |u| {
                    u.speed_step == Some(target.speed_step) && !u.emergency_stop
                })
            }
            ThrottleCommand::EmergencyStop { binding, .. } => {
                echo_matcher(binding.slot?, |u| u.emergency_stop)
            }
            ThrottleCommand::SetDirection { binding, target } => {
                echo_matcher(binding.slot?, move |u| {
                    u.direction == Some(target.direction)
                })
            }
            ThrottleCommand::SetFunction {
                binding,
                index,
                target,
            } => {
                let on = target.functions.get(index);
                echo_matcher(binding.slot?, move |u| u.function(index) == Some(on))
            }
        };
        Some(matcher)
    }

    fn supports_shared_addressing(&self) -> bool {
        false
    }

    fn requires_acquisition_round_trip(&self) -> bool {
        true
    }

    fn speed_steps(&self) -> u8 {
        SPEED_STEPS
    }

    fn max_function(&self) -> u8 {
        MAX_FUNCTION
    }

    fn supports_address(&self, address: Address) -> bool {
        match address.mode() {
            AddressMode::Short => (1..=127).contains(&address.number()),
            AddressMode::Long => (128..=MAX_LONG_ADDRESS).contains(&address.number()),
        }
    }

    fn frame_buffer(&self) -> Box<dyn FrameBuffer> {
        Box::new(LocoNetCodec::new())
    }
}
