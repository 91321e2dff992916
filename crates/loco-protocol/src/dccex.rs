//! DCC-EX Native Protocol Implementation
//!
//! DCC-EX command stations speak an ASCII protocol of frames wrapped in
//! angle brackets. The first character after `<` is the opcode.
//!
//! # Format
//! - Frames: `<OP param param ...>`
//! - Whitespace separates parameters
//!
//! # Commands used here
//! - `<t cab speed dir>` - speed and direction (speed -1 = emergency stop)
//! - `<t cab>` - request a state broadcast for a cab
//! - `<F cab fn state>` - function on/off
//! - `<- cab>` - forget a cab (never answered)
//!
//! # Replies and broadcasts
//! - `<l cab reg speedbyte functmap>` - locomotive state, sent to every client
//! - `<X>` - the last command failed
//! - `<p0>` / `<p1>` - track power off / on
//! - `<* ... *>` - diagnostics, overload reports included
//!
//! Every client sees every `<l>` broadcast, so addresses can be shared and no
//! acquisition step exists.

use tracing::debug;

use crate::command::{
    Address, Decoded, Direction, FaultKind, FunctionSet, LocoRef, MatchOutcome, ResponseMatcher,
    StateUpdate, ThrottleCommand, VendorEvent,
};
use crate::error::{ParseError, ProtocolError};
use crate::{FrameBuffer, Protocol, VendorAdapter};

/// Maximum frame length (reasonable limit to prevent buffer overflow)
const MAX_FRAME_LEN: usize = 256;

/// Speed steps above stop
pub const SPEED_STEPS: u8 = 126;

/// Highest function number DCC-EX can switch
pub const MAX_FUNCTION: u8 = 68;

/// DCC-EX protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DccExFrame {
    /// Throttle: `<t cab speed dir>`
    Throttle { cab: u16, speed: i16, forward: bool },
    /// State request: `<t cab>`
    QueryLoco { cab: u16 },
    /// Function: `<F cab fn state>`
    Function { cab: u16, index: u8, on: bool },
    /// Forget cab: `<- cab>`
    Forget { cab: u16 },
    /// Locomotive broadcast: `<l cab reg speedbyte functmap>`
    LocoState {
        cab: u16,
        speed_byte: u8,
        functions: u128,
    },
    /// Command failed: `<X>`
    Fail,
    /// Track power: `<p0 ...>` or `<p1 ...>`
    Power { on: bool },
    /// Diagnostic text: `<* ... *>`
    Diagnostic(String),
    /// Unrecognized frame body
    Unknown(String),
}

impl DccExFrame {
    /// Parse a frame body (without the angle brackets)
    pub fn parse(body: &str) -> Result<Self, ParseError> {
        let body = body.trim();
        let Some(opcode) = body.chars().next() else {
            return Err(ParseError::InvalidFrame("empty frame".into()));
        };
        let rest = body[opcode.len_utf8()..].trim();
        let params: Vec<&str> = rest.split_whitespace().collect();

        match opcode {
            't' => match params.as_slice() {
                [cab] => Ok(Self::QueryLoco {
                    cab: parse_field("cab", cab)?,
                }),
                [cab, speed, dir] | [_, cab, speed, dir] => Ok(Self::Throttle {
                    cab: parse_field("cab", cab)?,
                    speed: parse_field("speed", speed)?,
                    forward: parse_field::<u8>("dir", dir)? != 0,
                }),
                _ => Err(ParseError::InvalidFrame(format!("bad throttle frame: {}", body))),
            },
            'F' => match params.as_slice() {
                [cab, index, state] => Ok(Self::Function {
                    cab: parse_field("cab", cab)?,
                    index: parse_field("fn", index)?,
                    on: parse_field::<u8>("state", state)? != 0,
                }),
                _ => Err(ParseError::InvalidFrame(format!("bad function frame: {}", body))),
            },
            '-' => match params.as_slice() {
                [cab] => Ok(Self::Forget {
                    cab: parse_field("cab", cab)?,
                }),
                _ => Err(ParseError::InvalidFrame(format!("bad forget frame: {}", body))),
            },
            'l' => match params.as_slice() {
                [cab, _reg, speed_byte, functions] => Ok(Self::LocoState {
                    cab: parse_field("cab", cab)?,
                    speed_byte: parse_field("speedbyte", speed_byte)?,
                    functions: parse_field("functmap", functions)?,
                }),
                _ => Err(ParseError::InvalidFrame(format!("bad loco frame: {}", body))),
            },
            'X' => Ok(Self::Fail),
            'p' => match rest.chars().next() {
                Some('0') => Ok(Self::Power { on: false }),
                Some('1') => Ok(Self::Power { on: true }),
                _ => Ok(Self::Unknown(body.to_string())),
            },
            '*' => Ok(Self::Diagnostic(
                rest.trim_end_matches('*').trim().to_string(),
            )),
            _ => Ok(Self::Unknown(body.to_string())),
        }
    }

    /// Encode this frame to its wire format
    pub fn encode(&self) -> Vec<u8> {
        let body = match self {
            Self::Throttle {
                cab,
                speed,
                forward,
            } => format!("t {} {} {}", cab, speed, u8::from(*forward)),
            Self::QueryLoco { cab } => format!("t {}", cab),
            Self::Function { cab, index, on } => format!("F {} {} {}", cab, index, u8::from(*on)),
            Self::Forget { cab } => format!("- {}", cab),
            Self::LocoState {
                cab,
                speed_byte,
                functions,
            } => format!("l {} 0 {} {}", cab, speed_byte, functions),
            Self::Fail => "X".to_string(),
            Self::Power { on } => format!("p{}", u8::from(*on)),
            Self::Diagnostic(text) => format!("* {} *", text),
            Self::Unknown(text) => text.clone(),
        };
        format!("<{}>", body).into_bytes()
    }
}

fn parse_field<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, ParseError> {
    value.parse::<T>().map_err(|_| ParseError::InvalidField {
        field,
        value: value.to_string(),
    })
}

/// Pack direction and speed step into a DCC-EX speed byte
///
/// Bit 7 is forward; the low seven bits are 0 = stop, 1 = emergency stop,
/// n = step n - 1.
pub fn speed_byte(step: u8, direction: Direction, emergency: bool) -> u8 {
    let low = if emergency {
        1
    } else if step == 0 {
        0
    } else {
        step.min(SPEED_STEPS) + 1
    };
    match direction {
        Direction::Forward => 0x80 | low,
        Direction::Reverse => low,
    }
}

/// Unpack a DCC-EX speed byte into (step, direction, emergency)
pub fn split_speed_byte(byte: u8) -> (u8, Direction, bool) {
    let direction = if byte & 0x80 != 0 {
        Direction::Forward
    } else {
        Direction::Reverse
    };
    match byte & 0x7F {
        0 => (0, direction, false),
        1 => (0, direction, true),
        n => (n - 1, direction, false),
    }
}

/// Streaming DCC-EX frame splitter
pub struct DccExCodec {
    buffer: Vec<u8>,
}

impl DccExCodec {
    /// Create a new DCC-EX codec
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(64),
        }
    }
}

impl Default for DccExCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer for DccExCodec {
    fn push_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    fn next_frame(&mut self) -> Option<Vec<u8>> {
        // Discard noise before the next frame start
        let Some(start) = self.buffer.iter().position(|&b| b == b'<') else {
            self.buffer.clear();
            return None;
        };
        if start > 0 {
            self.buffer.drain(..start);
        }

        match self.buffer.iter().position(|&b| b == b'>') {
            Some(end) => {
                let frame: Vec<u8> = self.buffer.drain(..=end).collect();
                // A second '<' inside means the first frame was truncated
                if let Some(restart) = frame[1..].iter().rposition(|&b| b == b'<') {
                    debug!("DCC-EX frame truncated, resyncing");
                    return Some(frame[restart + 1..].to_vec());
                }
                Some(frame)
            }
            None => {
                if self.buffer.len() > MAX_FRAME_LEN {
                    debug!("DCC-EX buffer overflow, clearing");
                    self.buffer.clear();
                }
                None
            }
        }
    }

    fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Adapter for DCC-EX command stations
#[derive(Debug, Clone, Default)]
pub struct DccExAdapter;

impl DccExAdapter {
    /// Create a new adapter
    pub fn new() -> Self {
        Self
    }

    fn unsupported(what: impl Into<String>) -> ProtocolError {
        ProtocolError::Unsupported {
            protocol: Protocol::DccEx.name(),
            what: what.into(),
        }
    }

    fn cab(&self, address: Address) -> Result<u16, ProtocolError> {
        if self.supports_address(address) {
            Ok(address.number())
        } else {
            Err(Self::unsupported(format!("address {}", address)))
        }
    }
}

fn is_rejection(event: &VendorEvent) -> bool {
    matches!(event, VendorEvent::Fault(FaultKind::Rejected(_)))
}

/// Matcher that accepts a `<l>` broadcast for `address` passing `check`
fn broadcast_matcher<F>(address: Address, check: F) -> ResponseMatcher
where
    F: Fn(&StateUpdate) -> bool + Send + Sync + 'static,
{
    ResponseMatcher::new(move |event| match event {
        VendorEvent::LocoUpdate {
            loco: LocoRef::Address(a),
            update,
        } if a.number() == address.number() && check(update) => MatchOutcome::Complete,
        e if is_rejection(e) => MatchOutcome::Reject("command station answered <X>".into()),
        _ => MatchOutcome::NoMatch,
    })
}

impl VendorAdapter for DccExAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::DccEx
    }

    fn encode(&self, cmd: &ThrottleCommand) -> Result<Vec<u8>, ProtocolError> {
        let frame = match cmd {
            ThrottleCommand::Acquire { address } => DccExFrame::QueryLoco {
                cab: self.cab(*address)?,
            },
            ThrottleCommand::Release { binding } => DccExFrame::Forget {
                cab: self.cab(binding.address)?,
            },
            ThrottleCommand::SetSpeed { binding, target }
            | ThrottleCommand::SetDirection { binding, target } => {
                if target.speed_step > SPEED_STEPS {
                    return Err(Self::unsupported(format!(
                        "speed step {}",
                        target.speed_step
                    )));
                }
                DccExFrame::Throttle {
                    cab: self.cab(binding.address)?,
                    speed: i16::from(target.speed_step),
                    forward: target.direction == Direction::Forward,
                }
            }
            ThrottleCommand::EmergencyStop { binding, target } => DccExFrame::Throttle {
                cab: self.cab(binding.address)?,
                speed: -1,
                forward: target.direction == Direction::Forward,
            },
            ThrottleCommand::SetFunction {
                binding,
                index,
                target,
            } => {
                if *index > MAX_FUNCTION {
                    return Err(Self::unsupported(format!("function F{}", index)));
                }
                DccExFrame::Function {
                    cab: self.cab(binding.address)?,
                    index: *index,
                    on: target.functions.get(*index),
                }
            }
        };
        Ok(frame.encode())
    }

    fn decode(&self, frame: &[u8]) -> Decoded {
        let text = String::from_utf8_lossy(frame);
        let Some(body) = text
            .trim()
            .strip_prefix('<')
            .and_then(|s| s.strip_suffix('>'))
        else {
            return Decoded::Event(VendorEvent::Fault(FaultKind::Malformed(format!(
                "unterminated frame {:?}",
                text
            ))));
        };

        let parsed = match DccExFrame::parse(body) {
            Ok(parsed) => parsed,
            Err(e) => return Decoded::Event(VendorEvent::Fault(FaultKind::Malformed(e.to_string()))),
        };

        match parsed {
            DccExFrame::LocoState {
                cab,
                speed_byte,
                functions,
            } => {
                let (step, direction, emergency) = split_speed_byte(speed_byte);
                let map = FunctionSet(functions);
                Decoded::Event(VendorEvent::LocoUpdate {
                    loco: LocoRef::Address(Address::infer(cab)),
                    update: StateUpdate {
                        speed_step: Some(step),
                        emergency_stop: emergency,
                        direction: Some(direction),
                        functions: (0..=MAX_FUNCTION).map(|i| (i, map.get(i))).collect(),
                    },
                })
            }
            DccExFrame::Fail => Decoded::Event(VendorEvent::Fault(FaultKind::Rejected(
                "command failed".into(),
            ))),
            DccExFrame::Power { on: false } => Decoded::Event(VendorEvent::Fault(FaultKind::PowerOff)),
            DccExFrame::Diagnostic(text) if text.to_ascii_uppercase().contains("OVERLOAD") => {
                Decoded::Event(VendorEvent::Fault(FaultKind::Overload))
            }
            _ => Decoded::Unrecognized,
        }
    }

    fn response_matcher(&self, cmd: &ThrottleCommand) -> Option<ResponseMatcher> {
        match cmd.clone() {
            ThrottleCommand::Acquire { address } => Some(broadcast_matcher(address, |_| true)),
            ThrottleCommand::Release { .. } => None,
            ThrottleCommand::SetSpeed { binding, target }
            | ThrottleCommand::SetDirection { binding, target } => {
                Some(broadcast_matcher(binding.address, move |u| {
                    u.speed_step == Some(target.speed_step)
                        && !u.emergency_stop
                        && u.direction == Some(target.direction)
                }))
            }
            ThrottleCommand::EmergencyStop { binding, .. } => {
                Some(broadcast_matcher(binding.address, |u| {
                    u.emergency_stop || u.speed_step == Some(0)
                }))
            }
            ThrottleCommand::SetFunction {
                binding,
                index,
                target,
            } => {
                let on = target.functions.get(index);
                Some(broadcast_matcher(binding.address, move |u| {
                    u.function(index) == Some(on)
                }))
            }
        }
    }

    fn supports_shared_addressing(&self) -> bool {
        true
    }

    fn requires_acquisition_round_trip(&self) -> bool {
        false
    }

    fn speed_steps(&self) -> u8 {
        SPEED_STEPS
    }

    fn max_function(&self) -> u8 {
        MAX_FUNCTION
    }

    fn frame_buffer(&self) -> Box<dyn FrameBuffer> {
        Box::new(DccExCodec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Binding, LocoState};
    use proptest::prelude::*;

    fn binding(n: u16) -> Binding {
        Binding::unslotted(Address::infer(n))
    }

    fn decode_event(adapter: &DccExAdapter, frame: &[u8]) -> VendorEvent {
        adapter.decode(frame).event().expect("recognized frame")
    }

    #[test]
    fn test_codec_splits_frames_and_skips_noise() {
        let mut codec = DccExCodec::new();
        codec.push_bytes(b"junk<l 3 0 130 0>\r\n<p0");
        assert_eq!(codec.next_frame().unwrap(), b"<l 3 0 130 0>");
        assert_eq!(codec.next_frame(), None);
        codec.push_bytes(b" MAIN>");
        assert_eq!(codec.next_frame().unwrap(), b"<p0 MAIN>");
    }

    #[test]
    fn test_codec_resyncs_on_truncated_frame() {
        let mut codec = DccExCodec::new();
        codec.push_bytes(b"<l 3 0<X>");
        assert_eq!(codec.next_frame().unwrap(), b"<X>");
    }

    #[test]
    fn test_encode_speed_and_direction() {
        let adapter = DccExAdapter::new();
        let target = LocoState {
            speed_step: 63,
            direction: Direction::Forward,
            ..Default::default()
        };
        let bytes = adapter
            .encode(&ThrottleCommand::SetSpeed {
                binding: binding(3),
                target,
            })
            .unwrap();
        assert_eq!(bytes, b"<t 3 63 1>");

        let bytes = adapter
            .encode(&ThrottleCommand::SetDirection {
                binding: binding(1234),
                target: LocoState {
                    direction: Direction::Reverse,
                    ..Default::default()
                },
            })
            .unwrap();
        assert_eq!(bytes, b"<t 1234 0 0>");
    }

    #[test]
    fn test_encode_estop_function_release_query() {
        let adapter = DccExAdapter::new();
        let target = LocoState {
            functions: FunctionSet::default().with(5, true),
            ..Default::default()
        };
        assert_eq!(
            adapter
                .encode(&ThrottleCommand::EmergencyStop {
                    binding: binding(3),
                    target
                })
                .unwrap(),
            b"<t 3 -1 1>"
        );
        assert_eq!(
            adapter
                .encode(&ThrottleCommand::SetFunction {
                    binding: binding(3),
                    index: 5,
                    target
                })
                .unwrap(),
            b"<F 3 5 1>"
        );
        assert_eq!(
            adapter
                .encode(&ThrottleCommand::Release {
                    binding: binding(3)
                })
                .unwrap(),
            b"<- 3>"
        );
        assert_eq!(
            adapter
                .encode(&ThrottleCommand::Acquire {
                    address: Address::short(3)
                })
                .unwrap(),
            b"<t 3>"
        );
    }

    #[test]
    fn test_encode_rejects_out_of_range() {
        let adapter = DccExAdapter::new();
        let err = adapter
            .encode(&ThrottleCommand::SetFunction {
                binding: binding(3),
                index: 69,
                target: LocoState::default(),
            })
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Unsupported { .. }));

        let err = adapter
            .encode(&ThrottleCommand::Acquire {
                address: Address::long(10_500),
            })
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Unsupported { .. }));
    }

    #[test]
    fn test_decode_loco_broadcast() {
        let adapter = DccExAdapter::new();
        // speed byte 0x80 | 64 = forward, step 63; F0 and F2 on
        let event = decode_event(&adapter, b"<l 3 0 192 5>");
        match event {
            VendorEvent::LocoUpdate { loco, update } => {
                assert_eq!(loco, LocoRef::Address(Address::short(3)));
                assert_eq!(update.speed_step, Some(63));
                assert_eq!(update.direction, Some(Direction::Forward));
                assert_eq!(update.function(0), Some(true));
                assert_eq!(update.function(1), Some(false));
                assert_eq!(update.function(2), Some(true));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_fault_classes() {
        let adapter = DccExAdapter::new();
        assert_eq!(
            decode_event(&adapter, b"<p0>"),
            VendorEvent::Fault(FaultKind::PowerOff)
        );
        assert_eq!(
            decode_event(&adapter, b"<* MAIN OVERLOAD detected *>"),
            VendorEvent::Fault(FaultKind::Overload)
        );
        assert!(matches!(
            decode_event(&adapter, b"<X>"),
            VendorEvent::Fault(FaultKind::Rejected(_))
        ));
        assert!(matches!(
            decode_event(&adapter, b"<l 3 0 zz 0>"),
            VendorEvent::Fault(FaultKind::Malformed(_))
        ));
        assert_eq!(adapter.decode(b"<p1 MAIN>"), Decoded::Unrecognized);
        assert_eq!(adapter.decode(b"<iDCC-EX V-5.0>"), Decoded::Unrecognized);
    }

    #[test]
    fn test_speed_byte_round_trip_edges() {
        assert_eq!(speed_byte(0, Direction::Forward, false), 0x80);
        assert_eq!(speed_byte(0, Direction::Reverse, true), 0x01);
        assert_eq!(speed_byte(126, Direction::Forward, false), 0xFF);
        assert_eq!(split_speed_byte(0x81), (0, Direction::Forward, true));
        assert_eq!(split_speed_byte(0x02), (1, Direction::Reverse, false));
    }

    #[test]
    fn test_speed_matcher_requires_matching_broadcast() {
        let adapter = DccExAdapter::new();
        let cmd = ThrottleCommand::SetSpeed {
            binding: binding(3),
            target: LocoState {
                speed_step: 63,
                ..Default::default()
            },
        };
        let matcher = adapter.response_matcher(&cmd).unwrap();

        let other_loco = decode_event(&adapter, b"<l 4 0 192 0>");
        assert_eq!(matcher.check(&other_loco), MatchOutcome::NoMatch);

        let stale = decode_event(&adapter, b"<l 3 0 128 0>");
        assert_eq!(matcher.check(&stale), MatchOutcome::NoMatch);

        let confirm = decode_event(&adapter, b"<l 3 0 192 0>");
        assert_eq!(matcher.check(&confirm), MatchOutcome::Complete);

        let fail = decode_event(&adapter, b"<X>");
        assert!(matches!(matcher.check(&fail), MatchOutcome::Reject(_)));
    }

    #[test]
    fn test_release_is_unacknowledged() {
        let adapter = DccExAdapter::new();
        assert!(adapter
            .response_matcher(&ThrottleCommand::Release {
                binding: binding(3)
            })
            .is_none());
    }

    proptest! {
        #[test]
        fn parse_never_panics(body in "\\PC{0,40}") {
            let _ = DccExFrame::parse(&body);
        }

        #[test]
        fn broadcast_of_the_target_confirms_a_throttle_frame(
            cab in 1u16..=10239,
            step in 0u8..=SPEED_STEPS,
            other in 0u8..=SPEED_STEPS,
            forward in any::<bool>(),
        ) {
            let adapter = DccExAdapter::new();
            let direction = if forward { Direction::Forward } else { Direction::Reverse };
            let cmd = ThrottleCommand::SetSpeed {
                binding: binding(cab),
                target: LocoState { speed_step: step, direction, ..Default::default() },
            };

            let sent = adapter.encode(&cmd).unwrap();
            let body = String::from_utf8(sent).unwrap();
            let parsed = DccExFrame::parse(body.trim_start_matches('<').trim_end_matches('>')).unwrap();
            prop_assert_eq!(parsed, DccExFrame::Throttle { cab, speed: i16::from(step), forward });

            let matcher = adapter.response_matcher(&cmd).unwrap();
            let reply = DccExFrame::LocoState {
                cab,
                speed_byte: speed_byte(step, direction, false),
                functions: 0,
            };
            let event = decode_event(&adapter, &reply.encode());
            prop_assert_eq!(matcher.check(&event), MatchOutcome::Complete);

            let stale = DccExFrame::LocoState {
                cab,
                speed_byte: speed_byte(other, direction, false),
                functions: 0,
            };
            let expected = if other == step { MatchOutcome::Complete } else { MatchOutcome::NoMatch };
            prop_assert_eq!(matcher.check(&decode_event(&adapter, &stale.encode())), expected);
        }
    }
}
