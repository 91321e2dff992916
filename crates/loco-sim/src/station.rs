//! Virtual command station
//!
//! Answers throttle frames the way the hardware does and queues the
//! protocol-encoded replies for whoever drives it.

use std::collections::{BTreeMap, VecDeque};

use loco_protocol::dccex::{self, DccExFrame};
use loco_protocol::loconet::{self, checksum_ok};
use loco_protocol::{
    create_adapter, Address, Direction, FrameBuffer, LocoState, Protocol,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SimError;

/// Highest LocoNet slot handed out for locomotives
const MAX_SLOT: u8 = 119;

/// Configuration for creating a virtual command station
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    /// Display name
    pub id: String,
    /// Protocol spoken on the link
    pub protocol: Protocol,
    /// Swallow every frame without answering
    pub silent: bool,
    /// Refuse every acquisition (LocoNet LACK, DCC-EX `<X>`)
    pub reject_acquisitions: bool,
    /// Addresses already owned by throttles elsewhere on the layout
    pub slots_in_use: Vec<u16>,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            id: "Virtual Command Station".to_string(),
            protocol: Protocol::DccEx,
            silent: false,
            reject_acquisitions: false,
            slots_in_use: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SimLoco {
    address: Address,
    slot: u8,
    in_use: bool,
    state: LocoState,
}

/// A simulated command station
pub struct VirtualCommandStation {
    config: StationConfig,
    codec: Box<dyn FrameBuffer>,
    /// Keyed by address number
    locos: BTreeMap<u16, SimLoco>,
    pending_output: VecDeque<Vec<u8>>,
    received: Vec<Vec<u8>>,
}

impl std::fmt::Debug for VirtualCommandStation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualCommandStation")
            .field("config", &self.config)
            .field("locos", &self.locos.len())
            .field("pending_output", &self.pending_output.len())
            .finish()
    }
}

impl VirtualCommandStation {
    /// Create a station with default behaviour
    pub fn new(id: impl Into<String>, protocol: Protocol) -> Self {
        Self::from_config(StationConfig {
            id: id.into(),
            protocol,
            ..Default::default()
        })
    }

    pub fn from_config(config: StationConfig) -> Self {
        Self {
            codec: create_adapter(config.protocol).frame_buffer(),
            config,
            locos: BTreeMap::new(),
            pending_output: VecDeque::new(),
            received: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn protocol(&self) -> Protocol {
        self.config.protocol
    }

    pub fn set_silent(&mut self, silent: bool) {
        self.config.silent = silent;
    }

    pub fn set_reject_acquisitions(&mut self, reject: bool) {
        self.config.reject_acquisitions = reject;
    }

    /// Mark an address as owned by some other throttle on the layout
    pub fn set_slot_in_use(&mut self, number: u16, in_use: bool) {
        self.config.slots_in_use.retain(|n| *n != number);
        if in_use {
            self.config.slots_in_use.push(number);
        }
    }

    /// Current state of a locomotive the station knows about
    pub fn loco_state(&self, number: u16) -> Option<LocoState> {
        self.locos.get(&number).map(|l| l.state)
    }

    /// Frames received so far, in order
    pub fn received_frames(&self) -> &[Vec<u8>] {
        &self.received
    }

    pub fn frame_count(&self) -> usize {
        self.received.len()
    }

    /// Take the next pending output frame
    pub fn take_output(&mut self) -> Option<Vec<u8>> {
        self.pending_output.pop_front()
    }

    pub fn has_output(&self) -> bool {
        !self.pending_output.is_empty()
    }

    /// Feed raw bytes from the connection; replies are queued as output
    pub fn process_bytes(&mut self, data: &[u8]) {
        self.codec.push_bytes(data);
        while let Some(frame) = self.codec.next_frame() {
            debug!("Station {} received {:02X?}", self.config.id, frame);
            self.received.push(frame.clone());
            if self.config.silent {
                continue;
            }
            match self.config.protocol {
                Protocol::DccEx => self.handle_dccex(&frame),
                Protocol::LocoNet => self.handle_loconet(&frame),
            }
        }
    }

    /// Another throttle on the layout drives a known locomotive
    pub fn operate(&mut self, number: u16, state: LocoState) -> Result<(), SimError> {
        let loco = self
            .locos
            .get_mut(&number)
            .ok_or(SimError::UnknownLoco(number))?;
        loco.state = state;
        let loco = *loco;
        match self.config.protocol {
            Protocol::DccEx => self.broadcast_dccex(number, &loco.state, false),
            Protocol::LocoNet => {
                let slot = loco.slot;
                self.queue(loconet::with_checksum(vec![
                    loconet::OPC_LOCO_SPD,
                    slot,
                    loconet::spd_byte(state.speed_step, false),
                ]));
                self.queue(loconet::with_checksum(vec![
                    loconet::OPC_LOCO_DIRF,
                    slot,
                    loconet::dirf_byte(state.direction, state.functions),
                ]));
                self.queue(loconet::with_checksum(vec![
                    loconet::OPC_LOCO_SND,
                    slot,
                    loconet::snd_byte(state.functions),
                ]));
            }
        }
        Ok(())
    }

    /// Report track power off
    pub fn power_off(&mut self) {
        let frame = match self.config.protocol {
            Protocol::DccEx => DccExFrame::Power { on: false }.encode(),
            Protocol::LocoNet => loconet::with_checksum(vec![loconet::OPC_GPOFF]),
        };
        self.queue(frame);
    }

    fn queue(&mut self, frame: Vec<u8>) {
        debug!("Station {} sending {:02X?}", self.config.id, frame);
        self.pending_output.push_back(frame);
    }

    fn loco_mut(&mut self, number: u16) -> &mut SimLoco {
        self.locos.entry(number).or_insert_with(|| SimLoco {
            address: Address::infer(number),
            slot: 0,
            in_use: false,
            state: LocoState::default(),
        })
    }

    fn handle_dccex(&mut self, frame: &[u8]) {
        let text = String::from_utf8_lossy(frame);
        let Some(body) = text
            .trim()
            .strip_prefix('<')
            .and_then(|s| s.strip_suffix('>'))
        else {
            return;
        };
        let Ok(parsed) = DccExFrame::parse(body) else {
            self.queue(DccExFrame::Fail.encode());
            return;
        };
        match parsed {
            DccExFrame::Throttle {
                cab,
                speed,
                forward,
            } => {
                let emergency = speed < 0;
                let loco = self.loco_mut(cab);
                loco.state.speed_step = speed.clamp(0, i16::from(dccex::SPEED_STEPS)) as u8;
                loco.state.direction = if forward {
                    Direction::Forward
                } else {
                    Direction::Reverse
                };
                let state = loco.state;
                self.broadcast_dccex(cab, &state, emergency);
            }
            DccExFrame::QueryLoco { cab } => {
                if self.config.reject_acquisitions || self.config.slots_in_use.contains(&cab) {
                    self.queue(DccExFrame::Fail.encode());
                    return;
                }
                let state = self.loco_mut(cab).state;
                self.broadcast_dccex(cab, &state, false);
            }
            DccExFrame::Function { cab, index, on } => {
                if index > dccex::MAX_FUNCTION {
                    self.queue(DccExFrame::Fail.encode());
                    return;
                }
                let loco = self.loco_mut(cab);
                loco.state.functions.set(index, on);
                let state = loco.state;
                self.broadcast_dccex(cab, &state, false);
            }
            DccExFrame::Forget { cab } => {
                // never acknowledged
                self.locos.remove(&cab);
            }
            _ => {}
        }
    }

    fn broadcast_dccex(&mut self, cab: u16, state: &LocoState, emergency: bool) {
        let frame = DccExFrame::LocoState {
            cab,
            speed_byte: dccex::speed_byte(state.speed_step, state.direction, emergency),
            functions: state.functions.0,
        };
        self.queue(frame.encode());
    }

    fn handle_loconet(&mut self, frame: &[u8]) {
        if frame.len() < 2 || !checksum_ok(frame) {
            debug!("Station {} dropping damaged message", self.config.id);
            return;
        }
        match frame[0] {
            loconet::OPC_LOCO_ADR if frame.len() == 4 => {
                let (hi, lo) = (u16::from(frame[1]), u16::from(frame[2]));
                let address = if hi == 0 {
                    Address::short(lo)
                } else {
                    Address::long((hi << 7) | lo)
                };
                self.request_slot(address);
            }
            loconet::OPC_LOCO_SPD if frame.len() == 4 => {
                let (step, _) = loconet::split_spd_byte(frame[2]);
                if let Some(loco) = self.loco_in_slot(frame[1]) {
                    loco.state.speed_step = step;
                }
                self.queue(frame.to_vec());
            }
            loconet::OPC_LOCO_DIRF if frame.len() == 4 => {
                let dirf = frame[2];
                if let Some(loco) = self.loco_in_slot(frame[1]) {
                    loco.state.direction = if dirf & 0x20 != 0 {
                        Direction::Reverse
                    } else {
                        Direction::Forward
                    };
                    loco.state.functions.set(0, dirf & 0x10 != 0);
                    for f in 1..=4u8 {
                        loco.state.functions.set(f, dirf & (1 << (f - 1)) != 0);
                    }
                }
                self.queue(frame.to_vec());
            }
            loconet::OPC_LOCO_SND if frame.len() == 4 => {
                let snd = frame[2];
                if let Some(loco) = self.loco_in_slot(frame[1]) {
                    for f in 5..=8u8 {
                        loco.state.functions.set(f, snd & (1 << (f - 5)) != 0);
                    }
                }
                self.queue(frame.to_vec());
            }
            loconet::OPC_SLOT_STAT1 if frame.len() == 4 => {
                if let Some(loco) = self.loco_in_slot(frame[1]) {
                    loco.in_use = false;
                }
                self.queue(frame.to_vec());
            }
            _ => {}
        }
    }

    fn loco_in_slot(&mut self, slot: u8) -> Option<&mut SimLoco> {
        self.locos.values_mut().find(|l| l.slot == slot)
    }

    /// Answer `OPC_LOCO_ADR` with the slot for `address`
    fn request_slot(&mut self, address: Address) {
        if self.config.reject_acquisitions {
            self.queue(loconet::with_checksum(vec![
                loconet::OPC_LONG_ACK,
                loconet::OPC_LOCO_ADR & 0x7F,
                0x00,
            ]));
            return;
        }
        let number = address.number();
        let next_slot = (1..=MAX_SLOT).find(|s| !self.locos.values().any(|l| l.slot == *s));
        let in_use_elsewhere = self.config.slots_in_use.contains(&number);

        if !self.locos.contains_key(&number) {
            let Some(slot) = next_slot else {
                self.queue(loconet::with_checksum(vec![
                    loconet::OPC_LONG_ACK,
                    loconet::OPC_LOCO_ADR & 0x7F,
                    0x00,
                ]));
                return;
            };
            self.locos.insert(
                number,
                SimLoco {
                    address,
                    slot,
                    in_use: false,
                    state: LocoState::default(),
                },
            );
        }
        let Some(loco) = self.locos.get_mut(&number) else {
            return;
        };
        let reply = loconet::slot_read_data(
            loco.slot,
            loco.address,
            loco.in_use || in_use_elsewhere,
            &loco.state,
        );
        // the requesting throttle now owns the slot
        loco.in_use = true;
        self.queue(reply);
    }
}
