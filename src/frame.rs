//! Byte-level frame encoding and the receive-side recognizer.
//!
//! This module has no notion of retransmission or sessions; it only knows how
//! to turn a payload into bytes on the wire and how to turn bytes back into a
//! validated frame, one at a time. [`crate::engine`] drives it.

use crate::stats::Stats;

/// Frame delimiter.
pub const FLAG: u8 = 0x7E;
/// Escape byte introduced by stuffing.
pub const ESC: u8 = 0x7D;
/// Stuffed encoding of [`FLAG`].
const ESC_FLAG: u8 = 0x5E;
/// Stuffed encoding of [`ESC`].
const ESC_ESC: u8 = 0x5D;

/// Address used whenever the transmitter originates a new exchange: SET, every
/// I-frame, and the transmitter's own DISC at close.
pub const ADDR_COMMAND: u8 = 0x03;
/// Address used by every frame the receiver sends (UA, RR, REJ, its own DISC)
/// and, in the one case the wire format calls out explicitly, the final UA the
/// transmitter sends back to acknowledge the receiver's DISC.
pub const ADDR_REPLY: u8 = 0x01;

/// Control byte: connection request.
pub const SET: u8 = 0x03;
/// Control byte: unnumbered acknowledgment (answers SET or the final DISC).
pub const UA: u8 = 0x07;
/// Control byte: disconnect request.
pub const DISC: u8 = 0x0B;
const C_I0: u8 = 0x00;
const C_I1: u8 = 0x80;
const C_RR0: u8 = 0xAA;
const C_RR1: u8 = 0xAB;
const C_REJ0: u8 = 0x54;
const C_REJ1: u8 = 0x55;

/// The control byte of an information frame for a given alternating-bit sequence number.
pub fn i_control(seq: u8) -> u8 {
    if seq == 0 {
        C_I0
    } else {
        C_I1
    }
}

/// The control byte of the RR that acknowledges the given sequence number as "next expected".
pub fn rr_control(next_expected: u8) -> u8 {
    if next_expected == 0 {
        C_RR0
    } else {
        C_RR1
    }
}

/// The control byte of the REJ for the given sequence number.
pub fn rej_control(seq: u8) -> u8 {
    if seq == 0 {
        C_REJ0
    } else {
        C_REJ1
    }
}

/// Encodes a five-byte supervisory frame: FLAG, A, C, A^C, FLAG. No stuffing is needed
/// because none of the defined address/control combinations collide with FLAG or ESC.
pub fn encode_supervisory(address: u8, control: u8) -> [u8; 5] {
    [FLAG, address, control, address ^ control, FLAG]
}

fn stuff_into(out: &mut Vec<u8>, byte: u8) {
    match byte {
        FLAG => {
            out.push(ESC);
            out.push(ESC_FLAG);
        }
        ESC => {
            out.push(ESC);
            out.push(ESC_ESC);
        }
        other => out.push(other),
    }
}

/// Encodes an information frame carrying `payload` for alternating-bit sequence `seq`.
pub fn encode_i_frame(seq: u8, payload: &[u8]) -> Vec<u8> {
    let control = i_control(seq);
    let bcc1 = ADDR_COMMAND ^ control;
    let mut bcc2 = 0u8;
    for &b in payload {
        bcc2 ^= b;
    }

    let mut out = Vec::with_capacity(payload.len() * 2 + 8);
    out.push(FLAG);
    out.push(ADDR_COMMAND);
    out.push(control);
    out.push(bcc1);
    for &b in payload {
        stuff_into(&mut out, b);
    }
    stuff_into(&mut out, bcc2);
    out.push(FLAG);
    out
}

/// Encodes the connection-request frame a transmitter sends to open a session.
pub fn encode_set() -> [u8; 5] {
    encode_supervisory(ADDR_COMMAND, SET)
}

/// Encodes the acknowledgment a receiver sends back in answer to SET.
pub fn encode_ua_after_set() -> [u8; 5] {
    encode_supervisory(ADDR_REPLY, UA)
}

/// Encodes the receiver-ready frame acknowledging everything up to, but not
/// including, `next_expected`.
pub fn encode_rr(next_expected: u8) -> [u8; 5] {
    encode_supervisory(ADDR_REPLY, rr_control(next_expected))
}

/// Encodes the reject frame asking for a retransmission of `seq`.
pub fn encode_rej(seq: u8) -> [u8; 5] {
    encode_supervisory(ADDR_REPLY, rej_control(seq))
}

/// Encodes the disconnect request the transmitter sends first at close.
pub fn encode_disc_from_transmitter() -> [u8; 5] {
    encode_supervisory(ADDR_COMMAND, DISC)
}

/// Encodes the disconnect request the receiver sends back in answer.
pub fn encode_disc_from_receiver() -> [u8; 5] {
    encode_supervisory(ADDR_REPLY, DISC)
}

/// Encodes the final UA the transmitter sends to close out the disconnect handshake.
pub fn encode_ua_after_disc() -> [u8; 5] {
    encode_supervisory(ADDR_REPLY, UA)
}

/// Which family of frame a [`ReceiveMachine`] is currently looking for. Each variant
/// carries its own table of acceptable control-byte alternatives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineKind {
    /// Looking for SET (receiver at open) or UA (transmitter at open and at close).
    Connection,
    /// Looking for an I-frame (receiver during transfer).
    Read,
    /// Looking for RR/REJ (transmitter during transfer).
    Write,
    /// Looking for DISC (either side at close).
    Disconnection,
}

/// The six states of the receive automaton.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    FlagRcv,
    ARcv,
    CRcv,
    Bcc1Ok,
    Stp,
}

/// How a completed reception should be interpreted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The expected frame was recognized cleanly.
    Accepted,
    /// BCC2 failed, or an invalid escape sequence was seen in the payload.
    Rejected,
    /// A SET was seen while reading, meaning our UA for a prior open was lost.
    SawSet,
    /// An I-frame with the unexpected sequence number was seen: the peer's retransmission.
    Duplicate,
}

/// A one-shot receive state machine. The engine builds a fresh one for every frame
/// it waits for, rather than resetting and reusing a single long-lived instance.
pub struct ReceiveMachine {
    kind: MachineKind,
    expected_address: u8,
    expected_control: u8,
    state: State,
    buf: Vec<u8>,
    buf_capacity: usize,
    bcc1: u8,
    bcc2: u8,
    escape_pending: bool,
    rej: bool,
    ack: bool,
    duplicate: bool,
}

impl ReceiveMachine {
    /// Builds a machine of the given `kind`, waiting for a frame with `expected_address`
    /// and nominal `expected_control`. `max_payload` bounds the payload buffer for `Read`
    /// machines; it is ignored for the other kinds.
    pub fn new(kind: MachineKind, expected_address: u8, expected_control: u8, max_payload: usize) -> Self {
        let buf_capacity = max_payload.max(1) * 2 + 2;
        ReceiveMachine {
            kind,
            expected_address,
            expected_control,
            state: State::Start,
            buf: Vec::with_capacity(buf_capacity),
            buf_capacity,
            bcc1: 0,
            bcc2: 0,
            escape_pending: false,
            rej: false,
            ack: false,
            duplicate: false,
        }
    }

    /// True once the machine has reached a terminal state for this frame.
    pub fn is_terminal(&self) -> bool {
        self.state == State::Stp
    }

    /// The destuffed payload of an accepted I-frame. Only meaningful once terminal.
    pub fn payload(&self) -> &[u8] {
        &self.buf
    }

    fn is_payload_bearing(&self) -> bool {
        self.kind == MachineKind::Read && !self.ack
    }

    /// Classifies a terminal machine's outcome for the engine. Panics if called before
    /// [`Self::is_terminal`] is true; that would be a programmer error in the engine.
    pub fn outcome(&self) -> Outcome {
        assert!(self.is_terminal(), "outcome() called before frame was terminal");
        if self.rej {
            Outcome::Rejected
        } else if self.ack {
            Outcome::SawSet
        } else if self.duplicate {
            Outcome::Duplicate
        } else {
            Outcome::Accepted
        }
    }

    /// Feeds one byte into the recognizer, updating `stats` for any counters tied to
    /// this byte (invalid BCC1/BCC2). Call repeatedly until [`Self::is_terminal`].
    pub fn feed(&mut self, byte: u8, stats: &mut Stats) {
        if self.is_terminal() {
            return;
        }
        match self.state {
            State::Start => self.on_start(byte),
            State::FlagRcv => self.on_flag_rcv(byte),
            State::ARcv => self.on_a_rcv(byte),
            State::CRcv => self.on_c_rcv(byte, stats),
            State::Bcc1Ok => self.on_bcc1_ok(byte, stats),
            State::Stp => {}
        }
    }

    fn enter_flag_rcv(&mut self) {
        self.rej = false;
        self.ack = false;
        self.duplicate = false;
        self.bcc2 = 0;
        self.state = State::FlagRcv;
    }

    fn on_start(&mut self, byte: u8) {
        if byte == FLAG {
            self.enter_flag_rcv();
        }
    }

    fn on_flag_rcv(&mut self, byte: u8) {
        if byte == self.expected_address {
            self.bcc1 = byte;
            self.state = State::ARcv;
        } else if byte == FLAG {
            // stay in FLAG_RCV
        } else {
            self.state = State::Start;
        }
    }

    fn on_a_rcv(&mut self, byte: u8) {
        let accept_as_nominal = byte == self.expected_control;
        let accept_as_rej = self.kind == MachineKind::Write
            && ((self.expected_control == C_RR0 && byte == C_REJ1)
                || (self.expected_control == C_RR1 && byte == C_REJ0));
        let accept_as_set = self.kind == MachineKind::Read && byte == SET;
        let accept_as_duplicate = self.kind == MachineKind::Read
            && ((self.expected_control == C_I0 && byte == C_I1)
                || (self.expected_control == C_I1 && byte == C_I0));

        if accept_as_nominal || accept_as_rej || accept_as_set || accept_as_duplicate {
            self.bcc1 ^= byte;
            if accept_as_rej {
                self.rej = true;
            }
            if accept_as_set {
                self.ack = true;
            }
            if accept_as_duplicate {
                self.duplicate = true;
            }
            self.state = State::CRcv;
        } else if byte == FLAG {
            self.enter_flag_rcv();
        } else {
            self.state = State::Start;
        }
    }

    fn on_c_rcv(&mut self, byte: u8, stats: &mut Stats) {
        if byte == self.bcc1 {
            self.buf.clear();
            self.bcc2 = 0;
            self.state = State::Bcc1Ok;
        } else if byte == FLAG {
            self.enter_flag_rcv();
        } else {
            stats.invalid_bcc1 += 1;
            self.state = State::Start;
        }
    }

    fn on_bcc1_ok(&mut self, byte: u8, stats: &mut Stats) {
        if self.is_payload_bearing() {
            self.on_payload_byte(byte, stats);
        } else if byte == FLAG {
            self.state = State::Stp;
        } else {
            self.state = State::Start;
        }
    }

    fn on_payload_byte(&mut self, byte: u8, stats: &mut Stats) {
        if self.escape_pending {
            self.escape_pending = false;
            match byte {
                ESC_FLAG => self.push_payload_byte(FLAG),
                ESC_ESC => self.push_payload_byte(ESC),
                _ => self.rej = true,
            }
            return;
        }

        if byte == ESC {
            self.escape_pending = true;
            return;
        }

        if byte == FLAG {
            self.finish_payload(stats);
            return;
        }

        self.push_payload_byte(byte);
    }

    fn push_payload_byte(&mut self, byte: u8) {
        if self.buf.len() >= self.buf_capacity {
            self.state = State::Start;
            return;
        }
        self.buf.push(byte);
        self.bcc2 ^= byte;
    }

    fn finish_payload(&mut self, stats: &mut Stats) {
        let Some(candidate) = self.buf.pop() else {
            // No bytes at all before the closing FLAG: nothing to validate against.
            self.state = State::Start;
            return;
        };
        let expected_bcc2 = self.bcc2 ^ candidate;
        if candidate == expected_bcc2 {
            self.bcc2 = expected_bcc2;
            self.state = State::Stp;
        } else {
            stats.invalid_bcc2 += 1;
            self.rej = true;
            self.state = State::Stp;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(machine: &mut ReceiveMachine, bytes: &[u8], stats: &mut Stats) {
        for &b in bytes {
            machine.feed(b, stats);
            if machine.is_terminal() {
                break;
            }
        }
    }

    #[test]
    fn round_trips_unstuffed_payload() {
        let payload = [1u8, 2, 3, 4];
        let wire = encode_i_frame(0, &payload);
        let mut stats = Stats::default();
        let mut m = ReceiveMachine::new(MachineKind::Read, ADDR_COMMAND, i_control(0), 255);
        drain(&mut m, &wire, &mut stats);
        assert!(m.is_terminal());
        assert_eq!(m.outcome(), Outcome::Accepted);
        assert_eq!(m.payload(), &payload);
    }

    #[test]
    fn round_trips_stuffed_payload() {
        // Payload deliberately contains both bytes that require stuffing.
        let payload = [0x7E, 0x7D, 0x41];
        let wire = encode_i_frame(0, &payload);
        assert_eq!(wire, vec![0x7E, 0x03, 0x00, 0x03, 0x7D, 0x5E, 0x7D, 0x5D, 0x41, 0x42, 0x7E]);
        let mut stats = Stats::default();
        let mut m = ReceiveMachine::new(MachineKind::Read, ADDR_COMMAND, i_control(0), 255);
        drain(&mut m, &wire, &mut stats);
        assert!(m.is_terminal());
        assert_eq!(m.outcome(), Outcome::Accepted);
        assert_eq!(m.payload(), &payload);
    }

    #[test]
    fn detects_single_bit_corruption_in_payload() {
        let payload = [1u8, 2, 3, 4];
        let mut wire = encode_i_frame(0, &payload);
        // Flip a bit in the (unstuffed, single-byte) payload region.
        let idx = 4;
        wire[idx] ^= 0x01;
        let mut stats = Stats::default();
        let mut m = ReceiveMachine::new(MachineKind::Read, ADDR_COMMAND, i_control(0), 255);
        drain(&mut m, &wire, &mut stats);
        assert!(m.is_terminal());
        assert_eq!(m.outcome(), Outcome::Rejected);
        assert_eq!(stats.invalid_bcc2, 1);
    }

    #[test]
    fn detects_header_corruption_before_bcc1_ok() {
        let payload = [1u8, 2, 3];
        let mut wire = encode_i_frame(0, &payload);
        wire[3] ^= 0xFF; // corrupt BCC1
        let mut stats = Stats::default();
        let mut m = ReceiveMachine::new(MachineKind::Read, ADDR_COMMAND, i_control(0), 255);
        drain(&mut m, &wire, &mut stats);
        assert!(!m.is_terminal());
        assert_eq!(stats.invalid_bcc1, 1);
    }

    #[test]
    fn recognizes_frames_separated_by_extra_flags() {
        let a = encode_supervisory(ADDR_COMMAND, SET);
        let b = encode_supervisory(ADDR_REPLY, UA);
        let mut wire = Vec::new();
        wire.extend_from_slice(&a);
        wire.push(FLAG);
        wire.push(FLAG);
        wire.extend_from_slice(&b);

        let mut stats = Stats::default();
        let mut m1 = ReceiveMachine::new(MachineKind::Connection, ADDR_COMMAND, SET, 0);
        let mut consumed = 0;
        for (i, &byte) in wire.iter().enumerate() {
            m1.feed(byte, &mut stats);
            if m1.is_terminal() {
                consumed = i + 1;
                break;
            }
        }
        assert!(m1.is_terminal());

        let mut m2 = ReceiveMachine::new(MachineKind::Connection, ADDR_REPLY, UA, 0);
        for &byte in &wire[consumed..] {
            m2.feed(byte, &mut stats);
            if m2.is_terminal() {
                break;
            }
        }
        assert!(m2.is_terminal());
        assert_eq!(m2.outcome(), Outcome::Accepted);
    }

    #[test]
    fn write_machine_accepts_rej_alternative() {
        let rej = encode_supervisory(ADDR_REPLY, rej_control(1));
        let mut stats = Stats::default();
        let mut m = ReceiveMachine::new(MachineKind::Write, ADDR_REPLY, rr_control(0), 0);
        drain(&mut m, &rej, &mut stats);
        assert!(m.is_terminal());
        assert_eq!(m.outcome(), Outcome::Rejected);
    }

    #[test]
    fn read_machine_flags_duplicate_i_frame() {
        let wire = encode_i_frame(0, &[9, 9]);
        let mut stats = Stats::default();
        // Expecting seq 1, but the transmitter retransmitted seq 0.
        let mut m = ReceiveMachine::new(MachineKind::Read, ADDR_COMMAND, i_control(1), 255);
        drain(&mut m, &wire, &mut stats);
        assert!(m.is_terminal());
        assert_eq!(m.outcome(), Outcome::Duplicate);
    }

    #[test]
    fn read_machine_flags_set_as_ack() {
        let set = encode_supervisory(ADDR_COMMAND, SET);
        let mut stats = Stats::default();
        let mut m = ReceiveMachine::new(MachineKind::Read, ADDR_COMMAND, i_control(0), 255);
        drain(&mut m, &set, &mut stats);
        assert!(m.is_terminal());
        assert_eq!(m.outcome(), Outcome::SawSet);
    }
}
