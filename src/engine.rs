//! The stop-and-wait ARQ session: open, write, read, close.
//!
//! This is the only module that knows about retransmission, timeouts, and
//! the alternating-bit sequence number. It drives [`crate::frame`]'s encoder
//! and [`ReceiveMachine`] over a [`SerialPort`].

use std::time::Duration;

use log::{debug, trace, warn};

use crate::deadline::Deadline;
use crate::error::{LinkError, Result};
use crate::frame::{self, MachineKind, Outcome, ReceiveMachine, ADDR_COMMAND, ADDR_REPLY};
use crate::serial::{write_all, SerialPort};
use crate::stats::Stats;

/// The largest payload a single `write` call will hand to one I-frame.
pub const MAX_PAYLOAD: usize = 1024;

/// Which end of a session this process is playing. Fixed for the session's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opens the connection, sends data, initiates close.
    Transmitter,
    /// Accepts the connection, receives data, answers close.
    Receiver,
}

impl Role {
    fn parse(s: &str) -> Result<Role> {
        match s {
            "tx" => Ok(Role::Transmitter),
            "rx" => Ok(Role::Receiver),
            other => Err(LinkError::InvalidParams(format!(
                "role must be \"tx\" or \"rx\", got {other:?}"
            ))),
        }
    }
}

/// Validated session configuration.
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub role: Role,
    pub max_retransmissions: u32,
    pub timeout: Duration,
}

impl ConnectionParams {
    /// Builds and validates a set of connection parameters. Rejects a role string that
    /// is neither `"tx"` nor `"rx"`, a zero retransmission budget, or a zero timeout.
    pub fn new(role: &str, max_retransmissions: u32, timeout_secs: u64) -> Result<Self> {
        let role = Role::parse(role)?;
        if max_retransmissions == 0 {
            return Err(LinkError::InvalidParams(
                "max_retransmissions must be at least 1".into(),
            ));
        }
        if timeout_secs == 0 {
            return Err(LinkError::InvalidParams("timeout_secs must be at least 1".into()));
        }
        Ok(ConnectionParams {
            role,
            max_retransmissions,
            timeout: Duration::from_secs(timeout_secs),
        })
    }
}

/// An owned link-layer session over one serial port. Carries the alternating-bit
/// sequence number and the running statistics that used to be file-scope globals.
pub struct LinkLayer<P: SerialPort> {
    port: P,
    params: ConnectionParams,
    frame_number: u8,
    frames_received: u32,
    is_open: bool,
    stats: Stats,
}

impl<P: SerialPort> LinkLayer<P> {
    /// Wraps `port` with the given session configuration. Nothing is sent until `open`.
    pub fn new(port: P, params: ConnectionParams) -> Self {
        LinkLayer {
            port,
            params,
            frame_number: 0,
            frames_received: 0,
            is_open: false,
            stats: Stats::default(),
        }
    }

    /// The running event counters. Meaningful at any point in the session's lifetime.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// True once `open` has completed and `close` has not yet run.
    pub fn is_open(&self) -> bool {
        self.is_open
    }

    /// The current alternating-bit sequence number. Flips once per successful
    /// `write` (transmitter) or accepted, non-duplicate `read` (receiver).
    pub fn frame_number(&self) -> u8 {
        self.frame_number
    }

    /// Performs the SET/UA handshake appropriate to this session's role.
    pub fn open(&mut self) -> Result<()> {
        match self.params.role {
            Role::Transmitter => self.open_transmitter(),
            Role::Receiver => self.open_receiver(),
        }
    }

    /// Sends one payload reliably, blocking until acknowledged or retransmissions exhausted.
    /// Only valid for a transmitter-role session.
    pub fn write(&mut self, payload: &[u8]) -> Result<usize> {
        if !self.is_open {
            return Err(LinkError::NotOpen);
        }
        if self.params.role != Role::Transmitter {
            return Err(LinkError::Protocol("write is only valid for the transmitter role".into()));
        }
        if payload.len() > MAX_PAYLOAD {
            return Err(LinkError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD,
            });
        }

        let expected_ack = frame::rr_control(1 - self.frame_number);
        let wire = frame::encode_i_frame(self.frame_number, payload);

        let mut timeout_count = 0u32;
        loop {
            write_all(&mut self.port, &wire)?;
            self.stats.i_sent += 1;
            debug!("sent I-frame seq {}", self.frame_number);

            let mut deadline = Deadline::new();
            deadline.arm(self.params.timeout);
            let mut machine = ReceiveMachine::new(MachineKind::Write, ADDR_REPLY, expected_ack, 0);

            if self.drain_with_deadline(&mut machine, &deadline)? {
                if machine.outcome() == Outcome::Rejected {
                    self.stats.rej_received += 1;
                    warn!("peer rejected seq {}, retransmitting without charging an attempt", self.frame_number);
                    continue;
                }
                self.stats.rr_received += 1;
                self.frame_number = 1 - self.frame_number;
                debug!("write acknowledged, seq is now {}", self.frame_number);
                return Ok(payload.len());
            }

            timeout_count += 1;
            self.stats.timeouts += 1;
            if timeout_count >= self.params.max_retransmissions {
                return Err(LinkError::WriteTimedOut { attempts: timeout_count });
            }
            self.stats.retransmissions += 1;
            warn!("write attempt timed out, retransmitting seq {}", self.frame_number);
        }
    }

    /// Receives one I-frame into `out`, returning its unstuffed payload length. Only
    /// valid for a receiver-role session. Handles lost-UA, duplicate and rejected
    /// frames internally; only an accepted frame returns.
    pub fn read(&mut self, out: &mut Vec<u8>) -> Result<usize> {
        if !self.is_open {
            return Err(LinkError::NotOpen);
        }
        if self.params.role != Role::Receiver {
            return Err(LinkError::Protocol("read is only valid for the receiver role".into()));
        }

        loop {
            let mut machine = ReceiveMachine::new(
                MachineKind::Read,
                ADDR_COMMAND,
                frame::i_control(self.frame_number),
                MAX_PAYLOAD,
            );
            self.drain_until_terminal(&mut machine)?;

            match machine.outcome() {
                Outcome::SawSet => {
                    self.stats.set_received += 1;
                    if self.frames_received == 0 {
                        warn!("peer retransmitted SET, our UA must have been lost; resending it");
                        write_all(&mut self.port, &frame::encode_ua_after_set())?;
                        self.stats.ua_sent += 1;
                    }
                }
                Outcome::Duplicate => {
                    self.stats.i_received += 1;
                    self.stats.duplicated += 1;
                    warn!("peer retransmitted seq {}, re-sending current RR", 1 - self.frame_number);
                    write_all(&mut self.port, &frame::encode_rr(self.frame_number))?;
                    self.stats.rr_sent += 1;
                }
                Outcome::Rejected => {
                    self.stats.i_received += 1;
                    warn!("bad frame received for seq {}, sending REJ", self.frame_number);
                    write_all(&mut self.port, &frame::encode_rej(self.frame_number))?;
                    self.stats.rej_sent += 1;
                }
                Outcome::Accepted => {
                    self.stats.i_received += 1;
                    self.frames_received += 1;
                    out.clear();
                    out.extend_from_slice(machine.payload());
                    let len = out.len();
                    self.frame_number = 1 - self.frame_number;
                    write_all(&mut self.port, &frame::encode_rr(self.frame_number))?;
                    self.stats.rr_sent += 1;
                    debug!("accepted frame, seq is now {}", self.frame_number);
                    return Ok(len);
                }
            }
        }
    }

    /// Performs the DISC/DISC/UA handshake appropriate to this session's role, then
    /// marks the session closed regardless of outcome. If `show_stats`, logs the
    /// running counters at `debug` before returning.
    pub fn close(&mut self, show_stats: bool) -> Result<()> {
        if !self.is_open {
            return Err(LinkError::NotOpen);
        }
        let result = match self.params.role {
            Role::Transmitter => self.close_transmitter(),
            Role::Receiver => self.close_receiver(),
        };
        self.is_open = false;
        if show_stats {
            for line in self.stats.to_string().lines() {
                debug!("{line}");
            }
        }
        result
    }

    fn open_transmitter(&mut self) -> Result<()> {
        let mut timeout_count = 0u32;
        loop {
            write_all(&mut self.port, &frame::encode_set())?;
            self.stats.set_sent += 1;
            debug!("sent SET");

            let mut deadline = Deadline::new();
            deadline.arm(self.params.timeout);
            let mut machine = ReceiveMachine::new(MachineKind::Connection, ADDR_REPLY, frame::UA, 0);

            if self.drain_with_deadline(&mut machine, &deadline)? {
                self.stats.ua_received += 1;
                self.is_open = true;
                self.frame_number = 0;
                self.frames_received = 0;
                debug!("open complete");
                return Ok(());
            }

            timeout_count += 1;
            self.stats.timeouts += 1;
            if timeout_count >= self.params.max_retransmissions {
                return Err(LinkError::OpenTimedOut { attempts: timeout_count });
            }
            self.stats.retransmissions += 1;
            warn!("open attempt timed out, retrying");
        }
    }

    fn open_receiver(&mut self) -> Result<()> {
        let mut machine = ReceiveMachine::new(MachineKind::Connection, ADDR_COMMAND, frame::SET, 0);
        self.drain_until_terminal(&mut machine)?;
        self.stats.set_received += 1;

        write_all(&mut self.port, &frame::encode_ua_after_set())?;
        self.stats.ua_sent += 1;
        self.is_open = true;
        self.frame_number = 0;
        self.frames_received = 0;
        debug!("open complete, SET received and UA sent");
        Ok(())
    }

    fn close_transmitter(&mut self) -> Result<()> {
        let mut timeout_count = 0u32;
        loop {
            write_all(&mut self.port, &frame::encode_disc_from_transmitter())?;
            self.stats.disc_sent += 1;

            let mut deadline = Deadline::new();
            deadline.arm(self.params.timeout);
            let mut machine = ReceiveMachine::new(MachineKind::Disconnection, ADDR_REPLY, frame::DISC, 0);

            if self.drain_with_deadline(&mut machine, &deadline)? {
                self.stats.disc_received += 1;
                write_all(&mut self.port, &frame::encode_ua_after_disc())?;
                self.stats.ua_sent += 1;
                debug!("close handshake complete");
                return Ok(());
            }

            timeout_count += 1;
            self.stats.timeouts += 1;
            if timeout_count >= self.params.max_retransmissions {
                return Err(LinkError::CloseTimedOut { attempts: timeout_count });
            }
            self.stats.retransmissions += 1;
            warn!("close (awaiting peer DISC) timed out, retrying");
        }
    }

    fn close_receiver(&mut self) -> Result<()> {
        let mut machine = ReceiveMachine::new(MachineKind::Disconnection, ADDR_COMMAND, frame::DISC, 0);
        self.drain_until_terminal(&mut machine)?;
        self.stats.disc_received += 1;

        let mut timeout_count = 0u32;
        loop {
            write_all(&mut self.port, &frame::encode_disc_from_receiver())?;
            self.stats.disc_sent += 1;

            let mut deadline = Deadline::new();
            deadline.arm(self.params.timeout);
            let mut machine = ReceiveMachine::new(MachineKind::Connection, ADDR_REPLY, frame::UA, 0);

            if self.drain_with_deadline(&mut machine, &deadline)? {
                self.stats.ua_received += 1;
                debug!("close handshake complete");
                return Ok(());
            }

            timeout_count += 1;
            self.stats.timeouts += 1;
            if timeout_count >= self.params.max_retransmissions {
                return Err(LinkError::CloseTimedOut { attempts: timeout_count });
            }
            self.stats.retransmissions += 1;
            warn!("close (awaiting peer UA) timed out, retrying");
        }
    }

    /// Reads bytes into `machine` until it reaches a terminal state. Blocks as long
    /// as the port keeps returning `Ok(None)`; used only where the protocol has no
    /// notion of giving up (receiver-side open and read).
    fn drain_until_terminal(&mut self, machine: &mut ReceiveMachine) -> Result<()> {
        loop {
            if let Some(byte) = self.port.read_byte()? {
                trace!("rx byte {byte:#04x}");
                machine.feed(byte, &mut self.stats);
                if machine.is_terminal() {
                    return Ok(());
                }
            }
        }
    }

    /// Like [`Self::drain_until_terminal`], but gives up once `deadline` expires.
    /// Returns `Ok(true)` if the machine reached a terminal state first, `Ok(false)`
    /// if the deadline won the race.
    fn drain_with_deadline(&mut self, machine: &mut ReceiveMachine, deadline: &Deadline) -> Result<bool> {
        while !deadline.expired() {
            if let Some(byte) = self.port.read_byte()? {
                trace!("rx byte {byte:#04x}");
                machine.feed(byte, &mut self.stats);
                if machine.is_terminal() {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}
