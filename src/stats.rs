//! Process-wide-in-spirit counters. Owned by the [`crate::engine::LinkLayer`] rather than
//! a file-scope global, but otherwise matching the distilled spec's event list exactly.

use std::fmt;

/// Counters incremented by the codec and the protocol engine. Never consulted by either
/// to make a correctness decision — see §4.4.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub set_sent: u32,
    pub set_received: u32,
    pub ua_sent: u32,
    pub ua_received: u32,
    pub rr_sent: u32,
    pub rr_received: u32,
    pub rej_sent: u32,
    pub rej_received: u32,
    pub i_sent: u32,
    pub i_received: u32,
    pub disc_sent: u32,
    pub disc_received: u32,
    pub invalid_bcc1: u32,
    pub invalid_bcc2: u32,
    pub duplicated: u32,
    pub retransmissions: u32,
    pub timeouts: u32,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "link layer statistics:")?;
        writeln!(f, "  SET  sent/received: {}/{}", self.set_sent, self.set_received)?;
        writeln!(f, "  UA   sent/received: {}/{}", self.ua_sent, self.ua_received)?;
        writeln!(f, "  RR   sent/received: {}/{}", self.rr_sent, self.rr_received)?;
        writeln!(f, "  REJ  sent/received: {}/{}", self.rej_sent, self.rej_received)?;
        writeln!(f, "  I    sent/received: {}/{}", self.i_sent, self.i_received)?;
        writeln!(f, "  DISC sent/received: {}/{}", self.disc_sent, self.disc_received)?;
        writeln!(f, "  invalid BCC1: {}", self.invalid_bcc1)?;
        writeln!(f, "  invalid BCC2: {}", self.invalid_bcc2)?;
        writeln!(f, "  duplicated frames: {}", self.duplicated)?;
        writeln!(f, "  retransmissions: {}", self.retransmissions)?;
        write!(f, "  timeouts: {}", self.timeouts)
    }
}
