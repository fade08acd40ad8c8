use thiserror::Error;

/// Everything that can go wrong in this crate, from a bad [`crate::engine::ConnectionParams`]
/// all the way up through a failed file transfer.
#[derive(Error, Debug)]
pub enum LinkError {
    /// The serial port collaborator returned an I/O error. Surfaced immediately, never retried.
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `open` exhausted its retransmission budget without seeing a UA.
    #[error("open: no UA after {attempts} attempts")]
    OpenTimedOut {
        /// Number of SET frames that were sent.
        attempts: u32,
    },

    /// `write` exhausted its retransmission budget without seeing an RR for the current frame.
    #[error("write: no RR after {attempts} attempts")]
    WriteTimedOut {
        /// Number of I-frames that were sent.
        attempts: u32,
    },

    /// `close` exhausted its retransmission budget without completing the DISC/UA exchange.
    #[error("close: disconnect handshake did not complete after {attempts} attempts")]
    CloseTimedOut {
        /// Number of DISC frames that were sent.
        attempts: u32,
    },

    /// Connection parameters were invalid (bad role string, zero timeout, zero retransmissions).
    #[error("invalid connection parameters: {0}")]
    InvalidParams(String),

    /// A payload was too large to fit in the receive buffer or exceeded `u16::MAX`.
    #[error("payload of {len} bytes exceeds the maximum of {max}")]
    PayloadTooLarge {
        /// The length the caller asked to send.
        len: usize,
        /// The maximum this link layer will carry in one frame.
        max: usize,
    },

    /// `write`/`read` was called before `open` completed, or after `close`.
    #[error("link is not open")]
    NotOpen,

    /// `write` was called on a receiver-role link, or `read` on a transmitter-role one.
    #[error("protocol misuse: {0}")]
    Protocol(String),

    /// The application-layer TLV framing was malformed (truncated packet, unknown type,
    /// missing required field).
    #[error("malformed application packet: {0}")]
    Framing(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LinkError>;
