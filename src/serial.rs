//! The serial-port collaborator named only by contract in §6.3 of the spec, made concrete.
//!
//! [`SerialPort`] mirrors the four operations the spec names: bytes go out in bulk,
//! bytes come back one at a time with a bounded poll so the engine can notice an
//! expired [`crate::deadline::Deadline`] between bytes. [`LoopbackPort`] is the in-memory
//! pair integration tests drive two [`crate::engine::LinkLayer`]s over; [`RealSerialPort`]
//! (behind the `cli` feature) wraps a real hardware serial port for the `filetransfer` binary.

use std::collections::VecDeque;
use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How the engine talks to the wire. One instance is owned by a [`crate::engine::LinkLayer`]
/// for the lifetime of a session.
pub trait SerialPort {
    /// Writes every byte in `buf`, retrying partial writes until all bytes are pushed or
    /// the underlying transport errors. Returns the number of bytes written (always
    /// `buf.len()` on success).
    fn write_bytes(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Reads a single byte if one is available within this call's internal poll window.
    /// `Ok(None)` means "no byte yet, try again" (the spec's `0` return); `Err` is a
    /// genuine I/O failure.
    fn read_byte(&mut self) -> io::Result<Option<u8>>;
}

/// Per-write fault a [`LoopbackPort`] test harness can inject, applied in order.
#[derive(Debug, Clone)]
enum Fault {
    /// Deliver the write unmodified.
    Pass,
    /// Silently discard the write, as if the frame never reached the wire.
    Drop,
    /// Flip one bit of one byte before delivering.
    Corrupt { byte_index: usize, xor_mask: u8 },
}

#[derive(Default)]
struct FaultPlan {
    queue: VecDeque<Fault>,
}

impl FaultPlan {
    fn next(&mut self) -> Fault {
        self.queue.pop_front().unwrap_or(Fault::Pass)
    }
}

/// One end of an in-memory loopback pair. Used by tests in place of real hardware; see
/// [`LoopbackPort::pair`].
pub struct LoopbackPort {
    outbound: Sender<Vec<u8>>,
    inbound: Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
    poll_interval: Duration,
    faults: Arc<Mutex<FaultPlan>>,
}

impl LoopbackPort {
    /// Builds a connected pair: bytes written to one side arrive (subject to any
    /// queued faults) as reads on the other.
    pub fn pair() -> (LoopbackPort, LoopbackPort) {
        let (tx_a, rx_a) = mpsc::channel();
        let (tx_b, rx_b) = mpsc::channel();
        let faults_a = Arc::new(Mutex::new(FaultPlan::default()));
        let faults_b = Arc::new(Mutex::new(FaultPlan::default()));
        let a = LoopbackPort {
            outbound: tx_a,
            inbound: rx_b,
            pending: VecDeque::new(),
            poll_interval: Duration::from_millis(20),
            faults: faults_a,
        };
        let b = LoopbackPort {
            outbound: tx_b,
            inbound: rx_a,
            pending: VecDeque::new(),
            poll_interval: Duration::from_millis(20),
            faults: faults_b,
        };
        (a, b)
    }

    /// Queues this side's next outbound write to be silently dropped.
    pub fn drop_next_write(&self) {
        self.faults.lock().unwrap().queue.push_back(Fault::Drop);
    }

    /// Queues this side's next outbound write to have one byte XORed before delivery.
    pub fn corrupt_next_write(&self, byte_index: usize, xor_mask: u8) {
        self.faults
            .lock()
            .unwrap()
            .queue
            .push_back(Fault::Corrupt { byte_index, xor_mask });
    }
}

impl SerialPort for LoopbackPort {
    fn write_bytes(&mut self, buf: &[u8]) -> io::Result<usize> {
        let fault = self.faults.lock().unwrap().next();
        let delivered = match fault {
            Fault::Pass => buf.to_vec(),
            Fault::Drop => return Ok(buf.len()),
            Fault::Corrupt { byte_index, xor_mask } => {
                let mut bytes = buf.to_vec();
                if let Some(b) = bytes.get_mut(byte_index) {
                    *b ^= xor_mask;
                }
                bytes
            }
        };
        self.outbound
            .send(delivered)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "loopback peer dropped"))?;
        Ok(buf.len())
    }

    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        if let Some(byte) = self.pending.pop_front() {
            return Ok(Some(byte));
        }
        match self.inbound.recv_timeout(self.poll_interval) {
            Ok(frame) => {
                self.pending.extend(frame);
                Ok(self.pending.pop_front())
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "loopback peer dropped"))
            }
        }
    }
}

/// Writes every byte of `buf` to `port`, retrying partial writes. Shared by every
/// [`SerialPort`] implementation's `write_bytes`, matching the source's `safe_write`.
pub fn write_all(port: &mut dyn SerialPort, buf: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < buf.len() {
        let n = port.write_bytes(&buf[written..])?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "serial port accepted zero bytes"));
        }
        written += n;
    }
    Ok(())
}

#[cfg(feature = "cli")]
mod real {
    use super::SerialPort;
    use std::io::{self, Read, Write};
    use std::time::Duration;

    /// A real serial port, backed by the `serialport` crate. Used by the `filetransfer`
    /// binary; not compiled into the library unless the `cli` feature is enabled.
    pub struct RealSerialPort {
        inner: Box<dyn serialport::SerialPort>,
    }

    impl RealSerialPort {
        /// Opens `device` at `baud_rate`, with a short internal read poll so
        /// [`SerialPort::read_byte`] can return `Ok(None)` promptly.
        pub fn open(device: &str, baud_rate: u32) -> io::Result<Self> {
            let inner = serialport::new(device, baud_rate)
                .timeout(Duration::from_millis(100))
                .open()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            Ok(RealSerialPort { inner })
        }
    }

    impl SerialPort for RealSerialPort {
        fn write_bytes(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.inner.write(buf)
        }

        fn read_byte(&mut self) -> io::Result<Option<u8>> {
            let mut byte = [0u8; 1];
            match self.inner.read(&mut byte) {
                Ok(0) => Ok(None),
                Ok(_) => Ok(Some(byte[0])),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
                Err(e) => Err(e),
            }
        }
    }
}

#[cfg(feature = "cli")]
pub use real::RealSerialPort;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_delivers_bytes_written_on_one_side_to_the_other() {
        let (mut a, mut b) = LoopbackPort::pair();
        write_all(&mut a, &[1, 2, 3]).unwrap();
        assert_eq!(b.read_byte().unwrap(), Some(1));
        assert_eq!(b.read_byte().unwrap(), Some(2));
        assert_eq!(b.read_byte().unwrap(), Some(3));
    }

    #[test]
    fn loopback_read_returns_none_when_idle() {
        let (_a, mut b) = LoopbackPort::pair();
        assert_eq!(b.read_byte().unwrap(), None);
    }

    #[test]
    fn drop_next_write_silently_eats_a_frame() {
        let (mut a, mut b) = LoopbackPort::pair();
        a.drop_next_write();
        write_all(&mut a, &[0x7E, 0x03, 0x00, 0x03, 0x7E]).unwrap();
        assert_eq!(b.read_byte().unwrap(), None);
    }

    #[test]
    fn corrupt_next_write_flips_one_byte() {
        let (mut a, mut b) = LoopbackPort::pair();
        a.corrupt_next_write(1, 0xFF);
        write_all(&mut a, &[0x7E, 0x03, 0x00, 0x03, 0x7E]).unwrap();
        assert_eq!(b.read_byte().unwrap(), Some(0x7E));
        assert_eq!(b.read_byte().unwrap(), Some(0x03 ^ 0xFF));
    }
}
