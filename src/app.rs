//! TLV-framed file transfer, built on top of the link layer rather than inside it.
//!
//! Three packet kinds go over `write`/`read`: a start packet carrying file metadata,
//! any number of data packets carrying chunked file bytes, and an end packet that
//! repeats the metadata so the receiver can sanity-check what it reassembled.

use log::{debug, warn};

use crate::engine::{LinkLayer, MAX_PAYLOAD};
use crate::error::{LinkError, Result};
use crate::serial::SerialPort;

const TYPE_START: u8 = 1;
const TYPE_DATA: u8 = 2;
const TYPE_END: u8 = 3;

const TLV_FILE_SIZE: u8 = 0;
const TLV_FILENAME: u8 = 1;

/// Bytes of file payload carried by one data packet, leaving room for the
/// data-packet header (type, sequence, two-byte length) inside one I-frame.
const DATA_CHUNK_LEN: usize = MAX_PAYLOAD - 4;

/// The file-size/filename pair carried by both the start and end packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub file_size: u32,
    pub filename: String,
}

fn encode_tlvs(meta: &FileMetadata) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(TLV_FILE_SIZE);
    out.push(4);
    out.extend_from_slice(&meta.file_size.to_le_bytes());
    let name_bytes = meta.filename.as_bytes();
    out.push(TLV_FILENAME);
    out.push(name_bytes.len() as u8);
    out.extend_from_slice(name_bytes);
    out
}

fn decode_tlvs(mut body: &[u8]) -> Result<FileMetadata> {
    let mut file_size = None;
    let mut filename = None;

    while !body.is_empty() {
        if body.len() < 2 {
            return Err(LinkError::Framing("truncated TLV header".into()));
        }
        let tlv_type = body[0];
        let len = body[1] as usize;
        if body.len() < 2 + len {
            return Err(LinkError::Framing("TLV value runs past end of packet".into()));
        }
        let value = &body[2..2 + len];
        match tlv_type {
            TLV_FILE_SIZE => {
                if len != 4 {
                    return Err(LinkError::Framing(format!(
                        "file-size TLV must be 4 bytes, got {len}"
                    )));
                }
                let mut raw = [0u8; 4];
                raw.copy_from_slice(value);
                file_size = Some(u32::from_le_bytes(raw));
            }
            TLV_FILENAME => {
                filename = Some(
                    String::from_utf8(value.to_vec())
                        .map_err(|_| LinkError::Framing("filename TLV is not valid UTF-8".into()))?,
                );
            }
            other => {
                warn!("ignoring unknown TLV type {other}");
            }
        }
        body = &body[2 + len..];
    }

    Ok(FileMetadata {
        file_size: file_size.ok_or_else(|| LinkError::Framing("missing file-size TLV".into()))?,
        filename: filename.ok_or_else(|| LinkError::Framing("missing filename TLV".into()))?,
    })
}

fn encode_data_packet(seq: u32, chunk: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(chunk.len() + 4);
    out.push(TYPE_DATA);
    out.push((seq % 100) as u8);
    let len = chunk.len() as u16;
    out.push((len >> 8) as u8);
    out.push((len & 0xFF) as u8);
    out.extend_from_slice(chunk);
    out
}

fn decode_data_packet(body: &[u8]) -> Result<(u8, &[u8])> {
    if body.len() < 3 {
        return Err(LinkError::Framing("data packet shorter than its header".into()));
    }
    let seq = body[0];
    let len = ((body[1] as usize) << 8) | body[2] as usize;
    let chunk = &body[3..];
    if chunk.len() != len {
        return Err(LinkError::Framing(format!(
            "data packet declared length {len} but carried {}",
            chunk.len()
        )));
    }
    Ok((seq, chunk))
}

/// Sends `data` as one start packet, enough data packets to cover it, and one end packet.
pub fn send_file<P: SerialPort>(link: &mut LinkLayer<P>, filename: &str, data: &[u8]) -> Result<()> {
    let meta = FileMetadata {
        file_size: data.len() as u32,
        filename: filename.to_string(),
    };

    let mut start = vec![TYPE_START];
    start.extend(encode_tlvs(&meta));
    link.write(&start)?;
    debug!("sent start packet for {filename:?} ({} bytes)", meta.file_size);

    for (seq, chunk) in data.chunks(DATA_CHUNK_LEN).enumerate() {
        let packet = encode_data_packet(seq as u32, chunk);
        link.write(&packet)?;
    }
    debug!("sent {} data packet(s)", data.len().div_ceil(DATA_CHUNK_LEN.max(1)));

    let mut end = vec![TYPE_END];
    end.extend(encode_tlvs(&meta));
    link.write(&end)?;
    debug!("sent end packet");
    Ok(())
}

/// Receives one file transfer, returning the filename declared by the start packet
/// and the reassembled bytes. Logs a warning, but does not fail, if the end packet's
/// metadata disagrees with the start packet's.
pub fn receive_file<P: SerialPort>(link: &mut LinkLayer<P>) -> Result<(String, Vec<u8>)> {
    let mut frame = Vec::new();

    link.read(&mut frame)?;
    let start_meta = parse_control_packet(&frame, TYPE_START)?;
    debug!(
        "received start packet for {:?} ({} bytes)",
        start_meta.filename, start_meta.file_size
    );

    let mut data = Vec::with_capacity(start_meta.file_size as usize);
    loop {
        link.read(&mut frame)?;
        let packet_type = *frame
            .first()
            .ok_or_else(|| LinkError::Framing("empty application packet".into()))?;
        let body = &frame[1..];

        if packet_type == TYPE_END {
            let end_meta = decode_tlvs(body)?;
            if end_meta != start_meta {
                warn!(
                    "end packet metadata {end_meta:?} disagrees with start packet {start_meta:?}; keeping received data"
                );
            }
            break;
        }

        if packet_type != TYPE_DATA {
            return Err(LinkError::Framing(format!(
                "expected a data or end packet, got type {packet_type}"
            )));
        }

        let (_seq, chunk) = decode_data_packet(body)?;
        data.extend_from_slice(chunk);
    }

    debug!("reassembled {} bytes", data.len());
    Ok((start_meta.filename, data))
}

fn parse_control_packet(frame: &[u8], expected_type: u8) -> Result<FileMetadata> {
    let packet_type = *frame
        .first()
        .ok_or_else(|| LinkError::Framing("empty application packet".into()))?;
    if packet_type != expected_type {
        return Err(LinkError::Framing(format!(
            "expected packet type {expected_type}, got {packet_type}"
        )));
    }
    decode_tlvs(&frame[1..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_metadata_tlvs() {
        let meta = FileMetadata {
            file_size: 42,
            filename: "report.txt".to_string(),
        };
        let encoded = encode_tlvs(&meta);
        assert_eq!(decode_tlvs(&encoded).unwrap(), meta);
    }

    #[test]
    fn rejects_missing_file_size_tlv() {
        let mut body = Vec::new();
        body.push(TLV_FILENAME);
        body.push(1);
        body.push(b'x');
        assert!(decode_tlvs(&body).is_err());
    }

    #[test]
    fn data_packet_round_trips() {
        let packet = encode_data_packet(7, &[1, 2, 3]);
        let (seq, chunk) = decode_data_packet(&packet[1..]).unwrap();
        assert_eq!(seq, 7);
        assert_eq!(chunk, &[1, 2, 3]);
    }

    #[test]
    fn data_packet_sequence_wraps_at_100() {
        let packet = encode_data_packet(103, &[9]);
        let (seq, _) = decode_data_packet(&packet[1..]).unwrap();
        assert_eq!(seq, 3);
    }

    #[test]
    fn file_transfer_round_trips_over_loopback() {
        use crate::engine::{ConnectionParams, LinkLayer};
        use crate::serial::LoopbackPort;

        let (tx_port, rx_port) = LoopbackPort::pair();
        let tx_params = ConnectionParams::new("tx", 3, 2).unwrap();
        let rx_params = ConnectionParams::new("rx", 3, 2).unwrap();
        let mut tx = LinkLayer::new(tx_port, tx_params);
        let mut rx = LinkLayer::new(rx_port, rx_params);

        let payload: Vec<u8> = (0u8..=255).cycle().take(3000).collect();
        let payload_for_thread = payload.clone();

        let rx_thread = std::thread::spawn(move || {
            rx.open().unwrap();
            let result = receive_file(&mut rx).unwrap();
            rx.close(false).unwrap();
            result
        });

        tx.open().unwrap();
        send_file(&mut tx, "data.bin", &payload).unwrap();
        tx.close(false).unwrap();

        let (filename, received) = rx_thread.join().unwrap();
        assert_eq!(filename, "data.bin");
        assert_eq!(received, payload_for_thread);
    }

    #[test]
    fn mismatched_end_metadata_does_not_fail_the_transfer() {
        use crate::engine::{ConnectionParams, LinkLayer};
        use crate::serial::LoopbackPort;

        let (tx_port, rx_port) = LoopbackPort::pair();
        let mut tx = LinkLayer::new(tx_port, ConnectionParams::new("tx", 3, 2).unwrap());
        let mut rx = LinkLayer::new(rx_port, ConnectionParams::new("rx", 3, 2).unwrap());

        let rx_thread = std::thread::spawn(move || {
            rx.open().unwrap();
            let result = receive_file(&mut rx).unwrap();
            rx.close(false).unwrap();
            result
        });

        tx.open().unwrap();

        let start_meta = FileMetadata {
            file_size: 3,
            filename: "a.txt".to_string(),
        };
        let mut start = vec![TYPE_START];
        start.extend(encode_tlvs(&start_meta));
        tx.write(&start).unwrap();

        tx.write(&encode_data_packet(0, &[1, 2, 3])).unwrap();

        let wrong_meta = FileMetadata {
            file_size: 999,
            filename: "a.txt".to_string(),
        };
        let mut end = vec![TYPE_END];
        end.extend(encode_tlvs(&wrong_meta));
        tx.write(&end).unwrap();

        tx.close(false).unwrap();

        let (filename, received) = rx_thread.join().unwrap();
        assert_eq!(filename, "a.txt");
        assert_eq!(received, vec![1, 2, 3]);
    }
}
