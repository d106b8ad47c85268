// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Block framing: header byte, sequence pair, payload, checksum trailer

use std::time::Duration;
use thiserror::Error;
use tracing::trace;

use crate::crc;
use crate::protocol::{CrcMode, CAN, EOT, MAX_CAN_BEFORE_ABORT, SOH, STX};
use crate::serial::SerialPort;

/// Largest payload a block can carry (STX frames).
pub const MAX_BLOCK_LEN: usize = 1024;

// ============================================================================
// Error Types
// ============================================================================

/// Failure modes of a single block-read attempt. The engine recovers from
/// `Timeout` and `Malformed` by negative-acknowledge and retry (except
/// under YMODEM-G); `Aborted` always ends the session.
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("no valid block within the attempt window")]
    Timeout,
    #[error("malformed block (bad sequence complement or checksum)")]
    Malformed,
    #[error("transfer cancelled by sender")]
    Aborted,
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Block
// ============================================================================

/// One framed unit of transfer. Created per read attempt, consumed by the
/// engine, then discarded; never retained across attempts.
pub struct Block {
    buf: [u8; MAX_BLOCK_LEN],
    len: usize,
    seq: u8,
}

impl Block {
    pub fn payload(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn seq(&self) -> u8 {
        self.seq
    }
}

/// Outcome of a successful read attempt: a data block or the
/// end-of-transmission marker.
pub enum BlockRead {
    Data(Block),
    Eot,
}

/// Frame statistics accumulated over a session. The CAN count doubles as
/// the abort threshold tracker.
#[derive(Default)]
pub struct FrameCounters {
    pub soh: u32,
    pub stx: u32,
    pub can: u32,
}

// ============================================================================
// Parser
// ============================================================================

fn get_byte_or_timeout(
    serial: &mut dyn SerialPort,
    timeout: Duration,
) -> Result<u8, BlockError> {
    match serial.get_byte(timeout)? {
        Some(byte) => Ok(byte),
        None => Err(BlockError::Timeout),
    }
}

/// Fills `buf` byte by byte, each read bounded by `timeout`. A short read
/// is a `Timeout`: partial frames are never surfaced.
fn fill(
    serial: &mut dyn SerialPort,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<(), BlockError> {
    for slot in buf.iter_mut() {
        *slot = get_byte_or_timeout(serial, timeout)?;
    }
    Ok(())
}

/// Reads one block from the transport.
///
/// Leading bytes that are not a recognized header are discarded, absorbing
/// line noise before a valid frame. The header byte fixes the payload
/// length (SOH = 128, STX = 1024), so a corrupt length can never overrun
/// the block buffer. After the header come the sequence byte and its
/// complement, the payload, and a 0/1/2-byte checksum trailer depending on
/// `crc_mode`.
pub fn read_block(
    serial: &mut dyn SerialPort,
    crc_mode: CrcMode,
    counters: &mut FrameCounters,
    timeout: Duration,
) -> Result<BlockRead, BlockError> {
    let data_len: usize;

    loop {
        let hdr = get_byte_or_timeout(serial, timeout)?;
        trace!("header byte {:#04x}", hdr);

        match hdr {
            SOH => {
                data_len = 128;
                counters.soh += 1;
                break;
            }
            STX => {
                data_len = 1024;
                counters.stx += 1;
                break;
            }
            EOT => return Ok(BlockRead::Eot),
            CAN => {
                counters.can += 1;
                if counters.can > MAX_CAN_BEFORE_ABORT {
                    return Err(BlockError::Aborted);
                }
            }
            _ => {} // line noise, keep scanning
        }
    }

    let mut seqs = [0u8; 2];
    fill(serial, &mut seqs, timeout)?;
    let seq = seqs[0];
    if 255 - seqs[0] != seqs[1] {
        return Err(BlockError::Malformed);
    }

    let mut block = Block {
        buf: [0u8; MAX_BLOCK_LEN],
        len: data_len,
        seq,
    };
    fill(serial, &mut block.buf[..data_len], timeout)?;

    let received = match crc_mode {
        CrcMode::Add8 => {
            let mut trailer = [0u8; 1];
            fill(serial, &mut trailer, timeout)?;
            trailer[0] as u16
        }
        CrcMode::Crc16 => {
            let mut trailer = [0u8; 2];
            fill(serial, &mut trailer, timeout)?;
            u16::from_be_bytes(trailer)
        }
        CrcMode::None => 0,
    };

    if !crc::verify(crc_mode, block.payload(), received) {
        trace!("checksum mismatch on block {}", seq);
        return Err(BlockError::Malformed);
    }

    Ok(BlockRead::Data(block))
}

#[cfg(test)]
fn encode_frame(
    hdr: u8,
    size: usize,
    seq: u8,
    data: &[u8],
    crc_mode: CrcMode,
) -> Vec<Option<u8>> {
    let mut payload = data.to_vec();
    payload.resize(size, 0x1A);

    let mut out = vec![Some(hdr), Some(seq), Some(255 - seq)];
    out.extend(payload.iter().map(|&b| Some(b)));
    match crc_mode {
        CrcMode::Add8 => out.push(Some(crc::add8(&payload))),
        CrcMode::Crc16 => {
            let crc = crc::crc16_ccitt(&payload);
            out.push(Some((crc >> 8) as u8));
            out.push(Some(crc as u8));
        }
        CrcMode::None => {}
    }
    out
}

/// Encodes one 128-byte SOH block the way a sender would, as a script for
/// [`crate::serial::MockSerialPort`].
#[cfg(test)]
pub fn encode_block(seq: u8, data: &[u8], crc_mode: CrcMode) -> Vec<Option<u8>> {
    encode_frame(SOH, 128, seq, data, crc_mode)
}

/// 1024-byte STX variant of [`encode_block`].
#[cfg(test)]
pub fn encode_block_1k(seq: u8, data: &[u8], crc_mode: CrcMode) -> Vec<Option<u8>> {
    encode_frame(STX, MAX_BLOCK_LEN, seq, data, crc_mode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::MockSerialPort;

    const T: Duration = Duration::from_secs(3);

    fn read_one(
        responses: Vec<Option<u8>>,
        crc_mode: CrcMode,
        counters: &mut FrameCounters,
    ) -> Result<BlockRead, BlockError> {
        let mut serial = MockSerialPort::new(responses, Vec::new());
        read_block(&mut serial, crc_mode, counters, T)
    }

    #[test]
    fn test_read_block_absorbs_leading_noise() {
        let mut responses = vec![Some(0x00), Some(0x7F), Some(b'x')];
        responses.extend(encode_block(1, b"payload", CrcMode::Crc16));

        let mut counters = FrameCounters::default();
        match read_one(responses, CrcMode::Crc16, &mut counters) {
            Ok(BlockRead::Data(blk)) => {
                assert_eq!(blk.seq(), 1);
                assert_eq!(blk.payload().len(), 128);
                assert_eq!(&blk.payload()[..7], b"payload");
            }
            other => panic!("expected data block, got {:?}", other.err()),
        }
        assert_eq!(counters.soh, 1);
    }

    #[test]
    fn test_read_block_stx_frame() {
        let body: Vec<u8> = (0..1024).map(|i| (i % 251) as u8).collect();
        let responses = encode_block_1k(1, &body, CrcMode::Crc16);

        let mut counters = FrameCounters::default();
        match read_one(responses, CrcMode::Crc16, &mut counters) {
            Ok(BlockRead::Data(blk)) => {
                assert_eq!(blk.payload().len(), 1024);
                assert_eq!(blk.payload(), body.as_slice());
            }
            other => panic!("expected data block, got {:?}", other.err()),
        }
        assert_eq!(counters.stx, 1);
        assert_eq!(counters.soh, 0);
    }

    #[test]
    fn test_read_block_eot() {
        let mut counters = FrameCounters::default();
        match read_one(vec![Some(EOT)], CrcMode::Crc16, &mut counters) {
            Ok(BlockRead::Eot) => {}
            _ => panic!("expected EOT"),
        }
    }

    #[test]
    fn test_read_block_bad_complement() {
        let responses = vec![Some(SOH), Some(1), Some(253)];
        let mut counters = FrameCounters::default();
        match read_one(responses, CrcMode::Crc16, &mut counters) {
            Err(BlockError::Malformed) => {}
            _ => panic!("expected Malformed"),
        }
    }

    #[test]
    fn test_read_block_bad_checksum() {
        let mut responses = encode_block(1, b"data", CrcMode::Crc16);
        let last = responses.len() - 1;
        responses[last] = responses[last].map(|b| b ^ 0xFF);

        let mut counters = FrameCounters::default();
        match read_one(responses, CrcMode::Crc16, &mut counters) {
            Err(BlockError::Malformed) => {}
            _ => panic!("expected Malformed"),
        }
    }

    #[test]
    fn test_read_block_short_payload_is_timeout() {
        // Frame cut off after 10 payload bytes
        let responses = encode_block(2, b"short", CrcMode::Crc16)
            .into_iter()
            .take(3 + 10)
            .collect();

        let mut counters = FrameCounters::default();
        match read_one(responses, CrcMode::Crc16, &mut counters) {
            Err(BlockError::Timeout) => {}
            _ => panic!("expected Timeout"),
        }
    }

    #[test]
    fn test_read_block_add8_trailer() {
        let responses = encode_block(7, b"legacy mode", CrcMode::Add8);
        let mut counters = FrameCounters::default();
        match read_one(responses, CrcMode::Add8, &mut counters) {
            Ok(BlockRead::Data(blk)) => assert_eq!(blk.seq(), 7),
            _ => panic!("expected data block"),
        }
    }

    #[test]
    fn test_cancel_threshold_aborts() {
        let responses = vec![Some(CAN); 6];
        let mut counters = FrameCounters::default();
        match read_one(responses, CrcMode::Crc16, &mut counters) {
            Err(BlockError::Aborted) => {}
            _ => panic!("expected Aborted"),
        }
        assert_eq!(counters.can, 6);
    }

    #[test]
    fn test_cancel_count_persists_across_attempts() {
        let mut counters = FrameCounters::default();

        // Three CANs then silence: attempt times out, count is retained
        let mut serial = MockSerialPort::new(vec![Some(CAN); 3], Vec::new());
        match read_block(&mut serial, CrcMode::Crc16, &mut counters, T) {
            Err(BlockError::Timeout) => {}
            _ => panic!("expected Timeout"),
        }
        drop(serial);

        // Three more cross the threshold on the next attempt
        let mut serial = MockSerialPort::new(vec![Some(CAN); 3], Vec::new());
        match read_block(&mut serial, CrcMode::Crc16, &mut counters, T) {
            Err(BlockError::Aborted) => {}
            _ => panic!("expected Aborted"),
        }
    }
}
