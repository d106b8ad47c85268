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

//! The X/Y-Modem receive engine: a state machine driving invites,
//! retries, checksum-mode downgrade and multi-file batch handling.

use std::marker::PhantomData;
use thiserror::Error;
use tracing::{debug, info};

use crate::block::{self, Block, BlockError, BlockRead, FrameCounters};
use crate::protocol::{
    ACK, BLOCK_TIMEOUT, CrcMode, MAX_RETRIES, MAX_RETRIES_WITH_CRC, Protocol, WireTable,
    wire_table,
};
use crate::serial::SerialPort;
use crate::sink::StorageSink;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("no valid block within the retry budget")]
    Timeout,
    #[error("malformed block (bad sequence complement or checksum)")]
    Malformed,
    #[error("block received out of order")]
    OutOfSequence,
    #[error("transfer aborted by sender")]
    Aborted,
    #[error("invalid file header: {0}")]
    InvalidArgument(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transfer complete")]
    TransferComplete,
}

// ============================================================================
// States
// ============================================================================

pub struct GetFilename;
pub struct NegotiateCrc;
pub struct ReceiveBody;
pub struct FinishedFile;
pub struct FinishedTransfer;

// ============================================================================
// FSM Structure
// ============================================================================

pub struct ReceiverFsm<State> {
    state: PhantomData<State>,
    serial: Box<dyn SerialPort>,
    sink: Box<dyn StorageSink>,
    protocol: Protocol,
    table: &'static WireTable,
    crc_mode: CrcMode,
    filename: String,
    file_len: u64,
    bytes_written: u64,
    next_blk: u8,
    file_open: bool,
    // Set once the current file's first well-formed block arrives; until
    // then a silent line means the sender never saw our invite, so we
    // re-invite instead of nacking
    body_synced: bool,
    header_tries: u32,
    crc_tries: u32,
    same_blk_retries: u32,
    total_retries: u32,
    counters: FrameCounters,
    // Target filename for XMODEM, which carries none on the wire
    default_name: String,
}

// ============================================================================
// Trait
// ============================================================================

pub trait ReceiverState: Send {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiveError>;
}

// ============================================================================
// Helpers
// ============================================================================

enum SeqCheck {
    InOrder,
    Duplicate,
    OutOfOrder,
}

impl<S> ReceiverFsm<S> {
    fn transition<T>(self) -> Box<ReceiverFsm<T>> {
        Box::new(ReceiverFsm {
            state: PhantomData,
            serial: self.serial,
            sink: self.sink,
            protocol: self.protocol,
            table: self.table,
            crc_mode: self.crc_mode,
            filename: self.filename,
            file_len: self.file_len,
            bytes_written: self.bytes_written,
            next_blk: self.next_blk,
            file_open: self.file_open,
            body_synced: self.body_synced,
            header_tries: self.header_tries,
            crc_tries: self.crc_tries,
            same_blk_retries: self.same_blk_retries,
            total_retries: self.total_retries,
            counters: self.counters,
            default_name: self.default_name,
        })
    }

    fn put(&mut self, byte: Option<u8>) -> std::io::Result<()> {
        match byte {
            Some(b) => self.serial.put_byte(b),
            None => Ok(()),
        }
    }

    fn send_ack(&mut self) -> std::io::Result<()> {
        self.put(self.table.ack(self.crc_mode))
    }

    fn send_nack(&mut self) -> std::io::Result<()> {
        self.total_retries += 1;
        self.put(self.table.nack(self.crc_mode))
    }

    fn read_block(&mut self) -> Result<BlockRead, BlockError> {
        block::read_block(
            self.serial.as_mut(),
            self.crc_mode,
            &mut self.counters,
            BLOCK_TIMEOUT,
        )
    }

    // A session only ever weakens its checksum mode, never the reverse.
    fn downgrade_crc(&mut self) {
        if self.crc_mode == CrcMode::Crc16 {
            debug!("sender not answering CRC16 invites, downgrading to ADD8");
            self.crc_mode = CrcMode::Add8;
        }
    }

    fn check_seq(&self, blk: &Block) -> SeqCheck {
        if blk.seq() == self.next_blk {
            SeqCheck::InOrder
        } else if blk.seq() == self.next_blk.wrapping_sub(1) {
            SeqCheck::Duplicate
        } else {
            SeqCheck::OutOfOrder
        }
    }

    /// Appends an in-order block to the sink. YMODEM-family transfers with
    /// a declared length are truncated so the file never grows past it;
    /// XMODEM and unknown-length transfers write blocks raw. Accounting
    /// tracks bytes actually written, not bytes read off the wire.
    fn apply_block(&mut self, blk: &Block) -> std::io::Result<()> {
        let payload = blk.payload();
        let xfer = if self.protocol.has_file_header() && self.file_len > 0 {
            let remain = self.file_len.saturating_sub(self.bytes_written);
            payload.len().min(remain as usize)
        } else {
            payload.len()
        };
        self.sink.write(&payload[..xfer])?;
        self.bytes_written += xfer as u64;
        Ok(())
    }
}

// ============================================================================
// Header Block Parsing
// ============================================================================

/// Parses a YMODEM header payload: a NUL-terminated filename, a decimal
/// length token, then optional metadata which is ignored. A missing NUL or
/// an oversized filename is an error; a non-numeric length yields zero
/// (length unknown).
fn parse_file_header(payload: &[u8]) -> Result<(String, u64), ReceiveError> {
    let nul = payload.iter().position(|&b| b == 0).ok_or_else(|| {
        ReceiveError::InvalidArgument("filename not NUL-terminated".to_string())
    })?;
    if nul > 127 {
        return Err(ReceiveError::InvalidArgument(format!(
            "filename of {} bytes exceeds the 127-byte limit",
            nul
        )));
    }

    let filename = String::from_utf8_lossy(&payload[..nul]).into_owned();

    let token = payload[nul + 1..]
        .split(|b: &u8| b.is_ascii_whitespace() || *b == 0)
        .find(|t| !t.is_empty())
        .unwrap_or(&[]);
    let digits: String = token
        .iter()
        .map(|&b| b as char)
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let file_len = digits.parse().unwrap_or(0);

    Ok((filename, file_len))
}

// ============================================================================
// State Implementations
// ============================================================================

impl ReceiverState for ReceiverFsm<GetFilename> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiveError> {
        let mut fsm = *self;

        if fsm.header_tries >= MAX_RETRIES {
            return Err(ReceiveError::Timeout);
        }
        fsm.header_tries += 1;

        fsm.put(fsm.table.invite_header(fsm.crc_mode))?;

        match fsm.read_block() {
            Ok(BlockRead::Data(blk)) => {
                fsm.next_blk = 1;
                fsm.send_ack()?;

                let (filename, file_len) = parse_file_header(blk.payload())?;
                if filename.is_empty() {
                    debug!("empty filename header, end of batch");
                    let next = fsm.transition::<FinishedTransfer>();
                    return Ok(next as Box<dyn ReceiverState>);
                }

                debug!(filename = %filename, file_len, "file header received");
                fsm.sink.open(&filename)?;
                fsm.file_open = true;
                fsm.filename = filename;
                fsm.file_len = file_len;
                fsm.bytes_written = 0;
                fsm.body_synced = false;
                fsm.same_blk_retries = 0;

                let next = fsm.transition::<NegotiateCrc>();
                Ok(next as Box<dyn ReceiverState>)
            }
            // An EOT here is as unexpected as noise; re-invite
            Ok(BlockRead::Eot)
            | Err(BlockError::Timeout)
            | Err(BlockError::Malformed) => {
                fsm.total_retries += 1;
                if fsm.header_tries >= MAX_RETRIES_WITH_CRC {
                    fsm.downgrade_crc();
                }
                Ok(Box::new(fsm) as Box<dyn ReceiverState>)
            }
            Err(BlockError::Aborted) => Err(ReceiveError::Aborted),
            Err(BlockError::Io(e)) => Err(e.into()),
        }
    }
}

impl ReceiverState for ReceiverFsm<NegotiateCrc> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiveError> {
        let mut fsm = *self;

        if !fsm.file_open {
            // XMODEM has no header block; open the caller-supplied target
            let name = fsm.default_name.clone();
            fsm.sink.open(&name)?;
            fsm.file_open = true;
            fsm.filename = name;
            fsm.file_len = 0;
            fsm.bytes_written = 0;
            fsm.body_synced = false;
            fsm.same_blk_retries = 0;
        }

        // One invite per pass; a silent body state loops back here, and
        // after enough unanswered invites the checksum mode weakens so
        // senders that only understand the classic NAK invite can connect
        fsm.crc_tries += 1;
        if fsm.crc_tries > MAX_RETRIES_WITH_CRC {
            fsm.downgrade_crc();
        }

        fsm.put(fsm.table.invite_body(fsm.crc_mode))?;
        fsm.next_blk = 1;

        // No blocking wait of its own; the body state reads immediately
        let next = fsm.transition::<ReceiveBody>();
        Ok(next as Box<dyn ReceiverState>)
    }
}

impl ReceiverState for ReceiverFsm<ReceiveBody> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiveError> {
        let mut fsm = *self;

        match fsm.read_block() {
            Ok(BlockRead::Eot) => {
                let next = fsm.transition::<FinishedFile>();
                return Ok(next as Box<dyn ReceiverState>);
            }
            Ok(BlockRead::Data(blk)) => {
                fsm.body_synced = true;
                match fsm.check_seq(&blk) {
                    SeqCheck::InOrder => {
                        fsm.apply_block(&blk)?;
                        fsm.next_blk = blk.seq().wrapping_add(1);
                        fsm.same_blk_retries = 0;
                        fsm.send_ack()?;
                    }
                    SeqCheck::Duplicate => {
                        // Our earlier ACK was lost in transit; acknowledge
                        // again but never re-apply the data. The duplicate
                        // still counts toward the failure streak so a sender
                        // resending one block forever cannot stall the
                        // session past the retry ceiling.
                        debug!(seq = blk.seq(), "duplicate block, ack without write");
                        fsm.same_blk_retries += 1;
                        fsm.send_ack()?;
                    }
                    SeqCheck::OutOfOrder => {
                        if fsm.protocol.is_streaming() {
                            return Err(ReceiveError::OutOfSequence);
                        }
                        debug!(seq = blk.seq(), expected = fsm.next_blk, "sequence error");
                        fsm.send_nack()?;
                        fsm.same_blk_retries += 1;
                    }
                }
            }
            Err(BlockError::Timeout) => {
                if fsm.protocol.is_streaming() {
                    return Err(ReceiveError::Timeout);
                }
                if !fsm.body_synced {
                    // Silence before the file's first block: the sender has
                    // not answered the current invite, so loop back through
                    // the invite state instead of nacking. The failure
                    // streak carries across the loop so a dead line still
                    // exhausts the retry budget.
                    fsm.total_retries += 1;
                    fsm.same_blk_retries += 1;
                    if fsm.same_blk_retries > MAX_RETRIES {
                        return Err(ReceiveError::Timeout);
                    }
                    let next = fsm.transition::<NegotiateCrc>();
                    return Ok(next as Box<dyn ReceiverState>);
                }
                fsm.send_nack()?;
                fsm.same_blk_retries += 1;
            }
            Err(BlockError::Malformed) => {
                if fsm.protocol.is_streaming() {
                    return Err(ReceiveError::Malformed);
                }
                fsm.send_nack()?;
                fsm.same_blk_retries += 1;
            }
            Err(BlockError::Aborted) => return Err(ReceiveError::Aborted),
            Err(BlockError::Io(e)) => return Err(e.into()),
        }

        if fsm.same_blk_retries > MAX_RETRIES {
            return Err(ReceiveError::Timeout);
        }
        Ok(Box::new(fsm) as Box<dyn ReceiverState>)
    }
}

impl ReceiverState for ReceiverFsm<FinishedFile> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiveError> {
        let mut fsm = *self;

        fsm.sink.close()?;
        fsm.file_open = false;
        // The EOT is acknowledged even in streaming mode
        fsm.serial.put_byte(ACK)?;

        info!(
            filename = %fsm.filename,
            bytes = fsm.bytes_written,
            soh = fsm.counters.soh,
            stx = fsm.counters.stx,
            can = fsm.counters.can,
            retries = fsm.total_retries,
            "file received"
        );

        if fsm.protocol.has_file_header() {
            // Await the next file's header, or the empty one ending the batch
            fsm.filename.clear();
            fsm.file_len = 0;
            fsm.header_tries = 0;
            fsm.crc_tries = 0;
            let next = fsm.transition::<GetFilename>();
            Ok(next as Box<dyn ReceiverState>)
        } else {
            let next = fsm.transition::<FinishedTransfer>();
            Ok(next as Box<dyn ReceiverState>)
        }
    }
}

impl ReceiverState for ReceiverFsm<FinishedTransfer> {
    fn step(self: Box<Self>) -> Result<Box<dyn ReceiverState>, ReceiveError> {
        Err(ReceiveError::TransferComplete)
    }
}

// ============================================================================
// Constructor & Runner
// ============================================================================

/// Opens a receive session. `target_name` is used only by XMODEM, which
/// does not transmit a filename. YMODEM-family sessions start by awaiting
/// the header block; XMODEM goes straight to inviting the body.
pub fn open_session(
    serial: Box<dyn SerialPort>,
    sink: Box<dyn StorageSink>,
    protocol: Protocol,
    target_name: &str,
) -> Box<dyn ReceiverState> {
    let fsm = ReceiverFsm::<GetFilename> {
        state: PhantomData,
        serial,
        sink,
        protocol,
        table: wire_table(protocol),
        crc_mode: CrcMode::Crc16,
        filename: String::new(),
        file_len: 0,
        bytes_written: 0,
        next_blk: 1,
        file_open: false,
        body_synced: false,
        header_tries: 0,
        crc_tries: 0,
        same_blk_retries: 0,
        total_retries: 0,
        counters: FrameCounters::default(),
        default_name: target_name.to_string(),
    };

    if protocol.has_file_header() {
        Box::new(fsm)
    } else {
        fsm.transition::<NegotiateCrc>()
    }
}

/// Drives a session until the whole batch completes or fails.
pub fn run(mut session: Box<dyn ReceiverState>) -> Result<(), ReceiveError> {
    loop {
        match session.step() {
            Ok(next) => session = next,
            Err(ReceiveError::TransferComplete) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
