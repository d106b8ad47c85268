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

//! X/Y-Modem wire constants and the per-protocol invite/ack tables

use std::time::Duration;

/// Start of header - begins a 128-byte data block
pub const SOH: u8 = 0x01;

/// Start of text - begins a 1024-byte data block
pub const STX: u8 = 0x02;

/// End of transmission - no more blocks in the current file
pub const EOT: u8 = 0x04;

/// Acknowledge - block accepted
pub const ACK: u8 = 0x06;

/// Negative acknowledge - block rejected, retransmit; doubles as the
/// invite byte for ADD8 checksum mode
pub const NAK: u8 = 0x15;

/// Cancel - sender requests session abort
pub const CAN: u8 = 0x18;

/// Invite byte requesting CRC16 blocks
pub const CRC16_INVITE: u8 = b'C';

/// Invite byte for YMODEM-G streaming mode
pub const STREAM_INVITE: u8 = b'G';

/// Per-attempt timeout for receiving one block
pub const BLOCK_TIMEOUT: Duration = Duration::from_secs(3);

/// Consecutive failures on one block (or header invites) before giving up
pub const MAX_RETRIES: u32 = 20;

/// Failed attempts before downgrading from CRC16 to ADD8
pub const MAX_RETRIES_WITH_CRC: u32 = 5;

/// CAN bytes tolerated across a session before aborting
pub const MAX_CAN_BEFORE_ABORT: u32 = 5;

/// Protocol variant, fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Xmodem,
    Ymodem,
    YmodemG,
}

impl Protocol {
    /// YMODEM-family protocols carry a filename/length header block and
    /// support multi-file batches.
    pub fn has_file_header(self) -> bool {
        !matches!(self, Protocol::Xmodem)
    }

    /// YMODEM-G streams without acknowledgments and cannot recover from
    /// a bad block.
    pub fn is_streaming(self) -> bool {
        matches!(self, Protocol::YmodemG)
    }
}

/// Checksum mode for a session. May only weaken from `Crc16` to `Add8`
/// over a session's lifetime, never strengthen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcMode {
    None = 0,
    Add8 = 1,
    Crc16 = 2,
}

/// Control bytes a protocol variant emits, indexed by [`CrcMode`].
/// `None` entries mean "send nothing", which is how YMODEM-G's lack of
/// acknowledgments is expressed without special-casing the engine.
pub struct WireTable {
    invite_header: [Option<u8>; 3],
    invite_body: [Option<u8>; 3],
    ack: [Option<u8>; 3],
    nack: [Option<u8>; 3],
}

impl WireTable {
    pub fn invite_header(&self, mode: CrcMode) -> Option<u8> {
        self.invite_header[mode as usize]
    }

    pub fn invite_body(&self, mode: CrcMode) -> Option<u8> {
        self.invite_body[mode as usize]
    }

    pub fn ack(&self, mode: CrcMode) -> Option<u8> {
        self.ack[mode as usize]
    }

    pub fn nack(&self, mode: CrcMode) -> Option<u8> {
        self.nack[mode as usize]
    }
}

const XMODEM_TABLE: WireTable = WireTable {
    invite_header: [None, Some(NAK), Some(CRC16_INVITE)],
    invite_body: [None, Some(NAK), Some(CRC16_INVITE)],
    ack: [None, Some(ACK), Some(ACK)],
    nack: [None, Some(NAK), Some(NAK)],
};

const YMODEM_TABLE: WireTable = WireTable {
    invite_header: [None, Some(NAK), Some(CRC16_INVITE)],
    invite_body: [None, Some(NAK), Some(CRC16_INVITE)],
    ack: [None, Some(ACK), Some(ACK)],
    nack: [None, Some(NAK), Some(NAK)],
};

const YMODEM_G_TABLE: WireTable = WireTable {
    invite_header: [None, Some(STREAM_INVITE), Some(STREAM_INVITE)],
    invite_body: [None, Some(STREAM_INVITE), Some(STREAM_INVITE)],
    ack: [None, None, None],
    nack: [None, None, None],
};

/// Immutable wire table for a protocol variant, supplied to the engine
/// when a session is opened.
pub fn wire_table(protocol: Protocol) -> &'static WireTable {
    match protocol {
        Protocol::Xmodem => &XMODEM_TABLE,
        Protocol::Ymodem => &YMODEM_TABLE,
        Protocol::YmodemG => &YMODEM_G_TABLE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streaming_table_sends_no_acks() {
        let table = wire_table(Protocol::YmodemG);
        assert_eq!(table.ack(CrcMode::Crc16), None);
        assert_eq!(table.nack(CrcMode::Add8), None);
        assert_eq!(table.invite_header(CrcMode::Crc16), Some(STREAM_INVITE));
        assert_eq!(table.invite_body(CrcMode::Add8), Some(STREAM_INVITE));
    }

    #[test]
    fn test_legacy_invite_is_nak() {
        let table = wire_table(Protocol::Xmodem);
        assert_eq!(table.invite_body(CrcMode::Add8), Some(NAK));
        assert_eq!(table.invite_body(CrcMode::Crc16), Some(CRC16_INVITE));
        assert_eq!(table.nack(CrcMode::Crc16), Some(NAK));
    }
}
