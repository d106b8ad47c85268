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

//! Block checksum validation: ADD8 and CRC16-CCITT (XMODEM variant)

use crate::protocol::CrcMode;

/// CRC16-CCITT as used by XMODEM-CRC and YMODEM: polynomial 0x1021,
/// initial value 0, no reflection, no final XOR.
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Legacy XMODEM checksum: wrapping 8-bit sum of all payload bytes.
pub fn add8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

/// Checks a received checksum trailer against the payload. The trailer is
/// widened to u16; for ADD8 only the low byte is meaningful.
pub fn verify(mode: CrcMode, payload: &[u8], received: u16) -> bool {
    match mode {
        CrcMode::Add8 => add8(payload) as u16 == received,
        CrcMode::Crc16 => crc16_ccitt(payload) == received,
        CrcMode::None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_known_vector() {
        // Standard check value for CRC-16/XMODEM
        assert_eq!(crc16_ccitt(b"123456789"), 0x31C3);
        assert_eq!(crc16_ccitt(&[]), 0x0000);
    }

    #[test]
    fn test_add8_wraps() {
        assert_eq!(add8(&[0xFF, 0x02]), 0x01);
        assert_eq!(add8(&[]), 0x00);
    }

    #[test]
    fn test_verify_dispatch() {
        let payload = b"hello";
        assert!(verify(CrcMode::Crc16, payload, crc16_ccitt(payload)));
        assert!(!verify(CrcMode::Crc16, payload, 0xDEAD));
        assert!(verify(CrcMode::Add8, payload, add8(payload) as u16));
        assert!(!verify(CrcMode::Add8, payload, (add8(payload) ^ 0xFF) as u16));
        assert!(verify(CrcMode::None, payload, 0xBEEF));
    }
}
