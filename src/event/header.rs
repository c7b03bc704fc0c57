//! Fixed 19-byte binlog event header, grounded on
//! `original_source/rpl_event.hh`'s header layout and the little-endian
//! field parsing idiom shown in
//! `other_examples/*rust-us-mysql-cdc-rs*event_header*`.

use crate::error::{PinlokiError, Result};
use super::types::HEADER_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub timestamp: u32,
    pub event_type: u8,
    pub server_id: u32,
    pub event_length: u32,
    pub next_event_pos: u32,
    pub flags: u16,
}

impl Header {
    pub fn parse(bytes: &[u8]) -> Result<Header> {
        if bytes.len() < HEADER_LEN {
            return Err(PinlokiError::binlog_read("short event header"));
        }
        let timestamp = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let event_type = bytes[4];
        let server_id = u32::from_le_bytes(bytes[5..9].try_into().unwrap());
        let event_length = u32::from_le_bytes(bytes[9..13].try_into().unwrap());
        let next_event_pos = u32::from_le_bytes(bytes[13..17].try_into().unwrap());
        let flags = u16::from_le_bytes(bytes[17..19].try_into().unwrap());

        Ok(Header { timestamp, event_type, server_id, event_length, next_event_pos, flags })
    }

    pub fn write_into(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.timestamp.to_le_bytes());
        out[4] = self.event_type;
        out[5..9].copy_from_slice(&self.server_id.to_le_bytes());
        out[9..13].copy_from_slice(&self.event_length.to_le_bytes());
        out[13..17].copy_from_slice(&self.next_event_pos.to_le_bytes());
        out[17..19].copy_from_slice(&self.flags.to_le_bytes());
    }

    pub fn is_artificial(&self) -> bool {
        self.flags & super::types::FLAG_ARTIFICIAL != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let h = Header {
            timestamp: 12345,
            event_type: 4,
            server_id: 1,
            event_length: 50,
            next_event_pos: 100,
            flags: 0x20,
        };
        let mut buf = [0u8; HEADER_LEN];
        h.write_into(&mut buf);
        let parsed = Header::parse(&buf).unwrap();
        assert_eq!(h, parsed);
        assert!(parsed.is_artificial());
    }

    #[test]
    fn rejects_short_buffer() {
        assert!(Header::parse(&[0u8; 10]).is_err());
    }
}
