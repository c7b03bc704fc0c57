//! Synthetic event constructors, grounded on `original_source/rpl_event.cc`'s
//! `create_*_event` family (ROTATE/STOP/GTID_LIST/START_ENCRYPTION/HEARTBEAT).

use openssl::rand::rand_bytes;

use crate::error::{PinlokiError, Result};
use crate::gtid::GtidList;
use super::codec::{compute_crc, Event};
use super::header::Header;
use super::types::{self, RotateKind, CRC_LEN, HEADER_LEN};

fn now_secs() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn assemble(timestamp: u32, event_type: u8, server_id: u32, next_event_pos: u32, flags: u16, body: &[u8]) -> Event {
    let event_length = (HEADER_LEN + body.len() + CRC_LEN) as u32;
    let header = Header { timestamp, event_type, server_id, event_length, next_event_pos, flags };

    let mut bytes = vec![0u8; event_length as usize];
    header.write_into(&mut bytes[0..HEADER_LEN]);
    bytes[HEADER_LEN..HEADER_LEN + body.len()].copy_from_slice(body);

    let crc = compute_crc(&bytes[..bytes.len() - CRC_LEN]);
    let len = bytes.len();
    bytes[len - 4..].copy_from_slice(&crc.to_le_bytes());

    Event { header, bytes }
}

pub fn build_rotate(filename: &str, server_id: u32, next_pos: u32, kind: RotateKind) -> Event {
    let mut body = Vec::with_capacity(8 + filename.len());
    body.extend_from_slice(&4u64.to_le_bytes());
    body.extend_from_slice(filename.as_bytes());

    let (timestamp, flags) = match kind {
        RotateKind::Real => (now_secs(), 0u16),
        RotateKind::Artificial => (0u32, types::FLAG_ARTIFICIAL),
    };

    assemble(timestamp, types::ROTATE_EVENT, server_id, next_pos, flags, &body)
}

pub fn build_stop(server_id: u32, next_pos: u32) -> Event {
    assemble(now_secs(), types::STOP_EVENT, server_id, next_pos, 0, &[])
}

pub fn build_gtid_list(server_id: u32, next_pos: u32, list: &GtidList) -> Event {
    let mut body = Vec::with_capacity(4 + list.gtids().len() * 16);
    body.extend_from_slice(&(list.gtids().len() as u32).to_le_bytes());
    for g in list.gtids() {
        body.extend_from_slice(&g.domain_id().to_le_bytes());
        body.extend_from_slice(&g.server_id().to_le_bytes());
        body.extend_from_slice(&g.sequence_nr().to_le_bytes());
    }
    assemble(now_secs(), types::GTID_LIST_EVENT, server_id, next_pos, 0, &body)
}

/// The 12-byte nonce is drawn from a cryptographic RNG; failure is fatal.
pub fn build_start_encryption(server_id: u32, key_version: u32, next_pos: u32) -> Result<Event> {
    let mut nonce = [0u8; 12];
    rand_bytes(&mut nonce).map_err(|e| PinlokiError::encryption(format!("RNG failure generating nonce: {e}")))?;

    let mut body = Vec::with_capacity(17);
    body.push(1u8); // scheme
    body.extend_from_slice(&key_version.to_le_bytes());
    body.extend_from_slice(&nonce);

    Ok(assemble(now_secs(), types::START_ENCRYPTION_EVENT, server_id, next_pos, 0, &body))
}

/// `next_event_pos = 0xFFFFFFFF`, payload is the current filename without a
/// NUL terminator.
pub fn build_heartbeat(server_id: u32, filename: &str) -> Event {
    assemble(0, types::HEARTBEAT_LOG_EVENT, server_id, 0xFFFF_FFFF, types::FLAG_ARTIFICIAL, filename.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtid::Gtid;

    #[test]
    fn heartbeat_has_expected_shape() {
        let ev = build_heartbeat(7, "base.000001");
        assert_eq!(ev.header.next_event_pos, 0xFFFF_FFFF);
        assert!(ev.header.is_artificial());
        assert_eq!(ev.body(), b"base.000001");
        assert!(ev.verify_crc());
    }

    #[test]
    fn artificial_rotate_has_zero_timestamp() {
        let ev = build_rotate("base.000002", 1, 4, RotateKind::Artificial);
        assert_eq!(ev.header.timestamp, 0);
        assert!(ev.header.is_artificial());
    }

    #[test]
    fn real_rotate_has_nonzero_timestamp() {
        let ev = build_rotate("base.000002", 1, 4, RotateKind::Real);
        assert!(!ev.header.is_artificial());
    }

    #[test]
    fn start_encryption_nonce_is_random_each_time() {
        let a = build_start_encryption(1, 1, 0).unwrap();
        let b = build_start_encryption(1, 1, 0).unwrap();
        assert_ne!(a.body()[1..17], b.body()[1..17]);
    }

    #[test]
    fn gtid_list_empty_builds_zero_count() {
        let ev = build_gtid_list(1, 4, &GtidList::empty());
        assert_eq!(ev.body(), &0u32.to_le_bytes());
    }

    #[test]
    fn gtid_list_nonempty_preserves_order() {
        let list = GtidList::new(vec![Gtid::new(0, 1, 1), Gtid::new(2, 1, 9)]);
        let ev = build_gtid_list(1, 4, &list);
        assert_eq!(ev.body().len(), 4 + 32);
    }
}
