//! A minimal MySQL/MariaDB client-protocol connection to the upstream
//! primary: handshake, `mysql_native_password` auth, plain `COM_QUERY`,
//! `COM_REGISTER_SLAVE`, and `COM_BINLOG_DUMP_GTID`. Grounded on the
//! teacher's `channel::TcpChannel`/`channel::mysql_socket::MysqlConnector`
//! (socket ownership, handshake/negotiate shape, `scramble411` reuse from
//! `utils::mysql_password_encrypted`) generalized per
//! `original_source/dbconnection.hh`/`.cc`'s `ConnectionDetails`,
//! `start_replication`, and `get_rpl_msg`. Byte-at-a-time polling loops are
//! replaced with `TcpStream::set_read_timeout`, a more idiomatic primitive
//! than the teacher's manual timestamp-comparison loop for the same effect.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use crate::error::{PinlokiError, Result};
use crate::event::{codec, Event};
use crate::gtid::GtidList;

const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;

const COM_QUERY: u8 = 0x03;
const COM_REGISTER_SLAVE: u8 = 0x15;
const COM_BINLOG_DUMP_GTID: u8 = 0x1e;

#[derive(Debug, Clone)]
pub struct ConnectionDetails {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub server_id: u32,
    pub connect_timeout: Duration,
    pub net_timeout: Duration,
}

pub struct Connection {
    stream: TcpStream,
    seq: u8,
    server_version: String,
    last_error: Option<String>,
}

fn read_packet(stream: &mut TcpStream, seq: &mut u8) -> Result<Vec<u8>> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header)?;
    let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
    *seq = header[3].wrapping_add(1);
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    Ok(body)
}

fn write_packet(stream: &mut TcpStream, seq: &mut u8, body: &[u8]) -> Result<()> {
    let mut packet = Vec::with_capacity(4 + body.len());
    let len = body.len() as u32;
    packet.extend_from_slice(&len.to_le_bytes()[0..3]);
    packet.push(*seq);
    packet.extend_from_slice(body);
    stream.write_all(&packet)?;
    *seq = seq.wrapping_add(1);
    Ok(())
}

fn null_terminated(buf: &[u8]) -> (&[u8], &[u8]) {
    match buf.iter().position(|&b| b == 0) {
        Some(pos) => (&buf[..pos], &buf[pos + 1..]),
        None => (buf, &[]),
    }
}

impl Connection {
    /// Opens the TCP socket, performs the protocol-41 handshake with
    /// `mysql_native_password`, and returns a ready-to-query connection.
    pub fn connect(details: &ConnectionDetails) -> Result<Self> {
        let stream = TcpStream::connect((details.host.as_str(), details.port))
            .map_err(|e| PinlokiError::database(2003, format!("cannot connect to {}:{}: {e}", details.host, details.port)))?;
        stream.set_nodelay(true).ok();
        stream.set_read_timeout(Some(details.net_timeout)).ok();
        stream.set_write_timeout(Some(details.net_timeout)).ok();

        let mut stream = stream;
        let mut seq = 0u8;
        let handshake = read_packet(&mut stream, &mut seq)?;
        if handshake.first() == Some(&0xff) {
            return Err(database_error_from_packet(&handshake));
        }

        let (server_version, rest) = null_terminated(&handshake[1..]);
        let server_version = String::from_utf8_lossy(server_version).into_owned();
        if rest.len() < 4 + 8 + 1 + 2 {
            return Err(PinlokiError::database(2027, "malformed handshake packet"));
        }
        let mut seed = rest[4..12].to_vec();
        let after_seed1 = &rest[12 + 1 + 2..];
        if after_seed1.len() >= 1 + 2 + 1 + 10 {
            let auth_data_len = after_seed1[3].max(13) as usize;
            let part2_len = (auth_data_len.saturating_sub(8)).max(13 - 8);
            let part2_start = 1 + 2 + 1 + 10;
            if after_seed1.len() >= part2_start + part2_len {
                let part2 = &after_seed1[part2_start..part2_start + part2_len];
                let (part2, _) = null_terminated(part2);
                seed.extend_from_slice(part2);
            }
        }

        let scrambled = if details.password.is_empty() {
            Vec::new()
        } else {
            crate::utils::mysql_password_encrypted::scramble411(details.password.as_bytes(), &seed).to_vec()
        };

        let mut response = Vec::new();
        let client_flags = CLIENT_LONG_PASSWORD | CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION | CLIENT_PLUGIN_AUTH;
        response.extend_from_slice(&client_flags.to_le_bytes());
        response.extend_from_slice(&(16 * 1024 * 1024u32).to_le_bytes());
        response.push(33); // utf8_general_ci
        response.extend_from_slice(&[0u8; 23]);
        response.extend_from_slice(details.user.as_bytes());
        response.push(0);
        response.push(scrambled.len() as u8);
        response.extend_from_slice(&scrambled);
        response.extend_from_slice(b"mysql_native_password");
        response.push(0);

        write_packet(&mut stream, &mut seq, &response)?;
        let reply = read_packet(&mut stream, &mut seq)?;
        match reply.first() {
            Some(0x00) => {}
            Some(0xff) => return Err(database_error_from_packet(&reply)),
            _ => return Err(PinlokiError::database(2027, "unexpected auth response")),
        }

        Ok(Connection { stream, seq, server_version, last_error: None })
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn mariadb_error_str(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Sends a statement and consumes its response, expecting either an OK
    /// packet or an error; used for the `SET @...` session-variable sequence
    /// that precedes replication registration, not for statements that
    /// return a result set.
    pub fn query(&mut self, sql: &str) -> Result<()> {
        let mut body = vec![COM_QUERY];
        body.extend_from_slice(sql.as_bytes());
        write_packet(&mut self.stream, &mut self.seq, &body)?;

        let reply = read_packet(&mut self.stream, &mut self.seq)?;
        match reply.first() {
            Some(0x00) => Ok(()),
            Some(0xff) => {
                let err = database_error_from_packet(&reply);
                self.last_error = Some(err.to_string());
                Err(err)
            }
            _ => {
                // A result-set header; drain rows/EOF so the connection stays
                // in sync, discarding the content (pinloki never queries for
                // data, only issues session-variable SETs and `SHOW`s it
                // ignores the result of).
                self.drain_result_set()?;
                Ok(())
            }
        }
    }

    fn drain_result_set(&mut self) -> Result<()> {
        loop {
            let packet = read_packet(&mut self.stream, &mut self.seq)?;
            if packet.first() == Some(&0xfe) && packet.len() < 9 {
                break;
            }
        }
        loop {
            let packet = read_packet(&mut self.stream, &mut self.seq)?;
            if packet.first() == Some(&0xfe) && packet.len() < 9 {
                break;
            }
        }
        Ok(())
    }

    fn register_slave(&mut self, server_id: u32, report_host: &str) -> Result<()> {
        let mut body = vec![COM_REGISTER_SLAVE];
        body.extend_from_slice(&server_id.to_le_bytes());
        body.push(report_host.len() as u8);
        body.extend_from_slice(report_host.as_bytes());
        body.push(0); // report_user
        body.push(0); // report_password
        body.extend_from_slice(&0u16.to_le_bytes()); // report_port
        body.extend_from_slice(&0u32.to_le_bytes()); // replication rank
        body.extend_from_slice(&0u32.to_le_bytes()); // master id

        write_packet(&mut self.stream, &mut self.seq, &body)?;
        let reply = read_packet(&mut self.stream, &mut self.seq)?;
        if reply.first() == Some(&0xff) {
            return Err(database_error_from_packet(&reply));
        }
        Ok(())
    }

    /// Replays the session-variable sequence from `dbconnection.cc`
    /// (`@master_heartbeat_period`, `@master_binlog_checksum`,
    /// `@mariadb_slave_capability`, `@slave_connect_state`,
    /// `@slave_gtid_strict_mode`, `@slave_gtid_ignore_duplicates`,
    /// `NAMES latin1`), registers as a replica, and issues
    /// `COM_BINLOG_DUMP_GTID`.
    pub fn start_replication(&mut self, server_id: u32, semi_sync: bool, gtid: &GtidList) -> Result<()> {
        self.query("SET @master_heartbeat_period=1000000000")?;
        self.query("SET @master_binlog_checksum=@@global.binlog_checksum")?;
        self.query("SET @mariadb_slave_capability=4")?;
        self.query(&format!("SET @slave_connect_state='{gtid}'"))?;
        self.query("SET @slave_gtid_strict_mode=1")?;
        self.query("SET @slave_gtid_ignore_duplicates=1")?;
        self.query("SET NAMES latin1")?;
        if semi_sync {
            self.query("SET @rpl_semi_sync_slave=1")?;
        }

        self.register_slave(server_id, "")?;

        let mut body = vec![COM_BINLOG_DUMP_GTID];
        body.extend_from_slice(&0u16.to_le_bytes()); // flags
        body.extend_from_slice(&server_id.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes()); // filename length, unused with GTID dump
        body.extend_from_slice(&0u64.to_le_bytes()); // start position, unused with GTID dump
        let encoded_gtid = gtid.to_string();
        body.extend_from_slice(&(encoded_gtid.len() as u32).to_le_bytes());
        body.extend_from_slice(encoded_gtid.as_bytes());

        write_packet(&mut self.stream, &mut self.seq, &body)
    }

    /// Reads one replication-stream packet: `Ok(Some(event))` for a binlog
    /// event, `Ok(None)` for a benign EOF marker (end of a non-semi-sync
    /// dump), `Err` for a network failure or an ERR packet from the master.
    pub fn get_rpl_msg(&mut self) -> Result<Option<Event>> {
        let packet = read_packet(&mut self.stream, &mut self.seq)?;
        match packet.first() {
            Some(0x00) => Ok(Some(codec::parse_event(&packet[1..])?)),
            Some(0xfe) if packet.len() < 9 => Ok(None),
            Some(0xff) => {
                let err = database_error_from_packet(&packet);
                self.last_error = Some(err.to_string());
                Err(err)
            }
            _ => Err(PinlokiError::database(2027, "unexpected packet in replication stream")),
        }
    }
}

fn database_error_from_packet(packet: &[u8]) -> PinlokiError {
    if packet.len() < 3 {
        return PinlokiError::database(2027, "malformed error packet");
    }
    let code = u16::from_le_bytes([packet[1], packet[2]]) as i32;
    let message_start = if packet.len() > 3 && packet[3] == b'#' { 9 } else { 3 };
    let message = String::from_utf8_lossy(&packet[message_start.min(packet.len())..]).into_owned();
    PinlokiError::database(code, message)
}

/// MySQL error codes for "server gone away" / "lost connection" — used to
/// decide whether a failed query should trigger the writer's reconnect loop.
pub fn is_connection_lost(err: &PinlokiError) -> bool {
    matches!(err, PinlokiError::Database { code, .. } if *code == 2006 || *code == 2013)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_terminated_splits_on_first_nul() {
        let (head, tail) = null_terminated(b"abc\0def");
        assert_eq!(head, b"abc");
        assert_eq!(tail, b"def");
    }

    #[test]
    fn database_error_parses_sqlstate_prefixed_message() {
        let mut packet = vec![0xffu8, 0x10, 0x04];
        packet.extend_from_slice(b"#08S01Connection lost");
        let err = database_error_from_packet(&packet);
        match err {
            PinlokiError::Database { code, message } => {
                assert_eq!(code, 0x0410);
                assert_eq!(message, "Connection lost");
            }
            _ => panic!("expected Database error"),
        }
    }

    #[test]
    fn is_connection_lost_matches_known_codes() {
        assert!(is_connection_lost(&PinlokiError::database(2006, "gone away")));
        assert!(is_connection_lost(&PinlokiError::database(2013, "lost connection")));
        assert!(!is_connection_lost(&PinlokiError::database(1064, "syntax error")));
    }
}
