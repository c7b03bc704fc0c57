//! The upstream-ingestion loop: connects to the configured primary,
//! registers as a replica, and persists every event it receives into the
//! local binlog, tracking GTID/commit boundaries and reconnecting on
//! transient failures. Grounded on `original_source/writer.hh`/`.cc`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::Config;
use crate::dbconnection::{self, Connection, ConnectionDetails};
use crate::error::{PinlokiError, RateLimiter, Result};
use crate::event::types;
use crate::event::{codec, Event};
use crate::file_transformer::FileTransformer;
use crate::file_writer::FileWriter;
use crate::gtid::GtidList;
use crate::inventory::InventoryWriter;

pub struct Writer {
    config: Arc<Config>,
    inventory: Arc<InventoryWriter>,
    file_writer: FileWriter,
    current_gtid_list: Mutex<GtidList>,
    running: AtomicBool,
    error_limiter: RateLimiter,
    last_error: Mutex<Option<String>>,
    in_txn: AtomicBool,
    current_txn_is_ddl: AtomicBool,
    ddl_only: bool,
}

impl Writer {
    pub fn new(config: Arc<Config>, inventory: Arc<InventoryWriter>, transformer: Arc<FileTransformer>) -> Result<Self> {
        let starting_gtid = match inventory.requested_rpl_state()? {
            Some(g) => g,
            None => config.rpl_state()?,
        };
        let file_writer = FileWriter::open(config.clone(), inventory.clone(), transformer, config.server_id)?;
        let ddl_only = config.ddl_only;
        Ok(Writer {
            config,
            inventory,
            file_writer,
            current_gtid_list: Mutex::new(starting_gtid),
            running: AtomicBool::new(true),
            error_limiter: RateLimiter::new(Duration::from_secs(10)),
            last_error: Mutex::new(None),
            in_txn: AtomicBool::new(false),
            current_txn_is_ddl: AtomicBool::new(false),
            ddl_only,
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }

    pub fn current_gtid_list(&self) -> GtidList {
        self.current_gtid_list.lock().unwrap().clone()
    }

    /// Runs until `stop()` is called or a fatal (non-recoverable) error is
    /// hit, reconnecting after every recoverable database/network error.
    pub fn run(&self) -> Result<()> {
        while self.running.load(Ordering::SeqCst) {
            match self.connect_and_replicate() {
                Ok(()) => {}
                Err(e) if is_fatal(&e) => {
                    *self.last_error.lock().unwrap() = Some(e.to_string());
                    self.inventory.set_is_writer_connected(false);
                    return Err(e);
                }
                Err(e) => {
                    *self.last_error.lock().unwrap() = Some(e.to_string());
                    self.inventory.set_is_writer_connected(false);
                    if self.error_limiter.alarm() {
                        log::warn!(target: "writer", "replication connection failed, retrying: {e}");
                    }
                    std::thread::sleep(self.config.connect_retry_timeout);
                }
            }
        }
        Ok(())
    }

    fn connect_and_replicate(&self) -> Result<()> {
        let host = self.config.host.clone().ok_or_else(|| PinlokiError::config("no upstream host configured"))?;
        let details = ConnectionDetails {
            host,
            port: self.config.port,
            user: self.config.user.clone(),
            password: self.config.password.clone(),
            server_id: self.config.server_id,
            connect_timeout: self.config.connect_retry_timeout,
            net_timeout: self.config.net_timeout,
        };

        let mut conn = Connection::connect(&details)?;
        let gtid = self.current_gtid_list();
        conn.start_replication(self.config.server_id, self.config.semi_sync, &gtid)?;
        self.inventory.set_is_writer_connected(true);
        self.inventory.set_master_id(self.config.server_id);
        log::info!(target: "writer", "connected to {}:{}, server version {}", details.host, details.port, conn.server_version());

        while self.running.load(Ordering::SeqCst) {
            match conn.get_rpl_msg() {
                Ok(Some(ev)) => self.handle_event(ev)?,
                Ok(None) => continue,
                Err(e) if dbconnection::is_connection_lost(&e) => return Err(e),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn handle_event(&self, ev: Event) -> Result<()> {
        match ev.event_type() {
            types::HEARTBEAT_LOG_EVENT => Ok(()),
            types::FORMAT_DESCRIPTION_EVENT => Ok(()),
            types::ROTATE_EVENT if !ev.header.is_artificial() => {
                let gtid = self.current_gtid_list();
                self.file_writer.perform_rotate(&gtid)
            }
            types::ROTATE_EVENT => Ok(()),
            types::GTID_EVENT => {
                self.file_writer.begin_txn();
                self.in_txn.store(true, Ordering::SeqCst);
                let body = codec::gtid_event_body(&ev, self.config.server_id, true)?;
                self.current_txn_is_ddl.store(body.flags & types::GTID_FLAG_DDL != 0, Ordering::SeqCst);
                self.current_gtid_list.lock().unwrap().replace(body.gtid);
                self.file_writer.add_event(ev)?;
                if body.flags & types::GTID_FLAG_STANDALONE != 0 {
                    self.commit_current_txn()?;
                }
                Ok(())
            }
            types::XID_EVENT => {
                self.file_writer.add_event(ev)?;
                self.commit_current_txn()
            }
            types::QUERY_EVENT | types::QUERY_COMPRESSED_EVENT => {
                let is_commit = codec::query_is_commit(&ev);
                if self.ddl_only && !is_commit && !self.current_txn_is_ddl.load(Ordering::SeqCst) {
                    return Ok(());
                }
                self.file_writer.add_event(ev)?;
                if is_commit {
                    self.commit_current_txn()?;
                }
                Ok(())
            }
            t if types::is_row_or_table_event(t) => {
                if self.ddl_only {
                    return Ok(());
                }
                self.file_writer.add_event(ev)
            }
            _ => self.file_writer.add_event(ev),
        }
    }

    fn commit_current_txn(&self) -> Result<()> {
        if self.in_txn.swap(false, Ordering::SeqCst) {
            let gtid = self.current_gtid_list();
            self.file_writer.commit_txn(&gtid)?;
        }
        Ok(())
    }
}

fn is_fatal(e: &PinlokiError) -> bool {
    matches!(e, PinlokiError::Encryption(_))
}
