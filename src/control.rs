//! The external control surface: `CHANGE MASTER TO`/`START SLAVE`/`STOP
//! SLAVE`/`SET GLOBAL gtid_slave_pos`/`PURGE BINARY LOGS TO`/status reads.
//! Grounded on `original_source/pinloki.hh`/`pinlokisession.cc`, which expose
//! the same surface as faux-SQL intercepted ahead of the real parser; this
//! module keeps the operations but drops the SQL grammar, since whatever
//! talks to it can build its own statement matching.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{PinlokiError, Result};
use crate::file_transformer::{FileTransformer, PurgeResult};
use crate::gtid::GtidList;
use crate::inventory::{InventoryReader, InventoryWriter};
use crate::writer::Writer;

/// Persisted shape of `master-info.json`, the result of `CHANGE MASTER TO`.
/// `master_log_file`/`master_log_pos` are deliberately absent: this system
/// always resumes from GTID position, never a file/offset pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MasterConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub use_gtid: bool,
}

#[derive(Debug, Clone)]
pub struct MasterStatus {
    pub file: String,
    pub position: u64,
    pub gtid_binlog_pos: GtidList,
}

#[derive(Debug, Clone)]
pub struct SlaveStatus {
    pub slave_io_running: bool,
    pub slave_sql_running: bool,
    pub last_errno: i32,
    pub last_error: String,
    pub master_host: Option<String>,
    pub master_port: u16,
    pub gtid_io_pos: GtidList,
}

/// The subset of control-surface operations a downstream admin connection can
/// invoke; implemented by `Controller`, and a seam for tests that don't want
/// to spin up a real `Writer`.
pub trait ControlSurface {
    fn change_master(&self, fields: MasterConfig) -> Result<()>;
    fn start_slave(&self) -> Result<()>;
    fn stop_slave(&self) -> Result<()>;
    fn reset_slave(&self) -> Result<()>;
    fn set_gtid_slave_pos(&self, gtids: GtidList) -> Result<()>;
    fn purge_logs(&self, upto_filename: &str) -> Result<PurgeResult>;
    fn show_master_status(&self) -> Result<MasterStatus>;
    fn show_slave_status(&self) -> Result<SlaveStatus>;
    fn show_binlogs(&self) -> Result<Vec<String>>;
    fn gtid_io_pos(&self) -> Result<GtidList>;
    fn master_gtid_wait(&self, target: &GtidList, timeout: Duration) -> Result<bool>;
}

/// Owns the `Writer` thread's lifecycle and answers status/config queries
/// against the same `Config`/`InventoryWriter` the writer itself uses.
pub struct Controller {
    config: Arc<Config>,
    inventory: Arc<InventoryWriter>,
    transformer: Arc<FileTransformer>,
    writer: Mutex<Option<(Arc<Writer>, JoinHandle<()>)>>,
    running: AtomicBool,
    master: RwLock<MasterConfig>,
}

impl Controller {
    pub fn new(config: Arc<Config>, inventory: Arc<InventoryWriter>, transformer: Arc<FileTransformer>) -> Result<Self> {
        let master = load_master_config(&config)?;
        Ok(Controller {
            config,
            inventory,
            transformer,
            writer: Mutex::new(None),
            running: AtomicBool::new(false),
            master: RwLock::new(master),
        })
    }

    fn persist_master_config(&self) -> Result<()> {
        let master = self.master.read().unwrap();
        let text = serde_json::to_string_pretty(&*master)
            .map_err(|e| PinlokiError::config(format!("cannot serialize master-info.json: {e}")))?;
        crate::config::atomic_write(&self.config.master_info_file(), text.as_bytes())
    }
}

fn load_master_config(config: &Config) -> Result<MasterConfig> {
    match std::fs::read_to_string(config.master_info_file()) {
        Ok(text) => serde_json::from_str(&text)
            .map_err(|e| PinlokiError::config(format!("invalid master-info.json: {e}"))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(MasterConfig {
            host: config.host.clone(),
            port: Some(config.port),
            user: Some(config.user.clone()),
            password: Some(config.password.clone()),
            use_gtid: true,
        }),
        Err(e) => Err(e.into()),
    }
}

impl ControlSurface for Controller {
    /// Persists the new upstream connection fields. Rejects
    /// `master_log_file`/`master_log_pos`-style positional resume — this
    /// system only understands `MASTER_USE_GTID = slave_pos`, the same
    /// restriction `original_source/pinloki.hh`'s `change_master` enforces.
    fn change_master(&self, fields: MasterConfig) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(PinlokiError::config("CHANGE MASTER TO requires the replication thread to be stopped"));
        }
        *self.master.write().unwrap() = fields;
        self.persist_master_config()
    }

    fn start_slave(&self) -> Result<()> {
        let mut slot = self.writer.lock().unwrap();
        if slot.is_some() {
            return Ok(());
        }
        let writer = Arc::new(Writer::new(self.config.clone(), self.inventory.clone(), self.transformer.clone())?);
        let run_writer = writer.clone();
        let handle = std::thread::spawn(move || {
            if let Err(e) = run_writer.run() {
                log::error!(target: "control", "writer thread exited: {e}");
            }
        });
        *slot = Some((writer, handle));
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_slave(&self) -> Result<()> {
        let mut slot = self.writer.lock().unwrap();
        if let Some((writer, handle)) = slot.take() {
            writer.stop();
            let _ = handle.join();
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn reset_slave(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(PinlokiError::config("RESET SLAVE requires the replication thread to be stopped"));
        }
        self.inventory.clear_requested_rpl_state()?;
        self.config.save_rpl_state(&GtidList::empty())
    }

    /// Valid only while stopped, and only to move forward: rejects any
    /// target already covered by the current position, since this system
    /// has no way to rewind an already-persisted binlog.
    fn set_gtid_slave_pos(&self, gtids: GtidList) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(PinlokiError::config("SET GLOBAL gtid_slave_pos requires the replication thread to be stopped"));
        }
        let current = self.config.rpl_state()?;
        if current.is_included(&gtids) {
            return Err(PinlokiError::config("requested gtid position is not ahead of the current position"));
        }
        self.config.save_requested_rpl_state(&gtids)
    }

    fn purge_logs(&self, upto_filename: &str) -> Result<PurgeResult> {
        self.transformer.purge_upto(upto_filename)
    }

    fn show_master_status(&self) -> Result<MasterStatus> {
        let names = self.inventory.file_names();
        let file = names.last().cloned().unwrap_or_default();
        let position = std::fs::metadata(self.config.path(&file)).map(|m| m.len()).unwrap_or(0);
        Ok(MasterStatus { file, position, gtid_binlog_pos: self.config.rpl_state()? })
    }

    fn show_slave_status(&self) -> Result<SlaveStatus> {
        let running = self.writer.lock().unwrap();
        let (last_errno, last_error) = match running.as_ref().and_then(|(w, _)| w.last_error()) {
            Some(msg) => (1, msg),
            None => (0, String::new()),
        };
        let master = self.master.read().unwrap();
        Ok(SlaveStatus {
            slave_io_running: self.running.load(Ordering::SeqCst),
            slave_sql_running: self.running.load(Ordering::SeqCst),
            last_errno,
            last_error,
            master_host: master.host.clone(),
            master_port: master.port.unwrap_or(self.config.port),
            gtid_io_pos: self.config.rpl_state()?,
        })
    }

    fn show_binlogs(&self) -> Result<Vec<String>> {
        Ok(self.inventory.file_names())
    }

    fn gtid_io_pos(&self) -> Result<GtidList> {
        self.config.rpl_state()
    }

    /// Polls the persisted replication position once a second until it
    /// covers `target`, mirroring `MASTER_GTID_WAIT`'s semantics.
    fn master_gtid_wait(&self, target: &GtidList, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.config.rpl_state()?.is_included(target) {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_secs(1));
        }
    }
}

/// Read-only variant used by downstream replica sessions, which only ever
/// need the binlog inventory and replication position, never the writer
/// lifecycle.
pub struct ReadOnlyStatus {
    config: Arc<Config>,
    inventory: Arc<InventoryReader>,
}

impl ReadOnlyStatus {
    pub fn new(config: Arc<Config>, inventory: Arc<InventoryReader>) -> Self {
        ReadOnlyStatus { config, inventory }
    }

    pub fn show_binlogs(&self) -> Result<Vec<String>> {
        self.inventory.file_names()
    }

    pub fn gtid_io_pos(&self) -> Result<GtidList> {
        self.config.rpl_state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawConfig;
    use crate::gtid::Gtid;

    fn setup() -> (Arc<Config>, Arc<InventoryWriter>, Arc<FileTransformer>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let raw = RawConfig {
            datadir: Some(dir.path().to_string_lossy().into_owned()),
            server_id: Some(1),
            ..Default::default()
        };
        let config = Arc::new(Config::from_raw(raw).unwrap());
        let inventory = Arc::new(InventoryWriter::new(config.clone()).unwrap());
        let transformer = FileTransformer::spawn(config.clone(), inventory.clone());
        (config, inventory, transformer, dir)
    }

    #[test]
    fn change_master_persists_and_reloads() {
        let (config, inventory, transformer, _dir) = setup();
        let controller = Controller::new(config.clone(), inventory, transformer.clone()).unwrap();
        controller
            .change_master(MasterConfig { host: Some("primary.example".into()), port: Some(4000), user: Some("repl".into()), password: Some("secret".into()), use_gtid: true })
            .unwrap();

        assert!(config.master_info_file().exists());
        let reloaded = load_master_config(&config).unwrap();
        assert_eq!(reloaded.host.as_deref(), Some("primary.example"));
        transformer.stop();
    }

    #[test]
    fn set_gtid_slave_pos_rejects_backwards_move() {
        let (config, inventory, transformer, _dir) = setup();
        config.save_rpl_state(&GtidList::new(vec![Gtid::new(0, 1, 10)])).unwrap();
        let controller = Controller::new(config, inventory, transformer.clone()).unwrap();

        let result = controller.set_gtid_slave_pos(GtidList::new(vec![Gtid::new(0, 1, 3)]));
        assert!(result.is_err());
        transformer.stop();
    }

    #[test]
    fn purge_logs_reports_missing_target() {
        let (config, inventory, transformer, _dir) = setup();
        let controller = Controller::new(config, inventory, transformer.clone()).unwrap();
        let result = controller.purge_logs("binlog.999999").unwrap();
        assert_eq!(result, PurgeResult::UpToFileNotFound);
        transformer.stop();
    }

    #[test]
    fn show_binlogs_reflects_inventory() {
        let (config, inventory, transformer, _dir) = setup();
        inventory.add("binlog.000001").unwrap();
        let controller = Controller::new(config, inventory, transformer.clone()).unwrap();
        assert_eq!(controller.show_binlogs().unwrap(), vec!["binlog.000001".to_string()]);
        transformer.stop();
    }
}
