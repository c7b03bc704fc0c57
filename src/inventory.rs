//! The `binlog.index` inventory: the ordered list of binlog file names that
//! currently exist on disk, plus the small bits of writer-side state that
//! readers need to observe (is the writer connected right now, what is its
//! upstream server id). Grounded on `original_source/inventory.hh`/`.cc`.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{atomic_write, Config};
use crate::error::Result;

fn read_index(path: &Path) -> Result<Vec<String>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(text.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

fn write_index(path: &Path, names: &[String]) -> Result<()> {
    let mut text = names.join("\n");
    if !names.is_empty() {
        text.push('\n');
    }
    atomic_write(path, text.as_bytes())
}

/// Owned by the writer thread: the only component that adds or removes
/// entries from `binlog.index`.
pub struct InventoryWriter {
    config: Arc<Config>,
    file_names: Mutex<Vec<String>>,
    master_id: Mutex<Option<u32>>,
    is_writer_connected: Mutex<bool>,
}

impl InventoryWriter {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let file_names = read_index(&config.inventory_file_path())?;
        Ok(InventoryWriter {
            config,
            file_names: Mutex::new(file_names),
            master_id: Mutex::new(None),
            is_writer_connected: Mutex::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn file_names(&self) -> Vec<String> {
        self.file_names.lock().clone()
    }

    pub fn add(&self, name: impl Into<String>) -> Result<()> {
        let mut names = self.file_names.lock();
        names.push(name.into());
        write_index(&self.config.inventory_file_path(), &names)
    }

    /// Replaces the whole inventory, used after a purge removes a prefix of
    /// files.
    pub fn set_file_names(&self, names: Vec<String>) -> Result<()> {
        write_index(&self.config.inventory_file_path(), &names)?;
        *self.file_names.lock() = names;
        Ok(())
    }

    pub fn master_id(&self) -> Option<u32> {
        *self.master_id.lock()
    }

    pub fn set_master_id(&self, id: u32) {
        *self.master_id.lock() = Some(id);
    }

    pub fn is_writer_connected(&self) -> bool {
        *self.is_writer_connected.lock()
    }

    pub fn set_is_writer_connected(&self, connected: bool) {
        *self.is_writer_connected.lock() = connected;
    }

    pub fn requested_rpl_state(&self) -> Result<Option<crate::gtid::GtidList>> {
        self.config.requested_rpl_state()
    }

    pub fn clear_requested_rpl_state(&self) -> Result<()> {
        self.config.clear_requested_rpl_state()
    }
}

/// Owned by reader sessions: read-only view of the same inventory, always
/// re-read from disk since readers run on separate threads from the writer.
pub struct InventoryReader {
    config: Arc<Config>,
}

impl InventoryReader {
    pub fn new(config: Arc<Config>) -> Self {
        InventoryReader { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn file_names(&self) -> Result<Vec<String>> {
        read_index(&self.config.inventory_file_path())
    }
}

pub fn first_string(names: &[String]) -> Option<&str> {
    names.first().map(String::as_str)
}

pub fn last_string(names: &[String]) -> Option<&str> {
    names.last().map(String::as_str)
}

/// The entry immediately after `current` in `names`, or `None` if `current`
/// is the last (or not present).
pub fn next_string<'a>(names: &'a [String], current: &str) -> Option<&'a str> {
    let idx = names.iter().position(|n| n == current)?;
    names.get(idx + 1).map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawConfig;

    fn test_config() -> Arc<Config> {
        let dir = tempfile::tempdir().unwrap();
        let raw = RawConfig {
            datadir: Some(dir.path().to_string_lossy().into_owned()),
            server_id: Some(1),
            ..Default::default()
        };
        Arc::new(Config::from_raw(raw).unwrap())
    }

    #[test]
    fn writer_persists_across_reload() {
        let config = test_config();
        let writer = InventoryWriter::new(config.clone()).unwrap();
        writer.add("binlog.000001").unwrap();
        writer.add("binlog.000002").unwrap();

        let reloaded = InventoryWriter::new(config.clone()).unwrap();
        assert_eq!(reloaded.file_names(), vec!["binlog.000001", "binlog.000002"]);
    }

    #[test]
    fn reader_sees_writer_updates() {
        let config = test_config();
        let writer = InventoryWriter::new(config.clone()).unwrap();
        let reader = InventoryReader::new(config);

        assert!(reader.file_names().unwrap().is_empty());
        writer.add("binlog.000001").unwrap();
        assert_eq!(reader.file_names().unwrap(), vec!["binlog.000001".to_string()]);
    }

    #[test]
    fn next_first_last_helpers() {
        let names = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(first_string(&names), Some("a"));
        assert_eq!(last_string(&names), Some("c"));
        assert_eq!(next_string(&names, "a"), Some("b"));
        assert_eq!(next_string(&names, "c"), None);
        assert_eq!(next_string(&names, "z"), None);
    }

    #[test]
    fn connection_flags_roundtrip() {
        let writer = InventoryWriter::new(test_config()).unwrap();
        assert!(!writer.is_writer_connected());
        writer.set_is_writer_connected(true);
        assert!(writer.is_writer_connected());
        writer.set_master_id(42);
        assert_eq!(writer.master_id(), Some(42));
    }
}
