//! Configuration loading and validation, grounded on
//! `original_source/config.hh`'s key set and defaults (`heartbeat_interval =
//! 300s`, `connect_retry_timeout = 60s`, `net_timeout = 10s`, default
//! service user/password placeholders, `gen_uuid()` for `server_uuid`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::encrypt::AesMode;
use crate::error::{PinlokiError, Result};
use crate::gtid::GtidList;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpirationMode {
    Purge,
    Archive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionAlgorithm {
    None,
    Zstandard,
}

/// Raw, serde-deserialized shape of the TOML config file. Every field is
/// optional so a minimal file (just `datadir` and `server_id`) is valid; the
/// rest fall back to the defaults in `Config::from_raw`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub datadir: Option<String>,
    pub server_id: Option<u32>,
    pub server_uuid: Option<String>,
    pub net_timeout_secs: Option<u64>,
    pub select_master: Option<bool>,
    pub ddl_only: Option<bool>,
    pub encryption_key_id: Option<String>,
    pub encryption_cipher: Option<String>,
    pub expiration_mode: Option<ExpirationMode>,
    pub archivedir: Option<String>,
    pub expire_log_minimum_files: Option<u32>,
    pub expire_log_duration_secs: Option<u64>,
    pub compression_algorithm: Option<CompressionAlgorithm>,
    pub number_of_noncompressed_files: Option<u32>,
    pub rpl_semi_sync_slave_enabled: Option<bool>,
    pub heartbeat_interval_secs: Option<u64>,
    pub connect_retry_timeout_secs: Option<u64>,
    pub purge_startup_delay_secs: Option<u64>,
    pub purge_poll_timeout_secs: Option<u64>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub datadir: PathBuf,
    pub server_id: u32,
    pub server_uuid: String,
    pub net_timeout: Duration,
    pub select_master: bool,
    pub ddl_only: bool,
    pub encryption_key_id: Option<String>,
    pub encryption_cipher: Option<AesMode>,
    pub expiration_mode: ExpirationMode,
    pub archivedir: Option<PathBuf>,
    pub expire_log_minimum_files: u32,
    pub expire_log_duration: Duration,
    pub compression_algorithm: CompressionAlgorithm,
    pub number_of_noncompressed_files: u32,
    pub semi_sync: bool,
    pub heartbeat_interval: Duration,
    pub connect_retry_timeout: Duration,
    pub purge_startup_delay: Duration,
    pub purge_poll_timeout: Duration,
    pub host: Option<String>,
    pub port: u16,
    pub user: String,
    pub password: String,
}

const BASE_NAME: &str = "binlog";
const INVENTORY_FILE: &str = "binlog.index";
const GTID_FILE: &str = "rpl_state";
const REQUESTED_GTID_FILE: &str = "requested_rpl_state";
const MASTER_INFO_FILE: &str = "master-info.json";
const COMPRESSION_DIR: &str = "compression";

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let text = fs::read_to_string(path)
            .map_err(|e| PinlokiError::config(format!("cannot read config file {}: {e}", path.display())))?;
        let raw: RawConfig = toml::from_str(&text)
            .map_err(|e| PinlokiError::config(format!("invalid config file {}: {e}", path.display())))?;
        Config::from_raw(raw)
    }

    pub fn from_raw(raw: RawConfig) -> Result<Config> {
        let datadir = PathBuf::from(
            raw.datadir.ok_or_else(|| PinlokiError::config("missing required key 'datadir'"))?,
        );
        let server_id = raw.server_id.ok_or_else(|| PinlokiError::config("missing required key 'server_id'"))?;

        let encryption_cipher = raw
            .encryption_cipher
            .as_deref()
            .map(AesMode::from_str)
            .transpose()?;
        if raw.encryption_key_id.is_some() && encryption_cipher.is_none() {
            return Err(PinlokiError::config("encryption_key_id set without encryption_cipher"));
        }

        let expiration_mode = raw.expiration_mode.unwrap_or(ExpirationMode::Purge);
        let archivedir = raw.archivedir.map(PathBuf::from);
        if expiration_mode == ExpirationMode::Archive && archivedir.is_none() {
            return Err(PinlokiError::config("expiration_mode = archive requires archivedir"));
        }

        let expire_log_minimum_files = raw.expire_log_minimum_files.unwrap_or(2);
        if expire_log_minimum_files == 0 {
            return Err(PinlokiError::config("expire_log_minimum_files must be at least 1"));
        }

        let cfg = Config {
            datadir,
            server_id,
            server_uuid: raw.server_uuid.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            net_timeout: Duration::from_secs(raw.net_timeout_secs.unwrap_or(10)),
            select_master: raw.select_master.unwrap_or(false),
            ddl_only: raw.ddl_only.unwrap_or(false),
            encryption_key_id: raw.encryption_key_id,
            encryption_cipher,
            expiration_mode,
            archivedir,
            expire_log_minimum_files,
            expire_log_duration: Duration::from_secs(raw.expire_log_duration_secs.unwrap_or(0)),
            compression_algorithm: raw.compression_algorithm.unwrap_or(CompressionAlgorithm::None),
            number_of_noncompressed_files: raw.number_of_noncompressed_files.unwrap_or(2),
            semi_sync: raw.rpl_semi_sync_slave_enabled.unwrap_or(false),
            heartbeat_interval: Duration::from_secs(raw.heartbeat_interval_secs.unwrap_or(300)),
            connect_retry_timeout: Duration::from_secs(raw.connect_retry_timeout_secs.unwrap_or(60)),
            purge_startup_delay: Duration::from_secs(raw.purge_startup_delay_secs.unwrap_or(60)),
            purge_poll_timeout: Duration::from_secs(raw.purge_poll_timeout_secs.unwrap_or(60)),
            host: raw.host,
            port: raw.port.unwrap_or(3306),
            user: raw.user.unwrap_or_else(|| "maxskysql".to_string()),
            password: raw.password.unwrap_or_default(),
        };

        fs::create_dir_all(&cfg.datadir)
            .map_err(|e| PinlokiError::config(format!("cannot create datadir {}: {e}", cfg.datadir.display())))?;
        fs::create_dir_all(cfg.compression_dir())
            .map_err(|e| PinlokiError::config(format!("cannot create compression dir: {e}")))?;
        if let Some(dir) = &cfg.archivedir {
            fs::create_dir_all(dir).map_err(|e| PinlokiError::config(format!("cannot create archivedir: {e}")))?;
        }

        Ok(cfg)
    }

    pub fn base_name(&self) -> &str {
        BASE_NAME
    }

    /// Prefixes `name` with `datadir/`, unless `name` is already absolute.
    pub fn path(&self, name: &str) -> PathBuf {
        let p = Path::new(name);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.datadir.join(name)
        }
    }

    pub fn compression_dir(&self) -> PathBuf {
        self.datadir.join(COMPRESSION_DIR)
    }

    pub fn inventory_file_path(&self) -> PathBuf {
        self.datadir.join(INVENTORY_FILE)
    }

    pub fn gtid_file_path(&self) -> PathBuf {
        self.datadir.join(GTID_FILE)
    }

    pub fn requested_gtid_file_path(&self) -> PathBuf {
        self.datadir.join(REQUESTED_GTID_FILE)
    }

    pub fn master_info_file(&self) -> PathBuf {
        self.datadir.join(MASTER_INFO_FILE)
    }

    /// Reads the persisted replication state, or an empty list if the file
    /// doesn't exist yet (fresh data dir).
    pub fn rpl_state(&self) -> Result<GtidList> {
        match fs::read_to_string(self.gtid_file_path()) {
            Ok(text) => GtidList::from_string(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(GtidList::empty()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save_rpl_state(&self, gtids: &GtidList) -> Result<()> {
        atomic_write(&self.gtid_file_path(), gtids.to_string().as_bytes())
    }

    pub fn requested_rpl_state(&self) -> Result<Option<GtidList>> {
        match fs::read_to_string(self.requested_gtid_file_path()) {
            Ok(text) => Ok(Some(GtidList::from_string(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save_requested_rpl_state(&self, gtids: &GtidList) -> Result<()> {
        atomic_write(&self.requested_gtid_file_path(), gtids.to_string().as_bytes())
    }

    pub fn clear_requested_rpl_state(&self) -> Result<()> {
        match fs::remove_file(self.requested_gtid_file_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write-to-temp, rename, used for every small state file that must never
/// be observed half-written (§3's `rpl_state`, `binlog.index`).
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtid::Gtid;

    fn minimal_raw(datadir: &Path) -> RawConfig {
        RawConfig {
            datadir: Some(datadir.to_string_lossy().into_owned()),
            server_id: Some(1),
            ..Default::default()
        }
    }

    #[test]
    fn loads_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::from_raw(minimal_raw(dir.path())).unwrap();
        assert_eq!(cfg.net_timeout, Duration::from_secs(10));
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(300));
        assert!(!cfg.select_master);
    }

    #[test]
    fn rejects_archive_without_archivedir() {
        let dir = tempfile::tempdir().unwrap();
        let mut raw = minimal_raw(dir.path());
        raw.expiration_mode = Some(ExpirationMode::Archive);
        assert!(Config::from_raw(raw).is_err());
    }

    #[test]
    fn rejects_key_id_without_cipher() {
        let dir = tempfile::tempdir().unwrap();
        let mut raw = minimal_raw(dir.path());
        raw.encryption_key_id = Some("k1".to_string());
        assert!(Config::from_raw(raw).is_err());
    }

    #[test]
    fn rpl_state_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::from_raw(minimal_raw(dir.path())).unwrap();
        assert!(cfg.rpl_state().unwrap().is_empty());

        let list = GtidList::new(vec![Gtid::new(0, 1, 5)]);
        cfg.save_rpl_state(&list).unwrap();
        assert_eq!(cfg.rpl_state().unwrap(), list);
    }

    #[test]
    fn requested_rpl_state_clears() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::from_raw(minimal_raw(dir.path())).unwrap();
        let list = GtidList::new(vec![Gtid::new(0, 1, 5)]);
        cfg.save_requested_rpl_state(&list).unwrap();
        assert_eq!(cfg.requested_rpl_state().unwrap(), Some(list));
        cfg.clear_requested_rpl_state().unwrap();
        assert_eq!(cfg.requested_rpl_state().unwrap(), None);
    }
}
