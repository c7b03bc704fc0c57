//! Background directory maintenance: keeps `binlog.index` in sync with what
//! is actually on disk, compresses files older than the newest
//! `number_of_noncompressed_files`, and purges or archives files past
//! `expire_log_duration`/`expire_log_minimum_files`. Grounded on
//! `original_source/file_transformer.hh`/`.cc` (inotify-driven dirty flag +
//! update thread); the `notify` crate stands in for inotify, with a
//! polling fallback for filesystems it can't watch.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;

use crate::config::{Config, ExpirationMode};
use crate::error::Result;
use crate::inventory::InventoryWriter;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Abstracts "is any file descriptor in this process currently open on
/// `path`", so a reader mid-stream through an old file blocks its purge.
/// The real implementation walks `/proc/self/fd`; tests inject a fake.
pub trait OpenFileProbe: Send + Sync {
    fn is_open(&self, path: &Path) -> bool;
}

pub struct ProcFdProbe;

impl OpenFileProbe for ProcFdProbe {
    #[cfg(target_os = "linux")]
    fn is_open(&self, path: &Path) -> bool {
        let target = match fs::canonicalize(path) {
            Ok(p) => p,
            Err(_) => return false,
        };
        let dir = match fs::read_dir("/proc/self/fd") {
            Ok(d) => d,
            Err(_) => return false,
        };
        for entry in dir.flatten() {
            if let Ok(link) = fs::read_link(entry.path()) {
                if link == target {
                    return true;
                }
            }
        }
        false
    }

    #[cfg(not(target_os = "linux"))]
    fn is_open(&self, _path: &Path) -> bool {
        false
    }
}

/// Whether a purge run removed a contiguous prefix of the inventory, found
/// nothing to do because the requested file was already gone, or stopped
/// partway through because a later file was still open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeResult {
    Ok,
    UpToFileNotFound,
    PartialPurge,
}

pub struct FileTransformer {
    config: Arc<Config>,
    inventory: Arc<InventoryWriter>,
    probe: Box<dyn OpenFileProbe>,
    is_dirty: AtomicBool,
    running: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
    // Kept alive only so the OS-level watch isn't torn down; never read back.
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl FileTransformer {
    pub fn spawn(config: Arc<Config>, inventory: Arc<InventoryWriter>) -> Arc<Self> {
        Self::spawn_with_probe(config, inventory, Box::new(ProcFdProbe))
    }

    pub fn spawn_with_probe(
        config: Arc<Config>,
        inventory: Arc<InventoryWriter>,
        probe: Box<dyn OpenFileProbe>,
    ) -> Arc<Self> {
        let transformer = Arc::new(FileTransformer {
            config,
            inventory,
            probe,
            is_dirty: AtomicBool::new(true),
            running: AtomicBool::new(true),
            handle: Mutex::new(None),
            watcher: Mutex::new(None),
        });

        transformer.start_watch();

        let worker = transformer.clone();
        let handle = std::thread::spawn(move || worker.run());
        *transformer.handle.lock() = Some(handle);
        transformer
    }

    /// Watches the data directory for file creation/removal so a rotation
    /// or purge elsewhere is picked up before the next poll tick; falls back
    /// to the plain `POLL_INTERVAL` cadence in `run()` if no native
    /// directory-watch primitive is available on this platform.
    fn start_watch(self: &Arc<Self>) {
        let dirty_flag = self.clone();
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                dirty_flag.set_is_dirty();
            }
        });
        let mut watcher = match watcher {
            Ok(w) => w,
            Err(e) => {
                log::warn!(target: "file_transformer", "directory watch unavailable, falling back to polling: {e}");
                return;
            }
        };
        if let Err(e) = watcher.watch(&self.config.datadir, RecursiveMode::NonRecursive) {
            log::warn!(target: "file_transformer", "directory watch failed, falling back to polling: {e}");
            return;
        }
        *self.watcher.lock() = Some(watcher);
    }

    /// Wakes the maintenance loop on the next poll tick; called by the
    /// writer thread right after a rotation.
    pub fn set_is_dirty(&self) {
        self.is_dirty.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    fn run(&self) {
        while self.running.load(Ordering::SeqCst) {
            if self.is_dirty.swap(false, Ordering::SeqCst) {
                if let Err(e) = self.refresh_inventory() {
                    log::warn!(target: "file_transformer", "inventory refresh failed: {e}");
                }
                if let Err(e) = self.compress_old_files() {
                    log::warn!(target: "file_transformer", "compression pass failed: {e}");
                }
                if let Err(e) = self.expire_old_files() {
                    log::warn!(target: "file_transformer", "expiry pass failed: {e}");
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Rescans the data directory for `<base>.NNNNNN[.zst]` files and
    /// rewrites `binlog.index` if the on-disk set changed. A name match
    /// alone isn't enough to trust a file; its first 4 bytes must also be
    /// the binlog magic (or the zstd magic, for a compressed one).
    fn refresh_inventory(&self) -> Result<()> {
        let base = self.config.base_name();
        let mut found: Vec<String> = fs::read_dir(&self.config.datadir)?
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let stem = name.strip_suffix(".zst").unwrap_or(&name);
                let suffix = stem.strip_prefix(base)?.strip_prefix('.')?;
                if suffix.len() != 6 || !suffix.chars().all(|c| c.is_ascii_digit()) {
                    return None;
                }
                let path = entry.path();
                if has_expected_magic(&path, name.ends_with(".zst")) {
                    Some(name)
                } else {
                    None
                }
            })
            .collect();
        found.sort();

        let current: HashSet<String> = self.inventory.file_names().into_iter().collect();
        let now: HashSet<String> = found.iter().cloned().collect();
        if current != now {
            self.inventory.set_file_names(found)?;
        }
        Ok(())
    }

    /// Compresses every file except the newest `number_of_noncompressed_files`
    /// that isn't compressed yet and isn't open for writing.
    fn compress_old_files(&self) -> Result<()> {
        if self.config.compression_algorithm != crate::config::CompressionAlgorithm::Zstandard {
            return Ok(());
        }
        let names = self.inventory.file_names();
        let keep = self.config.number_of_noncompressed_files as usize;
        if names.len() <= keep {
            return Ok(());
        }
        for name in &names[..names.len() - keep] {
            if name.ends_with(".zst") {
                continue;
            }
            let path = self.config.path(name);
            if !path.exists() || self.probe.is_open(&path) {
                continue;
            }
            self.compress_one(&path)?;
        }
        Ok(())
    }

    fn compress_one(&self, path: &Path) -> Result<()> {
        let data = fs::read(path)?;
        let compressed = zstd::encode_all(&data[..], 0)
            .map_err(|e| crate::error::PinlokiError::binlog_write(format!("zstd compress failed: {e}")))?;
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        let tmp_dir = self.config.compression_dir();
        let tmp = tmp_dir.join(format!("{name}.tmp"));
        fs::write(&tmp, compressed)?;
        // `binlog.000001`'s "extension" is `000001`, so `Path::with_extension`
        // would replace the sequence number instead of appending; join the
        // `.zst` suffix onto the name directly.
        let dest = self.config.datadir.join(format!("{name}.zst"));
        fs::rename(&tmp, &dest)?;
        fs::remove_file(path)?;
        self.set_is_dirty();
        Ok(())
    }

    /// Deletes (or moves to `archivedir`) files past the retention window,
    /// stopping at the first file still open or still within
    /// `expire_log_minimum_files` of the tail.
    fn expire_old_files(&self) -> Result<PurgeResult> {
        if self.config.expire_log_duration.is_zero() {
            return Ok(PurgeResult::Ok);
        }
        let names = self.inventory.file_names();
        let min_keep = self.config.expire_log_minimum_files as usize;
        if names.len() <= min_keep {
            return Ok(PurgeResult::Ok);
        }

        let cutoff = SystemTime::now().checked_sub(self.config.expire_log_duration);
        let cutoff = match cutoff {
            Some(c) => c,
            None => return Ok(PurgeResult::Ok),
        };

        let eligible_end = names.len() - min_keep;
        let mut removed = 0;
        for name in &names[..eligible_end] {
            let path = self.config.path(name);
            let meta = match fs::metadata(&path) {
                Ok(m) => m,
                Err(_) => continue,
            };
            let modified = meta.modified().unwrap_or(SystemTime::now());
            if modified > cutoff {
                break;
            }
            if self.probe.is_open(&path) {
                return Ok(PurgeResult::PartialPurge);
            }
            self.retire_file(&path)?;
            removed += 1;
        }

        let remaining = names[removed..].to_vec();
        self.inventory.set_file_names(remaining)?;
        Ok(PurgeResult::Ok)
    }

    /// Unlinks (or archives) every file strictly before `upto_filename`,
    /// stopping early if one of them is still open. Used by the
    /// `purge_logs` control-surface operation, as opposed to the timer-
    /// driven `expire_old_files`.
    pub fn purge_upto(&self, upto_filename: &str) -> Result<PurgeResult> {
        let names = self.inventory.file_names();
        let idx = match names.iter().position(|n| n == upto_filename) {
            Some(i) => i,
            None => return Ok(PurgeResult::UpToFileNotFound),
        };

        let mut removed = 0;
        for name in &names[..idx] {
            let path = self.config.path(name);
            if self.probe.is_open(&path) {
                break;
            }
            self.retire_file(&path)?;
            removed += 1;
        }

        let remaining = names[removed..].to_vec();
        self.inventory.set_file_names(remaining)?;
        if removed == idx {
            Ok(PurgeResult::Ok)
        } else {
            Ok(PurgeResult::PartialPurge)
        }
    }

    fn retire_file(&self, path: &Path) -> Result<()> {
        match self.config.expiration_mode {
            ExpirationMode::Purge => fs::remove_file(path)?,
            ExpirationMode::Archive => {
                let archivedir = self.config.archivedir.as_ref().expect("validated at config load");
                let dest = archivedir.join(path.file_name().unwrap());
                fs::rename(path, dest)?;
            }
        }
        Ok(())
    }
}

/// Reads the first 4 bytes of `path` and compares them against the binlog
/// magic, or the zstd magic if `compressed` is set. A name that looks right
/// but a body that doesn't isn't a binlog file.
fn has_expected_magic(path: &Path, compressed: bool) -> bool {
    let want = if compressed { crate::event::types::ZSTD_MAGIC } else { crate::event::types::MAGIC };
    let mut buf = [0u8; 4];
    match fs::File::open(path).and_then(|mut f| std::io::Read::read_exact(&mut f, &mut buf)) {
        Ok(()) => buf == want,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawConfig;

    struct NeverOpen;
    impl OpenFileProbe for NeverOpen {
        fn is_open(&self, _path: &Path) -> bool {
            false
        }
    }

    fn test_config(dir: &Path) -> Arc<Config> {
        let raw = RawConfig {
            datadir: Some(dir.to_string_lossy().into_owned()),
            server_id: Some(1),
            ..Default::default()
        };
        Arc::new(Config::from_raw(raw).unwrap())
    }

    #[test]
    fn refresh_inventory_discovers_files_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        fs::write(config.path("binlog.000001"), crate::event::types::MAGIC).unwrap();
        fs::write(config.path("binlog.000002"), crate::event::types::MAGIC).unwrap();

        let inventory = Arc::new(InventoryWriter::new(config.clone()).unwrap());
        let transformer = FileTransformer {
            config,
            inventory: inventory.clone(),
            probe: Box::new(NeverOpen),
            is_dirty: AtomicBool::new(true),
            running: AtomicBool::new(true),
            handle: Mutex::new(None),
            watcher: Mutex::new(None),
        };

        transformer.refresh_inventory().unwrap();
        assert_eq!(inventory.file_names(), vec!["binlog.000001", "binlog.000002"]);
    }

    #[test]
    fn compress_old_files_leaves_recent_ones_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut raw = RawConfig {
            datadir: Some(dir.path().to_string_lossy().into_owned()),
            server_id: Some(1),
            ..Default::default()
        };
        raw.compression_algorithm = Some(crate::config::CompressionAlgorithm::Zstandard);
        raw.number_of_noncompressed_files = Some(1);
        let config = Arc::new(Config::from_raw(raw).unwrap());

        fs::write(config.path("binlog.000001"), vec![0u8; 128]).unwrap();
        fs::write(config.path("binlog.000002"), vec![0u8; 128]).unwrap();
        let inventory = Arc::new(InventoryWriter::new(config.clone()).unwrap());
        inventory.add("binlog.000001").unwrap();
        inventory.add("binlog.000002").unwrap();

        let transformer = FileTransformer {
            config: config.clone(),
            inventory: inventory.clone(),
            probe: Box::new(NeverOpen),
            is_dirty: AtomicBool::new(true),
            running: AtomicBool::new(true),
            handle: Mutex::new(None),
            watcher: Mutex::new(None),
        };
        transformer.compress_old_files().unwrap();

        assert!(config.path("binlog.000001.zst").exists());
        assert!(config.path("binlog.000002").exists());
    }
}
