//! File-backed JSON store with an advisory lock file.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::KeyValueStore;
use crate::error::{Result, StoreError};

/// How long [`JsonFileStore::lock`] waits for a contended lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);
const LOCK_EXTENSION: &str = "lock";

/// A key-value store kept as a single JSON object in one file.
///
/// Writes go to a sibling temporary file which is then renamed over the
/// store, so readers never observe a partially written document. The lock
/// is a sibling `.lock` file holding the owner's PID; a lock whose owner is
/// gone is reclaimed.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    cache: Mutex<Option<Map<String, Value>>>,
    locked: Mutex<bool>,
}

impl JsonFileStore {
    /// Creates a store backed by `path`. The file is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".");
        lock_path.push(LOCK_EXTENSION);
        Self {
            path,
            lock_path: PathBuf::from(lock_path),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            cache: Mutex::new(None),
            locked: Mutex::new(false),
        }
    }

    /// Sets how long a blocking lock waits before giving up.
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Path of the backing JSON file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the advisory lock file.
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    fn load(&self) -> Result<Map<String, Value>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(Map::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn flush(&self, data: &Map<String, Value>) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }

        let mut tmp_path = self.path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);

        let encoded = serde_json::to_vec_pretty(data)?;
        let replaced = File::create(&tmp_path)
            .and_then(|mut file| {
                file.write_all(&encoded)?;
                file.sync_all()
            })
            .and_then(|()| fs::rename(&tmp_path, &self.path));
        if let Err(e) = replaced {
            if let Err(cleanup) = fs::remove_file(&tmp_path) {
                if cleanup.kind() != ErrorKind::NotFound {
                    warn!(path = %tmp_path.display(), error = %cleanup, "failed to remove temporary store file");
                }
            }
            return Err(e.into());
        }
        debug!(path = %self.path.display(), bytes = encoded.len(), "store flushed");
        Ok(())
    }

    fn try_create_lock(&self) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)?;
        write!(file, "{}", std::process::id())?;
        file.sync_all()
    }

    /// Removes the lock file if its owner has exited. Returns whether it did.
    fn reclaim_stale_lock(&self) -> Result<bool> {
        let owner = fs::read_to_string(&self.lock_path)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok());

        let stale = match owner {
            Some(pid) if Path::new("/proc").is_dir() => {
                !Path::new("/proc").join(pid.to_string()).exists()
            }
            _ => self.lock_age()? > self.lock_timeout,
        };

        if !stale {
            return Ok(false);
        }

        warn!(
            lock = %self.lock_path.display(),
            owner = ?owner,
            "removing stale store lock"
        );
        match fs::remove_file(&self.lock_path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    fn lock_age(&self) -> Result<Duration> {
        match fs::metadata(&self.lock_path) {
            Ok(meta) => Ok(SystemTime::now()
                .duration_since(meta.modified()?)
                .unwrap_or_default()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Duration::ZERO),
            Err(e) => Err(e.into()),
        }
    }
}

impl KeyValueStore for JsonFileStore {
    fn read(&self, key: &str) -> Result<Option<Value>> {
        let mut cache = self.cache.lock();
        if cache.is_none() {
            *cache = Some(self.load()?);
        }
        Ok(cache.as_ref().and_then(|data| data.get(key).cloned()))
    }

    fn write(&self, key: &str, value: Value) -> Result<()> {
        let mut cache = self.cache.lock();
        let mut data = match cache.as_ref() {
            Some(data) => data.clone(),
            None => self.load()?,
        };
        data.insert(key.to_string(), value);
        self.flush(&data)?;
        *cache = Some(data);
        Ok(())
    }

    fn modification_time(&self) -> Result<Option<DateTime<Utc>>> {
        match fs::metadata(&self.path) {
            Ok(meta) => Ok(Some(DateTime::<Utc>::from(meta.modified()?))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn lock(&self, block: bool) -> Result<()> {
        let mut locked = self.locked.lock();
        if *locked {
            return Ok(());
        }

        let deadline = Instant::now() + self.lock_timeout;
        loop {
            match self.try_create_lock() {
                Ok(()) => {
                    *locked = true;
                    // Another process may have written while we waited.
                    *self.cache.lock() = None;
                    info!(lock = %self.lock_path.display(), "store locked");
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if self.reclaim_stale_lock()? {
                        continue;
                    }
                    if !block || Instant::now() >= deadline {
                        return Err(StoreError::LockTimeout {
                            path: self.lock_path.clone(),
                        });
                    }
                    std::thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn unlock(&self) -> Result<()> {
        let mut locked = self.locked.lock();
        if !*locked {
            return Err(StoreError::NotLocked);
        }
        match fs::remove_file(&self.lock_path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(lock = %self.lock_path.display(), "store lock vanished while held");
            }
            Err(e) => return Err(e.into()),
        }
        *locked = false;
        info!(lock = %self.lock_path.display(), "store unlocked");
        Ok(())
    }
}
