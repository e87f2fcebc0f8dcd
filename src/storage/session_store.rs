use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};

const SESSION_FILE_NAME: &str = "session.json";

/// Key-value persistence for session data.
///
/// Persistence is best effort: `get` may return `None` at any time and
/// callers must cope with it.
pub trait SessionStore: Send + Sync {
    fn put(&self, key: &str, value: &str);

    fn get(&self, key: &str) -> Option<String>;

    fn remove(&self, key: &str);

    /// Write several entries as one unit
    fn put_all(&self, entries: &[(&str, &str)]) {
        for (key, value) in entries {
            self.put(key, value);
        }
    }

    fn clear(&self, keys: &[&str]) {
        for key in keys {
            self.remove(key);
        }
    }
}

/// Store for runtimes without persistent storage. Every call is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStore;

impl SessionStore for NoopStore {
    fn put(&self, _key: &str, _value: &str) {}

    fn get(&self, _key: &str) -> Option<String> {
        None
    }

    fn remove(&self, _key: &str) {}
}

/// Process-local store, lost when the process exits
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStore for MemoryStore {
    fn put(&self, key: &str, value: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), value.to_string());
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn remove(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
    }

    fn put_all(&self, new_entries: &[(&str, &str)]) {
        if let Ok(mut entries) = self.entries.lock() {
            for (key, value) in new_entries {
                entries.insert(key.to_string(), value.to_string());
            }
        }
    }

    fn clear(&self, keys: &[&str]) {
        if let Ok(mut entries) = self.entries.lock() {
            for key in keys {
                entries.remove(*key);
            }
        }
    }
}

/// JSON file store that survives restarts.
///
/// Entries are cached in memory and written through on every change; a
/// failed write is logged and the cached value still serves reads.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open (or create) the session file inside `dir`
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| SyncError::Storage(format!("cannot create {:?}: {}", dir, e)))?;

        let path = dir.join(SESSION_FILE_NAME);
        let entries = if path.exists() {
            let json = std::fs::read_to_string(&path)
                .map_err(|e| SyncError::Storage(format!("cannot read {:?}: {}", path, e)))?;
            match serde_json::from_str(&json) {
                Ok(entries) => entries,
                Err(e) => {
                    // A corrupt file only costs the user a fresh login
                    warn!("Ignoring unreadable session file {:?}: {}", path, e);
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };

        debug!("Session file at {:?} ({} entries)", path, entries.len());
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &BTreeMap<String, String>) {
        if let Err(e) = write_private(&self.path, entries) {
            warn!("Failed to persist session file {:?}: {}", self.path, e);
        }
    }

    fn mutate(&self, f: impl FnOnce(&mut BTreeMap<String, String>)) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        f(&mut entries);
        self.flush(&entries);
    }
}

impl SessionStore for FileStore {
    fn put(&self, key: &str, value: &str) {
        self.mutate(|entries| {
            entries.insert(key.to_string(), value.to_string());
        });
    }

    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn remove(&self, key: &str) {
        self.mutate(|entries| {
            entries.remove(key);
        });
    }

    fn put_all(&self, new_entries: &[(&str, &str)]) {
        self.mutate(|entries| {
            for (key, value) in new_entries {
                entries.insert(key.to_string(), value.to_string());
            }
        });
    }

    fn clear(&self, keys: &[&str]) {
        self.mutate(|entries| {
            for key in keys {
                entries.remove(*key);
            }
        });
    }
}

fn write_private(path: &Path, entries: &BTreeMap<String, String>) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(entries)?;
    std::fs::write(path, json)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_mode(0o600); // Only user can read/write
        std::fs::set_permissions(path, perms)?;
    }

    Ok(())
}
