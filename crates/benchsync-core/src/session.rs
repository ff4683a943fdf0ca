//! Session identity: one stable opaque key per client profile.
//!
//! The key is generated once, persisted, and reused on every later call. If
//! the backing storage cannot be read or written the key lives in memory only
//! for the life of the process; `get_or_create` never fails.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::{Rng, RngCore};

use crate::types::SessionKey;

/// File name used inside a profile directory.
pub const SESSION_KEY_FILE: &str = "session-key";

/// Persistent storage for the session key.
pub trait KeyStorage: Send + Sync {
    fn load(&self) -> io::Result<Option<String>>;
    fn save(&self, key: &str) -> io::Result<()>;
}

/// Stores the key as a single line in a file.
#[derive(Debug, Clone)]
pub struct FileKeyStorage {
    path: PathBuf,
}

impl FileKeyStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Storage at `<dir>/session-key`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(SESSION_KEY_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyStorage for FileKeyStorage {
    fn load(&self) -> io::Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn save(&self, key: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, format!("{key}\n"))
    }
}

#[derive(Debug)]
struct Resolved {
    key: SessionKey,
    durable: bool,
}

pub struct SessionIdentity<S> {
    storage: S,
    resolved: Mutex<Option<Resolved>>,
}

impl<S: KeyStorage> SessionIdentity<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            resolved: Mutex::new(None),
        }
    }

    /// Return the persisted key, generating and persisting one on first use.
    pub fn get_or_create(&self) -> SessionKey {
        let mut resolved = self.resolved.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = resolved.as_ref() {
            return existing.key.clone();
        }

        let fresh = self.resolve();
        let key = fresh.key.clone();
        *resolved = Some(fresh);
        key
    }

    /// `false` when the key could not be persisted and will not survive a
    /// restart. Only meaningful after `get_or_create`.
    pub fn is_durable(&self) -> bool {
        self.resolved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|r| r.durable)
    }

    fn resolve(&self) -> Resolved {
        match self.storage.load() {
            Ok(Some(raw)) => {
                if let Ok(key) = SessionKey::parse(&raw) {
                    return Resolved { key, durable: true };
                }
            }
            Ok(None) => {}
            Err(_) => {
                return Resolved {
                    key: generate_session_key(),
                    durable: false,
                };
            }
        }

        let key = generate_session_key();
        let durable = self.storage.save(key.as_str()).is_ok();
        Resolved { key, durable }
    }
}

/// 128 random bits, hex encoded. Prefers the OS generator; falls back to the
/// clock mixed with the thread-local generator.
pub fn generate_session_key() -> SessionKey {
    let mut bytes = [0u8; 16];
    if OsRng.try_fill_bytes(&mut bytes).is_err() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let mut rng = rand::thread_rng();
        for (i, byte) in bytes.iter_mut().enumerate() {
            let clock = (nanos >> ((i % 8) * 8)) as u8;
            *byte = clock ^ rng.r#gen::<u8>();
        }
    }

    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    SessionKey::from_generated(hex)
}
