//! Persisted stores: config record, passphrase side-store, API token and the
//! runtime status snapshot.
//!
//! Every writer goes through write-temp-then-rename with an fsync, and holds
//! an exclusive advisory lock on the store directory for the duration of the
//! save. Readers tolerate missing files and fall back to defaults.

use crate::config::{validate_passphrase, Config, FieldError};
use crate::status::Status;
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::warn;

const CONFIG_FILE: &str = "config.json";
const PASSPHRASE_FILE: &str = "passphrase";
const TOKEN_FILE: &str = "api-token";
const STATE_FILE: &str = "state.json";
const LOCK_FILE: &str = ".lock";

/// Write `payload` to `path` atomically. fsync is best-effort.
pub fn atomic_write(path: &Path, payload: &[u8], mode: u32) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut f = File::create(&tmp)?;
        f.write_all(payload)?;
        if let Err(e) = f.sync_all() {
            warn!("fsync failed for {}: {}", tmp.display(), e);
        }
    }
    fs::set_permissions(&tmp, fs::Permissions::from_mode(mode))?;
    fs::rename(&tmp, path)
}

/// Exclusive advisory lock on a store directory, released on drop.
struct DirLock {
    file: File,
}

impl DirLock {
    fn acquire(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(LOCK_FILE))?;
        file.lock()?;
        Ok(Self { file })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!("store lock release failed: {}", e);
        }
    }
}

/// The persisted configuration record.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let path = dir.join(CONFIG_FILE);
        Self { dir, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_raw(&self) -> serde_json::Map<String, Value> {
        let Ok(text) = fs::read_to_string(&self.path) else {
            return serde_json::Map::new();
        };
        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => map,
            _ => {
                warn!("config file unreadable, using defaults: {}", self.path.display());
                serde_json::Map::new()
            }
        }
    }

    /// Returns defaults merged with the on-disk record. Never fails.
    pub fn load(&self) -> Config {
        let raw = self.read_raw();
        if raw.is_empty() {
            return Config::default();
        }
        match serde_json::from_value(Value::Object(raw)) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!("config deserialization failed, using defaults: {}", e);
                Config::default()
            }
        }
    }

    /// Merge a partial update over the current record, validate the full
    /// record, then atomically persist it. The passphrase key is stripped;
    /// it never enters the config file.
    pub fn save_patch(&self, patch: &serde_json::Map<String, Value>) -> Result<Config, Vec<FieldError>> {
        let mut merged = self.read_raw();
        for (k, v) in patch {
            if k == "wpa2_passphrase" {
                continue;
            }
            merged.insert(k.clone(), v.clone());
        }

        let cfg: Config = serde_json::from_value(Value::Object(merged))
            .map_err(|e| vec![FieldError::new("config", &format!("deserialize_failed:{e}"))])?;

        let errors = cfg.validate();
        if !errors.is_empty() {
            return Err(errors);
        }

        self.save(&cfg)
            .map_err(|e| vec![FieldError::new("config", &format!("write_failed:{e}"))])?;
        Ok(cfg)
    }

    pub fn save(&self, cfg: &Config) -> io::Result<()> {
        let _lock = DirLock::acquire(&self.dir)?;
        let payload = serde_json::to_vec_pretty(cfg)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        atomic_write(&self.path, &payload, 0o600)
    }
}

/// Side-store for the WPA2 passphrase. The main config never carries it.
#[derive(Debug, Clone)]
pub struct PassphraseStore {
    dir: PathBuf,
    path: PathBuf,
}

impl PassphraseStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let path = dir.join(PASSPHRASE_FILE);
        Self { dir, path }
    }

    pub fn is_set(&self) -> bool {
        self.get().is_some()
    }

    /// The stored passphrase, or None when the file is absent or unusable.
    pub fn get(&self) -> Option<String> {
        let text = fs::read_to_string(&self.path).ok()?;
        let trimmed = text.trim_end_matches('\n').to_string();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    }

    /// Persist a new passphrase after validating the WPA2 constraints.
    pub fn set(&self, passphrase: &str) -> Result<(), FieldError> {
        if let Some(err) = validate_passphrase(passphrase) {
            return Err(err);
        }
        let _lock = DirLock::acquire(&self.dir)
            .map_err(|e| FieldError::new("wpa2_passphrase", &format!("lock_failed:{e}")))?;
        atomic_write(&self.path, passphrase.as_bytes(), 0o600)
            .map_err(|e| FieldError::new("wpa2_passphrase", &format!("write_failed:{e}")))
    }

    /// Generate, persist and return a bootstrap passphrase (12 alphanumerics).
    pub fn provision(&self) -> Result<String, FieldError> {
        use rand::Rng;
        const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
        let mut rng = rand::thread_rng();
        let generated: String = (0..12)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        self.set(&generated)?;
        Ok(generated)
    }
}

/// Single-scalar store for the control-plane API token.
#[derive(Debug, Clone)]
pub struct TokenStore {
    dir: PathBuf,
    path: PathBuf,
}

impl TokenStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let path = dir.join(TOKEN_FILE);
        Self { dir, path }
    }

    pub fn get(&self) -> Option<String> {
        let text = fs::read_to_string(&self.path).ok()?;
        let trimmed = text.trim().to_string();
        (!trimmed.is_empty()).then_some(trimmed)
    }

    pub fn set(&self, token: &str) -> io::Result<()> {
        let _lock = DirLock::acquire(&self.dir)?;
        atomic_write(&self.path, token.as_bytes(), 0o600)
    }
}

/// Runtime status snapshot persisted under the run directory.
#[derive(Debug, Clone)]
pub struct StatusStore {
    path: PathBuf,
}

impl StatusStore {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: run_dir.into().join(STATE_FILE),
        }
    }

    pub fn load(&self) -> Status {
        let Ok(text) = fs::read_to_string(&self.path) else {
            return Status::default();
        };
        serde_json::from_str(&text).unwrap_or_default()
    }

    pub fn save(&self, status: &Status) -> io::Result<()> {
        let payload = serde_json::to_vec_pretty(status)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        // Runtime state is non-secret.
        atomic_write(&self.path, &payload, 0o644)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_config_roundtrip_identity() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path());

        let cfg = store.load();
        store.save(&cfg).unwrap();
        let again = store.load();
        assert_eq!(cfg, again);
    }

    #[test]
    fn test_save_patch_merges_and_validates() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path());

        let patch = json!({"ssid": "VR-NET", "country": "DE"});
        let cfg = store.save_patch(patch.as_object().unwrap()).unwrap();
        assert_eq!(cfg.ssid, "VR-NET");
        assert_eq!(cfg.country, "DE");

        // Second patch keeps the first one's fields.
        let patch = json!({"channel_2g_fallback": 11});
        let cfg = store.save_patch(patch.as_object().unwrap()).unwrap();
        assert_eq!(cfg.ssid, "VR-NET");
        assert_eq!(cfg.channel_2g_fallback, 11);
    }

    #[test]
    fn test_save_patch_rejects_invalid_record() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path());

        let patch = json!({"channel_2g_fallback": 15});
        let errors = store.save_patch(patch.as_object().unwrap()).unwrap_err();
        assert!(errors.iter().any(|e| e.code == "channel_2g_range_1_14"));
        // Nothing was written.
        assert!(!store.path().exists());
    }

    #[test]
    fn test_passphrase_never_enters_config_file() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path());

        let patch = json!({"ssid": "VR-NET", "wpa2_passphrase": "correcthorse"});
        store.save_patch(patch.as_object().unwrap()).unwrap();

        let text = std::fs::read_to_string(store.path()).unwrap();
        assert!(!text.contains("correcthorse"));
        assert!(!text.contains("wpa2_passphrase"));
    }

    #[test]
    fn test_passphrase_store_roundtrip_and_mode() {
        let dir = TempDir::new().unwrap();
        let store = PassphraseStore::new(dir.path());
        assert!(!store.is_set());

        store.set("correcthorse").unwrap();
        assert_eq!(store.get().as_deref(), Some("correcthorse"));

        let mode = std::fs::metadata(dir.path().join("passphrase"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_passphrase_store_rejects_bad_lengths() {
        let dir = TempDir::new().unwrap();
        let store = PassphraseStore::new(dir.path());
        assert!(store.set("short").is_err());
        assert!(store.set(&"y".repeat(64)).is_err());
        assert!(!store.is_set());
    }

    #[test]
    fn test_provision_generates_valid_passphrase() {
        let dir = TempDir::new().unwrap();
        let store = PassphraseStore::new(dir.path());
        let generated = store.provision().unwrap();
        assert_eq!(generated.len(), 12);
        assert!(generated.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(store.get().as_deref(), Some(generated.as_str()));
    }

    #[test]
    fn test_status_store_defaults_when_missing() {
        let dir = TempDir::new().unwrap();
        let store = StatusStore::new(dir.path());
        let st = store.load();
        assert!(!st.running);

        let mut st = Status::default();
        st.push_warning("w1");
        store.save(&st).unwrap();
        assert_eq!(store.load().warnings, vec!["w1".to_string()]);
    }

    #[test]
    fn test_token_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = TokenStore::new(dir.path());
        assert!(store.get().is_none());
        store.set("tok-123").unwrap();
        assert_eq!(store.get().as_deref(), Some("tok-123"));
    }
}
