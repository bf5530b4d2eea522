//! Secure session storage for Fieldbook.
//!
//! A capability-probing persistence layer for session and token records.
//! Three backends, probed at open time:
//!
//! | Backend | Used when | Survives |
//! |---------|-----------|----------|
//! | Vault (single JSON file, atomic rename) | remember-me, vault healthy | reinstalls, reboots |
//! | Flat files (one per key) | remember-me, vault unavailable | reboots |
//! | Volatile (in-process map) | remember-me off | nothing |
//!
//! Values in the durable backends pass through a reversible obfuscation
//! step keyed off a coarse device fingerprint. This is explicitly NOT a
//! security boundary: it deters casual inspection of the files and nothing
//! more. Do not upgrade it to real encryption without revisiting the
//! threat model; do not assume it protects against a local attacker.
//!
//! Keys are namespaced by install mode so an installed app and a portable
//! run never read each other's sessions.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::{InstallMode, StorageConfig};
use crate::error::{Error, Result};

const VAULT_FILE: &str = "secure_store.json";

/// Secure key/value store with capability-probed backends.
pub struct SecureStore {
    mode: InstallMode,
    remember: AtomicBool,
    durable: Durable,
    volatile: Mutex<HashMap<String, String>>,
    fingerprint: String,
}

enum Durable {
    /// Transactional vault file: read-modify-write with atomic rename.
    Vault {
        path: PathBuf,
        entries: Mutex<HashMap<String, String>>,
    },
    /// Per-key flat files in the data directory.
    Files { dir: PathBuf },
    /// No durable capability at all.
    Unavailable,
}

impl std::fmt::Debug for SecureStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match &self.durable {
            Durable::Vault { .. } => "vault",
            Durable::Files { .. } => "files",
            Durable::Unavailable => "unavailable",
        };
        f.debug_struct("SecureStore")
            .field("mode", &self.mode)
            .field("durable_backend", &backend)
            .finish_non_exhaustive()
    }
}

impl SecureStore {
    /// Open the store, probing which backends this environment supports.
    ///
    /// Never fails outright: with no usable data directory the store still
    /// works in volatile mode, and remember-me writes report
    /// [`Error::StorageUnavailable`] at the point of use.
    #[must_use]
    pub fn open(config: &StorageConfig) -> Self {
        let data_dir = config
            .data_dir
            .clone()
            .or_else(crate::config::Config::data_dir)
            .unwrap_or_else(|| PathBuf::from("."));

        let durable = Self::probe_durable(&data_dir);

        Self {
            mode: config.mode,
            remember: AtomicBool::new(false),
            durable,
            volatile: Mutex::new(HashMap::new()),
            fingerprint: device_fingerprint(),
        }
    }

    fn probe_durable(data_dir: &Path) -> Durable {
        if let Err(e) = fs::create_dir_all(data_dir) {
            tracing::warn!(
                "Data directory {} unavailable ({e}), secure store is volatile-only",
                data_dir.display()
            );
            return Durable::Unavailable;
        }

        let path = data_dir.join(VAULT_FILE);
        match Self::load_vault(&path) {
            Ok(entries) => Durable::Vault {
                path,
                entries: Mutex::new(entries),
            },
            Err(e) => {
                tracing::warn!(
                    "Vault at {} unusable ({e}), falling back to flat files",
                    path.display()
                );
                Durable::Files {
                    dir: data_dir.to_path_buf(),
                }
            }
        }
    }

    fn load_vault(path: &Path) -> Result<HashMap<String, String>> {
        if !path.exists() {
            // Probe writability before committing to the vault backend.
            fs::write(path, "{}")
                .map_err(|e| Error::StorageFailed(format!("cannot create vault: {e}")))?;
            return Ok(HashMap::new());
        }
        let content = fs::read_to_string(path)
            .map_err(|e| Error::StorageFailed(format!("cannot read vault: {e}")))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::StorageFailed(format!("cannot parse vault: {e}")))
    }

    /// Set the remember-me flag that routes all subsequent persistence
    /// calls. Decided by the session manager at login or session recovery.
    pub fn set_remember(&self, remember: bool) {
        self.remember.store(remember, Ordering::SeqCst);
    }

    /// Current remember-me routing flag.
    #[must_use]
    pub fn remember(&self) -> bool {
        self.remember.load(Ordering::SeqCst)
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{key}", self.mode.key_prefix())
    }

    /// Store a structured value under `key`, serialized transparently.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageUnavailable`] when remember-me requires a
    /// durable backend and none exists; the value is never silently
    /// downgraded to a weaker backend.
    pub fn store_securely<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let payload = serde_json::to_string(value)
            .map_err(|e| Error::Serialization(format!("cannot serialize '{key}': {e}")))?;
        let key = self.namespaced(key);

        if self.remember() {
            match &self.durable {
                Durable::Vault { path, entries } => {
                    let mut entries = lock(entries);
                    entries.insert(key, obfuscate(&payload, &self.fingerprint));
                    Self::save_vault(path, &entries)
                }
                Durable::Files { dir } => {
                    let obfuscated = obfuscate(&payload, &self.fingerprint);
                    fs::write(dir.join(format!("{key}.dat")), obfuscated)
                        .map_err(|e| Error::StorageFailed(format!("cannot write '{key}': {e}")))
                }
                Durable::Unavailable => Err(Error::StorageUnavailable(
                    "no durable backend for a remembered session".to_string(),
                )),
            }
        } else {
            lock(&self.volatile).insert(key, payload);
            Ok(())
        }
    }

    /// Retrieve and deserialize the value stored under `key`, looking in
    /// the backend selected by the remember-me flag.
    ///
    /// A missing key is `Ok(None)`; a present but unreadable value is an
    /// error.
    pub fn retrieve_securely<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let key = self.namespaced(key);

        let payload = if self.remember() {
            match &self.durable {
                Durable::Vault { entries, .. } => lock(entries)
                    .get(&key)
                    .map(|raw| deobfuscate(raw, &self.fingerprint))
                    .transpose()?,
                Durable::Files { dir } => match fs::read_to_string(dir.join(format!("{key}.dat"))) {
                    Ok(raw) => Some(deobfuscate(&raw, &self.fingerprint)?),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                    Err(e) => {
                        return Err(Error::StorageFailed(format!("cannot read '{key}': {e}")));
                    }
                },
                Durable::Unavailable => {
                    return Err(Error::StorageUnavailable(
                        "no durable backend for a remembered session".to_string(),
                    ));
                }
            }
        } else {
            lock(&self.volatile).get(&key).cloned()
        };

        payload
            .map(|raw| {
                serde_json::from_str(&raw)
                    .map_err(|e| Error::Serialization(format!("cannot deserialize '{key}': {e}")))
            })
            .transpose()
    }

    /// Remove the value stored under `key` from every backend.
    ///
    /// Removal is deliberately flag-independent: logout must leave no
    /// copy behind regardless of where the session was written.
    pub fn remove_securely(&self, key: &str) -> Result<()> {
        let key = self.namespaced(key);

        lock(&self.volatile).remove(&key);

        match &self.durable {
            Durable::Vault { path, entries } => {
                let mut entries = lock(entries);
                if entries.remove(&key).is_some() {
                    Self::save_vault(path, &entries)?;
                }
            }
            Durable::Files { dir } => {
                match fs::remove_file(dir.join(format!("{key}.dat"))) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(Error::StorageFailed(format!("cannot remove '{key}': {e}")));
                    }
                }
            }
            Durable::Unavailable => {}
        }
        Ok(())
    }

    /// Best-effort scan of every backend for an existing value.
    ///
    /// At process start the remember-me flag is unknown until a session is
    /// found, so this is the only lookup that ignores it. Returns the raw
    /// serialized payload.
    #[must_use]
    pub fn find_existing_session(&self, key: &str) -> Option<String> {
        let key = self.namespaced(key);

        if let Some(payload) = lock(&self.volatile).get(&key) {
            return Some(payload.clone());
        }

        match &self.durable {
            Durable::Vault { entries, .. } => lock(entries)
                .get(&key)
                .and_then(|raw| deobfuscate(raw, &self.fingerprint).ok()),
            Durable::Files { dir } => fs::read_to_string(dir.join(format!("{key}.dat")))
                .ok()
                .and_then(|raw| deobfuscate(&raw, &self.fingerprint).ok()),
            Durable::Unavailable => None,
        }
    }

    fn save_vault(path: &Path, entries: &HashMap<String, String>) -> Result<()> {
        let content = serde_json::to_string_pretty(entries)
            .map_err(|e| Error::Serialization(format!("cannot serialize vault: {e}")))?;

        // Write-then-rename keeps the vault transactional: readers see the
        // old map or the new one, never a torn file.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content)
            .map_err(|e| Error::StorageFailed(format!("cannot write vault: {e}")))?;
        fs::rename(&tmp, path)
            .map_err(|e| Error::StorageFailed(format!("cannot commit vault: {e}")))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// XOR the payload with the fingerprint and base64 the result.
fn obfuscate(value: &str, fingerprint: &str) -> String {
    let xored = xor_bytes(value.as_bytes(), fingerprint.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(xored)
}

/// Reverse of [`obfuscate`].
fn deobfuscate(encoded: &str, fingerprint: &str) -> Result<String> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| Error::StorageFailed(format!("corrupt stored value: {e}")))?;
    let xored = xor_bytes(&raw, fingerprint.as_bytes());
    String::from_utf8(xored)
        .map_err(|e| Error::StorageFailed(format!("corrupt stored value: {e}")))
}

fn xor_bytes(data: &[u8], key: &[u8]) -> Vec<u8> {
    data.iter()
        .zip(key.iter().cycle())
        .map(|(byte, key_byte)| byte ^ key_byte)
        .collect()
}

/// Coarse device fingerprint: hostname, OS, architecture and user, hashed.
///
/// Deliberately low-entropy. Its only job is making the stored files
/// unreadable on a different machine or by naive copy-paste.
fn device_fingerprint() -> String {
    let host = hostname::get().map_or_else(|_| "unknown".to_string(), |h| h.to_string_lossy().to_string());
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let raw = format!(
        "{host}|{}|{}|{user}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );

    use std::fmt::Write as _;
    let digest = Sha256::digest(raw.as_bytes());
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Payload {
        token: String,
        count: u32,
    }

    fn store_in(dir: &TempDir, mode: InstallMode) -> SecureStore {
        SecureStore::open(&StorageConfig {
            mode,
            data_dir: Some(dir.path().to_path_buf()),
        })
    }

    #[test]
    fn test_durable_roundtrip_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let payload = Payload {
            token: "abc123".to_string(),
            count: 7,
        };

        let store = store_in(&dir, InstallMode::Installed);
        store.set_remember(true);
        store.store_securely("session", &payload).unwrap();
        drop(store);

        // Simulated reload: a fresh store over the same directory.
        let reopened = store_in(&dir, InstallMode::Installed);
        reopened.set_remember(true);
        let loaded: Payload = reopened.retrieve_securely("session").unwrap().unwrap();
        assert_eq!(loaded, payload);
    }

    #[test]
    fn test_volatile_cleared_on_reopen() {
        let dir = TempDir::new().unwrap();
        let payload = Payload {
            token: "ephemeral".to_string(),
            count: 1,
        };

        let store = store_in(&dir, InstallMode::Installed);
        store.set_remember(false);
        store.store_securely("session", &payload).unwrap();
        assert!(store
            .retrieve_securely::<Payload>("session")
            .unwrap()
            .is_some());
        drop(store);

        let reopened = store_in(&dir, InstallMode::Installed);
        reopened.set_remember(false);
        assert!(reopened
            .retrieve_securely::<Payload>("session")
            .unwrap()
            .is_none());
        assert!(reopened.find_existing_session("session").is_none());
    }

    #[test]
    fn test_mode_namespacing_isolates_keys() {
        let dir = TempDir::new().unwrap();
        let payload = Payload {
            token: "installed-only".to_string(),
            count: 2,
        };

        let installed = store_in(&dir, InstallMode::Installed);
        installed.set_remember(true);
        installed.store_securely("session", &payload).unwrap();

        let portable = store_in(&dir, InstallMode::Portable);
        portable.set_remember(true);
        assert!(portable
            .retrieve_securely::<Payload>("session")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_values_not_plaintext_on_disk() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, InstallMode::Installed);
        store.set_remember(true);
        store
            .store_securely(
                "session",
                &Payload {
                    token: "super-secret-token".to_string(),
                    count: 0,
                },
            )
            .unwrap();

        let vault = std::fs::read_to_string(dir.path().join(VAULT_FILE)).unwrap();
        assert!(!vault.contains("super-secret-token"));
    }

    #[test]
    fn test_find_existing_session_scans_durable() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, InstallMode::Installed);
        store.set_remember(true);
        store
            .store_securely(
                "session",
                &Payload {
                    token: "found-me".to_string(),
                    count: 3,
                },
            )
            .unwrap();
        drop(store);

        // Flag unknown at boot: default is remember=false, yet the scan
        // must still surface the durable copy.
        let reopened = store_in(&dir, InstallMode::Installed);
        let raw = reopened.find_existing_session("session").unwrap();
        let parsed: Payload = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.token, "found-me");
    }

    #[test]
    fn test_remove_clears_every_backend() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, InstallMode::Installed);
        let payload = Payload {
            token: "gone".to_string(),
            count: 9,
        };

        store.set_remember(true);
        store.store_securely("session", &payload).unwrap();
        store.set_remember(false);
        store.store_securely("session", &payload).unwrap();

        store.remove_securely("session").unwrap();
        assert!(store.find_existing_session("session").is_none());
    }

    #[test]
    fn test_remember_without_durable_backend_errors() {
        let dir = TempDir::new().unwrap();
        // A file where the data directory should be makes the durable
        // probe fail.
        let blocked = dir.path().join("blocked");
        std::fs::write(&blocked, "not a directory").unwrap();

        let store = SecureStore::open(&StorageConfig {
            mode: InstallMode::Installed,
            data_dir: Some(blocked),
        });
        store.set_remember(true);

        let result = store.store_securely(
            "session",
            &Payload {
                token: "nope".to_string(),
                count: 0,
            },
        );
        assert!(matches!(result, Err(Error::StorageUnavailable(_))));

        // Volatile mode still works in the same environment.
        store.set_remember(false);
        store
            .store_securely(
                "session",
                &Payload {
                    token: "ok".to_string(),
                    count: 0,
                },
            )
            .unwrap();
    }

    #[test]
    fn test_obfuscation_roundtrip() {
        let fingerprint = device_fingerprint();
        let original = r#"{"token":"value with spaces and ünïcode"}"#;

        let encoded = obfuscate(original, &fingerprint);
        assert_ne!(encoded, original);
        assert_eq!(deobfuscate(&encoded, &fingerprint).unwrap(), original);
    }
}
