// SPDX-License-Identifier: Apache-2.0
//! Filesystem-backed configuration store for Legion binaries.
//!
//! `ConfigStore` is a storage port over named raw byte blobs; `FsConfigStore`
//! resolves them to JSON files under the platform config directory.
//! `ConfigService` adds typed `load`/`save` on top of any `ConfigStore`.

use directories::ProjectDirs;
use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

/// Storage port for raw config blobs, keyed by logical name.
pub trait ConfigStore {
    /// Load a raw config blob. Returns `NotFound` when missing.
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError>;
    /// Persist a raw config blob.
    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError>;
}

/// Error type for config operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Key not present in store.
    #[error("not found")]
    NotFound,
    /// I/O error while reading/writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization/deserialization failure.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    /// Catch-all error variant.
    #[error("other: {0}")]
    Other(String),
}

/// Store configs as JSON files under the platform config directory.
pub struct FsConfigStore {
    base: PathBuf,
}

impl FsConfigStore {
    /// Create a store rooted at the user config directory
    /// (e.g. `~/.config/legion`).
    ///
    /// # Errors
    ///
    /// Returns an error if the platform config directory cannot be resolved
    /// or created.
    pub fn new() -> Result<Self, ConfigError> {
        let proj = ProjectDirs::from("dev", "flyingrobots", "legion")
            .ok_or_else(|| ConfigError::Other("could not resolve config dir".into()))?;
        let base = proj.config_dir().to_path_buf();
        fs::create_dir_all(&base)?;
        Ok(Self { base })
    }

    /// Create a store rooted at an arbitrary directory, bypassing platform
    /// resolution (used by tests and by `--config-dir` overrides).
    ///
    /// # Errors
    ///
    /// Returns an error if `base` cannot be created.
    pub fn at(base: PathBuf) -> Result<Self, ConfigError> {
        fs::create_dir_all(&base)?;
        Ok(Self { base })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base.join(format!("{key}.json"))
    }
}

impl ConfigStore for FsConfigStore {
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
        let path = self.path_for(key);
        match fs::read(path) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(ConfigError::NotFound),
            Err(err) => Err(ConfigError::Io(err)),
        }
    }

    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, data)?;
        Ok(())
    }
}

/// Thin service that serializes config values and delegates storage to a
/// [`ConfigStore`].
pub struct ConfigService<S> {
    store: S,
}

impl<S> ConfigService<S> {
    /// Create a new service using the given store.
    pub const fn new(store: S) -> Self {
        Self { store }
    }

    /// Consume the service and return the inner store.
    pub fn into_inner(self) -> S {
        self.store
    }
}

impl<S> ConfigService<S>
where
    S: ConfigStore,
{
    /// Load and deserialize a config value for `key`. Returns `Ok(None)` if
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying store fails, or the stored bytes
    /// don't deserialize as `T`.
    pub fn load<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: DeserializeOwned,
    {
        match self.store.load_raw(key) {
            Ok(bytes) => {
                if bytes.is_empty() {
                    return Ok(None);
                }
                Ok(Some(serde_json::from_slice(&bytes)?))
            }
            Err(ConfigError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Serialize and persist a config value for `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the underlying store fails.
    pub fn save<T>(&self, key: &str, value: &T) -> Result<(), ConfigError>
    where
        T: Serialize,
    {
        let data = serde_json::to_vec_pretty(value)?;
        self.store.save_raw(key, &data)
    }
}

/// Listener preferences persisted across `legion-server` runs: the last
/// `--listen` address and default `--save` path, so a bare restart picks up
/// where the operator left off.
#[derive(Debug, Clone, Default, Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ListenerPrefs {
    /// Last bound listen address (host:port or socket path).
    pub listen: Option<String>,
    /// Last save file path used.
    pub save_path: Option<String>,
}

/// Config key under which [`ListenerPrefs`] are stored.
pub const LISTENER_PREFS_KEY: &str = "listener_prefs";

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct InMemoryConfigStore {
        data: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    }

    impl ConfigStore for InMemoryConfigStore {
        fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
            self.data
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .get(key)
                .cloned()
                .ok_or(ConfigError::NotFound)
        }

        fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
            self.data
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert(key.to_owned(), data.to_vec());
            Ok(())
        }
    }

    #[test]
    fn service_round_trips_typed_values() {
        let service = ConfigService::new(InMemoryConfigStore::default());
        let prefs = ListenerPrefs {
            listen: Some("127.0.0.1:7777".to_owned()),
            save_path: Some("/var/lib/legion/world.sav".to_owned()),
        };
        service.save(LISTENER_PREFS_KEY, &prefs).unwrap();
        let loaded: Option<ListenerPrefs> = service.load(LISTENER_PREFS_KEY).unwrap();
        assert_eq!(loaded, Some(prefs));
    }

    #[test]
    fn service_load_missing_key_is_none_not_error() {
        let service = ConfigService::new(InMemoryConfigStore::default());
        let loaded: Option<ListenerPrefs> = service.load(LISTENER_PREFS_KEY).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn fs_config_store_round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!("legion-config-test-{}", std::process::id()));
        let store = FsConfigStore::at(dir.clone()).unwrap();
        let service = ConfigService::new(store);
        let prefs = ListenerPrefs {
            listen: Some("0.0.0.0:9000".to_owned()),
            save_path: None,
        };
        service.save(LISTENER_PREFS_KEY, &prefs).unwrap();

        let store2 = FsConfigStore::at(dir.clone()).unwrap();
        let service2 = ConfigService::new(store2);
        let loaded: Option<ListenerPrefs> = service2.load(LISTENER_PREFS_KEY).unwrap();
        assert_eq!(loaded, Some(prefs));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn fs_config_store_reports_not_found_for_missing_key() {
        let dir =
            std::env::temp_dir().join(format!("legion-config-test-missing-{}", std::process::id()));
        let store = FsConfigStore::at(dir.clone()).unwrap();
        let err = store.load_raw("no-such-key").unwrap_err();
        assert!(matches!(err, ConfigError::NotFound));
        let _ = fs::remove_dir_all(dir);
    }
}
