//! Author-side JSON key-value store.
//!
//! Every write goes to `<key>.json.tmp` then is renamed into place, so a
//! crash between the two steps leaves either the old value or the new value
//! intact — never a partially-written file (spec §4.3-S1). The rename is
//! followed by a [`StorageWriteEvent`] published on the [`share_bus::Bus`]
//! (spec §4.3-S2); subscribers that observe the event are guaranteed the
//! rename has already landed.

use share_bus::{Bus, Event};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error on key {key:?}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("stored value for key {0:?} is not valid JSON: {1}")]
    Corrupt(String, serde_json::Error),
}

/// Published after a [`Storage::write_json`] rename succeeds.
#[derive(Debug, Clone)]
pub struct StorageWriteEvent {
    pub key: String,
    pub content: serde_json::Value,
}

impl Event for StorageWriteEvent {
    const NAME: &'static str = "storage.write";
}

/// One registered migration: `index` is its position in the ordered
/// sequence; `run` must be idempotent and safe to re-invoke after a crash
/// mid-migration.
pub struct Migration {
    pub index: u32,
    pub run: fn(&Storage) -> Result<(), StorageError>,
}

/// A session-scoped JSON key-value store rooted at a directory.
#[derive(Clone)]
pub struct Storage {
    root: PathBuf,
    bus: Bus,
}

impl Storage {
    /// Open (creating if absent) the store rooted at `root`, running any
    /// migration in `migrations` whose index is at or beyond the persisted
    /// counter.
    pub fn open(root: impl Into<PathBuf>, bus: Bus, migrations: &[Migration]) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StorageError::Io {
            key: String::new(),
            source,
        })?;
        let storage = Storage { root, bus };
        storage.run_migrations(migrations)?;
        Ok(storage)
    }

    fn migration_counter_path(&self) -> PathBuf {
        self.root.join(".migration")
    }

    fn migration_counter(&self) -> u32 {
        fs::read_to_string(self.migration_counter_path())
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    fn set_migration_counter(&self, value: u32) -> Result<(), StorageError> {
        let path = self.migration_counter_path();
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, value.to_string()).map_err(|source| StorageError::Io {
            key: ".migration".to_owned(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| StorageError::Io {
            key: ".migration".to_owned(),
            source,
        })?;
        Ok(())
    }

    fn run_migrations(&self, migrations: &[Migration]) -> Result<(), StorageError> {
        let mut counter = self.migration_counter();
        let mut sorted: Vec<&Migration> = migrations.iter().collect();
        sorted.sort_by_key(|m| m.index);
        for migration in sorted {
            if migration.index < counter {
                continue;
            }
            (migration.run)(self)?;
            counter = migration.index + 1;
            self.set_migration_counter(counter)?;
        }
        Ok(())
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key.split('/') {
            path.push(segment);
        }
        path.set_extension("json");
        path
    }

    /// Read the JSON value stored at `key`, or `None` if absent.
    pub fn read_json(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| StorageError::Corrupt(key.to_owned(), e))?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Io {
                key: key.to_owned(),
                source,
            }),
        }
    }

    /// Write `value` at `key` via tmp-write + rename, then publish a
    /// [`StorageWriteEvent`].
    pub fn write_json(&self, key: &str, value: &serde_json::Value) -> Result<(), StorageError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| StorageError::Io {
                key: key.to_owned(),
                source,
            })?;
        }
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec(value).expect("serde_json::Value always serializes");
        fs::write(&tmp, &bytes).map_err(|source| StorageError::Io {
            key: key.to_owned(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| StorageError::Io {
            key: key.to_owned(),
            source,
        })?;
        self.bus.publish(StorageWriteEvent {
            key: key.to_owned(),
            content: value.clone(),
        });
        Ok(())
    }

    /// Remove the value stored at `key`, if any.
    pub fn remove(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io {
                key: key.to_owned(),
                source,
            }),
        }
    }

    /// Remove every key under `prefix`.
    pub fn remove_dir(&self, prefix: &str) -> Result<(), StorageError> {
        let mut dir = self.root.clone();
        for segment in prefix.split('/') {
            dir.push(segment);
        }
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io {
                key: prefix.to_owned(),
                source,
            }),
        }
    }

    /// List every key under `prefix` in ascending lexicographic order
    /// (spec §4.3-S3).
    pub fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut dir = self.root.clone();
        for segment in prefix.split('/') {
            if !segment.is_empty() {
                dir.push(segment);
            }
        }
        let mut keys = Vec::new();
        collect_keys(&self.root, &dir, &mut keys)?;
        keys.sort();
        Ok(keys)
    }
}

fn collect_keys(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<(), StorageError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(StorageError::Io {
                key: dir.display().to_string(),
                source,
            })
        }
    };
    for entry in entries {
        let entry = entry.map_err(|source| StorageError::Io {
            key: dir.display().to_string(),
            source,
        })?;
        let path = entry.path();
        if path.is_dir() {
            collect_keys(root, &path, out)?;
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let relative = path
            .strip_prefix(root)
            .expect("walked path is under root")
            .with_extension("");
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        out.push(key);
    }
    Ok(())
}
