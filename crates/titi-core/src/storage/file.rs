use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::{KvBackend, StorageEvent};

const ITEM_EXTENSION: &str = "json";

/// One file per key inside a data directory.
///
/// Writes go through a temp file in the same directory and are renamed into
/// place, so concurrent readers never see a partial value. Changes made by
/// other processes are found by comparing file contents with the last value
/// this handle wrote or observed.
#[derive(Debug)]
pub struct FileStorage {
    pub data_dir: PathBuf,
    known: RefCell<HashMap<String, Option<String>>>,
}

impl FileStorage {
    #[tracing::instrument(skip(data_dir))]
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        let data_dir = data_dir.to_path_buf();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;

        let storage = Self {
            data_dir,
            known: RefCell::new(HashMap::new()),
        };

        // Baseline so that only later changes are reported as events.
        for key in storage.list_keys()? {
            let value = storage.read_file(&key)?;
            storage.known.borrow_mut().insert(key, value);
        }

        info!(
            data_dir = %storage.data_dir.display(),
            keys = storage.known.borrow().len(),
            "opened file storage"
        );
        Ok(storage)
    }

    pub fn item_path(&self, key: &str) -> PathBuf {
        self.data_dir.join(format!("{key}.{ITEM_EXTENSION}"))
    }

    fn list_keys(&self) -> anyhow::Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.data_dir)
            .with_context(|| format!("failed to read {}", self.data_dir.display()))?
        {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            if path.extension().and_then(|ext| ext.to_str()) != Some(ITEM_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                keys.push(stem.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn read_file(&self, key: &str) -> anyhow::Result<Option<String>> {
        let path = self.item_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed reading {}", path.display()))?;
        Ok(Some(raw))
    }
}

impl KvBackend for FileStorage {
    #[tracing::instrument(skip(self))]
    fn get_item(&self, key: &str) -> anyhow::Result<Option<String>> {
        let value = self.read_file(key)?;
        self.known
            .borrow_mut()
            .insert(key.to_string(), value.clone());
        Ok(value)
    }

    #[tracing::instrument(skip(self, value), fields(bytes = value.len()))]
    fn set_item(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let path = self.item_path(key);
        debug!(file = %path.display(), "writing item atomically");

        let mut temp = NamedTempFile::new_in(&self.data_dir)?;
        temp.write_all(value.as_bytes())?;
        temp.flush()?;
        temp.persist(&path)
            .map_err(|err| anyhow!("failed to persist {}: {}", path.display(), err))?;

        self.known
            .borrow_mut()
            .insert(key.to_string(), Some(value.to_string()));
        Ok(())
    }

    fn drain_events(&self) -> Vec<StorageEvent> {
        let mut keys = match self.list_keys() {
            Ok(keys) => keys,
            Err(err) => {
                warn!(error = %err, "failed to scan data directory for changes");
                return Vec::new();
            }
        };
        for key in self.known.borrow().keys() {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }

        let mut events = Vec::new();
        for key in keys {
            let current = match self.read_file(&key) {
                Ok(current) => current,
                Err(err) => {
                    warn!(key = %key, error = %err, "failed to read item while scanning");
                    continue;
                }
            };
            let mut known = self.known.borrow_mut();
            if known.get(&key) != Some(&current) {
                debug!(key = %key, "detected external change");
                known.insert(key.clone(), current.clone());
                events.push(StorageEvent {
                    key,
                    new_value: current,
                });
            }
        }
        events
    }
}
