//! Filesystem layout helpers and atomic write operations
//!
//! Manages the store directory (`config.json` plus one JSON snapshot per
//! instance under `instances/`) and ensures atomic writes via temp files and
//! renames.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;
use uuid::Uuid;

use super::RuntimeConfig;
use super::error::{StoreError, StoreResult};
use super::instance::InstanceSnapshot;

/// Storage manager for runtime persistence
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Create a new storage manager
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Get the root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the config file path
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Get the instances directory path
    pub fn instances_dir(&self) -> PathBuf {
        self.root.join("instances")
    }

    /// Get the snapshot path of one instance
    pub fn instance_path(&self, id: Uuid) -> PathBuf {
        self.instances_dir().join(format!("{id}.json"))
    }

    /// Write data atomically to a file
    ///
    /// Creates a temporary file, writes the data, syncs, then renames
    pub fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        let temp_path = path.with_extension("tmp");

        let mut file = File::create(&temp_path)
            .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
        file.write_all(data).context("Failed to write data")?;
        file.sync_all().context("Failed to sync file")?;
        drop(file);

        fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

        // Sync parent directory
        if let Some(parent) = path.parent() {
            let dir = OpenOptions::new()
                .read(true)
                .open(parent)
                .with_context(|| format!("Failed to open directory: {:?}", parent))?;
            dir.sync_all().context("Failed to sync directory")?;
        }

        Ok(())
    }

    /// Read a file
    pub fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).with_context(|| format!("Failed to read file: {:?}", path))
    }

    /// Create a directory and all parent directories
    pub fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).with_context(|| format!("Failed to create directory: {:?}", path))
    }

    /// List files in a directory
    pub fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path).with_context(|| format!("Failed to read directory: {:?}", path))? {
            entries.push(entry?.path());
        }
        Ok(entries)
    }
}

/// Initialize the store directories
pub fn init_storage(root: &Path) -> Result<()> {
    let storage = Storage::new(root.to_path_buf());
    storage.create_dir_all(root)?;
    storage.create_dir_all(&storage.instances_dir())?;
    Ok(())
}

/// Write runtime configuration
pub fn write_config(config: &RuntimeConfig) -> Result<()> {
    let storage = Storage::new(config.root.clone());
    let json = serde_json::to_vec_pretty(config).context("Failed to serialize config")?;
    storage.write_atomic(&storage.config_path(), &json)
}

/// Load runtime configuration
pub fn load_config(root: &Path) -> Result<RuntimeConfig> {
    let storage = Storage::new(root.to_path_buf());
    let data = storage.read_file(&storage.config_path())?;
    serde_json::from_slice(&data).context("Failed to deserialize config")
}

/// File-backed store of instance snapshots
#[derive(Debug, Clone)]
pub struct InstanceStore {
    storage: Storage,
}

impl InstanceStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let storage = Storage::new(root.into());
        init_storage(storage.root())?;
        Ok(Self { storage })
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        self.storage.root()
    }

    /// Save a snapshot, replacing any earlier one for the same instance
    pub fn save(&self, snapshot: &InstanceSnapshot) -> StoreResult<()> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        self.storage
            .write_atomic(&self.storage.instance_path(snapshot.instance_id), &json)?;
        debug!("persisted instance {}", snapshot.instance_id);
        Ok(())
    }

    /// Load the snapshot of an instance
    pub fn load(&self, id: Uuid) -> StoreResult<InstanceSnapshot> {
        let data = match fs::read(self.storage.instance_path(id)) {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(StoreError::NotFound(id)),
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    /// Delete the snapshot of an instance; returns false if there was none
    pub fn delete(&self, id: Uuid) -> StoreResult<bool> {
        match fs::remove_file(self.storage.instance_path(id)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Ids of every stored instance, sorted
    pub fn list(&self) -> StoreResult<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self
            .storage
            .list_dir(&self.storage.instances_dir())?
            .iter()
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| path.file_stem()?.to_str()?.parse().ok())
            .collect();
        ids.sort();
        Ok(ids)
    }
}
