//! Durable storage for the assistant's memories.
//!
//! Memories are short facts ("User likes golf") kept as an ordered list in a
//! single JSON file.  Every mutation rewrites the whole file.  The new
//! contents are written to a sibling temporary file first and then renamed
//! over the store, so an interrupted write leaves the previous list intact.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::observability::MEMORY_WRITES;

const APP_DIR: &str = "eddie";
const MEMORY_FILE: &str = "memories.json";

/// The ordered list of memories.
pub type MemoryList = Vec<String>;

/// A file-backed list of memories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryStore {
    path: PathBuf,
}

impl MemoryStore {
    /// Use the store at `path`.  Nothing touches the disk until `load`.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Use the store at the per-user default location.
    pub fn open_default() -> Result<Self> {
        Ok(Self::open(Self::default_path()?))
    }

    /// The per-user default location: `<config dir>/eddie/memories.json`.
    pub fn default_path() -> Result<PathBuf> {
        let base = dirs::config_dir().ok_or_else(|| {
            Error::validation(
                "cannot determine the configuration directory for this user",
                Some("memory_path".to_string()),
            )
        })?;
        Ok(base.join(APP_DIR).join(MEMORY_FILE))
    }

    /// Where the memories live.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return the persisted memories.
    ///
    /// If no store exists yet, an empty one is created (with any missing
    /// parent directories) and the empty list is returned.
    pub fn load(&self) -> Result<MemoryList> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "creating empty memory store");
            let empty = MemoryList::new();
            self.save(&empty)?;
            return Ok(empty);
        }
        let content = fs::read_to_string(&self.path).map_err(|err| {
            Error::io(
                format!("failed to read memories from {}", self.path.display()),
                err,
            )
        })?;
        if content.trim().is_empty() {
            return Ok(MemoryList::new());
        }
        serde_json::from_str(&content).map_err(|err| {
            Error::serialization(
                format!("failed to parse memories in {}", self.path.display()),
                Some(Box::new(err)),
            )
        })
    }

    /// Append `memory` and return the updated list.
    pub fn append(&self, memory: impl Into<String>) -> Result<MemoryList> {
        let mut memories = self.load()?;
        memories.push(memory.into());
        self.save(&memories)?;
        Ok(memories)
    }

    /// Remove the memory at `index` and return the updated list.
    ///
    /// An out-of-range index is a validation error and leaves the store as is.
    pub fn delete(&self, index: usize) -> Result<MemoryList> {
        let mut memories = self.load()?;
        if index >= memories.len() {
            return Err(Error::validation(
                format!(
                    "memory index {index} out of range (have {} memories)",
                    memories.len()
                ),
                Some("index".to_string()),
            ));
        }
        memories.remove(index);
        self.save(&memories)?;
        Ok(memories)
    }

    /// Rewrite the whole store with `memories`.
    pub fn save(&self, memories: &[String]) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|err| {
                Error::io(
                    format!("failed to create directory {}", parent.display()),
                    err,
                )
            })?;
        }

        let tmp_path = self.tmp_path();
        let file = fs::File::create(&tmp_path).map_err(|err| {
            Error::io(
                format!("failed to create {}", tmp_path.display()),
                err,
            )
        })?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, memories).map_err(|err| {
            Error::serialization("failed to serialize memories", Some(Box::new(err)))
        })?;
        writer
            .flush()
            .and_then(|()| writer.get_ref().sync_all())
            .map_err(|err| Error::io(format!("failed to write {}", tmp_path.display()), err))?;
        drop(writer);

        fs::rename(&tmp_path, &self.path).map_err(|err| {
            Error::io(
                format!("failed to replace {}", self.path.display()),
                err,
            )
        })?;
        MEMORY_WRITES.click();
        debug!(path = %self.path.display(), count = memories.len(), "memories saved");
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| MEMORY_FILE.into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
