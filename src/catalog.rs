//! Compaction catalog: the persistent index of detached WAL files and
//! base files, plus the max durable epoch they cover.
//!
//! Writes are atomic: write-to-temp, fsync, rename.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CatalogError;

pub const CATALOG_FILE_NAME: &str = "compaction_catalog";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct CompactedFile {
    pub filename: String,
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Catalog {
    pub max_epoch_id: u64,
    pub compacted_files: BTreeSet<CompactedFile>,
    pub detached_pwals: BTreeSet<String>,
}

impl Catalog {
    pub fn empty() -> Self {
        Catalog::default()
    }

    pub fn load_or_default(dir: &Path) -> Result<Self, CatalogError> {
        let path = dir.join(CATALOG_FILE_NAME);
        if !path.exists() {
            return Ok(Catalog::empty());
        }
        let content = std::fs::read_to_string(&path)?;
        serde_json::from_str(&content).map_err(|source| CatalogError::Parse { path, source })
    }

    /// Atomically persist this catalog to `dir`.
    pub fn save(&self, dir: &Path) -> Result<(), CatalogError> {
        let path = dir.join(CATALOG_FILE_NAME);
        let tmp_path = dir.join(format!("{CATALOG_FILE_NAME}.tmp"));
        {
            let mut tmp = File::create(&tmp_path)?;
            let json = serde_json::to_string_pretty(self).expect("catalog serializes");
            tmp.write_all(json.as_bytes())?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    pub fn active_base_file(&self) -> Option<&CompactedFile> {
        self.compacted_files.iter().max_by_key(|f| f.version)
    }

    pub fn is_detached_known(&self, filename: &str) -> bool {
        self.detached_pwals.contains(filename)
    }

    pub fn record_compaction(&mut self, max_epoch_id: u64, base_file: CompactedFile, newly_detached: Vec<String>) {
        self.max_epoch_id = self.max_epoch_id.max(max_epoch_id);
        self.compacted_files.clear();
        self.compacted_files.insert(base_file);
        self.detached_pwals.extend(newly_detached);
    }
}

pub fn catalog_path(dir: &Path) -> PathBuf {
    dir.join(CATALOG_FILE_NAME)
}
