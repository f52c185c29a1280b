//! JSON snapshot backend: the whole table image is rewritten atomically
//! (temp file, fsync, rename) on every commit, so a crash leaves either the
//! previous or the new snapshot on disk, never a mix.

use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::tables::IndexTables;

pub struct JsonIndexStore {
    path: PathBuf,
}

impl JsonIndexStore {
    /// Open or create the snapshot at `dir/index.json`.
    pub fn open(dir: &Path) -> Self {
        JsonIndexStore {
            path: dir.join("index.json"),
        }
    }

    /// Read the last committed snapshot; empty if none was written yet.
    pub fn load(&self) -> Result<IndexTables> {
        if !self.path.exists() {
            return Ok(IndexTables::default());
        }
        let content = fs::read(&self.path)
            .with_context(|| format!("reading index: {}", self.path.display()))?;
        let mut tables: IndexTables = serde_json::from_slice(&content)
            .with_context(|| format!("parsing index: {}", self.path.display()))?;
        tables.rebuild_openfs();
        Ok(tables)
    }

    pub fn commit(&mut self, tables: &IndexTables) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating index dir: {}", parent.display()))?;
        }

        let json = serde_json::to_vec(tables).context("serializing index")?;

        let tmp_path = self.path.with_extension("tmp");
        let mut tmp = fs::File::create(&tmp_path)
            .with_context(|| format!("writing index temp: {}", tmp_path.display()))?;
        tmp.write_all(&json)
            .with_context(|| format!("writing index temp: {}", tmp_path.display()))?;
        tmp.sync_all()
            .with_context(|| format!("syncing index temp: {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("renaming index: {}", self.path.display()))?;
        Ok(())
    }
}
