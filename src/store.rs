use std::fs;
use std::path::PathBuf;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tempfile::{Builder, TempDir};

use crate::domain::{BatchId, LabCode};
use crate::error::SyncError;

/// Local side of the synchronizer: batch directories, scratch space and
/// atomically written JSON artifacts.
#[derive(Debug, Clone)]
pub struct Store {
    output_root: Utf8PathBuf,
}

impl Store {
    pub fn new(output_root: Utf8PathBuf) -> Self {
        Self { output_root }
    }

    pub fn output_root(&self) -> &Utf8Path {
        &self.output_root
    }

    pub fn batch_dir(&self, lab: &LabCode, batch: &BatchId) -> Utf8PathBuf {
        self.output_root.join(lab.as_str()).join(batch.as_str())
    }

    pub fn samples_path(dir: &Utf8Path, lab: &LabCode, batch: &BatchId) -> Utf8PathBuf {
        dir.join(format!("{lab}_{batch}_samples.json"))
    }

    pub fn log_summary_path(dir: &Utf8Path, lab: &LabCode, batch: &BatchId) -> Utf8PathBuf {
        dir.join(format!("{lab}_{batch}_log_summary.json"))
    }

    pub fn tagged_workbook_path(
        dir: &Utf8Path,
        lab: &LabCode,
        batch: &BatchId,
        original: &Utf8Path,
    ) -> Utf8PathBuf {
        let ext = original.extension().unwrap_or("xlsx");
        dir.join(format!("{lab}_{batch}_metadata.{ext}"))
    }

    pub fn run_summary_path(&self, batch: &BatchId) -> Utf8PathBuf {
        self.output_root.join(format!("{batch}_run_summary.json"))
    }

    pub fn run_log_path(&self, batch: &BatchId) -> Utf8PathBuf {
        self.output_root.join(format!("{batch}_log_summary.json"))
    }

    pub fn ensure_output_root(&self) -> Result<(), SyncError> {
        Self::ensure_dir(&self.output_root)
    }

    pub fn ensure_dir(path: &Utf8Path) -> Result<(), SyncError> {
        fs::create_dir_all(path.as_std_path()).map_err(|err| SyncError::Filesystem(err.to_string()))
    }

    /// Scratch directory for workbooks and manifests in flight; removed on drop.
    pub fn scratch_dir(&self, prefix: &str) -> Result<TempDir, SyncError> {
        self.ensure_output_root()?;
        Builder::new()
            .prefix(prefix)
            .tempdir_in(self.output_root.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))
    }

    pub fn remove_dir(path: &Utf8Path) -> Result<(), SyncError> {
        if path.as_std_path().exists() {
            fs::remove_dir_all(path.as_std_path())
                .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }

    pub fn remove_file(path: &Utf8Path) -> Result<(), SyncError> {
        if path.as_std_path().exists() {
            fs::remove_file(path.as_std_path())
                .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }

    pub fn rename_file(from: &Utf8Path, to: &Utf8Path) -> Result<(), SyncError> {
        if to.as_std_path().exists() {
            fs::remove_file(to.as_std_path())
                .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        }
        fs::rename(from.as_std_path(), to.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))
    }

    pub fn write_json_atomic<T: Serialize + ?Sized>(
        path: &Utf8Path,
        value: &T,
    ) -> Result<(), SyncError> {
        let content = serde_json::to_vec_pretty(value)
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        Self::write_bytes_atomic(path, &content)
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), SyncError> {
        let parent = path
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
            .unwrap_or(Utf8Path::new("."));
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let temp = Builder::new()
            .prefix(".seqbatch-write")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        fs::write(temp.path(), content).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn utf8(path: PathBuf) -> Result<Utf8PathBuf, SyncError> {
        Utf8PathBuf::from_path_buf(path)
            .map_err(|path| SyncError::Filesystem(format!("non-utf8 path: {}", path.display())))
    }
}
