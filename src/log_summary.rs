//! Append-only audit log of everything the run skipped, dropped or retried,
//! keyed by remote folder and, where it applies, by sample.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::domain::LabCode;
use crate::error::SyncError;
use crate::store::Store;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SampleLog {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FolderLog {
    pub lab: String,
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub samples: BTreeMap<String, SampleLog>,
}

impl FolderLog {
    fn new(lab: &str) -> Self {
        Self {
            lab: lab.to_string(),
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            samples: BTreeMap::new(),
        }
    }

    fn sample(&mut self, sample: &str) -> &mut SampleLog {
        self.samples
            .entry(sample.to_string())
            .or_insert_with(|| SampleLog {
                valid: true,
                ..SampleLog::default()
            })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogSummary {
    folders: BTreeMap<String, FolderLog>,
}

impl LogSummary {
    pub fn new() -> Self {
        Self::default()
    }

    fn folder(&mut self, lab: &LabCode, key: &str) -> &mut FolderLog {
        self.folders
            .entry(key.to_string())
            .or_insert_with(|| FolderLog::new(lab.as_str()))
    }

    pub fn error(&mut self, lab: &LabCode, key: &str, message: impl Into<String>) {
        let folder = self.folder(lab, key);
        folder.valid = false;
        folder.errors.push(message.into());
    }

    pub fn warning(&mut self, lab: &LabCode, key: &str, message: impl Into<String>) {
        self.folder(lab, key).warnings.push(message.into());
    }

    pub fn sample_error(
        &mut self,
        lab: &LabCode,
        key: &str,
        sample: &str,
        message: impl Into<String>,
    ) {
        let entry = self.folder(lab, key).sample(sample);
        entry.valid = false;
        entry.errors.push(message.into());
    }

    pub fn sample_warning(
        &mut self,
        lab: &LabCode,
        key: &str,
        sample: &str,
        message: impl Into<String>,
    ) {
        self.folder(lab, key)
            .sample(sample)
            .warnings
            .push(message.into());
    }

    pub fn get(&self, key: &str) -> Option<&FolderLog> {
        self.folders.get(key)
    }

    pub fn folders(&self) -> impl Iterator<Item = (&String, &FolderLog)> {
        self.folders.iter()
    }

    pub fn write_folder(&self, key: &str, path: &Utf8Path) -> Result<(), SyncError> {
        let mut selected = BTreeMap::new();
        if let Some(log) = self.folders.get(key) {
            selected.insert(key.to_string(), log.clone());
        }
        Store::write_json_atomic(path, &selected)
    }

    pub fn write_all(&self, path: &Utf8Path) -> Result<(), SyncError> {
        Store::write_json_atomic(path, &self.folders)
    }
}

/// The lab and remote folder being worked on, plus the log every component
/// reports into. Passed explicitly instead of being held as ambient state.
pub struct FolderContext<'a> {
    pub lab: LabCode,
    pub folder: Utf8PathBuf,
    log: &'a mut LogSummary,
}

impl<'a> FolderContext<'a> {
    pub fn new(lab: LabCode, folder: Utf8PathBuf, log: &'a mut LogSummary) -> Self {
        Self { lab, folder, log }
    }

    pub fn key(&self) -> &str {
        self.folder.as_str()
    }

    /// Re-targets the context at another folder of the same lab.
    pub fn with_folder(&mut self, folder: Utf8PathBuf) -> FolderContext<'_> {
        FolderContext {
            lab: self.lab.clone(),
            folder,
            log: &mut *self.log,
        }
    }

    pub fn error(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(lab = %self.lab, folder = %self.folder, "{message}");
        self.log.error(&self.lab, self.folder.as_str(), message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(lab = %self.lab, folder = %self.folder, "{message}");
        self.log.warning(&self.lab, self.folder.as_str(), message);
    }

    pub fn sample_error(&mut self, sample: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(lab = %self.lab, folder = %self.folder, sample, "{message}");
        self.log
            .sample_error(&self.lab, self.folder.as_str(), sample, message);
    }

    pub fn sample_warn(&mut self, sample: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(lab = %self.lab, folder = %self.folder, sample, "{message}");
        self.log
            .sample_warning(&self.lab, self.folder.as_str(), sample, message);
    }

    pub fn log(&self) -> &LogSummary {
        &*self.log
    }
}
