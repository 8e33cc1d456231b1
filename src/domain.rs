use std::fmt;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

pub const PROCESSING_SUFFIX: &str = "_tmp_processing";
pub const DOWNLOADED_SUFFIX: &str = "_downloaded";
pub const INVALID_SUFFIX: &str = "_invalid_samples";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LabCode(String);

impl LabCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LabCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LabCode {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().trim_matches('/').to_string();
        let is_valid = !normalized.is_empty()
            && !normalized.contains('/')
            && normalized != "."
            && normalized != ".."
            && !normalized.starts_with('.');
        if !is_valid {
            return Err(SyncError::InvalidLabCode(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

/// Timestamp tag shared by every processing folder created in one run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(String);

impl BatchId {
    pub fn now() -> Self {
        Self(chrono::Local::now().format("%Y%m%d%H%M%S").to_string())
    }

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Recovers the batch tag from a `{batch}_tmp_processing` folder left by an
    /// earlier run.
    pub fn from_processing_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(PROCESSING_SUFFIX)?;
        if stem.is_empty() {
            return None;
        }
        Some(Self(stem.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn processing_folder_name(&self) -> String {
        format!("{}{PROCESSING_SUFFIX}", self.0)
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum DownloadMode {
    DownloadOnly,
    DownloadClean,
    DeleteOnly,
}

impl fmt::Display for DownloadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadMode::DownloadOnly => write!(f, "download_only"),
            DownloadMode::DownloadClean => write!(f, "download_clean"),
            DownloadMode::DeleteOnly => write!(f, "delete_only"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderLifecycleState {
    RawLabFolder,
    SubSubmission,
    MergedProcessing,
    Downloaded,
    InvalidSamples,
    EmptyRemoved,
}

impl FolderLifecycleState {
    /// Derives the state of an existing remote folder from its name and depth
    /// below the transfer root (1 = lab folder).
    pub fn classify(path: &Utf8Path) -> Self {
        let depth = path.components().count();
        let name = path.file_name().unwrap_or_default();
        if depth <= 1 {
            FolderLifecycleState::RawLabFolder
        } else if name.ends_with(INVALID_SUFFIX) {
            FolderLifecycleState::InvalidSamples
        } else if name.ends_with(DOWNLOADED_SUFFIX) {
            FolderLifecycleState::Downloaded
        } else if name.ends_with(PROCESSING_SUFFIX) {
            FolderLifecycleState::MergedProcessing
        } else {
            FolderLifecycleState::SubSubmission
        }
    }

    pub fn can_transition_to(self, next: FolderLifecycleState) -> bool {
        use FolderLifecycleState::*;
        matches!(
            (self, next),
            (RawLabFolder, SubSubmission)
                | (SubSubmission, MergedProcessing)
                | (SubSubmission, EmptyRemoved)
                | (MergedProcessing, Downloaded)
                | (MergedProcessing, InvalidSamples)
                | (MergedProcessing, EmptyRemoved)
                | (InvalidSamples, InvalidSamples)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FolderLifecycleState::Downloaded
                | FolderLifecycleState::InvalidSamples
                | FolderLifecycleState::EmptyRemoved
        )
    }
}

impl fmt::Display for FolderLifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FolderLifecycleState::RawLabFolder => "raw-lab-folder",
            FolderLifecycleState::SubSubmission => "sub-submission",
            FolderLifecycleState::MergedProcessing => "merged-processing",
            FolderLifecycleState::Downloaded => "downloaded",
            FolderLifecycleState::InvalidSamples => "invalid-samples",
            FolderLifecycleState::EmptyRemoved => "empty-removed",
        };
        write!(f, "{label}")
    }
}

/// The transfer root and first-level lab folders are never deleted.
pub fn is_protected_folder(path: &Utf8Path) -> bool {
    path.components()
        .filter(|component| component.as_str() != ".")
        .count()
        <= 1
}

pub fn renamed_with_suffix(path: &Utf8Path, suffix: &str) -> Utf8PathBuf {
    let name = path.file_name().unwrap_or_default();
    let stem = name
        .strip_suffix(PROCESSING_SUFFIX)
        .unwrap_or(name)
        .to_string();
    match path.parent() {
        Some(parent) => parent.join(format!("{stem}{suffix}")),
        None => Utf8PathBuf::from(format!("{stem}{suffix}")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumOrigin {
    /// `fetched_checksum` matched the one declared by the lab's manifest.
    Manifest,
    /// No manifest entry; `fetched_checksum` was computed after the fetch.
    Computed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_name: String,
    pub local_path: Utf8PathBuf,
    /// Digest of `local_path` as written.
    pub checksum: String,
    /// Digest of the file as fetched, before compression. Equal to `checksum`
    /// unless the file was gzipped locally.
    pub fetched_checksum: String,
    pub checksum_origin: ChecksumOrigin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleFileRecord {
    pub sample_id: String,
    pub primary: FileRecord,
    pub secondary: Option<FileRecord>,
    pub batch_id: BatchId,
}
