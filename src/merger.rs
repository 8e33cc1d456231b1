//! Folds every timestamped sub-submission of one lab into a single
//! `{batch}_tmp_processing` folder on the remote side.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};

use crate::checksum::{ChecksumManifest, ChecksumRegistry};
use crate::config::SyncConfig;
use crate::domain::{
    BatchId, DOWNLOADED_SUFFIX, INVALID_SUFFIX, PROCESSING_SUFFIX, is_protected_folder,
};
use crate::error::SyncError;
use crate::log_summary::FolderContext;
use crate::store::Store;
use crate::transfer::{RemoteEntry, TransferClient};
use crate::workbook::MetadataWorkbook;

/// A sub-folder whose sequencing files were moved into a processing folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedFolder {
    pub path: Utf8PathBuf,
    pub workbook: Utf8PathBuf,
    pub manifests: Vec<Utf8PathBuf>,
    pub moved_files: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    /// Processing folders ready for download, including ones left by an
    /// earlier, interrupted run.
    pub processing_folders: Vec<Utf8PathBuf>,
    pub consumed: Vec<ConsumedFolder>,
}

struct Candidate {
    path: Utf8PathBuf,
    files: Vec<RemoteEntry>,
}

struct ValidatedFolder {
    path: Utf8PathBuf,
    workbook_remote: Utf8PathBuf,
    workbook: MetadataWorkbook,
    sequencing: Vec<RemoteEntry>,
    manifests: Vec<Utf8PathBuf>,
}

pub struct SubmissionMerger<'a> {
    config: &'a SyncConfig,
    checksums: &'a ChecksumRegistry,
    store: &'a Store,
    batch: &'a BatchId,
}

impl<'a> SubmissionMerger<'a> {
    pub fn new(
        config: &'a SyncConfig,
        checksums: &'a ChecksumRegistry,
        store: &'a Store,
        batch: &'a BatchId,
    ) -> Self {
        Self {
            config,
            checksums,
            store,
            batch,
        }
    }

    /// `ctx.folder` is the lab folder. Sub-folders that fail pre-validation are
    /// logged and left untouched; only a lost session is returned as an error.
    pub fn merge_lab(
        &self,
        transfer: &mut dyn TransferClient,
        ctx: &mut FolderContext<'_>,
    ) -> Result<MergeOutcome, SyncError> {
        let lab_dir = ctx.folder.clone();
        let entries = transfer.list(&lab_dir, true)?;
        let mut outcome = MergeOutcome::default();

        let mut by_folder: BTreeMap<Utf8PathBuf, Vec<RemoteEntry>> = BTreeMap::new();
        by_folder.insert(lab_dir.clone(), Vec::new());
        for entry in entries {
            if entry.is_dir() {
                if entry.path.parent() == Some(lab_dir.as_path())
                    && entry.name().ends_with(PROCESSING_SUFFIX)
                {
                    outcome.processing_folders.push(entry.path.clone());
                }
                by_folder.entry(entry.path).or_default();
            } else if let Some(parent) = entry.path.parent() {
                by_folder
                    .entry(parent.to_path_buf())
                    .or_default()
                    .push(entry);
            }
        }

        let candidates: Vec<Candidate> = by_folder
            .into_iter()
            .filter(|(path, _)| !is_reserved(&lab_dir, path))
            .filter(|(_, files)| !files.is_empty())
            .map(|(path, files)| Candidate { path, files })
            .collect();
        if candidates.is_empty() {
            tracing::debug!(lab = %ctx.lab, "no pending sub-submissions");
            return Ok(outcome);
        }

        let scratch = self.store.scratch_dir("seqbatch-merge")?;
        let mut validated = Vec::new();
        for (idx, candidate) in candidates.into_iter().enumerate() {
            let local_dir = scratch.path().join(idx.to_string());
            let mut sub = ctx.with_folder(candidate.path.clone());
            if let Some(folder) = self.prevalidate(transfer, &mut sub, candidate, &local_dir)? {
                validated.push(folder);
            }
        }
        if validated.is_empty() {
            ctx.warn("no sub-submission passed validation; nothing merged");
            return Ok(outcome);
        }

        let names: Vec<String> = validated[0]
            .workbook
            .header()
            .names()
            .iter()
            .map(|name| name.to_string())
            .collect();
        let (validated, mismatched): (Vec<_>, Vec<_>) = validated
            .into_iter()
            .partition(|folder| folder.workbook.header().names() == names);
        for folder in mismatched {
            ctx.with_folder(folder.path.clone())
                .error("metadata columns differ from the other sub-submissions; skipped");
        }

        let processing = lab_dir.join(self.batch.processing_folder_name());
        transfer.make_directory(&processing)?;
        tracing::info!(lab = %ctx.lab, folder = %processing, sources = validated.len(), "merging sub-submissions");

        let merged = MetadataWorkbook::merge(
            validated
                .iter()
                .map(|folder| folder.workbook.clone())
                .collect(),
        )?;
        let merged_name = merged_file_name(&merged.source);
        let merged_local = scratch.path().join(&merged_name);
        merged.save(&merged_local)?;
        transfer.upload(&merged_local, &processing.join(&merged_name))?;

        self.merge_manifests(transfer, ctx, &validated, &processing, scratch.path())?;

        let mut present: BTreeSet<String> = transfer
            .list_files(&processing)?
            .into_iter()
            .map(|entry| entry.name().to_string())
            .collect();
        for folder in validated {
            let mut moved = 0;
            for file in &folder.sequencing {
                let name = file.name().to_string();
                if present.contains(&name) {
                    ctx.warn(format!(
                        "{} already present in {processing}; left in place",
                        file.path
                    ));
                    continue;
                }
                match transfer.rename(&file.path, &processing.join(&name)) {
                    Ok(()) => {
                        present.insert(name);
                        moved += 1;
                    }
                    Err(err) if err.is_fatal_to_run() => return Err(err),
                    Err(err) => ctx.error(format!("could not move {}: {err}", file.path)),
                }
            }
            outcome.consumed.push(ConsumedFolder {
                path: folder.path,
                workbook: folder.workbook_remote,
                manifests: folder.manifests,
                moved_files: moved,
            });
        }

        if !outcome.processing_folders.contains(&processing) {
            outcome.processing_folders.push(processing);
        }
        Ok(outcome)
    }

    fn prevalidate(
        &self,
        transfer: &mut dyn TransferClient,
        ctx: &mut FolderContext<'_>,
        candidate: Candidate,
        local_dir: &Path,
    ) -> Result<Option<ValidatedFolder>, SyncError> {
        let (sequencing, others): (Vec<RemoteEntry>, Vec<RemoteEntry>) = candidate
            .files
            .into_iter()
            .partition(|entry| self.config.is_sequencing_file(entry.name()));
        if sequencing.is_empty() {
            ctx.warn("no sequencing files with an allowed extension; skipped");
            return Ok(None);
        }

        let workbooks: Vec<&RemoteEntry> = others
            .iter()
            .filter(|entry| self.config.is_metadata_file(entry.name()))
            .collect();
        let workbook_entry = match workbooks.as_slice() {
            [only] => *only,
            found => {
                ctx.error(format!(
                    "expected exactly one metadata spreadsheet, found {}; skipped",
                    found.len()
                ));
                return Ok(None);
            }
        };

        let local = local_dir.join(workbook_entry.name());
        if let Err(err) = transfer.fetch(&workbook_entry.path, &local) {
            if err.is_fatal_to_run() {
                return Err(err);
            }
            ctx.error(format!("metadata spreadsheet unreadable: {err}; skipped"));
            return Ok(None);
        }
        let workbook = match MetadataWorkbook::load(&local, &self.config.metadata) {
            Ok(workbook) => workbook,
            Err(err) => {
                ctx.error(format!("{err}; skipped"));
                return Ok(None);
            }
        };

        let manifests = others
            .iter()
            .filter(|entry| self.config.is_manifest_file(entry.name()))
            .map(|entry| entry.path.clone())
            .collect();

        Ok(Some(ValidatedFolder {
            path: candidate.path,
            workbook_remote: workbook_entry.path.clone(),
            workbook,
            sequencing,
            manifests,
        }))
    }

    fn merge_manifests(
        &self,
        transfer: &mut dyn TransferClient,
        ctx: &mut FolderContext<'_>,
        validated: &[ValidatedFolder],
        processing: &Utf8Path,
        scratch: &Path,
    ) -> Result<(), SyncError> {
        let mut parsed = Vec::new();
        let mut upload_name = None;
        for (idx, remote) in validated
            .iter()
            .flat_map(|folder| folder.manifests.iter())
            .enumerate()
        {
            let name = remote.file_name().unwrap_or("md5sum.txt");
            let local = scratch.join("manifests").join(idx.to_string()).join(name);
            match transfer.fetch(remote, &local) {
                Ok(()) => {
                    parsed.push(self.checksums.parse_manifest(&local));
                    upload_name.get_or_insert_with(|| name.to_string());
                }
                Err(err) if err.is_fatal_to_run() => return Err(err),
                Err(err) => ctx.warn(format!("checksum manifest {remote} not fetched: {err}")),
            }
        }

        let merged = ChecksumManifest::merge(parsed);
        let Some(name) = upload_name.filter(|_| !merged.is_empty()) else {
            return Ok(());
        };
        let local = scratch.join(&name);
        fs::write(&local, merged.render()).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        transfer.upload(&local, &processing.join(&name))
    }

    /// Removes the merged workbook and manifests from consumed sub-folders and
    /// deletes the folders once empty. The lab folder itself is never removed.
    pub fn retire_consumed(
        &self,
        transfer: &mut dyn TransferClient,
        ctx: &mut FolderContext<'_>,
        consumed: &[ConsumedFolder],
    ) -> Result<(), SyncError> {
        // Deepest folders first so parents can empty out.
        let mut ordered: Vec<&ConsumedFolder> = consumed.iter().collect();
        ordered.sort_by_key(|folder| std::cmp::Reverse(folder.path.components().count()));

        for folder in ordered {
            let mut sub = ctx.with_folder(folder.path.clone());
            let remaining_sequencing = transfer
                .list_files(&folder.path)?
                .into_iter()
                .filter(|entry| self.config.is_sequencing_file(entry.name()))
                .count();
            if remaining_sequencing > 0 {
                sub.warn(format!(
                    "{remaining_sequencing} sequencing file(s) not moved; sub-folder kept"
                ));
                continue;
            }
            for path in std::iter::once(&folder.workbook).chain(folder.manifests.iter()) {
                match transfer.remove_file(path) {
                    Ok(()) | Err(SyncError::RemoteNotFound(_)) => {}
                    Err(err) if err.is_fatal_to_run() => return Err(err),
                    Err(err) => sub.warn(format!("could not remove {path}: {err}")),
                }
            }
            if is_protected_folder(&folder.path) {
                continue;
            }
            if transfer.list(&folder.path, false)?.is_empty() {
                match transfer.remove_dir(&folder.path) {
                    Ok(()) => tracing::debug!(folder = %folder.path, "retired sub-submission"),
                    Err(err) if err.is_fatal_to_run() => return Err(err),
                    Err(err) => sub.warn(format!("could not remove folder: {err}")),
                }
            }
        }
        Ok(())
    }
}

/// Processing, downloaded and invalid folders (and anything inside them) are
/// never consumed as sub-submissions.
fn is_reserved(lab_dir: &Utf8Path, path: &Utf8Path) -> bool {
    let relative = path.strip_prefix(lab_dir).unwrap_or(path);
    relative.components().any(|component| {
        let name = component.as_str();
        name.ends_with(PROCESSING_SUFFIX)
            || name.ends_with(DOWNLOADED_SUFFIX)
            || name.ends_with(INVALID_SUFFIX)
    })
}

/// The merged sheet keeps the first workbook's name; spreadsheet formats the
/// writer cannot produce are saved as `.xlsx`.
fn merged_file_name(source: &str) -> String {
    let path = Utf8Path::new(source);
    match path.extension().map(|ext| ext.to_ascii_lowercase()) {
        Some(ext) if ext == "csv" || ext == "xlsx" => source.to_string(),
        _ => format!("{}.xlsx", path.file_stem().unwrap_or("metadata")),
    }
}
