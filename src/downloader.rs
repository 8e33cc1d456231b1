//! Per processing folder: validate metadata, reconcile, fetch with bounded
//! retry, verify checksums, normalize compression, emit the batch records.

use std::collections::{BTreeMap, BTreeSet};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::checksum::{ChecksumManifest, ChecksumRegistry};
use crate::config::SyncConfig;
use crate::domain::{BatchId, ChecksumOrigin, FileRecord, LabCode, SampleFileRecord};
use crate::error::SyncError;
use crate::fs_util::gzip_in_place;
use crate::log_summary::FolderContext;
use crate::reconcile::{Reconciler, ResolvedSample};
use crate::store::Store;
use crate::transfer::{RemoteEntry, TransferClient};
use crate::workbook::MetadataWorkbook;

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub lab: LabCode,
    pub remote_folder: Utf8PathBuf,
    pub local_dir: Utf8PathBuf,
    pub batch_id: BatchId,
    pub records: Vec<SampleFileRecord>,
    /// Remote file names backing an emitted record.
    pub downloaded_files: Vec<String>,
    /// Sequencing files left on the remote side without a local counterpart.
    pub not_downloaded: Vec<String>,
    /// Files that could not be fetched, read back or stored locally.
    pub failed_files: Vec<String>,
    pub corrupted_files: Vec<String>,
    pub retried_files: Vec<String>,
    pub rejected_samples: Vec<String>,
    pub sidecar: Utf8PathBuf,
}

#[derive(Debug, Clone)]
pub enum FolderOutcome {
    Finished(BatchReport),
    /// `rename_invalid` is set when the lab has to fix its submission; other
    /// skips leave the folder in place for the next run.
    Skipped { reason: String, rename_invalid: bool },
}

impl FolderOutcome {
    fn skipped(reason: impl Into<String>, rename_invalid: bool) -> Self {
        FolderOutcome::Skipped {
            reason: reason.into(),
            rename_invalid,
        }
    }
}

#[derive(Debug, Clone)]
struct LocalFile {
    local: Utf8PathBuf,
    checksum: String,
    fetched_checksum: String,
    origin: ChecksumOrigin,
}

impl LocalFile {
    fn fetched(local: &Utf8Path, checksum: String, origin: ChecksumOrigin) -> Self {
        Self {
            local: local.to_path_buf(),
            fetched_checksum: checksum.clone(),
            checksum,
            origin,
        }
    }
}

#[derive(Default)]
struct FetchStats {
    retried: BTreeSet<String>,
    corrupted: BTreeSet<String>,
    failed: BTreeSet<String>,
}

pub struct BatchDownloader<'a> {
    config: &'a SyncConfig,
    checksums: &'a ChecksumRegistry,
    store: &'a Store,
}

impl<'a> BatchDownloader<'a> {
    pub fn new(config: &'a SyncConfig, checksums: &'a ChecksumRegistry, store: &'a Store) -> Self {
        Self {
            config,
            checksums,
            store,
        }
    }

    /// `ctx.folder` is the processing folder. Only a lost session escapes as an
    /// error; every other failure ends in `FolderOutcome::Skipped` or in
    /// sample-level log entries.
    pub fn execute(
        &self,
        transfer: &mut dyn TransferClient,
        ctx: &mut FolderContext<'_>,
    ) -> Result<FolderOutcome, SyncError> {
        let folder = ctx.folder.clone();
        let folder_name = folder.file_name().unwrap_or(folder.as_str()).to_string();
        let batch = BatchId::from_processing_name(&folder_name)
            .unwrap_or_else(|| BatchId::new(folder_name.clone()));
        let local_dir = self.store.batch_dir(&ctx.lab, &batch);
        tracing::info!(lab = %ctx.lab, folder = %folder, batch = %batch, "downloading batch");

        let listing = match transfer.list_files(&folder) {
            Ok(listing) => listing,
            Err(err) if err.is_fatal_to_run() => return Err(err),
            Err(err) => {
                ctx.error(format!("cannot list folder: {err}"));
                return Ok(FolderOutcome::skipped(err.to_string(), false));
            }
        };
        Store::ensure_dir(&local_dir)?;

        let outcome = self.run_stages(transfer, ctx, &folder, &batch, &local_dir, &listing);
        match outcome {
            Ok(FolderOutcome::Finished(report)) => Ok(FolderOutcome::Finished(report)),
            Ok(skipped) => {
                Store::remove_dir(&local_dir)?;
                Ok(skipped)
            }
            Err(err) => {
                if let Err(cleanup) = Store::remove_dir(&local_dir) {
                    tracing::warn!(dir = %local_dir, "partial download left behind: {cleanup}");
                }
                Err(err)
            }
        }
    }

    fn run_stages(
        &self,
        transfer: &mut dyn TransferClient,
        ctx: &mut FolderContext<'_>,
        folder: &Utf8Path,
        batch: &BatchId,
        local_dir: &Utf8Path,
        listing: &[RemoteEntry],
    ) -> Result<FolderOutcome, SyncError> {
        // validate-metadata
        let workbook_entries: Vec<&RemoteEntry> = listing
            .iter()
            .filter(|entry| self.config.is_metadata_file(entry.name()))
            .collect();
        let workbook_entry = match workbook_entries.as_slice() {
            [only] => *only,
            [] => {
                let err = SyncError::FileNotFound(format!("metadata spreadsheet in {folder}"));
                ctx.error(err.to_string());
                return Ok(FolderOutcome::skipped(err.to_string(), true));
            }
            many => {
                let reason = format!("{} metadata spreadsheets found, expected one", many.len());
                ctx.error(reason.clone());
                return Ok(FolderOutcome::skipped(reason, true));
            }
        };
        let workbook_local = local_dir.join(workbook_entry.name());
        if let Some(skip) = self.fetch_or_skip(transfer, ctx, &workbook_entry.path, &workbook_local)? {
            return Ok(skip);
        }
        let loaded = MetadataWorkbook::load(workbook_local.as_std_path(), &self.config.metadata)
            .and_then(|workbook| {
                let extraction = workbook.extract_sample_files(&self.config.metadata)?;
                Ok((workbook, extraction))
            });
        let (workbook, extraction) = match loaded {
            Ok(loaded) => loaded,
            Err(err) => {
                ctx.error(err.to_string());
                return Ok(FolderOutcome::skipped(err.to_string(), true));
            }
        };
        for (sample, message) in &extraction.warnings {
            ctx.sample_warn(sample, message.clone());
        }

        let sequencing: Vec<String> = listing
            .iter()
            .filter(|entry| self.config.is_sequencing_file(entry.name()))
            .map(|entry| entry.name().to_string())
            .collect();
        let reconciliation = Reconciler::reconcile(ctx, &extraction.samples, &sequencing);
        if reconciliation.resolved.is_empty() {
            let reason = format!(
                "none of the {} declared samples matched an uploaded file",
                extraction.samples.len()
            );
            ctx.error(reason.clone());
            return Ok(FolderOutcome::skipped(reason, true));
        }

        let manifest = self.fetch_manifests(transfer, ctx, listing, local_dir)?;

        // fetch
        let mut stats = FetchStats::default();
        let owners = file_owners(&reconciliation.resolved);
        let mut fetched: BTreeMap<String, Utf8PathBuf> = BTreeMap::new();
        for name in owners.keys() {
            let remote = folder.join(name);
            let local = local_dir.join(name);
            match self.fetch_with_retry(transfer, &remote, &local)? {
                Some(attempts) => {
                    if attempts > 1 {
                        stats.retried.insert(name.clone());
                    }
                    fetched.insert(name.clone(), local);
                }
                None => {
                    stats.failed.insert(name.clone());
                    ctx.sample_error(
                        &owners[name],
                        format!(
                            "{name} could not be fetched after {} attempts",
                            self.config.fetch_attempts
                        ),
                    );
                }
            }
        }

        // verify-checksum
        let mut verified: BTreeMap<String, LocalFile> = BTreeMap::new();
        for (name, local) in fetched {
            let remote = folder.join(&name);
            match self.verify_with_refetch(transfer, ctx, &owners[&name], &remote, &local, &manifest, &mut stats)? {
                Some(file) => {
                    verified.insert(name, file);
                }
                None => {
                    Store::remove_file(&local)?;
                }
            }
        }

        if self.config.abort_on_checksum_mismatch && !stats.corrupted.is_empty() {
            let reason = format!(
                "checksum mismatch persisted for {:?}; batch discarded",
                stats.corrupted
            );
            ctx.error(reason.clone());
            return Ok(FolderOutcome::skipped(reason, false));
        }

        // normalize
        for (name, file) in verified.iter_mut() {
            if self.config.is_compressed(name) {
                continue;
            }
            let archive = format!("{name}.gz");
            if let Some(other) = owners.get(&archive) {
                ctx.sample_error(
                    &owners[name],
                    format!("{name} cannot be compressed: {archive} belongs to sample {other}"),
                );
                stats.failed.insert(name.clone());
                continue;
            }
            // `file.local` tracks the archive once it exists.
            let normalized = match gzip_in_place(&file.local) {
                Ok(compressed) => {
                    file.local = compressed;
                    self.checksums.compute(file.local.as_std_path())
                }
                Err(err) => Err(err),
            };
            match normalized {
                Ok(checksum) => {
                    tracing::debug!(file = %name, "compressed to {}", file.local);
                    file.checksum = checksum;
                }
                Err(err) => {
                    ctx.sample_error(&owners[name], format!("{name} failed normalization: {err}"));
                    stats.corrupted.insert(name.clone());
                }
            }
        }
        for (name, file) in &verified {
            if stats.failed.contains(name) || stats.corrupted.contains(name) {
                Store::remove_file(&file.local)?;
            }
        }
        verified.retain(|name, _| !stats.failed.contains(name) && !stats.corrupted.contains(name));

        // finalize
        let mut records = Vec::new();
        let mut rejected = reconciliation.rejected.clone();
        for sample in &reconciliation.resolved {
            match build_record(ctx, sample, &verified, batch) {
                Some(record) => records.push(record),
                None => rejected.push(sample.sample_id.clone()),
            }
        }
        let downloaded: BTreeSet<String> = records
            .iter()
            .flat_map(|record| {
                std::iter::once(record.primary.file_name.clone())
                    .chain(record.secondary.as_ref().map(|file| file.file_name.clone()))
            })
            .collect();
        for (name, file) in &verified {
            if !downloaded.contains(name) {
                Store::remove_file(&file.local)?;
            }
        }
        if records.is_empty() {
            let reason = "no sample survived transfer and verification".to_string();
            ctx.error(reason.clone());
            return Ok(FolderOutcome::skipped(reason, false));
        }

        let sidecar = Store::samples_path(local_dir, &ctx.lab, batch);
        Store::write_json_atomic(&sidecar, &records)?;
        let tagged = Store::tagged_workbook_path(
            local_dir,
            &ctx.lab,
            batch,
            Utf8Path::new(&workbook.source),
        );
        Store::rename_file(&workbook_local, &tagged)?;
        ctx.log()
            .write_folder(ctx.key(), &Store::log_summary_path(local_dir, &ctx.lab, batch))?;

        let not_downloaded = sequencing
            .iter()
            .filter(|name| !downloaded.contains(*name))
            .cloned()
            .collect();
        tracing::info!(
            lab = %ctx.lab,
            folder = %folder,
            samples = records.len(),
            corrupted = stats.corrupted.len(),
            retried = stats.retried.len(),
            "batch finalized"
        );
        Ok(FolderOutcome::Finished(BatchReport {
            lab: ctx.lab.clone(),
            remote_folder: folder.to_path_buf(),
            local_dir: local_dir.to_path_buf(),
            batch_id: batch.clone(),
            records,
            downloaded_files: downloaded.into_iter().collect(),
            not_downloaded,
            failed_files: stats.failed.into_iter().collect(),
            corrupted_files: stats.corrupted.into_iter().collect(),
            retried_files: stats.retried.into_iter().collect(),
            rejected_samples: rejected,
            sidecar,
        }))
    }

    fn fetch_or_skip(
        &self,
        transfer: &mut dyn TransferClient,
        ctx: &mut FolderContext<'_>,
        remote: &Utf8Path,
        local: &Utf8Path,
    ) -> Result<Option<FolderOutcome>, SyncError> {
        if self.fetch_with_retry(transfer, remote, local)?.is_some() {
            return Ok(None);
        }
        let reason = format!("{remote} could not be fetched");
        ctx.error(reason.clone());
        Ok(Some(FolderOutcome::skipped(reason, false)))
    }

    fn fetch_manifests(
        &self,
        transfer: &mut dyn TransferClient,
        ctx: &mut FolderContext<'_>,
        listing: &[RemoteEntry],
        local_dir: &Utf8Path,
    ) -> Result<ChecksumManifest, SyncError> {
        let mut parsed = Vec::new();
        for entry in listing
            .iter()
            .filter(|entry| self.config.is_manifest_file(entry.name()))
        {
            let local = local_dir.join(entry.name());
            if self.fetch_with_retry(transfer, &entry.path, &local)?.is_some() {
                parsed.push(self.checksums.parse_manifest(local.as_std_path()));
            } else {
                ctx.warn(format!("checksum manifest {} could not be fetched", entry.path));
            }
        }
        if parsed.is_empty() {
            ctx.warn("no checksum manifest; checksums will be computed locally");
        }
        Ok(ChecksumManifest::merge(parsed))
    }

    /// Number of attempts used, or `None` once `fetch_attempts` are spent. A
    /// dropped session is reopened once per attempt; failing to reopen it is
    /// fatal to the run.
    fn fetch_with_retry(
        &self,
        transfer: &mut dyn TransferClient,
        remote: &Utf8Path,
        local: &Utf8Path,
    ) -> Result<Option<u32>, SyncError> {
        for attempt in 1..=self.config.fetch_attempts {
            match transfer.fetch(remote, local.as_std_path()) {
                Ok(()) => return Ok(Some(attempt)),
                Err(SyncError::Connection(message)) => {
                    tracing::warn!(file = %remote, attempt, "session lost during fetch: {message}");
                    transfer.reopen()?;
                }
                Err(err) => {
                    tracing::warn!(file = %remote, attempt, "fetch failed: {err}");
                }
            }
        }
        Ok(None)
    }

    #[allow(clippy::too_many_arguments)]
    fn verify_with_refetch(
        &self,
        transfer: &mut dyn TransferClient,
        ctx: &mut FolderContext<'_>,
        sample: &str,
        remote: &Utf8Path,
        local: &Utf8Path,
        manifest: &ChecksumManifest,
        stats: &mut FetchStats,
    ) -> Result<Option<LocalFile>, SyncError> {
        let name = remote.file_name().unwrap_or(remote.as_str()).to_string();
        let Some(expected) = manifest.get(&name) else {
            return match self.checksums.compute(local.as_std_path()) {
                Ok(checksum) => Ok(Some(LocalFile::fetched(local, checksum, ChecksumOrigin::Computed))),
                Err(err) => {
                    ctx.sample_error(sample, format!("{name}: {err}"));
                    stats.failed.insert(name);
                    Ok(None)
                }
            };
        };

        match self.checksums.verify(local.as_std_path(), expected) {
            Ok(checksum) => {
                return Ok(Some(LocalFile::fetched(local, checksum, ChecksumOrigin::Manifest)));
            }
            Err(err) => {
                tracing::warn!(file = %name, "{err}; fetching again");
            }
        }

        stats.retried.insert(name.clone());
        if self.fetch_with_retry(transfer, remote, local)?.is_some() {
            match self.checksums.verify(local.as_std_path(), expected) {
                Ok(checksum) => {
                    return Ok(Some(LocalFile::fetched(local, checksum, ChecksumOrigin::Manifest)));
                }
                Err(err) => ctx.sample_error(sample, format!("{err}; file quarantined")),
            }
        } else {
            ctx.sample_error(sample, format!("{name} could not be fetched again for verification"));
        }
        stats.corrupted.insert(name);
        Ok(None)
    }
}

/// Remote file name to the sample that claimed it.
fn file_owners(resolved: &[ResolvedSample]) -> BTreeMap<String, String> {
    resolved
        .iter()
        .flat_map(|sample| {
            sample
                .files()
                .map(|file| (file.to_string(), sample.sample_id.clone()))
                .collect::<Vec<_>>()
        })
        .collect()
}

fn build_record(
    ctx: &mut FolderContext<'_>,
    sample: &ResolvedSample,
    verified: &BTreeMap<String, LocalFile>,
    batch: &BatchId,
) -> Option<SampleFileRecord> {
    let to_record = |name: &str| {
        verified.get(name).map(|file| FileRecord {
            file_name: name.to_string(),
            local_path: file.local.clone(),
            checksum: file.checksum.clone(),
            fetched_checksum: file.fetched_checksum.clone(),
            checksum_origin: file.origin,
        })
    };

    let Some(primary) = to_record(&sample.primary) else {
        ctx.sample_error(&sample.sample_id, "primary file unavailable; sample dropped");
        return None;
    };
    let secondary = match sample.secondary.as_deref() {
        Some(name) => match to_record(name) {
            Some(record) => Some(record),
            None if sample.paired => {
                ctx.sample_error(&sample.sample_id, "secondary file unavailable; sample dropped");
                return None;
            }
            None => {
                ctx.sample_warn(&sample.sample_id, "secondary file unavailable; kept as single-end");
                None
            }
        },
        None => None,
    };
    Some(SampleFileRecord {
        sample_id: sample.sample_id.clone(),
        primary,
        secondary,
        batch_id: batch.clone(),
    })
}
