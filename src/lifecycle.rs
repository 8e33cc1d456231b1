//! Terminal transitions of remote folders once a batch is settled locally.

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::SyncConfig;
use crate::domain::{
    DOWNLOADED_SUFFIX, DownloadMode, FolderLifecycleState, INVALID_SUFFIX, is_protected_folder,
    renamed_with_suffix,
};
use crate::downloader::BatchReport;
use crate::error::SyncError;
use crate::log_summary::FolderContext;
use crate::store::Store;
use crate::transfer::TransferClient;

/// What happens to a processing folder after its batch was written locally.
pub trait CleanupPolicy {
    fn mode(&self) -> DownloadMode;

    /// Acts on a whole lab folder (`ctx.folder`) before anything is merged or
    /// downloaded. `Some(removed)` means the lab is done for this run.
    fn sweep_lab(
        &self,
        _transfer: &mut dyn TransferClient,
        _ctx: &mut FolderContext<'_>,
    ) -> Result<Option<usize>, SyncError> {
        Ok(None)
    }

    /// `ctx.folder` is the processing folder described by `report`. Policies
    /// that never download leave it where it is.
    fn settle(
        &self,
        _transfer: &mut dyn TransferClient,
        ctx: &mut FolderContext<'_>,
        _report: &BatchReport,
    ) -> Result<FolderLifecycleState, SyncError> {
        ctx.warn(format!("{} leaves downloaded batches untouched", self.mode()));
        Ok(FolderLifecycleState::classify(&ctx.folder))
    }
}

/// Keeps the downloaded files remotely under `*_downloaded` and puts anything
/// that did not make it back into a fresh processing folder.
pub struct DownloadOnlyPolicy {
    store: Store,
}

impl DownloadOnlyPolicy {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

impl CleanupPolicy for DownloadOnlyPolicy {
    fn mode(&self) -> DownloadMode {
        DownloadMode::DownloadOnly
    }

    fn settle(
        &self,
        transfer: &mut dyn TransferClient,
        ctx: &mut FolderContext<'_>,
        report: &BatchReport,
    ) -> Result<FolderLifecycleState, SyncError> {
        let folder = ctx.folder.clone();
        let downloaded = renamed_with_suffix(&folder, DOWNLOADED_SUFFIX);
        move_folder(transfer, ctx, &folder, &downloaded)?;
        tracing::info!(lab = %ctx.lab, folder = %folder, "renamed to {downloaded}");

        if report.not_downloaded.is_empty() {
            return Ok(FolderLifecycleState::Downloaded);
        }

        transfer.make_directory(&folder)?;
        let scratch = self.store.scratch_dir("seqbatch-copyback")?;
        for name in &report.not_downloaded {
            let local = scratch.path().join(name);
            let copied = transfer
                .fetch(&downloaded.join(name), &local)
                .and_then(|()| transfer.upload(&local, &folder.join(name)));
            match copied {
                Ok(()) => {}
                Err(err) if err.is_fatal_to_run() => return Err(err),
                Err(err) => ctx.error(format!("could not copy back {name}: {err}")),
            }
        }

        if transfer.list(&folder, false)?.is_empty() {
            transfer.remove_dir(&folder)?;
        } else {
            let invalid = mark_invalid(transfer, ctx, &folder)?;
            ctx.warn(format!(
                "{} file(s) not downloaded are kept in {invalid}",
                report.not_downloaded.len()
            ));
        }
        Ok(FolderLifecycleState::Downloaded)
    }
}

/// Deletes exactly the downloaded files remotely.
pub struct DownloadCleanPolicy {
    config: SyncConfig,
}

impl DownloadCleanPolicy {
    pub fn new(config: SyncConfig) -> Self {
        Self { config }
    }
}

impl CleanupPolicy for DownloadCleanPolicy {
    fn mode(&self) -> DownloadMode {
        DownloadMode::DownloadClean
    }

    fn settle(
        &self,
        transfer: &mut dyn TransferClient,
        ctx: &mut FolderContext<'_>,
        report: &BatchReport,
    ) -> Result<FolderLifecycleState, SyncError> {
        let folder = ctx.folder.clone();
        for name in &report.downloaded_files {
            remove_logged(transfer, ctx, &folder.join(name))?;
        }

        let remaining = transfer.list(&folder, true)?;
        let only_bookkeeping = remaining.iter().all(|entry| {
            entry.is_file()
                && (self.config.is_metadata_file(entry.name())
                    || self.config.is_manifest_file(entry.name()))
        });
        if only_bookkeeping {
            for entry in &remaining {
                remove_logged(transfer, ctx, &entry.path)?;
            }
            if transfer.list(&folder, false)?.is_empty() {
                transfer.remove_dir(&folder)?;
                tracing::info!(lab = %ctx.lab, folder = %folder, "removed after clean download");
                return Ok(FolderLifecycleState::EmptyRemoved);
            }
        }

        mark_invalid(transfer, ctx, &folder)?;
        Ok(FolderLifecycleState::InvalidSamples)
    }
}

/// Empties lab folders without downloading anything. Lab folders themselves
/// are kept.
pub struct DeleteOnlyPolicy;

impl CleanupPolicy for DeleteOnlyPolicy {
    fn mode(&self) -> DownloadMode {
        DownloadMode::DeleteOnly
    }

    fn sweep_lab(
        &self,
        transfer: &mut dyn TransferClient,
        ctx: &mut FolderContext<'_>,
    ) -> Result<Option<usize>, SyncError> {
        let lab_dir = ctx.folder.clone();
        let mut removed = 0;
        for entry in transfer.list(&lab_dir, false)? {
            let result = if entry.is_dir() {
                remove_tree(transfer, &entry.path)
            } else {
                transfer.remove_file(&entry.path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(err) if err.is_fatal_to_run() => return Err(err),
                Err(err) => ctx.error(format!("could not remove {}: {err}", entry.path)),
            }
        }
        tracing::info!(lab = %ctx.lab, removed, "lab folder emptied");
        Ok(Some(removed))
    }
}

pub fn policy_for(mode: DownloadMode, config: &SyncConfig, store: &Store) -> Box<dyn CleanupPolicy> {
    match mode {
        DownloadMode::DownloadOnly => Box::new(DownloadOnlyPolicy::new(store.clone())),
        DownloadMode::DownloadClean => Box::new(DownloadCleanPolicy::new(config.clone())),
        DownloadMode::DeleteOnly => Box::new(DeleteOnlyPolicy),
    }
}

pub struct FolderStateMachine {
    policy: Box<dyn CleanupPolicy>,
}

impl FolderStateMachine {
    /// Resolves the configured mode into its policy once.
    pub fn new(config: &SyncConfig, store: &Store) -> Self {
        Self {
            policy: policy_for(config.download_mode, config, store),
        }
    }

    pub fn with_policy(policy: Box<dyn CleanupPolicy>) -> Self {
        Self { policy }
    }

    pub fn mode(&self) -> DownloadMode {
        self.policy.mode()
    }

    /// See [`CleanupPolicy::sweep_lab`].
    pub fn sweep_lab(
        &self,
        transfer: &mut dyn TransferClient,
        ctx: &mut FolderContext<'_>,
    ) -> Result<Option<usize>, SyncError> {
        self.policy.sweep_lab(transfer, ctx)
    }

    pub fn settle(
        &self,
        transfer: &mut dyn TransferClient,
        ctx: &mut FolderContext<'_>,
        report: &BatchReport,
    ) -> Result<FolderLifecycleState, SyncError> {
        let from = FolderLifecycleState::classify(&ctx.folder);
        if from != FolderLifecycleState::MergedProcessing {
            ctx.error(format!("cannot settle a folder in state {from}"));
            return Ok(from);
        }
        let to = self.policy.settle(transfer, ctx, report)?;
        debug_assert!(to == from || from.can_transition_to(to));
        tracing::info!(lab = %ctx.lab, folder = %ctx.folder, mode = %self.mode(), "{from} -> {to}");
        Ok(to)
    }

    /// See [`mark_invalid`].
    pub fn mark_invalid(
        &self,
        transfer: &mut dyn TransferClient,
        ctx: &mut FolderContext<'_>,
    ) -> Result<Utf8PathBuf, SyncError> {
        let folder = ctx.folder.clone();
        mark_invalid(transfer, ctx, &folder)
    }
}

/// Renames `folder` to `*_invalid_samples`. Re-running is a logged no-op: an
/// already-invalid folder is left alone, a vanished source whose target exists
/// counts as done, and an existing target absorbs the folder's files.
pub fn mark_invalid(
    transfer: &mut dyn TransferClient,
    ctx: &mut FolderContext<'_>,
    folder: &Utf8Path,
) -> Result<Utf8PathBuf, SyncError> {
    if folder.file_name().is_some_and(|name| name.ends_with(INVALID_SUFFIX)) {
        tracing::info!(folder = %folder, "already marked invalid");
        return Ok(folder.to_path_buf());
    }
    let target = renamed_with_suffix(folder, INVALID_SUFFIX);
    move_folder(transfer, ctx, folder, &target)?;
    tracing::info!(lab = %ctx.lab, folder = %folder, "marked invalid as {target}");
    Ok(target)
}

/// Renames `from` to `to`; when `to` already exists the files are moved into it
/// one by one and `from` is removed once empty.
fn move_folder(
    transfer: &mut dyn TransferClient,
    ctx: &mut FolderContext<'_>,
    from: &Utf8Path,
    to: &Utf8Path,
) -> Result<(), SyncError> {
    if !transfer.exists(to)? {
        return match transfer.rename(from, to) {
            Err(SyncError::RemoteNotFound(_)) => {
                tracing::info!(folder = %from, "nothing to rename");
                Ok(())
            }
            other => other,
        };
    }
    if !transfer.exists(from)? {
        tracing::info!(folder = %from, "already renamed to {to}");
        return Ok(());
    }

    ctx.warn(format!("{to} already exists; merging contents"));
    for entry in transfer.list_files(from)? {
        let destination = to.join(entry.name());
        if transfer.exists(&destination)? {
            ctx.warn(format!("{destination} already exists; {} left in place", entry.path));
            continue;
        }
        transfer.rename(&entry.path, &destination)?;
    }
    if transfer.list(from, false)?.is_empty() {
        transfer.remove_dir(from)?;
    }
    Ok(())
}

fn remove_logged(
    transfer: &mut dyn TransferClient,
    ctx: &mut FolderContext<'_>,
    path: &Utf8Path,
) -> Result<(), SyncError> {
    match transfer.remove_file(path) {
        Ok(()) | Err(SyncError::RemoteNotFound(_)) => Ok(()),
        Err(err) if err.is_fatal_to_run() => Err(err),
        Err(err) => {
            ctx.error(format!("could not remove {path}: {err}"));
            Ok(())
        }
    }
}

/// Deletes `path` and everything below it. The transfer root and lab folders
/// are refused.
pub fn remove_tree(transfer: &mut dyn TransferClient, path: &Utf8Path) -> Result<(), SyncError> {
    if is_protected_folder(path) {
        return Err(SyncError::ProtectedFolder(path.to_string()));
    }
    let entries = transfer.list(path, true)?;
    let (mut dirs, files): (Vec<_>, Vec<_>) = entries.into_iter().partition(|entry| entry.is_dir());
    for file in files {
        transfer.remove_file(&file.path)?;
    }
    dirs.sort_by_key(|entry| std::cmp::Reverse(entry.path.components().count()));
    for dir in dirs {
        transfer.remove_dir(&dir.path)?;
    }
    transfer.remove_dir(path)
}
