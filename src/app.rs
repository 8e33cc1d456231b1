use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::checksum::ChecksumRegistry;
use crate::config::SyncConfig;
use crate::domain::{BatchId, DownloadMode, FolderLifecycleState, LabCode, PROCESSING_SUFFIX};
use crate::downloader::{BatchDownloader, BatchReport, FolderOutcome};
use crate::error::SyncError;
use crate::lifecycle::{CleanupPolicy, FolderStateMachine};
use crate::log_summary::{FolderContext, LogSummary};
use crate::merger::SubmissionMerger;
use crate::store::Store;
use crate::transfer::TransferClient;

#[derive(Debug, Clone, Serialize)]
pub struct FinishedFolder {
    pub lab: String,
    pub remote_folder: String,
    pub local_dir: String,
    pub batch_id: String,
    pub state: FolderLifecycleState,
    pub samples: usize,
    pub sidecar: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedFolder {
    pub lab: String,
    pub remote_folder: String,
    pub reason: String,
    pub state: FolderLifecycleState,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub batch_id: String,
    pub mode: DownloadMode,
    pub labs: Vec<String>,
    pub finished: Vec<FinishedFolder>,
    pub skipped: Vec<SkippedFolder>,
    pub samples_downloaded: usize,
    pub samples_skipped: usize,
    pub retried_files: usize,
    pub corrupted_files: usize,
    pub wiped_entries: usize,
    pub log_summary: Option<String>,
}

impl RunSummary {
    fn new(batch: &BatchId, mode: DownloadMode) -> Self {
        Self {
            batch_id: batch.to_string(),
            mode,
            labs: Vec::new(),
            finished: Vec::new(),
            skipped: Vec::new(),
            samples_downloaded: 0,
            samples_skipped: 0,
            retried_files: 0,
            corrupted_files: 0,
            wiped_entries: 0,
            log_summary: None,
        }
    }

    fn record_finished(&mut self, report: &BatchReport, state: FolderLifecycleState) {
        self.samples_downloaded += report.records.len();
        self.samples_skipped += report.rejected_samples.len();
        self.retried_files += report.retried_files.len();
        self.corrupted_files += report.corrupted_files.len();
        self.finished.push(FinishedFolder {
            lab: report.lab.to_string(),
            remote_folder: report.remote_folder.to_string(),
            local_dir: report.local_dir.to_string(),
            batch_id: report.batch_id.to_string(),
            state,
            samples: report.records.len(),
            sidecar: report.sidecar.to_string(),
        });
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Drives one synchronization run: discover labs, merge sub-submissions,
/// download every processing folder, then settle it remotely.
pub struct App<T: TransferClient> {
    config: SyncConfig,
    store: Store,
    transfer: T,
    checksums: ChecksumRegistry,
    machine: FolderStateMachine,
    batch: BatchId,
}

impl<T: TransferClient> App<T> {
    pub fn new(config: SyncConfig, transfer: T) -> Self {
        let store = Store::new(config.output_dir.clone());
        let checksums = ChecksumRegistry::new(
            config.checksum_algorithm,
            config.manifest_skip_patterns.clone(),
        );
        let machine = FolderStateMachine::new(&config, &store);
        Self {
            config,
            store,
            transfer,
            checksums,
            machine,
            batch: BatchId::now(),
        }
    }

    pub fn with_batch(mut self, batch: BatchId) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_policy(mut self, policy: Box<dyn CleanupPolicy>) -> Self {
        self.machine = FolderStateMachine::with_policy(policy);
        self
    }

    pub fn batch_id(&self) -> &BatchId {
        &self.batch
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn transfer_mut(&mut self) -> &mut T {
        &mut self.transfer
    }

    /// First-level folders of the transfer root, restricted to `target_labs`
    /// when configured. Names that are not valid lab codes are ignored.
    pub fn discover_labs(&mut self) -> Result<Vec<LabCode>, SyncError> {
        let mut labs = Vec::new();
        for entry in self.transfer.list_dirs(Utf8Path::new(""))? {
            let Ok(lab) = entry.name().parse::<LabCode>() else {
                tracing::debug!(folder = %entry.path, "not a lab folder");
                continue;
            };
            if self.config.target_labs.is_empty() || self.config.target_labs.contains(&lab) {
                labs.push(lab);
            }
        }
        for wanted in &self.config.target_labs {
            if !labs.contains(wanted) {
                tracing::warn!(lab = %wanted, "target lab has no folder on the remote side");
            }
        }
        Ok(labs)
    }

    pub fn run(&mut self, sink: &dyn ProgressSink) -> Result<RunSummary, SyncError> {
        let started = Instant::now();
        self.store.ensure_output_root()?;
        self.transfer.open()?;
        let labs = self.discover_labs()?;
        sink.event(ProgressEvent {
            message: format!("phase=Discover; {} lab folder(s)", labs.len()),
            elapsed: Some(started.elapsed()),
        });

        let mut log = LogSummary::new();
        let mut summary = RunSummary::new(&self.batch, self.machine.mode());
        summary.labs = labs.iter().map(LabCode::to_string).collect();

        let result = self.process_labs(&labs, &mut log, &mut summary, sink);
        self.transfer.close();

        let log_path = self.store.run_log_path(&self.batch);
        log.write_all(&log_path)?;
        summary.log_summary = Some(log_path.to_string());
        result?;

        Store::write_json_atomic(&self.store.run_summary_path(&self.batch), &summary)?;
        sink.event(ProgressEvent {
            message: format!(
                "phase=Done; {} finished, {} skipped",
                summary.finished.len(),
                summary.skipped.len()
            ),
            elapsed: Some(started.elapsed()),
        });
        Ok(summary)
    }

    fn process_labs(
        &mut self,
        labs: &[LabCode],
        log: &mut LogSummary,
        summary: &mut RunSummary,
        sink: &dyn ProgressSink,
    ) -> Result<(), SyncError> {
        for lab in labs {
            self.transfer.reopen()?;
            let mut ctx = FolderContext::new(lab.clone(), Utf8PathBuf::from(lab.as_str()), log);
            if let Some(removed) = self.machine.sweep_lab(&mut self.transfer, &mut ctx)? {
                summary.wiped_entries += removed;
                continue;
            }

            sink.event(ProgressEvent {
                message: format!("phase=Merge; lab {lab}"),
                elapsed: None,
            });
            let processing = self.merge_lab(lab, log)?;

            for folder in processing {
                self.transfer.reopen()?;
                sink.event(ProgressEvent {
                    message: format!("phase=Download; {folder}"),
                    elapsed: None,
                });
                let mut ctx = FolderContext::new(lab.clone(), folder.clone(), log);
                self.download_folder(&mut ctx, summary)?;
            }
        }
        Ok(())
    }

    /// Merges pending sub-submissions and returns every processing folder of
    /// the lab, new and left over.
    fn merge_lab(
        &mut self,
        lab: &LabCode,
        log: &mut LogSummary,
    ) -> Result<Vec<Utf8PathBuf>, SyncError> {
        let lab_dir = Utf8PathBuf::from(lab.as_str());
        let mut ctx = FolderContext::new(lab.clone(), lab_dir.clone(), log);
        let merger = SubmissionMerger::new(&self.config, &self.checksums, &self.store, &self.batch);

        let merged = merger
            .merge_lab(&mut self.transfer, &mut ctx)
            .and_then(|outcome| merger.retire_consumed(&mut self.transfer, &mut ctx, &outcome.consumed));
        match merged {
            Ok(()) => {}
            Err(err) if err.is_fatal_to_run() => return Err(err),
            Err(err) => ctx.error(format!("merge failed: {err}")),
        }

        let folders = match self.transfer.list_dirs(&lab_dir) {
            Ok(dirs) => dirs
                .into_iter()
                .filter(|entry| entry.name().ends_with(PROCESSING_SUFFIX))
                .map(|entry| entry.path)
                .collect(),
            Err(err) if err.is_fatal_to_run() => return Err(err),
            Err(err) => {
                ctx.error(format!("cannot list lab folder: {err}"));
                Vec::new()
            }
        };
        Ok(folders)
    }

    fn download_folder(
        &mut self,
        ctx: &mut FolderContext<'_>,
        summary: &mut RunSummary,
    ) -> Result<(), SyncError> {
        let downloader = BatchDownloader::new(&self.config, &self.checksums, &self.store);
        match downloader.execute(&mut self.transfer, ctx)? {
            FolderOutcome::Finished(report) => {
                let state = match self.machine.settle(&mut self.transfer, ctx, &report) {
                    Ok(state) => state,
                    Err(err) if err.is_fatal_to_run() => return Err(err),
                    Err(err) => {
                        ctx.error(format!("remote cleanup failed: {err}"));
                        FolderLifecycleState::MergedProcessing
                    }
                };
                let log_path = Store::log_summary_path(&report.local_dir, &report.lab, &report.batch_id);
                ctx.log().write_folder(ctx.key(), &log_path)?;
                summary.record_finished(&report, state);
            }
            FolderOutcome::Skipped {
                reason,
                rename_invalid,
            } => {
                let mut state = FolderLifecycleState::MergedProcessing;
                if rename_invalid {
                    match self.machine.mark_invalid(&mut self.transfer, ctx) {
                        Ok(_) => state = FolderLifecycleState::InvalidSamples,
                        Err(err) if err.is_fatal_to_run() => return Err(err),
                        Err(err) => ctx.error(format!("could not mark folder invalid: {err}")),
                    }
                }
                summary.skipped.push(SkippedFolder {
                    lab: ctx.lab.to_string(),
                    remote_folder: ctx.folder.to_string(),
                    reason,
                    state,
                });
            }
        }
        Ok(())
    }
}
