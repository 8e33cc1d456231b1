use std::collections::HashSet;
use std::fs;
use std::path::Path;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};
use md5::{Digest, Md5};
use serde_json::json;

use seqbatch_sync::app::App;
use seqbatch_sync::config::{Config, ConfigLoader, SyncConfig};
use seqbatch_sync::domain::{BatchId, ChecksumOrigin, FolderLifecycleState, SampleFileRecord};
use seqbatch_sync::error::SyncError;
use seqbatch_sync::output::JsonOutput;
use seqbatch_sync::transfer::{LocalTransfer, RemoteEntry, TransferClient};
use seqbatch_sync::workbook::MetadataWorkbook;

const BATCH: &str = "20240101120000";
const COLUMNS: [&str; 4] = [
    "Sample ID given for sequencing",
    "Sequence file R1",
    "Sequence file R2",
    "Library Layout",
];

struct Workspace {
    _temp: tempfile::TempDir,
    remote: Utf8PathBuf,
    output: Utf8PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let remote = base.join("drop");
        let output = base.join("out");
        fs::create_dir_all(remote.as_std_path()).unwrap();
        Self {
            _temp: temp,
            remote,
            output,
        }
    }

    fn write(&self, relative: &str, content: &[u8]) {
        let path = self.remote.join(relative);
        fs::create_dir_all(path.parent().unwrap().as_std_path()).unwrap();
        fs::write(path.as_std_path(), content).unwrap();
    }

    fn remote_path(&self, relative: &str) -> Utf8PathBuf {
        self.remote.join(relative)
    }

    fn remote_names(&self, relative: &str) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(self.remote_path(relative).as_std_path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    fn batch_dir(&self) -> Utf8PathBuf {
        self.output.join("LAB01").join(BATCH)
    }

    fn config(&self, mode: &str, extra: serde_json::Value) -> SyncConfig {
        let mut value = json!({
            "remote": { "protocol": "local", "root": self.remote.as_str() },
            "output_dir": self.output.as_str(),
            "download_mode": mode,
            "metadata": { "expected_columns": COLUMNS },
        });
        if let (Some(target), serde_json::Value::Object(extra)) = (value.as_object_mut(), extra) {
            target.extend(extra);
        }
        let config: Config = serde_json::from_value(value).unwrap();
        ConfigLoader::resolve_config(config).unwrap()
    }

    fn app<T: TransferClient>(&self, config: SyncConfig, transfer: T) -> App<T> {
        App::new(config, transfer).with_batch(BatchId::new(BATCH))
    }

    fn local(&self) -> LocalTransfer {
        LocalTransfer::new(self.remote.clone())
    }
}

fn sheet(rows: &[(&str, &str, &str, &str)]) -> Vec<u8> {
    let mut content = format!("CAMPO,{}\n", COLUMNS.join(","));
    for (id, r1, r2, layout) in rows {
        content.push_str(&format!(",{id},{r1},{r2},{layout}\n"));
    }
    content.into_bytes()
}

fn md5_hex(content: &[u8]) -> String {
    hex::encode(Md5::digest(content))
}

fn read_records(path: &Utf8Path) -> Vec<SampleFileRecord> {
    serde_json::from_str(&fs::read_to_string(path.as_std_path()).unwrap()).unwrap()
}

/// Two sub-submissions of LAB01: `run_a` with three samples and a manifest,
/// `run_b` with one sample and no manifest.
fn two_submissions(ws: &Workspace) {
    let mut manifest = String::new();
    for id in ["A1", "A2", "A3"] {
        let content = format!("@{id}\nACGT\n+\nIIII\n");
        ws.write(&format!("LAB01/run_a/{id}_R1.fastq.gz"), content.as_bytes());
        manifest.push_str(&format!("{}  {id}_R1.fastq.gz\n", md5_hex(content.as_bytes())));
    }
    ws.write("LAB01/run_a/md5sum.txt", manifest.as_bytes());
    ws.write(
        "LAB01/run_a/lab_a.csv",
        &sheet(&[
            ("A1", "A1_R1.fastq.gz", "", "single"),
            ("A2", "A2_R1.fastq.gz", "", "single"),
            ("A3", "A3_R1.fastq.gz", "", "single"),
        ]),
    );
    ws.write("LAB01/run_b/B1_R1.fastq.gz", b"@B1\nTTTT\n+\nIIII\n");
    ws.write(
        "LAB01/run_b/lab_b.csv",
        &sheet(&[("B1", "B1_R1.fastq.gz", "", "single")]),
    );
}

/// Delegates to a `LocalTransfer`, corrupting the first fetch of some files,
/// failing every fetch of others and dropping the session on demand. Only
/// fetches out of a processing folder are scripted.
struct ScriptedTransfer {
    inner: LocalTransfer,
    corrupt_once: HashSet<String>,
    always_fail: HashSet<String>,
    fail_once: HashSet<String>,
    drop_session_once: HashSet<String>,
    host_gone_after_drop: bool,
    dropped: bool,
}

impl ScriptedTransfer {
    fn new(inner: LocalTransfer) -> Self {
        Self {
            inner,
            corrupt_once: HashSet::new(),
            always_fail: HashSet::new(),
            fail_once: HashSet::new(),
            drop_session_once: HashSet::new(),
            host_gone_after_drop: false,
            dropped: false,
        }
    }
}

impl TransferClient for ScriptedTransfer {
    fn open(&mut self) -> Result<(), SyncError> {
        if self.dropped && self.host_gone_after_drop {
            return Err(SyncError::Connection("host unreachable".to_string()));
        }
        self.inner.open()
    }

    fn close(&mut self) {
        self.inner.close()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn list(&mut self, path: &Utf8Path, recursive: bool) -> Result<Vec<RemoteEntry>, SyncError> {
        self.inner.list(path, recursive)
    }

    fn fetch(&mut self, remote: &Utf8Path, local: &Path) -> Result<(), SyncError> {
        let name = remote.file_name().unwrap_or_default().to_string();
        if remote.as_str().contains("_tmp_processing") {
            if self.always_fail.contains(&name) || self.fail_once.remove(&name) {
                return Err(SyncError::Remote(format!("{remote}: permission denied")));
            }
            if self.drop_session_once.remove(&name) {
                self.inner.close();
                self.dropped = true;
                return Err(SyncError::Connection(format!("{remote}: connection reset")));
            }
        }
        self.inner.fetch(remote, local)?;
        if self.corrupt_once.remove(&name) {
            fs::write(local, b"garbage").unwrap();
        }
        Ok(())
    }

    fn upload(&mut self, local: &Path, remote: &Utf8Path) -> Result<(), SyncError> {
        self.inner.upload(local, remote)
    }

    fn remove_file(&mut self, remote: &Utf8Path) -> Result<(), SyncError> {
        self.inner.remove_file(remote)
    }

    fn remove_dir(&mut self, remote: &Utf8Path) -> Result<(), SyncError> {
        self.inner.remove_dir(remote)
    }

    fn rename(&mut self, from: &Utf8Path, to: &Utf8Path) -> Result<(), SyncError> {
        self.inner.rename(from, to)
    }

    fn make_directory(&mut self, path: &Utf8Path) -> Result<(), SyncError> {
        self.inner.make_directory(path)
    }

    fn exists(&mut self, path: &Utf8Path) -> Result<bool, SyncError> {
        self.inner.exists(path)
    }
}

#[test]
fn merges_sub_submissions_into_one_batch() {
    let ws = Workspace::new();
    two_submissions(&ws);

    let mut app = ws.app(ws.config("download_only", json!({})), ws.local());
    let summary = app.run(&JsonOutput).unwrap();

    assert_eq!(summary.finished.len(), 1);
    assert_eq!(summary.finished[0].state, FolderLifecycleState::Downloaded);
    assert_eq!(summary.samples_downloaded, 4);
    assert_eq!(summary.corrupted_files, 0);

    let records = read_records(&ws.batch_dir().join(format!("LAB01_{BATCH}_samples.json")));
    assert_eq!(records.len(), 4);
    let b1 = records.iter().find(|record| record.sample_id == "B1").unwrap();
    assert_eq!(b1.primary.checksum_origin, ChecksumOrigin::Computed);
    assert_eq!(b1.primary.checksum, md5_hex(b"@B1\nTTTT\n+\nIIII\n"));
    let a1 = records.iter().find(|record| record.sample_id == "A1").unwrap();
    assert_eq!(a1.primary.checksum_origin, ChecksumOrigin::Manifest);

    let merged = MetadataWorkbook::load(
        ws.batch_dir()
            .join(format!("LAB01_{BATCH}_metadata.csv"))
            .as_std_path(),
        &ws.config("download_only", json!({})).metadata,
    )
    .unwrap();
    assert_eq!(merged.row_count(), 4);

    // Sub-folders are retired, the batch sits under `_downloaded`.
    assert_eq!(ws.remote_names("LAB01"), vec![format!("{BATCH}_downloaded")]);
    let downloaded = ws.remote_names(&format!("LAB01/{BATCH}_downloaded"));
    assert_eq!(
        downloaded
            .iter()
            .filter(|name| name.ends_with(".fastq.gz"))
            .count(),
        4
    );
    assert!(
        ws.output
            .join(format!("{BATCH}_run_summary.json"))
            .as_std_path()
            .exists()
    );
}

#[test]
fn recovers_declared_names_without_recompressing() {
    let ws = Workspace::new();
    ws.write("LAB01/run_a/sample1_R1.fastq.gz", b"compressed already");
    ws.write("LAB01/run_a/sample2_R1.fastq", b"@s2\nACGT\n+\nIIII\n");
    ws.write(
        "LAB01/run_a/lab.csv",
        &sheet(&[
            ("sample1", "sample1_R1.fastq", "", "single"),
            ("sample2", "sample2_R1.fastq", "", "single"),
        ]),
    );

    let mut app = ws.app(ws.config("download_only", json!({})), ws.local());
    let summary = app.run(&JsonOutput).unwrap();
    assert_eq!(summary.samples_downloaded, 2);

    let records = read_records(&ws.batch_dir().join(format!("LAB01_{BATCH}_samples.json")));
    let sample1 = records.iter().find(|r| r.sample_id == "sample1").unwrap();
    assert_eq!(sample1.primary.file_name, "sample1_R1.fastq.gz");
    assert!(sample1.primary.local_path.ends_with("sample1_R1.fastq.gz"));
    assert!(!ws.batch_dir().join("sample1_R1.fastq.gz.gz").as_std_path().exists());

    assert_eq!(sample1.primary.checksum, sample1.primary.fetched_checksum);

    let sample2 = records.iter().find(|r| r.sample_id == "sample2").unwrap();
    assert!(sample2.primary.local_path.ends_with("sample2_R1.fastq.gz"));
    assert!(!ws.batch_dir().join("sample2_R1.fastq").as_std_path().exists());
    // The record describes the compressed file it points at.
    let written = fs::read(sample2.primary.local_path.as_std_path()).unwrap();
    assert_eq!(sample2.primary.checksum, md5_hex(&written));
    assert_eq!(sample2.primary.fetched_checksum, md5_hex(b"@s2\nACGT\n+\nIIII\n"));
}

#[test]
fn compression_never_overwrites_another_samples_file() {
    let ws = Workspace::new();
    ws.write("LAB01/run_a/S1.fastq", b"@a\nACGT\n+\nIIII\n");
    ws.write("LAB01/run_a/S1.fastq.gz", b"already compressed by the lab");
    ws.write(
        "LAB01/run_a/lab.csv",
        &sheet(&[("A", "S1.fastq", "", "single"), ("B", "S1.fastq.gz", "", "single")]),
    );

    let mut app = ws.app(ws.config("download_only", json!({})), ws.local());
    let summary = app.run(&JsonOutput).unwrap();
    assert_eq!(summary.samples_downloaded, 1);
    assert_eq!(summary.samples_skipped, 1);

    let records = read_records(&ws.batch_dir().join(format!("LAB01_{BATCH}_samples.json")));
    assert_eq!(records.len(), 1);
    let b = &records[0];
    assert_eq!(b.sample_id, "B");
    assert_eq!(
        fs::read(b.primary.local_path.as_std_path()).unwrap(),
        b"already compressed by the lab"
    );
    assert_eq!(b.primary.checksum, md5_hex(b"already compressed by the lab"));
    assert!(!ws.batch_dir().join("S1.fastq").as_std_path().exists());

    // A's upload goes back to the lab untouched.
    assert_eq!(
        ws.remote_names(&format!("LAB01/{BATCH}_invalid_samples")),
        vec!["S1.fastq"]
    );
}

#[test]
fn mismatch_fixed_by_refetch_counts_as_retried() {
    let ws = Workspace::new();
    two_submissions(&ws);
    let mut transfer = ScriptedTransfer::new(ws.local());
    transfer.corrupt_once.insert("A2_R1.fastq.gz".to_string());

    let mut app = ws.app(ws.config("download_only", json!({})), transfer);
    let summary = app.run(&JsonOutput).unwrap();
    assert_eq!(summary.corrupted_files, 0);
    assert_eq!(summary.retried_files, 1);
    assert_eq!(summary.samples_downloaded, 4);
}

#[test]
fn transient_fetch_failure_counts_as_retried() {
    let ws = Workspace::new();
    two_submissions(&ws);
    let mut transfer = ScriptedTransfer::new(ws.local());
    transfer.fail_once.insert("A3_R1.fastq.gz".to_string());

    let mut app = ws.app(ws.config("download_only", json!({})), transfer);
    let summary = app.run(&JsonOutput).unwrap();
    assert_eq!(summary.samples_downloaded, 4);
    assert_eq!(summary.retried_files, 1);
    assert_eq!(summary.corrupted_files, 0);
}

#[test]
fn dropped_session_is_reopened_mid_batch() {
    let ws = Workspace::new();
    two_submissions(&ws);
    let mut transfer = ScriptedTransfer::new(ws.local());
    transfer.drop_session_once.insert("A2_R1.fastq.gz".to_string());

    let mut app = ws.app(ws.config("download_clean", json!({})), transfer);
    let summary = app.run(&JsonOutput).unwrap();
    assert_eq!(summary.samples_downloaded, 4);
    assert_eq!(summary.retried_files, 1);
    assert_eq!(summary.finished[0].state, FolderLifecycleState::EmptyRemoved);
    assert!(app.transfer_mut().dropped);
}

#[test]
fn lost_host_aborts_the_run_after_writing_the_log() {
    let ws = Workspace::new();
    two_submissions(&ws);
    let mut transfer = ScriptedTransfer::new(ws.local());
    transfer.drop_session_once.insert("B1_R1.fastq.gz".to_string());
    transfer.host_gone_after_drop = true;

    let mut app = ws.app(ws.config("download_clean", json!({})), transfer);
    assert_matches!(app.run(&JsonOutput), Err(SyncError::Connection(_)));

    assert!(
        ws.output
            .join(format!("{BATCH}_log_summary.json"))
            .as_std_path()
            .exists()
    );
    assert!(!ws.batch_dir().as_std_path().exists());
    assert!(
        !ws.output
            .join(format!("{BATCH}_run_summary.json"))
            .as_std_path()
            .exists()
    );
    // Nothing was deleted remotely.
    let processing = ws.remote_names(&format!("LAB01/{BATCH}_tmp_processing"));
    assert!(processing.contains(&"B1_R1.fastq.gz".to_string()));
    assert!(processing.contains(&"A1_R1.fastq.gz".to_string()));
}

#[test]
fn persistent_mismatch_quarantines_the_sample() {
    let ws = Workspace::new();
    ws.write("LAB01/run_a/S1_R1.fastq.gz", b"good");
    ws.write("LAB01/run_a/S2_R1.fastq.gz", b"tampered");
    ws.write(
        "LAB01/run_a/md5sum.txt",
        format!("{}  S1_R1.fastq.gz\n{}  S2_R1.fastq.gz\n", md5_hex(b"good"), md5_hex(b"original"))
            .as_bytes(),
    );
    ws.write(
        "LAB01/run_a/lab.csv",
        &sheet(&[
            ("S1", "S1_R1.fastq.gz", "", "single"),
            ("S2", "S2_R1.fastq.gz", "", "single"),
        ]),
    );

    let mut app = ws.app(ws.config("download_only", json!({})), ws.local());
    let summary = app.run(&JsonOutput).unwrap();
    assert_eq!(summary.corrupted_files, 1);
    assert_eq!(summary.samples_downloaded, 1);
    assert_eq!(summary.samples_skipped, 1);
    assert!(!ws.batch_dir().join("S2_R1.fastq.gz").as_std_path().exists());

    // The quarantined file is put back for the lab to re-upload.
    let invalid = format!("LAB01/{BATCH}_invalid_samples");
    assert_eq!(ws.remote_names(&invalid), vec!["S2_R1.fastq.gz"]);
}

#[test]
fn abort_on_mismatch_discards_the_whole_batch() {
    let ws = Workspace::new();
    ws.write("LAB01/run_a/S1_R1.fastq.gz", b"good");
    ws.write("LAB01/run_a/S2_R1.fastq.gz", b"tampered");
    ws.write(
        "LAB01/run_a/md5sum.txt",
        format!("{}  S1_R1.fastq.gz\n{}  S2_R1.fastq.gz\n", md5_hex(b"good"), md5_hex(b"original"))
            .as_bytes(),
    );
    ws.write(
        "LAB01/run_a/lab.csv",
        &sheet(&[
            ("S1", "S1_R1.fastq.gz", "", "single"),
            ("S2", "S2_R1.fastq.gz", "", "single"),
        ]),
    );

    let config = ws.config("download_only", json!({ "abort_on_checksum_mismatch": true }));
    let mut app = ws.app(config, ws.local());
    let summary = app.run(&JsonOutput).unwrap();

    assert!(summary.finished.is_empty());
    assert_eq!(summary.skipped.len(), 1);
    assert_eq!(summary.skipped[0].state, FolderLifecycleState::MergedProcessing);
    assert!(!ws.batch_dir().as_std_path().exists());
    // Left for the next run.
    assert!(ws.remote_path(&format!("LAB01/{BATCH}_tmp_processing")).as_std_path().is_dir());
}

#[test]
fn unreadable_metadata_marks_folder_invalid() {
    let ws = Workspace::new();
    let leftover = "LAB01/20230101000000_tmp_processing";
    ws.write(&format!("{leftover}/S1_R1.fastq.gz"), b"x");
    ws.write(
        &format!("{leftover}/lab.csv"),
        b"CAMPO,Sample ID given for sequencing,Sequence file R1\n,S1,S1_R1.fastq.gz\n",
    );

    let mut app = ws.app(ws.config("download_only", json!({})), ws.local());
    let summary = app.run(&JsonOutput).unwrap();

    assert_eq!(summary.skipped.len(), 1);
    assert_eq!(summary.skipped[0].state, FolderLifecycleState::InvalidSamples);
    assert_eq!(
        ws.remote_names("LAB01"),
        vec!["20230101000000_invalid_samples".to_string()]
    );
    assert!(
        !ws.output
            .join("LAB01/20230101000000")
            .as_std_path()
            .exists()
    );
}

#[test]
fn download_only_copies_back_failed_files() {
    let ws = Workspace::new();
    two_submissions(&ws);
    let mut transfer = ScriptedTransfer::new(ws.local());
    transfer.always_fail.insert("B1_R1.fastq.gz".to_string());

    let mut app = ws.app(ws.config("download_only", json!({ "fetch_attempts": 2 })), transfer);
    let summary = app.run(&JsonOutput).unwrap();
    assert_eq!(summary.samples_downloaded, 3);
    assert_eq!(summary.samples_skipped, 1);

    assert_eq!(
        ws.remote_names("LAB01"),
        vec![format!("{BATCH}_downloaded"), format!("{BATCH}_invalid_samples")]
    );
    assert_eq!(
        ws.remote_names(&format!("LAB01/{BATCH}_invalid_samples")),
        vec!["B1_R1.fastq.gz"]
    );
}

#[test]
fn download_clean_removes_the_processing_folder() {
    let ws = Workspace::new();
    two_submissions(&ws);

    let mut app = ws.app(ws.config("download_clean", json!({})), ws.local());
    let summary = app.run(&JsonOutput).unwrap();
    assert_eq!(summary.finished[0].state, FolderLifecycleState::EmptyRemoved);
    assert!(ws.remote_names("LAB01").is_empty());
    assert!(ws.remote_path("LAB01").as_std_path().is_dir());
}

#[test]
fn download_clean_keeps_undeclared_files_visible() {
    let ws = Workspace::new();
    two_submissions(&ws);
    ws.write("LAB01/run_b/stray_R1.fastq.gz", b"who uploaded this");

    let mut app = ws.app(ws.config("download_clean", json!({})), ws.local());
    let summary = app.run(&JsonOutput).unwrap();
    assert_eq!(summary.finished[0].state, FolderLifecycleState::InvalidSamples);
    let invalid = ws.remote_names(&format!("LAB01/{BATCH}_invalid_samples"));
    assert!(invalid.contains(&"stray_R1.fastq.gz".to_string()));
    assert!(!invalid.contains(&"A1_R1.fastq.gz".to_string()));
}

#[test]
fn delete_only_never_removes_lab_folders() {
    let ws = Workspace::new();
    two_submissions(&ws);
    ws.write("LAB02/old_tmp_processing/x.fastq.gz", b"x");

    let mut app = ws.app(ws.config("delete_only", json!({})), ws.local());
    let summary = app.run(&JsonOutput).unwrap();
    assert_eq!(summary.wiped_entries, 3);
    assert!(ws.remote_names("LAB01").is_empty());
    assert!(ws.remote_names("LAB02").is_empty());
    assert!(!ws.batch_dir().as_std_path().exists());
}

#[test]
fn target_labs_restrict_the_run() {
    let ws = Workspace::new();
    two_submissions(&ws);
    ws.write("LAB02/run/x.fastq.gz", b"x");

    let config = ws.config("download_only", json!({ "target_labs": ["LAB02"] }));
    let mut app = ws.app(config, ws.local());
    let summary = app.run(&JsonOutput).unwrap();
    assert_eq!(summary.labs, vec!["LAB02"]);
    assert!(ws.remote_path("LAB01/run_a/lab_a.csv").as_std_path().exists());
}

#[test]
fn unreachable_remote_aborts_the_run() {
    let ws = Workspace::new();
    let transfer = LocalTransfer::new(ws.remote.join("missing"));
    let mut app = ws.app(ws.config("download_only", json!({})), transfer);
    assert_matches!(app.run(&JsonOutput), Err(SyncError::Connection(_)));
}
