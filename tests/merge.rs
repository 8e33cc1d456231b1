use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use seqbatch_sync::checksum::ChecksumRegistry;
use seqbatch_sync::config::{Config, ConfigLoader, SyncConfig};
use seqbatch_sync::domain::{BatchId, LabCode};
use seqbatch_sync::log_summary::{FolderContext, LogSummary};
use seqbatch_sync::merger::SubmissionMerger;
use seqbatch_sync::store::Store;
use seqbatch_sync::transfer::{LocalTransfer, TransferClient};

const HEADER: &str =
    "CAMPO,Sample ID given for sequencing,Sequence file R1,Sequence file R2,Library Layout\n";

fn setup() -> (tempfile::TempDir, Utf8PathBuf, SyncConfig) {
    let temp = tempfile::tempdir().unwrap();
    let base = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let remote = base.join("drop");
    let config: Config = serde_json::from_value(serde_json::json!({
        "remote": { "protocol": "local", "root": remote.as_str() },
        "output_dir": base.join("out").as_str(),
        "metadata": {
            "expected_columns": [
                "Sample ID given for sequencing",
                "Sequence file R1",
                "Sequence file R2",
                "Library Layout"
            ]
        }
    }))
    .unwrap();
    (temp, remote, ConfigLoader::resolve_config(config).unwrap())
}

fn write(root: &Utf8Path, relative: &str, content: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap().as_std_path()).unwrap();
    fs::write(path.as_std_path(), content).unwrap();
}

fn names(root: &Utf8Path, relative: &str) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(root.join(relative).as_std_path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

#[test]
fn second_merge_does_not_duplicate_files() {
    let (_temp, remote, config) = setup();
    write(&remote, "LAB01/run_a/S1_R1.fastq.gz", "1");
    write(&remote, "LAB01/run_a/S2_R1.fastq.gz", "2");
    write(
        &remote,
        "LAB01/run_a/lab.csv",
        &format!("{HEADER},S1,S1_R1.fastq.gz,,single\n,S2,S2_R1.fastq.gz,,single\n"),
    );

    let store = Store::new(config.output_dir.clone());
    let checksums = ChecksumRegistry::new(config.checksum_algorithm, Vec::new());
    let batch = BatchId::new("20240101120000");
    let merger = SubmissionMerger::new(&config, &checksums, &store, &batch);
    let mut transfer = LocalTransfer::new(remote.clone());
    transfer.open().unwrap();

    let lab: LabCode = "LAB01".parse().unwrap();
    let mut log = LogSummary::new();
    let mut ctx = FolderContext::new(lab, Utf8PathBuf::from("LAB01"), &mut log);

    let first = merger.merge_lab(&mut transfer, &mut ctx).unwrap();
    assert_eq!(
        first.processing_folders,
        vec![Utf8PathBuf::from("LAB01/20240101120000_tmp_processing")]
    );
    assert_eq!(first.consumed.len(), 1);
    assert_eq!(first.consumed[0].moved_files, 2);
    let after_first = names(&remote, "LAB01/20240101120000_tmp_processing");

    let second = merger.merge_lab(&mut transfer, &mut ctx).unwrap();
    assert!(second.consumed.is_empty());
    assert_eq!(names(&remote, "LAB01/20240101120000_tmp_processing"), after_first);
    assert_eq!(
        after_first,
        vec!["S1_R1.fastq.gz", "S2_R1.fastq.gz", "lab.csv"]
    );
}

#[test]
fn files_already_in_processing_folder_stay_put() {
    let (_temp, remote, config) = setup();
    write(&remote, "LAB01/run_a/S1_R1.fastq.gz", "new upload");
    write(
        &remote,
        "LAB01/run_a/lab.csv",
        &format!("{HEADER},S1,S1_R1.fastq.gz,,single\n"),
    );
    write(&remote, "LAB01/20240101120000_tmp_processing/S1_R1.fastq.gz", "moved before crash");

    let store = Store::new(config.output_dir.clone());
    let checksums = ChecksumRegistry::new(config.checksum_algorithm, Vec::new());
    let batch = BatchId::new("20240101120000");
    let merger = SubmissionMerger::new(&config, &checksums, &store, &batch);
    let mut transfer = LocalTransfer::new(remote.clone());
    transfer.open().unwrap();

    let mut log = LogSummary::new();
    let mut ctx = FolderContext::new("LAB01".parse().unwrap(), Utf8PathBuf::from("LAB01"), &mut log);
    let outcome = merger.merge_lab(&mut transfer, &mut ctx).unwrap();
    assert_eq!(outcome.consumed[0].moved_files, 0);
    assert_eq!(
        fs::read_to_string(
            remote
                .join("LAB01/20240101120000_tmp_processing/S1_R1.fastq.gz")
                .as_std_path()
        )
        .unwrap(),
        "moved before crash"
    );

    // The unmoved upload keeps its sub-folder alive.
    merger
        .retire_consumed(&mut transfer, &mut ctx, &outcome.consumed)
        .unwrap();
    assert!(remote.join("LAB01/run_a/S1_R1.fastq.gz").as_std_path().exists());
    assert!(!ctx.log().get("LAB01").unwrap().warnings.is_empty());
}

#[test]
fn invalid_sub_folders_are_skipped_not_fatal() {
    let (_temp, remote, config) = setup();
    write(&remote, "LAB01/good/S1_R1.fastq.gz", "1");
    write(
        &remote,
        "LAB01/good/lab.csv",
        &format!("{HEADER},S1,S1_R1.fastq.gz,,single\n"),
    );
    write(&remote, "LAB01/no_sheet/S9_R1.fastq.gz", "9");
    write(&remote, "LAB01/bad_header/S8_R1.fastq.gz", "8");
    write(&remote, "LAB01/bad_header/lab.csv", "CAMPO,Sample\n,S8\n");
    write(&remote, "LAB01/old_invalid_samples/S7_R1.fastq.gz", "7");

    let store = Store::new(config.output_dir.clone());
    let checksums = ChecksumRegistry::new(config.checksum_algorithm, Vec::new());
    let batch = BatchId::new("20240101120000");
    let merger = SubmissionMerger::new(&config, &checksums, &store, &batch);
    let mut transfer = LocalTransfer::new(remote.clone());
    transfer.open().unwrap();

    let mut log = LogSummary::new();
    let mut ctx = FolderContext::new("LAB01".parse().unwrap(), Utf8PathBuf::from("LAB01"), &mut log);
    let outcome = merger.merge_lab(&mut transfer, &mut ctx).unwrap();
    merger
        .retire_consumed(&mut transfer, &mut ctx, &outcome.consumed)
        .unwrap();

    assert_eq!(outcome.consumed.len(), 1);
    assert_eq!(
        names(&remote, "LAB01"),
        vec![
            "20240101120000_tmp_processing",
            "bad_header",
            "no_sheet",
            "old_invalid_samples"
        ]
    );
    assert!(!log.get("LAB01/no_sheet").unwrap().valid);
    assert!(!log.get("LAB01/bad_header").unwrap().valid);
    assert!(log.get("LAB01/old_invalid_samples").is_none());
}
