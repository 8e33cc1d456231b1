use assert_matches::assert_matches;
use camino::Utf8Path;

use seqbatch_sync::domain::{
    BatchId, FolderLifecycleState, LabCode, is_protected_folder, renamed_with_suffix,
};
use seqbatch_sync::error::SyncError;

#[test]
fn parse_lab_code_valid() {
    let lab: LabCode = "LAB-07".parse().unwrap();
    assert_eq!(lab.as_str(), "LAB-07");
}

#[test]
fn parse_lab_code_invalid() {
    assert_matches!("".parse::<LabCode>(), Err(SyncError::InvalidLabCode(_)));
    assert_matches!("..".parse::<LabCode>(), Err(SyncError::InvalidLabCode(_)));
}

#[test]
fn batch_ids_are_timestamps() {
    let batch = BatchId::now();
    assert_eq!(batch.as_str().len(), 14);
    assert!(batch.as_str().chars().all(|c| c.is_ascii_digit()));
    assert!(batch.processing_folder_name().ends_with("_tmp_processing"));
}

#[test]
fn lifecycle_follows_folder_names() {
    let processing = Utf8Path::new("LAB01/20240101120000_tmp_processing");
    assert_eq!(
        FolderLifecycleState::classify(processing),
        FolderLifecycleState::MergedProcessing
    );
    let invalid = renamed_with_suffix(processing, "_invalid_samples");
    assert_eq!(invalid, "LAB01/20240101120000_invalid_samples");
    assert_eq!(
        FolderLifecycleState::classify(&invalid),
        FolderLifecycleState::InvalidSamples
    );
    assert!(FolderLifecycleState::InvalidSamples.is_terminal());
    assert!(!FolderLifecycleState::Downloaded.can_transition_to(FolderLifecycleState::MergedProcessing));
}

#[test]
fn lab_folders_are_protected() {
    assert!(is_protected_folder(Utf8Path::new("LAB01")));
    assert!(is_protected_folder(Utf8Path::new("./LAB01")));
    assert!(!is_protected_folder(Utf8Path::new("LAB01/run_a")));
}
