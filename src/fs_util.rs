use std::fs;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;

use crate::error::SyncError;

/// Compresses `path` to `path.gz` next to it, checks the result decodes, then
/// removes the original. The original is left untouched on any failure, and an
/// existing `path.gz` is never replaced.
pub fn gzip_in_place(path: &Utf8Path) -> Result<Utf8PathBuf, SyncError> {
    let target = Utf8PathBuf::from(format!("{path}.gz"));
    if target.as_std_path().exists() {
        return Err(SyncError::Filesystem(format!("{target} already exists")));
    }
    let parent = path
        .parent()
        .ok_or_else(|| SyncError::Filesystem(format!("no parent directory for {path}")))?;

    let source = fs::File::open(path.as_std_path())
        .map_err(|err| SyncError::Filesystem(format!("open {path}: {err}")))?;
    let temp = tempfile::Builder::new()
        .prefix(".seqbatch-gzip")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| SyncError::Filesystem(err.to_string()))?;

    {
        let mut encoder = GzEncoder::new(BufWriter::new(temp.as_file()), Compression::default());
        io::copy(&mut BufReader::new(source), &mut encoder)
            .map_err(|err| SyncError::Integrity(format!("{path}: {err}")))?;
        let mut writer = encoder
            .finish()
            .map_err(|err| SyncError::Integrity(format!("{path}: {err}")))?;
        writer
            .flush()
            .map_err(|err| SyncError::Integrity(format!("{path}: {err}")))?;
    }

    validate_gzip(temp.path())?;
    temp.persist_noclobber(target.as_std_path())
        .map_err(|err| SyncError::Filesystem(format!("{target}: {err}")))?;
    fs::remove_file(path.as_std_path())
        .map_err(|err| SyncError::Filesystem(format!("remove {path}: {err}")))?;
    Ok(target)
}

/// Decodes the whole stream, failing on truncated or corrupt members.
pub fn validate_gzip(path: &Path) -> Result<u64, SyncError> {
    let file = fs::File::open(path)
        .map_err(|err| SyncError::Filesystem(format!("open {}: {err}", path.display())))?;
    let mut decoder = MultiGzDecoder::new(BufReader::new(file));
    io::copy(&mut decoder, &mut io::sink())
        .map_err(|err| SyncError::Integrity(format!("{}: {err}", path.display())))
}
