//! Checksum manifests (`checksum<whitespace>filename` lines, as written by
//! `md5sum`/`sha256sum`) and streaming digest computation.

use std::collections::HashMap;
use std::fs;
use std::io::{BufReader, Read};
use std::path::Path;

use md5::Md5;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::config::ChecksumAlgorithm;
use crate::error::SyncError;

/// Basename to checksum mapping that remembers insertion order. The first
/// entry seen for a basename wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumManifest {
    entries: Vec<(String, String)>,
    index: HashMap<String, usize>,
}

impl ChecksumManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the basename was already present.
    pub fn insert(&mut self, file_name: &str, checksum: &str) -> bool {
        let key = basename(file_name);
        if key.is_empty() || self.index.contains_key(key) {
            return false;
        }
        self.index.insert(key.to_string(), self.entries.len());
        self.entries
            .push((key.to_string(), checksum.trim().to_ascii_lowercase()));
        true
    }

    pub fn get(&self, file_name: &str) -> Option<&str> {
        self.index
            .get(basename(file_name))
            .map(|idx| self.entries[*idx].1.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, sum)| (name.as_str(), sum.as_str()))
    }

    pub fn parse_str(content: &str, skip_patterns: &[Regex]) -> Self {
        let mut manifest = Self::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((checksum, name)) = line.split_once(char::is_whitespace) else {
                tracing::debug!(line, "manifest line without file name");
                continue;
            };
            let name = name.trim().trim_start_matches('*');
            if name.is_empty() {
                continue;
            }
            if skip_patterns.iter().any(|pattern| pattern.is_match(name)) {
                continue;
            }
            if !manifest.insert(name, checksum) {
                tracing::debug!(file = name, "duplicate manifest entry ignored");
            }
        }
        manifest
    }

    /// Concatenates manifests in order; later duplicates never overwrite.
    pub fn merge<I>(manifests: I) -> Self
    where
        I: IntoIterator<Item = ChecksumManifest>,
    {
        let mut merged = Self::new();
        for manifest in manifests {
            for (name, checksum) in manifest.entries {
                merged.insert(&name, &checksum);
            }
        }
        merged
    }

    /// Serialized back into `md5sum` layout for upload.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, checksum) in &self.entries {
            out.push_str(checksum);
            out.push_str("  ");
            out.push_str(name);
            out.push('\n');
        }
        out
    }
}

fn basename(name: &str) -> &str {
    let trimmed = name.trim();
    trimmed
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(trimmed)
}

#[derive(Debug, Clone)]
pub struct ChecksumRegistry {
    algorithm: ChecksumAlgorithm,
    skip_patterns: Vec<Regex>,
}

impl ChecksumRegistry {
    pub fn new(algorithm: ChecksumAlgorithm, skip_patterns: Vec<Regex>) -> Self {
        Self {
            algorithm,
            skip_patterns,
        }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    /// Best effort: an unreadable manifest yields an empty mapping and a
    /// warning, never an error.
    pub fn parse_manifest(&self, path: &Path) -> ChecksumManifest {
        match fs::read(path) {
            Ok(bytes) => {
                let content = String::from_utf8_lossy(&bytes);
                ChecksumManifest::parse_str(&content, &self.skip_patterns)
            }
            Err(err) => {
                tracing::warn!(manifest = %path.display(), "unreadable checksum manifest: {err}");
                ChecksumManifest::new()
            }
        }
    }

    pub fn compute(&self, path: &Path) -> Result<String, SyncError> {
        match self.algorithm {
            ChecksumAlgorithm::Md5 => digest_file::<Md5>(path),
            ChecksumAlgorithm::Sha256 => digest_file::<Sha256>(path),
        }
    }

    /// Recomputes the checksum of `path` and compares it with `expected`.
    pub fn verify(&self, path: &Path, expected: &str) -> Result<String, SyncError> {
        let actual = self.compute(path)?;
        if actual.eq_ignore_ascii_case(expected.trim()) {
            Ok(actual)
        } else {
            Err(SyncError::ChecksumMismatch {
                file: path.display().to_string(),
                expected: expected.trim().to_ascii_lowercase(),
                actual,
            })
        }
    }
}

fn digest_file<D: Digest>(path: &Path) -> Result<String, SyncError> {
    let file = fs::File::open(path)
        .map_err(|err| SyncError::Filesystem(format!("open {}: {err}", path.display())))?;
    let mut reader = BufReader::with_capacity(1 << 16, file);
    let mut hasher = D::new();
    let mut buffer = vec![0u8; 1 << 16];
    loop {
        let read = reader
            .read(&mut buffer)
            .map_err(|err| SyncError::Filesystem(format!("read {}: {err}", path.display())))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
