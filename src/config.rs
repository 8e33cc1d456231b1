use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use directories::ProjectDirs;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::{DownloadMode, LabCode};
use crate::error::SyncError;

const CONFIG_FILE: &str = "seqbatch.json";
const PASSWORD_ENV: &str = "SEQBATCH_SFTP_PASSWORD";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransferProtocol {
    #[default]
    Sftp,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    #[default]
    Md5,
    Sha256,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub remote: RemoteEntry,
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub download_mode: Option<DownloadMode>,
    #[serde(default)]
    pub allowed_extensions: Option<Vec<String>>,
    #[serde(default)]
    pub compressed_extensions: Option<Vec<String>>,
    #[serde(default)]
    pub metadata_extensions: Option<Vec<String>>,
    #[serde(default)]
    pub manifest_pattern: Option<String>,
    #[serde(default)]
    pub manifest_skip_patterns: Vec<String>,
    #[serde(default)]
    pub abort_on_checksum_mismatch: bool,
    #[serde(default)]
    pub checksum_algorithm: ChecksumAlgorithm,
    #[serde(default)]
    pub fetch_attempts: Option<u32>,
    #[serde(default)]
    pub target_labs: Vec<String>,
    #[serde(default)]
    pub metadata: MetadataEntry,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RemoteEntry {
    #[serde(default)]
    pub protocol: TransferProtocol,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<PathBuf>,
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u32>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct MetadataEntry {
    #[serde(default)]
    pub sheet_name: Option<String>,
    #[serde(default)]
    pub header_flag: Option<String>,
    #[serde(default)]
    pub expected_columns: Vec<String>,
    #[serde(default)]
    pub sample_id_column: Option<String>,
    #[serde(default)]
    pub primary_file_column: Option<String>,
    #[serde(default)]
    pub secondary_file_column: Option<String>,
    #[serde(default)]
    pub layout_column: Option<String>,
    #[serde(default)]
    pub paired_layout_value: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub protocol: TransferProtocol,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub private_key: Option<PathBuf>,
    pub root: Utf8PathBuf,
    pub timeout_secs: u32,
}

#[derive(Debug, Clone)]
pub struct MetadataLayout {
    pub sheet_name: String,
    pub header_flag: String,
    pub expected_columns: Vec<String>,
    pub sample_id_column: String,
    pub primary_file_column: String,
    pub secondary_file_column: String,
    pub layout_column: String,
    pub paired_layout_value: String,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub remote: RemoteSettings,
    pub output_dir: Utf8PathBuf,
    pub download_mode: DownloadMode,
    pub allowed_extensions: Vec<String>,
    pub compressed_extensions: Vec<String>,
    pub metadata_extensions: Vec<String>,
    pub manifest_pattern: Regex,
    pub manifest_skip_patterns: Vec<Regex>,
    pub abort_on_checksum_mismatch: bool,
    pub checksum_algorithm: ChecksumAlgorithm,
    pub fetch_attempts: u32,
    pub target_labs: Vec<LabCode>,
    pub metadata: MetadataLayout,
}

impl SyncConfig {
    pub fn is_sequencing_file(&self, name: &str) -> bool {
        has_any_extension(name, &self.allowed_extensions)
    }

    pub fn is_compressed(&self, name: &str) -> bool {
        has_any_extension(name, &self.compressed_extensions)
    }

    pub fn is_metadata_file(&self, name: &str) -> bool {
        !name.starts_with("~$") && has_any_extension(name, &self.metadata_extensions)
    }

    pub fn is_manifest_file(&self, name: &str) -> bool {
        self.manifest_pattern.is_match(name)
    }
}

fn has_any_extension(name: &str, extensions: &[String]) -> bool {
    let lower = name.to_ascii_lowercase();
    extensions.iter().any(|ext| lower.ends_with(ext.as_str()))
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<SyncConfig, SyncError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => Self::default_path().ok_or(SyncError::MissingConfig)?,
        };

        let content = fs::read_to_string(&config_path)
            .map_err(|_| SyncError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| SyncError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    fn default_path() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE);
        if local.exists() {
            return Some(local);
        }
        ProjectDirs::from("org", "seqbatch", "seqbatch")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
            .filter(|path| path.exists())
    }

    pub fn resolve_config(config: Config) -> Result<SyncConfig, SyncError> {
        let remote = resolve_remote(config.remote)?;

        let manifest_pattern = compile(
            config
                .manifest_pattern
                .as_deref()
                .unwrap_or(r"(?i)(md5|checksum).*\.(txt|md5)$"),
        )?;
        let manifest_skip_patterns = config
            .manifest_skip_patterns
            .iter()
            .map(|pattern| compile(pattern))
            .collect::<Result<Vec<_>, SyncError>>()?;

        let target_labs = config
            .target_labs
            .iter()
            .map(|value| value.parse())
            .collect::<Result<Vec<LabCode>, SyncError>>()?;

        let allowed_extensions = normalize_extensions(
            config
                .allowed_extensions
                .unwrap_or_else(default_allowed_extensions),
        );
        if allowed_extensions.is_empty() {
            return Err(SyncError::InvalidConfig(
                "allowed_extensions must not be empty".to_string(),
            ));
        }

        let metadata = config.metadata;
        let layout = MetadataLayout {
            sheet_name: metadata
                .sheet_name
                .unwrap_or_else(|| "METADATA_LAB".to_string()),
            header_flag: metadata.header_flag.unwrap_or_else(|| "CAMPO".to_string()),
            expected_columns: metadata.expected_columns,
            sample_id_column: metadata
                .sample_id_column
                .unwrap_or_else(|| "Sample ID given for sequencing".to_string()),
            primary_file_column: metadata
                .primary_file_column
                .unwrap_or_else(|| "Sequence file R1".to_string()),
            secondary_file_column: metadata
                .secondary_file_column
                .unwrap_or_else(|| "Sequence file R2".to_string()),
            layout_column: metadata
                .layout_column
                .unwrap_or_else(|| "Library Layout".to_string()),
            paired_layout_value: metadata
                .paired_layout_value
                .unwrap_or_else(|| "paired".to_string()),
        };

        Ok(SyncConfig {
            remote,
            output_dir: Utf8PathBuf::from(
                config.output_dir.unwrap_or_else(|| "seqbatch-downloads".to_string()),
            ),
            download_mode: config.download_mode.unwrap_or(DownloadMode::DownloadOnly),
            allowed_extensions,
            compressed_extensions: normalize_extensions(
                config
                    .compressed_extensions
                    .unwrap_or_else(default_compressed_extensions),
            ),
            metadata_extensions: normalize_extensions(
                config
                    .metadata_extensions
                    .unwrap_or_else(default_metadata_extensions),
            ),
            manifest_pattern,
            manifest_skip_patterns,
            abort_on_checksum_mismatch: config.abort_on_checksum_mismatch,
            checksum_algorithm: config.checksum_algorithm,
            fetch_attempts: config.fetch_attempts.unwrap_or(3).max(1),
            target_labs,
            metadata: layout,
        })
    }
}

fn resolve_remote(entry: RemoteEntry) -> Result<RemoteSettings, SyncError> {
    let host = entry.host.unwrap_or_default();
    let user = entry.user.unwrap_or_default();
    if entry.protocol == TransferProtocol::Sftp && (host.is_empty() || user.is_empty()) {
        return Err(SyncError::InvalidConfig(
            "remote.host and remote.user are required for sftp".to_string(),
        ));
    }
    let password = std::env::var(PASSWORD_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .or(entry.password);

    Ok(RemoteSettings {
        protocol: entry.protocol,
        host,
        port: entry.port.unwrap_or(22),
        user,
        password,
        private_key: entry.private_key,
        root: Utf8PathBuf::from(entry.root.unwrap_or_else(|| ".".to_string())),
        timeout_secs: entry.timeout_secs.unwrap_or(30),
    })
}

fn compile(pattern: &str) -> Result<Regex, SyncError> {
    Regex::new(pattern)
        .map_err(|err| SyncError::InvalidConfig(format!("bad pattern {pattern:?}: {err}")))
}

fn normalize_extensions(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|value| value.trim().to_ascii_lowercase())
        .filter(|value| !value.is_empty())
        .map(|value| {
            if value.starts_with('.') {
                value
            } else {
                format!(".{value}")
            }
        })
        .collect()
}

pub fn default_allowed_extensions() -> Vec<String> {
    vec![
        ".fastq.gz".to_string(),
        ".fq.gz".to_string(),
        ".fastq".to_string(),
        ".fq".to_string(),
        ".bam".to_string(),
        ".cram".to_string(),
    ]
}

/// Formats stored as-is; BAM and CRAM carry their own block compression.
pub fn default_compressed_extensions() -> Vec<String> {
    vec![".gz".to_string(), ".bam".to_string(), ".cram".to_string()]
}

pub fn default_metadata_extensions() -> Vec<String> {
    vec![
        ".xlsx".to_string(),
        ".xls".to_string(),
        ".ods".to_string(),
        ".csv".to_string(),
    ]
}
