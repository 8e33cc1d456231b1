use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::{RemoteSettings, TransferProtocol};
use crate::error::SyncError;

pub mod local;
pub mod sftp;

pub use local::LocalTransfer;
pub use sftp::SftpTransfer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// One remote path, relative to the transfer root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub path: Utf8PathBuf,
    pub kind: EntryKind,
    pub size: Option<u64>,
}

impl RemoteEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn name(&self) -> &str {
        self.path.file_name().unwrap_or(self.path.as_str())
    }
}

/// One stateful session against the remote drop. All paths are relative to the
/// configured root.
pub trait TransferClient {
    fn open(&mut self) -> Result<(), SyncError>;
    fn close(&mut self);
    fn is_open(&self) -> bool;
    /// Descendants of `path`; `Err(RemoteNotFound)` when `path` is absent.
    fn list(&mut self, path: &Utf8Path, recursive: bool) -> Result<Vec<RemoteEntry>, SyncError>;
    /// Copies one remote file to `local`, creating parent directories.
    fn fetch(&mut self, remote: &Utf8Path, local: &Path) -> Result<(), SyncError>;
    fn upload(&mut self, local: &Path, remote: &Utf8Path) -> Result<(), SyncError>;
    fn remove_file(&mut self, remote: &Utf8Path) -> Result<(), SyncError>;
    /// Removes an empty directory.
    fn remove_dir(&mut self, remote: &Utf8Path) -> Result<(), SyncError>;
    /// `Err(RemoteNotFound)` when `from` does not exist.
    fn rename(&mut self, from: &Utf8Path, to: &Utf8Path) -> Result<(), SyncError>;
    /// Succeeds when the directory already exists.
    fn make_directory(&mut self, path: &Utf8Path) -> Result<(), SyncError>;
    fn exists(&mut self, path: &Utf8Path) -> Result<bool, SyncError>;

    /// Close and reopen, so every folder starts on a fresh session.
    fn reopen(&mut self) -> Result<(), SyncError> {
        self.close();
        self.open()
    }

    fn list_files(&mut self, path: &Utf8Path) -> Result<Vec<RemoteEntry>, SyncError> {
        Ok(self
            .list(path, false)?
            .into_iter()
            .filter(RemoteEntry::is_file)
            .collect())
    }

    fn list_dirs(&mut self, path: &Utf8Path) -> Result<Vec<RemoteEntry>, SyncError> {
        Ok(self
            .list(path, false)?
            .into_iter()
            .filter(RemoteEntry::is_dir)
            .collect())
    }
}

/// Resolves the configured protocol into its client once, at startup.
pub fn connect(settings: &RemoteSettings) -> Box<dyn TransferClient> {
    match settings.protocol {
        TransferProtocol::Sftp => Box::new(SftpTransfer::new(settings.clone())),
        TransferProtocol::Local => Box::new(LocalTransfer::new(settings.root.clone())),
    }
}

impl<T: TransferClient + ?Sized> TransferClient for Box<T> {
    fn open(&mut self) -> Result<(), SyncError> {
        (**self).open()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn list(&mut self, path: &Utf8Path, recursive: bool) -> Result<Vec<RemoteEntry>, SyncError> {
        (**self).list(path, recursive)
    }

    fn fetch(&mut self, remote: &Utf8Path, local: &Path) -> Result<(), SyncError> {
        (**self).fetch(remote, local)
    }

    fn upload(&mut self, local: &Path, remote: &Utf8Path) -> Result<(), SyncError> {
        (**self).upload(local, remote)
    }

    fn remove_file(&mut self, remote: &Utf8Path) -> Result<(), SyncError> {
        (**self).remove_file(remote)
    }

    fn remove_dir(&mut self, remote: &Utf8Path) -> Result<(), SyncError> {
        (**self).remove_dir(remote)
    }

    fn rename(&mut self, from: &Utf8Path, to: &Utf8Path) -> Result<(), SyncError> {
        (**self).rename(from, to)
    }

    fn make_directory(&mut self, path: &Utf8Path) -> Result<(), SyncError> {
        (**self).make_directory(path)
    }

    fn exists(&mut self, path: &Utf8Path) -> Result<bool, SyncError> {
        (**self).exists(path)
    }
}

/// Strips the root prefix and any leading `./` so listings compare equal no
/// matter how the server reports paths.
pub(crate) fn relative_to_root(root: &Utf8Path, full: &Utf8Path) -> Utf8PathBuf {
    let stripped = full.strip_prefix(root).unwrap_or(full);
    stripped
        .components()
        .filter(|component| component.as_str() != "." && component.as_str() != "/")
        .collect()
}

pub(crate) fn join_root(root: &Utf8Path, relative: &Utf8Path) -> Utf8PathBuf {
    let relative = relative.as_str().trim_start_matches('/');
    if relative.is_empty() || relative == "." {
        root.to_path_buf()
    } else {
        root.join(relative)
    }
}
