use std::fs;
use std::io;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};

use super::{EntryKind, RemoteEntry, TransferClient, join_root, relative_to_root};
use crate::error::SyncError;

/// A drop directory mounted on the local filesystem (NFS share, staging area).
#[derive(Debug, Clone)]
pub struct LocalTransfer {
    root: Utf8PathBuf,
    open: bool,
}

impl LocalTransfer {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root, open: false }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn resolve(&self, relative: &Utf8Path) -> Result<Utf8PathBuf, SyncError> {
        if !self.open {
            return Err(SyncError::Connection(format!(
                "session for {} is closed",
                self.root
            )));
        }
        Ok(join_root(&self.root, relative))
    }
}

fn map_io(path: &Utf8Path, err: io::Error) -> SyncError {
    if err.kind() == io::ErrorKind::NotFound {
        SyncError::RemoteNotFound(path.to_string())
    } else {
        SyncError::Remote(format!("{path}: {err}"))
    }
}

impl TransferClient for LocalTransfer {
    fn open(&mut self) -> Result<(), SyncError> {
        if !self.root.as_std_path().is_dir() {
            return Err(SyncError::Connection(format!(
                "drop directory {} is not reachable",
                self.root
            )));
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn list(&mut self, path: &Utf8Path, recursive: bool) -> Result<Vec<RemoteEntry>, SyncError> {
        let base = self.resolve(path)?;
        if !base.as_std_path().is_dir() {
            return Err(SyncError::RemoteNotFound(path.to_string()));
        }
        let mut entries = Vec::new();
        let mut stack = vec![base];
        while let Some(dir) = stack.pop() {
            let items = fs::read_dir(dir.as_std_path()).map_err(|err| map_io(&dir, err))?;
            for item in items {
                let item = item.map_err(|err| map_io(&dir, err))?;
                let full = Utf8PathBuf::from_path_buf(item.path()).map_err(|path| {
                    SyncError::Remote(format!("non-utf8 path: {}", path.display()))
                })?;
                let meta = item.metadata().map_err(|err| map_io(&full, err))?;
                let kind = if meta.is_dir() {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                };
                if recursive && meta.is_dir() {
                    stack.push(full.clone());
                }
                entries.push(RemoteEntry {
                    path: relative_to_root(&self.root, &full),
                    kind,
                    size: meta.is_file().then(|| meta.len()),
                });
            }
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    fn fetch(&mut self, remote: &Utf8Path, local: &Path) -> Result<(), SyncError> {
        let source = self.resolve(remote)?;
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        }
        fs::copy(source.as_std_path(), local).map_err(|err| map_io(remote, err))?;
        Ok(())
    }

    fn upload(&mut self, local: &Path, remote: &Utf8Path) -> Result<(), SyncError> {
        let target = self.resolve(remote)?;
        fs::copy(local, target.as_std_path()).map_err(|err| map_io(remote, err))?;
        Ok(())
    }

    fn remove_file(&mut self, remote: &Utf8Path) -> Result<(), SyncError> {
        let target = self.resolve(remote)?;
        fs::remove_file(target.as_std_path()).map_err(|err| map_io(remote, err))
    }

    fn remove_dir(&mut self, remote: &Utf8Path) -> Result<(), SyncError> {
        let target = self.resolve(remote)?;
        fs::remove_dir(target.as_std_path()).map_err(|err| map_io(remote, err))
    }

    fn rename(&mut self, from: &Utf8Path, to: &Utf8Path) -> Result<(), SyncError> {
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;
        if !source.as_std_path().exists() {
            return Err(SyncError::RemoteNotFound(from.to_string()));
        }
        fs::rename(source.as_std_path(), target.as_std_path()).map_err(|err| map_io(from, err))
    }

    fn make_directory(&mut self, path: &Utf8Path) -> Result<(), SyncError> {
        let target = self.resolve(path)?;
        if target.as_std_path().is_dir() {
            return Ok(());
        }
        fs::create_dir(target.as_std_path()).map_err(|err| map_io(path, err))
    }

    fn exists(&mut self, path: &Utf8Path) -> Result<bool, SyncError> {
        Ok(self.resolve(path)?.as_std_path().exists())
    }
}
