use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::net::TcpStream;
use std::path::Path;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use ssh2::{ErrorCode, Session, Sftp};

use super::{EntryKind, RemoteEntry, TransferClient, join_root, relative_to_root};
use crate::config::RemoteSettings;
use crate::error::SyncError;

const SFTP_NO_SUCH_FILE: i32 = 2;

pub struct SftpTransfer {
    settings: RemoteSettings,
    session: Option<(Session, Sftp)>,
}

impl SftpTransfer {
    pub fn new(settings: RemoteSettings) -> Self {
        Self {
            settings,
            session: None,
        }
    }

    fn sftp(&self) -> Result<&Sftp, SyncError> {
        self.session
            .as_ref()
            .map(|(_, sftp)| sftp)
            .ok_or_else(|| SyncError::Connection("sftp session is not open".to_string()))
    }

    fn full(&self, relative: &Utf8Path) -> Utf8PathBuf {
        join_root(&self.settings.root, relative)
    }

    fn authenticate(&self, session: &Session) -> Result<(), SyncError> {
        let user = self.settings.user.as_str();
        let mut failures = Vec::new();
        if let Some(key) = &self.settings.private_key {
            if let Err(err) =
                session.userauth_pubkey_file(user, None, key, self.settings.password.as_deref())
            {
                failures.push(format!("key {}: {err}", key.display()));
            }
        }
        if !session.authenticated() {
            if let Some(password) = &self.settings.password {
                if let Err(err) = session.userauth_password(user, password) {
                    failures.push(format!("password: {err}"));
                }
            }
        }
        if !session.authenticated() {
            if let Err(err) = session.userauth_agent(user) {
                failures.push(format!("agent: {err}"));
            }
        }
        if session.authenticated() {
            Ok(())
        } else {
            Err(SyncError::Connection(format!(
                "authentication rejected for {user}@{}: {}",
                self.settings.host,
                failures.join("; ")
            )))
        }
    }
}

fn map_ssh(path: &Utf8Path, err: ssh2::Error) -> SyncError {
    match err.code() {
        ErrorCode::SFTP(SFTP_NO_SUCH_FILE) => SyncError::RemoteNotFound(path.to_string()),
        ErrorCode::SFTP(_) => SyncError::Remote(format!("{path}: {err}")),
        ErrorCode::Session(_) => SyncError::Connection(format!("{path}: {err}")),
    }
}

impl TransferClient for SftpTransfer {
    fn open(&mut self) -> Result<(), SyncError> {
        if self.session.is_some() {
            return Ok(());
        }
        let address = format!("{}:{}", self.settings.host, self.settings.port);
        let tcp = TcpStream::connect(&address)
            .map_err(|err| SyncError::Connection(format!("connect {address}: {err}")))?;
        let timeout = Duration::from_secs(u64::from(self.settings.timeout_secs));
        tcp.set_read_timeout(Some(timeout))
            .and_then(|_| tcp.set_write_timeout(Some(timeout)))
            .map_err(|err| SyncError::Connection(err.to_string()))?;

        let mut session =
            Session::new().map_err(|err| SyncError::Connection(err.to_string()))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(self.settings.timeout_secs.saturating_mul(1000));
        session
            .handshake()
            .map_err(|err| SyncError::Connection(format!("handshake with {address}: {err}")))?;
        self.authenticate(&session)?;
        let sftp = session
            .sftp()
            .map_err(|err| SyncError::Connection(format!("sftp subsystem: {err}")))?;

        tracing::debug!(host = %self.settings.host, "sftp session opened");
        self.session = Some((session, sftp));
        Ok(())
    }

    fn close(&mut self) {
        if let Some((session, sftp)) = self.session.take() {
            drop(sftp);
            if let Err(err) = session.disconnect(None, "closing", None) {
                tracing::debug!("sftp disconnect: {err}");
            }
        }
    }

    fn is_open(&self) -> bool {
        self.session.is_some()
    }

    fn list(&mut self, path: &Utf8Path, recursive: bool) -> Result<Vec<RemoteEntry>, SyncError> {
        let root = self.settings.root.clone();
        let base = self.full(path);
        let sftp = self.sftp()?;
        let mut entries = Vec::new();
        let mut stack = vec![base];
        while let Some(dir) = stack.pop() {
            let items = sftp
                .readdir(dir.as_std_path())
                .map_err(|err| map_ssh(&dir, err))?;
            for (item, stat) in items {
                let full = Utf8PathBuf::from_path_buf(item).map_err(|path| {
                    SyncError::Remote(format!("non-utf8 remote path: {}", path.display()))
                })?;
                let kind = if stat.is_dir() {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                };
                if recursive && stat.is_dir() {
                    stack.push(full.clone());
                }
                entries.push(RemoteEntry {
                    path: relative_to_root(&root, &full),
                    kind,
                    size: stat.size,
                });
            }
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    fn fetch(&mut self, remote: &Utf8Path, local: &Path) -> Result<(), SyncError> {
        let full = self.full(remote);
        let sftp = self.sftp()?;
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| SyncError::Filesystem(err.to_string()))?;
        }
        let source = sftp
            .open(full.as_std_path())
            .map_err(|err| map_ssh(remote, err))?;
        let target =
            File::create(local).map_err(|err| SyncError::Filesystem(err.to_string()))?;
        let mut writer = BufWriter::new(target);
        io::copy(&mut BufReader::new(source), &mut writer)
            .map_err(|err| SyncError::Remote(format!("{remote}: {err}")))?;
        writer
            .flush()
            .map_err(|err| SyncError::Filesystem(err.to_string()))
    }

    fn upload(&mut self, local: &Path, remote: &Utf8Path) -> Result<(), SyncError> {
        let full = self.full(remote);
        let sftp = self.sftp()?;
        let source = File::open(local)
            .map_err(|err| SyncError::Filesystem(format!("open {}: {err}", local.display())))?;
        let target = sftp
            .create(full.as_std_path())
            .map_err(|err| map_ssh(remote, err))?;
        let mut writer = BufWriter::new(target);
        io::copy(&mut BufReader::new(source), &mut writer)
            .map_err(|err| SyncError::Remote(format!("{remote}: {err}")))?;
        writer
            .flush()
            .map_err(|err| SyncError::Remote(format!("{remote}: {err}")))
    }

    fn remove_file(&mut self, remote: &Utf8Path) -> Result<(), SyncError> {
        let full = self.full(remote);
        self.sftp()?
            .unlink(full.as_std_path())
            .map_err(|err| map_ssh(remote, err))
    }

    fn remove_dir(&mut self, remote: &Utf8Path) -> Result<(), SyncError> {
        let full = self.full(remote);
        self.sftp()?
            .rmdir(full.as_std_path())
            .map_err(|err| map_ssh(remote, err))
    }

    fn rename(&mut self, from: &Utf8Path, to: &Utf8Path) -> Result<(), SyncError> {
        let source = self.full(from);
        let target = self.full(to);
        let sftp = self.sftp()?;
        sftp.stat(source.as_std_path())
            .map_err(|err| map_ssh(from, err))?;
        sftp.rename(source.as_std_path(), target.as_std_path(), None)
            .map_err(|err| map_ssh(from, err))
    }

    fn make_directory(&mut self, path: &Utf8Path) -> Result<(), SyncError> {
        let full = self.full(path);
        let sftp = self.sftp()?;
        match sftp.stat(full.as_std_path()) {
            Ok(stat) if stat.is_dir() => return Ok(()),
            Ok(_) => {
                return Err(SyncError::Remote(format!(
                    "{path} exists and is not a directory"
                )));
            }
            Err(_) => {}
        }
        sftp.mkdir(full.as_std_path(), 0o755)
            .map_err(|err| map_ssh(path, err))
    }

    fn exists(&mut self, path: &Utf8Path) -> Result<bool, SyncError> {
        let full = self.full(path);
        match self.sftp()?.stat(full.as_std_path()) {
            Ok(_) => Ok(true),
            Err(err) => match map_ssh(path, err) {
                SyncError::RemoteNotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }
}

impl Drop for SftpTransfer {
    fn drop(&mut self) {
        self.close();
    }
}
