//! Remote filesystem seam used by the sync engine
//!
//! Implemented for the russh-sftp client. Paths are remote paths and always
//! use `/` separators.

use std::pin::Pin;

use async_trait::async_trait;
use russh_sftp::client::error::Error as SftpErrorInner;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite};

use super::error::SftpError;

pub type RemoteReader = Pin<Box<dyn AsyncRead + Send>>;
pub type RemoteWriter = Pin<Box<dyn AsyncWrite + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteFileKind {
    File,
    Dir,
    Symlink,
    Other,
}

/// Subset of remote attributes the sync engine needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAttrs {
    pub kind: RemoteFileKind,
    /// Permission bits only (no file type bits)
    pub mode: u32,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl RemoteAttrs {
    pub fn is_dir(&self) -> bool {
        self.kind == RemoteFileKind::Dir
    }
}

#[async_trait]
pub trait RemoteFs: Send + Sync {
    /// Attributes of `path` itself, `None` if it does not exist
    async fn lstat(&self, path: &str) -> Result<Option<RemoteAttrs>, SftpError>;

    /// Attributes following symlinks, `None` if it does not exist
    async fn stat(&self, path: &str) -> Result<Option<RemoteAttrs>, SftpError>;

    async fn mkdir(&self, path: &str) -> Result<(), SftpError>;

    async fn chmod(&self, path: &str, mode: u32) -> Result<(), SftpError>;

    async fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<(), SftpError>;

    /// Create `link` pointing at `target`
    async fn symlink(&self, link: &str, target: &str) -> Result<(), SftpError>;

    async fn read_link(&self, path: &str) -> Result<String, SftpError>;

    async fn remove_file(&self, path: &str) -> Result<(), SftpError>;

    /// Entry names of a directory, without `.` and `..`
    async fn read_dir(&self, path: &str) -> Result<Vec<String>, SftpError>;

    /// Create or truncate a file for writing
    async fn create(&self, path: &str) -> Result<RemoteWriter, SftpError>;

    async fn open(&self, path: &str) -> Result<RemoteReader, SftpError>;
}

fn is_not_found(err: &SftpErrorInner) -> bool {
    match err {
        SftpErrorInner::Status(status) => matches!(status.status_code, StatusCode::NoSuchFile),
        other => other.to_string().contains("No such file"),
    }
}

fn to_attrs(attrs: &FileAttributes) -> RemoteAttrs {
    let kind = if attrs.is_dir() {
        RemoteFileKind::Dir
    } else if attrs.is_symlink() {
        RemoteFileKind::Symlink
    } else if attrs.is_regular() {
        RemoteFileKind::File
    } else {
        RemoteFileKind::Other
    };
    RemoteAttrs {
        kind,
        mode: attrs.permissions.unwrap_or(0) & 0o7777,
        uid: attrs.uid,
        gid: attrs.gid,
    }
}

#[async_trait]
impl RemoteFs for SftpSession {
    async fn lstat(&self, path: &str) -> Result<Option<RemoteAttrs>, SftpError> {
        match self.symlink_metadata(path).await {
            Ok(attrs) => Ok(Some(to_attrs(&attrs))),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(SftpError::from_sftp(e, path)),
        }
    }

    async fn stat(&self, path: &str) -> Result<Option<RemoteAttrs>, SftpError> {
        match self.metadata(path).await {
            Ok(attrs) => Ok(Some(to_attrs(&attrs))),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(SftpError::from_sftp(e, path)),
        }
    }

    async fn mkdir(&self, path: &str) -> Result<(), SftpError> {
        self.create_dir(path)
            .await
            .map_err(|e| SftpError::from_sftp(e, path))
    }

    async fn chmod(&self, path: &str, mode: u32) -> Result<(), SftpError> {
        let attrs = FileAttributes {
            permissions: Some(mode),
            ..FileAttributes::empty()
        };
        self.set_metadata(path, attrs)
            .await
            .map_err(|e| SftpError::from_sftp(e, path))
    }

    async fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<(), SftpError> {
        let attrs = FileAttributes {
            uid: Some(uid),
            gid: Some(gid),
            ..FileAttributes::empty()
        };
        self.set_metadata(path, attrs)
            .await
            .map_err(|e| SftpError::from_sftp(e, path))
    }

    async fn symlink(&self, link: &str, target: &str) -> Result<(), SftpError> {
        // OpenSSH's sftp-server reads SSH_FXP_SYMLINK arguments as
        // (target, link), the reverse of the draft
        SftpSession::symlink(self, target, link)
            .await
            .map_err(|e| SftpError::from_sftp(e, link))
    }

    async fn read_link(&self, path: &str) -> Result<String, SftpError> {
        SftpSession::read_link(self, path)
            .await
            .map_err(|e| SftpError::from_sftp(e, path))
    }

    async fn remove_file(&self, path: &str) -> Result<(), SftpError> {
        SftpSession::remove_file(self, path)
            .await
            .map_err(|e| SftpError::from_sftp(e, path))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<String>, SftpError> {
        let entries = SftpSession::read_dir(self, path)
            .await
            .map_err(|e| SftpError::from_sftp(e, path))?;
        Ok(entries
            .map(|entry| entry.file_name())
            .filter(|name| name != "." && name != "..")
            .collect())
    }

    async fn create(&self, path: &str) -> Result<RemoteWriter, SftpError> {
        let file = SftpSession::create(self, path)
            .await
            .map_err(|e| SftpError::from_sftp(e, path))?;
        Ok(Box::pin(file))
    }

    async fn open(&self, path: &str) -> Result<RemoteReader, SftpError> {
        let file = SftpSession::open(self, path)
            .await
            .map_err(|e| SftpError::from_sftp(e, path))?;
        Ok(Box::pin(file))
    }
}
