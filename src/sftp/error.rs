//! SFTP error types

use thiserror::Error;

use crate::ssh::SshError;

#[derive(Error, Debug)]
pub enum SftpError {
    #[error("SFTP client not initialized")]
    NotInitialized,

    #[error("SFTP subsystem not available: {0}")]
    SubsystemNotAvailable(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("{0} exists and is not a directory")]
    NotADirectory(String),

    #[error("Unsupported file type for {path}: {kind}")]
    UnsupportedFileType { path: String, kind: String },

    #[error("SFTP protocol error: {0}")]
    ProtocolError(String),

    #[error("Walk error: {0}")]
    WalkError(#[from] walkdir::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    Ssh(#[from] SshError),
}

impl SftpError {
    /// Classify a russh-sftp error for `path`
    pub fn from_sftp(err: russh_sftp::client::error::Error, path: &str) -> Self {
        let err_str = err.to_string();
        if err_str.contains("No such file") || err_str.contains("not found") {
            SftpError::FileNotFound(path.to_string())
        } else if err_str.contains("Permission denied") {
            SftpError::PermissionDenied(path.to_string())
        } else {
            SftpError::ProtocolError(format!("{}: {}", path, err_str))
        }
    }
}
