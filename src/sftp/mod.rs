//! SFTP module
//!
//! Recursive, permission-preserving file sync between the local filesystem
//! and a remote SFTP endpoint.

pub mod error;
pub mod path_utils;
pub mod remote_fs;
pub mod sync;

pub use error::SftpError;
pub use remote_fs::{RemoteAttrs, RemoteFileKind, RemoteFs};
pub use sync::SyncEngine;
