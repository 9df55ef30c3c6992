//! Configuration Module
//!
//! Remote descriptors consumed by the executor and the remotes file they are
//! loaded from.

pub mod remote;
pub mod storage;

pub use remote::{AuthKind, AuthMethod, DeviceOptions, HostKeyPolicy, KeySource, Protocol, Remote};
pub use storage::{config_dir, remotes_file, RemotesConfig, RemotesStorage, StorageError};
