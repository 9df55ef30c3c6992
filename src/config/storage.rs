//! Remotes Storage
//!
//! Reads and writes the remotes file.
//! Location: ~/.sshcompose on macOS/Linux, %APPDATA%\SshCompose on Windows

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::remote::Remote;

/// Remotes storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Remote {0} not found")]
    RemoteNotFound(String),

    #[error("No remote selected and no default remote configured")]
    NoDefaultRemote,
}

/// Named remotes plus the default selection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemotesConfig {
    #[serde(default, rename = "default-remote", skip_serializing_if = "Option::is_none")]
    pub default_remote: Option<String>,

    #[serde(default)]
    pub remotes: BTreeMap<String, Remote>,
}

impl RemotesConfig {
    pub fn add_remote(&mut self, name: impl Into<String>, remote: Remote) {
        self.remotes.insert(name.into(), remote);
    }

    pub fn del_remote(&mut self, name: &str) -> Option<Remote> {
        self.remotes.remove(name)
    }

    pub fn get_remote(&self, name: &str) -> Option<&Remote> {
        self.remotes.get(name)
    }

    /// Pick `name` if given, otherwise the default remote
    pub fn select(&self, name: Option<&str>) -> Result<(String, &Remote), StorageError> {
        let name = match name {
            Some(n) => n.to_string(),
            None => self
                .default_remote
                .clone()
                .ok_or(StorageError::NoDefaultRemote)?,
        };
        let remote = self
            .remotes
            .get(&name)
            .ok_or_else(|| StorageError::RemoteNotFound(name.clone()))?;
        Ok((name, remote))
    }
}

/// Get the configuration directory
/// Returns %APPDATA%\SshCompose on Windows, ~/.sshcompose on macOS/Linux
pub fn config_dir() -> Result<PathBuf, StorageError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("SshCompose"));
        }
        dirs::home_dir()
            .map(|home| home.join(".sshcompose"))
            .ok_or(StorageError::NoConfigDir)
    }

    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .map(|home| home.join(".sshcompose"))
            .ok_or(StorageError::NoConfigDir)
    }
}

/// Get the remotes file path
pub fn remotes_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("remotes.json"))
}

/// Remotes file manager
pub struct RemotesStorage {
    path: PathBuf,
}

impl RemotesStorage {
    /// Create a storage manager with the default path
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: remotes_file()?,
        })
    }

    /// Create storage manager with custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    async fn ensure_dir(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Load the remotes file. A missing file yields an empty config.
    pub async fn load(&self) -> Result<RemotesConfig, StorageError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RemotesConfig::default()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Save the remotes file
    pub async fn save(&self, config: &RemotesConfig) -> Result<(), StorageError> {
        self.ensure_dir().await?;

        // Write to temp file first, then rename (atomic write)
        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(config)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.path).await?;

        Ok(())
    }

    /// Directory holding the remotes file, exported to host commands as `SSHC_CONF`
    pub fn dir(&self) -> Option<PathBuf> {
        self.path.parent().map(|p| p.to_path_buf())
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}
