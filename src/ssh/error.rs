//! SSH Error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Private key is encrypted, passphrase required")]
    PassphraseRequired,

    #[error("Unsupported key type: {0}")]
    UnsupportedKeyType(String),

    #[error("DSA keys are not supported")]
    DsaKeyUnsupported,

    #[error("No key found")]
    NoKeyFound,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Host key rejected for {host}: {reason}")]
    HostKeyRejected { host: String, reason: String },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session limit exceeded: device already has session {existing}, refusing {requested}")]
    SessionLimitExceeded { existing: String, requested: String },

    #[error("Enable handshake failed: {0}")]
    EnaHandshake(String),

    #[error("Invalid enable credential")]
    InvalidEnaCredential,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ProtocolError(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}
