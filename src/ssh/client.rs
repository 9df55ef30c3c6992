//! SSH client: dialing, handshake and authentication using russh

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle, KeyboardInteractiveAuthResponse};
use russh::keys::{PrivateKeyWithHashAlg, PublicKey};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::auth::{ConnectionConfig, Credentials};
use super::error::SshError;
use super::known_hosts::get_known_hosts;
use crate::config::{HostKeyPolicy, Protocol, Remote};

/// Keyboard-interactive rounds answered before giving up
const MAX_KBI_ROUNDS: usize = 5;

/// Authenticated client connection
pub type SshHandle = Handle<ClientHandler>;

/// russh client configuration shared by every hop and target
pub fn ssh_config() -> Arc<client::Config> {
    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    })
}

/// Client handler for russh callbacks. Verifies server keys per policy.
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, policy: HostKeyPolicy) -> Self {
        Self { host, port, policy }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        get_known_hosts().check(self.policy, &self.host, self.port, server_public_key)?;
        Ok(true)
    }
}

/// Dial `remote` directly using its protocol, then handshake and authenticate
pub async fn connect(remote: &Remote, config: &ConnectionConfig) -> Result<SshHandle, SshError> {
    info!(
        "Connecting to SSH server at {} ({})",
        remote.address(),
        remote.protocol.as_str()
    );

    let dial = async {
        match remote.protocol {
            Protocol::Tcp => TcpStream::connect((remote.host.as_str(), remote.port))
                .await
                .map(Transport::Tcp),
            Protocol::Tcp4 | Protocol::Tcp6 => {
                let want_v4 = remote.protocol == Protocol::Tcp4;
                let addr = tokio::net::lookup_host((remote.host.as_str(), remote.port))
                    .await?
                    .find(|a: &SocketAddr| a.is_ipv4() == want_v4)
                    .ok_or_else(|| {
                        std::io::Error::new(
                            std::io::ErrorKind::AddrNotAvailable,
                            format!("no {} address for {}", remote.protocol.as_str(), remote.host),
                        )
                    })?;
                TcpStream::connect(addr).await.map(Transport::Tcp)
            }
            #[cfg(unix)]
            Protocol::Unix => tokio::net::UnixStream::connect(&remote.host)
                .await
                .map(Transport::Unix),
            #[cfg(not(unix))]
            Protocol::Unix => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "unix sockets are not supported on this platform",
            )),
        }
    };

    let transport = tokio::time::timeout(config.timeout, dial)
        .await
        .map_err(|_| SshError::Timeout(format!("Connection to {} timed out", remote.address())))?
        .map_err(|e| {
            SshError::ConnectionFailed(format!("Failed to dial {}: {}", remote.address(), e))
        })?;

    match transport {
        Transport::Tcp(stream) => {
            let _ = stream.set_nodelay(true);
            connect_stream(stream, remote, config).await
        }
        #[cfg(unix)]
        Transport::Unix(stream) => connect_stream(stream, remote, config).await,
    }
}

enum Transport {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

/// Handshake and authenticate over an already established stream.
///
/// Used for every hop after the first, where the stream is a
/// `direct-tcpip` channel of the previous hop.
pub async fn connect_stream<S>(
    stream: S,
    remote: &Remote,
    config: &ConnectionConfig,
) -> Result<SshHandle, SshError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let handler = ClientHandler::new(remote.host.clone(), remote.port, config.host_key_policy);

    let mut handle = tokio::time::timeout(
        config.timeout,
        client::connect_stream(ssh_config(), stream, handler),
    )
    .await
    .map_err(|_| SshError::Timeout(format!("Handshake with {} timed out", remote.address())))?
    .map_err(|e| match e {
        SshError::HostKeyRejected { .. } => e,
        other => SshError::ConnectionFailed(format!(
            "Handshake with {} failed: {}",
            remote.address(),
            other
        )),
    })?;

    debug!("SSH handshake completed with {}", remote.address());

    authenticate(&mut handle, config).await?;

    info!("SSH authentication successful for {}@{}", config.user, remote.address());
    Ok(handle)
}

/// Authenticate with the configured credentials.
///
/// Password auth falls back to keyboard-interactive, answering every prompt
/// with the same password.
pub async fn authenticate(handle: &mut SshHandle, config: &ConnectionConfig) -> Result<(), SshError> {
    let user = config.user.as_str();

    let success = match &config.credentials {
        Credentials::Password(password) => {
            let result = handle
                .authenticate_password(user, password.as_str())
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;
            if result.success() {
                true
            } else {
                debug!("Password auth rejected for {}, trying keyboard-interactive", user);
                keyboard_interactive(handle, user, password).await?
            }
        }
        Credentials::PublicKey(key) => {
            let hash_alg = handle
                .best_supported_rsa_hash()
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
                .flatten();
            handle
                .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key.clone(), hash_alg))
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
                .success()
        }
    };

    if !success {
        return Err(SshError::AuthenticationFailed(format!(
            "Authentication rejected by server for user {}",
            user
        )));
    }
    Ok(())
}

async fn keyboard_interactive(
    handle: &mut SshHandle,
    user: &str,
    password: &str,
) -> Result<bool, SshError> {
    let mut response = handle
        .authenticate_keyboard_interactive_start(user, None::<String>)
        .await
        .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;

    for _ in 0..MAX_KBI_ROUNDS {
        match response {
            KeyboardInteractiveAuthResponse::Success => return Ok(true),
            KeyboardInteractiveAuthResponse::Failure { .. } => return Ok(false),
            KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                debug!("Keyboard-interactive round with {} prompts", prompts.len());
                let answers = prompts.iter().map(|_| password.to_string()).collect();
                response = handle
                    .authenticate_keyboard_interactive_respond(answers)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;
            }
        }
    }

    warn!("Keyboard-interactive auth for {} did not settle", user);
    Ok(false)
}

/// Polite disconnect; errors are logged, not returned
pub async fn disconnect(handle: &SshHandle, label: &str) {
    if let Err(e) = handle
        .disconnect(russh::Disconnect::ByApplication, "", "en")
        .await
    {
        debug!("Disconnect from {} failed: {}", label, e);
    }
}
