//! Executor: one physical connection to a named endpoint
//!
//! An executor owns the connection (direct or through a tunnel chain), the
//! optional local bridge, the lazily opened SFTP client and the registry of
//! named sessions multiplexed over the connection. Everything it owns is
//! released by [`Executor::close`], which is safe to call after a partial
//! setup failure and more than once.

pub mod command;
pub mod device;
pub mod host;
pub mod shell;
pub mod tunnel;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use russh::client::Msg;
use russh::Channel;
use russh_sftp::client::SftpSession;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Remote;
use crate::emitter::{SharedEmitter, TracingEmitter};
use crate::forwarding::LocalBridge;
use crate::sftp::SftpError;
use crate::ssh::{
    client, ConnectionConfig, HopTransport, LogicalSession, Session, SessionRegistry,
    SshError, SshHandle, SshHopConnector, TunnelChain,
};

pub use device::{DeviceCommandOptions, DeviceSettings, DeviceState};

/// How commands reach the endpoint. Chosen once from the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStrategy {
    /// One exec channel per command
    Standard,
    /// A single shared PTY shell driven by prompt detection
    InteractiveTerminal,
}

impl SessionStrategy {
    pub fn for_remote(remote: &Remote) -> Self {
        if remote.device {
            SessionStrategy::InteractiveTerminal
        } else {
            SessionStrategy::Standard
        }
    }
}

pub struct Executor {
    endpoint: String,
    remote: Remote,
    strategy: SessionStrategy,
    emitter: SharedEmitter,
    show_cmds_output: bool,
    config_dir: Option<PathBuf>,

    cancel: CancellationToken,
    conn: Option<Arc<SshHandle>>,
    chain: TunnelChain<Arc<SshHandle>>,
    bridge: Option<LocalBridge>,
    sftp: Option<SftpSession>,
    sessions: SessionRegistry<Session>,
}

impl Executor {
    pub fn new(endpoint: impl Into<String>, remote: Remote) -> Self {
        let strategy = SessionStrategy::for_remote(&remote);
        Self {
            endpoint: endpoint.into(),
            strategy,
            sessions: SessionRegistry::new(strategy == SessionStrategy::InteractiveTerminal),
            remote,
            emitter: Arc::new(TracingEmitter),
            show_cmds_output: false,
            config_dir: None,
            cancel: CancellationToken::new(),
            conn: None,
            chain: TunnelChain::new(),
            bridge: None,
            sftp: None,
        }
    }

    pub fn with_emitter(mut self, emitter: SharedEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    /// Emit the output of `run_command` calls
    pub fn with_show_cmds_output(mut self, show: bool) -> Self {
        self.show_cmds_output = show;
        self
    }

    /// Directory exported as `SSHC_CONF` to host commands
    pub fn with_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn remote(&self) -> &Remote {
        &self.remote
    }

    pub fn strategy(&self) -> SessionStrategy {
        self.strategy
    }

    pub fn emitter(&self) -> &SharedEmitter {
        &self.emitter
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Bound address of the local bridge, if one is running
    pub fn bridge_addr(&self) -> Option<SocketAddr> {
        self.bridge.as_ref().map(LocalBridge::bound_addr)
    }

    /// Connect to the endpoint. No-op when already connected.
    ///
    /// Credentials of the target and of every hop are checked before any
    /// socket is opened. On failure, call [`close`](Self::close) to release
    /// hops established so far.
    pub async fn setup(&mut self) -> Result<(), SshError> {
        if self.conn.is_some() {
            return Ok(());
        }
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }

        let config = ConnectionConfig::from_remote(&self.remote)?;
        for hop in &self.remote.chain {
            ConnectionConfig::from_remote(hop)?;
        }

        let handle = if self.remote.has_chain() {
            let tunnel = self.build_chain().await?;
            match self.bridge_addr() {
                Some(addr) => {
                    let addr = dialable(addr);
                    debug!("Connecting to {} through local bridge {}", self.remote.address(), addr);
                    let stream = TcpStream::connect(addr).await.map_err(|e| {
                        SshError::ConnectionFailed(format!(
                            "Failed to connect to local bridge {}: {}",
                            addr, e
                        ))
                    })?;
                    let _ = stream.set_nodelay(true);
                    client::connect_stream(stream, &self.remote, &config).await?
                }
                None => {
                    let stream = tunnel
                        .open_tunnel(&self.remote.host, self.remote.port)
                        .await?;
                    client::connect_stream(stream, &self.remote, &config).await?
                }
            }
        } else {
            client::connect(&self.remote, &config).await?
        };

        info!("Executor {} connected to {}", self.endpoint, self.remote.address());
        self.conn = Some(Arc::new(handle));
        Ok(())
    }

    /// Establish the tunnel chain and, when requested, the local bridge.
    ///
    /// Returns the last hop's connection, through which the target is
    /// reachable. Calling it again reuses what is already established.
    pub async fn build_chain(&mut self) -> Result<Arc<SshHandle>, SshError> {
        if !self.remote.has_chain() {
            return Err(SshError::InvalidConfig(format!(
                "Remote {} has no tunnel chain",
                self.endpoint
            )));
        }

        if self.chain.is_empty() {
            self.chain.extend(&SshHopConnector, &self.remote.chain).await?;
        }
        let tunnel = self.chain.last().cloned().ok_or(SshError::NotConnected)?;

        if self.remote.tun_local_bind && self.bridge.is_none() {
            let bridge = LocalBridge::start(
                Arc::new(tunnel.clone()),
                &self.remote.local_bind_address(),
                self.remote.host.clone(),
                self.remote.port,
                self.cancel.child_token(),
            )
            .await?;
            self.bridge = Some(bridge);
        }

        Ok(tunnel)
    }

    /// Release everything: sessions, SFTP, the connection, hops (last
    /// first) and finally the bridge, waiting for bridged connections.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        self.sessions.close_all().await;

        if let Some(sftp) = self.sftp.take() {
            if let Err(e) = sftp.close().await {
                debug!("Closing SFTP client of {} failed: {}", self.endpoint, e);
            }
        }
        if let Some(conn) = self.conn.take() {
            client::disconnect(&conn, &self.endpoint).await;
        }
        self.chain.close().await;
        if let Some(bridge) = self.bridge.take() {
            bridge.stop().await;
        }
        debug!("Executor {} closed", self.endpoint);
    }

    /// Open the SFTP subsystem once per connection
    pub async fn setup_sftp(&mut self) -> Result<(), SftpError> {
        if self.sftp.is_some() {
            return Ok(());
        }

        let channel = self.open_channel().await?;
        channel.request_subsystem(true, "sftp").await.map_err(|e| {
            SftpError::SubsystemNotAvailable(format!("Failed to request SFTP subsystem: {}", e))
        })?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SftpError::SubsystemNotAvailable(e.to_string()))?;

        debug!("SFTP client ready for {}", self.endpoint);
        self.sftp = Some(sftp);
        Ok(())
    }

    pub fn sftp(&self) -> Option<&SftpSession> {
        self.sftp.as_ref()
    }

    /// New session channel on the physical connection
    pub(crate) async fn open_channel(&self) -> Result<Channel<Msg>, SshError> {
        let conn = self.conn.as_ref().ok_or(SshError::NotConnected)?;
        conn.channel_open_session()
            .await
            .map_err(|e| SshError::ChannelError(format!("Failed to open session: {}", e)))
    }

    /// Session registered as `name`, opened on first use
    pub async fn get_session(&mut self, name: &str) -> Result<&mut Session, SshError> {
        if !self.sessions.contains(name) {
            self.sessions.ensure_capacity(name)?;
            let channel = self.open_channel().await?;
            self.sessions.insert(Session::new(name, channel))?;
        }
        self.sessions
            .get_mut(name)
            .ok_or_else(|| SshError::SessionNotFound(name.to_string()))
    }

    /// Close and forget a session. Unknown names are not an error.
    pub async fn remove_session(&mut self, name: &str) {
        if !self.sessions.remove(name).await {
            debug!("Session {} not registered on {}", name, self.endpoint);
        }
    }

    /// Replace a session with a fresh one, keeping its attached stdio
    pub async fn reset_session(&mut self, name: &str) -> Result<&mut Session, SshError> {
        let io = match self.sessions.take(name) {
            Some(mut old) => {
                let io = old.take_io();
                old.close().await;
                io
            }
            None => Default::default(),
        };

        let channel = self.open_channel().await?;
        let mut session = Session::new(name, channel);
        session.attach_io(io);
        self.sessions.insert(session)
    }
}

/// Loopback in place of an unspecified bind address
fn dialable(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}
