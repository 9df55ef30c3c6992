//! Tunnel chain (multi-hop jump hosts)
//!
//! Hop 0 is dialed directly. Every following hop is reached through a
//! `direct-tcpip` channel opened on the previous hop, with a fresh SSH
//! handshake running over that channel stream:
//!
//! ```text
//! local ──tcp──▶ hop0 ──direct-tcpip──▶ hop1 ──direct-tcpip──▶ target
//! ```
//!
//! Hops are pushed onto the chain as soon as they are established, so a
//! chain that failed half way still owns (and closes) what it opened.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use super::auth::ConnectionConfig;
use super::client::{self, SshHandle};
use super::error::SshError;
use crate::config::Remote;

/// An established hop able to tunnel TCP to a further address
#[async_trait]
pub trait HopTransport: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a `direct-tcpip` stream to host:port through this hop
    async fn open_tunnel(&self, host: &str, port: u16) -> Result<Self::Stream, SshError>;

    async fn close(&self);
}

/// Establishes hops, directly or through a previous hop
#[async_trait]
pub trait HopConnector: Send + Sync {
    type Transport: HopTransport;

    async fn connect_direct(&self, hop: &Remote) -> Result<Self::Transport, SshError>;

    async fn connect_via(
        &self,
        previous: &Self::Transport,
        hop: &Remote,
    ) -> Result<Self::Transport, SshError>;
}

#[async_trait]
impl HopTransport for Arc<SshHandle> {
    type Stream = russh::ChannelStream<russh::client::Msg>;

    async fn open_tunnel(&self, host: &str, port: u16) -> Result<Self::Stream, SshError> {
        let channel = self
            .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| {
                SshError::ChannelError(format!(
                    "Failed to open direct-tcpip to {}:{}: {}",
                    host, port, e
                ))
            })?;
        Ok(channel.into_stream())
    }

    async fn close(&self) {
        client::disconnect(self, "tunnel hop").await;
    }
}

/// Connects hops with russh
#[derive(Debug, Default, Clone, Copy)]
pub struct SshHopConnector;

#[async_trait]
impl HopConnector for SshHopConnector {
    type Transport = Arc<SshHandle>;

    async fn connect_direct(&self, hop: &Remote) -> Result<Self::Transport, SshError> {
        let config = ConnectionConfig::from_remote(hop)?;
        Ok(Arc::new(client::connect(hop, &config).await?))
    }

    async fn connect_via(
        &self,
        previous: &Self::Transport,
        hop: &Remote,
    ) -> Result<Self::Transport, SshError> {
        let config = ConnectionConfig::from_remote(hop)?;
        let stream = previous.open_tunnel(&hop.host, hop.port).await?;
        Ok(Arc::new(client::connect_stream(stream, hop, &config).await?))
    }
}

/// Established hops, in dial order
pub struct TunnelChain<T> {
    hops: Vec<(String, T)>,
}

impl<T> Default for TunnelChain<T> {
    fn default() -> Self {
        Self { hops: Vec::new() }
    }
}

impl<T: HopTransport> TunnelChain<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Establish `hops` in order, appending each to the chain.
    ///
    /// Stops at the first failure. Hops established before it stay in the
    /// chain until [`close`](Self::close).
    pub async fn extend<C>(&mut self, connector: &C, hops: &[Remote]) -> Result<(), SshError>
    where
        C: HopConnector<Transport = T>,
    {
        for hop in hops {
            let index = self.hops.len();
            debug!("Establishing hop {}: {}", index, hop.address());

            let transport = match self.hops.last() {
                None => connector.connect_direct(hop).await,
                Some((_, previous)) => connector.connect_via(previous, hop).await,
            }
            .map_err(|e| match e {
                SshError::ConnectionFailed(msg) => {
                    SshError::ConnectionFailed(format!("hop {} ({}): {}", index, hop.address(), msg))
                }
                other => other,
            })?;

            info!("Hop {} established: {}", index, hop.address());
            self.hops.push((hop.address(), transport));
        }
        Ok(())
    }

    /// Last established hop, used to reach the final target
    pub fn last(&self) -> Option<&T> {
        self.hops.last().map(|(_, t)| t)
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// Disconnect every hop, last first. Safe to call repeatedly.
    pub async fn close(&mut self) {
        while let Some((address, transport)) = self.hops.pop() {
            debug!("Closing hop {}: {}", self.hops.len(), address);
            transport.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    struct MockHop {
        name: String,
        log: Log,
    }

    #[async_trait]
    impl HopTransport for MockHop {
        type Stream = tokio::io::DuplexStream;

        async fn open_tunnel(&self, host: &str, port: u16) -> Result<Self::Stream, SshError> {
            self.log
                .lock()
                .push(format!("tunnel {} -> {}:{}", self.name, host, port));
            let (a, _b) = tokio::io::duplex(64);
            Ok(a)
        }

        async fn close(&self) {
            self.log.lock().push(format!("close {}", self.name));
        }
    }

    struct MockConnector {
        log: Log,
        fail_on: Option<&'static str>,
    }

    impl MockConnector {
        fn hop(&self, hop: &Remote) -> Result<MockHop, SshError> {
            if self.fail_on == Some(hop.host.as_str()) {
                return Err(SshError::ConnectionFailed("refused".into()));
            }
            Ok(MockHop {
                name: hop.host.clone(),
                log: self.log.clone(),
            })
        }
    }

    #[async_trait]
    impl HopConnector for MockConnector {
        type Transport = MockHop;

        async fn connect_direct(&self, hop: &Remote) -> Result<MockHop, SshError> {
            self.log.lock().push(format!("dial {}", hop.host));
            self.hop(hop)
        }

        async fn connect_via(&self, previous: &MockHop, hop: &Remote) -> Result<MockHop, SshError> {
            previous.open_tunnel(&hop.host, hop.port).await?;
            self.hop(hop)
        }
    }

    fn hops() -> Vec<Remote> {
        vec![
            Remote::with_password("jump1", "u", "p"),
            Remote::with_password("jump2", "u", "p").port(2222),
            Remote::with_password("jump3", "u", "p"),
        ]
    }

    #[tokio::test]
    async fn test_hops_connect_in_order_and_close_in_reverse() {
        let log: Log = Arc::default();
        let connector = MockConnector {
            log: log.clone(),
            fail_on: None,
        };

        let mut chain = TunnelChain::new();
        chain.extend(&connector, &hops()).await.unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.last().unwrap().name, "jump3");

        chain.close().await;
        chain.close().await;
        assert!(chain.is_empty());

        assert_eq!(
            *log.lock(),
            vec![
                "dial jump1",
                "tunnel jump1 -> jump2:2222",
                "tunnel jump2 -> jump3:22",
                "close jump3",
                "close jump2",
                "close jump1",
            ]
        );
    }

    #[tokio::test]
    async fn test_partial_chain_is_kept_for_close() {
        let log: Log = Arc::default();
        let connector = MockConnector {
            log: log.clone(),
            fail_on: Some("jump3"),
        };

        let mut chain = TunnelChain::new();
        let err = chain.extend(&connector, &hops()).await.unwrap_err();
        assert!(err.to_string().contains("hop 2"));
        assert_eq!(chain.len(), 2);

        chain.close().await;
        let log = log.lock();
        assert_eq!(&log[log.len() - 2..], &["close jump2", "close jump1"]);
    }
}
