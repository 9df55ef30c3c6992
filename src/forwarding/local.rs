//! Local port forward bridge
//!
//! Exposes the final target of a tunnel chain on a local TCP listener.
//! Every accepted connection gets its own `direct-tcpip` stream through the
//! last hop and two copy halves (local -> remote, remote -> local).

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncWriteExt, split};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::ssh::{HopTransport, SshError};

/// Running bridge. Dropping it does not stop the accept loop; call
/// [`LocalBridge::stop`].
pub struct LocalBridge {
    bound_addr: SocketAddr,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl LocalBridge {
    /// Bind `bind_addr` and start accepting.
    ///
    /// `cancel` is the owner's token; the bridge stops when it fires.
    pub async fn start<D>(
        dialer: Arc<D>,
        bind_addr: &str,
        target_host: String,
        target_port: u16,
        cancel: CancellationToken,
    ) -> Result<Self, SshError>
    where
        D: HopTransport + 'static,
    {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| map_bind_error(bind_addr, e))?;

        let bound_addr = listener
            .local_addr()
            .map_err(|e| SshError::ConnectionFailed(format!("Failed to get bound address: {}", e)))?;

        info!(
            "Started local bridge: {} -> {}:{}",
            bound_addr, target_host, target_port
        );

        let tracker = TaskTracker::new();
        let target = Arc::new((target_host, target_port));

        let loop_cancel = cancel.clone();
        let loop_tracker = tracker.clone();
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => {
                        debug!("Local bridge on {} cancelled", bound_addr);
                        break;
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                if let Err(e) = stream.set_nodelay(true) {
                                    warn!("Failed to set TCP_NODELAY: {}", e);
                                }
                                debug!("Accepted bridge connection from {}", peer);

                                let dialer = dialer.clone();
                                let target = target.clone();
                                let cancel = loop_cancel.clone();
                                loop_tracker.spawn(async move {
                                    if let Err(e) =
                                        handle_bridge_connection(dialer.as_ref(), stream, &target.0, target.1, cancel).await
                                    {
                                        warn!("Bridge connection from {} failed: {}", peer, e);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Accept error on {}: {}", bound_addr, e);
                            }
                        }
                    }
                }
            }
            info!("Local bridge on {} exited", bound_addr);
        });

        Ok(Self {
            bound_addr,
            cancel,
            tracker,
        })
    }

    /// Actual bound address (resolves port 0)
    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    /// Stop accepting and wait for in-flight connections to drain
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        debug!("Local bridge on {} drained", self.bound_addr);
    }
}

fn map_bind_error(addr: &str, e: std::io::Error) -> SshError {
    match e.kind() {
        std::io::ErrorKind::AddrInUse => SshError::ConnectionFailed(format!(
            "Port already in use: {}. Another application may be using this port.",
            addr
        )),
        std::io::ErrorKind::PermissionDenied => SshError::ConnectionFailed(format!(
            "Permission denied binding to {}. Ports below 1024 require elevated privileges.",
            addr
        )),
        std::io::ErrorKind::AddrNotAvailable => SshError::ConnectionFailed(format!(
            "Address not available: {}. The specified address is not valid on this system.",
            addr
        )),
        _ => SshError::ConnectionFailed(format!("Failed to bind to {}: {}", addr, e)),
    }
}

async fn handle_bridge_connection<D: HopTransport>(
    dialer: &D,
    local: TcpStream,
    host: &str,
    port: u16,
    cancel: CancellationToken,
) -> Result<(), SshError> {
    let remote = dialer.open_tunnel(host, port).await?;
    debug!("Opened tunnel stream to {}:{}", host, port);

    let (mut local_read, mut local_write) = local.into_split();
    let (mut remote_read, mut remote_write) = split(remote);

    // Each half shuts down the write side of its peer once its source ends
    let upstream = async {
        let copied = tokio::io::copy(&mut local_read, &mut remote_write).await;
        let _ = remote_write.shutdown().await;
        copied
    };
    let downstream = async {
        let copied = tokio::io::copy(&mut remote_read, &mut local_write).await;
        let _ = local_write.shutdown().await;
        copied
    };

    tokio::select! {
        _ = cancel.cancelled() => {
            debug!("Bridge connection to {}:{} cancelled", host, port);
        }
        (up, down) = async { tokio::join!(upstream, downstream) } => {
            debug!(
                "Bridge connection to {}:{} finished (sent: {:?}, received: {:?})",
                host, port, up, down
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    /// Dials plain TCP in place of a direct-tcpip channel
    struct TcpDialer;

    #[async_trait]
    impl HopTransport for TcpDialer {
        type Stream = TcpStream;

        async fn open_tunnel(&self, host: &str, port: u16) -> Result<TcpStream, SshError> {
            Ok(TcpStream::connect((host, port)).await?)
        }

        async fn close(&self) {}
    }

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_bridge_round_trip() {
        let echo = echo_server().await;
        let bridge = LocalBridge::start(
            Arc::new(TcpDialer),
            "127.0.0.1:0",
            echo.ip().to_string(),
            echo.port(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let mut client = TcpStream::connect(bridge.bound_addr()).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        // Half close propagates through the bridge back to us
        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        tokio::time::timeout(Duration::from_secs(5), bridge.stop())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_drains_idle_connections() {
        let echo = echo_server().await;
        let bridge = LocalBridge::start(
            Arc::new(TcpDialer),
            "127.0.0.1:0",
            echo.ip().to_string(),
            echo.port(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        // Held open and idle while the bridge shuts down
        let mut client = TcpStream::connect(bridge.bound_addr()).await.unwrap();
        client.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        client.read_exact(&mut buf).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), bridge.stop())
            .await
            .unwrap();
        assert!(TcpStream::connect(bridge.bound_addr()).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_in_use() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();

        let result = LocalBridge::start(
            Arc::new(TcpDialer),
            &addr,
            "127.0.0.1".into(),
            1,
            CancellationToken::new(),
        )
        .await;

        match result {
            Err(SshError::ConnectionFailed(msg)) => assert!(msg.contains("Port already in use")),
            _ => panic!("Expected bind failure"),
        }
    }
}
