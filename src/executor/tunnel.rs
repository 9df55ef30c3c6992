//! Tunnel-only mode: keep a chain and its local bridge up until interrupted

use tracing::{debug, info};

use super::Executor;
use crate::config::Remote;
use crate::ssh::SshError;

fn check_tunnel_remote(name: &str, remote: &Remote) -> Result<(), SshError> {
    if !remote.tun_local_bind {
        return Err(SshError::InvalidConfig(format!(
            "Remote {} without tun_local_bind option enabled",
            name
        )));
    }
    if !remote.has_chain() {
        return Err(SshError::InvalidConfig(format!(
            "Remote {} without tunnel chain",
            name
        )));
    }
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => debug!("Received SIGINT. Exiting"),
                    _ = term.recv() => debug!("Received SIGTERM. Exiting"),
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        debug!("Received Ctrl-C. Exiting");
    }
}

/// Build the chain and bridge of `remote`, then block until interrupted.
pub async fn run_tunnel(remote_name: &str, remote: Remote) -> Result<(), SshError> {
    check_tunnel_remote(remote_name, &remote)?;

    let target = remote.address();
    let mut executor = Executor::new(remote_name, remote);
    if let Err(e) = executor.build_chain().await {
        executor.close().await;
        return Err(e);
    }

    if let Some(addr) = executor.bridge_addr() {
        info!("Tunnel {} ready: {} -> {}", remote_name, addr, target);
    }

    shutdown_signal().await;
    executor.close().await;
    info!("Tunnel {} closed", remote_name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_tunnel_remote() {
        let mut remote = Remote::with_password("10.0.0.5", "u", "p");
        assert!(check_tunnel_remote("r", &remote).is_err());

        remote.tun_local_bind = true;
        let err = check_tunnel_remote("r", &remote).unwrap_err();
        assert!(err.to_string().contains("without tunnel chain"));

        let remote = remote.hop(Remote::with_password("jump", "u", "p"));
        assert!(check_tunnel_remote("r", &remote).is_ok());
    }

    #[tokio::test]
    async fn test_run_tunnel_rejects_without_bind() {
        let remote = Remote::with_password("10.0.0.5", "u", "p")
            .hop(Remote::with_password("jump", "u", "p"));
        let err = run_tunnel("r", remote).await.unwrap_err();
        assert!(err.to_string().contains("tun_local_bind"));
    }
}
