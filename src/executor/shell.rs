//! Interactive shell attached to the local terminal

use russh::{ChannelMsg, Pty};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::device::TTY_SPEED;
use super::Executor;
use crate::ssh::SshError;

/// Raw mode for the lifetime of the guard
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Result<Self, SshError> {
        crossterm::terminal::enable_raw_mode()
            .map_err(|e| SshError::ChannelError(format!("Failed to enable raw mode: {}", e)))?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = crossterm::terminal::disable_raw_mode() {
            warn!("Failed to restore terminal mode: {}", e);
        }
    }
}

/// Forward SIGWINCH as new terminal sizes until `cancel` fires.
///
/// SIGTERM and SIGHUP end the watcher and cancel the shell.
#[cfg(unix)]
async fn watch_resize(tx: mpsc::Sender<(u16, u16)>, cancel: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut winch, mut term, mut hup) = match (
        signal(SignalKind::window_change()),
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    ) {
        (Ok(winch), Ok(term), Ok(hup)) => (winch, term, hup),
        _ => {
            warn!("Failed to install signal handlers, window resize disabled");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = winch.recv() => {
                debug!("Received SIGWINCH, updating window geometry");
                match crossterm::terminal::size() {
                    Ok(size) => {
                        if tx.send(size).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!("Failed to read terminal size: {}", e),
                }
            }
            _ = term.recv() => {
                debug!("Received SIGTERM. Exiting");
                cancel.cancel();
                break;
            }
            _ = hup.recv() => {
                debug!("Received SIGHUP. Exiting");
                cancel.cancel();
                break;
            }
        }
    }
}

#[cfg(not(unix))]
async fn watch_resize(_tx: mpsc::Sender<(u16, u16)>, cancel: CancellationToken) {
    cancel.cancelled().await;
}

impl Executor {
    /// Attach the local terminal to a remote shell until it exits.
    ///
    /// Returns the shell's exit status (1 when none was reported).
    pub async fn run_shell(&mut self, name: &str, term: &str) -> Result<i32, SshError> {
        let (cols, rows) = crossterm::terminal::size().map_err(|e| {
            SshError::ChannelError(format!("Failed to retrieve terminal size: {}", e))
        })?;

        let session = self.get_session(name).await?;
        let mut channel = session.take_channel().ok_or_else(|| {
            SshError::ChannelError(format!("{} is not a shell session", name))
        })?;

        channel
            .request_pty(
                true,
                term,
                cols as u32,
                rows as u32,
                0,
                0,
                &[
                    (Pty::ECHO, 1),
                    (Pty::TTY_OP_ISPEED, TTY_SPEED),
                    (Pty::TTY_OP_OSPEED, TTY_SPEED),
                ],
            )
            .await
            .map_err(|e| SshError::ChannelError(format!("PTY request failed: {}", e)))?;
        channel
            .request_shell(true)
            .await
            .map_err(|e| SshError::ChannelError(format!("Shell request failed: {}", e)))?;
        info!("Interactive shell started on {} ({}x{})", self.endpoint, cols, rows);

        let cancel = self.cancel.child_token();
        let (resize_tx, mut resize_rx) = mpsc::channel::<(u16, u16)>(8);
        let watcher = tokio::spawn(watch_resize(resize_tx, cancel.clone()));

        let guard = RawModeGuard::enable()?;
        let mut stdin = tokio::io::stdin();
        let mut stdout = tokio::io::stdout();
        let mut stderr = tokio::io::stderr();
        let mut buf = [0u8; 1024];
        let mut stdin_open = true;
        let mut exit_code: Option<i32> = None;

        let result = async {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Shell on {} cancelled", self.endpoint);
                        break;
                    }
                    read = stdin.read(&mut buf), if stdin_open => {
                        match read? {
                            0 => {
                                stdin_open = false;
                                let _ = channel.eof().await;
                            }
                            n => channel.data(&buf[..n]).await.map_err(|e| {
                                SshError::ChannelError(format!("Failed to send input: {}", e))
                            })?,
                        }
                    }
                    Some((cols, rows)) = resize_rx.recv() => {
                        if let Err(e) = channel.window_change(cols as u32, rows as u32, 0, 0).await {
                            warn!("Failed to resize PTY: {}", e);
                        }
                    }
                    msg = channel.wait() => match msg {
                        Some(ChannelMsg::Data { data }) => {
                            stdout.write_all(&data).await?;
                            stdout.flush().await?;
                        }
                        Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                            stderr.write_all(&data).await?;
                            stderr.flush().await?;
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            exit_code = Some(exit_status as i32);
                        }
                        Some(ChannelMsg::Close) | None => break,
                        Some(_) => {}
                    },
                }
            }
            Ok::<(), SshError>(())
        }
        .await;

        drop(guard);
        cancel.cancel();
        if let Err(e) = watcher.await {
            debug!("Resize watcher ended abnormally: {}", e);
        }
        let _ = channel.close().await;
        self.remove_session(name).await;

        result?;
        info!("Interactive shell on {} ended", self.endpoint);
        Ok(exit_code.unwrap_or(1))
    }
}
