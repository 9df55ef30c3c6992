//! Standard command runner: one exec channel per command

use std::collections::HashMap;

use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::device::DeviceCommandOptions;
use super::{Executor, SessionStrategy};
use crate::ssh::SshError;

/// Version advertised to remote commands through `SSH_COMPOSE_VERSION`
pub const SSH_COMPOSE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment of a command in sorted key order, followed by the
/// `SSH_COMPOSE_PROJECT` / `SSH_COMPOSE_VERSION` metadata. Empty when
/// `envs` is empty.
pub fn command_env(envs: &HashMap<String, String>) -> Vec<(String, String)> {
    if envs.is_empty() {
        return Vec::new();
    }

    let mut sorted: Vec<(String, String)> = envs
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    sorted.sort();

    let project = sorted
        .iter()
        .map(|(k, v)| format!("\"{}\": \"{}\"", k, v))
        .collect::<Vec<_>>()
        .join(",");

    sorted.push(("SSH_COMPOSE_PROJECT".to_string(), project));
    sorted.push((
        "SSH_COMPOSE_VERSION".to_string(),
        SSH_COMPOSE_VERSION.to_string(),
    ));
    sorted
}

/// Single-quote `s` for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// `entrypoint` tokens followed by the quoted command, or the bare command
pub fn wrap_command(entrypoint: &[String], command: &str) -> String {
    if entrypoint.is_empty() {
        command.to_string()
    } else {
        format!("{} {}", entrypoint.join(" "), shell_quote(command))
    }
}

/// Exec `command` on `channel` with stdin closed, streaming its output.
///
/// Returns the exit status; a command killed by a signal or one that
/// reported no status counts as 1.
async fn exec_on_channel<O, E>(
    channel: &mut Channel<Msg>,
    command: &str,
    env: &[(String, String)],
    stdout: &mut O,
    stderr: &mut E,
) -> Result<i32, SshError>
where
    O: AsyncWrite + Unpin + Send,
    E: AsyncWrite + Unpin + Send,
{
    // Servers commonly refuse variables outside AcceptEnv
    for (key, value) in env {
        if let Err(e) = channel.set_env(false, key.as_str(), value.as_str()).await {
            debug!("Failed to set {}: {}", key, e);
        }
    }

    channel
        .exec(true, command)
        .await
        .map_err(|e| SshError::ChannelError(format!("Failed to exec command: {}", e)))?;
    channel
        .eof()
        .await
        .map_err(|e| SshError::ChannelError(format!("Failed to close stdin: {}", e)))?;

    let mut exit_code: Option<i32> = None;
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => stdout.write_all(&data).await?,
            Some(ChannelMsg::ExtendedData { data, ext: 1 }) => stderr.write_all(&data).await?,
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                exit_code = Some(exit_status as i32);
            }
            Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                debug!("Command terminated by signal {:?}", signal_name);
                exit_code = Some(1);
            }
            Some(ChannelMsg::Close) | None => break,
            _ => {}
        }
    }

    stdout.flush().await?;
    stderr.flush().await?;
    Ok(exit_code.unwrap_or(1))
}

impl Executor {
    /// Run `command` and stream its stdout/stderr into the given sinks.
    ///
    /// A command that ran returns its exit status, zero or not. Errors are
    /// reserved for transport failures.
    pub async fn run_command_with_output<O, E>(
        &mut self,
        node: &str,
        command: &str,
        envs: &HashMap<String, String>,
        stdout: &mut O,
        stderr: &mut E,
        entrypoint: &[String],
    ) -> Result<i32, SshError>
    where
        O: AsyncWrite + Unpin + Send,
        E: AsyncWrite + Unpin + Send,
    {
        if self.strategy == SessionStrategy::InteractiveTerminal {
            return self
                .run_command_on_device_with_options(
                    node,
                    command,
                    envs,
                    stdout,
                    stderr,
                    entrypoint,
                    &DeviceCommandOptions::default(),
                )
                .await;
        }

        if !entrypoint.is_empty() {
            self.emitter
                .debug(&format!(">>> [{}] - entrypoint: {:?}", node, entrypoint));
        }
        self.emitter
            .info(&format!(">>> [{}] - {} - :coffee:", node, command));

        let session_name = uuid::Uuid::new_v4().to_string();
        let env = command_env(envs);
        let wrapped = wrap_command(entrypoint, command);

        let result = self
            .exec_in_session(&session_name, &wrapped, &env, stdout, stderr)
            .await;

        self.remove_session(&session_name).await;

        match &result {
            Ok(code) => self
                .emitter
                .debug(&format!(">>> [{}] Exiting with {}", node, code)),
            Err(e) => self
                .emitter
                .info(&format!(">>> [{}] Execution Interrupted: {}", node, e)),
        }
        result
    }

    async fn exec_in_session<O, E>(
        &mut self,
        name: &str,
        command: &str,
        env: &[(String, String)],
        stdout: &mut O,
        stderr: &mut E,
    ) -> Result<i32, SshError>
    where
        O: AsyncWrite + Unpin + Send,
        E: AsyncWrite + Unpin + Send,
    {
        let session = self.get_session(name).await?;
        let channel = session
            .channel_mut()
            .ok_or_else(|| SshError::ChannelError(format!("{} is not an exec session", name)))?;
        exec_on_channel(channel, command, env, stdout, stderr).await
    }

    /// Run `command` with buffered output, emitting it when command output
    /// display is enabled
    pub async fn run_command(
        &mut self,
        node: &str,
        command: &str,
        envs: &HashMap<String, String>,
        entrypoint: &[String],
    ) -> Result<i32, SshError> {
        let (code, out, err) = self.run_buffered(node, command, envs, entrypoint).await?;
        self.show_output(node, &out, &err);
        Ok(code)
    }

    /// Like [`run_command`](Self::run_command), additionally storing stdout
    /// and stderr into `envs` under `out_var` / `err_var` (skipped when the
    /// name is empty)
    pub async fn run_command_with_output_4var(
        &mut self,
        node: &str,
        command: &str,
        out_var: &str,
        err_var: &str,
        envs: &mut HashMap<String, String>,
        entrypoint: &[String],
    ) -> Result<i32, SshError> {
        let (code, out, err) = self.run_buffered(node, command, envs, entrypoint).await?;
        self.show_output(node, &out, &err);
        store_output(envs, out_var, out, err_var, err);
        Ok(code)
    }

    async fn run_buffered(
        &mut self,
        node: &str,
        command: &str,
        envs: &HashMap<String, String>,
        entrypoint: &[String],
    ) -> Result<(i32, String, String), SshError> {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let code = self
            .run_command_with_output(node, command, envs, &mut out, &mut err, entrypoint)
            .await?;
        Ok((
            code,
            String::from_utf8_lossy(&out).into_owned(),
            String::from_utf8_lossy(&err).into_owned(),
        ))
    }

    pub(crate) fn show_output(&self, node: &str, out: &str, err: &str) {
        if !self.show_cmds_output {
            return;
        }
        if !out.is_empty() {
            self.emitter
                .info(&format!(">>> [{}] [stdout]\n{}", node, out));
        }
        if !err.is_empty() {
            self.emitter
                .info(&format!(">>> [{}] [stderr]\n{}", node, err));
        }
    }
}

pub(crate) fn store_output(
    envs: &mut HashMap<String, String>,
    out_var: &str,
    out: String,
    err_var: &str,
    err: String,
) {
    if !out_var.is_empty() {
        envs.insert(out_var.to_string(), out);
    }
    if !err_var.is_empty() {
        envs.insert(err_var.to_string(), err);
    }
}
