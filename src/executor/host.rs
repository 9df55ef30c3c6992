//! Host-local command runner
//!
//! Same environment and entrypoint contract as the remote runner, executed
//! as a local subprocess that inherits this process' environment.

use std::collections::HashMap;
use std::process::Stdio;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

use super::command::store_output;
use super::Executor;

/// Entrypoint used when neither the call nor the remote configures one
pub const DEFAULT_HOST_ENTRYPOINT: [&str; 2] = ["/bin/bash", "-c"];

/// Node label used when emitting host command output
const HOST_NODE: &str = "host";

/// Call entrypoint, else the configured one, else `/bin/bash -c`
pub fn host_entrypoint(call: &[String], configured: &[String]) -> Vec<String> {
    if !call.is_empty() {
        call.to_vec()
    } else if !configured.is_empty() {
        configured.to_vec()
    } else {
        DEFAULT_HOST_ENTRYPOINT.iter().map(|s| s.to_string()).collect()
    }
}

impl Executor {
    /// Run `command` locally and stream its output into the given sinks.
    ///
    /// A non-zero exit is returned as a value; failing to spawn is an error.
    pub async fn run_host_command_with_output<O, E>(
        &self,
        command: &str,
        envs: &HashMap<String, String>,
        stdout: &mut O,
        stderr: &mut E,
        entrypoint: &[String],
    ) -> std::io::Result<i32>
    where
        O: AsyncWrite + Unpin + Send,
        E: AsyncWrite + Unpin + Send,
    {
        let entrypoint = host_entrypoint(entrypoint, &self.remote.entrypoint);
        self.emitter
            .debug(&format!("   :house_with_garden: - entrypoint: {:?}", entrypoint));
        self.emitter
            .info(&format!("   :house_with_garden: - {}", command));

        let mut env: Vec<(&String, &String)> = envs.iter().collect();
        env.sort();

        let mut cmd = Command::new(&entrypoint[0]);
        cmd.args(&entrypoint[1..])
            .arg(command)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config_dir {
            cmd.env("SSHC_CONF", dir);
        }

        let mut child = cmd.spawn()?;
        let mut child_out = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("child stdout not captured"))?;
        let mut child_err = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("child stderr not captured"))?;

        let (out, err) = tokio::join!(
            tokio::io::copy(&mut child_out, stdout),
            tokio::io::copy(&mut child_err, stderr),
        );
        out?;
        err?;
        stdout.flush().await?;
        stderr.flush().await?;

        let status = child.wait().await?;
        debug!("Host command exited with {:?}", status);
        // Killed by a signal: no code
        Ok(status.code().unwrap_or(1))
    }

    pub async fn run_host_command(
        &self,
        command: &str,
        envs: &HashMap<String, String>,
        entrypoint: &[String],
    ) -> std::io::Result<i32> {
        let (code, out, err) = self.run_host_buffered(command, envs, entrypoint).await?;
        self.show_output(HOST_NODE, &out, &err);
        Ok(code)
    }

    /// Host variant of
    /// [`run_command_with_output_4var`](Self::run_command_with_output_4var)
    pub async fn run_host_command_with_output_4var(
        &self,
        command: &str,
        out_var: &str,
        err_var: &str,
        envs: &mut HashMap<String, String>,
        entrypoint: &[String],
    ) -> std::io::Result<i32> {
        let (code, out, err) = self.run_host_buffered(command, envs, entrypoint).await?;
        self.show_output(HOST_NODE, &out, &err);
        store_output(envs, out_var, out, err_var, err);
        Ok(code)
    }

    async fn run_host_buffered(
        &self,
        command: &str,
        envs: &HashMap<String, String>,
        entrypoint: &[String],
    ) -> std::io::Result<(i32, String, String)> {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let code = self
            .run_host_command_with_output(command, envs, &mut out, &mut err, entrypoint)
            .await?;
        Ok((
            code,
            String::from_utf8_lossy(&out).into_owned(),
            String::from_utf8_lossy(&err).into_owned(),
        ))
    }
}
