//! Interactive terminal driver for line-oriented devices
//!
//! Network switches and firewalls often refuse exec channels and offer a
//! single PTY shell instead. Commands are written to the shell and their
//! output is read until the learned prompt shows up again (or a deadline
//! passes). Exit status is not observable and always reported as 0.
//!
//! ```text
//! Unopened ─▶ PromptLearned ─▶ [EnaRequested ─▶ Escalated] ─▶ Executing ─▶ Idle
//! ```

use std::collections::HashMap;
use std::time::Duration;

use russh::client::Msg;
use russh::{Channel, Pty};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, sleep_until, timeout_at, Instant};
use tracing::debug;

use super::Executor;
use crate::config::DeviceOptions;
use crate::emitter::{Emitter, EventLevel, ExecutorEvent};
use crate::ssh::session::{BoxedReader, BoxedWriter};
use crate::ssh::{Session, SshError};

pub const DEFAULT_TERM_HEIGHT: u32 = 200;
pub const DEFAULT_TERM_WIDTH: u32 = 80;
pub const DEFAULT_DEADLINE_SECS: u64 = 3;
pub const DEFAULT_WAIT_MS: u64 = 80;
pub const DEFAULT_SETTLE_MS: u64 = 1000;

/// Size of the single read the prompt is learned from
const PROMPT_READ_SIZE: usize = 80;
const READ_CHUNK: usize = 4096;
pub(crate) const TTY_SPEED: u32 = 14400;

/// Responses to the escalation password that mean it was refused
const ENA_FAILURE_MARKERS: [&str; 3] = ["Invalid password", "Access denied", "Bad secrets"];

/// Driver state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Unopened,
    PromptLearned,
    EnaRequested,
    Escalated,
    Executing,
    Idle,
}

/// Timing and terminal knobs, resolved from remote options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSettings {
    pub term_height: u32,
    pub term_width: u32,
    pub deadline: Duration,
    pub wait: Duration,
    pub banner_lines: usize,
    pub settle: Duration,
    pub redisplay_prompt: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            term_height: DEFAULT_TERM_HEIGHT,
            term_width: DEFAULT_TERM_WIDTH,
            deadline: Duration::from_secs(DEFAULT_DEADLINE_SECS),
            wait: Duration::from_millis(DEFAULT_WAIT_MS),
            banner_lines: 0,
            settle: Duration::from_millis(DEFAULT_SETTLE_MS),
            redisplay_prompt: true,
        }
    }
}

impl DeviceSettings {
    /// Zero values in the remote options mean "use the default"
    pub fn from_options(options: &DeviceOptions) -> Self {
        let defaults = Self::default();
        Self {
            term_height: options
                .term_height
                .filter(|v| *v > 0)
                .unwrap_or(defaults.term_height),
            term_width: options
                .term_width
                .filter(|v| *v > 0)
                .unwrap_or(defaults.term_width),
            deadline: options
                .deadline_secs
                .filter(|v| *v > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.deadline),
            wait: options
                .wait_ms
                .filter(|v| *v > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.wait),
            banner_lines: options.banner_lines.unwrap_or(0),
            settle: options
                .settle_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.settle),
            redisplay_prompt: options.redisplay_prompt.unwrap_or(true),
        }
    }

    /// Apply per-call overrides. The larger deadline wins.
    pub fn with_call_options(mut self, options: &DeviceCommandOptions) -> Self {
        if let Some(secs) = options.deadline_secs {
            self.deadline = self.deadline.max(Duration::from_secs(secs));
        }
        if let Some(ms) = options.wait_ms.filter(|v| *v > 0) {
            self.wait = Duration::from_millis(ms);
        }
        self
    }
}

/// Per-invocation device options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceCommandOptions {
    /// Enter privileged mode before running the command
    pub with_ena: bool,
    pub deadline_secs: Option<u64>,
    pub wait_ms: Option<u64>,
}

impl DeviceCommandOptions {
    pub fn with_ena() -> Self {
        Self {
            with_ena: true,
            ..Default::default()
        }
    }
}

/// Driver over the two halves of a shell stream
pub struct DeviceDriver<R, W> {
    reader: R,
    writer: W,
    /// Bytes read but not consumed yet
    pending: Vec<u8>,
    state: DeviceState,
    prompt: String,
    ena_prompt: String,
    in_ena: bool,
}

/// Driver over a type-erased shell stream, as held by device sessions
pub type BoxedDevice = DeviceDriver<BoxedReader, BoxedWriter>;

impl<R, W> DeviceDriver<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            pending: Vec::new(),
            state: DeviceState::Unopened,
            prompt: String::new(),
            ena_prompt: String::new(),
            in_ena: false,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn ena_prompt(&self) -> &str {
        &self.ena_prompt
    }

    pub fn in_ena(&self) -> bool {
        self.in_ena
    }

    /// Prompt that currently ends command output
    pub fn active_prompt(&self) -> &str {
        if self.in_ena {
            &self.ena_prompt
        } else {
            &self.prompt
        }
    }

    /// Read one chunk into `pending`. Returns the byte count, 0 on EOF.
    async fn fill(&mut self, deadline: Instant) -> Result<Option<usize>, SshError> {
        let mut buf = [0u8; READ_CHUNK];
        match timeout_at(deadline, self.reader.read(&mut buf)).await {
            Ok(Ok(n)) => {
                self.pending.extend_from_slice(&buf[..n]);
                Ok(Some(n))
            }
            Ok(Err(e)) => Err(SshError::IoError(e)),
            Err(_) => Ok(None),
        }
    }

    async fn write_str(&mut self, data: &str) -> Result<(), SshError> {
        self.writer.write_all(data.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Take one complete line (with its `\n`) out of `pending`
    fn take_line(&mut self) -> Option<Vec<u8>> {
        let end = self.pending.iter().position(|b| *b == b'\n')?;
        Some(self.pending.drain(..=end).collect())
    }

    /// Wait for the shell to settle, skip the banner and learn the prompt
    pub async fn learn_prompt(&mut self, settings: &DeviceSettings) -> Result<&str, SshError> {
        sleep(settings.settle).await;
        let deadline = Instant::now() + settings.deadline;

        let mut banner = Vec::new();
        for _ in 0..settings.banner_lines {
            loop {
                if let Some(line) = self.take_line() {
                    banner.extend_from_slice(&line);
                    break;
                }
                match self.fill(deadline).await? {
                    Some(0) => {
                        return Err(SshError::ChannelError(
                            "shell closed while reading banner".to_string(),
                        ))
                    }
                    Some(_) => {}
                    None => {
                        return Err(SshError::Timeout("waiting for device banner".to_string()))
                    }
                }
            }
        }
        if !banner.is_empty() {
            debug!("Skipped banner:\n{}---", String::from_utf8_lossy(&banner));
        }

        if self.pending.is_empty() {
            match self.fill(deadline).await? {
                Some(0) => {
                    return Err(SshError::ChannelError(
                        "shell closed before prompt".to_string(),
                    ))
                }
                Some(_) => {}
                None => return Err(SshError::Timeout("waiting for device prompt".to_string())),
            }
        }

        let take = self.pending.len().min(PROMPT_READ_SIZE);
        let raw: Vec<u8> = self.pending.drain(..take).collect();
        let raw = raw
            .strip_prefix(b"\r\n")
            .or_else(|| raw.strip_prefix(b"\r"))
            .unwrap_or(&raw[..]);

        self.prompt = String::from_utf8_lossy(raw).into_owned();
        self.state = DeviceState::PromptLearned;
        debug!("Learned device prompt '{}'", self.prompt);
        Ok(&self.prompt)
    }

    /// Read until `done` holds for everything read so far or the deadline
    /// passes. Consumes what it read.
    async fn read_until<F>(&mut self, deadline: Instant, done: F) -> Result<String, SshError>
    where
        F: Fn(&str) -> bool,
    {
        loop {
            if done(&String::from_utf8_lossy(&self.pending)) {
                break;
            }
            match self.fill(deadline).await? {
                Some(0) | None => break,
                Some(_) => {}
            }
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Ok(text)
    }

    /// Enter privileged mode with `password`
    pub async fn escalate(
        &mut self,
        password: &str,
        settings: &DeviceSettings,
    ) -> Result<&str, SshError> {
        self.state = DeviceState::EnaRequested;
        self.drain_stale(settings.wait).await?;

        self.write_str("ena\r\n").await?;
        let deadline = Instant::now() + settings.deadline;
        let challenge = self
            .read_until(deadline, |text| text.contains("Password:"))
            .await?;
        if !challenge.contains("Password:") {
            self.state = DeviceState::PromptLearned;
            return Err(SshError::EnaHandshake(format!(
                "received invalid response for ena command: {:?}",
                challenge
            )));
        }

        self.write_str(&format!("{}\r", password)).await?;
        let deadline = Instant::now() + settings.deadline;
        let response = self
            .read_until(deadline, |text| {
                ENA_FAILURE_MARKERS.iter().any(|m| text.contains(m))
                    || !trailing_prompt(text).is_empty()
            })
            .await?;

        if ENA_FAILURE_MARKERS.iter().any(|m| response.contains(m)) {
            self.state = DeviceState::PromptLearned;
            return Err(SshError::InvalidEnaCredential);
        }

        let prompt = trailing_prompt(&response);
        if prompt.is_empty() {
            self.state = DeviceState::PromptLearned;
            return Err(SshError::EnaHandshake(format!(
                "no privileged prompt after password: {:?}",
                response
            )));
        }

        self.ena_prompt = prompt.to_string();
        self.in_ena = true;
        self.state = DeviceState::Escalated;
        debug!("Learned privileged prompt '{}'", self.ena_prompt);
        Ok(&self.ena_prompt)
    }

    /// Discard output left over from a previous exchange (redisplayed
    /// prompts, late echoes). Spends at most `window`, even on a device
    /// that never stops printing.
    async fn drain_stale(&mut self, window: Duration) -> Result<(), SshError> {
        let until = Instant::now() + window;
        while let Some(n) = self.fill(until).await? {
            self.pending.clear();
            if n == 0 {
                break;
            }
        }
        self.pending.clear();
        Ok(())
    }

    /// Run `command` and return its output without the echoed command line
    /// and without the closing prompt.
    ///
    /// Returns within `deadline + 2 * wait` even if the prompt never shows
    /// up; whatever arrived by then is the output. Only the first non-blank
    /// line is checked for the echoed command.
    pub async fn execute(
        &mut self,
        command: &str,
        settings: &DeviceSettings,
    ) -> Result<Vec<u8>, SshError> {
        self.drain_stale(settings.wait).await?;
        self.state = DeviceState::Executing;

        let newline = if settings.redisplay_prompt { "\r\n\n" } else { "\r\n" };
        self.write_str(&format!("{}{}", command, newline)).await?;

        let prompt = self.active_prompt().to_string();
        let echo_with_prompt = format!("{}{}", prompt, command);
        let deadline = Instant::now() + settings.deadline;
        let mut output = Vec::new();
        let mut first_line = true;
        let mut seen_prompt = false;

        'read: loop {
            while let Some(line) = self.take_line() {
                let text = String::from_utf8_lossy(&line);
                let trimmed = text.trim();
                if first_line && !trimmed.is_empty() {
                    first_line = false;
                    if trimmed.starts_with(command) || trimmed.starts_with(&echo_with_prompt) {
                        continue;
                    }
                }
                if is_prompt_line(&text, &prompt) {
                    seen_prompt = true;
                    break 'read;
                }
                output.extend_from_slice(&line);
            }

            // Prompts usually arrive without a trailing newline
            if is_prompt_line(&String::from_utf8_lossy(&self.pending), &prompt) {
                seen_prompt = true;
                break;
            }

            if Instant::now() >= deadline {
                break;
            }
            match self.fill(deadline).await? {
                Some(0) => {
                    debug!("Shell closed while waiting for prompt");
                    break;
                }
                None => break,
                Some(_) => {}
            }
            sleep_until((Instant::now() + settings.wait).min(deadline)).await;
        }

        if seen_prompt {
            self.pending.clear();
        } else {
            debug!("Prompt '{}' not seen before deadline", prompt);
            output.append(&mut self.pending);
        }

        self.state = DeviceState::Idle;
        Ok(output)
    }

    /// Close the write side, ending the shell
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.writer.shutdown().await {
            debug!("Device shell shutdown failed: {}", e);
        }
        self.state = DeviceState::Unopened;
    }
}

fn is_prompt_line(line: &str, prompt: &str) -> bool {
    if prompt.is_empty() {
        return false;
    }
    line.starts_with(prompt) || line.strip_prefix('\r').is_some_and(|l| l.starts_with(prompt))
}

/// Last non-empty line of a response with echo stars and CRs removed
fn trailing_prompt(text: &str) -> &str {
    text.lines()
        .map(|l| l.trim_matches(|c: char| c == '\r' || c == '*' || c.is_whitespace()))
        .rev()
        .find(|l| !l.is_empty())
        .unwrap_or("")
}

/// Open a PTY shell on `channel`
pub async fn open_device(
    channel: Channel<Msg>,
    settings: &DeviceSettings,
) -> Result<BoxedDevice, SshError> {
    let term = std::env::var("TERM")
        .ok()
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "linux".to_string());

    debug!(
        "Using term {} size {}x{} with deadline {:?}, wait {:?}",
        term, settings.term_height, settings.term_width, settings.deadline, settings.wait
    );

    channel
        .request_pty(
            false,
            &term,
            settings.term_width,
            settings.term_height,
            0,
            0,
            &[
                (Pty::ECHO, 0),
                (Pty::TTY_OP_ISPEED, TTY_SPEED),
                (Pty::TTY_OP_OSPEED, TTY_SPEED),
            ],
        )
        .await
        .map_err(|e| SshError::ChannelError(format!("Failed to request PTY: {}", e)))?;
    channel
        .request_shell(false)
        .await
        .map_err(|e| SshError::ChannelError(format!("Failed to start shell: {}", e)))?;

    let (reader, writer) = tokio::io::split(channel.into_stream());
    let reader: BoxedReader = Box::new(reader);
    let writer: BoxedWriter = Box::new(writer);
    Ok(DeviceDriver::new(reader, writer))
}

impl Executor {
    /// Learn the prompt of a freshly opened device shell, report it against
    /// the configured one and register the shell as session `name`.
    pub(crate) async fn register_device(
        &mut self,
        node: &str,
        name: &str,
        mut device: BoxedDevice,
        settings: &DeviceSettings,
    ) -> Result<(), SshError> {
        self.sessions.ensure_capacity(name)?;
        device.learn_prompt(settings).await?;
        check_prompt(
            self.emitter.as_ref(),
            node,
            device.prompt(),
            &self.remote.device_prompt,
            "prompt",
        );
        self.sessions.insert(Session::device(name, device))?;
        Ok(())
    }

    /// Run a command on a single-shell device.
    ///
    /// The device session is named after the endpoint and reused across
    /// calls. `envs` and `entrypoint` are accepted for signature parity with
    /// the standard runner but devices have no environment or shell to wrap
    /// the command in; stderr is never written.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_command_on_device_with_options<O, E>(
        &mut self,
        node: &str,
        command: &str,
        _envs: &HashMap<String, String>,
        stdout: &mut O,
        _stderr: &mut E,
        _entrypoint: &[String],
        options: &DeviceCommandOptions,
    ) -> Result<i32, SshError>
    where
        O: AsyncWrite + Unpin + Send,
        E: AsyncWrite + Unpin + Send,
    {
        let settings =
            DeviceSettings::from_options(&self.remote.options).with_call_options(options);
        let session_name = self.endpoint.clone();

        if !self.sessions.contains(&session_name) {
            self.sessions.ensure_capacity(&session_name)?;
            let channel = self.open_channel().await?;
            let device = open_device(channel, &settings).await?;
            self.register_device(node, &session_name, device, &settings)
                .await?;
        }

        let session = self
            .sessions
            .get_mut(&session_name)
            .ok_or_else(|| SshError::SessionNotFound(session_name.clone()))?;
        let device = session
            .device_mut()
            .ok_or_else(|| {
                SshError::ChannelError(format!("{} is not a device session", session_name))
            })?;

        if options.with_ena && !device.in_ena() {
            let ena_prompt = device
                .escalate(&self.remote.device_ena_pass, &settings)
                .await?
                .to_string();
            check_prompt(
                self.emitter.as_ref(),
                node,
                &ena_prompt,
                &self.remote.device_ena_prompt,
                "ena prompt",
            );
        }

        self.emitter
            .info(&format!(">>> [{}] - {} - :coffee:", node, command));

        let output = device.execute(command, &settings).await?;
        stdout.write_all(&output).await?;
        stdout.flush().await?;

        self.emitter
            .debug(&format!(">>> [{}] Command executed.", node));
        Ok(0)
    }
}

/// Compare a learned prompt with the configured one. Mismatches only warn.
fn check_prompt(
    emitter: &dyn Emitter,
    node: &str,
    learned: &str,
    configured: &str,
    what: &str,
) {
    if configured.is_empty() {
        emitter.info(&format!(">>> [{}] - Using {} {}", node, what, learned));
    } else if configured != learned {
        emitter.emit(
            ExecutorEvent::new(EventLevel::Warn, format!("[{}] Mismatch on {}", node, what))
                .field("learned", learned)
                .field("configured", configured),
        );
    }
}
