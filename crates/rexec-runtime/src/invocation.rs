use std::collections::BTreeMap;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use crate::error::ExecError;
use crate::ssh_env;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// One request to run a command on a session.
///
/// ```
/// use std::time::Duration;
/// use rexec_runtime::Invocation;
///
/// let invocation = Invocation::builder()
///     .command("uptime")
///     .timeout(Duration::from_secs(5))
///     .warn(true)
///     .build();
/// assert!(invocation.validate().is_ok());
/// ```
#[derive(Debug, Clone, TypedBuilder)]
pub struct Invocation {
    #[builder(setter(into))]
    pub command: String,

    #[builder(default = DEFAULT_TIMEOUT)]
    pub timeout: Duration,

    /// Return non-zero exits as a normal result instead of an error
    #[builder(default)]
    pub warn: bool,

    /// Show the command before running it: on local stdout, or as an
    /// [`OutputLine::Command`] when `output` is attached
    #[builder(default)]
    pub echo: bool,

    /// Written to the remote process' stdin, followed by EOF
    #[builder(default, setter(strip_option, into))]
    pub stdin: Option<Bytes>,

    /// Exported in the remote shell before the command runs
    #[builder(default)]
    pub env: BTreeMap<String, String>,

    #[builder(default, setter(strip_option))]
    pub cancel: Option<CancellationToken>,

    /// Receives output line by line while the command runs
    #[builder(default, setter(strip_option))]
    pub output: Option<mpsc::Sender<OutputLine>>,
}

impl Invocation {
    pub fn new(command: impl Into<String>) -> Self {
        Self::builder().command(command).build()
    }

    pub fn validate(&self) -> Result<(), ExecError> {
        if self.command.trim().is_empty() {
            return Err(ExecError::InvalidArgument(
                "command must not be empty".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(ExecError::InvalidArgument(
                "timeout must be greater than zero".to_string(),
            ));
        }
        if let Some(name) = self.env.keys().find(|k| !ssh_env::is_valid_env_name(k)) {
            return Err(ExecError::InvalidArgument(format!(
                "invalid environment variable name: {name:?}"
            )));
        }
        Ok(())
    }

    /// The full command line sent to the remote shell
    pub fn command_line(&self) -> String {
        ssh_env::command_line(&self.command, &self.env)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }
}

/// The outcome of a command that ran to completion (or was cut short).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationResult {
    pub command: String,
    pub exit_code: i32,
    pub stdout: Bytes,
    pub stderr: Bytes,
    pub elapsed: Duration,
}

impl InvocationResult {
    /// Result for a command that never produced anything
    pub(crate) fn empty(command: &str) -> Self {
        Self {
            command: command.to_string(),
            exit_code: -1,
            stdout: Bytes::new(),
            stderr: Bytes::new(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn ok(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    /// The command line itself, sent first when the invocation echoes
    Command(String),
    Stdout(String),
    Stderr(String),
}

impl OutputLine {
    pub fn inner(&self) -> &str {
        match self {
            Self::Command(text) | Self::Stdout(text) | Self::Stderr(text) => text,
        }
    }

    pub fn is_stdout(&self) -> bool {
        matches!(self, Self::Stdout(_))
    }
}

/// Accumulates the output of a running command.
///
/// Keeps every byte for the final result and, when a live stream is attached,
/// forwards complete lines as they arrive.
pub(crate) struct OutputCollector {
    stdout: BytesMut,
    stderr: BytesMut,
    stdout_line: Vec<u8>,
    stderr_line: Vec<u8>,
    stream: Option<mpsc::Sender<OutputLine>>,
}

impl OutputCollector {
    pub fn new(stream: Option<mpsc::Sender<OutputLine>>) -> Self {
        Self {
            stdout: BytesMut::new(),
            stderr: BytesMut::new(),
            stdout_line: Vec::new(),
            stderr_line: Vec::new(),
            stream,
        }
    }

    /// Show the command line. Goes through the live stream when one is
    /// attached so it is not interleaved with other hosts' output.
    pub async fn echo(&self, command: &str) {
        match &self.stream {
            Some(stream) => {
                let _ = stream.send(OutputLine::Command(command.to_string())).await;
            }
            None => println!("\x1b[1;37m{command}\x1b[0m"),
        }
    }

    pub async fn push_stdout(&mut self, data: &[u8]) {
        self.stdout.extend_from_slice(data);
        if let Some(stream) = &self.stream {
            forward_lines(&mut self.stdout_line, data, stream, OutputLine::Stdout).await;
        }
    }

    pub async fn push_stderr(&mut self, data: &[u8]) {
        self.stderr.extend_from_slice(data);
        if let Some(stream) = &self.stream {
            forward_lines(&mut self.stderr_line, data, stream, OutputLine::Stderr).await;
        }
    }

    /// Flush any trailing partial lines and produce the result
    pub async fn finish(mut self, command: &str, exit_code: i32, elapsed: Duration) -> InvocationResult {
        if let Some(stream) = self.stream.take() {
            if !self.stdout_line.is_empty() {
                let line = String::from_utf8_lossy(&self.stdout_line).into_owned();
                let _ = stream.send(OutputLine::Stdout(line)).await;
            }
            if !self.stderr_line.is_empty() {
                let line = String::from_utf8_lossy(&self.stderr_line).into_owned();
                let _ = stream.send(OutputLine::Stderr(line)).await;
            }
        }

        InvocationResult {
            command: command.to_string(),
            exit_code,
            stdout: self.stdout.freeze(),
            stderr: self.stderr.freeze(),
            elapsed,
        }
    }
}

async fn forward_lines(
    buffer: &mut Vec<u8>,
    data: &[u8],
    stream: &mpsc::Sender<OutputLine>,
    wrap: fn(String) -> OutputLine,
) {
    buffer.extend_from_slice(data);

    // Process complete lines
    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let rest = buffer.split_off(pos + 1);
        let line = String::from_utf8_lossy(&buffer[..pos]).into_owned();
        *buffer = rest;

        if stream.send(wrap(line)).await.is_err() {
            tracing::trace!("Output stream receiver dropped");
            break;
        }
    }
}
