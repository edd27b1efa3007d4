use crate::constants::tunnel as tunnel_constants;
use crate::errors::{Error, Result};
use crate::services::echo::{Echo, EchoLine};
use crate::services::shell::RemoteShell;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Which parts of a command run are echoed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoMode {
    pub command: bool,
    pub stdout: bool,
    pub stderr: bool,
}

impl EchoMode {
    pub const ALL: EchoMode = EchoMode {
        command: true,
        stdout: true,
        stderr: true,
    };

    pub const NONE: EchoMode = EchoMode {
        command: false,
        stdout: false,
        stderr: false,
    };
}

impl From<bool> for EchoMode {
    fn from(echo: bool) -> Self {
        if echo {
            EchoMode::ALL
        } else {
            EchoMode::NONE
        }
    }
}

/// What a captured command printed, byte for byte.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Runs commands over a remote shell and reports their exit status.
/// Blocking: callers that need concurrency run it on their own worker.
#[derive(Clone)]
pub struct CommandExecutor {
    shell: Arc<dyn RemoteShell>,
    echo: Arc<dyn Echo>,
    prompt: String,
}

impl CommandExecutor {
    pub fn new(shell: Arc<dyn RemoteShell>, echo: Arc<dyn Echo>, prompt: impl Into<String>) -> Self {
        Self {
            shell,
            echo,
            prompt: prompt.into(),
        }
    }

    pub fn shell(&self) -> &Arc<dyn RemoteShell> {
        &self.shell
    }

    pub fn execute(&self, command: &str, echo: impl Into<EchoMode>) -> Result<i32> {
        let mode = echo.into();
        if mode.command {
            self.echo.emit(EchoLine::Command {
                prompt: self.prompt.clone(),
                command: command.to_string(),
            });
        }
        let mut stdout = LineBuffer::default();
        let mut stderr = LineBuffer::default();
        let status = self.pump(
            command,
            |chunk| {
                for line in stdout.push(chunk) {
                    self.emit(mode.stdout, EchoLine::Stdout(line));
                }
            },
            |chunk| {
                for line in stderr.push(chunk) {
                    self.emit(mode.stderr, EchoLine::Stderr(line));
                }
            },
        )?;
        if let Some(rest) = stdout.finish() {
            self.emit(mode.stdout, EchoLine::Stdout(rest));
        }
        if let Some(rest) = stderr.finish() {
            self.emit(mode.stderr, EchoLine::Stderr(rest));
        }
        Ok(status)
    }

    /// Runs `command` silently and hands back everything it printed.
    pub fn capture(&self, command: &str) -> Result<CommandOutput> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let status = self.pump(
            command,
            |chunk| stdout.extend_from_slice(chunk),
            |chunk| stderr.extend_from_slice(chunk),
        )?;
        Ok(CommandOutput {
            status,
            stdout,
            stderr,
        })
    }

    fn pump<O, E>(&self, command: &str, mut on_stdout: O, mut on_stderr: E) -> Result<i32>
    where
        O: FnMut(&[u8]),
        E: FnMut(&[u8]),
    {
        let mut process = self.shell.spawn(command)?;
        let mut buf = [0u8; 8192];
        let backoff = Duration::from_millis(tunnel_constants::IDLE_BACKOFF_MS * 4);

        loop {
            let mut progressed = false;
            match process.read_stdout(&mut buf) {
                Ok(n) if n > 0 => {
                    progressed = true;
                    on_stdout(&buf[..n]);
                }
                Ok(_) => {}
                Err(err) if is_idle(&err) => {}
                Err(err) => {
                    return Err(Error::execution(format!(
                        "'{}': stdout read failed: {}",
                        command, err
                    )))
                }
            }
            match process.read_stderr(&mut buf) {
                Ok(n) if n > 0 => {
                    progressed = true;
                    on_stderr(&buf[..n]);
                }
                Ok(_) => {}
                Err(err) if is_idle(&err) => {}
                Err(err) => {
                    return Err(Error::execution(format!(
                        "'{}': stderr read failed: {}",
                        command, err
                    )))
                }
            }
            if !progressed {
                if process.is_eof() {
                    break;
                }
                std::thread::sleep(backoff);
            }
        }

        let status = process.wait()?;
        tracing::debug!(command, status, "remote command finished");
        Ok(status)
    }

    fn emit(&self, enabled: bool, line: EchoLine) {
        if enabled {
            self.echo.emit(line);
        }
    }
}

fn is_idle(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// Reassembles lines from arbitrarily split chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode_line(&raw));
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        Some(decode_line(&raw))
    }
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(['\n', '\r'])
        .to_string()
}
