use std::io::Write;

/// One line of caller-visible command output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EchoLine {
    Command { prompt: String, command: String },
    Stdout(String),
    Stderr(String),
}

/// Where executed commands and their output are shown to the user.
pub trait Echo: Send + Sync {
    fn emit(&self, line: EchoLine);
}

/// ANSI-styled terminal output: commands in bold, stdout green, stderr red.
#[derive(Debug, Clone, Default)]
pub struct TerminalEcho;

impl Echo for TerminalEcho {
    fn emit(&self, line: EchoLine) {
        match line {
            EchoLine::Command { prompt, command } => {
                let mut out = std::io::stdout().lock();
                let _ = writeln!(out, "{} $ \x1b[1m{}\x1b[0m", prompt, command);
            }
            EchoLine::Stdout(text) => {
                let mut out = std::io::stdout().lock();
                let _ = writeln!(out, "\t\x1b[92m+ {}\x1b[0m", text);
            }
            EchoLine::Stderr(text) => {
                let mut err = std::io::stderr().lock();
                let _ = writeln!(err, "\t\x1b[91m- {}\x1b[0m", text);
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SilentEcho;

impl Echo for SilentEcho {
    fn emit(&self, _line: EchoLine) {}
}
