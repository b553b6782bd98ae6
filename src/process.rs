//! Small builder around `std::process::Command` for host tools.
//!
//! Every OS primitive the attach strategies need (losetup, mount, hdiutil,
//! diskutil, ...) goes through [`Cmd`] so failures carry the command line,
//! exit status and stderr in one error message.

use anyhow::{bail, Context, Result};
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::io::Write;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use tracing::debug;

/// Captured result of a finished host command.
#[derive(Debug)]
pub struct CmdOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Stdout with surrounding whitespace removed.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

/// Builder for a host command.
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    error_msg: Option<String>,
    allow_fail: bool,
    input: Option<Vec<u8>>,
}

impl Cmd {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            error_msg: None,
            allow_fail: false,
            input: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    /// Message prefixed to the error when the command exits non-zero.
    pub fn error_msg(mut self, msg: &str) -> Self {
        self.error_msg = Some(msg.to_string());
        self
    }

    /// Feed `bytes` to the command's stdin.
    pub fn input(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.input = Some(bytes.into());
        self
    }

    /// Return the output even when the command exits non-zero.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }

    pub fn run(self) -> Result<CmdOutput> {
        let line = self.display();
        debug!(command = %line, "running host command");

        let mut command = Command::new(&self.program);
        command.args(&self.args);
        let output = match self.input {
            None => command
                .stdin(Stdio::null())
                .output()
                .with_context(|| format!("failed to spawn '{}'", line))?,
            Some(bytes) => {
                let mut child = command
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .spawn()
                    .with_context(|| format!("failed to spawn '{}'", line))?;
                let feeder = child.stdin.take().map(|mut stdin| {
                    thread::spawn(move || {
                        let _ = stdin.write_all(&bytes);
                    })
                });
                let output = child
                    .wait_with_output()
                    .with_context(|| format!("waiting for '{}'", line))?;
                if let Some(feeder) = feeder {
                    let _ = feeder.join();
                }
                output
            }
        };

        let result = CmdOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() && !self.allow_fail {
            let prefix = self
                .error_msg
                .unwrap_or_else(|| format!("'{}' failed", self.program));
            bail!(
                "{}: `{}` exited with {}: {}",
                prefix,
                line,
                result.status,
                result.stderr.trim()
            );
        }

        Ok(result)
    }
}
