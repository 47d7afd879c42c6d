//! Centralized command execution with consistent error handling.
//!
//! Every external tool the pipeline drives (apk, mkfs.vfat, mcopy, mkfs.ext4,
//! docker) goes through [`Cmd`]. A non-zero exit surfaces as a
//! [`CommandFailed`] inside the `anyhow` chain, so callers higher up can still
//! recover the original exit code with [`exit_code_of`].

use anyhow::{Context, Result};
use std::ffi::OsString;
use std::io::Write;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use thiserror::Error;

/// An external command ran but exited unsuccessfully.
#[derive(Debug, Error)]
#[error("{prefix} (exit code {code}){}", format_stderr(.stderr))]
pub struct CommandFailed {
    pub program: String,
    pub prefix: String,
    /// Exit code, or -1 if the process was killed by a signal.
    pub code: i32,
    pub stderr: String,
}

fn format_stderr(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(":\n{}", trimmed)
    }
}

/// Walk an error chain and return the exit code of the first failed command.
pub fn exit_code_of(err: &anyhow::Error) -> Option<i32> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<CommandFailed>())
        .map(|failed| failed.code)
}

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Get the exit code, or -1 if terminated by signal.
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }
}

/// Builder for configuring command execution.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    stdin: Option<Vec<u8>>,
    error_prefix: Option<String>,
}

impl Cmd {
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            stdin: None,
            error_prefix: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(OsString::from(arg.as_ref()));
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.args.push(OsString::from(arg.as_ref()));
        }
        self
    }

    /// Add a path as an argument without lossy conversion.
    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.as_os_str().to_os_string());
        self
    }

    /// Feed these bytes to the child's standard input.
    pub fn stdin_bytes(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn error_msg(mut self, msg: impl AsRef<str>) -> Self {
        self.error_prefix = Some(msg.as_ref().to_string());
        self
    }

    /// Program name, for diagnostics.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Rendered argument list, for diagnostics and tests.
    pub fn display_args(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    fn failure(&self, code: i32, stderr: String) -> CommandFailed {
        CommandFailed {
            program: self.program.clone(),
            prefix: self
                .error_prefix
                .clone()
                .unwrap_or_else(|| format!("'{}' failed", self.program)),
            code,
            stderr,
        }
    }

    /// Run the command and capture output.
    pub fn run(self) -> Result<CommandResult> {
        tracing::debug!(program = %self.program, args = ?self.display_args(), "running");

        let mut cmd = self.command();
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if self.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to execute '{}'. Is it installed?", self.program))?;

        if let (Some(input), Some(mut stdin)) = (self.stdin.as_ref(), child.stdin.take()) {
            stdin
                .write_all(input)
                .with_context(|| format!("Failed to write stdin of '{}'", self.program))?;
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("Failed to wait for '{}'", self.program))?;

        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() {
            return Err(self.failure(result.code(), result.stderr.clone()).into());
        }

        Ok(result)
    }

    /// Run the command with inherited stdout/stderr so progress streams to
    /// the terminal. Stdin is inherited unless bytes were supplied.
    pub fn run_interactive(self) -> Result<ExitStatus> {
        tracing::debug!(program = %self.program, args = ?self.display_args(), "running (streaming)");

        let mut cmd = self.command();
        cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        cmd.stdin(if self.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::inherit()
        });

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to execute '{}'. Is it installed?", self.program))?;

        if let Some(input) = self.stdin.as_ref() {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(input)
                    .with_context(|| format!("Failed to write stdin of '{}'", self.program))?;
            }
        }

        let status = child
            .wait()
            .with_context(|| format!("Failed to wait for '{}'", self.program))?;

        if !status.success() {
            return Err(self
                .failure(status.code().unwrap_or(-1), String::new())
                .into());
        }

        Ok(status)
    }
}

/// Check if a program exists in PATH.
pub fn exists(program: &str) -> bool {
    which::which(program).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_success() {
        let result = Cmd::new("echo").arg("hello").run().unwrap();
        assert!(result.success());
        assert_eq!(result.stdout, "hello\n");
    }

    #[test]
    fn test_failure_keeps_exit_code() {
        let err = Cmd::new("sh")
            .args(["-c", "echo broken >&2; exit 7"])
            .error_msg("mkfs step failed")
            .run()
            .unwrap_err();

        assert_eq!(exit_code_of(&err), Some(7));
        let msg = err.to_string();
        assert!(msg.contains("mkfs step failed"));
        assert!(msg.contains("exit code 7"));
        assert!(msg.contains("broken"));
    }

    #[test]
    fn test_exit_code_survives_context() {
        let err = Cmd::new("false")
            .run()
            .context("formatting boot image")
            .unwrap_err();
        assert_eq!(exit_code_of(&err), Some(1));
    }

    #[test]
    fn test_stdin_is_forwarded() {
        let result = Cmd::new("cat").stdin_bytes("piped body").run().unwrap();
        assert_eq!(result.stdout, "piped body");
    }

    #[test]
    fn test_missing_program_has_no_exit_code() {
        let err = Cmd::new("definitely_not_a_real_command_12345")
            .run()
            .unwrap_err();
        assert_eq!(exit_code_of(&err), None);
    }

    #[test]
    fn test_exists() {
        assert!(exists("sh"));
        assert!(!exists("nonexistent_program_12345"));
    }
}
