//! # Command execution
//!
//! Every external command the crate issues (`qemu-img`, `genisoimage`, `rm`,
//! `virsh`, install scripts) goes through the [Execute] trait, so the same
//! orchestration code can run against the local host or a remote host over
//! SSH.
//!
//! ## Design
//!
//! Executors stream the command output into the sinks given by the caller
//! instead of buffering it. When the output is needed afterwards, wrap the
//! call with [run_captured] which uses in-memory sinks and attaches what was
//! captured to the error on failure.
//!
//! Two implementations are available:
//!
//! - [LocalExecutor] spawns a child process on this host
//! - [SshExecutor] keeps one authenticated SSH connection and opens a new
//!   channel for every command
//!
//! Arguments are never logged, install scripts carry the cluster token.
use std::{fmt::Debug, io::Write};

use tracing::{debug, trace};

mod local;
mod ssh;

pub use local::LocalExecutor;
pub use ssh::{SshExecutor, SshTarget};

/// Exit code reported when the process could not be spawned at all, or when
/// it was terminated without an exit code.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// Interface to run a command somewhere and stream its output
pub trait Execute: Debug + Send + Sync {
    /// Human readable name of the execution target, used in logs
    fn name(&self) -> &str;

    /// Run `command` with `args` until it exits, writing its output to the
    /// sinks as it is produced.
    fn execute(
        &self,
        command: &str,
        args: &[String],
        stdout: &mut (dyn Write + Send),
        stderr: &mut (dyn Write + Send),
    ) -> Result<(), ExecuteError>;
}

#[derive(thiserror::Error, Debug)]
pub enum ExecuteError {
    #[error("Could not spawn {command}, reason: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} exited with code {code}: {}", .stderr.trim())]
    ExitStatus {
        command: String,
        code: i32,
        stdout: String,
        stderr: String,
    },
    #[error("Could not stream output of {command}, reason: {reason}")]
    Stream { command: String, reason: String },
    #[error("SSH session with {host} failed, reason: {reason}")]
    Session { host: String, reason: String },
    #[error("Could not load private key {path}, reason: {reason}")]
    Key { path: String, reason: String },
}

impl ExecuteError {
    /// Exit code of the failed command, [UNKNOWN_EXIT_CODE] when the command
    /// never produced one.
    pub fn exit_code(&self) -> i32 {
        match self {
            ExecuteError::ExitStatus { code, .. } => *code,
            _ => UNKNOWN_EXIT_CODE,
        }
    }
}

/// Log a command about to run on `target`, without its arguments
pub(crate) fn log_command(target: &str, command: &str, args: &[String]) {
    debug!(target_name = target, "Running {} with {} argument(s)", command, args.len());
}

/// Output of a command run through [run_captured]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run a command with in-memory sinks and return what it printed.
///
/// When the command exits with a non-zero code, the returned
/// [ExecuteError::ExitStatus] carries the captured output.
pub fn run_captured(
    executor: &dyn Execute,
    command: &str,
    args: &[String],
) -> Result<CommandOutput, ExecuteError> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let result = executor.execute(command, args, &mut stdout, &mut stderr);
    let output = CommandOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    };
    trace!(target_name = executor.name(), "{} stdout: {}", command, output.stdout);
    match result {
        Ok(()) => Ok(output),
        Err(ExecuteError::ExitStatus { command, code, .. }) => Err(ExecuteError::ExitStatus {
            command,
            code,
            stdout: output.stdout,
            stderr: output.stderr,
        }),
        Err(e) => Err(e),
    }
}

/// Remove a file with `rm -f`, absent files are not an error
pub fn remove_file(executor: &dyn Execute, path: &str) -> Result<(), ExecuteError> {
    run_captured(executor, "rm", &["-f".to_string(), path.to_string()])?;
    Ok(())
}

/// Quote a single word for a POSIX shell
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Join a command and its arguments into a single shell command line
pub fn shell_line(command: &str, args: &[String]) -> String {
    std::iter::once(command)
        .chain(args.iter().map(String::as_str))
        .map(shell_quote)
        .collect::<Vec<_>>()
        .join(" ")
}
