use std::{
    io::{self, Write},
    process::{Command, Stdio},
};

use tracing::error;

use super::{log_command, Execute, ExecuteError, UNKNOWN_EXIT_CODE};

/// Runs commands as child processes of the current process
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    name: String,
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalExecutor {
    pub fn new() -> LocalExecutor {
        LocalExecutor {
            name: "local".to_string(),
        }
    }

    pub fn with_name(self, name: String) -> LocalExecutor {
        LocalExecutor { name }
    }
}

impl Execute for LocalExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(
        &self,
        command: &str,
        args: &[String],
        stdout: &mut (dyn Write + Send),
        stderr: &mut (dyn Write + Send),
    ) -> Result<(), ExecuteError> {
        log_command(&self.name, command, args);

        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExecuteError::Spawn {
                command: command.to_string(),
                source: e,
            })?;

        let mut child_out = child.stdout.take();
        let mut child_err = child.stderr.take();
        let streamed = std::thread::scope(|scope| {
            let err_pump = scope.spawn(|| match child_err.as_mut() {
                Some(pipe) => io::copy(pipe, &mut *stderr).map(|_| ()),
                None => Ok(()),
            });
            let out = match child_out.as_mut() {
                Some(pipe) => io::copy(pipe, &mut *stdout).map(|_| ()),
                None => Ok(()),
            };
            let err = err_pump
                .join()
                .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::Other, "stderr pump panicked")));
            out.and(err)
        });

        let status = child.wait().map_err(|e| ExecuteError::Stream {
            command: command.to_string(),
            reason: e.to_string(),
        })?;
        streamed.map_err(|e| ExecuteError::Stream {
            command: command.to_string(),
            reason: e.to_string(),
        })?;

        if !status.success() {
            let code = status.code().unwrap_or(UNKNOWN_EXIT_CODE);
            error!("{} exited with code {}", command, code);
            return Err(ExecuteError::ExitStatus {
                command: command.to_string(),
                code,
                stdout: String::new(),
                stderr: String::new(),
            });
        }
        Ok(())
    }
}
