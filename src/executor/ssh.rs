use std::{
    fmt,
    io::{self, Read, Write},
    net::TcpStream,
    path::{Path, PathBuf},
    time::Duration,
};

use ssh2::{HashType, Session};
use tracing::{debug, instrument, warn};

use super::{log_command, shell_line, Execute, ExecuteError, UNKNOWN_EXIT_CODE};

pub const DEFAULT_SSH_PORT: u16 = 22;
/// Pause between two polls of a channel with no output ready
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Where and as whom to open the SSH connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshTarget {
    pub host: String,
    pub port: Option<u16>,
    pub user: String,
    /// Private key used to authenticate, `~` is expanded to the home directory
    pub key_path: PathBuf,
}

impl SshTarget {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_SSH_PORT)
    }
}

/// Expand a leading `~` to the home directory of the current user
pub(crate) fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Read the private key and make sure it can be used without a passphrase.
///
/// OpenSSH formatted keys are parsed here, legacy PEM keys are handed to
/// libssh2 as is.
pub(crate) fn load_private_key(path: &Path) -> Result<PathBuf, ExecuteError> {
    let path = expand_home(path);
    let key_error = |reason: String| ExecuteError::Key {
        path: path.display().to_string(),
        reason,
    };
    let contents = std::fs::read_to_string(&path).map_err(|e| key_error(e.to_string()))?;
    if contents.contains("BEGIN OPENSSH PRIVATE KEY") {
        let key = ssh_key::PrivateKey::from_openssh(&contents)
            .map_err(|e| key_error(e.to_string()))?;
        if key.is_encrypted() {
            return Err(key_error("encrypted keys are not supported".to_string()));
        }
        debug!("Loaded {} key {}", key.algorithm(), path.display());
    }
    Ok(path)
}

/// Runs commands on a remote host through a single authenticated SSH
/// connection. Each command gets its own channel.
///
/// The server host key is NOT verified, any key is accepted.
pub struct SshExecutor {
    name: String,
    session: Session,
}

impl fmt::Debug for SshExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshExecutor")
            .field("name", &self.name)
            .field("authenticated", &self.session.authenticated())
            .finish()
    }
}

impl SshExecutor {
    /// Dial the target and authenticate with its private key
    #[instrument(skip_all, fields(host = %target.host))]
    pub fn connect(target: &SshTarget) -> Result<SshExecutor, ExecuteError> {
        let session_error = |reason: String| ExecuteError::Session {
            host: target.host.clone(),
            reason,
        };
        let key_path = load_private_key(&target.key_path)?;

        debug!("Dialing {}:{}", target.host, target.port());
        let tcp = TcpStream::connect((target.host.as_str(), target.port()))
            .map_err(|e| session_error(e.to_string()))?;
        let mut session = Session::new().map_err(|e| session_error(e.to_string()))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| session_error(e.to_string()))?;

        let fingerprint = session
            .host_key_hash(HashType::Sha256)
            .map(|hash| hash.iter().map(|b| format!("{:02x}", b)).collect::<String>())
            .unwrap_or_default();
        warn!(
            "Host key of {} is not verified (sha256 {})",
            target.host, fingerprint
        );

        session
            .userauth_pubkey_file(&target.user, None, &key_path, None)
            .map_err(|e| session_error(e.to_string()))?;
        if !session.authenticated() {
            return Err(session_error(format!(
                "authentication as {} was rejected",
                target.user
            )));
        }

        Ok(SshExecutor {
            name: format!("{}@{}", target.user, target.host),
            session,
        })
    }

    /// Tear down the connection, dropping the executor does the same
    pub fn close(self) {}
}

impl Drop for SshExecutor {
    fn drop(&mut self) {
        if let Err(e) = self.session.disconnect(None, "closing", None) {
            debug!("Could not disconnect from {}: {}", self.name, e);
        }
    }
}

impl Execute for SshExecutor {
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
        let line = shell_line(command, args);
        log_command(&self.name, command, args);
        let session_error = |reason: String| ExecuteError::Session {
            host: self.name.clone(),
            reason,
        };

        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| session_error(e.to_string()))?;
        channel
            .exec(&line)
            .map_err(|e| session_error(e.to_string()))?;

        // Both streams are polled below, reads must not block
        self.session.set_blocking(false);
        let pumped = pump_output(
            &mut channel.stream(0),
            &mut channel.stderr(),
            stdout,
            stderr,
        );
        self.session.set_blocking(true);
        pumped.map_err(|e| ExecuteError::Stream {
            command: command.to_string(),
            reason: e.to_string(),
        })?;

        channel
            .wait_close()
            .map_err(|e| session_error(e.to_string()))?;
        exit_result(command, channel.exit_status().ok())
    }
}

enum Drained {
    Data,
    Pending,
    Closed,
}

/// Forward what `source` has ready to `sink`
fn drain(source: &mut dyn Read, sink: &mut dyn Write, buf: &mut [u8]) -> io::Result<Drained> {
    match source.read(buf) {
        Ok(0) => Ok(Drained::Closed),
        Ok(n) => {
            sink.write_all(&buf[..n])?;
            Ok(Drained::Data)
        }
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
            Ok(Drained::Pending)
        }
        Err(e) => Err(e),
    }
}

/// Copy both outputs of a remote command in turn until both are closed.
///
/// The sources must be non-blocking, reporting [io::ErrorKind::WouldBlock]
/// when nothing is ready yet.
fn pump_output(
    out_source: &mut dyn Read,
    err_source: &mut dyn Read,
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
) -> io::Result<()> {
    let mut buf = [0u8; 8192];
    let mut out_open = true;
    let mut err_open = true;
    while out_open || err_open {
        let mut idle = true;
        if out_open {
            match drain(out_source, stdout, &mut buf)? {
                Drained::Data => idle = false,
                Drained::Closed => out_open = false,
                Drained::Pending => {}
            }
        }
        if err_open {
            match drain(err_source, stderr, &mut buf)? {
                Drained::Data => idle = false,
                Drained::Closed => err_open = false,
                Drained::Pending => {}
            }
        }
        if idle && (out_open || err_open) {
            std::thread::sleep(POLL_INTERVAL);
        }
    }
    Ok(())
}

/// Turn the exit status reported by the server into a result, a missing
/// status counts as a failure.
fn exit_result(command: &str, status: Option<i32>) -> Result<(), ExecuteError> {
    match status.unwrap_or(UNKNOWN_EXIT_CODE) {
        0 => Ok(()),
        code => Err(ExecuteError::ExitStatus {
            command: command.to_string(),
            code,
            stdout: String::new(),
            stderr: String::new(),
        }),
    }
}
