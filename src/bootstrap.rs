//! # Cluster bootstrap over SSH
//!
//! Installs k3s on freshly provisioned nodes. Masters are installed one after
//! the other and the first failure stops the rollout. Workers are installed
//! concurrently, one blocking task per node, each with its own SSH session.
//!
//! The output of every node is written line by line to a shared sink, each
//! line prefixed with the node hostname so the interleaved output of
//! concurrent workers can still be told apart.
//!
//! ## Example
//!
//! ```ignore
//! use tokio_util::sync::CancellationToken;
//! use virtpilot::bootstrap::Bootstrap;
//!
//! let bootstrap = Bootstrap::new(Box::new(std::io::stdout()));
//! let cancel = CancellationToken::new();
//! bootstrap.bootstrap_masters(&masters, "s3cr3t", &cancel).await?;
//! bootstrap
//!     .bootstrap_workers(&workers, "s3cr3t", "https://10.0.0.2:6443", &cancel)
//!     .await?;
//! ```
use std::{
    fmt,
    io::{self, Write},
    sync::{Arc, Mutex},
};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    error::{PilotError, Result},
    executor::{shell_quote, Execute, SshExecutor, SshTarget},
};

/// Install script fetched by every node
pub const INSTALL_SCRIPT_URL: &str = "https://get.k3s.io";

/// Output sink shared by every node of a rollout
pub type SharedSink = Arc<Mutex<Box<dyn Write + Send>>>;

/// A host to install k3s on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Name printed in front of every output line of this node
    pub hostname: String,
    pub target: SshTarget,
}

/// Opens an executor on a node
pub trait Dial: fmt::Debug + Send + Sync {
    fn dial(&self, node: &Node) -> Result<Box<dyn Execute>>;
}

/// Dials nodes over SSH with their private key
#[derive(Debug, Clone, Copy, Default)]
pub struct SshDialer;

impl Dial for SshDialer {
    fn dial(&self, node: &Node) -> Result<Box<dyn Execute>> {
        Ok(Box::new(SshExecutor::connect(&node.target)?))
    }
}

/// Writer prefixing every line with a fixed string before handing it to a
/// shared sink. A trailing partial line is kept until the next newline or
/// until the writer is flushed.
pub struct PrefixWriter {
    prefix: String,
    sink: SharedSink,
    pending: Vec<u8>,
}

impl fmt::Debug for PrefixWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrefixWriter")
            .field("prefix", &self.prefix)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl PrefixWriter {
    pub fn new(prefix: String, sink: SharedSink) -> PrefixWriter {
        PrefixWriter {
            prefix,
            sink,
            pending: Vec::new(),
        }
    }

    fn emit(&self, line: &[u8]) -> io::Result<()> {
        let mut sink = self
            .sink
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "output sink lock poisoned"))?;
        sink.write_all(self.prefix.as_bytes())?;
        sink.write_all(line)
    }
}

impl Write for PrefixWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        while let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            self.emit(&line)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            let mut line = std::mem::take(&mut self.pending);
            line.push(b'\n');
            self.emit(&line)?;
        }
        let mut sink = self
            .sink
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "output sink lock poisoned"))?;
        sink.flush()
    }
}

impl Drop for PrefixWriter {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            debug!("Could not flush output of {}: {}", self.prefix.trim(), e);
        }
    }
}

/// Shell line installing a server node that initialises the cluster
pub fn master_install_command(script_url: &str, token: &str) -> String {
    format!(
        "curl -sfL {} | K3S_TOKEN={} sh -s - server --cluster-init",
        shell_quote(script_url),
        shell_quote(token)
    )
}

/// Shell line installing an agent node joining the cluster at `master_url`
pub fn worker_install_command(script_url: &str, token: &str, master_url: &str) -> String {
    format!(
        "curl -sfL {} | K3S_URL={} K3S_TOKEN={} INSTALL_K3S_EXEC=agent sh -s -",
        shell_quote(script_url),
        shell_quote(master_url),
        shell_quote(token)
    )
}

/// Dial `node` and run `script` there, streaming its output into `sink`
fn install_node<D: Dial + ?Sized>(
    dialer: &D,
    node: &Node,
    script: &str,
    sink: &SharedSink,
) -> Result<()> {
    let executor = dialer.dial(node)?;
    info!("Installing k3s on {} through {}", node.hostname, executor.name());

    let prefix = format!("[{}] ", node.hostname);
    let mut stdout = PrefixWriter::new(prefix.clone(), sink.clone());
    let mut stderr = PrefixWriter::new(prefix, sink.clone());
    let result = executor.execute(
        "sh",
        &["-c".to_string(), script.to_string()],
        &mut stdout,
        &mut stderr,
    );
    for writer in [&mut stdout, &mut stderr] {
        if let Err(e) = writer.flush() {
            warn!("Could not flush output of {}: {}", node.hostname, e);
        }
    }
    result?;
    info!("k3s installed on {}", node.hostname);
    Ok(())
}

fn bootstrap_error(node: &Node, source: PilotError) -> PilotError {
    PilotError::Bootstrap {
        node: node.hostname.clone(),
        source: Box::new(source),
    }
}

fn join_error(node: &Node, e: tokio::task::JoinError) -> PilotError {
    bootstrap_error(node, PilotError::Io(io::Error::new(io::ErrorKind::Other, e)))
}

/// Installs k3s on master and worker nodes
pub struct Bootstrap<D: Dial = SshDialer> {
    dialer: Arc<D>,
    output: SharedSink,
    script_url: String,
}

impl<D: Dial> fmt::Debug for Bootstrap<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bootstrap")
            .field("dialer", &self.dialer)
            .field("script_url", &self.script_url)
            .finish()
    }
}

impl Bootstrap<SshDialer> {
    /// Bootstrap over SSH, writing node output to `output`
    pub fn new(output: Box<dyn Write + Send>) -> Self {
        Bootstrap::with_dialer(SshDialer, output)
    }
}

impl<D: Dial + 'static> Bootstrap<D> {
    pub fn with_dialer(dialer: D, output: Box<dyn Write + Send>) -> Self {
        Bootstrap {
            dialer: Arc::new(dialer),
            output: Arc::new(Mutex::new(output)),
            script_url: INSTALL_SCRIPT_URL.to_string(),
        }
    }

    /// Fetch the install script from another location, e.g. a local mirror
    pub fn with_script_url(mut self, script_url: String) -> Self {
        self.script_url = script_url;
        self
    }

    /// Install the masters in order. The first failure is returned right
    /// away and the remaining masters are left untouched.
    #[instrument(skip_all, fields(count = nodes.len()))]
    pub async fn bootstrap_masters(
        &self,
        nodes: &[Node],
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let script = master_install_command(&self.script_url, token);
        for (index, node) in nodes.iter().enumerate() {
            if cancel.is_cancelled() {
                let skipped: Vec<String> =
                    nodes[index..].iter().map(|n| n.hostname.clone()).collect();
                warn!("Master bootstrap cancelled, {} node(s) not started", skipped.len());
                return Err(PilotError::Cancelled {
                    operation: "bootstrap masters",
                    failed: Vec::new(),
                    skipped,
                });
            }

            let dialer = self.dialer.clone();
            let sink = self.output.clone();
            let task_node = node.clone();
            let task_script = script.clone();
            let result = tokio::task::spawn_blocking(move || {
                install_node(dialer.as_ref(), &task_node, &task_script, &sink)
            })
            .await
            .map_err(|e| join_error(node, e))?;

            if let Err(e) = result {
                error!("Master {} failed, stopping: {}", node.hostname, e);
                return Err(bootstrap_error(node, e));
            }
        }
        Ok(())
    }

    /// Install every worker concurrently and wait for all of them.
    ///
    /// Workers that could not be installed do not stop the others. Once
    /// every started worker is done, the error of the first failed worker,
    /// in `nodes` order, is returned.
    #[instrument(skip_all, fields(count = nodes.len(), master = master_url))]
    pub async fn bootstrap_workers(
        &self,
        nodes: &[Node],
        token: &str,
        master_url: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let script = worker_install_command(&self.script_url, token, master_url);
        let mut tasks = JoinSet::new();
        for (index, node) in nodes.iter().enumerate() {
            let dialer = self.dialer.clone();
            let sink = self.output.clone();
            let node = node.clone();
            let script = script.clone();
            let cancel = cancel.clone();
            tasks.spawn_blocking(move || {
                if cancel.is_cancelled() {
                    return (index, None);
                }
                let result = install_node(dialer.as_ref(), &node, &script, &sink);
                if let Err(e) = &result {
                    error!("Worker {} failed: {}", node.hostname, e);
                }
                (index, Some(result))
            });
        }

        let mut outcomes: Vec<Option<Result<()>>> = nodes.iter().map(|_| None).collect();
        let mut lost = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = outcome,
                Err(e) => {
                    error!("Worker task did not complete: {}", e);
                    lost.get_or_insert(e);
                }
            }
        }

        let mut skipped = Vec::new();
        let mut first_error = None;
        for (node, outcome) in nodes.iter().zip(outcomes) {
            match outcome {
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(bootstrap_error(node, e));
                    }
                }
                None if cancel.is_cancelled() => skipped.push(node.hostname.clone()),
                None => {
                    if let Some(e) = lost.take() {
                        first_error.get_or_insert_with(|| join_error(node, e));
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if !skipped.is_empty() {
            warn!("Worker bootstrap cancelled, {} node(s) not started", skipped.len());
            return Err(PilotError::Cancelled {
                operation: "bootstrap workers",
                failed: Vec::new(),
                skipped,
            });
        }
        Ok(())
    }
}
