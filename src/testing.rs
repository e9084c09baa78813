//! In-memory doubles for the executor and the hypervisor connection.
use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    io::{self, Write},
    net::IpAddr,
    sync::{Arc, Mutex},
};

use uuid::Uuid;

use crate::{
    error::{PilotError, Result},
    executor::{Execute, ExecuteError},
    hypervisor::{descriptor::SAMPLE_DOMAIN, Connection, Connector, DomainDescriptor, InterfaceAddress},
    models::DomainState,
};

/// Shared buffer receiving formatted log lines
#[derive(Debug, Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run `f` with every event down to TRACE recorded, return the log output
pub(crate) fn capture_logs(f: impl FnOnce()) -> String {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    tracing::subscriber::with_default(subscriber, f);
    let logs = buffer.0.lock().unwrap().clone();
    String::from_utf8_lossy(&logs).into_owned()
}

#[derive(Debug, Default)]
struct Recorded {
    commands: Vec<String>,
    files: BTreeSet<String>,
    iso_inputs: Vec<(String, String)>,
    failing: Vec<String>,
}

/// Executor that records command lines and simulates the files created by
/// `qemu-img`, `genisoimage` and removed by `rm`.
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordingExecutor {
    state: Arc<Mutex<Recorded>>,
}

impl RecordingExecutor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fail every command whose line contains `pattern`
    pub(crate) fn failing_on(self, pattern: &str) -> Self {
        self.state.lock().unwrap().failing.push(pattern.to_string());
        self
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub(crate) fn has_file(&self, path: &str) -> bool {
        self.state.lock().unwrap().files.contains(path)
    }

    pub(crate) fn files(&self) -> Vec<String> {
        self.state.lock().unwrap().files.iter().cloned().collect()
    }

    /// File name and contents of every input handed to `genisoimage`
    pub(crate) fn iso_inputs(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().iso_inputs.clone()
    }
}

impl Execute for RecordingExecutor {
    fn name(&self) -> &str {
        "recording"
    }

    fn execute(
        &self,
        command: &str,
        args: &[String],
        stdout: &mut (dyn Write + Send),
        _stderr: &mut (dyn Write + Send),
    ) -> Result<(), ExecuteError> {
        let line = std::iter::once(command.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        let mut state = self.state.lock().unwrap();
        state.commands.push(line.clone());
        if state.failing.iter().any(|p| line.contains(p.as_str())) {
            return Err(ExecuteError::ExitStatus {
                command: command.to_string(),
                code: 1,
                stdout: String::new(),
                stderr: String::new(),
            });
        }
        match command {
            "qemu-img" if args.len() >= 2 => {
                state.files.insert(args[args.len() - 2].clone());
            }
            "genisoimage" => {
                if let Some(pos) = args.iter().position(|a| a == "-output") {
                    state.files.insert(args[pos + 1].clone());
                }
                if let Some(pos) = args.iter().position(|a| a == "-r") {
                    for input in &args[pos + 1..] {
                        let name = std::path::Path::new(input)
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        let contents = std::fs::read_to_string(input).unwrap_or_default();
                        state.iso_inputs.push((name, contents));
                    }
                }
            }
            "rm" => {
                for path in args.iter().filter(|a| !a.starts_with('-')) {
                    state.files.remove(path);
                }
            }
            _ => {}
        }
        let _ = writeln!(stdout, "ok");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FakeDomain {
    pub(crate) xml: String,
    pub(crate) state: DomainState,
    pub(crate) autostart: bool,
    pub(crate) persistent: bool,
    pub(crate) lease_hostname: Option<String>,
    pub(crate) addresses: Vec<InterfaceAddress>,
}

#[derive(Debug, Default)]
pub(crate) struct FakeHypervisor {
    pub(crate) domains: BTreeMap<String, FakeDomain>,
    pub(crate) alive: bool,
    pub(crate) connects: usize,
    pub(crate) fail_connect: bool,
    pub(crate) fail_define: HashSet<String>,
    /// Lookups of these names fail with something else than NotFound
    pub(crate) fail_lookup: HashSet<String>,
    pub(crate) calls: Vec<String>,
}

/// Connector handing out connections to one shared in-memory hypervisor
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeConnector {
    pub(crate) state: Arc<Mutex<FakeHypervisor>>,
}

impl FakeConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a domain built from the sample descriptor
    pub(crate) fn with_domain(self, name: &str, state: DomainState) -> Self {
        let mut descriptor = DomainDescriptor::parse(SAMPLE_DOMAIN).unwrap();
        descriptor.set_name(name);
        descriptor.set_uuid(&Uuid::new_v4());
        descriptor
            .set_first_qcow2_source(&format!("/var/lib/libvirt/images/{}.qcow2", name))
            .unwrap();
        self.state.lock().unwrap().domains.insert(
            name.to_string(),
            FakeDomain {
                xml: descriptor.to_xml().unwrap(),
                state,
                autostart: false,
                persistent: true,
                lease_hostname: None,
                addresses: Vec::new(),
            },
        );
        self
    }

    pub(crate) fn domain(&self, name: &str) -> Option<FakeDomain> {
        self.state.lock().unwrap().domains.get(name).cloned()
    }

    pub(crate) fn update<F: FnOnce(&mut FakeHypervisor)>(&self, f: F) {
        f(&mut self.state.lock().unwrap())
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }
}

impl Connector for FakeConnector {
    type Connection = FakeConnection;

    fn connect(&self, uri: &str) -> Result<FakeConnection> {
        let mut state = self.state.lock().unwrap();
        if state.fail_connect {
            return Err(PilotError::Connection {
                uri: uri.to_string(),
                reason: "refused".to_string(),
            });
        }
        state.connects += 1;
        state.alive = true;
        Ok(FakeConnection {
            state: self.state.clone(),
            uri: uri.to_string(),
            closed: false,
        })
    }
}

#[derive(Debug)]
pub(crate) struct FakeConnection {
    state: Arc<Mutex<FakeHypervisor>>,
    uri: String,
    closed: bool,
}

impl FakeConnection {
    fn with_domain<T, F: FnOnce(&mut FakeDomain) -> T>(&self, name: &str, f: F) -> Result<T> {
        let mut state = self.state.lock().unwrap();
        if state.fail_lookup.contains(name) {
            return Err(PilotError::Hypervisor("internal error".to_string()));
        }
        state
            .domains
            .get_mut(name)
            .map(f)
            .ok_or_else(|| PilotError::NotFound(name.to_string()))
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }
}

impl Connection for FakeConnection {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn is_alive(&self) -> bool {
        !self.closed && self.state.lock().unwrap().alive
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }

    fn list_domains(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().unwrap().domains.keys().cloned().collect())
    }

    fn lookup(&self, name: &str) -> Result<Uuid> {
        let xml = self.with_domain(name, |d| d.xml.clone())?;
        DomainDescriptor::parse(&xml)?.uuid()
    }

    fn state(&self, name: &str) -> Result<DomainState> {
        self.with_domain(name, |d| d.state)
    }

    fn xml_desc(&self, name: &str) -> Result<String> {
        self.with_domain(name, |d| d.xml.clone())
    }

    fn define_xml(&self, xml: &str) -> Result<()> {
        let descriptor = DomainDescriptor::parse(xml)?;
        let name = descriptor
            .name()
            .ok_or_else(|| PilotError::Descriptor("no name".to_string()))?;
        self.record(format!("define {}", name));
        let mut state = self.state.lock().unwrap();
        if state.fail_define.contains(&name) {
            return Err(PilotError::Hypervisor(format!("cannot define {}", name)));
        }
        state.domains.insert(
            name,
            FakeDomain {
                xml: xml.to_string(),
                state: DomainState::Shutoff,
                autostart: false,
                persistent: true,
                lease_hostname: None,
                addresses: Vec::new(),
            },
        );
        Ok(())
    }

    fn create(&self, name: &str) -> Result<()> {
        self.with_domain(name, |d| d.state = DomainState::Running)?;
        self.record(format!("start {}", name));
        Ok(())
    }

    fn destroy(&self, name: &str) -> Result<()> {
        self.with_domain(name, |d| d.state = DomainState::Shutoff)?;
        self.record(format!("destroy {}", name));
        Ok(())
    }

    fn undefine(&self, name: &str) -> Result<()> {
        self.with_domain(name, |_| ())?;
        self.state.lock().unwrap().domains.remove(name);
        self.record(format!("undefine {}", name));
        Ok(())
    }

    fn autostart(&self, name: &str) -> Result<bool> {
        self.with_domain(name, |d| d.autostart)
    }

    fn persistent(&self, name: &str) -> Result<bool> {
        self.with_domain(name, |d| d.persistent)
    }

    fn lease_hostname(&self, name: &str) -> Result<String> {
        self.with_domain(name, |d| d.lease_hostname.clone())?
            .ok_or_else(|| PilotError::Hypervisor("no lease".to_string()))
    }

    fn interface_addresses(&self, name: &str) -> Result<Vec<InterfaceAddress>> {
        self.with_domain(name, |d| d.addresses.clone())
    }

    fn block_capacity(&self, name: &str, _path: &str) -> Result<u64> {
        self.with_domain(name, |_| 10 * 1024 * 1024 * 1024)
    }
}

pub(crate) fn address(interface: &str, ip: &str) -> InterfaceAddress {
    InterfaceAddress {
        interface: interface.to_string(),
        address: ip.parse::<IpAddr>().unwrap(),
    }
}
