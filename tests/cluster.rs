use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use tempfile::{tempdir, TempDir};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use virtpilot::builder::{vm::VmSpecBuilder, Builder};
use virtpilot::connection::ConnectionManager;
use virtpilot::executor::{Execute, ExecuteError};
use virtpilot::hypervisor::{Connection, Connector, DomainDescriptor, InterfaceAddress};
use virtpilot::models::{DomainState, VmSpec};
use virtpilot::orchestrator::Orchestrator;
use virtpilot::template::Templates;
use virtpilot::{PilotError, Result};

/// Creates empty files where `qemu-img` and `genisoimage` would write
#[derive(Debug)]
struct ScratchExecutor {
    fail_on: Option<String>,
    /// The failing command writes its output before exiting non-zero
    partial_write: bool,
}

impl Execute for ScratchExecutor {
    fn name(&self) -> &str {
        "scratch"
    }

    fn execute(
        &self,
        command: &str,
        args: &[String],
        _stdout: &mut (dyn Write + Send),
        _stderr: &mut (dyn Write + Send),
    ) -> std::result::Result<(), ExecuteError> {
        let failing = self.fail_on.as_deref() == Some(command);
        if failing && !self.partial_write {
            return Err(exit_failure(command));
        }
        let target = match command {
            "qemu-img" => args.get(args.len() - 2).cloned(),
            "genisoimage" => args
                .iter()
                .position(|a| a == "-output")
                .and_then(|i| args.get(i + 1).cloned()),
            "rm" => {
                if let Some(path) = args.last() {
                    let _ = fs::remove_file(path);
                }
                None
            }
            _ => None,
        };
        if let Some(path) = target {
            fs::write(path, b"").map_err(|source| ExecuteError::Spawn {
                command: command.to_string(),
                source,
            })?;
        }
        if failing {
            return Err(exit_failure(command));
        }
        Ok(())
    }
}

fn exit_failure(command: &str) -> ExecuteError {
    ExecuteError::ExitStatus {
        command: command.to_string(),
        code: 1,
        stdout: String::new(),
        stderr: String::new(),
    }
}

#[derive(Debug, Default)]
struct Domains {
    xml: BTreeMap<String, (String, DomainState)>,
    refuse: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct MemoryConnector(Arc<Mutex<Domains>>);

#[derive(Debug)]
struct MemoryConnection(Arc<Mutex<Domains>>);

impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    fn connect(&self, _uri: &str) -> Result<MemoryConnection> {
        Ok(MemoryConnection(self.0.clone()))
    }
}

impl MemoryConnection {
    fn get(&self, name: &str) -> Result<(String, DomainState)> {
        self.0
            .lock()
            .unwrap()
            .xml
            .get(name)
            .cloned()
            .ok_or_else(|| PilotError::NotFound(name.to_string()))
    }
}

impl Connection for MemoryConnection {
    fn uri(&self) -> &str {
        "memory:///"
    }

    fn is_alive(&self) -> bool {
        true
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn list_domains(&self) -> Result<Vec<String>> {
        Ok(self.0.lock().unwrap().xml.keys().cloned().collect())
    }

    fn lookup(&self, name: &str) -> Result<Uuid> {
        DomainDescriptor::parse(&self.get(name)?.0)?.uuid()
    }

    fn state(&self, name: &str) -> Result<DomainState> {
        Ok(self.get(name)?.1)
    }

    fn xml_desc(&self, name: &str) -> Result<String> {
        Ok(self.get(name)?.0)
    }

    fn define_xml(&self, xml: &str) -> Result<()> {
        let name = DomainDescriptor::parse(xml)?
            .name()
            .ok_or_else(|| PilotError::Descriptor("unnamed domain".to_string()))?;
        let mut domains = self.0.lock().unwrap();
        if domains.refuse.as_deref() == Some(name.as_str()) {
            return Err(PilotError::Hypervisor(format!("refusing {}", name)));
        }
        domains
            .xml
            .insert(name, (xml.to_string(), DomainState::Shutoff));
        Ok(())
    }

    fn create(&self, name: &str) -> Result<()> {
        self.get(name)?;
        if let Some(domain) = self.0.lock().unwrap().xml.get_mut(name) {
            domain.1 = DomainState::Running;
        }
        Ok(())
    }

    fn destroy(&self, name: &str) -> Result<()> {
        self.get(name)?;
        if let Some(domain) = self.0.lock().unwrap().xml.get_mut(name) {
            domain.1 = DomainState::Shutoff;
        }
        Ok(())
    }

    fn undefine(&self, name: &str) -> Result<()> {
        self.get(name)?;
        self.0.lock().unwrap().xml.remove(name);
        Ok(())
    }

    fn autostart(&self, _name: &str) -> Result<bool> {
        Ok(false)
    }

    fn persistent(&self, _name: &str) -> Result<bool> {
        Ok(true)
    }

    fn lease_hostname(&self, name: &str) -> Result<String> {
        Ok(name.to_string())
    }

    fn interface_addresses(&self, _name: &str) -> Result<Vec<InterfaceAddress>> {
        Ok(vec![InterfaceAddress {
            interface: "vnet0".to_string(),
            address: "192.168.122.50".parse().unwrap(),
        }])
    }

    fn block_capacity(&self, _name: &str, _path: &str) -> Result<u64> {
        Ok(20 * 1024 * 1024 * 1024)
    }
}

fn init_logs() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn spec(dir: &Path, name: &str) -> VmSpec {
    VmSpecBuilder::new()
        .with_name(name.to_string())
        .with_vcpus(2)
        .with_memory_mb(1024)
        .with_disk(dir.join(format!("{}.qcow2", name)), 20)
        .with_base_image(PathBuf::from("/var/lib/libvirt/images/jammy.qcow2"))
        .with_bridge("br0".to_string())
        .with_boot_media(dir.join(format!("{}-cidata.iso", name)))
        .try_build()
        .unwrap()
}

fn setup(
    fail_on: Option<&str>,
    partial_write: bool,
) -> (
    Orchestrator<MemoryConnector, ScratchExecutor>,
    MemoryConnector,
    TempDir,
) {
    init_logs();
    let connector = MemoryConnector::default();
    let executor = ScratchExecutor {
        fail_on: fail_on.map(str::to_string),
        partial_write,
    };
    let manager = ConnectionManager::with_executor(connector.clone(), "memory:///", executor)
        .unwrap();
    let orchestrator = Orchestrator::new(Arc::new(manager), Arc::new(Templates::builtin()));
    (orchestrator, connector, tempdir().unwrap())
}

fn files_in(dir: &Path) -> Vec<String> {
    let mut files: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    files.sort();
    files
}

#[test]
fn test_cluster_lifecycle() {
    let (orchestrator, connector, dir) = setup(None, false);
    let cancel = CancellationToken::new();

    orchestrator
        .create_cluster(&[spec(dir.path(), "n1"), spec(dir.path(), "n2")], &cancel)
        .unwrap();
    assert_eq!(
        files_in(dir.path()),
        vec!["n1-cidata.iso", "n1.qcow2", "n2-cidata.iso", "n2.qcow2"]
    );

    orchestrator.start_cluster(&["n1"], &cancel).unwrap();
    let (vms, result) = orchestrator.query_cluster(&["n1", "n2"], &cancel);
    result.unwrap();
    assert_eq!(vms[0].state, DomainState::Running);
    assert_eq!(vms[0].hostname.as_deref(), Some("n1"));
    assert_eq!(vms[0].ip, Some("192.168.122.50".parse().unwrap()));
    assert_eq!(vms[1].state, DomainState::Shutoff);
    assert_eq!(vms[1].ip, None);
    assert_eq!(vms[1].memory_mb, 1024);

    orchestrator.delete_cluster(&["n1", "n2"], &cancel).unwrap();
    assert!(connector.0.lock().unwrap().xml.is_empty());
    assert!(files_in(dir.path()).is_empty());
}

#[test]
fn test_failed_vm_leaves_no_files() {
    let (orchestrator, connector, dir) = setup(None, false);
    connector.0.lock().unwrap().refuse = Some("bad".to_string());

    let err = orchestrator
        .create_cluster(
            &[spec(dir.path(), "ok"), spec(dir.path(), "bad")],
            &CancellationToken::new(),
        )
        .unwrap_err();

    assert_eq!(err.failed_items(), vec!["bad"]);
    assert_eq!(err.to_string(), "create failed for: bad");
    assert_eq!(files_in(dir.path()), vec!["ok-cidata.iso", "ok.qcow2"]);
}

#[test]
fn test_failed_boot_media_removes_disk() {
    let (orchestrator, connector, dir) = setup(Some("genisoimage"), false);

    let err = orchestrator
        .create_cluster(&[spec(dir.path(), "n1")], &CancellationToken::new())
        .unwrap_err();

    assert!(matches!(err, PilotError::PartialBatch { .. }));
    assert!(files_in(dir.path()).is_empty());
    assert!(connector.0.lock().unwrap().xml.is_empty());
}

#[test]
fn test_partially_written_outputs_are_removed() {
    for command in ["qemu-img", "genisoimage"] {
        let (orchestrator, connector, dir) = setup(Some(command), true);

        let err = orchestrator
            .create_cluster(&[spec(dir.path(), "n1")], &CancellationToken::new())
            .unwrap_err();

        assert_eq!(err.to_string(), "create failed for: n1");
        assert!(files_in(dir.path()).is_empty(), "{} left files behind", command);
        assert!(connector.0.lock().unwrap().xml.is_empty());
    }
}
