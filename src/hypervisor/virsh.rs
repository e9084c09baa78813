use std::{io::Write, net::IpAddr, path::PathBuf};

use tracing::{debug, instrument, trace};
use uuid::Uuid;

use crate::{
    error::{PilotError, Result},
    executor::{run_captured, ExecuteError, LocalExecutor},
    models::DomainState,
};

use super::{Connection, Connector, InterfaceAddress};

/// Messages printed by virsh when a domain does not exist
const NOT_FOUND_MARKERS: [&str; 3] = [
    "failed to get domain",
    "Domain not found",
    "no domain with matching name",
];

fn is_not_found(err: &ExecuteError) -> bool {
    match err {
        ExecuteError::ExitStatus { stderr, .. } => {
            NOT_FOUND_MARKERS.iter().any(|marker| stderr.contains(marker))
        }
        _ => false,
    }
}

/// Opens [VirshConnection]s with a given `virsh` binary
#[derive(Debug, Clone)]
pub struct VirshConnector {
    pub virsh_binary: PathBuf,
}

impl Default for VirshConnector {
    fn default() -> Self {
        VirshConnector {
            virsh_binary: PathBuf::from("virsh"),
        }
    }
}

impl Connector for VirshConnector {
    type Connection = VirshConnection;

    #[instrument(skip(self))]
    fn connect(&self, uri: &str) -> Result<VirshConnection> {
        url::Url::parse(uri).map_err(|e| PilotError::Connection {
            uri: uri.to_string(),
            reason: e.to_string(),
        })?;
        let connection = VirshConnection {
            uri: uri.to_string(),
            virsh: self.virsh_binary.display().to_string(),
            executor: LocalExecutor::new().with_name("virsh".to_string()),
            closed: false,
        };
        connection.ping().map_err(|e| PilotError::Connection {
            uri: uri.to_string(),
            reason: e.to_string(),
        })?;
        debug!("Connected to {}", uri);
        Ok(connection)
    }
}

/// Connection driven through the `virsh` command line client, every call
/// runs `virsh -c <uri> ...` on the local host.
#[derive(Debug)]
pub struct VirshConnection {
    uri: String,
    virsh: String,
    executor: LocalExecutor,
    closed: bool,
}

impl VirshConnection {
    fn run(&self, args: &[&str]) -> Result<String, ExecuteError> {
        let mut full = vec!["-c".to_string(), self.uri.clone()];
        full.extend(args.iter().map(|a| a.to_string()));
        let output = run_captured(&self.executor, &self.virsh, &full)?;
        trace!("virsh {:?}: {}", args, output.stdout);
        Ok(output.stdout)
    }

    /// Run a command about a single domain, mapping "no such domain" errors
    fn run_domain(&self, name: &str, args: &[&str]) -> Result<String> {
        self.run(args).map_err(|e| {
            if is_not_found(&e) {
                PilotError::NotFound(name.to_string())
            } else {
                PilotError::Execute(e)
            }
        })
    }

    fn ping(&self) -> Result<(), ExecuteError> {
        self.run(&["uri"]).map(|_| ())
    }

    /// Value of a `Key: value` line of `virsh dominfo`
    fn dominfo_field(&self, name: &str, field: &str) -> Result<String> {
        let info = self.run_domain(name, &["dominfo", name])?;
        parse_field(&info, field).ok_or_else(|| {
            PilotError::Hypervisor(format!("dominfo of {} has no {} field", name, field))
        })
    }
}

fn parse_field(output: &str, field: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key.trim() == field).then(|| value.trim().to_string())
    })
}

/// Parse the table printed by `virsh domifaddr`
fn parse_domifaddr(output: &str) -> Vec<InterfaceAddress> {
    let mut current = String::new();
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| {
            let columns: Vec<&str> = line.split_whitespace().collect();
            if columns.len() < 4 {
                return None;
            }
            if columns[0] != "-" {
                current = columns[0].to_string();
            }
            let address = columns[columns.len() - 1];
            let address = address.split('/').next()?.parse::<IpAddr>().ok()?;
            Some(InterfaceAddress {
                interface: current.clone(),
                address,
            })
        })
        .collect()
}

impl Connection for VirshConnection {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn is_alive(&self) -> bool {
        !self.closed && self.ping().is_ok()
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }

    fn list_domains(&self) -> Result<Vec<String>> {
        let output = self.run(&["list", "--all", "--name"])?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn lookup(&self, name: &str) -> Result<Uuid> {
        let output = self.run_domain(name, &["domuuid", name])?;
        Uuid::parse_str(output.trim()).map_err(|e| PilotError::Hypervisor(e.to_string()))
    }

    fn state(&self, name: &str) -> Result<DomainState> {
        let output = self.run_domain(name, &["domstate", name])?;
        Ok(DomainState::from_virsh(&output))
    }

    fn xml_desc(&self, name: &str) -> Result<String> {
        self.run_domain(name, &["dumpxml", name])
    }

    fn define_xml(&self, xml: &str) -> Result<()> {
        let mut file = tempfile::Builder::new()
            .prefix("virtpilot-domain-")
            .suffix(".xml")
            .tempfile()?;
        file.write_all(xml.as_bytes())?;
        file.flush()?;
        let path = file.path().display().to_string();
        self.run(&["define", path.as_str()])?;
        Ok(())
    }

    fn create(&self, name: &str) -> Result<()> {
        self.run_domain(name, &["start", name]).map(|_| ())
    }

    fn destroy(&self, name: &str) -> Result<()> {
        self.run_domain(name, &["destroy", name]).map(|_| ())
    }

    fn undefine(&self, name: &str) -> Result<()> {
        self.run_domain(name, &["undefine", name]).map(|_| ())
    }

    fn autostart(&self, name: &str) -> Result<bool> {
        Ok(self.dominfo_field(name, "Autostart")? == "enable")
    }

    fn persistent(&self, name: &str) -> Result<bool> {
        Ok(self.dominfo_field(name, "Persistent")? == "yes")
    }

    fn lease_hostname(&self, name: &str) -> Result<String> {
        let output = self.run_domain(name, &["domhostname", name, "--source", "lease"])?;
        Ok(output.trim().to_string())
    }

    fn interface_addresses(&self, name: &str) -> Result<Vec<InterfaceAddress>> {
        let output = self.run_domain(name, &["domifaddr", name, "--source", "lease"])?;
        Ok(parse_domifaddr(&output))
    }

    fn block_capacity(&self, name: &str, path: &str) -> Result<u64> {
        let output = self.run_domain(name, &["domblkinfo", name, path])?;
        let capacity = parse_field(&output, "Capacity").ok_or_else(|| {
            PilotError::Hypervisor(format!("no capacity reported for {}", path))
        })?;
        capacity
            .parse()
            .map_err(|_| PilotError::Hypervisor(format!("invalid capacity {}", capacity)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const DOMIFADDR: &str = " Name       MAC address          Protocol     Address
-------------------------------------------------------------------------------
 vnet0      52:54:00:aa:bb:cc    ipv6         fe80::5054:ff:feaa:bbcc/64
 -          -                    ipv4         192.168.122.41/24
 vnet1      52:54:00:aa:bb:cd    ipv4         10.0.0.7/24
";

    #[test]
    fn parses_domifaddr_table() {
        let addresses = parse_domifaddr(DOMIFADDR);
        assert_eq!(addresses.len(), 3);
        assert_eq!(addresses[1].interface, "vnet0");
        assert_eq!(
            addresses[1].address,
            "192.168.122.41".parse::<IpAddr>().unwrap()
        );
        assert_eq!(addresses[2].interface, "vnet1");
    }

    #[test]
    fn parses_dominfo_fields() {
        let info = "Id:             -\nName:           node-1\nPersistent:     yes\nAutostart:      disable\n";
        assert_eq!(parse_field(info, "Persistent").as_deref(), Some("yes"));
        assert_eq!(parse_field(info, "Autostart").as_deref(), Some("disable"));
        assert_eq!(parse_field(info, "Security model"), None);
    }

    #[test]
    fn not_found_is_detected_from_stderr() {
        let err = ExecuteError::ExitStatus {
            command: "virsh".to_string(),
            code: 1,
            stdout: String::new(),
            stderr: "error: failed to get domain 'ghost'\n".to_string(),
        };
        assert!(is_not_found(&err));
        let err = ExecuteError::ExitStatus {
            command: "virsh".to_string(),
            code: 1,
            stdout: String::new(),
            stderr: "error: failed to connect to the hypervisor\n".to_string(),
        };
        assert!(!is_not_found(&err));
    }

    #[test]
    fn invalid_uri_is_a_connection_error() {
        let err = VirshConnector::default().connect("not a uri").unwrap_err();
        assert!(matches!(err, PilotError::Connection { .. }));
    }
}
