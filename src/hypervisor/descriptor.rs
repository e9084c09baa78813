//! Structured view over a libvirt domain XML document.
use std::fmt::Write as _;

use uuid::Uuid;
use xmltree::{Element, EmitterConfig, XMLNode};

use crate::{
    error::{PilotError, Result},
    models::{DiskInfo, ResolvedTuning},
};

/// Parsed domain XML that can be inspected, mutated and written back whole
#[derive(Debug, Clone)]
pub struct DomainDescriptor {
    root: Element,
}

fn text_of(element: &Element) -> Option<String> {
    element.get_text().map(|t| t.trim().to_string())
}

fn set_text(element: &mut Element, value: &str) {
    element.children = vec![XMLNode::Text(value.to_string())];
}

/// Size in bytes of a libvirt memory unit
fn unit_bytes(unit: &str) -> Option<u128> {
    let bytes = match unit {
        "b" | "bytes" => 1,
        "KB" => 1000,
        "k" | "KiB" => 1 << 10,
        "MB" => 1000u128.pow(2),
        "M" | "MiB" => 1 << 20,
        "GB" => 1000u128.pow(3),
        "G" | "GiB" => 1 << 30,
        "TB" => 1000u128.pow(4),
        "T" | "TiB" => 1 << 40,
        "PB" => 1000u128.pow(5),
        "P" | "PiB" => 1 << 50,
        "EB" => 1000u128.pow(6),
        "E" | "EiB" => 1 << 60,
        _ => return None,
    };
    Some(bytes)
}

/// Convert a libvirt memory amount to KiB, rounding down
fn to_kib(value: u64, unit: &str) -> Result<u64> {
    let bytes = unit_bytes(unit)
        .ok_or_else(|| PilotError::Descriptor(format!("unknown memory unit {}", unit)))?;
    u128::from(value)
        .checked_mul(bytes)
        .and_then(|total| u64::try_from(total / 1024).ok())
        .ok_or_else(|| {
            PilotError::Descriptor(format!("memory amount {} {} is out of range", value, unit))
        })
}

impl DomainDescriptor {
    pub fn parse(xml: &str) -> Result<DomainDescriptor> {
        let root = Element::parse(xml.as_bytes())
            .map_err(|e| PilotError::Descriptor(e.to_string()))?;
        if root.name != "domain" {
            return Err(PilotError::Descriptor(format!(
                "expected a <domain> root, found <{}>",
                root.name
            )));
        }
        Ok(DomainDescriptor { root })
    }

    pub fn to_xml(&self) -> Result<String> {
        let mut out = Vec::new();
        let config = EmitterConfig::new()
            .perform_indent(true)
            .write_document_declaration(false);
        self.root
            .write_with_config(&mut out, config)
            .map_err(|e| PilotError::Descriptor(e.to_string()))?;
        String::from_utf8(out).map_err(|e| PilotError::Descriptor(e.to_string()))
    }

    fn child_text(&self, name: &str) -> Option<String> {
        self.root.get_child(name).and_then(text_of)
    }

    fn child_mut(&mut self, name: &str) -> &mut Element {
        if self.root.get_child(name).is_none() {
            self.root
                .children
                .push(XMLNode::Element(Element::new(name)));
        }
        // The child was inserted above when missing
        match self.root.get_mut_child(name) {
            Some(child) => child,
            None => unreachable!("child {} was just inserted", name),
        }
    }

    pub fn name(&self) -> Option<String> {
        self.child_text("name")
    }

    pub fn uuid(&self) -> Result<Uuid> {
        let raw = self
            .child_text("uuid")
            .ok_or_else(|| PilotError::Descriptor("domain has no <uuid>".to_string()))?;
        Uuid::parse_str(&raw).map_err(|e| PilotError::Descriptor(e.to_string()))
    }

    pub fn vcpus(&self) -> Result<u32> {
        let raw = self
            .child_text("vcpu")
            .ok_or_else(|| PilotError::Descriptor("domain has no <vcpu>".to_string()))?;
        raw.parse()
            .map_err(|_| PilotError::Descriptor(format!("invalid vcpu count {}", raw)))
    }

    /// Maximum memory of the domain in KiB
    pub fn memory_kib(&self) -> Result<u64> {
        let memory = self
            .root
            .get_child("memory")
            .ok_or_else(|| PilotError::Descriptor("domain has no <memory>".to_string()))?;
        let raw = text_of(memory).unwrap_or_default();
        let value = raw
            .parse()
            .map_err(|_| PilotError::Descriptor(format!("invalid memory amount {}", raw)))?;
        let unit = memory.attributes.get("unit").map(String::as_str).unwrap_or("KiB");
        to_kib(value, unit)
    }

    pub fn set_name(&mut self, name: &str) {
        set_text(self.child_mut("name"), name);
    }

    pub fn set_uuid(&mut self, uuid: &Uuid) {
        set_text(self.child_mut("uuid"), &uuid.to_string());
    }

    pub fn set_vcpus(&mut self, vcpus: u32) {
        set_text(self.child_mut("vcpu"), &vcpus.to_string());
    }

    /// Set both `<memory>` and `<currentMemory>`, in KiB
    pub fn set_memory_kib(&mut self, kib: u64) {
        for name in ["memory", "currentMemory"] {
            let element = self.child_mut(name);
            element
                .attributes
                .insert("unit".to_string(), "KiB".to_string());
            set_text(element, &kib.to_string());
        }
    }

    fn disk_elements(&self) -> impl Iterator<Item = &Element> {
        self.root
            .get_child("devices")
            .into_iter()
            .flat_map(|devices| devices.children.iter())
            .filter_map(|node| match node {
                XMLNode::Element(e) if e.name == "disk" => Some(e),
                _ => None,
            })
    }

    fn driver_type(disk: &Element) -> Option<&str> {
        disk.get_child("driver")
            .and_then(|d| d.attributes.get("type"))
            .map(String::as_str)
    }

    /// File backed disks, other disk sources are skipped
    pub fn disks(&self) -> Vec<DiskInfo> {
        self.disk_elements()
            .filter_map(|disk| {
                let path = disk.get_child("source")?.attributes.get("file")?.clone();
                Some(DiskInfo {
                    path,
                    format: Self::driver_type(disk).unwrap_or_default().to_string(),
                    device: disk
                        .attributes
                        .get("device")
                        .cloned()
                        .unwrap_or_else(|| "disk".to_string()),
                    size_bytes: None,
                })
            })
            .collect()
    }

    /// Source file of the first qcow2 disk
    pub fn first_qcow2_source(&self) -> Option<String> {
        self.disk_elements()
            .filter(|disk| Self::driver_type(disk) == Some("qcow2"))
            .find_map(|disk| disk.get_child("source")?.attributes.get("file").cloned())
    }

    /// Point the first qcow2 disk at another file
    pub fn set_first_qcow2_source(&mut self, path: &str) -> Result<()> {
        let disk = self
            .root
            .get_mut_child("devices")
            .into_iter()
            .flat_map(|devices| devices.children.iter_mut())
            .filter_map(|node| match node {
                XMLNode::Element(e) if e.name == "disk" => Some(e),
                _ => None,
            })
            .find(|disk| Self::driver_type(disk) == Some("qcow2"))
            .ok_or_else(|| PilotError::Descriptor("domain has no qcow2 disk".to_string()))?;

        if disk.get_child("source").is_none() {
            disk.children.push(XMLNode::Element(Element::new("source")));
        }
        if let Some(source) = disk.get_mut_child("source") {
            source
                .attributes
                .insert("file".to_string(), path.to_string());
        }
        Ok(())
    }
}

/// Escape a value inserted in XML text or attributes
pub(crate) fn xml_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '\'' => escaped.push_str("&apos;"),
            '"' => escaped.push_str("&quot;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// `<cputune>` block, empty when nothing is pinned
pub(crate) fn cputune_fragment(tuning: &ResolvedTuning) -> String {
    if tuning.pins.is_empty() && tuning.emulator_pin.is_none() {
        return String::new();
    }
    let mut xml = String::from("  <cputune>\n");
    for pin in &tuning.pins {
        let _ = writeln!(
            xml,
            "    <vcpupin vcpu='{}' cpuset='{}'/>",
            pin.vcpu,
            xml_escape(&pin.cpuset)
        );
    }
    if let Some(emulator) = &tuning.emulator_pin {
        let _ = writeln!(xml, "    <emulatorpin cpuset='{}'/>", xml_escape(emulator));
    }
    xml.push_str("  </cputune>\n");
    xml
}

/// `<numatune>` block, empty without NUMA placement
pub(crate) fn numatune_fragment(tuning: &ResolvedTuning) -> String {
    match &tuning.numa {
        Some((nodeset, mode)) => format!(
            "  <numatune>\n    <memory mode='{}' nodeset='{}'/>\n  </numatune>\n",
            mode.as_str(),
            xml_escape(nodeset)
        ),
        None => String::new(),
    }
}

#[cfg(test)]
pub(crate) const SAMPLE_DOMAIN: &str = r#"<domain type='kvm'>
  <name>base</name>
  <uuid>5f0a6c3e-8c1a-4d8e-9a39-2f7c0b1d9e11</uuid>
  <memory unit='MiB'>2048</memory>
  <currentMemory unit='MiB'>2048</currentMemory>
  <vcpu placement='static'>2</vcpu>
  <os>
    <type arch='x86_64' machine='q35'>hvm</type>
  </os>
  <devices>
    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='/var/lib/libvirt/images/base-cidata.iso'/>
      <target dev='sda' bus='sata'/>
      <readonly/>
    </disk>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='/var/lib/libvirt/images/base.qcow2'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='network' device='disk'>
      <driver name='qemu' type='raw'/>
      <source protocol='rbd' name='pool/image'/>
      <target dev='vdb' bus='virtio'/>
    </disk>
    <interface type='bridge'>
      <mac address='52:54:00:aa:bb:cc'/>
      <source bridge='br0'/>
    </interface>
  </devices>
</domain>"#;
