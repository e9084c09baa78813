//! # Templates
//!
//! Cloud-init files and domain descriptors are rendered from named templates
//! using [strfmt](https://docs.rs/strfmt) placeholders (`{name}`). Literal
//! braces are written `{{` and `}}`.
//!
//! [Templates::builtin] provides `domain.xml`, `user-data` and `meta-data`.
//! A `network-config` template is only rendered when one was loaded, either
//! with [Templates::with_template] or from a directory with
//! [Templates::from_dir].
use std::{collections::HashMap, fmt::Debug, path::Path};

use tracing::debug;

use crate::error::{PilotError, Result};

pub const DOMAIN_TEMPLATE: &str = "domain.xml";
pub const USER_DATA_TEMPLATE: &str = "user-data";
pub const META_DATA_TEMPLATE: &str = "meta-data";
pub const NETWORK_CONFIG_TEMPLATE: &str = "network-config";

/// Variables available to a template
pub type TemplateVars = HashMap<String, String>;

/// Render a named template with a bag of variables
pub trait Render: Debug + Send + Sync {
    fn has_template(&self, name: &str) -> bool;

    fn render(&self, name: &str, vars: &TemplateVars) -> Result<String>;

    fn render_to_file(&self, name: &str, vars: &TemplateVars, path: &Path) -> Result<()> {
        let rendered = self.render(name, vars)?;
        std::fs::write(path, rendered)?;
        Ok(())
    }
}

const BUILTIN_DOMAIN: &str = r#"<domain type='kvm'>
  <name>{name}</name>
  <uuid>{uuid}</uuid>
  <memory unit='KiB'>{memory_kib}</memory>
  <currentMemory unit='KiB'>{memory_kib}</currentMemory>
  <vcpu placement='static'>{vcpus}</vcpu>
{cputune}{numatune}  <os>
    <type arch='x86_64' machine='q35'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  <cpu mode='host-passthrough'/>
  <clock offset='utc'/>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{disk_path}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
{boot_media}{filesystems}    <interface type='bridge'>
      <source bridge='{bridge}'/>
      <model type='virtio'/>
    </interface>
    <serial type='pty'/>
    <console type='pty'/>
    <channel type='unix'>
      <target type='virtio' name='org.qemu.guest_agent.0'/>
    </channel>
  </devices>
</domain>
"#;

const BUILTIN_USER_DATA: &str = r#"#cloud-config
hostname: {hostname}
package_update: {package_update}
package_upgrade: {package_upgrade}
users: {users}
runcmd: {runcmd}
"#;

const BUILTIN_META_DATA: &str = r#"instance-id: {instance_id}
local-hostname: {hostname}
"#;

/// In-memory set of named templates
#[derive(Debug, Clone, Default)]
pub struct Templates {
    templates: HashMap<String, String>,
}

impl Templates {
    /// Empty set, nothing can be rendered until templates are added
    pub fn new() -> Templates {
        Templates::default()
    }

    /// Domain descriptor, `user-data` and `meta-data` templates
    pub fn builtin() -> Templates {
        Templates::new()
            .with_template(DOMAIN_TEMPLATE, BUILTIN_DOMAIN)
            .with_template(USER_DATA_TEMPLATE, BUILTIN_USER_DATA)
            .with_template(META_DATA_TEMPLATE, BUILTIN_META_DATA)
    }

    /// Load every file of `dir` on top of the builtin set. The template name
    /// is the file name without a trailing `.tmpl`.
    pub fn from_dir(dir: &Path) -> Result<Templates> {
        let mut templates = Templates::builtin();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let file_name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            let name = file_name.strip_suffix(".tmpl").unwrap_or(file_name);
            debug!("Loading template {} from {}", name, path.display());
            let body = std::fs::read_to_string(&path)?;
            templates = templates.with_template(name, &body);
        }
        Ok(templates)
    }

    pub fn with_template(mut self, name: &str, body: &str) -> Templates {
        self.templates.insert(name.to_string(), body.to_string());
        self
    }
}

impl Render for Templates {
    fn has_template(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    fn render(&self, name: &str, vars: &TemplateVars) -> Result<String> {
        let template = self.templates.get(name).ok_or_else(|| PilotError::Template {
            name: name.to_string(),
            reason: "template is not loaded".to_string(),
        })?;
        strfmt::strfmt(template, vars).map_err(|e| PilotError::Template {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }
}
