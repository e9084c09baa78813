//! # Boot media
//!
//! Builds the NoCloud seed image read by cloud-init on first boot. The
//! `user-data` file is always rendered, `meta-data` and `network-config`
//! only when their templates are loaded. The files are packed in that order
//! into an ISO image labelled `cidata`.
use std::path::{Path, PathBuf};

use serde_json::json;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::{
    error::Result,
    executor::{run_captured, Execute},
    models::VmSpec,
    template::{
        Render, TemplateVars, META_DATA_TEMPLATE, NETWORK_CONFIG_TEMPLATE, USER_DATA_TEMPLATE,
    },
};

pub const ISO_TOOL: &str = "genisoimage";
/// Volume label cloud-init looks for
pub const VOLUME_ID: &str = "cidata";

/// Variables handed to the cloud-init templates.
///
/// List values (`users`, `runcmd`, `nameservers`) are JSON encoded, which
/// YAML accepts as flow sequences.
pub fn boot_media_vars(spec: &VmSpec, instance_id: &Uuid) -> TemplateVars {
    let users: Vec<_> = spec
        .users
        .iter()
        .map(|user| {
            let mut entry = json!({
                "name": user.name,
                "ssh_authorized_keys": user.ssh_authorized_keys,
                "shell": "/bin/bash",
                "sudo": "ALL=(ALL) NOPASSWD:ALL",
                "lock_passwd": user.password_hash.is_none(),
            });
            if let Some(hash) = &user.password_hash {
                entry["passwd"] = json!(hash);
            }
            entry
        })
        .collect();

    let mut vars = TemplateVars::new();
    vars.insert("hostname".to_string(), spec.name.clone());
    vars.insert("name".to_string(), spec.name.clone());
    vars.insert("instance_id".to_string(), instance_id.to_string());
    vars.insert("role".to_string(), spec.role.clone());
    vars.insert("bridge".to_string(), spec.bridge.clone());
    vars.insert(
        "package_update".to_string(),
        spec.package_update.to_string(),
    );
    vars.insert(
        "package_upgrade".to_string(),
        spec.package_upgrade.to_string(),
    );
    vars.insert("users".to_string(), json!(users).to_string());
    vars.insert("runcmd".to_string(), json!(spec.commands).to_string());

    let network = spec.network.as_ref();
    vars.insert(
        "address".to_string(),
        network.map(|n| n.address.clone()).unwrap_or_default(),
    );
    vars.insert(
        "gateway".to_string(),
        network.and_then(|n| n.gateway.clone()).unwrap_or_default(),
    );
    vars.insert(
        "nameservers".to_string(),
        json!(network.map(|n| n.nameservers.clone()).unwrap_or_default()).to_string(),
    );
    vars
}

/// Render the cloud-init files of `spec` and pack them into `output`
#[instrument(skip_all, fields(vm = %spec.name))]
pub fn create_boot_media(
    executor: &dyn Execute,
    templates: &dyn Render,
    spec: &VmSpec,
    instance_id: &Uuid,
    output: &Path,
) -> Result<()> {
    let workdir = tempfile::Builder::new()
        .prefix("virtpilot-cidata-")
        .tempdir()?;
    let vars = boot_media_vars(spec, instance_id);

    let mut files: Vec<PathBuf> = Vec::new();
    for (name, required) in [
        (USER_DATA_TEMPLATE, true),
        (META_DATA_TEMPLATE, false),
        (NETWORK_CONFIG_TEMPLATE, false),
    ] {
        if !required && !templates.has_template(name) {
            debug!("No {} template loaded, skipping", name);
            continue;
        }
        let path = workdir.path().join(name);
        templates.render_to_file(name, &vars, &path)?;
        files.push(path);
    }

    let mut args = vec![
        "-output".to_string(),
        output.display().to_string(),
        "-volid".to_string(),
        VOLUME_ID.to_string(),
        "-joliet".to_string(),
        "-r".to_string(),
    ];
    args.extend(files.iter().map(|f| f.display().to_string()));

    info!("Packing {} cloud-init file(s) into {}", files.len(), output.display());
    run_captured(executor, ISO_TOOL, &args)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::PilotError,
        models::{NetworkConfig, UserConfig},
        template::Templates,
        testing::RecordingExecutor,
    };
    use pretty_assertions::assert_eq;

    fn spec() -> VmSpec {
        VmSpec {
            name: "node-1".to_string(),
            vcpus: 2,
            memory_mb: 2048,
            disk_path: PathBuf::from("/var/lib/libvirt/images/node-1.qcow2"),
            disk_size_gb: 20,
            base_image: PathBuf::from("/img/base.qcow2"),
            bridge: "br0".to_string(),
            boot_media_path: Some(PathBuf::from("/var/lib/libvirt/images/node-1-cidata.iso")),
            mounts: Vec::new(),
            role: "master".to_string(),
            package_update: true,
            package_upgrade: false,
            commands: vec!["systemctl enable --now qemu-guest-agent".to_string()],
            users: vec![UserConfig {
                name: "ops".to_string(),
                ssh_authorized_keys: vec!["ssh-ed25519 AAAA ops@host".to_string()],
                password_hash: None,
            }],
            network: Some(NetworkConfig {
                address: "10.0.0.5/24".to_string(),
                gateway: Some("10.0.0.1".to_string()),
                nameservers: vec!["1.1.1.1".to_string()],
            }),
            tuning: None,
        }
    }

    #[test]
    fn packs_user_and_meta_data_in_order() {
        let executor = RecordingExecutor::new();
        let instance_id = Uuid::new_v4();
        let output = PathBuf::from("/var/lib/libvirt/images/node-1-cidata.iso");
        create_boot_media(
            &executor,
            &Templates::builtin(),
            &spec(),
            &instance_id,
            &output,
        )
        .unwrap();

        let commands = executor.commands();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].starts_with(
            "genisoimage -output /var/lib/libvirt/images/node-1-cidata.iso -volid cidata -joliet -r "
        ));

        let inputs = executor.iso_inputs();
        let names: Vec<&str> = inputs.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["user-data", "meta-data"]);
        assert!(inputs[0].1.starts_with("#cloud-config\nhostname: node-1\n"));
        assert!(inputs[0].1.contains("package_update: true"));
        assert!(inputs[0].1.contains(r#""ssh_authorized_keys":["ssh-ed25519 AAAA ops@host"]"#));
        assert_eq!(
            inputs[1].1,
            format!("instance-id: {}\nlocal-hostname: node-1\n", instance_id)
        );
        assert!(executor.has_file("/var/lib/libvirt/images/node-1-cidata.iso"));
    }

    #[test]
    fn network_config_rendered_when_loaded() {
        let executor = RecordingExecutor::new();
        let templates = Templates::builtin().with_template(
            NETWORK_CONFIG_TEMPLATE,
            "version: 2\naddress: {address}\ngateway: {gateway}\n",
        );
        create_boot_media(
            &executor,
            &templates,
            &spec(),
            &Uuid::new_v4(),
            Path::new("/tmp/seed.iso"),
        )
        .unwrap();
        let inputs = executor.iso_inputs();
        assert_eq!(inputs.len(), 3);
        assert_eq!(inputs[2].0, "network-config");
        assert_eq!(inputs[2].1, "version: 2\naddress: 10.0.0.5/24\ngateway: 10.0.0.1\n");
    }

    #[test]
    fn user_data_is_required() {
        let executor = RecordingExecutor::new();
        let templates = Templates::new().with_template(META_DATA_TEMPLATE, "x");
        let err = create_boot_media(
            &executor,
            &templates,
            &spec(),
            &Uuid::new_v4(),
            Path::new("/tmp/seed.iso"),
        )
        .unwrap_err();
        assert!(matches!(err, PilotError::Template { .. }));
        assert!(executor.commands().is_empty());
    }

    #[test]
    fn password_hash_unlocks_password_login() {
        let mut spec = spec();
        spec.users[0].password_hash = Some("$6$salt$hash".to_string());
        let vars = boot_media_vars(&spec, &Uuid::new_v4());
        assert!(vars["users"].contains(r#""lock_passwd":false"#));
        assert!(vars["users"].contains(r#""passwd":"$6$salt$hash""#));
    }
}
