//! Proxmox VE adapter built on the `qm` and `pvesh` command-line tools.

use crate::{Platform, PlatformError, PlatformErrorKind, Resource, VmSpec};
use serde::Deserialize;
use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;
use tracing::{debug, info};

/// Captured result of one control-plane command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Executes control-plane commands. Swapped out in tests.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput>;
}

/// Runs commands on the local host.
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        let out = Command::new(program).args(args).output()?;
        Ok(CommandOutput {
            success: out.status.success(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }
}

/// A storage entry as reported by `pvesh get /nodes/<node>/storage`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageInfo {
    pub name: String,
    pub active: bool,
    pub enabled: bool,
    pub content: Vec<String>,
}

impl StorageInfo {
    /// Active, enabled, and able to hold VM disks.
    pub fn usable(&self) -> bool {
        self.active
            && self.enabled
            && self
                .content
                .iter()
                .any(|c| c == "images" || c == "rootdir")
    }
}

fn flag(v: Option<&serde_json::Value>, default: bool) -> bool {
    match v {
        Some(serde_json::Value::Number(n)) => n.as_u64() == Some(1),
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::String(s)) => s == "1",
        _ => default,
    }
}

#[derive(Deserialize)]
struct RawResource {
    vmid: Option<u32>,
    name: Option<String>,
    template: Option<serde_json::Value>,
    node: Option<String>,
}

/// Parse `pvesh get /cluster/resources --type vm --output-format json`.
pub fn parse_cluster_resources(json: &str) -> Result<Vec<Resource>, String> {
    let raw: Vec<RawResource> = serde_json::from_str(json).map_err(|e| e.to_string())?;
    Ok(raw
        .into_iter()
        .filter_map(|r| {
            let vmid = r.vmid?;
            Some(Resource {
                vmid,
                name: r.name.unwrap_or_default(),
                is_template: flag(r.template.as_ref(), false),
                node: r.node,
            })
        })
        .collect())
}

#[derive(Deserialize)]
struct RawStorage {
    storage: String,
    active: Option<serde_json::Value>,
    enabled: Option<serde_json::Value>,
    #[serde(default)]
    content: String,
}

/// Parse `pvesh get /nodes/<node>/storage --output-format json`.
pub fn parse_storages(json: &str) -> Result<Vec<StorageInfo>, String> {
    let raw: Vec<RawStorage> = serde_json::from_str(json).map_err(|e| e.to_string())?;
    Ok(raw
        .into_iter()
        .map(|s| StorageInfo {
            name: s.storage,
            active: flag(s.active.as_ref(), false),
            enabled: flag(s.enabled.as_ref(), true),
            content: s
                .content
                .split(',')
                .map(|c| c.trim().to_owned())
                .filter(|c| !c.is_empty())
                .collect(),
        })
        .collect())
}

#[derive(Deserialize)]
struct RawVolume {
    #[serde(default)]
    parent: Option<String>,
}

/// Whether any volume in a storage content listing is a linked clone of
/// `vmid`'s base disk.
pub fn parse_linked_clones(json: &str, vmid: u32) -> Result<bool, String> {
    let raw: Vec<RawVolume> = serde_json::from_str(json).map_err(|e| e.to_string())?;
    let base = format!("base-{vmid}-disk-");
    let plain = format!("vm-{vmid}-disk-");
    Ok(raw.iter().filter_map(|v| v.parent.as_deref()).any(|parent| {
        parent.ends_with("@__base__") && (parent.starts_with(&base) || parent.starts_with(&plain))
    }))
}

/// Extract the volume of `disk` (for example `scsi0`) from `qm config` output.
pub fn parse_disk_volume(config: &str, disk: &str) -> Option<String> {
    config.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim() != disk {
            return None;
        }
        let volume = value.trim().split(',').next()?.trim();
        (!volume.is_empty()).then(|| volume.to_owned())
    })
}

fn classify(stderr: &str) -> PlatformErrorKind {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("already exists") {
        PlatformErrorKind::Conflict
    } else if lower.contains("does not exist") || lower.contains("no such") {
        PlatformErrorKind::NotFound
    } else {
        PlatformErrorKind::Command
    }
}

pub struct ProxmoxPlatform {
    runner: Box<dyn CommandRunner>,
    node: OnceLock<String>,
}

impl Default for ProxmoxPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxmoxPlatform {
    pub fn new() -> Self {
        Self::with_runner(Box::new(SystemRunner))
    }

    pub fn with_runner(runner: Box<dyn CommandRunner>) -> Self {
        Self {
            runner,
            node: OnceLock::new(),
        }
    }

    /// Pin the node name instead of asking `hostname`.
    #[must_use]
    pub fn with_node(self, node: impl Into<String>) -> Self {
        let _ = self.node.set(node.into());
        self
    }

    fn exec(
        &self,
        operation: &str,
        vmid: Option<u32>,
        program: &str,
        args: &[String],
    ) -> Result<String, PlatformError> {
        debug!("{program} {}", args.join(" "));
        let out = self.runner.run(program, args).map_err(|e| {
            PlatformError::new(
                operation,
                vmid,
                PlatformErrorKind::Command,
                format!("failed to run {program}: {e}"),
            )
        })?;
        if out.success {
            Ok(out.stdout)
        } else {
            let stderr = out.stderr.trim().to_owned();
            Err(PlatformError::new(operation, vmid, classify(&stderr), stderr))
        }
    }

    fn qm(&self, operation: &str, vmid: u32, args: &[&str]) -> Result<String, PlatformError> {
        let args: Vec<String> = args.iter().map(|a| (*a).to_owned()).collect();
        self.exec(operation, Some(vmid), "qm", &args)
    }

    fn pvesh_get(&self, operation: &str, path: &str, extra: &[&str]) -> Result<String, PlatformError> {
        let mut args = vec!["get".to_owned(), path.to_owned()];
        args.extend(extra.iter().map(|a| (*a).to_owned()));
        args.extend(["--output-format".to_owned(), "json".to_owned()]);
        self.exec(operation, None, "pvesh", &args)
    }

    fn node(&self) -> Result<String, PlatformError> {
        if let Some(node) = self.node.get() {
            return Ok(node.clone());
        }
        let out = self.exec("node lookup", None, "hostname", &["--short".to_owned()])?;
        let node = out.trim().to_owned();
        if node.is_empty() {
            return Err(PlatformError::new(
                "node lookup",
                None,
                PlatformErrorKind::Parse,
                "hostname returned nothing",
            ));
        }
        let _ = self.node.set(node.clone());
        Ok(node)
    }

    pub fn storages(&self) -> Result<Vec<StorageInfo>, PlatformError> {
        let node = self.node()?;
        let json = self.pvesh_get("list storage", &format!("/nodes/{node}/storage"), &[])?;
        parse_storages(&json)
            .map_err(|e| PlatformError::new("list storage", None, PlatformErrorKind::Parse, e))
    }

    fn config(&self, vmid: u32) -> Result<String, PlatformError> {
        self.qm("read config", vmid, &["config", &vmid.to_string()])
    }
}

impl Platform for ProxmoxPlatform {
    fn name(&self) -> &'static str {
        "proxmox"
    }

    fn list_resources(&self) -> Result<Vec<Resource>, PlatformError> {
        let json = self.pvesh_get("list resources", "/cluster/resources", &["--type", "vm"])?;
        parse_cluster_resources(&json)
            .map_err(|e| PlatformError::new("list resources", None, PlatformErrorKind::Parse, e))
    }

    fn destroy(&self, vmid: u32) -> Result<(), PlatformError> {
        let id = vmid.to_string();
        match self.qm(
            "destroy",
            vmid,
            &["destroy", &id, "--destroy-unreferenced-disks", "1"],
        ) {
            Ok(_) => {
                info!("destroyed vmid {vmid}");
                Ok(())
            }
            Err(e) if e.kind == PlatformErrorKind::NotFound => {
                debug!("vmid {vmid} already absent");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn create(&self, vmid: u32, name: &str, spec: &VmSpec) -> Result<(), PlatformError> {
        let id = vmid.to_string();
        let memory = spec.memory_mb.to_string();
        let cores = spec.cores.to_string();
        let net = format!("virtio,bridge={}", spec.bridge);
        self.qm(
            "create",
            vmid,
            &[
                "create", &id, "--memory", &memory, "--cores", &cores, "--net0", &net, "--name",
                name, "--agent", "enabled=1", "--scsihw", "virtio-scsi-pci", "--serial0",
                "socket", "--vga", "serial0", "--cpu", "host",
            ],
        )?;
        Ok(())
    }

    fn import_disk(&self, vmid: u32, image: &Path, storage: &str) -> Result<String, PlatformError> {
        let id = vmid.to_string();
        let disk = format!("{storage}:0,import-from={},discard=on", image.display());
        self.qm("import disk", vmid, &["set", &id, "--scsi0", &disk])?;
        let config = self.config(vmid)?;
        parse_disk_volume(&config, "scsi0").ok_or_else(|| {
            PlatformError::new(
                "import disk",
                Some(vmid),
                PlatformErrorKind::Parse,
                "scsi0 missing from VM config after import",
            )
        })
    }

    fn set_config(&self, vmid: u32, field: &str, value: &str) -> Result<(), PlatformError> {
        let id = vmid.to_string();
        let flag = format!("--{field}");
        self.qm(&format!("set {field}"), vmid, &["set", &id, &flag, value])?;
        Ok(())
    }

    fn convert_to_template(&self, vmid: u32) -> Result<(), PlatformError> {
        self.qm("convert to template", vmid, &["template", &vmid.to_string()])?;
        Ok(())
    }

    fn supports_clone(&self) -> bool {
        true
    }

    fn clone_resource(&self, source: u32, target: u32, name: &str) -> Result<(), PlatformError> {
        let src = source.to_string();
        let dst = target.to_string();
        self.qm(
            "clone",
            target,
            &["clone", &src, &dst, "--name", name, "--full", "1"],
        )?;
        Ok(())
    }

    fn has_linked_clones(&self, vmid: u32) -> Result<bool, PlatformError> {
        let config = self.config(vmid)?;
        let Some(volume) = parse_disk_volume(&config, "scsi0") else {
            return Ok(false);
        };
        let Some((storage, _)) = volume.split_once(':') else {
            return Ok(false);
        };
        let node = self.node()?;
        let json = self.pvesh_get(
            "list storage content",
            &format!("/nodes/{node}/storage/{storage}/content"),
            &[],
        )?;
        parse_linked_clones(&json, vmid).map_err(|e| {
            PlatformError::new("list storage content", Some(vmid), PlatformErrorKind::Parse, e)
        })
    }

    fn select_storage(&self, requested: Option<&str>) -> Result<String, PlatformError> {
        let storages = self.storages()?;
        let not_found = |cause: String| {
            PlatformError::new("select storage", None, PlatformErrorKind::NotFound, cause)
        };
        match requested {
            Some(name) => match storages.iter().find(|s| s.name == name) {
                Some(s) if s.usable() => Ok(name.to_owned()),
                Some(_) => Err(not_found(format!(
                    "storage '{name}' is inactive, disabled, or cannot hold VM disks"
                ))),
                None => {
                    let known: Vec<&str> = storages.iter().map(|s| s.name.as_str()).collect();
                    Err(not_found(format!(
                        "storage '{name}' not found (available: {})",
                        known.join(", ")
                    )))
                }
            },
            None => storages
                .iter()
                .find(|s| s.usable())
                .map(|s| {
                    info!("auto-selected storage '{}'", s.name);
                    s.name.clone()
                })
                .ok_or_else(|| not_found("no active storage supports VM disk images".to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    type Calls = Arc<Mutex<Vec<String>>>;

    /// Replays canned outputs in order and records every invocation.
    struct ScriptedRunner {
        replies: Mutex<VecDeque<CommandOutput>>,
        calls: Calls,
    }

    fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            success: true,
            stdout: stdout.to_owned(),
            stderr: String::new(),
        }
    }

    fn fail(stderr: &str) -> CommandOutput {
        CommandOutput {
            success: false,
            stdout: String::new(),
            stderr: stderr.to_owned(),
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{program} {}", args.join(" ")));
            Ok(self.replies.lock().unwrap().pop_front().unwrap_or_else(|| ok("")))
        }
    }

    fn platform(replies: Vec<CommandOutput>) -> (ProxmoxPlatform, Calls) {
        let calls: Calls = Arc::default();
        let runner = ScriptedRunner {
            replies: Mutex::new(replies.into()),
            calls: Arc::clone(&calls),
        };
        (
            ProxmoxPlatform::with_runner(Box::new(runner)).with_node("pve1"),
            calls,
        )
    }

    #[test]
    fn parses_cluster_resources() {
        let json = r#"[
            {"vmid": 9000, "name": "debian-12", "template": 1, "node": "pve1", "type": "qemu"},
            {"vmid": 101, "name": "web", "node": "pve2", "type": "qemu"},
            {"id": "storage/pve1/local"}
        ]"#;
        let res = parse_cluster_resources(json).unwrap();
        assert_eq!(res.len(), 2);
        assert!(res[0].is_template);
        assert!(!res[1].is_template);
        assert_eq!(res[1].node.as_deref(), Some("pve2"));
    }

    #[test]
    fn parses_storage_usability() {
        let json = r#"[
            {"storage": "local", "active": 1, "enabled": 1, "content": "iso,vztmpl,backup"},
            {"storage": "local-zfs", "active": 1, "enabled": 1, "content": "images,rootdir"},
            {"storage": "nfs", "active": 0, "content": "images"}
        ]"#;
        let st = parse_storages(json).unwrap();
        assert!(!st[0].usable());
        assert!(st[1].usable());
        assert!(!st[2].usable());
    }

    #[test]
    fn detects_linked_clones() {
        let json = r#"[
            {"volid": "local-zfs:base-9000-disk-0", "format": "raw"},
            {"volid": "local-zfs:vm-120-disk-0", "parent": "base-9000-disk-0@__base__"}
        ]"#;
        assert!(parse_linked_clones(json, 9000).unwrap());
        assert!(!parse_linked_clones(json, 9001).unwrap());
        assert!(!parse_linked_clones("[]", 9000).unwrap());
    }

    #[test]
    fn disk_volume_from_config() {
        let cfg = "boot: c\nscsi0: local-zfs:vm-9000-disk-0,discard=on,size=2G\nname: x\n";
        assert_eq!(
            parse_disk_volume(cfg, "scsi0").as_deref(),
            Some("local-zfs:vm-9000-disk-0")
        );
        assert_eq!(parse_disk_volume(cfg, "scsi1"), None);
    }

    #[test]
    fn create_builds_qm_command() {
        let (p, calls) = platform(vec![ok("")]);
        p.create(9000, "debian-12", &VmSpec::default()).unwrap();
        let calls = calls.lock().unwrap();
        assert_eq!(
            calls[0],
            "qm create 9000 --memory 1024 --cores 1 --net0 virtio,bridge=vmbr0 --name debian-12 \
             --agent enabled=1 --scsihw virtio-scsi-pci --serial0 socket --vga serial0 --cpu host"
        );
    }

    #[test]
    fn create_conflict_is_classified() {
        let (p, _) = platform(vec![fail("VM 9000 already exists on node 'pve1'")]);
        let err = p.create(9000, "x", &VmSpec::default()).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(err.vmid, Some(9000));
    }

    #[test]
    fn destroy_missing_is_ok() {
        let (p, _) = platform(vec![fail("Configuration file 'nodes/pve1/qemu-server/9000.conf' does not exist")]);
        assert!(p.destroy(9000).is_ok());
        let (p, _) = platform(vec![fail("VM is locked (backup)")]);
        assert!(p.destroy(9000).is_err());
    }

    #[test]
    fn import_disk_returns_volume() {
        let (p, calls) = platform(vec![
            ok(""),
            ok("scsi0: local-zfs:vm-9000-disk-0,discard=on,size=2G\n"),
        ]);
        let vol = p
            .import_disk(9000, Path::new("/var/lib/templar/tmp/d.qcow2"), "local-zfs")
            .unwrap();
        assert_eq!(vol, "local-zfs:vm-9000-disk-0");
        assert_eq!(
            calls.lock().unwrap()[0],
            "qm set 9000 --scsi0 local-zfs:0,import-from=/var/lib/templar/tmp/d.qcow2,discard=on"
        );
    }

    #[test]
    fn storage_selection() {
        let listing = ok(r#"[
            {"storage": "local", "active": 1, "enabled": 1, "content": "iso"},
            {"storage": "tank", "active": 1, "enabled": 1, "content": "images"}
        ]"#);
        let (p, calls) = platform(vec![listing.clone()]);
        assert_eq!(p.select_storage(None).unwrap(), "tank");
        assert_eq!(
            calls.lock().unwrap()[0],
            "pvesh get /nodes/pve1/storage --output-format json"
        );

        let (p, _) = platform(vec![listing.clone()]);
        let err = p.select_storage(Some("local")).unwrap_err();
        assert_eq!(err.kind, PlatformErrorKind::NotFound);

        let (p, _) = platform(vec![listing]);
        assert!(p.select_storage(Some("missing")).unwrap_err().cause.contains("available: local, tank"));
    }

    #[test]
    fn linked_clone_lookup_uses_disk_storage() {
        let (p, calls) = platform(vec![
            ok("scsi0: tank:base-9000-disk-0,size=2G\n"),
            ok(r#"[{"volid": "tank:vm-130-disk-0", "parent": "base-9000-disk-0@__base__"}]"#),
        ]);
        assert!(p.has_linked_clones(9000).unwrap());
        assert_eq!(
            calls.lock().unwrap()[1],
            "pvesh get /nodes/pve1/storage/tank/content --output-format json"
        );
    }

    #[test]
    fn clone_is_full() {
        let (p, calls) = platform(vec![ok("")]);
        p.clone_resource(9500, 9000, "debian-12").unwrap();
        assert_eq!(
            calls.lock().unwrap()[0],
            "qm clone 9500 9000 --name debian-12 --full 1"
        );
    }
}
