//! Virtualization platform adapters for Templar.
//!
//! The `Platform` trait is the uniform surface the orchestrator drives:
//! listing resources, creating a VM, importing a disk, setting configuration,
//! converting to a template, destroying, and (where supported) cloning.
//! `ProxmoxPlatform` maps it onto `qm`/`pvesh`; `MockPlatform` keeps state in
//! memory (optionally persisted to JSON) for tests and dry runs. The
//! identifier allocator lives here because it is a pure function of the
//! platform's live resource list.

pub mod allocator;
pub mod mock;
pub mod proxmox;

pub use allocator::{allocate, allocate_from, AllocError, IdRange};
pub use mock::{MockFailure, MockPlatform, MockResource, MockState};
pub use proxmox::{CommandOutput, CommandRunner, ProxmoxPlatform, StorageInfo, SystemRunner};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

/// Coarse classification of a platform failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformErrorKind {
    /// The identifier is already taken.
    Conflict,
    /// The resource or storage does not exist.
    NotFound,
    /// The adapter cannot perform this operation.
    Unsupported,
    /// The control plane rejected the call.
    Command,
    /// The control plane answered with something unparseable.
    Parse,
}

fn vmid_suffix(vmid: &Option<u32>) -> String {
    vmid.map(|v| format!(" (vmid {v})")).unwrap_or_default()
}

#[derive(Debug, Clone, Error)]
#[error("platform {operation}{} failed: {cause}", vmid_suffix(.vmid))]
pub struct PlatformError {
    pub operation: String,
    pub vmid: Option<u32>,
    pub kind: PlatformErrorKind,
    pub cause: String,
}

impl PlatformError {
    pub fn new(
        operation: &str,
        vmid: Option<u32>,
        kind: PlatformErrorKind,
        cause: impl Into<String>,
    ) -> Self {
        Self {
            operation: operation.to_owned(),
            vmid,
            kind,
            cause: cause.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.kind == PlatformErrorKind::Conflict
    }

    pub fn is_unsupported(&self) -> bool {
        self.kind == PlatformErrorKind::Unsupported
    }
}

/// One VM or template known to the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub vmid: u32,
    pub name: String,
    pub is_template: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

/// Hardware for a newly created VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmSpec {
    pub memory_mb: u32,
    pub cores: u32,
    pub bridge: String,
}

impl Default for VmSpec {
    fn default() -> Self {
        Self {
            memory_mb: 1024,
            cores: 1,
            bridge: "vmbr0".to_owned(),
        }
    }
}

pub trait Platform: Send + Sync {
    fn name(&self) -> &'static str;

    fn list_resources(&self) -> Result<Vec<Resource>, PlatformError>;

    fn resource_exists(&self, vmid: u32) -> Result<bool, PlatformError> {
        Ok(self.list_resources()?.iter().any(|r| r.vmid == vmid))
    }

    /// Remove a resource and its disks. Absent resources are not an error.
    fn destroy(&self, vmid: u32) -> Result<(), PlatformError>;

    fn create(&self, vmid: u32, name: &str, spec: &VmSpec) -> Result<(), PlatformError>;

    /// Import `image` as the boot disk of `vmid` on `storage`; returns the
    /// volume reference.
    fn import_disk(&self, vmid: u32, image: &Path, storage: &str) -> Result<String, PlatformError>;

    fn set_config(&self, vmid: u32, field: &str, value: &str) -> Result<(), PlatformError>;

    fn convert_to_template(&self, vmid: u32) -> Result<(), PlatformError>;

    /// Whether [`clone_resource`](Self::clone_resource) is available.
    fn supports_clone(&self) -> bool {
        false
    }

    /// Full clone of `source` into a new resource `target`.
    fn clone_resource(&self, source: u32, target: u32, name: &str) -> Result<(), PlatformError> {
        let _ = (target, name);
        Err(PlatformError::new(
            "clone",
            Some(source),
            PlatformErrorKind::Unsupported,
            format!("{} does not support cloning", self.name()),
        ))
    }

    /// Whether other volumes use `vmid`'s disk as a linked-clone base.
    fn has_linked_clones(&self, vmid: u32) -> Result<bool, PlatformError> {
        let _ = vmid;
        Ok(false)
    }

    /// Validate `requested` or pick a suitable storage target.
    fn select_storage(&self, requested: Option<&str>) -> Result<String, PlatformError>;
}

/// Live templates keyed by name. When several templates share a name the
/// lowest identifier wins and the rest are reported.
pub fn live_templates(resources: &[Resource]) -> BTreeMap<String, Resource> {
    let mut sorted: Vec<&Resource> = resources.iter().filter(|r| r.is_template).collect();
    sorted.sort_by_key(|r| r.vmid);
    let mut out: BTreeMap<String, Resource> = BTreeMap::new();
    for r in sorted {
        if let Some(existing) = out.get(&r.name) {
            warn!(
                "template name '{}' used by both {} and {}; using {}",
                r.name, existing.vmid, r.vmid, existing.vmid
            );
            continue;
        }
        out.insert(r.name.clone(), r.clone());
    }
    out
}
