use crate::{Platform, PlatformError, PlatformErrorKind, Resource, VmSpec};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockResource {
    pub name: String,
    #[serde(default)]
    pub is_template: bool,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    /// Volume reference of the imported boot disk.
    #[serde(default)]
    pub disk: Option<String>,
    /// blake3 of the image file at import time.
    #[serde(default)]
    pub disk_digest: Option<String>,
}

/// An injected failure: every call to `operation` (optionally only for
/// `vmid`) fails until removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockFailure {
    pub operation: String,
    #[serde(default)]
    pub vmid: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockState {
    #[serde(default)]
    pub resources: BTreeMap<u32, MockResource>,
    #[serde(default)]
    pub linked_clones: BTreeSet<u32>,
    #[serde(default = "default_storages")]
    pub storages: Vec<String>,
    #[serde(default = "default_clone_supported")]
    pub clone_supported: bool,
    #[serde(default)]
    pub failures: Vec<MockFailure>,
}

fn default_storages() -> Vec<String> {
    vec!["local-zfs".to_owned()]
}

fn default_clone_supported() -> bool {
    true
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            resources: BTreeMap::new(),
            linked_clones: BTreeSet::new(),
            storages: default_storages(),
            clone_supported: true,
            failures: Vec::new(),
        }
    }
}

/// In-memory platform. With [`MockPlatform::persistent`] the state is
/// loaded from and written back to a JSON file after every mutation, which
/// lets separate processes share one fake cluster.
pub struct MockPlatform {
    state: Mutex<MockState>,
    calls: Mutex<Vec<String>>,
    persist: Option<PathBuf>,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::with_state(MockState::default())
    }
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: MockState) -> Self {
        Self {
            state: Mutex::new(state),
            calls: Mutex::new(Vec::new()),
            persist: None,
        }
    }

    pub fn persistent(path: &Path) -> Result<Self, PlatformError> {
        let state = if path.exists() {
            let content = fs::read_to_string(path).map_err(|e| {
                PlatformError::new("load mock state", None, PlatformErrorKind::Command, e.to_string())
            })?;
            serde_json::from_str(&content).map_err(|e| {
                PlatformError::new("load mock state", None, PlatformErrorKind::Parse, e.to_string())
            })?
        } else {
            MockState::default()
        };
        Ok(Self {
            state: Mutex::new(state),
            calls: Mutex::new(Vec::new()),
            persist: Some(path.to_path_buf()),
        })
    }

    /// Add a pre-existing resource.
    pub fn insert(&self, vmid: u32, name: &str, is_template: bool) {
        if let Ok(mut s) = self.state.lock() {
            s.resources.insert(
                vmid,
                MockResource {
                    name: name.to_owned(),
                    is_template,
                    ..MockResource::default()
                },
            );
        }
    }

    pub fn fail_on(&self, operation: &str, vmid: Option<u32>) {
        if let Ok(mut s) = self.state.lock() {
            s.failures.push(MockFailure {
                operation: operation.to_owned(),
                vmid,
            });
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut s) = self.state.lock() {
            s.failures.clear();
        }
    }

    pub fn mark_linked_clones(&self, vmid: u32) {
        if let Ok(mut s) = self.state.lock() {
            s.linked_clones.insert(vmid);
        }
    }

    pub fn set_clone_supported(&self, supported: bool) {
        if let Ok(mut s) = self.state.lock() {
            s.clone_supported = supported;
        }
    }

    pub fn snapshot(&self) -> MockState {
        self.state.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn resource(&self, vmid: u32) -> Option<MockResource> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.resources.get(&vmid).cloned())
    }

    /// Operations performed so far, e.g. `"create 9000 debian-12"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn lock(&self, op: &str) -> Result<MutexGuard<'_, MockState>, PlatformError> {
        self.state.lock().map_err(|e| {
            PlatformError::new(op, None, PlatformErrorKind::Command, format!("mutex poisoned: {e}"))
        })
    }

    fn record(&self, call: String) {
        debug!("mock platform: {call}");
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn check_failure(state: &MockState, op: &str, vmid: Option<u32>) -> Result<(), PlatformError> {
        let hit = state
            .failures
            .iter()
            .any(|f| f.operation == op && (f.vmid.is_none() || f.vmid == vmid));
        if hit {
            return Err(PlatformError::new(
                op,
                vmid,
                PlatformErrorKind::Command,
                "mock: injected failure",
            ));
        }
        Ok(())
    }

    fn save(&self, state: &MockState) -> Result<(), PlatformError> {
        let Some(path) = &self.persist else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(state).map_err(|e| {
            PlatformError::new("save mock state", None, PlatformErrorKind::Parse, e.to_string())
        })?;
        fs::write(path, json).map_err(|e| {
            PlatformError::new("save mock state", None, PlatformErrorKind::Command, e.to_string())
        })
    }

    fn missing(op: &str, vmid: u32) -> PlatformError {
        PlatformError::new(
            op,
            Some(vmid),
            PlatformErrorKind::NotFound,
            format!("VM {vmid} does not exist"),
        )
    }
}

impl Platform for MockPlatform {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn list_resources(&self) -> Result<Vec<Resource>, PlatformError> {
        let state = self.lock("list")?;
        Self::check_failure(&state, "list", None)?;
        Ok(state
            .resources
            .iter()
            .map(|(vmid, r)| Resource {
                vmid: *vmid,
                name: r.name.clone(),
                is_template: r.is_template,
                node: Some("mock".to_owned()),
            })
            .collect())
    }

    fn destroy(&self, vmid: u32) -> Result<(), PlatformError> {
        let mut state = self.lock("destroy")?;
        Self::check_failure(&state, "destroy", Some(vmid))?;
        if state.resources.remove(&vmid).is_some() {
            state.linked_clones.remove(&vmid);
            self.record(format!("destroy {vmid}"));
            self.save(&state)?;
        }
        Ok(())
    }

    fn create(&self, vmid: u32, name: &str, spec: &VmSpec) -> Result<(), PlatformError> {
        let mut state = self.lock("create")?;
        Self::check_failure(&state, "create", Some(vmid))?;
        if state.resources.contains_key(&vmid) {
            return Err(PlatformError::new(
                "create",
                Some(vmid),
                PlatformErrorKind::Conflict,
                format!("VM {vmid} already exists"),
            ));
        }
        let mut config = BTreeMap::new();
        config.insert("memory".to_owned(), spec.memory_mb.to_string());
        config.insert("cores".to_owned(), spec.cores.to_string());
        config.insert("net0".to_owned(), format!("virtio,bridge={}", spec.bridge));
        state.resources.insert(
            vmid,
            MockResource {
                name: name.to_owned(),
                config,
                ..MockResource::default()
            },
        );
        self.record(format!("create {vmid} {name}"));
        self.save(&state)
    }

    fn import_disk(&self, vmid: u32, image: &Path, storage: &str) -> Result<String, PlatformError> {
        let mut state = self.lock("import disk")?;
        Self::check_failure(&state, "import disk", Some(vmid))?;
        if !state.storages.iter().any(|s| s == storage) {
            return Err(PlatformError::new(
                "import disk",
                Some(vmid),
                PlatformErrorKind::NotFound,
                format!("storage '{storage}' does not exist"),
            ));
        }
        let bytes = fs::read(image).map_err(|e| {
            PlatformError::new(
                "import disk",
                Some(vmid),
                PlatformErrorKind::Command,
                format!("cannot read {}: {e}", image.display()),
            )
        })?;
        let resource = state
            .resources
            .get_mut(&vmid)
            .ok_or_else(|| Self::missing("import disk", vmid))?;
        let volume = format!("{storage}:vm-{vmid}-disk-0");
        resource.disk = Some(volume.clone());
        resource.disk_digest = Some(blake3::hash(&bytes).to_hex().to_string());
        self.record(format!("import disk {vmid} {}", image.display()));
        self.save(&state)?;
        Ok(volume)
    }

    fn set_config(&self, vmid: u32, field: &str, value: &str) -> Result<(), PlatformError> {
        let op = format!("set {field}");
        let mut state = self.lock(&op)?;
        Self::check_failure(&state, &op, Some(vmid))?;
        let resource = state
            .resources
            .get_mut(&vmid)
            .ok_or_else(|| Self::missing(&op, vmid))?;
        resource.config.insert(field.to_owned(), value.to_owned());
        self.record(format!("set {vmid} {field}"));
        self.save(&state)
    }

    fn convert_to_template(&self, vmid: u32) -> Result<(), PlatformError> {
        let op = "convert to template";
        let mut state = self.lock(op)?;
        Self::check_failure(&state, op, Some(vmid))?;
        let resource = state
            .resources
            .get_mut(&vmid)
            .ok_or_else(|| Self::missing(op, vmid))?;
        if resource.is_template {
            return Err(PlatformError::new(
                op,
                Some(vmid),
                PlatformErrorKind::Conflict,
                "already a template",
            ));
        }
        resource.is_template = true;
        if let Some(disk) = resource.disk.as_mut() {
            *disk = disk.replacen("vm-", "base-", 1);
        }
        self.record(format!("template {vmid}"));
        self.save(&state)
    }

    fn supports_clone(&self) -> bool {
        self.state.lock().map(|s| s.clone_supported).unwrap_or(false)
    }

    fn clone_resource(&self, source: u32, target: u32, name: &str) -> Result<(), PlatformError> {
        let mut state = self.lock("clone")?;
        if !state.clone_supported {
            return Err(PlatformError::new(
                "clone",
                Some(source),
                PlatformErrorKind::Unsupported,
                "mock: cloning disabled",
            ));
        }
        Self::check_failure(&state, "clone", Some(target))?;
        if state.resources.contains_key(&target) {
            return Err(PlatformError::new(
                "clone",
                Some(target),
                PlatformErrorKind::Conflict,
                format!("VM {target} already exists"),
            ));
        }
        let src = state
            .resources
            .get(&source)
            .cloned()
            .ok_or_else(|| Self::missing("clone", source))?;
        let disk = src
            .disk
            .as_ref()
            .and_then(|d| d.split_once(':'))
            .map(|(storage, _)| format!("{storage}:vm-{target}-disk-0"));
        state.resources.insert(
            target,
            MockResource {
                name: name.to_owned(),
                is_template: false,
                config: src.config,
                disk,
                disk_digest: src.disk_digest,
            },
        );
        self.record(format!("clone {source} {target} {name}"));
        self.save(&state)
    }

    fn has_linked_clones(&self, vmid: u32) -> Result<bool, PlatformError> {
        let state = self.lock("list storage content")?;
        Ok(state.linked_clones.contains(&vmid))
    }

    fn select_storage(&self, requested: Option<&str>) -> Result<String, PlatformError> {
        let state = self.lock("select storage")?;
        match requested {
            Some(name) if state.storages.iter().any(|s| s == name) => Ok(name.to_owned()),
            Some(name) => Err(PlatformError::new(
                "select storage",
                None,
                PlatformErrorKind::NotFound,
                format!(
                    "storage '{name}' not found (available: {})",
                    state.storages.join(", ")
                ),
            )),
            None => state.storages.first().cloned().ok_or_else(|| {
                PlatformError::new(
                    "select storage",
                    None,
                    PlatformErrorKind::NotFound,
                    "no storage configured",
                )
            }),
        }
    }
}
