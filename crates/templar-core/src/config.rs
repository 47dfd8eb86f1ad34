use crate::CoreError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use templar_platform::IdRange;
use templar_runtime::DEFAULT_CUSTOMIZE_TIMEOUT;

/// Settings the engine needs for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Storage target for imported disks; auto-selected when `None`.
    pub storage: Option<String>,
    pub range: IdRange,
    pub customize_timeout: Duration,
    pub customize_program: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage: None,
            range: IdRange::default(),
            customize_timeout: DEFAULT_CUSTOMIZE_TIMEOUT,
            customize_program: PathBuf::from("virt-customize"),
        }
    }
}

impl EngineConfig {
    /// Overlay the values present in `file`.
    pub fn apply_file(&mut self, file: &ConfigFile) -> Result<(), CoreError> {
        if let Some(storage) = &file.storage {
            self.storage = Some(storage.clone());
        }
        if file.vmid_min.is_some() || file.vmid_max.is_some() {
            self.range = IdRange::new(
                file.vmid_min.unwrap_or(self.range.min),
                file.vmid_max.unwrap_or(self.range.max),
            )
            .map_err(|e| CoreError::Config(e.to_string()))?;
        }
        if let Some(secs) = file.customize_timeout_secs {
            self.customize_timeout = Duration::from_secs(secs);
        }
        if let Some(program) = &file.customize_program {
            self.customize_program.clone_from(program);
        }
        Ok(())
    }
}

/// Optional TOML configuration file. Every key is optional; unknown keys
/// are rejected so typos do not silently fall back to defaults.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub storage: Option<String>,
    pub vmid_min: Option<u32>,
    pub vmid_max: Option<u32>,
    pub customize_timeout_secs: Option<u64>,
    pub customize_program: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub catalog: Option<PathBuf>,
    pub metadata: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub backend: Option<String>,
}

impl ConfigFile {
    pub fn parse(input: &str) -> Result<Self, CoreError> {
        Ok(toml::from_str(input)?)
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }
}
