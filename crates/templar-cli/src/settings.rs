use crate::GlobalOpts;
use clap::ValueEnum;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use templar_core::{shutdown_requested, ConfigFile, Engine, EngineConfig};
use templar_platform::{IdRange, MockPlatform, Platform, ProxmoxPlatform};
use templar_runtime::{select_customizer, Customizer};
use templar_schema::{parse_catalog_file, Catalog};
use templar_store::StoreLayout;
use tracing::debug;

pub const DEFAULT_STATE_DIR: &str = "/var/lib/templar";
pub const DEFAULT_CATALOG: &str = "templates.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Proxmox VE via `qm` and `pvesh` on the local node.
    Proxmox,
    /// In-memory platform persisted under the state directory.
    Mock,
}

impl Backend {
    fn parse(raw: &str) -> Result<Self, String> {
        match raw {
            "proxmox" => Ok(Self::Proxmox),
            "mock" => Ok(Self::Mock),
            other => Err(format!(
                "configuration error: unknown backend '{other}' (expected proxmox or mock)"
            )),
        }
    }

    fn customizer(self) -> &'static str {
        match self {
            Self::Proxmox => "virt-customize",
            Self::Mock => "mock",
        }
    }
}

/// Command line options merged over the config file and built-in defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    pub layout: StoreLayout,
    pub catalog: PathBuf,
    /// Whether the catalog location was chosen explicitly.
    pub catalog_explicit: bool,
    pub backend: Backend,
    pub engine: EngineConfig,
}

impl Settings {
    pub fn resolve(opts: &GlobalOpts) -> Result<Self, String> {
        let file = match &opts.config {
            Some(path) => ConfigFile::load(path).map_err(|e| e.to_string())?,
            None => ConfigFile::default(),
        };

        let mut engine = EngineConfig::default();
        engine.apply_file(&file).map_err(|e| e.to_string())?;
        if let Some(storage) = &opts.storage {
            engine.storage = Some(storage.clone());
        }
        if opts.vmid_min.is_some() || opts.vmid_max.is_some() {
            engine.range = IdRange::new(
                opts.vmid_min.unwrap_or(engine.range.min),
                opts.vmid_max.unwrap_or(engine.range.max),
            )
            .map_err(|e| format!("configuration error: {e}"))?;
        }
        if let Some(secs) = opts.timeout {
            engine.customize_timeout = Duration::from_secs(secs);
        }

        let state_dir = opts
            .state_dir
            .clone()
            .or(file.state_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR));
        let mut layout = StoreLayout::new(state_dir);
        if let Some(path) = opts.metadata.clone().or(file.metadata) {
            layout = layout.with_metadata_file(path);
        }
        if let Some(path) = opts.cache_dir.clone().or(file.cache_dir) {
            layout = layout.with_cache_dir(path);
        }
        if let Some(path) = opts.work_dir.clone().or(file.work_dir) {
            layout = layout.with_work_dir(path);
        }

        let explicit_catalog = opts.catalog.clone().or(file.catalog);
        let catalog_explicit = explicit_catalog.is_some();
        let catalog = explicit_catalog.unwrap_or_else(|| PathBuf::from(DEFAULT_CATALOG));

        let backend = match (opts.backend, file.backend.as_deref()) {
            (Some(b), _) => b,
            (None, Some(raw)) => Backend::parse(raw)?,
            (None, None) => Backend::Proxmox,
        };

        Ok(Self {
            layout,
            catalog,
            catalog_explicit,
            backend,
            engine,
        })
    }

    /// Load the catalog. When `required` is false, a missing default catalog
    /// yields an empty one; an explicitly named catalog must always exist.
    pub fn load_catalog(&self, required: bool) -> Result<Catalog, String> {
        if !required && !self.catalog_explicit && !self.catalog.exists() {
            debug!("no catalog at {}, continuing without one", self.catalog.display());
            return Ok(Catalog::default());
        }
        parse_catalog_file(&self.catalog).map_err(|e| {
            format!("catalog error: {} ({e})", self.catalog.display())
        })
    }

    fn platform(&self) -> Result<Arc<dyn Platform>, String> {
        match self.backend {
            Backend::Proxmox => Ok(Arc::new(ProxmoxPlatform::new())),
            Backend::Mock => {
                let mock = MockPlatform::persistent(&self.layout.mock_platform_file())
                    .map_err(|e| e.to_string())?;
                Ok(Arc::new(mock))
            }
        }
    }

    fn customizer(&self) -> Result<Arc<dyn Customizer>, String> {
        let customizer = select_customizer(
            self.backend.customizer(),
            &self.engine.customize_program,
            self.engine.customize_timeout,
            shutdown_requested,
        )
        .map_err(|e| e.to_string())?;
        Ok(Arc::from(customizer))
    }

    pub fn open_engine(&self, require_catalog: bool) -> Result<Engine, String> {
        let catalog = self.load_catalog(require_catalog)?;
        Ok(Engine::new(
            self.engine.clone(),
            self.layout.clone(),
            catalog,
            self.platform()?,
            self.customizer()?,
        ))
    }
}
