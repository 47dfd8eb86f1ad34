//! Core orchestration engine for Templar template lifecycles.
//!
//! This crate ties the catalog, image cache, customizer, platform adapter, and
//! metadata store together into the `Engine`: the central API for building,
//! updating, rebuilding, and importing templates, and for reporting their
//! status. It also provides the per-template lifecycle state machine,
//! metadata/platform reconciliation, selection filtering, the run lock, and
//! interrupt handling.

pub mod concurrency;
pub mod config;
pub mod drift;
pub mod engine;
pub mod lifecycle;
pub mod manifest;
pub mod selection;

pub use concurrency::{install_signal_handler, request_shutdown, shutdown_requested, StoreLock};
pub use config::{ConfigFile, EngineConfig};
pub use drift::{classify, reconcile, DriftWarning, StatusKind, StatusReport, TemplateStatus};
pub use engine::{Engine, Outcome, ProgressFn, RunMode, RunReport, TemplateReport};
pub use lifecycle::{validate_transition, TemplateState};
pub use manifest::load_manifest;
pub use selection::Selection;

use std::path::PathBuf;
use templar_platform::{AllocError, PlatformError};
use templar_runtime::RuntimeError;
use templar_schema::{CatalogError, ManifestError};
use templar_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),
    #[error("config file error: {0}")]
    ConfigFile(#[from] toml::de::Error),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("another run holds the lock at {}", .0.display())]
    Locked(PathBuf),
    #[error("{0}")]
    Runtime(#[from] RuntimeError),
    #[error("{0}")]
    Platform(#[from] PlatformError),
    #[error("{0}")]
    Alloc(#[from] AllocError),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Errors detected before any side effect: bad input, not bad luck.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Catalog(_) | Self::Manifest(_) | Self::ConfigFile(_)
        )
    }

    /// Errors from the local state directory or the run lock.
    pub fn is_store(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Locked(_))
    }
}
