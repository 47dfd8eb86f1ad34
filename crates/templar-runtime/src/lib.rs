//! Image acquisition and offline customization for Templar.
//!
//! This crate implements the host-side work done on a disk image before it
//! reaches the platform: downloading and caching base images (`ImageCache`),
//! decompressing archived formats, sequencing customization operations into
//! a `CustomizationPlan`, and running them through a pluggable `Customizer`
//! (`VirtCustomize` for libguestfs, `MockCustomizer` for tests) under a hard
//! wall-clock timeout.

pub mod customize;
pub mod http;
pub mod image;
pub mod mock;
pub mod prereq;

pub use customize::{
    select_customizer, CustomizationPlan, CustomizeOp, Customizer, VirtCustomize,
    DEFAULT_CUSTOMIZE_TIMEOUT,
};
pub use http::HttpClient;
pub use image::{cache_file_name, ArchiveKind, ImageCache};
pub use mock::{CustomizeCall, MockCustomizer};
pub use prereq::{check_proxmox_prereqs, format_missing, MissingPrereq};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("download of {url} failed: {reason}")]
    Download { url: String, reason: String },
    #[error("decompression of {} failed: {reason}", path.display())]
    Decompress { path: PathBuf, reason: String },
    #[error("image source not found: {}", .0.display())]
    SourceNotFound(PathBuf),
    #[error("customization of '{template}' timed out after {timeout_secs}s during: {stage}")]
    CustomizationTimeout {
        template: String,
        stage: String,
        timeout_secs: u64,
    },
    #[error("customization of '{template}' failed ({status}):\n{output}")]
    Customization {
        template: String,
        status: String,
        output: String,
    },
    #[error("customization of '{template}' interrupted")]
    Interrupted { template: String },
    #[error("failed to launch '{program}': {reason}")]
    Spawn { program: String, reason: String },
    #[error("unknown customizer '{0}'")]
    UnknownCustomizer(String),
}

impl RuntimeError {
    /// True for errors raised because the operator asked the run to stop.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }
}
