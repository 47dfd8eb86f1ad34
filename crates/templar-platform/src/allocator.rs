use crate::{Platform, PlatformError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("no free identifier in range [{min}, {max})")]
    Exhausted { min: u32, max: u32 },
    #[error("invalid identifier range [{min}, {max})")]
    InvalidRange { min: u32, max: u32 },
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

/// Half-open identifier range `[min, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRange {
    pub min: u32,
    pub max: u32,
}

impl IdRange {
    pub const DEFAULT_MIN: u32 = 9000;
    pub const DEFAULT_MAX: u32 = 10000;

    pub fn new(min: u32, max: u32) -> Result<Self, AllocError> {
        if min >= max {
            return Err(AllocError::InvalidRange { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn contains(&self, vmid: u32) -> bool {
        (self.min..self.max).contains(&vmid)
    }
}

impl Default for IdRange {
    fn default() -> Self {
        Self {
            min: Self::DEFAULT_MIN,
            max: Self::DEFAULT_MAX,
        }
    }
}

/// First identifier in `range`, ascending, that is not in `in_use`.
pub fn allocate(range: IdRange, in_use: &HashSet<u32>) -> Result<u32, AllocError> {
    (range.min..range.max)
        .find(|id| !in_use.contains(id))
        .ok_or(AllocError::Exhausted {
            min: range.min,
            max: range.max,
        })
}

/// Allocate against a fresh resource listing. Nothing is cached between
/// calls, so every allocation sees the platform as it is right now.
pub fn allocate_from(platform: &dyn Platform, range: IdRange) -> Result<u32, AllocError> {
    let in_use: HashSet<u32> = platform
        .list_resources()?
        .into_iter()
        .map(|r| r.vmid)
        .collect();
    let vmid = allocate(range, &in_use)?;
    debug!("allocated vmid {vmid} ({} identifiers in use)", in_use.len());
    Ok(vmid)
}
