use serde::Serialize;
use std::collections::BTreeMap;
use templar_platform::{live_templates, Resource};
use templar_store::{BuildMetadata, MetadataMap};

/// A stored identifier that disagrees with the live template of that name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftWarning {
    pub name: String,
    pub stored_vmid: u32,
    pub live_vmid: u32,
}

impl std::fmt::Display for DriftWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "template '{}': metadata records vmid {} but the live template is {}",
            self.name, self.stored_vmid, self.live_vmid
        )
    }
}

/// Compare stored identifiers with live templates.
///
/// Only names present on both sides with a stored identifier can drift; a
/// record without an identifier (first build pending) never does. Neither
/// input is modified.
pub fn reconcile(metadata: &MetadataMap, live: &[Resource]) -> Vec<DriftWarning> {
    let live = live_templates(live);
    metadata
        .iter()
        .filter_map(|(name, meta)| {
            let stored = meta.vmid?;
            let resource = live.get(name)?;
            (resource.vmid != stored).then(|| DriftWarning {
                name: name.clone(),
                stored_vmid: stored,
                live_vmid: resource.vmid,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    /// Neither a live template nor a stored identifier.
    Missing,
    /// Live on the platform, no identifier recorded locally.
    LiveOnly,
    /// Recorded locally, gone from the platform.
    MetadataOnly,
    /// Both present, identifiers differ.
    Drifted,
    InSync,
}

impl StatusKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::LiveOnly => "live-only",
            Self::MetadataOnly => "metadata-only",
            Self::Drifted => "drifted",
            Self::InSync => "in-sync",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateStatus {
    pub name: String,
    pub status: StatusKind,
    pub stored_vmid: Option<u32>,
    pub live_vmid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub templates: Vec<TemplateStatus>,
    pub drift: Vec<DriftWarning>,
}

/// Status of each name in `names` against metadata and the live platform.
pub fn classify(names: &[String], metadata: &MetadataMap, live: &[Resource]) -> Vec<TemplateStatus> {
    let live: BTreeMap<String, Resource> = live_templates(live);
    let empty = BuildMetadata::default();
    names
        .iter()
        .map(|name| {
            let meta = metadata.get(name).unwrap_or(&empty);
            let live_vmid = live.get(name).map(|r| r.vmid);
            let status = match (meta.vmid, live_vmid) {
                (None, None) => StatusKind::Missing,
                (None, Some(_)) => StatusKind::LiveOnly,
                (Some(_), None) => StatusKind::MetadataOnly,
                (Some(s), Some(l)) if s == l => StatusKind::InSync,
                (Some(_), Some(_)) => StatusKind::Drifted,
            };
            TemplateStatus {
                name: name.clone(),
                status,
                stored_vmid: meta.vmid,
                live_vmid,
                build_date: meta.build_date.clone(),
                last_update: meta.last_update.clone(),
            }
        })
        .collect()
}
