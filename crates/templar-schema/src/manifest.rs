//! Import manifests: template name to pre-built image source.

use crate::types::TemplateName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Disk image extensions recognised when scanning a directory.
pub const IMAGE_EXTENSIONS: &[&str] = &["qcow2", "img", "raw", "vmdk"];

/// Archive suffixes that may wrap an image file.
const ARCHIVE_EXTENSIONS: &[&str] = &["xz", "gz", "zst"];

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse manifest: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to parse manifest TOML: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("manifest entry '{name}' has an empty source")]
    EmptySource { name: String },
    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ManifestEntry {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vmid: Option<u32>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub customize: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ImportManifest {
    pub entries: BTreeMap<TemplateName, ManifestEntry>,
}

/// Where a manifest was read from. Relative sources resolve against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestOrigin {
    /// Fetched over HTTP(S); holds the manifest's own URL.
    Remote(String),
    /// Read from the local filesystem; holds the manifest file path.
    Local(PathBuf),
    /// Built in memory; relative sources stay relative to the working directory.
    Inline,
}

/// A resolved image location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Url(String),
    Path(PathBuf),
}

impl ImageSource {
    /// Classify a raw source reference without any base location.
    pub fn parse(raw: &str) -> Self {
        if is_url(raw) {
            Self::Url(raw.to_owned())
        } else {
            Self::Path(PathBuf::from(raw))
        }
    }

    /// Final path or URL segment, used for cache naming and archive detection.
    pub fn file_name(&self) -> Option<String> {
        match self {
            Self::Url(url) => {
                let without_query = url.split(['?', '#']).next().unwrap_or(url);
                without_query
                    .rsplit('/')
                    .next()
                    .filter(|s| !s.is_empty() && !s.contains("://"))
                    .map(str::to_owned)
            }
            Self::Path(p) => p.file_name().map(|n| n.to_string_lossy().into_owned()),
        }
    }
}

impl std::fmt::Display for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Url(u) => f.write_str(u),
            Self::Path(p) => write!(f, "{}", p.display()),
        }
    }
}

fn is_url(raw: &str) -> bool {
    raw.split_once("://").is_some_and(|(scheme, _)| {
        !scheme.is_empty() && scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+')
    })
}

impl ManifestOrigin {
    /// Resolve an entry's source against this origin.
    ///
    /// Absolute URLs and absolute paths are kept as-is. A relative source is
    /// joined onto the directory containing the manifest, whether that
    /// directory is a URL or a local path.
    pub fn resolve(&self, source: &str) -> ImageSource {
        if is_url(source) || Path::new(source).is_absolute() {
            return ImageSource::parse(source);
        }
        match self {
            Self::Remote(url) => ImageSource::Url(join_url(url, source)),
            Self::Local(path) => {
                let dir = path.parent().unwrap_or_else(|| Path::new("."));
                ImageSource::Path(dir.join(source))
            }
            Self::Inline => ImageSource::Path(PathBuf::from(source)),
        }
    }
}

/// Join a relative reference onto the directory of `base`.
fn join_url(base: &str, relative: &str) -> String {
    let base = base.split(['?', '#']).next().unwrap_or(base);
    let (scheme, rest) = base.split_once("://").unwrap_or(("", base));
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };

    let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    // Drop the manifest file name unless the base already names a directory.
    if !path.ends_with('/') {
        segments.pop();
    }
    for part in relative.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("{scheme}://{authority}/{}", segments.join("/"))
}

impl ImportManifest {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().map(|n| n.as_str().to_owned()).collect()
    }

    fn validate(&self) -> Result<(), ManifestError> {
        for (name, entry) in &self.entries {
            if entry.source.trim().is_empty() {
                return Err(ManifestError::EmptySource {
                    name: name.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn to_json_pretty(&self) -> Result<String, ManifestError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

pub fn parse_import_manifest_str(input: &str) -> Result<ImportManifest, ManifestError> {
    let manifest: ImportManifest = serde_json::from_str(input)?;
    manifest.validate()?;
    Ok(manifest)
}

pub fn parse_import_manifest_file(path: impl AsRef<Path>) -> Result<ImportManifest, ManifestError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;
    let is_toml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("toml"));
    if is_toml {
        let manifest: ImportManifest = toml::from_str(&content)?;
        manifest.validate()?;
        Ok(manifest)
    } else {
        parse_import_manifest_str(&content)
    }
}

/// Split `file` into a template stem if it carries a recognised image
/// extension, optionally wrapped in a recognised archive suffix.
fn image_stem(file: &str) -> Option<&str> {
    let mut name = file;
    if let Some((head, ext)) = name.rsplit_once('.') {
        if ARCHIVE_EXTENSIONS.iter().any(|a| ext.eq_ignore_ascii_case(a)) {
            name = head;
        }
    }
    let (stem, ext) = name.rsplit_once('.')?;
    if IMAGE_EXTENSIONS.iter().any(|i| ext.eq_ignore_ascii_case(i)) && !stem.is_empty() {
        Some(stem)
    } else {
        None
    }
}

/// Scan `dir` for image files and emit one entry per file.
///
/// Sources are bare file names unless `base_url` is given, in which case they
/// become absolute URLs under it. Files whose derived name collides with an
/// earlier one (in file name order) are skipped with a warning.
pub fn generate_manifest(dir: &Path, base_url: Option<&str>) -> Result<ImportManifest, ManifestError> {
    if !dir.is_dir() {
        return Err(ManifestError::NotADirectory(dir.to_path_buf()));
    }

    let mut files: Vec<String> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            files.push(name.to_owned());
        }
    }
    files.sort();

    let mut manifest = ImportManifest::default();
    for file in files {
        let Some(stem) = image_stem(&file) else {
            debug!("skipping non-image file {file}");
            continue;
        };
        let Some(name) = TemplateName::sanitize(stem) else {
            warn!("cannot derive a template name from {file}, skipping");
            continue;
        };
        if manifest.entries.contains_key(&name) {
            warn!("duplicate template name '{name}' from {file}, skipping");
            continue;
        }
        let source = match base_url {
            Some(base) => format!("{}/{file}", base.trim_end_matches('/')),
            None => file.clone(),
        };
        manifest.entries.insert(
            name,
            ManifestEntry {
                source,
                vmid: None,
                customize: false,
            },
        );
    }
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_source_resolves_against_manifest_url() {
        let origin = ManifestOrigin::Remote("http://host/dir/imports.json".to_owned());
        assert_eq!(
            origin.resolve("x.qcow2"),
            ImageSource::Url("http://host/dir/x.qcow2".to_owned())
        );
        assert_eq!(
            origin.resolve("../other/y.img"),
            ImageSource::Url("http://host/other/y.img".to_owned())
        );
        assert_eq!(
            origin.resolve("./sub/z.raw"),
            ImageSource::Url("http://host/dir/sub/z.raw".to_owned())
        );
    }

    #[test]
    fn absolute_sources_are_kept() {
        let origin = ManifestOrigin::Remote("https://mirror/a/imports.json".to_owned());
        assert_eq!(
            origin.resolve("https://cdn/x.qcow2"),
            ImageSource::Url("https://cdn/x.qcow2".to_owned())
        );
        assert_eq!(
            origin.resolve("/srv/images/x.qcow2"),
            ImageSource::Path(PathBuf::from("/srv/images/x.qcow2"))
        );
    }

    #[test]
    fn relative_source_resolves_against_local_manifest_dir() {
        let origin = ManifestOrigin::Local(PathBuf::from("/srv/images/imports.json"));
        assert_eq!(
            origin.resolve("x.qcow2"),
            ImageSource::Path(PathBuf::from("/srv/images/x.qcow2"))
        );
    }

    #[test]
    fn parses_entries_with_defaults() {
        let m = parse_import_manifest_str(
            r#"{"debian-12": {"source": "debian-12.qcow2"},
                "alma-9": {"source": "alma.img", "vmid": 9100, "customize": true}}"#,
        )
        .unwrap();
        assert_eq!(m.len(), 2);
        let alma = &m.entries["alma-9"];
        assert_eq!(alma.vmid, Some(9100));
        assert!(alma.customize);
        assert!(!m.entries["debian-12"].customize);
    }

    #[test]
    fn rejects_invalid_names_and_empty_sources() {
        assert!(parse_import_manifest_str(r#"{"bad name": {"source": "x"}}"#).is_err());
        assert!(matches!(
            parse_import_manifest_str(r#"{"a": {"source": " "}}"#),
            Err(ManifestError::EmptySource { .. })
        ));
    }

    #[test]
    fn image_stem_handles_archives() {
        assert_eq!(image_stem("debian-12.qcow2"), Some("debian-12"));
        assert_eq!(image_stem("alma.raw.xz"), Some("alma"));
        assert_eq!(image_stem("disk.IMG"), Some("disk"));
        assert_eq!(image_stem("notes.txt"), None);
        assert_eq!(image_stem("archive.tar.gz"), None);
    }

    #[test]
    fn file_name_of_url_ignores_query() {
        let src = ImageSource::parse("https://host/p/img.qcow2?token=1");
        assert_eq!(src.file_name().as_deref(), Some("img.qcow2"));
        assert_eq!(ImageSource::parse("https://host/").file_name(), None);
    }

    #[test]
    fn generate_emits_bare_filenames() {
        let dir = tempfile::tempdir().unwrap();
        for f in ["b.qcow2", "a.img.xz", "readme.md", "b.raw"] {
            fs::write(dir.path().join(f), b"x").unwrap();
        }
        fs::create_dir(dir.path().join("sub.qcow2")).unwrap();

        let m = generate_manifest(dir.path(), None).unwrap();
        assert_eq!(m.names(), vec!["a", "b"]);
        assert_eq!(m.entries["a"].source, "a.img.xz");
        // "b.qcow2" sorts before "b.raw", so it wins the name.
        assert_eq!(m.entries["b"].source, "b.qcow2");
    }

    #[test]
    fn generate_with_base_url() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("x.qcow2"), b"x").unwrap();
        let m = generate_manifest(dir.path(), Some("http://host/images/")).unwrap();
        assert_eq!(m.entries["x"].source, "http://host/images/x.qcow2");
    }
}
