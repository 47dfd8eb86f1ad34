use crate::{fsync_dir, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Build record for one template.
///
/// Timestamps are RFC 3339 strings. A record may exist without a `vmid`
/// when it was written by an older tool or edited by hand.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildMetadata {
    #[serde(default)]
    pub vmid: Option<u32>,
    #[serde(default)]
    pub build_date: Option<String>,
    #[serde(default)]
    pub last_update: Option<String>,
}

pub type MetadataMap = BTreeMap<String, BuildMetadata>;

pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// The metadata file: a single JSON object keyed by template name.
///
/// The whole map is rewritten atomically on every [`save`](Self::save), so a
/// crash between templates never loses records written earlier.
pub struct MetadataStore {
    path: PathBuf,
}

impl MetadataStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn corrupt_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".corrupt");
        PathBuf::from(name)
    }

    fn read_map(path: &Path) -> Result<MetadataMap, StoreError> {
        let content = fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(MetadataMap::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    /// Load the metadata map.
    ///
    /// A missing file is an empty map. An unparseable file is reported and
    /// treated as empty; it is left in place until the next save moves it
    /// aside.
    pub fn load(&self) -> Result<MetadataMap, StoreError> {
        if !self.path.exists() {
            debug!("no metadata file at {}", self.path.display());
            return Ok(MetadataMap::new());
        }
        match Self::read_map(&self.path) {
            Ok(map) => Ok(map),
            Err(StoreError::Serialization(e)) => {
                warn!(
                    "metadata file {} is corrupt, ignoring: {e}",
                    self.path.display()
                );
                Ok(MetadataMap::new())
            }
            Err(e) => Err(e),
        }
    }

    pub fn save(&self, map: &MetadataMap) -> Result<(), StoreError> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        if self.path.exists() {
            if let Err(StoreError::Serialization(_)) = Self::read_map(&self.path) {
                let backup = self.corrupt_path();
                fs::rename(&self.path, &backup)?;
                warn!("moved corrupt metadata file to {}", backup.display());
            }
        }

        let content = serde_json::to_string_pretty(map)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(dir)?;
        debug!("saved metadata for {} templates", map.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, MetadataStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path().join("metadata.json"));
        (dir, store)
    }

    fn sample() -> BuildMetadata {
        BuildMetadata {
            vmid: Some(9001),
            build_date: Some("2025-01-01T00:00:00Z".to_owned()),
            last_update: None,
        }
    }

    #[test]
    fn missing_file_is_empty() {
        let (_dir, store) = test_store();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn save_then_load() {
        let (_dir, store) = test_store();
        let mut map = MetadataMap::new();
        map.insert("debian-12".to_owned(), sample());
        store.save(&map).unwrap();
        assert_eq!(store.load().unwrap(), map);
    }

    #[test]
    fn file_format_is_name_keyed_object() {
        let (_dir, store) = test_store();
        let mut map = MetadataMap::new();
        map.insert("debian-12".to_owned(), sample());
        store.save(&map).unwrap();
        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["debian-12"]["vmid"], 9001);
        assert!(raw["debian-12"]["last_update"].is_null());
    }

    #[test]
    fn tolerates_missing_fields() {
        let (_dir, store) = test_store();
        fs::write(store.path(), r#"{"arch": {"build_date": "2024-05-01T10:00:00"}}"#).unwrap();
        let map = store.load().unwrap();
        assert_eq!(map["arch"].vmid, None);
    }

    #[test]
    fn corrupt_file_loads_empty_and_is_preserved_on_save() {
        let (dir, store) = test_store();
        fs::write(store.path(), "{ not json").unwrap();
        assert!(store.load().unwrap().is_empty());
        // load alone does not touch the file
        assert_eq!(fs::read_to_string(store.path()).unwrap(), "{ not json");

        let mut map = MetadataMap::new();
        map.insert("alma-9".to_owned(), sample());
        store.save(&map).unwrap();
        let backup = dir.path().join("metadata.json.corrupt");
        assert_eq!(fs::read_to_string(backup).unwrap(), "{ not json");
        assert_eq!(store.load().unwrap(), map);
    }

    #[test]
    fn save_leaves_no_temp_files() {
        let (dir, store) = test_store();
        store.save(&MetadataMap::new()).unwrap();
        store.save(&MetadataMap::new()).unwrap();
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn timestamps_are_rfc3339() {
        let ts = now_timestamp();
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }
}
