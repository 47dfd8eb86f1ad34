use crate::StoreError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Prefix of per-template scratch directories created under the work dir.
pub const WORK_DIR_PREFIX: &str = "build-";

/// Directory layout under the Templar state directory.
///
/// Every path has a default below `root`; the metadata file, image cache and
/// work directory can be relocated individually. Directories are created on
/// [`initialize`](Self::initialize).
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
    metadata_file: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    work_dir: Option<PathBuf>,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            metadata_file: None,
            cache_dir: None,
            work_dir: None,
        }
    }

    #[must_use]
    pub fn with_metadata_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.metadata_file = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_cache_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_work_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(path.into());
        self
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn metadata_file(&self) -> PathBuf {
        self.metadata_file
            .clone()
            .unwrap_or_else(|| self.root.join("metadata.json"))
    }

    /// Downloaded and decompressed base images.
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.root.join("images"))
    }

    /// Scratch space for per-template working copies.
    pub fn work_dir(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| self.root.join("tmp"))
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(".lock")
    }

    /// State file of the mock platform backend.
    #[inline]
    pub fn mock_platform_file(&self) -> PathBuf {
        self.root.join("mock-platform.json")
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(self.cache_dir())?;
        fs::create_dir_all(self.work_dir())?;
        let metadata = self.metadata_file();
        let parent = metadata
            .parent()
            .ok_or_else(|| StoreError::NoParent(metadata.clone()))?;
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    /// Remove scratch directories left behind by an interrupted run.
    ///
    /// Only call this while holding the run lock.
    pub fn sweep_work_dir(&self) -> Result<usize, StoreError> {
        let dir = self.work_dir();
        if !dir.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(WORK_DIR_PREFIX) {
                continue;
            }
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
            debug!("removed stale work entry {}", path.display());
            removed += 1;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths_live_under_root() {
        let layout = StoreLayout::new("/var/lib/templar");
        assert_eq!(
            layout.metadata_file(),
            PathBuf::from("/var/lib/templar/metadata.json")
        );
        assert_eq!(layout.cache_dir(), PathBuf::from("/var/lib/templar/images"));
        assert_eq!(layout.work_dir(), PathBuf::from("/var/lib/templar/tmp"));
        assert_eq!(layout.lock_file(), PathBuf::from("/var/lib/templar/.lock"));
    }

    #[test]
    fn overrides_take_precedence() {
        let layout = StoreLayout::new("/state")
            .with_metadata_file("/etc/templar/meta.json")
            .with_cache_dir("/cache")
            .with_work_dir("/scratch");
        assert_eq!(layout.metadata_file(), PathBuf::from("/etc/templar/meta.json"));
        assert_eq!(layout.cache_dir(), PathBuf::from("/cache"));
        assert_eq!(layout.work_dir(), PathBuf::from("/scratch"));
        assert_eq!(layout.lock_file(), PathBuf::from("/state/.lock"));
    }

    #[test]
    fn initialize_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path().join("state"))
            .with_metadata_file(dir.path().join("meta").join("metadata.json"));
        layout.initialize().unwrap();
        assert!(layout.cache_dir().is_dir());
        assert!(layout.work_dir().is_dir());
        assert!(dir.path().join("meta").is_dir());
    }

    #[test]
    fn sweep_removes_only_prefixed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        let work = layout.work_dir();
        fs::create_dir(work.join("build-debian-12.abc")).unwrap();
        fs::write(work.join("build-debian-12.abc").join("disk.qcow2"), b"x").unwrap();
        fs::write(work.join("keep.txt"), b"x").unwrap();

        assert_eq!(layout.sweep_work_dir().unwrap(), 1);
        assert!(!work.join("build-debian-12.abc").exists());
        assert!(work.join("keep.txt").exists());
    }
}
