use crate::http::HttpClient;
use crate::RuntimeError;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use templar_schema::ImageSource;
use tracing::{debug, info, warn};

/// Archive formats recognised by file suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Xz,
    Gzip,
    Zstd,
}

impl ArchiveKind {
    pub fn detect(file_name: &str) -> Option<Self> {
        let (_, ext) = file_name.rsplit_once('.')?;
        match ext.to_ascii_lowercase().as_str() {
            "xz" => Some(Self::Xz),
            "gz" => Some(Self::Gzip),
            "zst" => Some(Self::Zstd),
            _ => None,
        }
    }

    /// `name` without the archive suffix.
    pub fn strip(self, name: &str) -> &str {
        name.rsplit_once('.').map_or(name, |(head, _)| head)
    }
}

/// Deterministic cache file name for a source: its last path segment, or a
/// hash-derived name when the source has none.
pub fn cache_file_name(source: &ImageSource) -> String {
    source.file_name().unwrap_or_else(|| {
        let hash = blake3::hash(source.to_string().as_bytes()).to_hex();
        format!("image-{}", &hash[..16])
    })
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

fn remove_if_exists(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!("failed to remove {}: {e}", path.display());
        }
    }
}

/// Local cache of downloaded base images.
///
/// Cached files are never modified by customization; callers copy an image
/// into a scratch directory before changing it.
pub struct ImageCache {
    cache_dir: PathBuf,
    http: HttpClient,
}

impl ImageCache {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            http: HttpClient::new(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Path the usable (decompressed) image for `source` would occupy.
    pub fn cached_path(&self, source: &ImageSource) -> PathBuf {
        let name = cache_file_name(source);
        let final_name = match ArchiveKind::detect(&name) {
            Some(kind) => kind.strip(&name).to_owned(),
            None => name,
        };
        match source {
            ImageSource::Path(p) => {
                // Archives from different directories may share a file name.
                let hash = blake3::hash(p.to_string_lossy().as_bytes()).to_hex();
                self.cache_dir
                    .join(format!("local-{}-{final_name}", &hash[..12]))
            }
            ImageSource::Url(_) => self.cache_dir.join(final_name),
        }
    }

    pub fn is_cached(&self, source: &ImageSource) -> bool {
        self.cached_path(source).is_file()
    }

    /// Return a local path to a usable image for `source`.
    ///
    /// Uncompressed local files are returned as-is. Everything else goes
    /// through the cache: a present entry is reused unless `force_refresh`,
    /// otherwise the source is fetched and, if archived, decompressed with
    /// the archive removed afterwards. On failure no partial file is left.
    pub fn acquire(&self, source: &ImageSource, force_refresh: bool) -> Result<PathBuf, RuntimeError> {
        let name = cache_file_name(source);
        let archive = ArchiveKind::detect(&name);

        if let ImageSource::Path(p) = source {
            if !p.is_file() {
                return Err(RuntimeError::SourceNotFound(p.clone()));
            }
            if archive.is_none() {
                debug!("using local image {}", p.display());
                return Ok(p.clone());
            }
        }

        fs::create_dir_all(&self.cache_dir)?;
        let target = self.cached_path(source);
        if target.is_file() {
            if force_refresh {
                info!("refreshing cached image {}", target.display());
                fs::remove_file(&target)?;
            } else {
                info!("using cached image {}", target.display());
                return Ok(target);
            }
        }

        match source {
            ImageSource::Url(url) => {
                let downloaded = match archive {
                    Some(_) => self.cache_dir.join(&name),
                    None => target.clone(),
                };
                self.download(url, &downloaded)?;
                if let Some(kind) = archive {
                    let result = decompress(kind, &downloaded, &target);
                    remove_if_exists(&downloaded);
                    result?;
                }
            }
            ImageSource::Path(p) => {
                if let Some(kind) = archive {
                    decompress(kind, p, &target)?;
                }
            }
        }
        Ok(target)
    }

    fn download(&self, url: &str, dest: &Path) -> Result<(), RuntimeError> {
        let partial = with_suffix(dest, ".part");
        info!("downloading {url}");
        match self.http.download_to(url, &partial) {
            Ok(bytes) => {
                fs::rename(&partial, dest).inspect_err(|_| remove_if_exists(&partial))?;
                debug!("downloaded {bytes} bytes to {}", dest.display());
                Ok(())
            }
            Err(e) => {
                remove_if_exists(&partial);
                Err(e)
            }
        }
    }
}

/// Decompress `archive` into `dest` via a `.part` file renamed on success.
fn decompress(kind: ArchiveKind, archive: &Path, dest: &Path) -> Result<(), RuntimeError> {
    let partial = with_suffix(dest, ".part");
    info!("decompressing {}", archive.display());
    let result = decompress_into(kind, archive, &partial);

    match result {
        Ok(()) => {
            fs::rename(&partial, dest).inspect_err(|_| remove_if_exists(&partial))?;
            Ok(())
        }
        Err(e) => {
            remove_if_exists(&partial);
            Err(e)
        }
    }
}

fn decompress_into(kind: ArchiveKind, archive: &Path, partial: &Path) -> Result<(), RuntimeError> {
    let fail = |reason: String| RuntimeError::Decompress {
        path: archive.to_path_buf(),
        reason,
    };
    let mut out = File::create(partial)?;
    match kind {
        ArchiveKind::Gzip => {
            let input = BufReader::new(File::open(archive)?);
            let mut decoder = flate2::read::GzDecoder::new(input);
            io::copy(&mut decoder, &mut out).map_err(|e| fail(e.to_string()))?;
        }
        ArchiveKind::Zstd => {
            let input = File::open(archive)?;
            let mut decoder =
                zstd::stream::Decoder::new(input).map_err(|e| fail(e.to_string()))?;
            io::copy(&mut decoder, &mut out).map_err(|e| fail(e.to_string()))?;
        }
        ArchiveKind::Xz => {
            let output = Command::new("xz")
                .arg("-dc")
                .arg(archive)
                .stdout(Stdio::from(out.try_clone()?))
                .stderr(Stdio::piped())
                .output()
                .map_err(|e| fail(format!("failed to run xz: {e}")))?;
            if !output.status.success() {
                return Err(fail(
                    String::from_utf8_lossy(&output.stderr).trim().to_owned(),
                ));
            }
        }
    }
    out.sync_all()?;
    Ok(())
}
