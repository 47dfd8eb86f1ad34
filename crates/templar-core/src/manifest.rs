use crate::CoreError;
use templar_runtime::HttpClient;
use templar_schema::{
    parse_import_manifest_file, parse_import_manifest_str, ImageSource, ImportManifest,
    ManifestOrigin,
};
use tracing::info;

/// Read a manifest from a local file or an HTTP(S) URL.
///
/// The returned origin is what relative entry sources resolve against.
pub fn load_manifest(location: &str) -> Result<(ImportManifest, ManifestOrigin), CoreError> {
    match ImageSource::parse(location) {
        ImageSource::Url(url) => {
            info!("fetching manifest {url}");
            let body = HttpClient::new().get_text(&url)?;
            let manifest = parse_import_manifest_str(&body)?;
            Ok((manifest, ManifestOrigin::Remote(url)))
        }
        ImageSource::Path(path) => {
            let manifest = parse_import_manifest_file(&path)?;
            let path = std::path::absolute(&path).unwrap_or(path);
            Ok((manifest, ManifestOrigin::Local(path)))
        }
    }
}
