use super::{finish_run, spinner, spinner_progress};
use crate::settings::Settings;
use templar_core::{load_manifest, Selection};

/// Import the prebuilt images listed in `location`.
///
/// The catalog is optional here; it is only consulted for entries that ask
/// for customization or to borrow per-template VM settings.
pub fn run(
    settings: &Settings,
    location: &str,
    selection: &Selection,
    force: bool,
    json: bool,
) -> Result<u8, String> {
    let (manifest, origin) = load_manifest(location).map_err(|e| e.to_string())?;
    let mut engine = settings.open_engine(false)?;

    let pb = (!json).then(|| spinner(&format!("importing from {location}...")));
    if let Some(pb) = &pb {
        engine = engine.with_progress(spinner_progress(pb));
    }

    let report = match engine.import_manifest(&manifest, &origin, selection, force) {
        Ok(report) => report,
        Err(e) => {
            if let Some(pb) = &pb {
                pb.finish_and_clear();
            }
            return Err(e.to_string());
        }
    };
    finish_run(pb.as_ref(), &report, json)
}
