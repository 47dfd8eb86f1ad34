use super::{finish_run, spinner, spinner_progress};
use crate::settings::Settings;
use templar_core::{RunMode, Selection};

/// Build, update, or rebuild the selected catalog templates.
pub fn run(
    settings: &Settings,
    mode: RunMode,
    selection: &Selection,
    json: bool,
) -> Result<u8, String> {
    let mut engine = settings.open_engine(true)?;
    let pb = (!json).then(|| spinner(&format!("{} templates...", verb(mode))));
    if let Some(pb) = &pb {
        engine = engine.with_progress(spinner_progress(pb));
    }

    let report = match engine.run(mode, selection) {
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

fn verb(mode: RunMode) -> &'static str {
    match mode {
        RunMode::Build => "building",
        RunMode::Update => "updating",
        RunMode::Rebuild => "rebuilding",
    }
}
