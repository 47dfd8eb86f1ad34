use super::{json_pretty, padded, print_drift, EXIT_SUCCESS};
use crate::settings::Settings;
use templar_core::Selection;

/// Report each selected template against metadata and the live platform.
/// Never mutates either side; drift is a warning, not a failure.
pub fn run(settings: &Settings, selection: &Selection, json: bool) -> Result<u8, String> {
    let engine = settings.open_engine(true)?;
    let report = engine.status(selection).map_err(|e| e.to_string())?;

    if json {
        println!("{}", json_pretty(&report)?);
        return Ok(EXIT_SUCCESS);
    }

    print_drift(&report.drift);
    if report.templates.is_empty() {
        println!("no templates selected");
        return Ok(EXIT_SUCCESS);
    }
    println!(
        "{:<24} {:<14} {:<8} {:<8} LAST UPDATE",
        "TEMPLATE", "STATUS", "STORED", "LIVE"
    );
    for t in &report.templates {
        let vmid = |v: Option<u32>| v.map_or_else(|| "-".to_owned(), |v| v.to_string());
        println!(
            "{:<24} {} {:<8} {:<8} {}",
            t.name,
            padded(t.status.as_str(), 14),
            vmid(t.stored_vmid),
            vmid(t.live_vmid),
            t.last_update.as_deref().unwrap_or("-"),
        );
    }
    Ok(EXIT_SUCCESS)
}
