pub mod build;
pub mod completions;
pub mod generate_manifest;
pub mod import;
pub mod status;

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use templar_core::{DriftWarning, Outcome, ProgressFn, RunReport, TemplateState};

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}

/// Progress callback that mirrors lifecycle transitions onto `pb`.
pub fn spinner_progress(pb: &ProgressBar) -> ProgressFn {
    let pb = pb.clone();
    Box::new(move |name: &str, state: TemplateState| {
        if !state.is_terminal() {
            pb.set_message(format!("{name}: {state}"));
        }
    })
}

pub fn colorize_outcome(outcome: &str) -> String {
    use console::Style;
    match outcome {
        "converted" | "in-sync" => Style::new().green().apply_to(outcome).to_string(),
        "skipped" | "live-only" => Style::new().dim().apply_to(outcome).to_string(),
        "failed" => Style::new().red().bold().apply_to(outcome).to_string(),
        "drifted" | "metadata-only" => Style::new().yellow().apply_to(outcome).to_string(),
        "missing" => Style::new().blue().apply_to(outcome).to_string(),
        other => other.to_owned(),
    }
}

/// Colored `label` padded to `width` columns; escape codes do not count.
pub fn padded(label: &str, width: usize) -> String {
    let pad = width.saturating_sub(label.chars().count());
    format!("{}{}", colorize_outcome(label), " ".repeat(pad))
}

pub fn print_drift(drift: &[DriftWarning]) {
    for d in drift {
        eprintln!("{} {d}", console::Style::new().yellow().apply_to("warning:"));
    }
}

/// Human-readable table of per-template outcomes.
pub fn print_report(report: &RunReport) {
    print_drift(&report.drift);
    if report.templates.is_empty() {
        println!("no templates selected");
        return;
    }
    println!("{:<24} {:<10} DETAIL", "TEMPLATE", "OUTCOME");
    for t in &report.templates {
        let (label, detail) = match &t.outcome {
            Outcome::Converted { vmid } => ("converted", format!("vmid {vmid}")),
            Outcome::Skipped { reason } => ("skipped", reason.clone()),
            Outcome::Failed { stage, error } => ("failed", format!("{stage}: {error}")),
        };
        println!("{:<24} {} {detail}", t.name, padded(label, 10));
    }
    if report.interrupted {
        eprintln!("run interrupted; remaining templates were not started");
    }
}

pub fn summary(report: &RunReport) -> String {
    format!(
        "{} converted, {} skipped, {} failed",
        report.converted(),
        report.skipped(),
        report.failed()
    )
}

/// Finish `pb` and emit the report in the requested format.
pub fn finish_run(pb: Option<&ProgressBar>, report: &RunReport, json: bool) -> Result<u8, String> {
    if let Some(pb) = pb {
        if report.has_failures() {
            spin_fail(pb, &summary(report));
        } else {
            spin_ok(pb, &summary(report));
        }
    }
    if json {
        println!("{}", json_pretty(report)?);
    } else {
        print_report(report);
    }
    Ok(if report.has_failures() {
        EXIT_FAILURE
    } else {
        EXIT_SUCCESS
    })
}
