//! CLI subprocess integration tests.
//!
//! These tests invoke the `templar` binary against the persisted mock
//! backend and verify exit codes, stdout content, and JSON output stability.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

struct Fixture {
    dir: tempfile::TempDir,
}

impl Fixture {
    fn new(templates: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("base.qcow2");
        std::fs::write(&image, b"cloud image bytes").unwrap();

        let entries: Vec<String> = templates
            .iter()
            .map(|name| {
                format!(
                    r#""{name}": {{"image_url": "{}", "run_commands": ["echo {name} > /etc/motd"]}}"#,
                    image.display()
                )
            })
            .collect();
        std::fs::write(
            dir.path().join("templates.json"),
            format!("{{{}}}", entries.join(",")),
        )
        .unwrap();
        Self { dir }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn state_dir(&self) -> PathBuf {
        self.path().join("state")
    }

    fn templar(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_templar"));
        cmd.env("TEMPLAR_SKIP_PREREQS", "1")
            .env_remove("TEMPLAR_LOG")
            .arg("--backend")
            .arg("mock")
            .arg("--state-dir")
            .arg(self.state_dir())
            .arg("--catalog")
            .arg(self.path().join("templates.json"));
        cmd
    }

    fn seed_platform(&self, state: &serde_json::Value) {
        std::fs::create_dir_all(self.state_dir()).unwrap();
        std::fs::write(
            self.state_dir().join("mock-platform.json"),
            serde_json::to_string_pretty(state).unwrap(),
        )
        .unwrap();
    }

    fn seed_metadata(&self, metadata: &serde_json::Value) {
        std::fs::create_dir_all(self.state_dir()).unwrap();
        std::fs::write(
            self.state_dir().join("metadata.json"),
            serde_json::to_string_pretty(metadata).unwrap(),
        )
        .unwrap();
    }

    fn metadata(&self) -> serde_json::Value {
        let raw = std::fs::read_to_string(self.state_dir().join("metadata.json")).unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    fn platform(&self) -> serde_json::Value {
        let raw = std::fs::read_to_string(self.state_dir().join("mock-platform.json")).unwrap();
        serde_json::from_str(&raw).unwrap()
    }
}

fn stdout_json(output: &Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(&stdout).unwrap_or_else(|e| panic!("invalid JSON ({e}): {stdout}"))
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn cli_version_exits_zero() {
    let output = Command::new(env!("CARGO_BIN_EXE_templar"))
        .arg("--version")
        .output()
        .unwrap();
    assert!(output.status.success(), "templar --version must exit 0");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("templar"), "{stdout}");
}

#[test]
fn cli_help_lists_commands() {
    let output = Command::new(env!("CARGO_BIN_EXE_templar"))
        .arg("--help")
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for cmd in ["build", "update", "rebuild", "status", "import", "generate-manifest"] {
        assert!(stdout.contains(cmd), "help must list '{cmd}': {stdout}");
    }
}

#[test]
fn cli_build_json_output_stable() {
    let fx = Fixture::new(&["alma-9", "debian-12"]);
    let output = fx.templar().args(["build", "--json"]).output().unwrap();
    assert!(output.status.success(), "build failed: {}", stderr(&output));

    let report = stdout_json(&output);
    let templates = report["templates"].as_array().unwrap();
    assert_eq!(templates.len(), 2);
    assert_eq!(templates[0]["name"], "alma-9");
    assert_eq!(templates[0]["outcome"], "converted");
    assert_eq!(templates[0]["vmid"], 9000);
    assert_eq!(templates[1]["name"], "debian-12");
    assert_eq!(templates[1]["vmid"], 9001);
    assert_eq!(report["interrupted"], false);
    assert!(report["drift"].as_array().unwrap().is_empty());

    let metadata = fx.metadata();
    assert_eq!(metadata["debian-12"]["vmid"], 9001);
    assert!(metadata["debian-12"]["build_date"].is_string());
    assert_eq!(fx.platform()["resources"]["9001"]["is_template"], true);
}

#[test]
fn cli_second_build_skips_existing() {
    let fx = Fixture::new(&["debian-12"]);
    assert!(fx.templar().arg("build").output().unwrap().status.success());

    let output = fx.templar().args(["build", "--json"]).output().unwrap();
    assert!(output.status.success());
    let report = stdout_json(&output);
    assert_eq!(report["templates"][0]["outcome"], "skipped");
}

#[test]
fn cli_build_text_output_lists_outcomes() {
    let fx = Fixture::new(&["debian-12"]);
    let output = fx.templar().arg("build").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("debian-12"), "{stdout}");
    assert!(stdout.contains("vmid 9000"), "{stdout}");
}

#[test]
fn cli_update_keeps_identifier() {
    let fx = Fixture::new(&["debian-12"]);
    fx.seed_platform(&serde_json::json!({
        "resources": {"9003": {"name": "debian-12", "is_template": true}}
    }));
    fx.seed_metadata(&serde_json::json!({
        "debian-12": {"vmid": 9003, "build_date": "2026-01-01T00:00:00Z"}
    }));

    let output = fx.templar().args(["update", "--json"]).output().unwrap();
    assert!(output.status.success(), "update failed: {}", stderr(&output));
    let report = stdout_json(&output);
    assert_eq!(report["templates"][0]["outcome"], "converted");
    assert_eq!(report["templates"][0]["vmid"], 9003);

    let metadata = fx.metadata();
    assert_eq!(metadata["debian-12"]["build_date"], "2026-01-01T00:00:00Z");
    assert!(metadata["debian-12"]["last_update"].is_string());
    let resources = fx.platform()["resources"].as_object().unwrap().clone();
    assert_eq!(resources.len(), 1, "staging copy must be gone: {resources:?}");
}

#[test]
fn cli_status_reports_drift_without_mutation() {
    let fx = Fixture::new(&["alma-9", "debian-12"]);
    fx.seed_platform(&serde_json::json!({
        "resources": {"9010": {"name": "debian-12", "is_template": true}}
    }));
    fx.seed_metadata(&serde_json::json!({"debian-12": {"vmid": 9005}}));
    let platform_before = fx.platform();

    let output = fx.templar().args(["status", "--json"]).output().unwrap();
    assert!(output.status.success(), "{}", stderr(&output));
    let report = stdout_json(&output);
    assert_eq!(report["templates"][0]["name"], "alma-9");
    assert_eq!(report["templates"][0]["status"], "missing");
    assert_eq!(report["templates"][1]["status"], "drifted");
    assert_eq!(report["drift"][0]["stored_vmid"], 9005);
    assert_eq!(report["drift"][0]["live_vmid"], 9010);

    assert_eq!(fx.metadata(), serde_json::json!({"debian-12": {"vmid": 9005}}));
    assert_eq!(fx.platform(), platform_before);
}

#[test]
fn cli_unknown_template_is_config_error() {
    let fx = Fixture::new(&["debian-12"]);
    let output = fx
        .templar()
        .args(["build", "--only", "debian-12,nonexistent"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("nonexistent"), "{}", stderr(&output));
    assert!(!fx.state_dir().join("mock-platform.json").exists());
}

#[test]
fn cli_missing_catalog_is_config_error() {
    let fx = Fixture::new(&[]);
    std::fs::remove_file(fx.path().join("templates.json")).unwrap();
    let output = fx.templar().arg("build").output().unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("catalog error"), "{}", stderr(&output));
}

#[test]
fn cli_invalid_config_file_is_config_error() {
    let fx = Fixture::new(&["debian-12"]);
    let config = fx.path().join("templar.toml");
    std::fs::write(&config, "vmid_minimum = 100\n").unwrap();
    let output = fx
        .templar()
        .arg("--config")
        .arg(&config)
        .arg("status")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2), "{}", stderr(&output));
}

#[test]
fn cli_template_failure_exits_one() {
    let fx = Fixture::new(&[]);
    let image = fx.path().join("base.qcow2");
    std::fs::write(
        fx.path().join("templates.json"),
        format!(
            r#"{{
                "alma-9": {{"image_url": "{}"}},
                "debian-12": {{"image_url": "{}"}}
            }}"#,
            fx.path().join("missing.qcow2").display(),
            image.display()
        ),
    )
    .unwrap();

    let output = fx.templar().args(["build", "--json"]).output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    let report = stdout_json(&output);
    assert_eq!(report["templates"][0]["outcome"], "failed");
    assert_eq!(report["templates"][0]["stage"], "acquiring");
    assert_eq!(report["templates"][1]["outcome"], "converted");
    assert_eq!(report["templates"][1]["vmid"], 9000);

    let metadata = fx.metadata();
    assert!(metadata.get("alma-9").is_none());
    assert!(metadata.get("debian-12").is_some());
}

#[test]
fn cli_generate_manifest_then_import() {
    let fx = Fixture::new(&[]);
    let images = fx.path().join("images");
    std::fs::create_dir_all(&images).unwrap();
    std::fs::write(images.join("debian-12.qcow2"), b"prebuilt").unwrap();
    std::fs::write(images.join("README.txt"), b"not an image").unwrap();
    let manifest = images.join("imports.json");

    let output = fx
        .templar()
        .arg("generate-manifest")
        .arg(&images)
        .arg("--output")
        .arg(&manifest)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", stderr(&output));
    let written: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&manifest).unwrap()).unwrap();
    assert_eq!(written, serde_json::json!({"debian-12": {"source": "debian-12.qcow2"}}));

    let output = fx
        .templar()
        .arg("import")
        .arg(&manifest)
        .arg("--json")
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", stderr(&output));
    let report = stdout_json(&output);
    assert_eq!(report["templates"][0]["name"], "debian-12");
    assert_eq!(report["templates"][0]["outcome"], "converted");

    let output = fx
        .templar()
        .arg("import")
        .arg(&manifest)
        .arg("--json")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(stdout_json(&output)["templates"][0]["outcome"], "skipped");
}

#[test]
fn cli_import_missing_manifest_is_config_error() {
    let fx = Fixture::new(&[]);
    let output = fx
        .templar()
        .args(["import", "/nonexistent/imports.json"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2), "{}", stderr(&output));
}

#[test]
fn cli_completions_bash() {
    let output = Command::new(env!("CARGO_BIN_EXE_templar"))
        .args(["completions", "bash"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("templar"));
}
