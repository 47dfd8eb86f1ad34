use super::{json_pretty, EXIT_SUCCESS};
use std::path::Path;
use templar_schema::generate_manifest;

pub fn run(
    dir: &Path,
    base_url: Option<&str>,
    output: Option<&Path>,
    json: bool,
) -> Result<u8, String> {
    let manifest = generate_manifest(dir, base_url).map_err(|e| format!("manifest error: {e}"))?;
    let rendered = manifest
        .to_json_pretty()
        .map_err(|e| format!("manifest error: {e}"))?;

    let Some(output) = output else {
        println!("{rendered}");
        return Ok(EXIT_SUCCESS);
    };

    std::fs::write(output, format!("{rendered}\n"))
        .map_err(|e| format!("failed to write {}: {e}", output.display()))?;
    if json {
        let summary = serde_json::json!({
            "output": output,
            "templates": manifest.names(),
        });
        println!("{}", json_pretty(&summary)?);
    } else {
        println!(
            "wrote {} entr{} to {}",
            manifest.len(),
            if manifest.len() == 1 { "y" } else { "ies" },
            output.display()
        );
    }
    Ok(EXIT_SUCCESS)
}
