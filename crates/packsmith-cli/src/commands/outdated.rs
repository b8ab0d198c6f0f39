use super::{
    core_error, json_pretty, load_manifest, lock_path_for, make_pipeline, yellow, EXIT_SUCCESS,
};
use packsmith_core::{BuildOptions, ShutdownFlag};
use packsmith_schema::LockFile;
use std::path::Path;

pub fn run(
    manifest_path: &Path,
    lock: Option<&Path>,
    options: &BuildOptions,
    config: Option<&Path>,
    json: bool,
) -> Result<u8, String> {
    let manifest = load_manifest(manifest_path)?;
    let lock_path = lock_path_for(manifest_path, lock, options.side);
    let lock = LockFile::read_optional(&lock_path)
        .map_err(|e| format!("lock error: {}: {e}", lock_path.display()))?;
    let pipeline = make_pipeline(config, &ShutdownFlag::new())?;

    let entries = pipeline
        .check_outdated(&manifest, lock.as_ref(), options)
        .map_err(core_error)?;

    if json {
        let payload: Vec<_> = entries
            .iter()
            .map(|e| {
                serde_json::json!({
                    "id": e.id,
                    "locked": e.locked,
                    "latest": e.latest,
                    "outdated": e.is_outdated(),
                    "error": e.error,
                })
            })
            .collect();
        println!("{}", json_pretty(&payload)?);
        return Ok(EXIT_SUCCESS);
    }

    let mut any = false;
    for entry in &entries {
        if let Some(ref error) = entry.error {
            println!("  {} {}: {error}", yellow("?"), entry.id);
        } else if entry.is_outdated() {
            any = true;
            println!(
                "  {} {} -> {}",
                entry.id,
                entry.locked.as_deref().unwrap_or("(not installed)"),
                entry.latest.as_deref().unwrap_or("?")
            );
        }
    }
    if !any {
        println!("all entries are up to date");
    }
    Ok(EXIT_SUCCESS)
}
