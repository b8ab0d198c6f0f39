use super::{json_pretty, lock_path_for, read_manifest, EXIT_FAILURE, EXIT_SUCCESS};
use packsmith_schema::{LockFile, Side};
use std::path::Path;

pub fn run(
    manifest_path: &Path,
    lock: Option<&Path>,
    side: Side,
    check: bool,
    json: bool,
) -> Result<u8, String> {
    let manifest = read_manifest(manifest_path)?;
    let lock_path = lock_path_for(manifest_path, lock, side);
    let lock = LockFile::read_from_file(&lock_path)
        .map_err(|e| format!("lock error: {}: {e}", lock_path.display()))?;

    let mut pinned = manifest.clone();
    let changed = pinned.pin_from_lock(&lock);

    if check {
        if json {
            let payload = serde_json::json!({
                "status": if changed.is_empty() { "pinned" } else { "unpinned" },
                "manifest": manifest_path,
                "unpinned": changed,
            });
            println!("{}", json_pretty(&payload)?);
        } else if !changed.is_empty() {
            eprintln!(
                "not pinned to {}: {} (run 'packsmith pin')",
                lock_path.display(),
                changed.join(", ")
            );
        }
        return Ok(if changed.is_empty() {
            EXIT_SUCCESS
        } else {
            EXIT_FAILURE
        });
    }

    if !changed.is_empty() {
        pinned
            .normalize()
            .map_err(|e| format!("manifest error: pinned manifest is invalid: {e}"))?;
        pinned
            .write_to_file(manifest_path)
            .map_err(|e| format!("manifest error: {e}"))?;
    }

    if json {
        let payload = serde_json::json!({
            "status": "pinned",
            "manifest": manifest_path,
            "changed": changed,
        });
        println!("{}", json_pretty(&payload)?);
    } else if changed.is_empty() {
        println!("{} is already pinned", manifest_path.display());
    } else {
        println!(
            "pinned {} mod(s) in {}: {}",
            changed.len(),
            manifest_path.display(),
            changed.join(", ")
        );
    }
    Ok(EXIT_SUCCESS)
}
