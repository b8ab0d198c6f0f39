use super::{green, json_pretty, lock_path_for, red, target_path_for, EXIT_FAILURE, EXIT_SUCCESS};
use packsmith_core::{verify_installed, InstalledState};
use packsmith_schema::{LockFile, Side};
use std::path::Path;

fn state_label(state: &InstalledState) -> String {
    match state {
        InstalledState::Ok => "ok".to_owned(),
        InstalledState::Missing => "missing".to_owned(),
        InstalledState::Mismatch { actual } => format!("mismatch (found {actual})"),
        InstalledState::UnsafePath => "unsafe path".to_owned(),
    }
}

pub fn run(
    manifest_path: &Path,
    target: Option<&Path>,
    lock: Option<&Path>,
    side: Side,
    json: bool,
) -> Result<u8, String> {
    let target = target_path_for(manifest_path, target, side);
    let lock_path = lock_path_for(manifest_path, lock, side);
    let lock = LockFile::read_from_file(&lock_path)
        .map_err(|e| format!("lock error: {}: {e}", lock_path.display()))?;
    let statuses = verify_installed(&target, &lock)
        .map_err(|e| format!("target error: {}: {e}", target.display()))?;
    let failed = statuses.iter().filter(|s| !s.is_ok()).count();

    if json {
        let payload = serde_json::json!({
            "checked": statuses.len(),
            "passed": statuses.len() - failed,
            "failed": statuses
                .iter()
                .filter(|s| !s.is_ok())
                .map(|s| serde_json::json!({
                    "id": s.id,
                    "path": s.path,
                    "state": state_label(&s.state),
                }))
                .collect::<Vec<_>>(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "pack integrity: {}/{} files passed",
            statuses.len() - failed,
            statuses.len()
        );
        for status in statuses.iter().filter(|s| !s.is_ok()) {
            println!(
                "  {} {} {}: {}",
                red("FAIL"),
                status.id,
                status.path,
                state_label(&status.state)
            );
        }
        if failed == 0 && !statuses.is_empty() {
            println!("  {}", green("all installed files match the lock"));
        }
    }

    Ok(if failed == 0 { EXIT_SUCCESS } else { EXIT_FAILURE })
}
