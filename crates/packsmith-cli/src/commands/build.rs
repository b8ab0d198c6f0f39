use super::{
    core_error, green, json_pretty, load_manifest, lock_path_for, make_pipeline, red, spin_fail,
    spin_ok, spinner, target_path_for, yellow, EXIT_FAILURE, EXIT_SUCCESS,
};
use packsmith_core::{BuildOptions, BuildReport, ShutdownFlag};
use packsmith_schema::LockEntry;
use std::path::Path;

pub fn run(
    manifest_path: &Path,
    target: Option<&Path>,
    lock: Option<&Path>,
    options: &BuildOptions,
    config: Option<&Path>,
    shutdown: &ShutdownFlag,
    json: bool,
) -> Result<u8, String> {
    let manifest = load_manifest(manifest_path)?;
    let target = target_path_for(manifest_path, target, options.side);
    let lock_path = lock_path_for(manifest_path, lock, options.side);
    let pipeline = make_pipeline(config, shutdown)?;

    let pb = (!json).then(|| {
        spinner(&format!(
            "building {} ({} mods)...",
            manifest.pack_name,
            manifest.entries.len()
        ))
    });
    let report = match pipeline.build(&manifest, &target, &lock_path, options) {
        Ok(report) => report,
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "build failed");
            }
            return Err(core_error(e));
        }
    };
    if let Some(ref pb) = pb {
        if report.is_success() {
            spin_ok(pb, &format!("built {} into {}", report.pack_name, target.display()));
        } else if report.committed() {
            spin_fail(pb, "build finished with failures");
        } else {
            spin_fail(pb, "build failed, pack left untouched");
        }
    }

    print_report(&report, json, status_label(&report))?;
    Ok(if report.is_success() {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    })
}

fn status_label(report: &BuildReport) -> &'static str {
    match (report.is_success(), report.committed()) {
        (true, _) => "built",
        (false, true) => "partial",
        (false, false) => "failed",
    }
}

fn entry_json(entry: &LockEntry) -> serde_json::Value {
    serde_json::json!({
        "id": entry.id,
        "version": entry.version,
        "checksum": entry.checksum.to_string(),
        "path": entry.path,
    })
}

/// Print the plan, failures and trust notes of a build or dry run.
pub fn print_report(report: &BuildReport, json: bool, status: &str) -> Result<(), String> {
    let plan = &report.plan;
    if json {
        let payload = serde_json::json!({
            "pack": report.pack_name,
            "status": status,
            "added": plan.to_add.iter().map(entry_json).collect::<Vec<_>>(),
            "updated": plan.to_update.iter().map(|u| serde_json::json!({
                "id": u.new.id,
                "from": u.old.version,
                "to": u.new.version,
                "path": u.new.path,
            })).collect::<Vec<_>>(),
            "removed": plan.to_remove.iter().map(entry_json).collect::<Vec<_>>(),
            "unchanged": plan.unchanged.len(),
            "extras": plan.extras.next.as_ref().map(|x| serde_json::json!({
                "version": x.version,
                "files": x.files.len(),
                "written": plan.extras.to_write.iter().map(|f| &f.path).collect::<Vec<_>>(),
                "removed": plan.extras.to_remove.iter().map(|f| &f.path).collect::<Vec<_>>(),
                "excluded": report.extras_excluded,
            })),
            "failures": report.failures.iter().map(|f| serde_json::json!({
                "id": f.id,
                "stage": f.stage.to_string(),
                "message": f.message,
            })).collect::<Vec<_>>(),
            "first_use": report.first_use,
            "downloaded": report.downloaded.len(),
            "lock_written": report.assembly.as_ref().is_some_and(|a| a.lock_written),
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(());
    }

    for entry in &plan.to_add {
        println!("  {} {} {}", green("+"), entry.id, entry.version);
    }
    for update in &plan.to_update {
        println!(
            "  {} {} {} -> {}",
            yellow("~"),
            update.new.id,
            update.old.version,
            update.new.version
        );
    }
    for entry in &plan.to_remove {
        println!("  {} {} {}", red("-"), entry.id, entry.version);
    }
    if !plan.extras.is_noop() {
        let version = plan.extras.next.as_ref().map_or("removed", |x| x.version.as_str());
        println!(
            "  {} extras {version}: {} file(s) written, {} removed, {} excluded",
            yellow("~"),
            plan.extras.to_write.len(),
            plan.extras.to_remove.len(),
            report.extras_excluded.len()
        );
    }
    if plan.is_noop() {
        println!("  nothing to change ({} unchanged)", plan.unchanged.len());
    }
    for id in &report.first_use {
        println!(
            "  {} {id}: no checksum published, recorded on first use",
            yellow("!")
        );
    }
    for failure in &report.failures {
        println!(
            "  {} {} ({}): {}",
            red("✗"),
            failure.id,
            failure.stage,
            failure.message
        );
    }
    Ok(())
}
