use super::build::print_report;
use super::{
    core_error, load_manifest, lock_path_for, make_pipeline, target_path_for, EXIT_FAILURE,
    EXIT_SUCCESS,
};
use packsmith_core::{BuildOptions, ShutdownFlag};
use std::path::Path;

pub fn run(
    manifest_path: &Path,
    target: Option<&Path>,
    lock: Option<&Path>,
    options: &BuildOptions,
    config: Option<&Path>,
    json: bool,
) -> Result<u8, String> {
    let manifest = load_manifest(manifest_path)?;
    let target = target_path_for(manifest_path, target, options.side);
    let lock_path = lock_path_for(manifest_path, lock, options.side);
    let pipeline = make_pipeline(config, &ShutdownFlag::new())?;

    let report = pipeline
        .plan(&manifest, &target, &lock_path, options)
        .map_err(core_error)?;
    if !json {
        println!(
            "plan for {}: {} change(s)",
            report.pack_name,
            report.plan.action_count()
        );
    }
    print_report(&report, json, "planned")?;
    Ok(if report.is_success() {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    })
}
