pub mod add;
pub mod build;
pub mod completions;
pub mod outdated;
pub mod pin;
pub mod plan;
pub mod verify;

use indicatif::{ProgressBar, ProgressStyle};
use packsmith_core::{CoreError, Pipeline, ShutdownFlag};
use packsmith_remote::{HttpTransport, ProviderSet, RemoteConfig, Transport};
use packsmith_schema::{parse_manifest_file, ManifestV1, NormalizedManifest, Side};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_MANIFEST_ERROR: u8 = 2;
pub const EXIT_LOCK_ERROR: u8 = 3;

pub const LOCK_FILE_NAME: &str = "packsmith.lock";
pub const TARGET_DIR_NAME: &str = "pack";

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        pb.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    }
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn finish(pb: &ProgressBar, msg: String) {
    if let Ok(style) = ProgressStyle::with_template("{msg}") {
        pb.set_style(style);
    }
    pb.finish_with_message(msg);
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    finish(pb, format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    finish(pb, format!("✗ {msg}"));
}

/// Directory the manifest lives in; relative defaults resolve against it.
fn manifest_dir(manifest: &Path) -> PathBuf {
    match manifest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Default lock file name. Single-side builds get their own lock so that a
/// client build never reconciles away a server build's entries.
fn lock_file_name(side: Side) -> String {
    match side {
        Side::Both => LOCK_FILE_NAME.to_owned(),
        side => format!("packsmith-{side}.lock"),
    }
}

fn target_dir_name(side: Side) -> String {
    match side {
        Side::Both => TARGET_DIR_NAME.to_owned(),
        side => format!("{TARGET_DIR_NAME}-{side}"),
    }
}

pub fn lock_path_for(manifest: &Path, lock: Option<&Path>, side: Side) -> PathBuf {
    lock.map_or_else(
        || manifest_dir(manifest).join(lock_file_name(side)),
        Path::to_path_buf,
    )
}

pub fn target_path_for(manifest: &Path, target: Option<&Path>, side: Side) -> PathBuf {
    target.map_or_else(
        || manifest_dir(manifest).join(target_dir_name(side)),
        Path::to_path_buf,
    )
}

pub fn read_manifest(path: &Path) -> Result<ManifestV1, String> {
    parse_manifest_file(path).map_err(|e| format!("manifest error: {}: {e}", path.display()))
}

pub fn load_manifest(path: &Path) -> Result<NormalizedManifest, String> {
    read_manifest(path)?
        .normalize()
        .map_err(|e| format!("manifest error: {e}"))
}

pub fn load_config(path: Option<&Path>) -> Result<RemoteConfig, String> {
    match path {
        Some(p) => RemoteConfig::load(p),
        None => RemoteConfig::load_default(),
    }
    .map_err(|e| format!("config error: {e}"))
}

/// A pipeline over real HTTP with the standard provider set.
pub fn make_pipeline(config: Option<&Path>, shutdown: &ShutdownFlag) -> Result<Pipeline, String> {
    let config = load_config(config)?;
    tracing::debug!(
        "remote: github_api={} mirror={:?} timeout={}s",
        config.github_api,
        config.mirror_url,
        config.timeout_secs
    );
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(config.clone()));
    let providers = ProviderSet::standard(&config, &transport);
    Ok(Pipeline::new(Arc::new(providers), transport).with_shutdown(shutdown.clone()))
}

/// Prefix core errors so `main` can pick the exit code.
pub fn core_error(err: CoreError) -> String {
    match err {
        CoreError::Manifest(_) | CoreError::Lock(_) => err.to_string(),
        CoreError::TargetLocked(_) => format!("target error: {err}"),
        other => other.to_string(),
    }
}

pub fn green(text: &str) -> String {
    console::Style::new().green().apply_to(text).to_string()
}

pub fn yellow(text: &str) -> String {
    console::Style::new().yellow().apply_to(text).to_string()
}

pub fn red(text: &str) -> String {
    console::Style::new().red().apply_to(text).to_string()
}
