use super::{json_pretty, make_pipeline, read_manifest, EXIT_SUCCESS};
use packsmith_core::{BuildOptions, ShutdownFlag};
use packsmith_schema::{ModSection, Side, SourceSection};
use std::path::Path;

/// A GitHub-hosted mod to declare.
#[derive(Debug, Clone)]
pub struct NewMod {
    pub id: String,
    pub repo: String,
    pub version: String,
    pub asset: Option<String>,
    pub side: Side,
}

impl NewMod {
    fn section(&self) -> ModSection {
        ModSection {
            id: self.id.trim().to_owned(),
            version: self.version.trim().to_owned(),
            checksum: None,
            side: self.side,
            install_dir: None,
            source: SourceSection::Github {
                repo: self.repo.trim().to_owned(),
                asset: self.asset.clone(),
                prerelease: false,
            },
        }
    }
}

pub fn run(
    manifest_path: &Path,
    new_mod: &NewMod,
    config: Option<&Path>,
    json: bool,
) -> Result<u8, String> {
    let mut manifest = read_manifest(manifest_path)?;
    let section = new_mod.section();
    if manifest.mods.iter().any(|m| m.id.trim() == section.id) {
        return Err(format!(
            "manifest error: mod '{}' is already declared",
            section.id
        ));
    }
    manifest.mods.push(section);
    let normalized = manifest
        .normalize()
        .map_err(|e| format!("manifest error: {e}"))?;
    let entry = normalized
        .get(new_mod.id.trim())
        .ok_or_else(|| format!("manifest error: mod '{}' was not accepted", new_mod.id))?;

    let pipeline = make_pipeline(config, &ShutdownFlag::new())?;
    let reference = pipeline
        .resolve_entry(entry, &BuildOptions::default())
        .map_err(|e| format!("cannot add {}: {e}", entry.id))?;

    manifest
        .write_to_file(manifest_path)
        .map_err(|e| format!("manifest error: {e}"))?;

    if json {
        let payload = serde_json::json!({
            "status": "added",
            "id": entry.id,
            "selector": entry.selector.to_string(),
            "resolves_to": reference.version,
            "file": reference.file_name,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "added {} ({}), currently resolves to {} ({})",
            entry.id, entry.selector, reference.version, reference.file_name
        );
    }
    Ok(EXIT_SUCCESS)
}
