//! Unpacking the pack's extras archive (configs, scripts) for one side.
//!
//! The archive is read from memory. Nothing touches the target here; the
//! unpacked files are handed to the assembler like any other verified payload.

use packsmith_schema::{is_safe_relative_path, Checksum, ExtraFile, ExtrasLock, PackExtras, Side};
use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::path::Component;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ExtrasError {
    #[error("extras archive is not a readable zip: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("extras archive member '{0}' would land outside the pack")]
    UnsafeMember(String),
    #[error("extras archive member '{name}' could not be read: {source}")]
    Read {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Files unpacked from the extras archive, keyed by pack-relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnpackedExtras {
    pub files: BTreeMap<String, Vec<u8>>,
    /// Members left out by the side's exclusions.
    pub excluded: Vec<String>,
}

impl UnpackedExtras {
    /// The lock record for these files, given the archive they came from.
    pub fn lock(&self, version: &str, checksum: Checksum, url: &str) -> ExtrasLock {
        ExtrasLock::new(
            version,
            checksum,
            url,
            self.files
                .iter()
                .map(|(path, data)| ExtraFile {
                    path: path.clone(),
                    checksum: Checksum::blake3(data),
                })
                .collect(),
        )
    }
}

/// Unpack every file member of `payload` that `side` keeps.
///
/// Directory members are skipped. A member whose name would escape the pack
/// root fails the whole archive.
pub fn unpack(
    payload: &[u8],
    extras: &PackExtras,
    side: Side,
) -> Result<UnpackedExtras, ExtrasError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(payload))?;
    let mut unpacked = UnpackedExtras::default();

    for index in 0..archive.len() {
        let mut member = archive.by_index(index)?;
        if member.is_dir() || member.name().ends_with('/') {
            continue;
        }
        let name = member.name().to_owned();
        let path = member
            .enclosed_name()
            .map(|p| {
                p.components()
                    .filter_map(|c| match c {
                        Component::Normal(part) => part.to_str().map(str::to_owned),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("/")
            })
            .filter(|p| is_safe_relative_path(p))
            .ok_or_else(|| ExtrasError::UnsafeMember(name.clone()))?;

        if extras.is_excluded(&path, side) {
            debug!("extras: {path} excluded for side {side}");
            unpacked.excluded.push(path);
            continue;
        }
        let mut data = Vec::new();
        member
            .read_to_end(&mut data)
            .map_err(|source| ExtrasError::Read { name, source })?;
        unpacked.files.insert(path, data);
    }
    Ok(unpacked)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use packsmith_schema::parse_manifest_str;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    /// A zip holding `files`; names ending in `/` become directory members.
    pub(crate) fn zip_of(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in files {
            if let Some(dir) = name.strip_suffix('/') {
                writer.add_directory(dir, SimpleFileOptions::default()).unwrap();
            } else {
                writer.start_file(*name, SimpleFileOptions::default()).unwrap();
                writer.write_all(body).unwrap();
            }
        }
        writer.finish().unwrap().into_inner()
    }

    fn pack_extras() -> PackExtras {
        let text = r#"
manifest_version = 1
[pack]
name = "p"
[extras]
client_exclusions = ["serverutilities"]
server_exclusions = ["config/client.cfg"]
[extras.source]
provider = "mirror"
"#;
        parse_manifest_str(text)
            .unwrap()
            .normalize()
            .unwrap()
            .extras
            .unwrap()
    }

    fn paths(unpacked: &UnpackedExtras) -> Vec<&str> {
        unpacked.files.keys().map(String::as_str).collect()
    }

    #[test]
    fn side_exclusions_are_applied() {
        let archive = zip_of(&[
            ("config/", b""),
            ("config/client.cfg", b"c"),
            ("config/common.cfg", b"x"),
            ("serverutilities/ranks.txt", b"r"),
        ]);
        let extras = pack_extras();

        let client = unpack(&archive, &extras, Side::Client).unwrap();
        assert_eq!(paths(&client), vec!["config/client.cfg", "config/common.cfg"]);
        assert_eq!(client.excluded, vec!["serverutilities/ranks.txt"]);

        let server = unpack(&archive, &extras, Side::Server).unwrap();
        assert_eq!(
            paths(&server),
            vec!["config/common.cfg", "serverutilities/ranks.txt"]
        );

        let both = unpack(&archive, &extras, Side::Both).unwrap();
        assert_eq!(both.files.len(), 3);
        assert_eq!(both.files["config/common.cfg"], b"x");
    }

    #[test]
    fn escaping_member_fails_the_archive() {
        let archive = zip_of(&[("config/ok.cfg", b"ok"), ("../evil.sh", b"rm")]);
        assert!(matches!(
            unpack(&archive, &pack_extras(), Side::Both),
            Err(ExtrasError::UnsafeMember(ref name)) if name == "../evil.sh"
        ));
    }

    #[test]
    fn garbage_is_not_an_archive() {
        assert!(matches!(
            unpack(b"definitely not a zip", &pack_extras(), Side::Both),
            Err(ExtrasError::Archive(_))
        ));
    }

    #[test]
    fn lock_records_each_file_checksum() {
        let archive = zip_of(&[("scripts/b.zs", b"b"), ("config/a.cfg", b"a")]);
        let unpacked = unpack(&archive, &pack_extras(), Side::Both).unwrap();
        let lock = unpacked.lock("2.7.0", Checksum::blake3(&archive), "https://m.test/x.zip");
        assert_eq!(lock.files[0].path, "config/a.cfg");
        assert_eq!(lock.files[0].checksum, Checksum::blake3(b"a"));
        assert_eq!(lock.get("scripts/b.zs").unwrap().checksum, Checksum::blake3(b"b"));
    }
}
