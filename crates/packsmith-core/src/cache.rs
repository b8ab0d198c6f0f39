use packsmith_schema::Checksum;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Content-addressed download cache keyed by artifact checksum.
///
/// Files are named `<algorithm>-<hex>`. Writes are atomic via `NamedTempFile`,
/// and reads re-hash the content; a corrupted entry is evicted and reported as
/// a miss.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    root: PathBuf,
}

impl ArtifactCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$XDG_CACHE_HOME/packsmith` or `~/.cache/packsmith`.
    pub fn default_root() -> Option<PathBuf> {
        if let Some(xdg) = std::env::var_os("XDG_CACHE_HOME") {
            if !xdg.is_empty() {
                return Some(PathBuf::from(xdg).join("packsmith"));
            }
        }
        std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".cache/packsmith"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, checksum: &Checksum) -> PathBuf {
        self.root.join(checksum.cache_key())
    }

    pub fn contains(&self, checksum: &Checksum) -> bool {
        self.path_for(checksum).exists()
    }

    /// Cached bytes for `checksum`, or `None` on a miss.
    pub fn get(&self, checksum: &Checksum) -> std::io::Result<Option<Vec<u8>>> {
        let path = self.path_for(checksum);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        if !checksum.matches(&data) {
            warn!("cache entry {} is corrupted, evicting", path.display());
            self.evict(checksum)?;
            return Ok(None);
        }
        debug!("cache hit: {checksum}");
        Ok(Some(data))
    }

    /// Store verified bytes. Idempotent: an existing entry is left alone.
    pub fn put(&self, checksum: &Checksum, data: &[u8]) -> std::io::Result<()> {
        let dest = self.path_for(checksum);
        if dest.exists() {
            return Ok(());
        }
        fs::create_dir_all(&self.root)?;
        let mut tmp = NamedTempFile::new_in(&self.root)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&dest).map_err(|e| e.error)?;
        debug!("cached {checksum} ({} bytes)", data.len());
        Ok(())
    }

    fn evict(&self, checksum: &Checksum) -> std::io::Result<()> {
        match fs::remove_file(self.path_for(checksum)) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_and_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path().join("cache"));
        let sum = Checksum::blake3(b"jar");

        assert!(cache.get(&sum).unwrap().is_none());
        cache.put(&sum, b"jar").unwrap();
        assert!(cache.contains(&sum));
        assert_eq!(cache.get(&sum).unwrap().unwrap(), b"jar");
    }

    #[test]
    fn corrupted_entry_is_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path());
        let sum = Checksum::blake3(b"jar");
        cache.put(&sum, b"jar").unwrap();

        fs::write(dir.path().join(sum.cache_key()), b"bit rot").unwrap();
        assert!(cache.get(&sum).unwrap().is_none());
        assert!(!cache.contains(&sum));
    }

    #[test]
    fn put_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path());
        let sum = Checksum::blake3(b"jar");
        cache.put(&sum, b"jar").unwrap();
        cache.put(&sum, b"jar").unwrap();
        assert_eq!(cache.get(&sum).unwrap().unwrap(), b"jar");
        cache.evict(&sum).unwrap();
        cache.evict(&sum).unwrap();
        assert!(!cache.contains(&sum));
    }
}
