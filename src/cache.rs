use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

/// On-disk cache of raw reference tables, one file per key under `root`.
#[derive(Debug, Clone)]
pub struct CatalogCache {
    root: PathBuf,
}

impl CatalogCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<cache dir>/ooi-m2m`, e.g. `~/.cache/ooi-m2m` on Linux.
    pub fn default_location() -> Result<Self> {
        dirs::cache_dir()
            .map(|d| Self::new(d.join("ooi-m2m")))
            .ok_or_else(|| Error::Config("no cache directory available on this platform".into()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path for `key`. Anything outside `[A-Za-z0-9._-]` becomes `_`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(name.trim_start_matches('.'))
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                debug!(path = %path.display(), "cache hit");
                Ok(Some(text))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn put(&self, key: &str, value: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.root)?;
        let path = self.path_for(key);
        let tmp = path.with_extension("partial");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        Ok(path)
    }

    /// Returns whether an entry was removed.
    pub fn invalidate(&self, key: &str) -> Result<bool> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
