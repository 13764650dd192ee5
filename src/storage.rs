//! Where session files live.

use std::path::PathBuf;

/// Returns a writable directory, or `None` while storage is unavailable.
pub trait StorageDirResolver: Send + Sync {
    fn resolve(&self) -> Option<PathBuf>;
}

/// A fixed directory, created on first resolve.
#[derive(Clone, Debug)]
pub struct FixedDirectory {
    path: PathBuf,
}

impl FixedDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `$HOME/.flight_tracker/tracks` when a home directory is known
    pub fn default_location() -> Option<Self> {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .map(|home| Self::new(home.join(".flight_tracker").join("tracks")))
    }
}

impl StorageDirResolver for FixedDirectory {
    fn resolve(&self) -> Option<PathBuf> {
        match std::fs::create_dir_all(&self.path) {
            Ok(()) => Some(self.path.clone()),
            Err(e) => {
                log::error!(
                    "[storage] track directory {} unavailable: {}",
                    self.path.display(),
                    e
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_directory_created() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = FixedDirectory::new(tmp.path().join("a").join("b"));
        let resolved = dir.resolve().unwrap();
        assert!(resolved.is_dir());
    }

    #[test]
    fn test_unwritable_directory_not_ready() {
        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("plain-file");
        std::fs::write(&file, b"x").unwrap();
        let dir = FixedDirectory::new(file.join("tracks"));
        assert_eq!(dir.resolve(), None);
    }
}
