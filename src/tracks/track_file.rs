use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

pub const TRACK_PREFIX: &str = "track_";
pub const TRACK_SUFFIX: &str = ".csv.gz";
/// Subdirectory of the track directory holding uploaded sessions
pub const SYNCED_DIR: &str = "synced";

/// A session file on local storage.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TrackFile {
    path: PathBuf,
}

impl TrackFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Pick an unused `track_<timestamp>[_<n>].csv.gz` name in `dir`
    pub fn create_in(dir: &Path, now: DateTime<Local>) -> Self {
        let stamp = now.format("%Y-%m-%d_%H-%M-%S").to_string();
        let mut path = dir.join(format!("{TRACK_PREFIX}{stamp}{TRACK_SUFFIX}"));
        let mut n = 2;
        while path.exists() {
            path = dir.join(format!("{TRACK_PREFIX}{stamp}_{n}{TRACK_SUFFIX}"));
            n += 1;
        }
        Self { path }
    }

    /// Whether a file name follows the session naming pattern
    pub fn matches_pattern(file_name: &str) -> bool {
        file_name.starts_with(TRACK_PREFIX) && file_name.ends_with(TRACK_SUFFIX)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// `track_2024-01-02_03-04-05.csv.gz` → `2024.01.02 03.04.05`
    pub fn display_name(&self) -> String {
        let name = self.file_name();
        let stem = name.strip_suffix(TRACK_SUFFIX).unwrap_or(&name);
        let stem = stem.strip_prefix(TRACK_PREFIX).unwrap_or(stem);
        stem.replace('_', " ").replace('-', ".")
    }

    pub fn size_bytes(&self) -> io::Result<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    pub fn size_kb(&self) -> u64 {
        self.size_bytes().map(|b| b / 1024).unwrap_or(0)
    }

    /// Move an uploaded session into `synced/` next to it. Directory scans
    /// only look at the top level, so the file is never offered for upload
    /// again, even by a later process.
    pub fn move_to_synced(&self) -> io::Result<TrackFile> {
        let parent = self.path.parent().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "track file has no parent directory")
        })?;
        let synced = parent.join(SYNCED_DIR);
        std::fs::create_dir_all(&synced)?;
        let target = synced.join(self.file_name());
        std::fs::rename(&self.path, &target)?;
        Ok(TrackFile::new(target))
    }

    pub fn delete(&self) -> io::Result<()> {
        log::warn!("[tracks] deleting track file {}", self.path.display());
        std::fs::remove_file(&self.path)
    }
}

impl fmt::Display for TrackFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.file_name())
    }
}
