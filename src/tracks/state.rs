//! Per-file lifecycle registry.
//!
//! `Recording → NotUploaded → Queued → Uploading → Uploaded`, with
//! `Uploading → NotUploaded` on failure. At most one file records at a time.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::bus::Topic;
use crate::error::{TrackerError, TrackerResult};
use crate::tracks::TrackFile;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackState {
    Recording,
    NotUploaded,
    Queued,
    Uploading,
    Uploaded,
}

impl TrackState {
    /// Whether `self → to` is a legal lifecycle step
    pub fn can_transition(self, to: TrackState) -> bool {
        use TrackState::*;
        matches!(
            (self, to),
            (NotUploaded, Recording)
                | (Recording, NotUploaded)
                | (NotUploaded, Queued)
                | (Queued, Uploading)
                | (Uploading, Uploaded)
                | (Uploading, NotUploaded)
        )
    }
}

impl fmt::Display for TrackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrackState::Recording => "recording",
            TrackState::NotUploaded => "not uploaded",
            TrackState::Queued => "queued",
            TrackState::Uploading => "uploading",
            TrackState::Uploaded => "uploaded",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackStateChange {
    pub path: PathBuf,
    pub from: TrackState,
    pub to: TrackState,
}

pub struct TrackStateRegistry {
    states: Mutex<HashMap<PathBuf, TrackState>>,
    changes: Topic<TrackStateChange>,
}

impl TrackStateRegistry {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            changes: Topic::new("track-state"),
        }
    }

    fn states(&self) -> MutexGuard<'_, HashMap<PathBuf, TrackState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Files never seen by the recorder or uploader are `NotUploaded`
    pub fn get_state(&self, track: &TrackFile) -> TrackState {
        self.states()
            .get(track.path())
            .copied()
            .unwrap_or(TrackState::NotUploaded)
    }

    /// Apply a validated transition. Setting the current state again is a no-op.
    pub fn set_state(&self, track: &TrackFile, to: TrackState) -> TrackerResult<()> {
        let mut states = self.states();
        let from = states
            .get(track.path())
            .copied()
            .unwrap_or(TrackState::NotUploaded);
        if from == to {
            return Ok(());
        }

        let other_recording = to == TrackState::Recording
            && states
                .iter()
                .any(|(path, state)| *state == TrackState::Recording && path != track.path());
        if !from.can_transition(to) || other_recording {
            log::error!(
                "[tracks] rejected transition {} → {} for {}",
                from,
                to,
                track
            );
            return Err(TrackerError::InvalidTransition {
                path: track.path().to_path_buf(),
                from,
                to,
            });
        }

        states.insert(track.path().to_path_buf(), to);
        log::debug!("[tracks] {}: {} → {}", track, from, to);
        // Published under the lock so observers see transitions in order
        self.changes.publish(TrackStateChange {
            path: track.path().to_path_buf(),
            from,
            to,
        });
        Ok(())
    }

    /// Drop all knowledge of a file (deleted or abandoned)
    pub fn forget(&self, track: &TrackFile) {
        self.states().remove(track.path());
    }

    pub fn recording(&self) -> Option<TrackFile> {
        self.states()
            .iter()
            .find(|(_, state)| **state == TrackState::Recording)
            .map(|(path, _)| TrackFile::new(path.clone()))
    }

    pub fn changes(&self) -> &Topic<TrackStateChange> {
        &self.changes
    }

    /// Finished session files in `dir`, newest first. Files still recording
    /// are excluded even though their names match.
    pub fn list_tracks(&self, dir: &Path) -> TrackerResult<Vec<TrackFile>> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            log::error!("[tracks] track directory {} unavailable: {}", dir.display(), e);
            TrackerError::from(e)
        })?;

        let mut tracks = Vec::new();
        for entry in entries.flatten() {
            let track = TrackFile::new(entry.path());
            if !TrackFile::matches_pattern(&track.file_name()) || !track.path().is_file() {
                continue;
            }
            if self.get_state(&track) == TrackState::Recording {
                continue;
            }
            tracks.push(track);
        }
        tracks.sort_by(|a, b| b.file_name().cmp(&a.file_name()));
        Ok(tracks)
    }
}

impl Default for TrackStateRegistry {
    fn default() -> Self {
        Self::new()
    }
}
