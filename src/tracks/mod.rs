//! Session files: naming, lifecycle state, row format, recording and reading.

pub mod reader;
pub mod recorder;
pub mod rows;
pub mod state;
pub mod track_file;

pub use reader::{read_session, SessionLog, SessionSummary};
pub use recorder::{RecorderEvent, RecorderState, TrackRecorder};
pub use rows::TrackRow;
pub use state::{TrackState, TrackStateChange, TrackStateRegistry};
pub use track_file::TrackFile;
