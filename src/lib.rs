//! Flight sensor fusion and track recording.
//!
//! Barometer samples and location fixes flow through [`altimeter`] and
//! [`location`] into per-stream [`bus::Topic`]s. The [`tracks`] recorder
//! writes every event to a gzip CSV session file and the [`cloud`] queue
//! uploads finished sessions.

pub mod altimeter;
pub mod bus;
pub mod cloud;
pub mod config;
pub mod error;
pub mod filters;
pub mod location;
pub mod nmea;
pub mod storage;
pub mod tracks;
pub mod types;

pub use altimeter::{AltimeterStatus, AltitudeFusionEngine};
pub use config::TrackerConfig;
pub use error::{TrackerError, TrackerResult};
pub use location::LocationArbitrator;
pub use tracks::{TrackFile, TrackRecorder, TrackState, TrackStateRegistry};
pub use types::{FusedAltitude, LocationFix, PressureSample, SensorKind, SensorSample};
