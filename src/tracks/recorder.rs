//! Flight recorder: every altitude, location and sensor event to a gzip CSV.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{Local, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::bus::Topic;
use crate::error::{TrackerError, TrackerResult};
use crate::storage::StorageDirResolver;
use crate::tracks::rows::{altitude_row, location_row, sensor_row, HEADER};
use crate::tracks::{TrackFile, TrackState, TrackStateRegistry};
use crate::types::{FusedAltitude, LocationFix, SensorSample};

/// Recorder state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecorderState {
    Idle,
    Recording,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecorderEvent {
    Started(TrackFile),
    /// `None` when the file could not be closed; the session is lost
    Stopped(Option<TrackFile>),
}

type GzWriter = GzEncoder<BufWriter<File>>;

/// Serialized append access to the open session file.
struct LogSink {
    writer: Option<GzWriter>,
    rows: u64,
}

impl LogSink {
    fn log_line(&mut self, line: &str) {
        match self.writer.as_mut() {
            Some(writer) => {
                if let Err(e) = writer.write_all(line.as_bytes()).and_then(|_| writer.write_all(b"\n")) {
                    log::error!("[recorder] failed to write row: {}", e);
                } else {
                    self.rows += 1;
                }
            }
            None => log::error!("[recorder] attempted to log after closing file"),
        }
    }
}

struct Streams {
    altitudes: Topic<FusedAltitude>,
    fixes: Topic<LocationFix>,
    sensors: Topic<SensorSample>,
}

struct RecorderInner {
    state: RecorderState,
    track: Option<TrackFile>,
    unsubscribers: Vec<Box<dyn FnOnce() + Send>>,
    start_instant: Option<Instant>,
    stop_instant: Option<Instant>,
    start_millis: i64,
}

pub struct TrackRecorder {
    registry: Arc<TrackStateRegistry>,
    log_dir: Arc<Mutex<Option<PathBuf>>>,
    streams: Mutex<Option<Streams>>,
    sink: Arc<Mutex<LogSink>>,
    inner: Mutex<RecorderInner>,
    events: Topic<RecorderEvent>,
}

fn lock_sink(sink: &Mutex<LogSink>) -> MutexGuard<'_, LogSink> {
    sink.lock().unwrap_or_else(|e| e.into_inner())
}

impl TrackRecorder {
    pub fn new(registry: Arc<TrackStateRegistry>) -> Self {
        Self {
            registry,
            log_dir: Arc::new(Mutex::new(None)),
            streams: Mutex::new(None),
            sink: Arc::new(Mutex::new(LogSink {
                writer: None,
                rows: 0,
            })),
            inner: Mutex::new(RecorderInner {
                state: RecorderState::Idle,
                track: None,
                unsubscribers: Vec::new(),
                start_instant: None,
                stop_instant: None,
                start_millis: 0,
            }),
            events: Topic::new("recorder"),
        }
    }

    fn inner(&self) -> TrackerResult<MutexGuard<'_, RecorderInner>> {
        self.inner
            .lock()
            .map_err(|_| TrackerError::InvalidState("recorder lock poisoned".to_string()))
    }

    /// Streams subscribed to while recording
    pub fn attach(
        &self,
        altitudes: &Topic<FusedAltitude>,
        fixes: &Topic<LocationFix>,
        sensors: &Topic<SensorSample>,
    ) {
        *self.streams.lock().unwrap_or_else(|e| e.into_inner()) = Some(Streams {
            altitudes: altitudes.clone(),
            fixes: fixes.clone(),
            sensors: sensors.clone(),
        });
    }

    /// Resolve the storage directory off the caller's thread
    pub fn start(&self, resolver: Arc<dyn StorageDirResolver>) -> JoinHandle<()> {
        let log_dir = self.log_dir.clone();
        thread::spawn(move || {
            let dir = resolver.resolve();
            match &dir {
                Some(dir) => log::info!("[recorder] track directory {}", dir.display()),
                None => log::warn!("[recorder] track directory not available"),
            }
            *log_dir.lock().unwrap_or_else(|e| e.into_inner()) = dir;
        })
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.log_dir.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn start_logging(&self) -> TrackerResult<TrackFile> {
        let mut inner = self.inner()?;
        if inner.state == RecorderState::Recording {
            log::error!("[recorder] start_logging while already logging");
            return Err(TrackerError::AlreadyRunning);
        }
        let Some(dir) = self.log_dir() else {
            log::error!("[recorder] start_logging before storage is ready");
            return Err(TrackerError::StorageNotReady);
        };

        let track = TrackFile::create_in(&dir, Local::now());
        // Before the first byte, so directory scans skip the partial file
        self.registry.set_state(&track, TrackState::Recording)?;

        let writer = match open_writer(&track) {
            Ok(writer) => writer,
            Err(e) => {
                log::error!("[recorder] error starting logging to {}: {}", track, e);
                self.registry.forget(&track);
                let _ = std::fs::remove_file(track.path());
                return Err(e.into());
            }
        };
        {
            let mut sink = lock_sink(&self.sink);
            sink.writer = Some(writer);
            sink.rows = 0;
        }

        inner.unsubscribers = self.subscribe_streams();
        inner.state = RecorderState::Recording;
        inner.track = Some(track.clone());
        inner.start_instant = Some(Instant::now());
        inner.stop_instant = None;
        inner.start_millis = Utc::now().timestamp_millis();

        log::info!("[recorder] logging to {}", track.path().display());
        self.events.publish(RecorderEvent::Started(track.clone()));
        Ok(track)
    }

    fn subscribe_streams(&self) -> Vec<Box<dyn FnOnce() + Send>> {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let Some(streams) = streams.as_ref() else {
            log::warn!("[recorder] no streams attached, recording header only");
            return Vec::new();
        };
        let mut unsubscribers: Vec<Box<dyn FnOnce() + Send>> = Vec::new();

        let sink = self.sink.clone();
        let sub = streams.altitudes.subscribe(move |alt: &FusedAltitude| {
            // GPS-only altitudes carry no pressure
            if alt.pressure_hpa.is_finite() {
                lock_sink(&sink).log_line(&altitude_row(alt));
            }
        });
        let topic = streams.altitudes.clone();
        unsubscribers.push(Box::new(move || topic.unsubscribe(sub)));

        let sink = self.sink.clone();
        let sub = streams.fixes.subscribe(move |fix: &LocationFix| {
            if fix.has_position() {
                lock_sink(&sink).log_line(&location_row(fix));
            }
        });
        let topic = streams.fixes.clone();
        unsubscribers.push(Box::new(move || topic.unsubscribe(sub)));

        let sink = self.sink.clone();
        let sub = streams.sensors.subscribe(move |sample: &SensorSample| {
            lock_sink(&sink).log_line(&sensor_row(sample));
        });
        let topic = streams.sensors.clone();
        unsubscribers.push(Box::new(move || topic.unsubscribe(sub)));

        unsubscribers
    }

    /// Stop logging and hand the finished file to `events()` subscribers.
    ///
    /// If the file cannot be closed it is discarded, `Stopped(None)` is
    /// emitted and the close error returned.
    pub fn stop_logging(&self) -> TrackerResult<Option<TrackFile>> {
        let mut inner = self.inner()?;
        if inner.state != RecorderState::Recording {
            log::error!("[recorder] stop_logging while not logging");
            return Err(TrackerError::NotRunning);
        }
        inner.stop_instant = Some(Instant::now());
        inner.state = RecorderState::Idle;

        for unsubscribe in inner.unsubscribers.drain(..) {
            unsubscribe();
        }

        let (writer, rows) = {
            let mut sink = lock_sink(&self.sink);
            (sink.writer.take(), sink.rows)
        };
        let Some(track) = inner.track.take() else {
            return Err(TrackerError::InvalidState("recording without a track".to_string()));
        };

        let closed = match writer {
            Some(writer) => close_writer(writer),
            None => Err(std::io::Error::other("writer missing")),
        };
        match closed {
            Ok(()) => {
                log::info!("[recorder] logging stopped for {} ({} rows)", track, rows);
                self.registry.set_state(&track, TrackState::NotUploaded)?;
                self.events.publish(RecorderEvent::Stopped(Some(track.clone())));
                Ok(Some(track))
            }
            Err(e) => {
                log::error!("[recorder] failed to close {}: {}", track, e);
                self.registry.forget(&track);
                if let Err(rm) = std::fs::remove_file(track.path()) {
                    log::warn!("[recorder] could not remove {}: {}", track, rm);
                }
                self.events.publish(RecorderEvent::Stopped(None));
                Err(e.into())
            }
        }
    }

    pub fn is_logging(&self) -> bool {
        self.inner()
            .map(|inner| inner.state == RecorderState::Recording)
            .unwrap_or(false)
    }

    /// Wall-clock start of the current session, 0 when idle
    pub fn start_time_millis(&self) -> i64 {
        match self.inner() {
            Ok(inner) if inner.state == RecorderState::Recording => inner.start_millis,
            _ => 0,
        }
    }

    /// Elapsed session time as `m:ss.mmm`, frozen once logging stops.
    /// Empty before the first session.
    pub fn log_time(&self) -> String {
        let Ok(inner) = self.inner() else {
            return String::new();
        };
        match inner.start_instant {
            Some(start) => {
                let end = inner.stop_instant.unwrap_or_else(Instant::now);
                format_log_time(end.saturating_duration_since(start))
            }
            None => String::new(),
        }
    }

    pub fn current_track(&self) -> Option<TrackFile> {
        self.inner().ok().and_then(|inner| inner.track.clone())
    }

    pub fn events(&self) -> &Topic<RecorderEvent> {
        &self.events
    }
}

fn open_writer(track: &TrackFile) -> std::io::Result<GzWriter> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(track.path())?;
    let mut writer = GzEncoder::new(BufWriter::new(file), Compression::default());
    writer.write_all(HEADER.as_bytes())?;
    writer.write_all(b"\n")?;
    Ok(writer)
}

fn close_writer(writer: GzWriter) -> std::io::Result<()> {
    let buffered = writer.finish()?;
    let file = buffered.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()
}

pub fn format_log_time(elapsed: Duration) -> String {
    let millis = elapsed.as_millis();
    format!(
        "{}:{:02}.{:03}",
        millis / 60_000,
        (millis / 1000) % 60,
        millis % 1000
    )
}
