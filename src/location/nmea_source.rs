use std::io::{BufRead, ErrorKind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use crate::bus::Topic;
use crate::error::{TrackerError, TrackerResult};
use crate::location::{now_millis, FileConnector, LocationSource, NmeaConnector};
use crate::nmea::{NmeaParser, NmeaStats};
use crate::types::LocationFix;

struct StreamShared {
    tag: &'static str,
    parser: Mutex<NmeaParser>,
    fixes: Topic<LocationFix>,
    /// One-way latch: set on the first valid sentence, never cleared
    received: AtomicBool,
    lines: AtomicU64,
}

impl StreamShared {
    fn parser(&self) -> MutexGuard<'_, NmeaParser> {
        self.parser.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The run flag is checked and the fix published under the parser lock,
    /// and `stop` clears the flag under the same lock: nothing is parsed or
    /// published once `stop` has returned.
    fn handle_line(&self, line: &str, running: &AtomicBool) {
        if line.trim().is_empty() {
            return;
        }
        let mut parser = self.parser();
        if !running.load(Ordering::Acquire) {
            return;
        }
        self.lines.fetch_add(1, Ordering::Relaxed);

        // Rejected lines are logged by the parser; the stream carries on
        if let Ok(fix) = parser.parse_line(line, now_millis()) {
            if !self.received.swap(true, Ordering::AcqRel) {
                log::info!("[{}] first valid NMEA sentence", self.tag);
            }
            if let Some(fix) = fix {
                self.fixes.publish(fix);
            }
        }
    }
}

/// NMEA line stream: push-fed by the host or pulled from a connected device
/// on a reader thread. Shared by the wired NMEA and Bluetooth sources.
pub(crate) struct NmeaStream {
    shared: Arc<StreamShared>,
    connector: Arc<dyn NmeaConnector>,
    /// Run flag of the current session; each start gets a fresh one
    session: Mutex<Option<Arc<AtomicBool>>>,
}

impl NmeaStream {
    pub(crate) fn new(
        tag: &'static str,
        topic: &'static str,
        connector: Arc<dyn NmeaConnector>,
    ) -> Self {
        Self {
            shared: Arc::new(StreamShared {
                tag,
                parser: Mutex::new(NmeaParser::new()),
                fixes: Topic::new(topic),
                received: AtomicBool::new(false),
                lines: AtomicU64::new(0),
            }),
            connector,
            session: Mutex::new(None),
        }
    }

    fn session(&self) -> MutexGuard<'_, Option<Arc<AtomicBool>>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn start(&self, device: Option<&str>) -> TrackerResult<()> {
        let tag = self.shared.tag;
        let mut session = self.session();
        if session.is_some() {
            log::warn!("[{}] already started", tag);
            return Ok(());
        }

        let running = Arc::new(AtomicBool::new(true));
        if let Some(device) = device {
            let reader = self.connector.connect(device).map_err(|e| {
                log::error!("[{}] failed to open {}: {}", tag, device, e);
                TrackerError::from(e)
            })?;
            let shared = self.shared.clone();
            let flag = running.clone();
            thread::spawn(move || read_loop(shared, reader, flag));
            log::info!("[{}] reading NMEA from {}", tag, device);
        } else {
            log::info!("[{}] started, awaiting pushed sentences", tag);
        }

        *session = Some(running);
        Ok(())
    }

    /// A reader blocked on I/O exits at its next line without publishing.
    pub(crate) fn stop(&self) {
        match self.session().take() {
            Some(running) => {
                let _parser = self.shared.parser();
                running.store(false, Ordering::Release);
                log::info!("[{}] stopped", self.shared.tag);
            }
            None => log::warn!("[{}] stop while not started", self.shared.tag),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.session().is_some()
    }

    pub(crate) fn feed_line(&self, line: &str) {
        let running = self.session().clone();
        match running {
            Some(running) => self.shared.handle_line(line, &running),
            None => log::debug!("[{}] sentence while stopped dropped", self.shared.tag),
        }
    }

    pub(crate) fn received(&self) -> bool {
        self.shared.received.load(Ordering::Acquire)
    }

    pub(crate) fn stats(&self) -> NmeaStats {
        self.shared.parser().stats()
    }

    pub(crate) fn fixes(&self) -> &Topic<LocationFix> {
        &self.shared.fixes
    }
}

fn read_loop(shared: Arc<StreamShared>, mut reader: Box<dyn BufRead + Send>, running: Arc<AtomicBool>) {
    let mut buf = Vec::with_capacity(128);
    loop {
        if !running.load(Ordering::Acquire) {
            break;
        }
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                shared.handle_line(&line, &running);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                log::warn!("[{}] read error: {}", shared.tag, e);
                break;
            }
        }
    }
    log::info!(
        "[{}] reader closed after {} lines",
        shared.tag,
        shared.lines.load(Ordering::Relaxed)
    );
}

/// NMEA from a wired receiver or the platform's own NMEA feed.
pub struct NmeaLocationSource {
    device: Mutex<Option<String>>,
    stream: NmeaStream,
}

impl NmeaLocationSource {
    /// `device` is read on start; without one, sentences arrive via `feed_line`.
    pub fn new(device: Option<String>) -> Self {
        Self::with_connector(device, Arc::new(FileConnector))
    }

    pub fn with_connector(device: Option<String>, connector: Arc<dyn NmeaConnector>) -> Self {
        Self {
            device: Mutex::new(device),
            stream: NmeaStream::new("nmea", "nmea-fixes", connector),
        }
    }

    /// Serial port read by the next `start`; `None` switches to pushed sentences
    pub fn select_device(&self, device: Option<String>) {
        *self.device.lock().unwrap_or_else(|e| e.into_inner()) = device;
    }

    pub fn device(&self) -> Option<String> {
        self.device.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Push one raw sentence (host NMEA listener)
    pub fn feed_line(&self, line: &str) {
        self.stream.feed_line(line);
    }

    /// True once any sentence has passed validation; never reset
    pub fn nmea_received(&self) -> bool {
        self.stream.received()
    }

    pub fn stats(&self) -> NmeaStats {
        self.stream.stats()
    }
}

impl LocationSource for NmeaLocationSource {
    fn name(&self) -> &'static str {
        "nmea"
    }

    fn start(&self) -> TrackerResult<()> {
        self.stream.start(self.device().as_deref())
    }

    fn stop(&self) {
        self.stream.stop();
    }

    fn is_running(&self) -> bool {
        self.stream.is_running()
    }

    fn fixes(&self) -> &Topic<LocationFix> {
        self.stream.fixes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::test_support::{wait_until, MemoryConnector};

    const RMC: &str = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A";

    fn collect(source: &NmeaLocationSource) -> Arc<Mutex<Vec<LocationFix>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = source
            .fixes()
            .subscribe(move |fix: &LocationFix| sink.lock().unwrap().push(*fix));
        seen
    }

    #[test]
    fn test_push_mode_publishes_fixes() {
        let source = NmeaLocationSource::new(None);
        let seen = collect(&source);

        source.feed_line(RMC);
        assert!(!source.nmea_received(), "stopped source ignores input");

        source.start().unwrap();
        source.feed_line(RMC);
        source.fixes().flush();

        assert!(source.nmea_received());
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_latch_needs_valid_sentence_and_survives_stop() {
        let source = NmeaLocationSource::new(None);
        source.start().unwrap();
        source.feed_line("$GPRMC,garbage*00");
        assert!(!source.nmea_received());

        source.feed_line(&crate::nmea::with_checksum("GPGSV,1,1,03"));
        assert!(source.nmea_received());

        source.stop();
        source.start().unwrap();
        assert!(source.nmea_received());
        assert_eq!(source.stats().rejected, 1);
    }

    #[test]
    fn test_reader_thread_streams_device() {
        let connector = MemoryConnector {
            lines: vec![
                crate::nmea::with_checksum("GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,"),
                "not nmea at all".to_string(),
                RMC.to_string(),
                RMC.to_string(),
            ],
        };
        let source =
            NmeaLocationSource::with_connector(Some("mem0".to_string()), Arc::new(connector));
        let seen = collect(&source);

        source.start().unwrap();
        assert!(wait_until(|| seen.lock().unwrap().len() == 2));
        let fixes = seen.lock().unwrap();
        assert_eq!(fixes[0].altitude_gps, 545.4);
        assert_eq!(source.stats().rejected, 1);
    }

    #[test]
    fn test_reader_survives_garbled_line() {
        // Serial noise decoded lossily becomes U+FFFD inside an otherwise framed sentence
        let connector = MemoryConnector {
            lines: vec![
                crate::nmea::with_checksum(
                    "GPRMC,12\u{20ac}4,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W",
                ),
                crate::nmea::with_checksum(
                    "GPGGA,\u{fffd}123,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,",
                ),
                RMC.to_string(),
                RMC.to_string(),
            ],
        };
        let source =
            NmeaLocationSource::with_connector(Some("mem0".to_string()), Arc::new(connector));
        let seen = collect(&source);

        source.start().unwrap();
        assert!(wait_until(|| seen.lock().unwrap().len() == 2));
        assert_eq!(source.stats().rejected, 2);
        assert!(source.nmea_received());
    }

    #[test]
    fn test_no_fix_published_after_stop() {
        let source = NmeaLocationSource::new(None);
        let seen = collect(&source);
        source.start().unwrap();
        source.feed_line(RMC);
        source.stop();
        source.feed_line(RMC);
        source.fixes().flush();

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(source.stats().sentences, 1);
    }

    #[test]
    fn test_open_failure_reported() {
        let source = NmeaLocationSource::new(Some("/nonexistent/tty-gps".to_string()));
        assert!(matches!(source.start(), Err(TrackerError::Io(_))));
        assert!(!source.is_running());
    }

    #[test]
    fn test_start_stop_idempotent() {
        let source = NmeaLocationSource::new(None);
        source.stop();
        source.start().unwrap();
        source.start().unwrap();
        assert!(source.is_running());
        source.stop();
        source.stop();
        assert!(!source.is_running());
    }
}
