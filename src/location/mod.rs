//! Location sources and the arbitrator that picks between them.

pub mod arbitrator;
pub mod bluetooth;
pub mod nmea_source;
pub mod platform;

pub use arbitrator::{LocationArbitrator, LocationMode};
pub use bluetooth::BluetoothLocationSource;
pub use nmea_source::NmeaLocationSource;
pub use platform::PlatformLocationSource;

use std::fs::File;
use std::io::{self, BufRead, BufReader};

use crate::bus::Topic;
use crate::error::TrackerResult;
use crate::types::LocationFix;

/// A producer of `LocationFix` events with an explicit stopped/started state.
///
/// `start` and `stop` are idempotent; repeats are logged and ignored.
pub trait LocationSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn start(&self) -> TrackerResult<()>;

    fn stop(&self);

    fn is_running(&self) -> bool;

    fn fixes(&self) -> &Topic<LocationFix>;
}

/// Opens a line-oriented NMEA stream for a device identity.
pub trait NmeaConnector: Send + Sync {
    fn connect(&self, device: &str) -> io::Result<Box<dyn BufRead + Send>>;
}

/// Treats the device identity as a path: serial/rfcomm device nodes or
/// recorded NMEA logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileConnector;

impl NmeaConnector for FileConnector {
    fn connect(&self, device: &str) -> io::Result<Box<dyn BufRead + Send>> {
        let file = File::open(device)?;
        Ok(Box::new(BufReader::new(file)))
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::{self, BufRead, Cursor};
    use std::time::{Duration, Instant};

    use super::NmeaConnector;

    /// Serves a fixed NMEA transcript for any device name
    pub struct MemoryConnector {
        pub lines: Vec<String>,
    }

    impl NmeaConnector for MemoryConnector {
        fn connect(&self, _device: &str) -> io::Result<Box<dyn BufRead + Send>> {
            let text = self.lines.join("\r\n");
            Ok(Box::new(Cursor::new(text.into_bytes())))
        }
    }

    pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }
}
