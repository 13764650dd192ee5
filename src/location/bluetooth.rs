use std::sync::{Arc, Mutex};

use crate::bus::Topic;
use crate::error::{TrackerError, TrackerResult};
use crate::location::nmea_source::NmeaStream;
use crate::location::{FileConnector, LocationSource, NmeaConnector};
use crate::nmea::NmeaStats;
use crate::types::LocationFix;

/// External Bluetooth GPS receiver speaking NMEA over a serial link.
pub struct BluetoothLocationSource {
    device: Mutex<Option<String>>,
    stream: NmeaStream,
}

impl BluetoothLocationSource {
    pub fn new() -> Self {
        Self::with_connector(Arc::new(FileConnector))
    }

    pub fn with_connector(connector: Arc<dyn NmeaConnector>) -> Self {
        Self {
            device: Mutex::new(None),
            stream: NmeaStream::new("bluetooth", "bluetooth-fixes", connector),
        }
    }

    /// Device identity used by the next `start`
    pub fn select_device(&self, device: Option<String>) {
        *self.device.lock().unwrap_or_else(|e| e.into_inner()) = device;
    }

    pub fn device(&self) -> Option<String> {
        self.device.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn stats(&self) -> NmeaStats {
        self.stream.stats()
    }
}

impl Default for BluetoothLocationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl LocationSource for BluetoothLocationSource {
    fn name(&self) -> &'static str {
        "bluetooth"
    }

    fn start(&self) -> TrackerResult<()> {
        let Some(device) = self.device() else {
            log::error!("[bluetooth] no device selected");
            return Err(TrackerError::InvalidParameters(
                "bluetooth device not selected".to_string(),
            ));
        };
        self.stream.start(Some(&device))
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
