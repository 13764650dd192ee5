//! Chooses which location source feeds the rest of the system.
//!
//! Bluetooth preference wins outright. Otherwise the NMEA and platform sources
//! run side by side and platform fixes are used only until the first valid
//! NMEA sentence arrives. That latch is never reset, so a receiver that drops
//! out after first contact leaves the arbitrator without a fallback until the
//! next restart.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::altimeter::AltitudeFusionEngine;
use crate::bus::{Subscription, Topic};
use crate::config::LocationPreferences;
use crate::error::TrackerResult;
use crate::location::{
    BluetoothLocationSource, LocationSource, NmeaLocationSource, PlatformLocationSource,
};
use crate::types::LocationFix;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocationMode {
    None,
    /// NMEA preferred, platform fallback
    Platform,
    Bluetooth,
}

struct ArbiterState {
    mode: LocationMode,
    subscriptions: Vec<(Topic<LocationFix>, Subscription)>,
}

pub struct LocationArbitrator {
    nmea: Arc<NmeaLocationSource>,
    platform: Arc<PlatformLocationSource>,
    bluetooth: Arc<BluetoothLocationSource>,
    engine: Arc<AltitudeFusionEngine>,
    fixes: Topic<LocationFix>,
    fallback_count: Arc<AtomicU64>,
    state: Mutex<ArbiterState>,
}

impl LocationArbitrator {
    pub fn new(
        nmea: Arc<NmeaLocationSource>,
        platform: Arc<PlatformLocationSource>,
        bluetooth: Arc<BluetoothLocationSource>,
        engine: Arc<AltitudeFusionEngine>,
    ) -> Self {
        Self {
            nmea,
            platform,
            bluetooth,
            engine,
            fixes: Topic::new("location"),
            fallback_count: Arc::new(AtomicU64::new(0)),
            state: Mutex::new(ArbiterState {
                mode: LocationMode::None,
                subscriptions: Vec::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ArbiterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Accepted fixes, in arrival order per source
    pub fn fixes(&self) -> &Topic<LocationFix> {
        &self.fixes
    }

    pub fn mode(&self) -> LocationMode {
        self.state().mode
    }

    /// Platform fixes accepted while no NMEA had been seen
    pub fn platform_fallback_count(&self) -> u64 {
        self.fallback_count.load(Ordering::Relaxed)
    }

    /// Forward an accepted fix to fusion and to downstream consumers
    fn forwarder(&self) -> impl Fn(&LocationFix) + Send + 'static {
        let engine = self.engine.clone();
        let fixes = self.fixes.clone();
        move |fix: &LocationFix| {
            if let Err(err) = engine.submit_location(*fix) {
                log::debug!("[location] fusion not accepting fixes: {}", err);
            }
            fixes.publish(*fix);
        }
    }

    pub fn start(&self, prefs: &LocationPreferences) -> TrackerResult<()> {
        let mut state = self.state();
        if state.mode != LocationMode::None {
            log::warn!("[location] already started in {:?} mode", state.mode);
            return Ok(());
        }

        if prefs.bluetooth_enabled {
            log::info!("[location] starting in bluetooth mode");
            self.bluetooth.select_device(prefs.device_id.clone());
            let topic = self.bluetooth.fixes().clone();
            let sub = topic.subscribe(self.forwarder());
            if let Err(err) = self.bluetooth.start() {
                topic.unsubscribe(sub);
                return Err(err);
            }
            state.subscriptions.push((topic, sub));
            state.mode = LocationMode::Bluetooth;
            return Ok(());
        }

        log::info!("[location] starting in platform mode");
        if let Some(port) = &prefs.nmea_port {
            self.nmea
                .select_device(Some(port.to_string_lossy().into_owned()));
        }
        let nmea_topic = self.nmea.fixes().clone();
        let nmea_sub = nmea_topic.subscribe(self.forwarder());

        let forward = self.forwarder();
        let nmea = self.nmea.clone();
        let count = self.fallback_count.clone();
        let platform_topic = self.platform.fixes().clone();
        let platform_sub = platform_topic.subscribe(move |fix: &LocationFix| {
            if nmea.nmea_received() {
                return;
            }
            let n = count.fetch_add(1, Ordering::Relaxed) + 1;
            if warn_on_fallback(n) {
                log::warn!("[location] no NMEA data, platform fallback fix #{}", n);
            }
            forward(fix);
        });

        // A dead NMEA port degrades to platform-only
        if let Err(err) = self.nmea.start() {
            log::warn!("[location] NMEA source unavailable: {}", err);
        }
        if let Err(err) = self.platform.start() {
            nmea_topic.unsubscribe(nmea_sub);
            platform_topic.unsubscribe(platform_sub);
            if self.nmea.is_running() {
                self.nmea.stop();
            }
            return Err(err);
        }

        state.subscriptions.push((nmea_topic, nmea_sub));
        state.subscriptions.push((platform_topic, platform_sub));
        state.mode = LocationMode::Platform;
        Ok(())
    }

    /// Unregisters every forwarding callback, then stops the sources.
    pub fn stop(&self) {
        let mut state = self.state();
        let mode = state.mode;
        if mode == LocationMode::None {
            log::warn!("[location] stop while not started");
            return;
        }

        for (topic, sub) in state.subscriptions.drain(..) {
            topic.unsubscribe(sub);
        }
        match mode {
            LocationMode::Bluetooth => {
                log::info!("[location] stopping bluetooth mode");
                self.bluetooth.stop();
            }
            LocationMode::Platform => {
                log::info!("[location] stopping platform mode");
                if self.nmea.is_running() {
                    self.nmea.stop();
                }
                self.platform.stop();
            }
            LocationMode::None => {}
        }
        state.mode = LocationMode::None;
    }

    /// Apply changed preferences, e.g. bluetooth switched on or off
    pub fn restart(&self, prefs: &LocationPreferences) -> TrackerResult<()> {
        log::info!("[location] restarting");
        if self.mode() != LocationMode::None {
            self.stop();
        }
        self.start(prefs)
    }
}

/// Fallback fixes 1, 2, 4, 8, ... are logged
fn warn_on_fallback(count: u64) -> bool {
    count.is_power_of_two()
}
