use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::bus::Topic;
use crate::error::TrackerResult;
use crate::location::LocationSource;
use crate::types::LocationFix;

/// Fixes pushed by the host platform's own location provider.
pub struct PlatformLocationSource {
    running: AtomicBool,
    delivered: AtomicU64,
    fixes: Topic<LocationFix>,
}

impl PlatformLocationSource {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
            fixes: Topic::new("platform-fixes"),
        }
    }

    /// Called from the platform callback. Dropped while stopped.
    pub fn deliver(&self, fix: LocationFix) {
        if !self.running.load(Ordering::Acquire) {
            log::debug!("[platform] fix while stopped dropped");
            return;
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.fixes.publish(fix);
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

impl Default for PlatformLocationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl LocationSource for PlatformLocationSource {
    fn name(&self) -> &'static str {
        "platform"
    }

    fn start(&self) -> TrackerResult<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            log::warn!("[platform] already started");
        } else {
            log::info!("[platform] started");
        }
        Ok(())
    }

    fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            log::info!("[platform] stopped");
        } else {
            log::warn!("[platform] stop while not started");
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn fixes(&self) -> &Topic<LocationFix> {
        &self.fixes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deliver_only_while_running() {
        let source = PlatformLocationSource::new();
        source.deliver(LocationFix::empty(1));
        source.start().unwrap();
        source.deliver(LocationFix::empty(2));
        source.stop();
        source.deliver(LocationFix::empty(3));
        assert_eq!(source.delivered(), 1);
    }
}
