use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

// ─── Fusion ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    // ── Kalman filter ──
    /// Measurement variance ("r"), pressure-altitude units squared
    pub sensor_variance: f64,
    /// Process (acceleration) variance
    pub acceleration_variance: f64,

    // ── Calibration ──
    /// Barometer samples averaged into the ground level reference
    pub ground_level_samples: u64,
    /// Cap on the GPS altitude offset correction divisor
    pub altitude_offset_lag: u64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            sensor_variance: 600.0,
            acceleration_variance: 8.0,
            ground_level_samples: 16,
            altitude_offset_lag: 20,
        }
    }
}

// ─── Location ────────────────────────────────────────────────────────────────

/// Location preferences read once by the arbitrator at start.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationPreferences {
    /// Use the external Bluetooth receiver exclusively
    pub bluetooth_enabled: bool,
    /// Bluetooth device identity (address or device node)
    pub device_id: Option<String>,
    /// Serial port carrying NMEA from a wired receiver
    pub nmea_port: Option<PathBuf>,
}

// ─── Storage / cloud ─────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub track_dir: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub server_url: String,
    pub timeout_secs: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            server_url: "https://base-line.ws".to_string(),
            timeout_secs: 30,
        }
    }
}

impl CloudConfig {
    pub fn tracks_url(&self) -> String {
        format!("{}/tracks", self.server_url.trim_end_matches('/'))
    }
}

// ─── Top level ───────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub fusion: FusionConfig,
    pub location: LocationPreferences,
    pub storage: StorageConfig,
    pub cloud: CloudConfig,
}

impl TrackerConfig {
    /// Load a JSON config file. Missing sections fall back to defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: TrackerConfig =
            serde_json::from_str(r#"{ "fusion": { "sensor_variance": 1.5 } }"#).unwrap();
        assert_eq!(config.fusion.sensor_variance, 1.5);
        assert_eq!(config.fusion.acceleration_variance, 8.0);
        assert_eq!(config.fusion.ground_level_samples, 16);
        assert!(!config.location.bluetooth_enabled);
        assert_eq!(config.cloud.tracks_url(), "https://base-line.ws/tracks");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tracker.json");

        let mut config = TrackerConfig::default();
        config.location.bluetooth_enabled = true;
        config.location.device_id = Some("00:11:22:33:44:55".to_string());
        config.save(&path).unwrap();

        let loaded = TrackerConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
