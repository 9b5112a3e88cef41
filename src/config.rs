use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::predict::GroundStation;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub station: StationConfig,
    pub radio: RadioConfig,
    pub predict: PredictConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    pub storage: StorageConfig,
    pub gps: Option<GpsConfig>,
    pub web: Option<WebConfig>,
    #[serde(default)]
    pub api_keys: Vec<ApiKey>,
    pub satellites: Vec<SatelliteConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StationConfig {
    pub name: Option<String>,
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    #[serde(default)]
    pub altitude_m: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RadioConfig {
    #[serde(default = "default_radio_address")]
    pub address: String,
    #[serde(default = "default_radio_timeout", deserialize_with = "duration")]
    pub timeout: Duration,
    pub recordings_dir: PathBuf,
}

fn default_radio_address() -> String {
    "127.0.0.1:7356".to_string()
}

fn default_radio_timeout() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredictConfig {
    pub remote: Option<RemotePredictConfig>,
    pub tle_folder: Option<PathBuf>,
    #[serde(default = "default_horizon", deserialize_with = "duration")]
    pub horizon: Duration,
    #[serde(default = "default_refresh_interval", deserialize_with = "duration")]
    pub refresh_interval: Duration,
    #[serde(default = "default_recording_margin", deserialize_with = "duration")]
    pub recording_margin: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemotePredictConfig {
    pub address: String,
    #[serde(default = "default_remote_timeout", deserialize_with = "duration")]
    pub timeout: Duration,
}

fn default_horizon() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_recording_margin() -> Duration {
    Duration::from_secs(60)
}

fn default_remote_timeout() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    #[serde(deserialize_with = "duration")]
    pub tick: Duration,
    #[serde(deserialize_with = "duration")]
    pub preroll: Duration,
    #[serde(deserialize_with = "duration")]
    pub retention: Duration,
    pub max_attempts: u32,
    #[serde(deserialize_with = "duration")]
    pub retry_backoff: Duration,
    #[serde(deserialize_with = "duration")]
    pub max_retry_backoff: Duration,
    #[serde(deserialize_with = "duration")]
    pub stop_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            preroll: Duration::from_secs(30),
            retention: Duration::from_secs(3 * 3600),
            max_attempts: 3,
            retry_backoff: Duration::from_secs(2),
            max_retry_backoff: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub base_folder: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GpsConfig {
    #[serde(default = "default_gps_bind")]
    pub bind: String,
    #[serde(default = "default_drift_threshold")]
    pub drift_threshold_km: f64,
    #[serde(default = "default_gps_interval", deserialize_with = "duration")]
    pub update_interval: Duration,
}

fn default_gps_bind() -> String {
    "0.0.0.0:11123".to_string()
}

fn default_drift_threshold() -> f64 {
    1.0
}

fn default_gps_interval() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiKey {
    pub key: String,
    pub name: String,
    pub permissions: HashSet<Permission>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ListSchedule,
    SubmitManual,
    TriggerRefresh,
    ListRecordings,
    ViewRadio,
}

/// One entry of the satellite catalog: what to listen for and how.
#[derive(Debug, Clone, Deserialize)]
pub struct SatelliteConfig {
    pub name: String,
    pub norad_id: Option<u32>,
    pub frequency_hz: u64,
    #[serde(default = "default_mode")]
    pub mode: String,
    pub filter_width_hz: Option<u32>,
    pub squelch_db: Option<i32>,
    pub gain: Option<i32>,
    #[serde(default)]
    pub min_elevation_deg: f64,
}

fn default_mode() -> String {
    "WFM".to_string()
}

fn duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    humantime::parse_duration(&s).map_err(serde::de::Error::custom)
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if !(-90.0..=90.0).contains(&self.station.latitude_deg) {
            return invalid(format!(
                "station latitude {} out of range",
                self.station.latitude_deg
            ));
        }
        if !(-180.0..=180.0).contains(&self.station.longitude_deg) {
            return invalid(format!(
                "station longitude {} out of range",
                self.station.longitude_deg
            ));
        }
        if self.predict.remote.is_none() && self.predict.tle_folder.is_none() {
            return invalid("predict needs a remote collaborator or a tle_folder".into());
        }
        if self.predict.horizon.is_zero() {
            return invalid("predict.horizon must be positive".into());
        }
        if self.predict.refresh_interval.is_zero() {
            return invalid("predict.refresh_interval must be positive".into());
        }
        if self.scheduler.tick.is_zero() {
            return invalid("scheduler.tick must be positive".into());
        }
        if self.scheduler.max_attempts == 0 {
            return invalid("scheduler.max_attempts must be at least 1".into());
        }
        if self.scheduler.max_retry_backoff < self.scheduler.retry_backoff {
            return invalid("scheduler.max_retry_backoff is below retry_backoff".into());
        }
        if let Some(gps) = &self.gps {
            if gps.drift_threshold_km < 0.0 {
                return invalid("gps.drift_threshold_km must not be negative".into());
            }
        }
        if self.satellites.is_empty() {
            return invalid("no satellites configured".into());
        }

        let mut names = HashSet::new();
        for sat in &self.satellites {
            if sat.name.is_empty() || sat.name.contains(char::is_whitespace) {
                return invalid(format!("satellite name {:?} must be one word", sat.name));
            }
            if !names.insert(sat.name.as_str()) {
                return invalid(format!("duplicate satellite {}", sat.name));
            }
            if sat.frequency_hz == 0 {
                return invalid(format!("satellite {} has no frequency", sat.name));
            }
        }

        let mut keys = HashSet::new();
        for key in &self.api_keys {
            if !keys.insert(key.key.as_str()) {
                return invalid(format!("duplicate API key for {}", key.name));
            }
        }

        Ok(())
    }

    pub fn ground_station(&self) -> GroundStation {
        GroundStation {
            latitude_deg: self.station.latitude_deg,
            longitude_deg: self.station.longitude_deg,
            altitude_m: self.station.altitude_m,
        }
    }

    pub fn satellite(&self, name: &str) -> Option<&SatelliteConfig> {
        self.satellites.iter().find(|s| s.name == name)
    }

    pub fn find_api_key(&self, key: &str) -> Option<&ApiKey> {
        self.api_keys.iter().find(|k| k.key == key)
    }
}

/// `std` durations from the config feed the chrono arithmetic of the schedule.
pub fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}
