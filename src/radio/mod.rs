mod controller;
mod error;
mod protocol;

use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;
use utoipa::ToSchema;

use crate::config::SatelliteConfig;

pub use controller::{ControllerSession, RadioController};
pub use error::ControllerError;

/// Receiver settings for one satellite downlink.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct Tuning {
    pub frequency_hz: u64,
    pub mode: String,
    pub filter_width_hz: Option<u32>,
    pub squelch_db: Option<i32>,
    pub gain: Option<i32>,
}

impl From<&SatelliteConfig> for Tuning {
    fn from(sat: &SatelliteConfig) -> Self {
        Self {
            frequency_hz: sat.frequency_hz,
            mode: sat.mode.clone(),
            filter_width_hz: sat.filter_width_hz,
            squelch_db: sat.squelch_db,
            gain: sat.gain,
        }
    }
}

/// Operations the recording manager needs from a receiver.
#[async_trait]
pub trait Radio: Send {
    async fn tune(&mut self, tuning: &Tuning) -> Result<(), ControllerError>;
    /// Idempotent: succeeds without a command when already recording.
    async fn start(&mut self, target: &Path) -> Result<(), ControllerError>;
    /// Idempotent: succeeds without a command when not recording.
    async fn stop(&mut self) -> Result<(), ControllerError>;
    async fn status(&mut self) -> Result<ControllerSession, ControllerError>;
    fn disconnect(&mut self);
    /// Last known session state, without a round-trip.
    fn session(&self) -> ControllerSession;
}
