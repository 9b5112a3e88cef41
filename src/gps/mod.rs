mod listener;
mod nmea;

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

pub use listener::run_listener;

/// A position fix reported by the GPS collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct GpsFix {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub altitude_m: f64,
    pub satellites: u32,
    pub received_at: DateTime<Utc>,
}
