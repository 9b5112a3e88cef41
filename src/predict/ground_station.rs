use std::path::Path;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::gps::GpsFix;
use crate::predict::error::LocationError;

const EARTH_MEAN_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct GroundStation {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub altitude_m: f64,
}

impl From<&GpsFix> for GroundStation {
    fn from(fix: &GpsFix) -> Self {
        Self {
            latitude_deg: fix.latitude_deg,
            longitude_deg: fix.longitude_deg,
            altitude_m: fix.altitude_m,
        }
    }
}

impl GroundStation {
    /// Read a location saved by [`GroundStation::save`]. A missing file is
    /// not an error.
    pub fn load(path: &Path) -> Result<Option<Self>, LocationError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        let station: GroundStation = serde_yaml::from_str(&content)?;
        if !(-90.0..=90.0).contains(&station.latitude_deg)
            || !(-180.0..=180.0).contains(&station.longitude_deg)
        {
            return Err(LocationError::OutOfRange(
                station.latitude_deg,
                station.longitude_deg,
            ));
        }
        Ok(Some(station))
    }

    pub fn save(&self, path: &Path) -> Result<(), LocationError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    pub fn lat_rad(&self) -> f64 {
        self.latitude_deg.to_radians()
    }

    pub fn lon_rad(&self) -> f64 {
        self.longitude_deg.to_radians()
    }

    pub fn position_ecef_km(&self) -> [f64; 3] {
        // WGS-84 constants
        let a = 6378.137;
        let e2 = 0.00669437999014;
        let (sin_lat, cos_lat) = self.lat_rad().sin_cos();
        let (sin_lon, cos_lon) = self.lon_rad().sin_cos();
        let n = a / (1.0 - e2 * sin_lat * sin_lat).sqrt();
        let alt_km = self.altitude_m / 1000.0;
        [
            (n + alt_km) * cos_lat * cos_lon,
            (n + alt_km) * cos_lat * sin_lon,
            (n * (1.0 - e2) + alt_km) * sin_lat,
        ]
    }

    /// Great-circle distance along the surface (haversine), ignoring altitude.
    pub fn distance_km(&self, other: &GroundStation) -> f64 {
        let dlat = other.lat_rad() - self.lat_rad();
        let dlon = other.lon_rad() - self.lon_rad();
        let h = (dlat / 2.0).sin().powi(2)
            + self.lat_rad().cos() * other.lat_rad().cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_MEAN_RADIUS_KM * h.sqrt().min(1.0).asin()
    }
}
