use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::config::SatelliteConfig;
use crate::predict::error::PredictError;
use crate::predict::pass_finder::predict_passes;
use crate::predict::remote::RemoteClient;
use crate::predict::tle_loader::TleLoader;
use crate::predict::GroundStation;
use crate::scheduler::{PassEvent, Source};

/// A provider of future passes. Both variants honour the same contract:
/// events ordered by start, passes below the satellite's minimum elevation
/// dropped, failures reported as [`PredictError::Unavailable`].
pub enum PredictionSource {
    Remote(RemoteClient),
    LocalFallback(LocalFallback),
}

impl PredictionSource {
    pub fn tag(&self) -> Source {
        match self {
            PredictionSource::Remote(_) => Source::Remote,
            PredictionSource::LocalFallback(_) => Source::LocalFallback,
        }
    }

    pub async fn refresh(
        &self,
        station: &GroundStation,
        satellites: &[SatelliteConfig],
        from: DateTime<Utc>,
        horizon: Duration,
    ) -> Result<Vec<PassEvent>, PredictError> {
        let mut events = match self {
            PredictionSource::Remote(client) => {
                client.predict(station, satellites, from + horizon).await?
            }
            PredictionSource::LocalFallback(fallback) => {
                fallback.refresh(station, satellites, from, horizon).await?
            }
        };
        events.sort_by(|a, b| a.due_order().cmp(&b.due_order()));
        Ok(events)
    }
}

/// SGP4 pass finder over the local TLE catalog.
pub struct LocalFallback {
    catalog: Arc<TleLoader>,
}

impl LocalFallback {
    pub fn new(catalog: Arc<TleLoader>) -> Self {
        Self { catalog }
    }

    async fn refresh(
        &self,
        station: &GroundStation,
        satellites: &[SatelliteConfig],
        from: DateTime<Utc>,
        horizon: Duration,
    ) -> Result<Vec<PassEvent>, PredictError> {
        let catalog = self.catalog.clone();
        let station = *station;
        let satellites = satellites.to_vec();

        tokio::task::spawn_blocking(move || {
            find_passes(&catalog, &station, &satellites, from, from + horizon)
        })
        .await
        .map_err(|e| PredictError::Unavailable(format!("pass finder task failed: {}", e)))?
    }
}

fn find_passes(
    catalog: &TleLoader,
    station: &GroundStation,
    satellites: &[SatelliteConfig],
    from: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<Vec<PassEvent>, PredictError> {
    let mut events = Vec::new();
    let mut found_any = false;

    for sat in satellites {
        let Some(entry) = catalog.find(&sat.name, sat.norad_id) else {
            log::warn!("{}", PredictError::UnknownSatellite(sat.name.clone()));
            continue;
        };
        found_any = true;

        let passes = match predict_passes(station, entry, from, until, sat.min_elevation_deg) {
            Ok(passes) => passes,
            Err(e) => {
                log::warn!("Pass prediction for {} failed: {}", sat.name, e);
                continue;
            }
        };

        log::debug!("{}: {} local passes", sat.name, passes.len());
        events.extend(passes.into_iter().map(|pass| PassEvent {
            satellite: sat.name.clone(),
            start: pass.aos,
            end: pass.los,
            max_elevation_deg: pass.max_elevation_deg,
            source: Source::LocalFallback,
        }));
    }

    if !found_any && !satellites.is_empty() {
        return Err(PredictError::Unavailable(
            "no configured satellite is in the TLE catalog".into(),
        ));
    }
    Ok(events)
}
