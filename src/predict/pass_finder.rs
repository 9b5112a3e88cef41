use chrono::{DateTime, Duration, SubsecRound, TimeZone, Utc};

use crate::predict::error::PredictError;
use crate::predict::propagation::look_angles;
use crate::predict::tle_loader::TleEntry;
use crate::predict::types::Pass;
use crate::predict::GroundStation;

const COARSE_STEP_SECONDS: i64 = 60; // 1 minute for initial scan
const HORIZON_ELEVATION: f64 = 0.0;
/// How far back to look for the rise of a pass already in progress.
const LOOKBACK_STEPS: i64 = 60;

struct OpenPass {
    aos: DateTime<Utc>,
    aos_azimuth: f64,
    max_el: f64,
    max_el_time: DateTime<Utc>,
}

/// Find all passes of one satellite within `[start, end]` whose culmination
/// reaches `min_elevation`.
///
/// Crossings are resolved to the first whole second above (AOS) or below
/// (LOS) the horizon, and a pass already in progress at `start` keeps its real
/// AOS, so repeated searches report the same window for the same pass.
pub fn predict_passes(
    station: &GroundStation,
    entry: &TleEntry,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    min_elevation: f64,
) -> Result<Vec<Pass>, PredictError> {
    let start = start.trunc_subsecs(0);
    let mut passes = Vec::new();
    let mut cursor = start;
    let coarse_step = Duration::seconds(COARSE_STEP_SECONDS);

    let mut open: Option<OpenPass> = None;

    while cursor <= end {
        let sample = look_angles(station, &entry.elements, &entry.constants, cursor)?;
        let visible = sample.elevation_deg >= HORIZON_ELEVATION;

        if visible {
            if let Some(pass) = open.as_mut() {
                if sample.elevation_deg > pass.max_el {
                    pass.max_el = sample.elevation_deg;
                    pass.max_el_time = cursor;
                }
            } else if cursor == start {
                open = Some(rise_before(station, entry, start, sample.elevation_deg)?);
            } else {
                let (aos, aos_azimuth) =
                    refine_crossing(station, entry, cursor - coarse_step, cursor, true)?;
                open = Some(OpenPass {
                    aos,
                    aos_azimuth,
                    max_el: sample.elevation_deg,
                    max_el_time: cursor,
                });
            }
        } else if let Some(pass) = open.take() {
            let (los, los_azimuth) =
                refine_crossing(station, entry, cursor - coarse_step, cursor, false)?;
            push_pass(&mut passes, entry, pass, los, los_azimuth, min_elevation);
        }

        cursor += coarse_step;
    }

    // Pass still in progress at the end of the window
    if let Some(pass) = open.take() {
        let sample = look_angles(station, &entry.elements, &entry.constants, end)?;
        push_pass(&mut passes, entry, pass, end, sample.azimuth_deg, min_elevation);
    }

    Ok(passes)
}

/// Walk back from `at`, where the satellite is already up, to its rise.
fn rise_before(
    station: &GroundStation,
    entry: &TleEntry,
    at: DateTime<Utc>,
    elevation_at: f64,
) -> Result<OpenPass, PredictError> {
    let coarse_step = Duration::seconds(COARSE_STEP_SECONDS);
    let mut pass = OpenPass {
        aos: at,
        aos_azimuth: look_angles(station, &entry.elements, &entry.constants, at)?.azimuth_deg,
        max_el: elevation_at,
        max_el_time: at,
    };

    let mut later = at;
    for _ in 0..LOOKBACK_STEPS {
        let earlier = later - coarse_step;
        let sample = look_angles(station, &entry.elements, &entry.constants, earlier)?;
        if sample.elevation_deg < HORIZON_ELEVATION {
            let (aos, aos_azimuth) = refine_crossing(station, entry, earlier, later, true)?;
            pass.aos = aos;
            pass.aos_azimuth = aos_azimuth;
            return Ok(pass);
        }
        if sample.elevation_deg > pass.max_el {
            pass.max_el = sample.elevation_deg;
            pass.max_el_time = earlier;
        }
        later = earlier;
    }

    // Up for the whole lookback: report the earliest visible sample.
    pass.aos = later;
    pass.aos_azimuth = look_angles(station, &entry.elements, &entry.constants, later)?.azimuth_deg;
    Ok(pass)
}

fn push_pass(
    passes: &mut Vec<Pass>,
    entry: &TleEntry,
    pass: OpenPass,
    los: DateTime<Utc>,
    los_azimuth: f64,
    min_elevation: f64,
) {
    if pass.max_el < min_elevation || los <= pass.aos {
        return;
    }
    passes.push(Pass {
        satellite: entry.info.name.clone(),
        norad_id: entry.info.norad_id,
        aos: pass.aos,
        los,
        tca: pass.max_el_time,
        max_elevation_deg: round2(pass.max_el),
        aos_azimuth_deg: round2(pass.aos_azimuth),
        los_azimuth_deg: round2(los_azimuth),
    });
}

/// Binary search over whole seconds for the first second on the far side of
/// the horizon. `before` and `after` straddle the crossing.
fn refine_crossing(
    station: &GroundStation,
    entry: &TleEntry,
    before: DateTime<Utc>,
    after: DateTime<Utc>,
    rising: bool,
) -> Result<(DateTime<Utc>, f64), PredictError> {
    let mut low = before.timestamp();
    let mut high = after.timestamp();

    while high - low > 1 {
        let mid = low + (high - low) / 2;
        let sample = look_angles(station, &entry.elements, &entry.constants, second(mid)?)?;

        let above = sample.elevation_deg >= HORIZON_ELEVATION;
        if above == rising {
            high = mid;
        } else {
            low = mid;
        }
    }

    let crossing = second(high)?;
    let final_sample = look_angles(station, &entry.elements, &entry.constants, crossing)?;
    Ok((crossing, final_sample.azimuth_deg))
}

fn second(timestamp: i64) -> Result<DateTime<Utc>, PredictError> {
    Utc.timestamp_opt(timestamp, 0)
        .single()
        .ok_or_else(|| PredictError::Propagation(format!("time {} out of range", timestamp)))
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predict::tle_loader::tests::ISS_TLE;
    use crate::predict::TleLoader;
    use chrono::TimeZone;

    fn delft() -> GroundStation {
        GroundStation {
            latitude_deg: 52.0116,
            longitude_deg: 4.3571,
            altitude_m: 0.0,
        }
    }

    #[test]
    fn test_iss_passes_over_a_day() {
        let loader = TleLoader::from_content(ISS_TLE, "iss.tle").unwrap();
        let entry = loader.find("ISS (ZARYA)", None).unwrap();
        let start = Utc.with_ymd_and_hms(2008, 9, 20, 12, 0, 0).unwrap();
        let end = start + Duration::hours(24);

        let passes = predict_passes(&delft(), entry, start, end, 0.0).unwrap();

        assert!(!passes.is_empty());
        for pair in passes.windows(2) {
            assert!(pair[0].los <= pair[1].aos);
        }
        for pass in &passes {
            assert!(pass.aos < pass.los);
            assert!(pass.aos <= pass.tca && pass.tca <= pass.los);
            assert!(pass.los - pass.aos < Duration::minutes(20));
            assert!((0.0..=90.0).contains(&pass.max_elevation_deg));
            assert!(pass.los > start && pass.los <= end);
            assert_eq!(pass.aos, pass.aos.trunc_subsecs(0));
        }
    }

    #[test]
    fn test_min_elevation_filters_passes() {
        let loader = TleLoader::from_content(ISS_TLE, "iss.tle").unwrap();
        let entry = loader.find("ISS (ZARYA)", Some(25544)).unwrap();
        let start = Utc.with_ymd_and_hms(2008, 9, 20, 12, 0, 0).unwrap();
        let end = start + Duration::hours(24);

        let all = predict_passes(&delft(), entry, start, end, 0.0).unwrap();
        let high = predict_passes(&delft(), entry, start, end, 30.0).unwrap();

        assert!(high.len() <= all.len());
        assert!(high.iter().all(|p| p.max_elevation_deg >= 30.0));
        assert!(predict_passes(&delft(), entry, start, end, 90.5)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_pass_in_progress_keeps_its_rise() {
        let loader = TleLoader::from_content(ISS_TLE, "iss.tle").unwrap();
        let entry = loader.find("ISS (ZARYA)", Some(25544)).unwrap();
        let start = Utc.with_ymd_and_hms(2008, 9, 20, 12, 0, 0).unwrap();
        let end = start + Duration::hours(24);

        let passes = predict_passes(&delft(), entry, start, end, 0.0).unwrap();
        let first = passes
            .iter()
            .filter(|p| p.aos > start)
            .max_by_key(|p| p.los - p.aos)
            .unwrap();

        // Refresh halfway through the pass, off the whole-second grid.
        let mid_pass = first.aos + (first.los - first.aos) / 2 + Duration::milliseconds(750);
        let again = predict_passes(&delft(), entry, mid_pass, end, 0.0).unwrap();

        assert_eq!(again[0].aos, first.aos);
        assert_eq!(again[0].los, first.los);
        assert!((again[0].max_elevation_deg - first.max_elevation_deg).abs() < 3.0);
    }
}
