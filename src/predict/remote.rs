use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::SatelliteConfig;
use crate::predict::error::PredictError;
use crate::predict::GroundStation;
use crate::scheduler::{PassEvent, Source};

/// Client for the prediction collaborator.
///
/// One connection per refresh; one `PREDICT` request per satellite, each
/// answered by pass lines terminated with `END` or `ERROR <message>`.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    address: String,
    timeout: Duration,
}

impl RemoteClient {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }

    pub async fn predict(
        &self,
        station: &GroundStation,
        satellites: &[SatelliteConfig],
        horizon_end: DateTime<Utc>,
    ) -> Result<Vec<PassEvent>, PredictError> {
        timeout(self.timeout, self.exchange(station, satellites, horizon_end))
            .await
            .map_err(|_| {
                PredictError::Unavailable(format!(
                    "{} did not answer within {:?}",
                    self.address, self.timeout
                ))
            })?
    }

    async fn exchange(
        &self,
        station: &GroundStation,
        satellites: &[SatelliteConfig],
        horizon_end: DateTime<Utc>,
    ) -> Result<Vec<PassEvent>, PredictError> {
        let unavailable = |e: std::io::Error| {
            PredictError::Unavailable(format!("{}: {}", self.address, e))
        };

        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(unavailable)?;
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        let mut events = Vec::new();
        for sat in satellites {
            let request = format!(
                "PREDICT {} {:.6} {:.6} {:.1} {}\n",
                sat.name,
                station.latitude_deg,
                station.longitude_deg,
                station.altitude_m,
                horizon_end.timestamp()
            );
            write
                .write_all(request.as_bytes())
                .await
                .map_err(unavailable)?;

            loop {
                let line = lines
                    .next_line()
                    .await
                    .map_err(unavailable)?
                    .ok_or_else(|| {
                        PredictError::Unavailable("collaborator closed the connection".into())
                    })?;
                let line = line.trim();

                if line == "END" {
                    break;
                }
                if let Some(message) = line.strip_prefix("ERROR") {
                    return Err(PredictError::Unavailable(format!(
                        "{}: {}",
                        sat.name,
                        message.trim()
                    )));
                }

                let event = parse_pass_line(&sat.name, line)?;
                if event.max_elevation_deg >= sat.min_elevation_deg {
                    events.push(event);
                }
            }
        }

        Ok(events)
    }
}

/// `<aos_unix> <los_unix> <max_elevation>`
fn parse_pass_line(satellite: &str, line: &str) -> Result<PassEvent, PredictError> {
    let malformed = || PredictError::Unavailable(format!("malformed pass line {:?}", line));

    let mut parts = line.split_whitespace();
    let aos: i64 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(malformed)?;
    let los: i64 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(malformed)?;
    let max_el: f64 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(malformed)?;

    let start = Utc.timestamp_opt(aos, 0).single().ok_or_else(malformed)?;
    let end = Utc.timestamp_opt(los, 0).single().ok_or_else(malformed)?;
    if end <= start {
        return Err(malformed());
    }

    Ok(PassEvent {
        satellite: satellite.to_string(),
        start,
        end,
        max_elevation_deg: max_el,
        source: Source::Remote,
    })
}
