use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use super::nmea::{parse_gga, NmeaError};
use super::GpsFix;

/// Accept NMEA streams (one sender at a time, GPS2IP style) and forward at
/// most one fix per `update_interval`.
pub async fn run_listener(
    listener: TcpListener,
    update_interval: Duration,
    fixes: mpsc::Sender<GpsFix>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    log::info!("Listening for NMEA sentences on {}", listener.local_addr()?);
    let mut last_sent: Option<Instant> = None;

    loop {
        let stream = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    log::info!("GPS source connected from {}", peer);
                    stream
                }
                Err(e) => {
                    log::warn!("GPS accept failed: {}", e);
                    continue;
                }
            },
            _ = shutdown.changed() => break,
        };

        if !forward_fixes(stream, update_interval, &fixes, &mut shutdown, &mut last_sent).await {
            break;
        }
    }

    log::info!("GPS listener stopped");
    Ok(())
}

/// Returns false when the listener should stop.
async fn forward_fixes(
    stream: TcpStream,
    update_interval: Duration,
    fixes: &mpsc::Sender<GpsFix>,
    shutdown: &mut watch::Receiver<bool>,
    last_sent: &mut Option<Instant>,
) -> bool {
    let mut lines = BufReader::new(stream).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = shutdown.changed() => return false,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                log::info!("GPS source disconnected");
                return true;
            }
            Err(e) => {
                log::warn!("GPS stream error: {}", e);
                return true;
            }
        };

        let fix = match parse_gga(&line, Utc::now()) {
            Ok(fix) => fix,
            Err(NmeaError::NotGga) | Err(NmeaError::NotNmea) => continue,
            Err(e) => {
                log::debug!("Ignoring NMEA sentence: {}", e);
                continue;
            }
        };

        if last_sent.is_some_and(|at| at.elapsed() < update_interval) {
            continue;
        }
        *last_sent = Some(Instant::now());

        log::debug!(
            "GPS fix {:.5},{:.5} alt {:.0} m ({} sats)",
            fix.latitude_deg,
            fix.longitude_deg,
            fix.altitude_m,
            fix.satellites
        );
        if fixes.send(fix).await.is_err() {
            return false;
        }
    }
}
