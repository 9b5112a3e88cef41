use chrono::{DateTime, Utc};
use thiserror::Error;

use super::GpsFix;

#[derive(Debug, Error, PartialEq)]
pub enum NmeaError {
    #[error("not an NMEA sentence")]
    NotNmea,
    #[error("checksum mismatch: expected {expected:02X}, computed {computed:02X}")]
    Checksum { expected: u8, computed: u8 },
    #[error("not a GGA sentence")]
    NotGga,
    #[error("no position fix")]
    NoFix,
    #[error("malformed field {0}")]
    Field(&'static str),
}

/// Parse a `$--GGA` sentence into a fix.
///
/// The checksum is verified when present. Sentences reporting fix quality 0
/// are rejected with [`NmeaError::NoFix`].
pub fn parse_gga(line: &str, received_at: DateTime<Utc>) -> Result<GpsFix, NmeaError> {
    let line = line.trim();
    let body = line.strip_prefix('$').ok_or(NmeaError::NotNmea)?;

    let body = match body.split_once('*') {
        Some((data, checksum)) => {
            let expected =
                u8::from_str_radix(checksum.trim(), 16).map_err(|_| NmeaError::Field("checksum"))?;
            let computed = checksum_of(data);
            if expected != computed {
                return Err(NmeaError::Checksum { expected, computed });
            }
            data
        }
        None => body,
    };

    let fields: Vec<&str> = body.split(',').collect();
    let talker = fields.first().copied().unwrap_or_default();
    if talker.len() != 5 || !talker.ends_with("GGA") {
        return Err(NmeaError::NotGga);
    }
    if fields.len() < 10 {
        return Err(NmeaError::Field("field count"));
    }

    let quality: u8 = fields[6].parse().map_err(|_| NmeaError::Field("fix quality"))?;
    if quality == 0 {
        return Err(NmeaError::NoFix);
    }

    let latitude_deg = coordinate(fields[2], fields[3], ('N', 'S'), 2, 90.0)
        .ok_or(NmeaError::Field("latitude"))?;
    let longitude_deg = coordinate(fields[4], fields[5], ('E', 'W'), 3, 180.0)
        .ok_or(NmeaError::Field("longitude"))?;

    let satellites = fields[7].parse().unwrap_or(0);
    let altitude_m = fields[9].parse().unwrap_or(0.0);

    Ok(GpsFix {
        latitude_deg,
        longitude_deg,
        altitude_m,
        satellites,
        received_at,
    })
}

fn checksum_of(data: &str) -> u8 {
    data.bytes().fold(0, |acc, b| acc ^ b)
}

/// `ddmm.mmmm` / `dddmm.mmmm` plus hemisphere to signed decimal degrees,
/// at most `limit` in magnitude.
fn coordinate(
    value: &str,
    hemisphere: &str,
    (positive, negative): (char, char),
    deg_digits: usize,
    limit: f64,
) -> Option<f64> {
    if value.len() <= deg_digits {
        return None;
    }
    let degrees: f64 = value.get(..deg_digits)?.parse().ok()?;
    let minutes: f64 = value.get(deg_digits..)?.parse().ok()?;
    if !(0.0..60.0).contains(&minutes) {
        return None;
    }
    let magnitude = degrees + minutes / 60.0;
    if magnitude > limit {
        return None;
    }

    match hemisphere.chars().next()? {
        c if c == positive => Some(magnitude),
        c if c == negative => Some(-magnitude),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 3, 12, 35, 19).unwrap()
    }

    #[test]
    fn test_parse_gga() {
        let fix = parse_gga(
            "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47",
            now(),
        )
        .unwrap();

        assert!((fix.latitude_deg - 48.1173).abs() < 1e-4);
        assert!((fix.longitude_deg - 11.516_666).abs() < 1e-4);
        assert_eq!(fix.altitude_m, 545.4);
        assert_eq!(fix.satellites, 8);
        assert_eq!(fix.received_at, now());
    }

    #[test]
    fn test_western_hemisphere() {
        let fix = parse_gga(
            "$GNGGA,092750.000,5321.6802,N,00630.3372,W,1,8,1.03,61.7,M,55.2,M,,*68\r\n",
            now(),
        )
        .unwrap();

        assert!((fix.latitude_deg - 53.361_337).abs() < 1e-4);
        assert!((fix.longitude_deg + 6.505_62).abs() < 1e-4);
    }

    #[test]
    fn test_coordinates_out_of_range() {
        assert_eq!(
            parse_gga("$GPGGA,123519,9507.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,", now()),
            Err(NmeaError::Field("latitude"))
        );
        assert_eq!(
            parse_gga("$GPGGA,123519,4807.038,N,18100.000,W,1,08,0.9,545.4,M,46.9,M,,", now()),
            Err(NmeaError::Field("longitude"))
        );

        let pole = parse_gga("$GPGGA,123519,9000.000,S,18000.000,E,1,08,0.9,2835.0,M,,,,", now())
            .unwrap();
        assert_eq!(pole.latitude_deg, -90.0);
        assert_eq!(pole.longitude_deg, 180.0);
    }

    #[test]
    fn test_checksum_mismatch() {
        let err = parse_gga(
            "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*48",
            now(),
        )
        .unwrap_err();
        assert!(matches!(err, NmeaError::Checksum { expected: 0x48, computed: 0x47 }));
    }

    #[test]
    fn test_no_fix() {
        assert_eq!(
            parse_gga("$GPGGA,123519,4807.038,N,01131.000,E,0,00,,,M,,M,,*52", now()),
            Err(NmeaError::NoFix)
        );
    }

    #[test]
    fn test_other_sentences_ignored() {
        assert_eq!(
            parse_gga("$GPVTG,054.7,T,034.4,M,005.5,N,010.2,K", now()),
            Err(NmeaError::NotGga)
        );
        assert_eq!(parse_gga("hello", now()), Err(NmeaError::NotNmea));
    }
}
