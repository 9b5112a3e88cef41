use std::fmt;
use std::path::PathBuf;

/// One request line of the receiver's remote-control protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    SetFrequency(u64),
    SetMode(String),
    SetFilterWidth(u32),
    SetSquelch(i32),
    SetGain(i32),
    AgcOff,
    Aos,
    Los,
    RecordStart(PathBuf),
    RecordStop,
    GetFrequency,
}

impl Request {
    /// Setters answer with `RPRT <code>`; queries answer with a value.
    pub fn expects_report(&self) -> bool {
        !matches!(self, Request::GetFrequency)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::SetFrequency(hz) => write!(f, "F {}", hz),
            Request::SetMode(mode) => write!(f, "M {}", mode),
            Request::SetFilterWidth(hz) => write!(f, "L {}", hz),
            Request::SetSquelch(db) => write!(f, "L SQL {}", db),
            Request::SetGain(gain) => write!(f, "L RF {}", gain),
            Request::AgcOff => write!(f, "L AGC OFF"),
            Request::Aos => write!(f, "AOS"),
            Request::Los => write!(f, "LOS"),
            Request::RecordStart(path) => write!(f, "RECORD {}", path.display()),
            Request::RecordStop => write!(f, "RECORD OFF"),
            Request::GetFrequency => write!(f, "f"),
        }
    }
}

/// `RPRT 0` -> `Some(0)`. Anything else is not a report.
pub fn parse_report(line: &str) -> Option<i32> {
    line.trim().strip_prefix("RPRT")?.trim().parse().ok()
}

pub fn parse_frequency(line: &str) -> Option<u64> {
    let value = line.trim();
    value
        .parse::<u64>()
        .ok()
        .or_else(|| value.parse::<f64>().ok().filter(|f| *f >= 0.0).map(|f| f.round() as u64))
}
