use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Where a pass event came from. Declaration order is precedence order.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    ToSchema,
    strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Source {
    Manual,
    Remote,
    LocalFallback,
}

impl Source {
    /// Lower rank wins.
    pub fn rank(self) -> u8 {
        match self {
            Source::Manual => 0,
            Source::Remote => 1,
            Source::LocalFallback => 2,
        }
    }
}

/// Identity of a pass: satellite plus start instant. Orders by start first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
pub struct EventKey {
    pub start: DateTime<Utc>,
    pub satellite: String,
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}",
            self.satellite,
            self.start.format("%Y-%m-%dT%H:%M:%SZ")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PassEvent {
    pub satellite: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub max_elevation_deg: f64,
    pub source: Source,
}

impl PassEvent {
    pub fn key(&self) -> EventKey {
        EventKey {
            start: self.start,
            satellite: self.satellite.clone(),
        }
    }

    pub fn overlaps(&self, other: &PassEvent) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Sort key for precedence: source first, earlier start breaks ties.
    pub fn precedence(&self) -> (u8, DateTime<Utc>, &str) {
        (self.source.rank(), self.start, self.satellite.as_str())
    }

    /// Sort key for the order in which events become due.
    pub fn due_order(&self) -> (DateTime<Utc>, u8, &str) {
        (self.start, self.source.rank(), self.satellite.as_str())
    }

    pub fn widened(mut self, margin: Duration) -> Self {
        self.start -= margin;
        self.end += margin;
        self
    }
}

/// A recording requested by an operator rather than predicted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ManualRequest {
    pub satellite: String,
    pub start: DateTime<Utc>,
    pub duration_seconds: i64,
}

impl ManualRequest {
    pub fn new(satellite: impl Into<String>, start: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            satellite: satellite.into(),
            start,
            duration_seconds: duration.num_seconds(),
        }
    }

    /// `None` when the end is not a representable instant.
    pub fn end(&self) -> Option<DateTime<Utc>> {
        Duration::try_seconds(self.duration_seconds)
            .and_then(|duration| self.start.checked_add_signed(duration))
    }

    pub fn key(&self) -> EventKey {
        EventKey {
            start: self.start,
            satellite: self.satellite.clone(),
        }
    }

    /// Manual passes are assumed to peak overhead.
    pub fn to_event(&self) -> Option<PassEvent> {
        Some(PassEvent {
            satellite: self.satellite.clone(),
            start: self.start,
            end: self.end()?,
            max_elevation_deg: 90.0,
            source: Source::Manual,
        })
    }
}
