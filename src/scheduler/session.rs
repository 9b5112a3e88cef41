use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::scheduler::event::{PassEvent, Source};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    ToSchema,
    strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
    Pending,
    Armed,
    Recording,
    Completed,
    Aborted,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Aborted | SessionState::Failed
        )
    }

    fn can_become(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Pending, Armed)
                | (Pending, Aborted)
                | (Armed, Recording)
                | (Armed, Aborted)
                | (Armed, Failed)
                | (Recording, Completed)
                | (Recording, Aborted)
                | (Recording, Failed)
        )
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("invalid transition {from} -> {to} for {key}")]
pub struct TransitionError {
    pub key: String,
    pub from: SessionState,
    pub to: SessionState,
}

/// Runtime record of one tracked pass. Every transition is appended to the
/// outcome log as a full snapshot of this struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RecordingSession {
    pub key: String,
    pub satellite: String,
    pub source: Source,
    pub scheduled_start: DateTime<Utc>,
    pub scheduled_end: DateTime<Utc>,
    pub state: SessionState,
    pub actual_start: Option<DateTime<Utc>>,
    pub actual_stop: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    #[schema(value_type = Option<String>)]
    pub artifact: Option<PathBuf>,
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl RecordingSession {
    pub fn new(event: &PassEvent, now: DateTime<Utc>) -> Self {
        Self {
            key: event.key().to_string(),
            satellite: event.satellite.clone(),
            source: event.source,
            scheduled_start: event.start,
            scheduled_end: event.end,
            state: SessionState::Pending,
            actual_start: None,
            actual_stop: None,
            reason: None,
            artifact: None,
            attempts: 0,
            updated_at: now,
        }
    }

    pub fn transition(
        &mut self,
        next: SessionState,
        now: DateTime<Utc>,
        reason: Option<String>,
    ) -> Result<(), TransitionError> {
        if !self.state.can_become(next) {
            return Err(TransitionError {
                key: self.key.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = now;
        if reason.is_some() {
            self.reason = reason;
        }
        Ok(())
    }
}
