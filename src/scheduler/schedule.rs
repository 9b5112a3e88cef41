use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

use crate::predict::PredictionBatch;
use crate::scheduler::event::{EventKey, ManualRequest, PassEvent, Source};

pub type SharedSchedule = Arc<Mutex<PassSchedule>>;

/// Lock the shared schedule, recovering from poisoning.
pub fn lock(schedule: &SharedSchedule) -> MutexGuard<'_, PassSchedule> {
    schedule.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Error, PartialEq)]
pub enum ScheduleError {
    #[error("invalid event {key}: {message}")]
    Validation { key: String, message: String },
    #[error("manual entry not found: {0}")]
    NotFound(String),
}

fn invalid(event: &PassEvent, message: &str) -> ScheduleError {
    ScheduleError::Validation {
        key: event.key().to_string(),
        message: message.to_string(),
    }
}

fn manual_event(request: &ManualRequest) -> Result<PassEvent, ScheduleError> {
    let event = request.to_event().ok_or_else(|| ScheduleError::Validation {
        key: request.key().to_string(),
        message: "end is out of range".to_string(),
    })?;
    if event.start >= event.end {
        return Err(invalid(&event, "duration must be positive"));
    }
    Ok(event)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntryStatus {
    Active,
    Superseded,
}

/// Listing view of one schedule entry.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ScheduleEntry {
    pub key: String,
    #[serde(flatten)]
    pub event: PassEvent,
    pub status: EntryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
}

#[derive(Debug, Clone)]
struct Superseded {
    event: PassEvent,
    by: EventKey,
}

/// Upcoming, active and recently finished passes.
///
/// Predicted entries are rebuilt wholesale on every refresh; manual entries
/// persist across refreshes. A predicted entry that overlaps a manual entry for
/// the same satellite is moved to the superseded list rather than dropped, so
/// the listing still shows what the prediction said.
#[derive(Debug, Default)]
pub struct PassSchedule {
    predicted: BTreeMap<EventKey, PassEvent>,
    manual: BTreeMap<EventKey, PassEvent>,
    superseded: BTreeMap<EventKey, Superseded>,
    epoch: Option<u64>,
}

impl PassSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedSchedule {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Swap the predicted contents for `events`.
    ///
    /// All-or-nothing: a single invalid event rejects the whole batch and the
    /// schedule is left untouched. Duplicates and same-satellite overlaps keep
    /// the higher-precedence event.
    pub fn replace(&mut self, events: Vec<PassEvent>) -> Result<(), ScheduleError> {
        for event in &events {
            if event.start >= event.end {
                return Err(invalid(event, "start must be before end"));
            }
            if event.source == Source::Manual {
                return Err(invalid(event, "manual entries cannot be replaced in bulk"));
            }
        }

        let mut candidates = events;
        candidates.sort_by(|a, b| a.precedence().cmp(&b.precedence()));

        let mut accepted: Vec<PassEvent> = Vec::with_capacity(candidates.len());
        for event in candidates {
            let clash = accepted
                .iter()
                .any(|kept| kept.satellite == event.satellite && kept.overlaps(&event));
            if clash {
                log::debug!("Dropping duplicate prediction {}", event.key());
                continue;
            }
            accepted.push(event);
        }

        let mut predicted = BTreeMap::new();
        let mut superseded = BTreeMap::new();
        for event in accepted {
            match self.manual_overlapping(&event) {
                Some(by) => {
                    superseded.insert(event.key(), Superseded { event, by });
                }
                None => {
                    predicted.insert(event.key(), event);
                }
            }
        }

        self.predicted = predicted;
        self.superseded = superseded;
        Ok(())
    }

    /// Apply a prediction refresh.
    ///
    /// A remote batch replaces the predictions outright. A fallback batch keeps
    /// previous remote entries that are still valid and were computed for the
    /// same station location, and only contributes passes for satellites that
    /// have no such entry.
    pub fn apply_predictions(
        &mut self,
        batch: PredictionBatch,
        now: DateTime<Utc>,
    ) -> Result<usize, ScheduleError> {
        let events = if batch.origin == Source::LocalFallback && self.epoch == Some(batch.epoch) {
            let kept: Vec<PassEvent> = self
                .predicted_events()
                .into_iter()
                .filter(|e| e.source == Source::Remote && e.end > now)
                .collect();
            let covered: HashSet<&str> = kept.iter().map(|e| e.satellite.as_str()).collect();
            let added: Vec<PassEvent> = batch
                .events
                .into_iter()
                .filter(|e| !covered.contains(e.satellite.as_str()))
                .collect();
            log::info!(
                "Fallback refresh: kept {} remote entries, added {} fallback entries",
                kept.len(),
                added.len()
            );
            kept.into_iter().chain(added).collect()
        } else {
            batch.events
        };

        let count = events.len();
        self.replace(events)?;
        self.epoch = Some(batch.epoch);
        Ok(count)
    }

    /// Insert or overwrite a manual entry. Overlapping manual entries for the
    /// same satellite are replaced; overlapping predictions are superseded.
    pub fn upsert_manual(&mut self, request: &ManualRequest) -> Result<EventKey, ScheduleError> {
        let event = manual_event(request)?;
        Ok(self.insert_manual(event))
    }

    fn insert_manual(&mut self, event: PassEvent) -> EventKey {
        let replaced: Vec<EventKey> = self
            .manual
            .values()
            .filter(|m| m.satellite == event.satellite && m.overlaps(&event))
            .map(|m| m.key())
            .collect();
        for key in replaced {
            self.manual.remove(&key);
            self.restore_superseded_by(&key);
        }

        let key = event.key();
        let displaced: Vec<EventKey> = self
            .predicted
            .values()
            .filter(|p| p.satellite == event.satellite && p.overlaps(&event))
            .map(|p| p.key())
            .collect();
        for predicted_key in displaced {
            if let Some(predicted) = self.predicted.remove(&predicted_key) {
                log::info!("{} superseded by manual entry {}", predicted_key, key);
                self.superseded.insert(
                    predicted_key,
                    Superseded {
                        event: predicted,
                        by: key.clone(),
                    },
                );
            }
        }

        self.manual.insert(key.clone(), event);
        key
    }

    /// Remove a manual entry and reinstate the predictions it displaced.
    pub fn remove_manual(&mut self, key: &EventKey) -> Result<PassEvent, ScheduleError> {
        let removed = self
            .manual
            .remove(key)
            .ok_or_else(|| ScheduleError::NotFound(key.to_string()))?;
        self.restore_superseded_by(key);
        Ok(removed)
    }

    /// Make the manual entries match `requests` exactly. Nothing changes
    /// unless every request is valid.
    pub fn sync_manual(&mut self, requests: &[ManualRequest]) -> Result<(), ScheduleError> {
        let events = requests
            .iter()
            .map(manual_event)
            .collect::<Result<Vec<_>, _>>()?;

        let wanted: HashSet<EventKey> = events.iter().map(PassEvent::key).collect();
        let stale: Vec<EventKey> = self
            .manual
            .keys()
            .filter(|k| !wanted.contains(*k))
            .cloned()
            .collect();
        for key in stale {
            self.manual.remove(&key);
            self.restore_superseded_by(&key);
        }
        for event in events {
            let unchanged = self
                .manual
                .get(&event.key())
                .is_some_and(|existing| existing.end == event.end);
            if !unchanged {
                self.insert_manual(event);
            }
        }
        Ok(())
    }

    /// Earliest event that should be armed or running at `now`.
    pub fn next_due(&self, now: DateTime<Utc>, lookahead: Duration) -> Option<PassEvent> {
        self.due(now, lookahead).into_iter().next()
    }

    /// Every active event with `start <= now + lookahead` and `end > now`,
    /// earliest first; manual beats remote beats fallback on equal starts.
    pub fn due(&self, now: DateTime<Utc>, lookahead: Duration) -> Vec<PassEvent> {
        let horizon = now + lookahead;
        let mut due: Vec<PassEvent> = self
            .active_iter()
            .filter(|e| e.start <= horizon && e.end > now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.due_order().cmp(&b.due_order()));
        due
    }

    /// Drop everything that ended before `now - retention`.
    pub fn purge(&mut self, now: DateTime<Utc>, retention: Duration) -> usize {
        let cutoff = now - retention;
        let before = self.len() + self.superseded.len();
        self.predicted.retain(|_, e| e.end >= cutoff);
        self.manual.retain(|_, e| e.end >= cutoff);
        self.superseded.retain(|_, s| s.event.end >= cutoff);
        let purged = before - (self.len() + self.superseded.len());
        if purged > 0 {
            log::debug!("Purged {} expired schedule entries", purged);
        }
        purged
    }

    pub fn is_active(&self, key: &EventKey) -> bool {
        self.predicted.contains_key(key) || self.manual.contains_key(key)
    }

    pub fn superseded_by(&self, key: &EventKey) -> Option<&EventKey> {
        self.superseded.get(key).map(|s| &s.by)
    }

    /// Active events sorted by start.
    pub fn active(&self) -> Vec<PassEvent> {
        let mut events: Vec<PassEvent> = self.active_iter().cloned().collect();
        events.sort_by(|a, b| a.due_order().cmp(&b.due_order()));
        events
    }

    #[cfg(test)]
    pub fn manual(&self) -> Vec<PassEvent> {
        self.manual.values().cloned().collect()
    }

    /// All predictions, superseded ones included.
    pub fn predicted_events(&self) -> Vec<PassEvent> {
        self.predicted
            .values()
            .chain(self.superseded.values().map(|s| &s.event))
            .cloned()
            .collect()
    }

    pub fn entries(&self) -> Vec<ScheduleEntry> {
        let active = self.active_iter().map(|e| ScheduleEntry {
            key: e.key().to_string(),
            event: e.clone(),
            status: EntryStatus::Active,
            superseded_by: None,
        });
        let superseded = self.superseded.values().map(|s| ScheduleEntry {
            key: s.event.key().to_string(),
            event: s.event.clone(),
            status: EntryStatus::Superseded,
            superseded_by: Some(s.by.to_string()),
        });
        let mut entries: Vec<ScheduleEntry> = active.chain(superseded).collect();
        entries.sort_by(|a, b| a.event.due_order().cmp(&b.event.due_order()));
        entries
    }

    /// Number of active entries.
    pub fn len(&self) -> usize {
        self.predicted.len() + self.manual.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn active_iter(&self) -> impl Iterator<Item = &PassEvent> {
        self.predicted.values().chain(self.manual.values())
    }

    fn manual_overlapping(&self, event: &PassEvent) -> Option<EventKey> {
        self.manual
            .values()
            .find(|m| m.satellite == event.satellite && m.overlaps(event))
            .map(|m| m.key())
    }

    fn restore_superseded_by(&mut self, key: &EventKey) {
        let restored: Vec<EventKey> = self
            .superseded
            .iter()
            .filter(|(_, s)| &s.by == key)
            .map(|(k, _)| k.clone())
            .collect();
        for restored_key in restored {
            let Some(entry) = self.superseded.remove(&restored_key) else {
                continue;
            };
            match self.manual_overlapping(&entry.event) {
                Some(by) => {
                    self.superseded.insert(
                        restored_key,
                        Superseded {
                            event: entry.event,
                            by,
                        },
                    );
                }
                None => {
                    self.predicted.insert(restored_key, entry.event);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 3, 12, 0, 0).unwrap()
    }

    fn event(sat: &str, start_min: i64, end_min: i64, source: Source) -> PassEvent {
        PassEvent {
            satellite: sat.into(),
            start: t0() + Duration::minutes(start_min),
            end: t0() + Duration::minutes(end_min),
            max_elevation_deg: 40.0,
            source,
        }
    }

    fn manual(sat: &str, start_min: i64, minutes: i64) -> ManualRequest {
        ManualRequest::new(sat, t0() + Duration::minutes(start_min), Duration::minutes(minutes))
    }

    #[test]
    fn test_replace_sorts_and_dedups() {
        let mut schedule = PassSchedule::new();
        schedule
            .replace(vec![
                event("NOAA-18", 60, 75, Source::Remote),
                event("NOAA-15", 5, 20, Source::Remote),
                event("NOAA-15", 5, 20, Source::LocalFallback),
                event("METEOR-M2-3", 30, 45, Source::Remote),
            ])
            .unwrap();

        let active = schedule.active();
        assert_eq!(active.len(), 3);
        assert!(active.windows(2).all(|w| w[0].start <= w[1].start));
        assert_eq!(active[0].source, Source::Remote);

        let keys: HashSet<EventKey> = active.iter().map(|e| e.key()).collect();
        assert_eq!(keys.len(), active.len());
    }

    #[test]
    fn test_replace_prefers_remote_over_overlapping_fallback() {
        let mut schedule = PassSchedule::new();
        schedule
            .replace(vec![
                event("NOAA-19", 4, 19, Source::LocalFallback),
                event("NOAA-19", 5, 20, Source::Remote),
            ])
            .unwrap();

        let active = schedule.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].source, Source::Remote);
    }

    #[test]
    fn test_replace_rejects_invalid_batch_atomically() {
        let mut schedule = PassSchedule::new();
        schedule
            .replace(vec![event("NOAA-15", 5, 20, Source::Remote)])
            .unwrap();

        let result = schedule.replace(vec![
            event("NOAA-18", 30, 45, Source::Remote),
            event("NOAA-19", 50, 50, Source::Remote),
        ]);
        assert!(matches!(result, Err(ScheduleError::Validation { .. })));

        let active = schedule.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].satellite, "NOAA-15");
    }

    #[test]
    fn test_replace_rejects_manual_tagged_events() {
        let mut schedule = PassSchedule::new();
        let result = schedule.replace(vec![event("ISS", 0, 10, Source::Manual)]);
        assert!(result.is_err());
        assert!(schedule.is_empty());
    }

    #[test]
    fn test_manual_supersedes_overlapping_prediction() {
        let mut schedule = PassSchedule::new();
        schedule
            .replace(vec![
                event("NOAA-19", 5, 20, Source::Remote),
                event("NOAA-15", 5, 20, Source::Remote),
            ])
            .unwrap();

        let key = schedule.upsert_manual(&manual("NOAA-19", 10, 15)).unwrap();

        let predicted_key = event("NOAA-19", 5, 20, Source::Remote).key();
        assert!(!schedule.is_active(&predicted_key));
        assert_eq!(schedule.superseded_by(&predicted_key), Some(&key));
        // Other satellites are scheduled independently.
        assert!(schedule.is_active(&event("NOAA-15", 5, 20, Source::Remote).key()));

        let entries = schedule.entries();
        let superseded: Vec<_> = entries
            .iter()
            .filter(|e| e.status == EntryStatus::Superseded)
            .collect();
        assert_eq!(superseded.len(), 1);
        assert_eq!(superseded[0].event.satellite, "NOAA-19");
    }

    #[test]
    fn test_manual_survives_replace_and_keeps_superseding() {
        let mut schedule = PassSchedule::new();
        schedule.upsert_manual(&manual("NOAA-19", 10, 15)).unwrap();
        schedule
            .replace(vec![event("NOAA-19", 5, 20, Source::Remote)])
            .unwrap();

        assert_eq!(schedule.active().len(), 1);
        assert_eq!(schedule.active()[0].source, Source::Manual);
        assert_eq!(schedule.predicted_events().len(), 1);
    }

    #[test]
    fn test_remove_manual_restores_prediction() {
        let mut schedule = PassSchedule::new();
        schedule
            .replace(vec![event("NOAA-19", 5, 20, Source::Remote)])
            .unwrap();
        let key = schedule.upsert_manual(&manual("NOAA-19", 10, 15)).unwrap();

        schedule.remove_manual(&key).unwrap();

        let active = schedule.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].source, Source::Remote);
        assert!(matches!(
            schedule.remove_manual(&key),
            Err(ScheduleError::NotFound(_))
        ));
    }

    #[test]
    fn test_upsert_manual_overwrites_overlapping_manual() {
        let mut schedule = PassSchedule::new();
        schedule.upsert_manual(&manual("ISS", 0, 10)).unwrap();
        schedule.upsert_manual(&manual("ISS", 5, 10)).unwrap();

        let manual = schedule.manual();
        assert_eq!(manual.len(), 1);
        assert_eq!(manual[0].start, t0() + Duration::minutes(5));
    }

    #[test]
    fn test_upsert_manual_rejects_zero_duration() {
        let mut schedule = PassSchedule::new();
        let result = schedule.upsert_manual(&manual("ISS", 0, 0));
        assert!(result.is_err());
        assert!(schedule.is_empty());
    }

    #[test]
    fn test_upsert_manual_rejects_unrepresentable_end() {
        let mut schedule = PassSchedule::new();
        let request = ManualRequest {
            satellite: "ISS".into(),
            start: t0(),
            duration_seconds: i64::MAX,
        };
        assert!(matches!(
            schedule.upsert_manual(&request),
            Err(ScheduleError::Validation { .. })
        ));
        assert!(schedule.is_empty());
    }

    #[test]
    fn test_failed_sync_leaves_schedule_untouched() {
        let mut schedule = PassSchedule::new();
        schedule
            .replace(vec![event("NOAA-19", 5, 20, Source::Remote)])
            .unwrap();
        schedule.sync_manual(&[manual("NOAA-19", 10, 15)]).unwrap();

        let result = schedule.sync_manual(&[manual("ISS", 60, 10), manual("NOAA-18", 90, 0)]);
        assert!(result.is_err());

        let manual = schedule.manual();
        assert_eq!(manual.len(), 1);
        assert_eq!(manual[0].satellite, "NOAA-19");
        // The displaced prediction stays displaced.
        assert!(schedule
            .superseded_by(&event("NOAA-19", 5, 20, Source::Remote).key())
            .is_some());
    }

    #[test]
    fn test_sync_manual_adds_and_removes() {
        let mut schedule = PassSchedule::new();
        schedule
            .replace(vec![event("NOAA-19", 5, 20, Source::Remote)])
            .unwrap();
        schedule
            .sync_manual(&[manual("NOAA-19", 10, 15), manual("ISS", 60, 10)])
            .unwrap();
        assert_eq!(schedule.manual().len(), 2);
        assert_eq!(schedule.len(), 2);

        schedule.sync_manual(&[manual("ISS", 60, 10)]).unwrap();
        assert_eq!(schedule.manual().len(), 1);
        assert_eq!(schedule.len(), 2);
    }

    #[test]
    fn test_next_due_never_returns_finished_event() {
        let mut schedule = PassSchedule::new();
        schedule
            .replace(vec![
                event("NOAA-15", 0, 10, Source::Remote),
                event("NOAA-18", 10, 25, Source::Remote),
            ])
            .unwrap();

        let lookahead = Duration::seconds(30);
        let due = schedule.next_due(t0() + Duration::minutes(10), lookahead).unwrap();
        assert_eq!(due.satellite, "NOAA-18");

        assert!(schedule
            .next_due(t0() + Duration::minutes(25), lookahead)
            .is_none());
        assert!(schedule
            .next_due(t0() - Duration::minutes(5), lookahead)
            .is_none());
    }

    #[test]
    fn test_next_due_tie_break_by_source() {
        let mut schedule = PassSchedule::new();
        schedule
            .replace(vec![
                event("NOAA-15", 5, 20, Source::LocalFallback),
                event("NOAA-18", 5, 20, Source::Remote),
            ])
            .unwrap();
        schedule.upsert_manual(&manual("ISS", 5, 10)).unwrap();

        let due = schedule.due(t0() + Duration::minutes(5), Duration::zero());
        let sources: Vec<Source> = due.iter().map(|e| e.source).collect();
        assert_eq!(
            sources,
            vec![Source::Manual, Source::Remote, Source::LocalFallback]
        );
    }

    #[test]
    fn test_purge_drops_entries_past_retention() {
        let mut schedule = PassSchedule::new();
        schedule
            .replace(vec![
                event("NOAA-15", 0, 10, Source::Remote),
                event("NOAA-18", 300, 315, Source::Remote),
            ])
            .unwrap();

        let now = t0() + Duration::hours(4);
        let purged = schedule.purge(now, Duration::hours(3));
        assert_eq!(purged, 1);
        assert_eq!(schedule.active()[0].satellite, "NOAA-18");
    }

    #[test]
    fn test_fallback_batch_keeps_valid_remote_entries() {
        let mut schedule = PassSchedule::new();
        let now = t0();
        schedule
            .apply_predictions(
                PredictionBatch {
                    events: vec![
                        event("NOAA-19", 30, 45, Source::Remote),
                        event("NOAA-15", -30, -15, Source::Remote),
                    ],
                    origin: Source::Remote,
                    epoch: 0,
                },
                now,
            )
            .unwrap();

        schedule
            .apply_predictions(
                PredictionBatch {
                    events: vec![
                        event("NOAA-19", 31, 46, Source::LocalFallback),
                        event("NOAA-15", 90, 105, Source::LocalFallback),
                    ],
                    origin: Source::LocalFallback,
                    epoch: 0,
                },
                now,
            )
            .unwrap();

        let active = schedule.active();
        assert_eq!(active.len(), 2);
        let noaa19 = active.iter().find(|e| e.satellite == "NOAA-19").unwrap();
        assert_eq!(noaa19.source, Source::Remote);
        let noaa15 = active.iter().find(|e| e.satellite == "NOAA-15").unwrap();
        assert_eq!(noaa15.source, Source::LocalFallback);
    }

    #[test]
    fn test_fallback_batch_after_location_change_discards_old_entries() {
        let mut schedule = PassSchedule::new();
        let now = t0();
        schedule
            .apply_predictions(
                PredictionBatch {
                    events: vec![event("NOAA-19", 30, 45, Source::Remote)],
                    origin: Source::Remote,
                    epoch: 0,
                },
                now,
            )
            .unwrap();
        schedule
            .apply_predictions(
                PredictionBatch {
                    events: vec![event("NOAA-19", 33, 47, Source::LocalFallback)],
                    origin: Source::LocalFallback,
                    epoch: 1,
                },
                now,
            )
            .unwrap();

        let active = schedule.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].source, Source::LocalFallback);
    }
}
