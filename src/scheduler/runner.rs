use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use utoipa::ToSchema;

use crate::config::{to_chrono, Config};
use crate::predict::PredictionBatch;
use crate::radio::{ControllerSession, Radio, Tuning};
use crate::scheduler::artifacts::{artifact_path, OutcomeSink};
use crate::scheduler::event::{EventKey, ManualRequest, PassEvent};
use crate::scheduler::schedule::{self, ScheduleError, SharedSchedule};
use crate::scheduler::session::{RecordingSession, SessionState};

const RADIO_POLL: StdDuration = StdDuration::from_secs(30);

/// Changes to the schedule, applied by the control loop under the lock.
#[derive(Debug)]
pub enum ScheduleUpdate {
    Predictions(PredictionBatch),
    UpsertManual(ManualRequest),
    RemoveManual(EventKey),
    SyncManual(Vec<ManualRequest>),
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub tick: StdDuration,
    pub preroll: Duration,
    pub retention: Duration,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub max_retry_backoff: Duration,
    pub stop_timeout: StdDuration,
    pub recordings_dir: PathBuf,
}

impl ManagerSettings {
    pub fn from_config(config: &Config) -> Self {
        let s = &config.scheduler;
        Self {
            tick: s.tick,
            preroll: to_chrono(s.preroll),
            retention: to_chrono(s.retention),
            max_attempts: s.max_attempts,
            retry_backoff: to_chrono(s.retry_backoff),
            max_retry_backoff: to_chrono(s.max_retry_backoff),
            stop_timeout: s.stop_timeout,
            recordings_dir: config.radio.recordings_dir.clone(),
        }
    }
}

/// Snapshot published after every tick.
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct ManagerStatus {
    pub updated_at: Option<DateTime<Utc>>,
    pub sessions: Vec<RecordingSession>,
    pub radio: ControllerSession,
}

struct Tracked {
    event: PassEvent,
    session: RecordingSession,
    tuned: bool,
    next_attempt_at: Option<DateTime<Utc>>,
    stop_attempts: u32,
}

impl Tracked {
    fn is_live(&self) -> bool {
        !self.session.state.is_terminal()
    }

    fn holds_receiver(&self) -> bool {
        matches!(
            self.session.state,
            SessionState::Armed | SessionState::Recording
        )
    }
}

/// Drives the receiver from the schedule.
///
/// Each tracked pass walks `Pending -> Armed -> Recording` and ends in
/// `Completed`, `Aborted` or `Failed`. The receiver is a single resource: at
/// most one pass is armed or recording at any time, and overlapping passes are
/// settled by precedence before either reaches the receiver. Every transition
/// is appended to the outcome sink.
pub struct RecordingManager<R: Radio, S: OutcomeSink> {
    schedule: SharedSchedule,
    radio: R,
    sink: S,
    satellites: HashMap<String, Tuning>,
    settings: ManagerSettings,
    tracked: BTreeMap<EventKey, Tracked>,
    status: Option<watch::Sender<ManagerStatus>>,
}

impl<R: Radio, S: OutcomeSink> RecordingManager<R, S> {
    pub fn new(
        schedule: SharedSchedule,
        radio: R,
        sink: S,
        satellites: HashMap<String, Tuning>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            schedule,
            radio,
            sink,
            satellites,
            settings,
            tracked: BTreeMap::new(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: watch::Sender<ManagerStatus>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn sessions(&self) -> Vec<RecordingSession> {
        self.tracked.values().map(|t| t.session.clone()).collect()
    }

    pub fn apply(&mut self, update: ScheduleUpdate, now: DateTime<Utc>) -> Result<(), ScheduleError> {
        let mut schedule = schedule::lock(&self.schedule);
        match update {
            ScheduleUpdate::Predictions(batch) => {
                let origin = batch.origin;
                let count = schedule.apply_predictions(batch, now)?;
                log::info!("Schedule rebuilt from {} predictions ({} entries)", origin, count);
            }
            ScheduleUpdate::UpsertManual(request) => {
                let key = schedule.upsert_manual(&request)?;
                log::info!("Manual entry {} scheduled", key);
            }
            ScheduleUpdate::RemoveManual(key) => {
                schedule.remove_manual(&key)?;
                log::info!("Manual entry {} removed", key);
            }
            ScheduleUpdate::SyncManual(requests) => schedule.sync_manual(&requests)?,
        }
        Ok(())
    }

    /// One pass of the control loop at `now`.
    pub async fn tick(&mut self, now: DateTime<Utc>) {
        let (due, moved, gone) = {
            let mut schedule = schedule::lock(&self.schedule);
            schedule.purge(now, self.settings.retention);
            let due = schedule.due(now, self.settings.preroll);
            let mut moved: Vec<(EventKey, PassEvent)> = Vec::new();
            let mut gone: Vec<(EventKey, String)> = Vec::new();
            for (key, t) in self.tracked.iter().filter(|(_, t)| t.is_live()) {
                if schedule.is_active(key) {
                    continue;
                }
                if let Some(by) = schedule.superseded_by(key) {
                    gone.push((key.clone(), format!("superseded by {}", by)));
                    continue;
                }
                let successor = if t.holds_receiver() {
                    schedule.active().into_iter().find(|e| {
                        e.satellite == t.event.satellite
                            && e.source == t.event.source
                            && e.overlaps(&t.event)
                            && !self.tracked.contains_key(&e.key())
                    })
                } else {
                    None
                };
                match successor {
                    Some(event) => moved.push((key.clone(), event)),
                    None => gone.push((key.clone(), "removed".to_string())),
                }
            }
            (due, moved, gone)
        };

        for (key, event) in moved {
            self.rekey(&key, event);
        }
        for event in due {
            self.track(event, now);
        }
        for (key, reason) in gone {
            self.abort(&key, now, reason).await;
        }

        self.resolve_overlaps(now).await;

        let keys: Vec<EventKey> = self.tracked.keys().cloned().collect();
        for key in keys {
            let Some(mut tracked) = self.tracked.remove(&key) else {
                continue;
            };
            if tracked.is_live() {
                self.advance(&mut tracked, now).await;
            }
            self.tracked.insert(key, tracked);
        }

        let retention = self.settings.retention;
        self.tracked
            .retain(|_, t| t.is_live() || t.event.end + retention >= now);

        self.publish(now);
    }

    /// Stop any recording and abort everything still in flight.
    pub async fn shutdown(&mut self, now: DateTime<Utc>) {
        let live: Vec<EventKey> = self
            .tracked
            .iter()
            .filter(|(_, t)| t.is_live())
            .map(|(k, _)| k.clone())
            .collect();

        for key in live {
            self.abort(&key, now, "shutdown".to_string()).await;
        }
        self.radio.disconnect();
        self.publish(now);
    }

    pub async fn run(
        mut self,
        mut updates: mpsc::Receiver<ScheduleUpdate>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.settings.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut radio_poll = tokio::time::interval(RADIO_POLL);
        radio_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::info!("Recording manager started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(Utc::now()).await,
                _ = radio_poll.tick() => self.poll_radio().await,
                Some(update) = updates.recv() => {
                    if let Err(e) = self.apply(update, Utc::now()) {
                        log::error!("Rejected schedule update: {}", e);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        log::info!("Recording manager shutting down");
        self.shutdown(Utc::now()).await;
    }

    /// Refresh the receiver snapshot; also reconnects after an error.
    async fn poll_radio(&mut self) {
        if let Err(e) = self.radio.status().await {
            log::warn!("Radio status check failed: {}", e);
        }
        self.publish(Utc::now());
    }

    fn track(&mut self, event: PassEvent, now: DateTime<Utc>) {
        let key = event.key();
        if let Some(tracked) = self.tracked.get_mut(&key) {
            // A manual entry may have been resized under the same key.
            if tracked.is_live() && tracked.event.end != event.end {
                tracked.session.scheduled_end = event.end;
                tracked.event = event;
            }
            return;
        }

        let session = RecordingSession::new(&event, now);
        log::info!(
            "Tracking {} ({}, {} - {})",
            session.key,
            event.source,
            event.start.format("%H:%M:%S"),
            event.end.format("%H:%M:%S")
        );
        self.emit(&session);
        self.tracked.insert(
            key,
            Tracked {
                event,
                session,
                tuned: false,
                next_attempt_at: None,
                stop_attempts: 0,
            },
        );
    }

    /// Follow a refreshed prediction of the pass already holding the receiver,
    /// so the session carries on under the new window.
    fn rekey(&mut self, old: &EventKey, event: PassEvent) {
        let Some(mut tracked) = self.tracked.remove(old) else {
            return;
        };
        let key = event.key();
        log::info!(
            "{}: window moved to {} - {}",
            tracked.session.key,
            event.start.format("%H:%M:%S"),
            event.end.format("%H:%M:%S")
        );
        tracked.session.scheduled_end = event.end;
        tracked.event = event;
        self.tracked.insert(key, tracked);
    }

    /// Grant the receiver in precedence order. A recording pass only yields
    /// to a higher-ranked source.
    async fn resolve_overlaps(&mut self, now: DateTime<Utc>) {
        let mut candidates: Vec<(EventKey, PassEvent, bool)> = self
            .tracked
            .iter()
            .filter(|(_, t)| t.is_live())
            .map(|(k, t)| {
                (
                    k.clone(),
                    t.event.clone(),
                    t.session.state == SessionState::Recording,
                )
            })
            .collect();
        candidates.sort_by(|a, b| {
            (a.1.source.rank(), !a.2, a.1.start, &a.1.satellite).cmp(&(
                b.1.source.rank(),
                !b.2,
                b.1.start,
                &b.1.satellite,
            ))
        });

        let mut accepted: Vec<PassEvent> = Vec::new();
        let mut losers: Vec<(EventKey, String)> = Vec::new();
        for (key, event, _) in candidates {
            match accepted.iter().find(|winner| winner.overlaps(&event)) {
                Some(winner) => losers.push((key, format!("superseded by {}", winner.key()))),
                None => accepted.push(event),
            }
        }

        for (key, reason) in losers {
            self.abort(&key, now, reason).await;
        }
    }

    async fn advance(&mut self, t: &mut Tracked, now: DateTime<Utc>) {
        match t.session.state {
            SessionState::Pending => {
                let busy = self.tracked.values().any(Tracked::holds_receiver);
                if now >= t.event.start - self.settings.preroll && !busy {
                    self.transition(t, SessionState::Armed, now, None);
                    t.tuned = self.tune(&t.event.satellite).await.is_ok();
                }
            }
            SessionState::Armed => {
                if now >= t.event.end {
                    if t.session.attempts > 0 {
                        self.release(&t.session.key).await;
                    }
                    self.transition(
                        t,
                        SessionState::Failed,
                        now,
                        Some("window ended before recording started".into()),
                    );
                    return;
                }
                let backoff_elapsed = t.next_attempt_at.is_none_or(|at| now >= at);
                if now >= t.event.start && backoff_elapsed {
                    self.try_start(t, now).await;
                }
            }
            SessionState::Recording => {
                if now >= t.event.end {
                    self.try_stop(t, now).await;
                }
            }
            _ => {}
        }
    }

    async fn try_start(&mut self, t: &mut Tracked, now: DateTime<Utc>) {
        let result = match self.prepare(t).await {
            Ok(target) => self
                .radio
                .start(&target)
                .await
                .map(|_| target)
                .map_err(|e| e.to_string()),
            Err(e) => Err(e),
        };
        t.session.attempts += 1;

        match result {
            Ok(target) => {
                t.session.actual_start = Some(now);
                t.session.artifact = Some(target);
                self.transition(t, SessionState::Recording, now, None);
            }
            Err(e) if t.session.attempts >= self.settings.max_attempts => {
                // A timed-out start may still have reached the receiver.
                self.release(&t.session.key).await;
                self.transition(
                    t,
                    SessionState::Failed,
                    now,
                    Some(format!("start failed after {} attempts: {}", t.session.attempts, e)),
                );
            }
            Err(e) => {
                let wait = self.backoff(t.session.attempts);
                t.next_attempt_at = Some(now + wait);
                log::warn!(
                    "{}: start attempt {} failed ({}), retrying in {}s",
                    t.session.key,
                    t.session.attempts,
                    e,
                    wait.num_seconds()
                );
            }
        }
    }

    /// Tune if the arming tune failed, then pick the artifact path.
    async fn prepare(&mut self, t: &mut Tracked) -> Result<PathBuf, String> {
        if !t.tuned {
            self.tune(&t.event.satellite).await?;
            t.tuned = true;
        }
        let target = artifact_path(&self.settings.recordings_dir, &t.event.satellite, t.event.start);
        if let Some(parent) = target.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                log::warn!("Cannot create {}: {}", parent.display(), e);
            }
        }
        Ok(target)
    }

    async fn try_stop(&mut self, t: &mut Tracked, now: DateTime<Utc>) {
        match self.radio.stop().await {
            Ok(()) => {
                t.session.actual_stop = Some(now);
                self.transition(t, SessionState::Completed, now, None);
            }
            Err(e) => {
                t.stop_attempts += 1;
                if t.stop_attempts >= self.settings.max_attempts {
                    self.transition(
                        t,
                        SessionState::Failed,
                        now,
                        Some(format!("stop failed after {} attempts: {}", t.stop_attempts, e)),
                    );
                } else {
                    log::warn!("{}: stop attempt {} failed: {}", t.session.key, t.stop_attempts, e);
                }
            }
        }
    }

    async fn abort(&mut self, key: &EventKey, now: DateTime<Utc>, reason: String) {
        let Some(mut t) = self.tracked.remove(key) else {
            return;
        };
        if t.is_live() {
            if t.session.state == SessionState::Recording && self.release(&t.session.key).await {
                t.session.actual_stop = Some(now);
            }
            self.transition(&mut t, SessionState::Aborted, now, Some(reason));
        }
        self.tracked.insert(key.clone(), t);
    }

    /// Best-effort bounded stop. Returns whether the receiver confirmed it.
    async fn release(&mut self, key: &str) -> bool {
        match tokio::time::timeout(self.settings.stop_timeout, self.radio.stop()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                log::warn!("{}: stop failed: {}", key, e);
                false
            }
            Err(_) => {
                log::warn!("{}: stop timed out", key);
                false
            }
        }
    }

    async fn tune(&mut self, satellite: &str) -> Result<(), String> {
        let tuning = self
            .satellites
            .get(satellite)
            .ok_or_else(|| format!("no tuning configured for {}", satellite))?;
        self.radio.tune(tuning).await.map_err(|e| {
            log::warn!("Tuning for {} failed: {}", satellite, e);
            e.to_string()
        })
    }

    fn backoff(&self, attempts: u32) -> Duration {
        let factor = 1i32 << attempts.saturating_sub(1).min(16);
        (self.settings.retry_backoff * factor).min(self.settings.max_retry_backoff)
    }

    fn transition(
        &mut self,
        t: &mut Tracked,
        next: SessionState,
        now: DateTime<Utc>,
        reason: Option<String>,
    ) {
        let from = t.session.state;
        if let Err(e) = t.session.transition(next, now, reason) {
            log::error!("{}", e);
            return;
        }
        match (&t.session.reason, next) {
            (Some(reason), SessionState::Aborted | SessionState::Failed) => {
                log::warn!("{}: {} -> {} ({})", t.session.key, from, next, reason)
            }
            _ => log::info!("{}: {} -> {}", t.session.key, from, next),
        }
        self.emit(&t.session);
    }

    fn emit(&mut self, session: &RecordingSession) {
        if let Err(e) = self.sink.append(session) {
            log::error!("Failed to persist record for {}: {}", session.key, e);
        }
    }

    fn publish(&self, now: DateTime<Utc>) {
        if let Some(status) = &self.status {
            status.send_replace(ManagerStatus {
                updated_at: Some(now),
                sessions: self.sessions(),
                radio: self.radio.session(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::ControllerError;
    use crate::scheduler::event::Source;
    use crate::scheduler::schedule::PassSchedule;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::io;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Default)]
    struct RadioScript {
        commands: Vec<String>,
        start_failures: u32,
        recording: Option<PathBuf>,
        unconfirmed: bool,
    }

    #[derive(Clone, Default)]
    struct ScriptedRadio(Arc<Mutex<RadioScript>>);

    impl ScriptedRadio {
        fn failing_starts(n: u32) -> Self {
            let radio = Self::default();
            radio.0.lock().unwrap().start_failures = n;
            radio
        }

        fn commands(&self) -> Vec<String> {
            self.0.lock().unwrap().commands.clone()
        }

        fn count(&self, prefix: &str) -> usize {
            self.commands().iter().filter(|c| c.starts_with(prefix)).count()
        }
    }

    #[async_trait]
    impl Radio for ScriptedRadio {
        async fn tune(&mut self, tuning: &Tuning) -> Result<(), ControllerError> {
            let mut script = self.0.lock().unwrap();
            script.commands.push(format!("tune {}", tuning.frequency_hz));
            Ok(())
        }

        async fn start(&mut self, target: &Path) -> Result<(), ControllerError> {
            let mut script = self.0.lock().unwrap();
            if script.start_failures > 0 {
                script.start_failures -= 1;
                script.unconfirmed = true;
                script.commands.push("start-timeout".into());
                return Err(ControllerError::Timeout {
                    command: format!("RECORD {}", target.display()),
                    timeout: StdDuration::from_secs(5),
                });
            }
            if script.recording.is_none() {
                script.commands.push(format!("start {}", target.display()));
                script.recording = Some(target.to_path_buf());
                script.unconfirmed = false;
            }
            Ok(())
        }

        async fn stop(&mut self) -> Result<(), ControllerError> {
            let mut script = self.0.lock().unwrap();
            let was_recording = script.recording.take().is_some();
            if was_recording || script.unconfirmed {
                script.commands.push("stop".into());
                script.unconfirmed = false;
            }
            Ok(())
        }

        async fn status(&mut self) -> Result<ControllerSession, ControllerError> {
            self.0.lock().unwrap().commands.push("status".into());
            Ok(self.session())
        }

        fn disconnect(&mut self) {
            self.0.lock().unwrap().commands.push("disconnect".into());
        }

        fn session(&self) -> ControllerSession {
            ControllerSession {
                recording: self.0.lock().unwrap().recording.clone(),
                ..ControllerSession::default()
            }
        }
    }

    #[derive(Clone, Default)]
    struct MemorySink(Arc<Mutex<Vec<RecordingSession>>>);

    impl MemorySink {
        fn records(&self) -> Vec<RecordingSession> {
            self.0.lock().unwrap().clone()
        }

        fn states_of(&self, satellite: &str) -> Vec<SessionState> {
            self.records()
                .into_iter()
                .filter(|r| r.satellite == satellite)
                .map(|r| r.state)
                .collect()
        }

        fn last(&self, satellite: &str) -> RecordingSession {
            self.records()
                .into_iter()
                .filter(|r| r.satellite == satellite)
                .last()
                .unwrap()
        }
    }

    impl OutcomeSink for MemorySink {
        fn append(&mut self, record: &RecordingSession) -> io::Result<()> {
            self.0.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 3, 12, 0, 0).unwrap()
    }

    fn at(minutes: i64) -> DateTime<Utc> {
        t0() + Duration::minutes(minutes)
    }

    fn predicted(sat: &str, start_min: i64, end_min: i64) -> PassEvent {
        PassEvent {
            satellite: sat.into(),
            start: at(start_min),
            end: at(end_min),
            max_elevation_deg: 42.0,
            source: Source::Remote,
        }
    }

    fn tunings() -> HashMap<String, Tuning> {
        [("NOAA-15", 137_620_000), ("NOAA-18", 137_912_500), ("NOAA-19", 137_100_000)]
            .into_iter()
            .map(|(name, hz)| {
                (
                    name.to_string(),
                    Tuning {
                        frequency_hz: hz,
                        mode: "WFM".into(),
                        filter_width_hz: None,
                        squelch_db: None,
                        gain: None,
                    },
                )
            })
            .collect()
    }

    struct Harness {
        manager: RecordingManager<ScriptedRadio, MemorySink>,
        schedule: SharedSchedule,
        radio: ScriptedRadio,
        sink: MemorySink,
        _dir: TempDir,
    }

    fn harness(radio: ScriptedRadio) -> Harness {
        let dir = TempDir::new().unwrap();
        let schedule = PassSchedule::shared();
        let sink = MemorySink::default();
        let settings = ManagerSettings {
            tick: StdDuration::from_secs(1),
            preroll: Duration::seconds(30),
            retention: Duration::hours(3),
            max_attempts: 3,
            retry_backoff: Duration::seconds(2),
            max_retry_backoff: Duration::seconds(30),
            stop_timeout: StdDuration::from_secs(1),
            recordings_dir: dir.path().to_path_buf(),
        };
        let manager = RecordingManager::new(
            schedule.clone(),
            radio.clone(),
            sink.clone(),
            tunings(),
            settings,
        );
        Harness {
            manager,
            schedule,
            radio,
            sink,
            _dir: dir,
        }
    }

    impl Harness {
        async fn run_until(&mut self, from: DateTime<Utc>, until: DateTime<Utc>) {
            let mut now = from;
            while now <= until {
                self.manager.tick(now).await;
                now += Duration::seconds(5);
            }
        }
    }

    #[tokio::test]
    async fn test_manual_override_single_recording() {
        let mut h = harness(ScriptedRadio::default());
        {
            let mut schedule = schedule::lock(&h.schedule);
            schedule.replace(vec![predicted("NOAA-19", 5, 20)]).unwrap();
            schedule
                .upsert_manual(&ManualRequest::new("NOAA-19", at(10), Duration::minutes(15)))
                .unwrap();
        }

        h.run_until(t0(), at(30)).await;

        assert_eq!(h.radio.count("start"), 1);
        assert_eq!(h.radio.count("stop"), 1);

        let records = h.sink.records();
        let manual_key = format!("NOAA-19@{}", at(10).format("%Y-%m-%dT%H:%M:%SZ"));
        assert!(records.iter().all(|r| r.key == manual_key));
        assert_eq!(
            h.sink.states_of("NOAA-19"),
            vec![
                SessionState::Pending,
                SessionState::Armed,
                SessionState::Recording,
                SessionState::Completed
            ]
        );

        let last = h.sink.last("NOAA-19");
        assert_eq!(last.source, Source::Manual);
        assert!(last.actual_start.unwrap() >= at(10));
        assert!(last.actual_stop.unwrap() >= at(25));
        assert!(last
            .artifact
            .unwrap()
            .ends_with("NOAA-19/NOAA-19_20260503_121000.wav"));
    }

    #[tokio::test]
    async fn test_start_timeouts_fail_then_later_pass_runs() {
        let mut h = harness(ScriptedRadio::failing_starts(3));
        schedule::lock(&h.schedule)
            .replace(vec![predicted("NOAA-15", 1, 10), predicted("NOAA-18", 20, 30)])
            .unwrap();

        h.run_until(t0(), at(35)).await;

        let failed = h.sink.last("NOAA-15");
        assert_eq!(failed.state, SessionState::Failed);
        assert_eq!(failed.attempts, 3);
        assert!(failed.reason.unwrap().contains("start failed"));
        assert_eq!(h.radio.count("start-timeout"), 3);

        // The receiver is released once the start is given up.
        let commands = h.radio.commands();
        let last_timeout = commands.iter().rposition(|c| c == "start-timeout").unwrap();
        let first_stop = commands.iter().position(|c| c == "stop").unwrap();
        let later_start = commands.iter().position(|c| c.starts_with("start /")).unwrap();
        assert_eq!(first_stop, last_timeout + 1);
        assert!(first_stop < later_start);
        assert_eq!(h.radio.count("stop"), 2);

        let later = h.sink.last("NOAA-18");
        assert_eq!(later.state, SessionState::Completed);
        assert_eq!(later.attempts, 1);
    }

    #[tokio::test]
    async fn test_start_retry_backs_off() {
        let mut h = harness(ScriptedRadio::failing_starts(1));
        schedule::lock(&h.schedule)
            .replace(vec![predicted("NOAA-15", 1, 10)])
            .unwrap();

        h.run_until(t0(), at(2)).await;

        let session = h.sink.last("NOAA-15");
        assert_eq!(session.state, SessionState::Recording);
        assert_eq!(session.attempts, 2);
        // First attempt at T+1m failed; the 2 s backoff puts the retry on the next tick.
        assert_eq!(
            session.actual_start.unwrap(),
            at(1) + Duration::seconds(5)
        );
    }

    #[tokio::test]
    async fn test_higher_precedence_preempts_recording() {
        let mut h = harness(ScriptedRadio::default());
        {
            let mut schedule = schedule::lock(&h.schedule);
            schedule.replace(vec![predicted("NOAA-18", 5, 20)]).unwrap();
            schedule
                .upsert_manual(&ManualRequest::new("NOAA-19", at(10), Duration::minutes(15)))
                .unwrap();
        }

        h.run_until(t0(), at(30)).await;

        let loser = h.sink.last("NOAA-18");
        assert_eq!(loser.state, SessionState::Aborted);
        assert!(loser.reason.unwrap().starts_with("superseded by NOAA-19@"));
        assert!(loser.actual_start.is_some());

        let winner = h.sink.last("NOAA-19");
        assert_eq!(winner.state, SessionState::Completed);
        assert_eq!(h.radio.count("start"), 2);
        assert_eq!(h.radio.count("stop"), 2);
    }

    #[tokio::test]
    async fn test_overlapping_predictions_keep_earlier() {
        let mut h = harness(ScriptedRadio::default());
        schedule::lock(&h.schedule)
            .replace(vec![predicted("NOAA-15", 5, 20), predicted("NOAA-18", 10, 25)])
            .unwrap();

        h.run_until(t0(), at(30)).await;

        assert_eq!(h.sink.last("NOAA-15").state, SessionState::Completed);
        let loser = h.sink.last("NOAA-18");
        assert_eq!(loser.state, SessionState::Aborted);
        assert_eq!(
            h.sink.states_of("NOAA-18"),
            vec![SessionState::Pending, SessionState::Aborted]
        );
    }

    #[tokio::test]
    async fn test_removed_manual_entry_aborts() {
        let mut h = harness(ScriptedRadio::default());
        let request = ManualRequest::new("NOAA-19", at(1), Duration::minutes(10));
        h.manager
            .apply(ScheduleUpdate::UpsertManual(request.clone()), t0())
            .unwrap();

        h.run_until(t0(), at(2)).await;
        assert_eq!(h.sink.last("NOAA-19").state, SessionState::Recording);

        h.manager
            .apply(ScheduleUpdate::RemoveManual(request.key()), at(2))
            .unwrap();
        h.manager.tick(at(2) + Duration::seconds(1)).await;

        let last = h.sink.last("NOAA-19");
        assert_eq!(last.state, SessionState::Aborted);
        assert_eq!(last.reason.as_deref(), Some("removed"));
        assert_eq!(h.radio.count("stop"), 1);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_in_flight() {
        let mut h = harness(ScriptedRadio::default());
        schedule::lock(&h.schedule)
            .replace(vec![predicted("NOAA-15", 1, 10), predicted("NOAA-18", 12, 20)])
            .unwrap();

        h.run_until(t0(), at(2)).await;
        h.manager.shutdown(at(2)).await;

        let last = h.sink.last("NOAA-15");
        assert_eq!(last.state, SessionState::Aborted);
        assert_eq!(last.reason.as_deref(), Some("shutdown"));
        assert!(last.actual_stop.is_some());
        assert_eq!(h.radio.count("stop"), 1);
        assert_eq!(h.radio.count("disconnect"), 1);
        // Not yet due, so never tracked.
        assert!(h.sink.states_of("NOAA-18").is_empty());
    }

    #[tokio::test]
    async fn test_terminal_sessions_stay_terminal() {
        let mut h = harness(ScriptedRadio::default());
        schedule::lock(&h.schedule)
            .replace(vec![predicted("NOAA-15", 1, 10)])
            .unwrap();

        h.run_until(t0(), at(15)).await;
        let count = h.sink.records().len();

        h.run_until(at(15), at(60)).await;
        h.manager.shutdown(at(60)).await;

        assert_eq!(h.sink.records().len(), count);
        assert_eq!(h.sink.last("NOAA-15").state, SessionState::Completed);
    }

    #[tokio::test]
    async fn test_unknown_satellite_fails() {
        let mut h = harness(ScriptedRadio::default());
        schedule::lock(&h.schedule)
            .replace(vec![predicted("METEOR-M2-3", 1, 10)])
            .unwrap();

        h.run_until(t0(), at(12)).await;

        let last = h.sink.last("METEOR-M2-3");
        assert_eq!(last.state, SessionState::Failed);
        assert!(last.reason.unwrap().contains("no tuning"));
        assert_eq!(h.radio.count("start"), 0);
    }

    #[tokio::test]
    async fn test_status_published() {
        let h = harness(ScriptedRadio::default());
        let (tx, rx) = watch::channel(ManagerStatus::default());
        let mut manager = h.manager.with_status(tx);
        schedule::lock(&h.schedule)
            .replace(vec![predicted("NOAA-15", 1, 10)])
            .unwrap();

        // Arms on the first tick, starts on the second.
        manager.tick(at(2)).await;
        assert_eq!(rx.borrow().sessions[0].state, SessionState::Armed);
        manager.tick(at(2) + Duration::seconds(1)).await;

        let status = rx.borrow().clone();
        assert_eq!(status.updated_at, Some(at(2) + Duration::seconds(1)));
        assert_eq!(status.sessions.len(), 1);
        assert_eq!(status.sessions[0].state, SessionState::Recording);
        assert!(status.radio.recording.is_some());
    }

    #[tokio::test]
    async fn test_refreshed_window_keeps_recording() {
        let mut h = harness(ScriptedRadio::default());
        schedule::lock(&h.schedule)
            .replace(vec![predicted("NOAA-15", 1, 10)])
            .unwrap();

        h.run_until(t0(), at(3)).await;
        assert_eq!(h.sink.last("NOAA-15").state, SessionState::Recording);

        // A refresh mid-pass reports the same pass from the refresh instant.
        let batch = PredictionBatch {
            events: vec![predicted("NOAA-15", 3, 10)],
            origin: Source::Remote,
            epoch: 0,
        };
        h.manager
            .apply(ScheduleUpdate::Predictions(batch), at(3))
            .unwrap();
        h.run_until(at(3) + Duration::seconds(5), at(12)).await;

        assert_eq!(h.radio.count("start"), 1);
        assert_eq!(h.radio.count("stop"), 1);
        assert_eq!(
            h.sink.states_of("NOAA-15"),
            vec![
                SessionState::Pending,
                SessionState::Armed,
                SessionState::Recording,
                SessionState::Completed
            ]
        );
        let last = h.sink.last("NOAA-15");
        assert_eq!(last.scheduled_end, at(10));
        assert!(last.artifact.unwrap().ends_with("NOAA-15/NOAA-15_20260503_120100.wav"));
    }

    #[tokio::test]
    async fn test_refresh_without_the_pass_aborts_it() {
        let mut h = harness(ScriptedRadio::default());
        schedule::lock(&h.schedule)
            .replace(vec![predicted("NOAA-15", 1, 10)])
            .unwrap();
        h.run_until(t0(), at(3)).await;

        let batch = PredictionBatch {
            events: vec![predicted("NOAA-18", 30, 40)],
            origin: Source::Remote,
            epoch: 0,
        };
        h.manager
            .apply(ScheduleUpdate::Predictions(batch), at(3))
            .unwrap();
        h.manager.tick(at(3) + Duration::seconds(1)).await;

        let last = h.sink.last("NOAA-15");
        assert_eq!(last.state, SessionState::Aborted);
        assert_eq!(last.reason.as_deref(), Some("removed"));
        assert_eq!(h.radio.count("stop"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_applies_updates_and_stops_on_shutdown() {
        let h = harness(ScriptedRadio::default());
        let (status_tx, mut status_rx) = watch::channel(ManagerStatus::default());
        let manager = h.manager.with_status(status_tx);
        let (updates_tx, updates_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(manager.run(updates_rx, shutdown_rx));

        // The control loop reads wall-clock time; start the pass just now.
        let request = ManualRequest::new("NOAA-19", Utc::now(), Duration::minutes(10));
        updates_tx
            .send(ScheduleUpdate::UpsertManual(request))
            .await
            .unwrap();

        tokio::time::timeout(StdDuration::from_secs(60), async {
            loop {
                status_rx.changed().await.unwrap();
                let recording = status_rx
                    .borrow()
                    .sessions
                    .iter()
                    .any(|s| s.state == SessionState::Recording);
                if recording {
                    break;
                }
            }
        })
        .await
        .unwrap();

        shutdown_tx.send_replace(true);
        task.await.unwrap();

        let last = h.sink.last("NOAA-19");
        assert_eq!(last.state, SessionState::Aborted);
        assert_eq!(last.reason.as_deref(), Some("shutdown"));
        assert_eq!(h.radio.count("start"), 1);
        assert_eq!(h.radio.count("stop"), 1);
        assert!(h.radio.count("status") >= 1);
        assert_eq!(h.radio.count("disconnect"), 1);
    }
}
