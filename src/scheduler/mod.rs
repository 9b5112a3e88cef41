pub mod artifacts;
pub mod event;
pub mod parser;
pub mod runner;
pub mod schedule;
pub mod session;
pub mod storage;

pub use artifacts::OutcomeLog;
pub use event::{ManualRequest, PassEvent, Source};
pub use runner::{ManagerSettings, ManagerStatus, RecordingManager, ScheduleUpdate};
pub use schedule::{PassSchedule, ScheduleEntry, SharedSchedule};
pub use session::RecordingSession;
pub use storage::{ManualStore, StoredRequest};
