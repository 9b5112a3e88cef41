pub mod error;
pub mod manual;
pub mod recordings;
pub mod schedule;
pub mod status;
