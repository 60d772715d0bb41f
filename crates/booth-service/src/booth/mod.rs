//! The single performer slot: who is playing, what, and for how long.

pub mod history;
pub mod scheduler;

pub use history::{HistoryRecord, Tallies};
pub use scheduler::{AdvanceOptions, BoothScheduler, BoothSnapshot};
