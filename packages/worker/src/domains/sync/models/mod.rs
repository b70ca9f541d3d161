pub mod cursor;
pub mod run;

pub use run::{JobType, RunStatus, SyncRun, Trigger};
