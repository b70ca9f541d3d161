pub mod ads;
pub mod orders;
pub mod writer;

pub use writer::{PersistOutcome, Warehouse};
