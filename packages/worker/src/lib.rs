// Commerce Analytics - Ingest Worker Core
//
// This crate provides the ingest worker for the multi-tenant commerce
// analytics pipeline: it claims queued sync runs from Postgres, pulls
// paginated data from the commerce and ads sources under their rate-limit
// budgets, lands raw payloads, and atomically rebuilds the daily aggregate
// tables touched by each run.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;
pub mod server;

pub use config::*;
