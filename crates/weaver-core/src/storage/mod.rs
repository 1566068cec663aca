//! Persistence layer
//!
//! SQLite-based storage for:
//! - The append-only session event log
//! - Plan and task records
//! - Run records

mod database;
pub mod events;
mod plans;
mod runs;

pub use database::Database;
pub use events::EventStore;
pub use plans::PlanStore;
pub use runs::{RunRecord, RunStore};
