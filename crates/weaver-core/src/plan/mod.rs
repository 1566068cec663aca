//! Plans and task execution
//!
//! - `Plan` / `Task` - a goal decomposed into dependent tasks
//! - `TaskExecutor` - dependency-aware scheduling with retries, timeouts,
//!   abort and manual recovery
//! - `TaskRunner` - the seam a task's actual work plugs into
//! - `PlanManager` - SQLite persistence

pub mod events;
pub mod executor;
pub mod manager;
pub mod runner;
pub mod types;

pub use events::{PlanEvent, TaskOutline};
pub use executor::{PlanContext, TaskExecutor};
pub use manager::{PlanManager, PlanWriter};
pub use runner::{TaskAssignment, TaskOutput, TaskRunner, UpstreamResult};
pub use types::{Plan, PlanStatus, Task, TaskStatus};
