//! Domain model (ids, steps, jobs, events, outcomes, plans, errors).

pub mod errors;
pub mod event;
pub mod ids;
pub mod job;
pub mod outcome;
pub mod plan;
pub mod state;
pub mod step;

pub use self::errors::{ErrorKind, StepError, StoreError};
pub use self::event::{EventType, JobEvent, NewEvent};
pub use self::ids::{EventId, JobId, WorkerId};
pub use self::job::{Artifacts, DEFAULT_MAX_ATTEMPTS, Job, JobFilter, NewJob, truncate_error};
pub use self::outcome::StepOutcome;
pub use self::plan::{Plan, PlanError, PlannedJob, ResolvedPlan};
pub use self::state::JobStatus;
pub use self::step::Step;
