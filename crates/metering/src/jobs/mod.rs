//! Deferred jobs: store, dispatcher, eager trigger and sweep.

mod dispatcher;
mod store;
mod sweeper;
mod trigger;

pub use dispatcher::{CompletionJobHandler, Dispatcher, JobFailure, JobHandler};
pub use store::{JobPatch, JobStore};
pub use sweeper::{spawn_sweeper, JobSweeper};
pub use trigger::{EagerTrigger, INTERNAL_SECRET_HEADER};

pub(crate) use store::JOB_AGE_PREFIX;
