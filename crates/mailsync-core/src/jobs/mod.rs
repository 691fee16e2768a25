//! Durable mutation jobs.
//!
//! User-requested mutations (flag changes, moves, deletes, uploads) are
//! persisted as [`MutationJob`]s and applied against the server by the
//! [`JobDriver`], which owns retry, deferral and failure policy.

mod driver;
mod model;
mod store;

pub use driver::{JobDriver, JobTicket};
pub use model::{
    JobErrorClass, JobId, JobStatus, MutationJob, OperationType, classify_job_error,
};
pub use store::{FailedMutation, MutationStore, SqliteMutationStore};
