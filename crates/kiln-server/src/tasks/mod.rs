//! Application job types.

pub mod email;

pub use email::{enqueue_verification_email, EmailWorker, LogMailer, Mailer, SendEmail};

use kiln_jobs::{JobRegistry, JobResult};
use std::sync::Arc;

/// Registers every job kind this application runs.
pub fn register_tasks(registry: &mut JobRegistry, mailer: Arc<dyn Mailer>) -> JobResult<()> {
    registry.register_worker::<SendEmail, _>(EmailWorker::new(mailer))?;
    Ok(())
}
