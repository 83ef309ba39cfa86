//! Email delivery job.

use async_trait::async_trait;
use kiln_jobs::{EnqueueOptions, Job, JobClient, JobContext, JobError, JobId, JobResult, Worker};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Arguments for sending one email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendEmail {
    pub user_id: i64,
    pub email_address: String,
    pub subject: String,
    pub body: String,
}

impl Job for SendEmail {
    const KIND: &'static str = "send_email";
}

/// Outbound mail transport.
///
/// Delivery errors are retried. Return [`JobError::Fatal`] for permanent
/// rejections such as an invalid recipient.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &SendEmail) -> JobResult<()>;
}

/// Mailer that only logs what it would send.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &SendEmail) -> JobResult<()> {
        info!(
            user_id = email.user_id,
            email = %email.email_address,
            subject = %email.subject,
            body_len = email.body.len(),
            "Email delivered to log"
        );
        Ok(())
    }
}

/// Worker for [`SendEmail`].
#[derive(Clone)]
pub struct EmailWorker {
    mailer: Arc<dyn Mailer>,
}

impl EmailWorker {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl Worker<SendEmail> for EmailWorker {
    async fn work(&self, ctx: &JobContext, args: SendEmail) -> JobResult<()> {
        info!(
            job_id = %ctx.job_id,
            attempt = ctx.attempt,
            user_id = args.user_id,
            email = %args.email_address,
            "Starting email task"
        );

        tokio::select! {
            result = self.mailer.send(&args) => result?,
            () = ctx.cancelled() => return Err(JobError::Cancelled),
        }

        info!(
            user_id = args.user_id,
            email = %args.email_address,
            subject = %args.subject,
            "Successfully processed email task"
        );
        Ok(())
    }

    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(30))
    }
}

/// Subject of the account verification email.
pub const VERIFICATION_SUBJECT: &str = "Confirm your email address";

/// Enqueues the verification email sent after registration.
pub async fn enqueue_verification_email(
    client: &JobClient,
    user_id: i64,
    email_address: &str,
    token: &str,
) -> JobResult<JobId> {
    if email_address.trim().is_empty() {
        return Err(JobError::Validation("email address must not be empty".to_string()));
    }

    let email = SendEmail {
        user_id,
        email_address: email_address.to_string(),
        subject: VERIFICATION_SUBJECT.to_string(),
        body: format!("Please verify your email using this token: {}", token),
    };
    client.enqueue(&email, EnqueueOptions::new()).await
}
