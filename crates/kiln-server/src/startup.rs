//! Server startup utilities.

use crate::tasks::{self, Mailer};
use kiln_config::AppConfig;
use kiln_core::KilnResult;
use kiln_jobs::{JobClient, JobRegistry};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Prints the startup banner.
pub fn print_banner() {
    info!(r#"
    __   _ __
   / /__(_) /___
  / //_/ / / __ \
 / ,< / / / / / /
/_/|_/_/_/_/ /_/
    "#);
}

/// Prints queue and store information.
pub fn print_startup_info(config: &AppConfig) {
    let separator = "=".repeat(60);
    info!("{}", separator);
    info!("Environment: {}", config.app.environment);
    info!("Store:       {}", redact_url(&config.database.url));
    for (queue, queue_config) in &config.jobs.queues {
        info!("Queue:       {} (concurrency {})", queue, queue_config.concurrency);
    }
    info!("Drain:       {:?}", config.jobs.worker.shutdown_timeout());
    info!("{}", separator);
}

/// Hides the password of a database URL.
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            let credentials = &url[scheme_end + 3..at];
            match credentials.split_once(':') {
                Some((user, _)) => format!("{}{}:***{}", &url[..scheme_end + 3], user, &url[at..]),
                None => url.to_string(),
            }
        }
        _ => url.to_string(),
    }
}

/// Connects the store and builds a client with every application job registered.
pub async fn build_client(config: &AppConfig, mailer: Arc<dyn Mailer>) -> KilnResult<JobClient> {
    let store = kiln_jobs::store::connect(&config.database.url, config.database.max_connections).await?;

    let mut registry = JobRegistry::new();
    tasks::register_tasks(&mut registry, mailer)?;

    Ok(JobClient::new(store, registry, config.jobs.clone())?)
}

/// Starts the client, waits for `shutdown`, then drains for up to `drain_timeout`.
pub async fn run_until<F>(client: &JobClient, shutdown: F, drain_timeout: Duration) -> KilnResult<()>
where
    F: Future<Output = ()>,
{
    client.start().await?;
    info!("Job workers running");

    shutdown.await;

    client.stop(drain_timeout).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_print_banner_does_not_panic() {
        let _ = tracing_subscriber::fmt::try_init();
        print_banner();
    }

    #[test]
    fn test_print_startup_info_does_not_panic() {
        let _ = tracing_subscriber::fmt::try_init();
        print_startup_info(&AppConfig::default());
    }

    #[test]
    fn test_redact_url() {
        assert_eq!(
            redact_url("postgres://kiln:secret@db:5432/kiln"),
            "postgres://kiln:***@db:5432/kiln"
        );
        assert_eq!(redact_url("postgres://kiln@db/kiln"), "postgres://kiln@db/kiln");
        assert_eq!(redact_url("sqlite://kiln.db"), "sqlite://kiln.db");
    }

    #[tokio::test]
    async fn test_build_client_rejects_unknown_scheme() {
        let mut config = AppConfig::default();
        config.database.url = "mysql://kiln@localhost/kiln".to_string();
        let err = build_client(&config, Arc::new(tasks::LogMailer)).await.unwrap_err();
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
    }
}
