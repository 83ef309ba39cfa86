//! Stale job rescue.
//!
//! A record left in `running` by a process that died, or abandoned by a
//! `stop` that timed out, is taken back once its attempt is older than the
//! configured liveness threshold.

use crate::config::RescueConfig;
use crate::error::JobResult;
use crate::job::{JobRecord, JobState};
use crate::metrics::JobMetrics;
use crate::store::JobStore;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Runs one sweep and returns the records it changed.
pub async fn rescue_stale(store: &dyn JobStore, stale_after: Duration) -> JobResult<Vec<JobRecord>> {
    let stale_after = ChronoDuration::from_std(stale_after).unwrap_or(ChronoDuration::MAX);
    let stale_before = Utc::now()
        .checked_sub_signed(stale_after)
        .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

    let records = store.rescue_stale(stale_before).await?;
    for record in &records {
        if record.state == JobState::Discarded {
            warn!(
                job_id = %record.id,
                kind = %record.kind,
                queue = %record.queue,
                attempt = record.attempt,
                "Stale job has no attempts left, discarded"
            );
        } else {
            info!(
                job_id = %record.id,
                kind = %record.kind,
                queue = %record.queue,
                attempt = record.attempt,
                "Rescued stale job"
            );
        }
    }
    if !records.is_empty() {
        JobMetrics::jobs_rescued(records.len());
    }
    Ok(records)
}

/// Sweeps on every interval tick until `shutdown` fires. The first sweep
/// runs immediately.
pub(crate) async fn run(store: Arc<dyn JobStore>, config: RescueConfig, shutdown: CancellationToken) {
    let mut ticker = interval(config.interval().max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        interval_secs = config.interval_secs,
        stale_after_secs = config.stale_after_secs,
        "Rescuer started"
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Err(e) = rescue_stale(store.as_ref(), config.stale_after()).await {
            error!(error = %e, "Stale job rescue failed");
            JobMetrics::store_error("rescue");
        }
    }

    info!("Rescuer stopped");
}
