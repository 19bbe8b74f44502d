use std::sync::Arc;

use anyhow::{Context, Result};
use qlb_core::previous_period;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::service::Leaderboard;
use crate::PipelineError;

/// Builds the cron scheduler with the incremental sync job and the monthly
/// ranking job, or `None` when scheduling is disabled.
pub async fn maybe_build_scheduler(
    service: Arc<Leaderboard>,
    config: &Config,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let sync_service = service.clone();
    let sync_job = Job::new_async(config.sync_cron.as_str(), move |_uuid, _l| {
        let service = sync_service.clone();
        Box::pin(async move {
            match service.trigger_sync(false).await {
                Ok(result) => info!(success = result.success, message = %result.message, "scheduled sync finished"),
                Err(PipelineError::Busy) => warn!("scheduled sync skipped, another run is in progress"),
                Err(err) => error!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating sync job for cron {}", config.sync_cron))?;
    sched.add(sync_job).await.context("adding sync job")?;

    let ranking_service = service;
    let ranking_job = Job::new_async(config.ranking_cron.as_str(), move |_uuid, _l| {
        let service = ranking_service.clone();
        Box::pin(async move {
            let period = previous_period(service.clock().today());
            match service.trigger_ranking_calculation(period).await {
                Ok(result) => info!(%period, message = %result.message, "scheduled ranking finished"),
                Err(PipelineError::Busy) => warn!(%period, "scheduled ranking skipped, another run is in progress"),
                Err(err) => error!(%period, error = %err, "scheduled ranking failed"),
            }
        })
    })
    .with_context(|| format!("creating ranking job for cron {}", config.ranking_cron))?;
    sched.add(ranking_job).await.context("adding ranking job")?;

    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use qlb_core::SystemClock;
    use qlb_storage::InMemoryStore;

    fn service() -> Arc<Leaderboard> {
        Arc::new(Leaderboard::from_config(
            Arc::new(InMemoryStore::new()),
            Config::default(),
            Arc::new(SystemClock),
        ))
    }

    #[tokio::test]
    async fn disabled_scheduler_is_not_built() {
        let config = Config::default();
        assert!(maybe_build_scheduler(service(), &config).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalid_cron_is_reported() {
        let config = Config {
            scheduler_enabled: true,
            sync_cron: "bogus cron".into(),
            ..Config::default()
        };
        let Err(err) = maybe_build_scheduler(service(), &config).await else {
            panic!("invalid cron expression was accepted");
        };
        assert!(format!("{err:#}").contains("bogus cron"));
    }
}
