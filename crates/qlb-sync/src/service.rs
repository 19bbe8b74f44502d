use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use qlb_core::{period_start, Clock, SyncType};
use qlb_remote::{RemoteApiGateway, SonarGateway, UnavailableGateway};
use qlb_storage::EntityStore;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::aggregator::MetricsAggregator;
use crate::champions::ChampionSelector;
use crate::config::{Config, SyncSettings};
use crate::orchestrator::SyncOrchestrator;
use crate::pagination::Shutdown;
use crate::ranking::RankingEngine;
use crate::{ImportResult, PipelineError, RankingResult, SyncResult, SyncStats};

/// How a run obtains its remote gateway.
pub enum GatewaySource {
    /// A ready gateway, e.g. fixtures.
    Fixed(Arc<dyn RemoteApiGateway>),
    /// Built at the start of every run from static config plus any stored
    /// remote override.
    FromConfig(Config),
}

/// Entry point for the exposed triggers. Runs are serialised: a trigger that
/// finds another run in progress is refused with [`PipelineError::Busy`].
pub struct Leaderboard {
    store: Arc<dyn EntityStore>,
    gateway: GatewaySource,
    clock: Arc<dyn Clock>,
    settings: SyncSettings,
    shutdown: Shutdown,
    run_lock: Mutex<()>,
}

impl Leaderboard {
    pub fn new(
        store: Arc<dyn EntityStore>,
        gateway: GatewaySource,
        clock: Arc<dyn Clock>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            store,
            gateway,
            clock,
            settings,
            shutdown: Shutdown::never(),
            run_lock: Mutex::new(()),
        }
    }

    pub fn from_config(store: Arc<dyn EntityStore>, config: Config, clock: Arc<dyn Clock>) -> Self {
        let settings = config.sync_settings();
        Self::new(store, GatewaySource::FromConfig(config), clock, settings)
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    async fn resolve_gateway(&self) -> Arc<dyn RemoteApiGateway> {
        let config = match &self.gateway {
            GatewaySource::Fixed(gateway) => return gateway.clone(),
            GatewaySource::FromConfig(config) => config,
        };
        let stored = match self.store.latest_remote_config().await {
            Ok(stored) => stored,
            Err(err) => {
                warn!(error = %err, "stored remote config unreadable, using static config");
                None
            }
        };
        let config = config.clone().with_stored_remote(stored);
        match SonarGateway::new(config.gateway_config()) {
            Ok(gateway) => Arc::new(gateway),
            Err(err) => {
                warn!(error = %err, "remote gateway unavailable");
                Arc::new(UnavailableGateway::new(err.to_string()))
            }
        }
    }

    async fn orchestrator(&self) -> SyncOrchestrator {
        SyncOrchestrator::new(
            self.store.clone(),
            self.resolve_gateway().await,
            self.clock.clone(),
            self.settings,
        )
        .with_shutdown(self.shutdown.clone())
    }

    pub async fn trigger_sync(&self, full_sync: bool) -> Result<SyncResult, PipelineError> {
        let _guard = self.run_lock.try_lock().map_err(|_| PipelineError::Busy)?;
        info!(full_sync, "sync triggered");
        self.orchestrator().await.sync_all(full_sync).await
    }

    /// Syncs a single, already known project with a `MANUAL` sync log.
    pub async fn trigger_project_sync(
        &self,
        project_key: &str,
        full_sync: bool,
    ) -> Result<SyncResult, PipelineError> {
        let _guard = self.run_lock.try_lock().map_err(|_| PipelineError::Busy)?;
        let project = self
            .store
            .find_project_by_key(project_key)
            .await?
            .ok_or_else(|| PipelineError::ProjectNotFound(project_key.to_string()))?;
        info!(project_key, full_sync, "project sync triggered");

        let started = Instant::now();
        let project_stats = self
            .orchestrator()
            .await
            .sync_project(&project, full_sync, SyncType::Manual)
            .await?;
        let mut stats = SyncStats::default();
        stats.absorb(&project_stats);
        let success = stats.projects_failed == 0;
        Ok(SyncResult {
            success,
            message: format!(
                "project {project_key} sync finished with status {}",
                project_stats.status.as_str()
            ),
            sync_log_id: Some(project_stats.sync_log_id),
            stats,
            errors: project_stats.errors,
            duration_ms: elapsed_ms(started),
        })
    }

    /// Ranks `period` (normalised to its first day) and selects its champions.
    pub async fn trigger_ranking_calculation(
        &self,
        period: NaiveDate,
    ) -> Result<RankingResult, PipelineError> {
        let _guard = self.run_lock.try_lock().map_err(|_| PipelineError::Busy)?;
        let period = period_start(period);
        info!(%period, "ranking calculation triggered");
        let started = Instant::now();

        let aggregator = MetricsAggregator::new(self.store.clone(), Some(self.resolve_gateway().await));
        let outcome = RankingEngine::new(self.store.clone(), aggregator)
            .calculate(period)
            .await?;
        let champions = ChampionSelector::new(self.store.clone(), self.clock.clone())
            .select_for_period(period)
            .await?;

        let message = if outcome.individuals.is_empty() && outcome.projects.is_empty() {
            "no active developers or projects to rank".to_string()
        } else {
            format!(
                "ranked {} developers and {} projects",
                outcome.individuals.len(),
                outcome.projects.len()
            )
        };
        Ok(RankingResult {
            success: true,
            message,
            period,
            individuals_ranked: outcome.individuals.len(),
            projects_ranked: outcome.projects.len(),
            champions_selected: champions.len(),
            duration_ms: elapsed_ms(started),
        })
    }

    pub async fn import_issues(&self, payload: &str) -> Result<ImportResult, PipelineError> {
        let _guard = self.run_lock.try_lock().map_err(|_| PipelineError::Busy)?;
        self.orchestrator().await.import_issues(payload).await
    }
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use qlb_core::{FixedClock, StoredRemoteConfig};
    use qlb_storage::InMemoryStore;

    fn service(config: Config) -> (Arc<InMemoryStore>, Leaderboard) {
        let store = Arc::new(InMemoryStore::new());
        let clock = FixedClock(Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap());
        let service = Leaderboard::from_config(store.clone(), config, Arc::new(clock));
        (store, service)
    }

    #[tokio::test]
    async fn missing_credentials_fail_the_run_with_a_logged_reason() {
        let (store, service) = service(Config::default());
        let result = service.trigger_sync(false).await.unwrap();
        assert!(!result.success);
        assert!(result.message.contains("not configured"), "{}", result.message);

        let log = store.last_run_sync_log().await.unwrap().unwrap();
        assert_eq!(log.status, qlb_core::SyncStatus::Failed);
        assert!(log.error_message.unwrap_or_default().contains("not configured"));
    }

    #[tokio::test]
    async fn stored_remote_config_is_used_for_the_run() {
        let (store, service) = service(Config::default());
        store
            .save_remote_config(StoredRemoteConfig {
                base_url: "not a url".into(),
                api_token: Some("stored".into()),
                updated_at: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            })
            .await
            .unwrap();
        // The stored token satisfies credentials; the stored URL is then
        // the reason the gateway cannot be built.
        let result = service.trigger_sync(true).await.unwrap();
        assert!(!result.success);
        assert!(result.message.contains("invalid remote base url"), "{}", result.message);
    }

    #[tokio::test]
    async fn unknown_project_is_reported() {
        let (_, service) = service(Config::default());
        let err = service.trigger_project_sync("ghost", false).await.unwrap_err();
        assert!(matches!(err, PipelineError::ProjectNotFound(key) if key == "ghost"));
    }
}
