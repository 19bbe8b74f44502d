//! Ingestion and ranking pipeline: remote sync, metrics aggregation, monthly
//! rankings, champion selection and the scheduled triggers around them.

use chrono::NaiveDate;
use qlb_core::SyncStatus;
use qlb_remote::GatewayError;
use qlb_storage::StoreError;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

mod aggregator;
mod champions;
mod config;
mod orchestrator;
mod pagination;
mod ranking;
mod scheduler;
mod service;

pub use aggregator::{aggregate_day, MetricsAggregator, MetricsSource, PeriodMetrics};
pub use champions::ChampionSelector;
pub use config::{Config, SyncSettings};
pub use orchestrator::{issue_draft, project_metrics_snapshot, SyncOrchestrator};
pub use pagination::{fetch_all_pages, PageLimits, PagedFetch, Shutdown};
pub use ranking::{
    category_scores, climber_score, rank_entries, RankInput, RankingEngine, RankingOutcome,
};
pub use scheduler::maybe_build_scheduler;
pub use service::{GatewaySource, Leaderboard};

pub const CRATE_NAME: &str = "qlb-sync";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("another sync or ranking run is in progress")]
    Busy,
    #[error("project {0} not found")]
    ProjectNotFound(String),
    #[error("invalid import payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    Remote(#[from] GatewayError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub projects_processed: u32,
    pub projects_failed: u32,
    pub projects_created: u32,
    pub issues_processed: u32,
    pub issues_created: u32,
    pub issues_updated: u32,
    pub developers_created: u32,
    pub metrics_rows: u32,
}

impl SyncStats {
    pub fn absorb(&mut self, project: &ProjectSyncStats) {
        self.projects_processed += 1;
        if project.status == SyncStatus::Failed {
            self.projects_failed += 1;
        }
        self.issues_processed += project.issues_processed;
        self.issues_created += project.issues_created;
        self.issues_updated += project.issues_updated;
        self.developers_created += project.developers_created;
        self.metrics_rows += project.metrics_rows;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSyncStats {
    pub project_key: String,
    pub sync_log_id: Uuid,
    pub status: SyncStatus,
    pub pages_fetched: u32,
    pub issues_processed: u32,
    pub issues_created: u32,
    pub issues_updated: u32,
    pub developers_created: u32,
    pub metrics_rows: u32,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub success: bool,
    pub message: String,
    pub sync_log_id: Option<Uuid>,
    pub stats: SyncStats,
    pub errors: Vec<String>,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingResult {
    pub success: bool,
    pub message: String,
    pub period: NaiveDate,
    pub individuals_ranked: usize,
    pub projects_ranked: usize,
    pub champions_selected: usize,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub success: bool,
    pub message: String,
    pub imported: u32,
    pub created: u32,
    pub updated: u32,
    pub errors: Vec<String>,
}
