//! Persistence for the leaderboard pipeline.
//!
//! [`EntityStore`] is the repository seam used by sync, aggregation, ranking
//! and champion selection. [`InMemoryStore`] and [`PgStore`] implement it with
//! the same semantics.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use qlb_core::{
    Developer, DeveloperMetricsDaily, IndividualRanking, Issue, IssueDraft, MonthlyChampion,
    NewDeveloper, Project, ProjectMetricsDaily, ProjectRanking, StoredRemoteConfig, SyncLog,
    UpsertOutcome,
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::{Database, PgStore};

pub const CRATE_NAME: &str = "qlb-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("issue {issue_key} references unknown project {project_id}")]
    MissingProject { issue_key: String, project_id: Uuid },
    #[error("sync log {0} not found")]
    SyncLogNotFound(Uuid),
    #[error("sync log {0} is already closed")]
    SyncLogClosed(Uuid),
    #[error("corrupt {table} row: {detail}")]
    Corrupt { table: &'static str, detail: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProjectCounts {
    pub total: i64,
    pub active: i64,
}

/// Transactional repository for every entity the pipeline reads or writes.
///
/// Time-window queries take half-open `[from, to)` instants; date-range
/// queries are inclusive on both ends.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn upsert_project(
        &self,
        project_key: &str,
        name: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<(Project, UpsertOutcome)>;
    async fn find_project_by_key(&self, project_key: &str) -> StoreResult<Option<Project>>;
    async fn list_active_projects(&self) -> StoreResult<Vec<Project>>;
    async fn project_counts(&self) -> StoreResult<ProjectCounts>;

    async fn find_developer_by_key(&self, author_key: &str) -> StoreResult<Option<Developer>>;
    /// Inserts the developer unless one with the same author key exists, in
    /// which case the stored row is returned untouched.
    async fn insert_developer(
        &self,
        developer: NewDeveloper,
        now: DateTime<Utc>,
    ) -> StoreResult<Developer>;
    async fn list_active_developers(&self) -> StoreResult<Vec<Developer>>;

    /// Fetch-and-replace by `issue_key`: every mutable column is overwritten.
    async fn upsert_issue(&self, draft: IssueDraft) -> StoreResult<UpsertOutcome>;
    async fn find_issue_by_key(&self, issue_key: &str) -> StoreResult<Option<Issue>>;
    async fn count_issues(&self) -> StoreResult<i64>;
    async fn count_project_issues(&self, project_id: Uuid) -> StoreResult<i64>;
    /// Issues of one project created or resolved inside `[from, to)`.
    async fn project_issues_touched_between(
        &self,
        project_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<Issue>>;
    /// Issues of any project created or resolved inside `[from, to)`.
    async fn issues_touched_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<Issue>>;

    /// Replaces all developer snapshots for one project and day atomically.
    async fn replace_developer_metrics(
        &self,
        project_id: Uuid,
        date: NaiveDate,
        rows: Vec<DeveloperMetricsDaily>,
    ) -> StoreResult<()>;
    async fn developer_metrics_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StoreResult<Vec<DeveloperMetricsDaily>>;
    async fn upsert_project_metrics(&self, metrics: ProjectMetricsDaily) -> StoreResult<()>;
    async fn latest_project_metrics(
        &self,
        project_id: Uuid,
        on_or_before: NaiveDate,
    ) -> StoreResult<Option<ProjectMetricsDaily>>;

    /// Deletes every individual snapshot for `period` and inserts `rows`.
    async fn replace_individual_rankings(
        &self,
        period: NaiveDate,
        rows: Vec<IndividualRanking>,
    ) -> StoreResult<()>;
    async fn replace_project_rankings(
        &self,
        period: NaiveDate,
        rows: Vec<ProjectRanking>,
    ) -> StoreResult<()>;
    async fn individual_rankings_for_period(
        &self,
        period: NaiveDate,
    ) -> StoreResult<Vec<IndividualRanking>>;
    async fn project_rankings_for_period(&self, period: NaiveDate)
        -> StoreResult<Vec<ProjectRanking>>;

    /// Deletes the period's champions and inserts `rows` in one transaction.
    async fn replace_champions(
        &self,
        period: NaiveDate,
        rows: Vec<MonthlyChampion>,
    ) -> StoreResult<()>;
    async fn champions_for_period(&self, period: NaiveDate) -> StoreResult<Vec<MonthlyChampion>>;

    async fn insert_sync_log(&self, log: &SyncLog) -> StoreResult<()>;
    /// Closes a `STARTED` log. Fails with [`StoreError::SyncLogClosed`] when
    /// the stored log is already terminal.
    async fn update_sync_log(&self, log: &SyncLog) -> StoreResult<()>;
    async fn find_sync_log(&self, id: Uuid) -> StoreResult<Option<SyncLog>>;
    /// Latest `SUCCESS` log for the project (any sync type) by end time.
    async fn last_successful_project_sync(&self, project_id: Uuid)
        -> StoreResult<Option<SyncLog>>;
    async fn recent_sync_logs(&self, limit: i64) -> StoreResult<Vec<SyncLog>>;
    /// Latest run-level log (no project), newest start time first.
    async fn last_run_sync_log(&self) -> StoreResult<Option<SyncLog>>;

    async fn latest_remote_config(&self) -> StoreResult<Option<StoredRemoteConfig>>;
    async fn save_remote_config(&self, config: StoredRemoteConfig) -> StoreResult<()>;
}
