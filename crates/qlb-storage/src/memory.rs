use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use qlb_core::{
    Developer, DeveloperMetricsDaily, IndividualRanking, Issue, IssueDraft, MonthlyChampion,
    NewDeveloper, Project, ProjectMetricsDaily, ProjectRanking, StoredRemoteConfig, SyncLog,
    SyncStatus, UpsertOutcome,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{EntityStore, ProjectCounts, StoreError, StoreResult};

/// Process-local store used by tests and offline fixture runs. Every method
/// holds the state lock for its whole duration, so multi-row replaces are
/// atomic with respect to other callers.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    projects: BTreeMap<String, Project>,
    developers: BTreeMap<String, Developer>,
    issues: BTreeMap<String, Issue>,
    developer_metrics: BTreeMap<(Uuid, NaiveDate, Uuid), DeveloperMetricsDaily>,
    project_metrics: BTreeMap<(Uuid, NaiveDate), ProjectMetricsDaily>,
    individual_rankings: BTreeMap<(NaiveDate, Uuid), IndividualRanking>,
    project_rankings: BTreeMap<(NaiveDate, Uuid), ProjectRanking>,
    champions: Vec<MonthlyChampion>,
    sync_logs: Vec<SyncLog>,
    remote_configs: Vec<StoredRemoteConfig>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_project_active(&self, project_key: &str, active: bool) {
        let mut state = self.state.lock().await;
        if let Some(project) = state.projects.get_mut(project_key) {
            project.is_active = active;
        }
    }

    pub async fn set_developer_active(&self, author_key: &str, active: bool) {
        let mut state = self.state.lock().await;
        if let Some(developer) = state.developers.get_mut(author_key) {
            developer.is_active = active;
        }
    }
}

fn touched_between(issue: &Issue, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
    let inside = |ts: Option<DateTime<Utc>>| ts.is_some_and(|t| t >= from && t < to);
    inside(issue.created_date) || inside(issue.resolved_date)
}

#[async_trait]
impl EntityStore for InMemoryStore {
    async fn upsert_project(
        &self,
        project_key: &str,
        name: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<(Project, UpsertOutcome)> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.projects.get_mut(project_key) {
            if existing.name != name {
                existing.name = name.to_string();
                existing.updated_at = now;
            }
            return Ok((existing.clone(), UpsertOutcome::Updated));
        }
        let project = Project {
            id: Uuid::new_v4(),
            project_key: project_key.to_string(),
            name: name.to_string(),
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        state
            .projects
            .insert(project_key.to_string(), project.clone());
        Ok((project, UpsertOutcome::Created))
    }

    async fn find_project_by_key(&self, project_key: &str) -> StoreResult<Option<Project>> {
        Ok(self.state.lock().await.projects.get(project_key).cloned())
    }

    async fn list_active_projects(&self) -> StoreResult<Vec<Project>> {
        let state = self.state.lock().await;
        Ok(state
            .projects
            .values()
            .filter(|p| p.is_active)
            .cloned()
            .collect())
    }

    async fn project_counts(&self) -> StoreResult<ProjectCounts> {
        let state = self.state.lock().await;
        Ok(ProjectCounts {
            total: state.projects.len() as i64,
            active: state.projects.values().filter(|p| p.is_active).count() as i64,
        })
    }

    async fn find_developer_by_key(&self, author_key: &str) -> StoreResult<Option<Developer>> {
        Ok(self.state.lock().await.developers.get(author_key).cloned())
    }

    async fn insert_developer(
        &self,
        developer: NewDeveloper,
        now: DateTime<Utc>,
    ) -> StoreResult<Developer> {
        let mut state = self.state.lock().await;
        let stored = state
            .developers
            .entry(developer.author_key.clone())
            .or_insert_with(|| Developer {
                id: Uuid::new_v4(),
                author_key: developer.author_key,
                display_name: developer.display_name,
                email: developer.email,
                is_active: true,
                created_at: now,
                updated_at: now,
            });
        Ok(stored.clone())
    }

    async fn list_active_developers(&self) -> StoreResult<Vec<Developer>> {
        let state = self.state.lock().await;
        Ok(state
            .developers
            .values()
            .filter(|d| d.is_active)
            .cloned()
            .collect())
    }

    async fn upsert_issue(&self, draft: IssueDraft) -> StoreResult<UpsertOutcome> {
        let mut state = self.state.lock().await;
        if !state.projects.values().any(|p| p.id == draft.project_id) {
            return Err(StoreError::MissingProject {
                issue_key: draft.issue_key,
                project_id: draft.project_id,
            });
        }
        let (id, outcome) = match state.issues.get(&draft.issue_key) {
            Some(existing) => (existing.id, UpsertOutcome::Updated),
            None => (Uuid::new_v4(), UpsertOutcome::Created),
        };
        let key = draft.issue_key.clone();
        state.issues.insert(key, Issue::from_draft(id, draft));
        Ok(outcome)
    }

    async fn find_issue_by_key(&self, issue_key: &str) -> StoreResult<Option<Issue>> {
        Ok(self.state.lock().await.issues.get(issue_key).cloned())
    }

    async fn count_issues(&self) -> StoreResult<i64> {
        Ok(self.state.lock().await.issues.len() as i64)
    }

    async fn count_project_issues(&self, project_id: Uuid) -> StoreResult<i64> {
        let state = self.state.lock().await;
        Ok(state
            .issues
            .values()
            .filter(|i| i.project_id == project_id)
            .count() as i64)
    }

    async fn project_issues_touched_between(
        &self,
        project_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<Issue>> {
        let state = self.state.lock().await;
        Ok(state
            .issues
            .values()
            .filter(|i| i.project_id == project_id && touched_between(i, from, to))
            .cloned()
            .collect())
    }

    async fn issues_touched_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<Issue>> {
        let state = self.state.lock().await;
        Ok(state
            .issues
            .values()
            .filter(|i| touched_between(i, from, to))
            .cloned()
            .collect())
    }

    async fn replace_developer_metrics(
        &self,
        project_id: Uuid,
        date: NaiveDate,
        rows: Vec<DeveloperMetricsDaily>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state
            .developer_metrics
            .retain(|(p, d, _), _| !(*p == project_id && *d == date));
        for row in rows {
            state
                .developer_metrics
                .insert((project_id, date, row.developer_id), row);
        }
        Ok(())
    }

    async fn developer_metrics_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StoreResult<Vec<DeveloperMetricsDaily>> {
        let state = self.state.lock().await;
        Ok(state
            .developer_metrics
            .values()
            .filter(|m| m.date_recorded >= from && m.date_recorded <= to)
            .cloned()
            .collect())
    }

    async fn upsert_project_metrics(&self, metrics: ProjectMetricsDaily) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state
            .project_metrics
            .insert((metrics.project_id, metrics.date_recorded), metrics);
        Ok(())
    }

    async fn latest_project_metrics(
        &self,
        project_id: Uuid,
        on_or_before: NaiveDate,
    ) -> StoreResult<Option<ProjectMetricsDaily>> {
        let state = self.state.lock().await;
        Ok(state
            .project_metrics
            .range((project_id, NaiveDate::MIN)..=(project_id, on_or_before))
            .next_back()
            .map(|(_, m)| m.clone()))
    }

    async fn replace_individual_rankings(
        &self,
        period: NaiveDate,
        rows: Vec<IndividualRanking>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.individual_rankings.retain(|(p, _), _| *p != period);
        for row in rows {
            state
                .individual_rankings
                .insert((period, row.developer_id), row);
        }
        Ok(())
    }

    async fn replace_project_rankings(
        &self,
        period: NaiveDate,
        rows: Vec<ProjectRanking>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.project_rankings.retain(|(p, _), _| *p != period);
        for row in rows {
            state.project_rankings.insert((period, row.project_id), row);
        }
        Ok(())
    }

    async fn individual_rankings_for_period(
        &self,
        period: NaiveDate,
    ) -> StoreResult<Vec<IndividualRanking>> {
        let state = self.state.lock().await;
        Ok(state
            .individual_rankings
            .iter()
            .filter(|((p, _), _)| *p == period)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn project_rankings_for_period(
        &self,
        period: NaiveDate,
    ) -> StoreResult<Vec<ProjectRanking>> {
        let state = self.state.lock().await;
        Ok(state
            .project_rankings
            .iter()
            .filter(|((p, _), _)| *p == period)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn replace_champions(
        &self,
        period: NaiveDate,
        rows: Vec<MonthlyChampion>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.champions.retain(|c| c.period != period);
        state.champions.extend(rows);
        Ok(())
    }

    async fn champions_for_period(&self, period: NaiveDate) -> StoreResult<Vec<MonthlyChampion>> {
        let state = self.state.lock().await;
        let mut champions: Vec<_> = state
            .champions
            .iter()
            .filter(|c| c.period == period)
            .cloned()
            .collect();
        champions.sort_by_key(|c| (c.entity_type, c.category));
        Ok(champions)
    }

    async fn insert_sync_log(&self, log: &SyncLog) -> StoreResult<()> {
        self.state.lock().await.sync_logs.push(log.clone());
        Ok(())
    }

    async fn update_sync_log(&self, log: &SyncLog) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let stored = state
            .sync_logs
            .iter_mut()
            .find(|l| l.id == log.id)
            .ok_or(StoreError::SyncLogNotFound(log.id))?;
        if stored.status.is_terminal() {
            return Err(StoreError::SyncLogClosed(log.id));
        }
        *stored = log.clone();
        Ok(())
    }

    async fn find_sync_log(&self, id: Uuid) -> StoreResult<Option<SyncLog>> {
        let state = self.state.lock().await;
        Ok(state.sync_logs.iter().find(|l| l.id == id).cloned())
    }

    async fn last_successful_project_sync(
        &self,
        project_id: Uuid,
    ) -> StoreResult<Option<SyncLog>> {
        let state = self.state.lock().await;
        Ok(state
            .sync_logs
            .iter()
            .filter(|l| l.project_id == Some(project_id) && l.status == SyncStatus::Success)
            .max_by_key(|l| l.end_time)
            .cloned())
    }

    async fn recent_sync_logs(&self, limit: i64) -> StoreResult<Vec<SyncLog>> {
        let state = self.state.lock().await;
        let mut logs = state.sync_logs.clone();
        logs.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        logs.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(logs)
    }

    async fn last_run_sync_log(&self) -> StoreResult<Option<SyncLog>> {
        let state = self.state.lock().await;
        Ok(state
            .sync_logs
            .iter()
            .filter(|l| l.project_id.is_none())
            .max_by_key(|l| l.start_time)
            .cloned())
    }

    async fn latest_remote_config(&self) -> StoreResult<Option<StoredRemoteConfig>> {
        let state = self.state.lock().await;
        Ok(state
            .remote_configs
            .iter()
            .max_by_key(|c| c.updated_at)
            .cloned())
    }

    async fn save_remote_config(&self, config: StoredRemoteConfig) -> StoreResult<()> {
        self.state.lock().await.remote_configs.push(config);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use qlb_core::{IssueStatus, IssueType, Severity, SyncType};

    fn ts(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap()
    }

    fn draft(key: &str, project_id: Uuid, message: &str) -> IssueDraft {
        IssueDraft {
            issue_key: key.to_string(),
            project_id,
            developer_id: None,
            rule_key: Some("java:S1144".into()),
            severity: Severity::Major,
            issue_type: IssueType::CodeSmell,
            status: IssueStatus::Open,
            component_path: None,
            line_number: Some(10),
            message: Some(message.to_string()),
            effort_minutes: 5,
            created_date: Some(ts(4, 9)),
            updated_date: None,
            resolved_date: None,
        }
    }

    #[tokio::test]
    async fn issue_upsert_replaces_fields_and_keeps_identity() {
        let store = InMemoryStore::new();
        let (project, outcome) = store.upsert_project("core", "Core", ts(1, 0)).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Created);

        assert_eq!(
            store.upsert_issue(draft("AX-1", project.id, "first")).await.unwrap(),
            UpsertOutcome::Created
        );
        let first = store.find_issue_by_key("AX-1").await.unwrap().unwrap();

        assert_eq!(
            store.upsert_issue(draft("AX-1", project.id, "second")).await.unwrap(),
            UpsertOutcome::Updated
        );
        let second = store.find_issue_by_key("AX-1").await.unwrap().unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.message.as_deref(), Some("second"));
        assert_eq!(store.count_issues().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn issue_must_reference_existing_project() {
        let store = InMemoryStore::new();
        let err = store
            .upsert_issue(draft("AX-2", Uuid::new_v4(), "orphan"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingProject { .. }));
    }

    #[tokio::test]
    async fn closed_sync_log_cannot_be_rewritten() {
        let store = InMemoryStore::new();
        let mut log = SyncLog::started(None, SyncType::Full, ts(1, 2));
        store.insert_sync_log(&log).await.unwrap();
        log.finish(SyncStatus::Success, ts(1, 3));
        store.update_sync_log(&log).await.unwrap();

        let mut reopened = log.clone();
        reopened.status = SyncStatus::Failed;
        let err = store.update_sync_log(&reopened).await.unwrap_err();
        assert!(matches!(err, StoreError::SyncLogClosed(_)));
        let stored = store.find_sync_log(log.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SyncStatus::Success);
    }

    #[tokio::test]
    async fn latest_project_metrics_respects_cutoff() {
        let store = InMemoryStore::new();
        let (project, _) = store.upsert_project("core", "Core", ts(1, 0)).await.unwrap();
        for (day, ncloc) in [(2, 1000), (10, 2000), (20, 3000)] {
            store
                .upsert_project_metrics(ProjectMetricsDaily {
                    project_id: project.id,
                    date_recorded: NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
                    lines_of_code: ncloc,
                    bugs_count: 0,
                    vulnerabilities_count: 0,
                    code_smells_count: 0,
                    reliability_rating: 1.0,
                    security_rating: 1.0,
                    maintainability_rating: 1.0,
                })
                .await
                .unwrap();
        }
        let latest = store
            .latest_project_metrics(project.id, NaiveDate::from_ymd_opt(2024, 3, 15).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.lines_of_code, 2000);
        assert!(store
            .latest_project_metrics(project.id, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
            .await
            .unwrap()
            .is_none());
    }
}
