use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{Days, NaiveDate};
use qlb_core::{
    kloc_from_ncloc, period_bounds, period_end, period_start, round_half_up, start_of_day,
    DeveloperMetricsDaily, Issue, IssueTally, LOC_PER_ISSUE,
};
use qlb_remote::RemoteApiGateway;
use qlb_storage::{EntityStore, StoreResult};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

/// Where a period's monthly totals were read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricsSource {
    DailySnapshots,
    IssueCounts,
}

/// Monthly totals for one period, from a single source.
#[derive(Debug, Clone)]
pub struct PeriodMetrics {
    pub source: MetricsSource,
    /// Keyed by `(developer_id, project_id)`.
    pub developer_projects: BTreeMap<(Uuid, Uuid), IssueTally>,
    pub projects: BTreeMap<Uuid, IssueTally>,
}

impl PeriodMetrics {
    pub fn developer_total(&self, developer_id: Uuid) -> IssueTally {
        let mut total = IssueTally::default();
        for tally in self
            .developer_projects
            .range((developer_id, Uuid::nil())..)
            .take_while(|((dev, _), _)| *dev == developer_id)
            .map(|(_, tally)| tally)
        {
            total.merge(tally);
        }
        total
    }
}

/// Folds one day's issues into per-developer snapshots. Issues without an
/// author are not attributed to anyone.
pub fn aggregate_day(issues: &[Issue], project_id: Uuid, date: NaiveDate) -> Vec<DeveloperMetricsDaily> {
    let mut rows: BTreeMap<Uuid, DeveloperMetricsDaily> = BTreeMap::new();
    for issue in issues.iter().filter(|i| i.project_id == project_id) {
        let Some(developer_id) = issue.developer_id else {
            continue;
        };
        let created = issue.created_on(date);
        let resolved = issue.resolved_on(date);
        if !created && !resolved {
            continue;
        }
        let row = rows
            .entry(developer_id)
            .or_insert_with(|| DeveloperMetricsDaily::empty(developer_id, project_id, date));
        if created {
            row.tally.record_introduced(issue.issue_type);
            row.lines_of_code_contributed += LOC_PER_ISSUE;
        }
        if resolved {
            row.tally.record_resolved();
        }
    }
    rows.into_values().collect()
}

/// Turns issues and stored snapshots into daily and monthly aggregates and
/// KLOC estimates.
#[derive(Clone)]
pub struct MetricsAggregator {
    store: Arc<dyn EntityStore>,
    gateway: Option<Arc<dyn RemoteApiGateway>>,
}

impl MetricsAggregator {
    pub fn new(store: Arc<dyn EntityStore>, gateway: Option<Arc<dyn RemoteApiGateway>>) -> Self {
        Self { store, gateway }
    }

    /// Rebuilds the developer snapshots of one project and day from the issue
    /// table. Returns the number of rows written.
    pub async fn compute_developer_metrics_for_date(
        &self,
        project_id: Uuid,
        date: NaiveDate,
    ) -> StoreResult<usize> {
        self.compute_developer_metrics_for_range(project_id, date, date)
            .await
    }

    /// Same as [`Self::compute_developer_metrics_for_date`] for every day in
    /// `from..=to`; days without activity are cleared.
    pub async fn compute_developer_metrics_for_range(
        &self,
        project_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StoreResult<usize> {
        if from > to {
            return Ok(0);
        }
        let Some(after_to) = to.checked_add_days(Days::new(1)) else {
            return Ok(0);
        };
        let issues = self
            .store
            .project_issues_touched_between(project_id, start_of_day(from), start_of_day(after_to))
            .await?;

        let mut written = 0;
        for date in from.iter_days().take_while(|d| *d <= to) {
            let rows = aggregate_day(&issues, project_id, date);
            written += rows.len();
            self.store
                .replace_developer_metrics(project_id, date, rows)
                .await?;
        }
        debug!(%project_id, %from, %to, rows = written, "developer metrics recomputed");
        Ok(written)
    }

    /// Monthly totals from daily snapshots when any exist for the period,
    /// otherwise straight from the issue table.
    pub async fn period_metrics(&self, period: NaiveDate) -> StoreResult<PeriodMetrics> {
        let period = period_start(period);
        let snapshots = self
            .store
            .developer_metrics_between(period, period_end(period))
            .await?;

        let mut developer_projects: BTreeMap<(Uuid, Uuid), IssueTally> = BTreeMap::new();
        let mut projects: BTreeMap<Uuid, IssueTally> = BTreeMap::new();

        if !snapshots.is_empty() {
            for row in &snapshots {
                developer_projects
                    .entry((row.developer_id, row.project_id))
                    .or_default()
                    .merge(&row.tally);
                projects.entry(row.project_id).or_default().merge(&row.tally);
            }
            return Ok(PeriodMetrics {
                source: MetricsSource::DailySnapshots,
                developer_projects,
                projects,
            });
        }

        let (from, to) = period_bounds(period);
        let in_period = |ts: Option<chrono::DateTime<chrono::Utc>>| {
            ts.is_some_and(|ts| ts >= from && ts < to)
        };
        for issue in self.store.issues_touched_between(from, to).await? {
            let mut tally = IssueTally::default();
            if in_period(issue.created_date) {
                tally.record_introduced(issue.issue_type);
            }
            if in_period(issue.resolved_date) {
                tally.record_resolved();
            }
            projects.entry(issue.project_id).or_default().merge(&tally);
            if let Some(developer_id) = issue.developer_id {
                developer_projects
                    .entry((developer_id, issue.project_id))
                    .or_default()
                    .merge(&tally);
            }
        }
        Ok(PeriodMetrics {
            source: MetricsSource::IssueCounts,
            developer_projects,
            projects,
        })
    }

    /// KLOC of a project as of `on_or_before`: the latest stored snapshot,
    /// else the remote `ncloc` measure, else zero.
    pub async fn project_kloc(
        &self,
        project_id: Uuid,
        project_key: Option<&str>,
        on_or_before: NaiveDate,
    ) -> StoreResult<f64> {
        if let Some(snapshot) = self
            .store
            .latest_project_metrics(project_id, on_or_before)
            .await?
        {
            return Ok(snapshot.kloc());
        }
        let (Some(gateway), Some(key)) = (&self.gateway, project_key) else {
            return Ok(0.0);
        };
        match gateway.get_project_measures(key).await {
            Ok(measures) => Ok(kloc_from_ncloc(measures.get("ncloc").map(String::as_str))),
            Err(err) => {
                warn!(project_key = key, error = %err, "ncloc measure unavailable, using 0 KLOC");
                Ok(0.0)
            }
        }
    }

    /// Proportional KLOC estimate per developer: for every project the
    /// developer introduced issues in, the project's KLOC times the
    /// developer's share of that project's issues. Projects missing from
    /// `project_klocs` are ignored.
    pub async fn developer_klocs(
        &self,
        metrics: &PeriodMetrics,
        project_klocs: &BTreeMap<Uuid, f64>,
    ) -> StoreResult<BTreeMap<Uuid, f64>> {
        let mut project_totals: HashMap<Uuid, i64> = HashMap::new();
        let mut raw: BTreeMap<Uuid, f64> = BTreeMap::new();

        for (&(developer_id, project_id), tally) in &metrics.developer_projects {
            let Some(&kloc) = project_klocs.get(&project_id) else {
                continue;
            };
            if tally.violations_introduced <= 0 || kloc <= 0.0 {
                continue;
            }
            let total = match project_totals.get(&project_id) {
                Some(total) => *total,
                None => {
                    let total = self.store.count_project_issues(project_id).await?;
                    project_totals.insert(project_id, total);
                    total
                }
            };
            if total <= 0 {
                continue;
            }
            let share = round_half_up(f64::from(tally.violations_introduced) / total as f64, 4);
            *raw.entry(developer_id).or_default() += kloc * share;
        }

        Ok(raw
            .into_iter()
            .map(|(developer_id, kloc)| (developer_id, round_half_up(kloc, 2)))
            .collect())
    }

    /// KLOC estimate for a single developer in `period`, over active projects.
    pub async fn developer_kloc(&self, developer_id: Uuid, period: NaiveDate) -> StoreResult<f64> {
        let period = period_start(period);
        let metrics = self.period_metrics(period).await?;
        let mut project_klocs = BTreeMap::new();
        for project in self.store.list_active_projects().await? {
            if metrics
                .developer_projects
                .contains_key(&(developer_id, project.id))
            {
                let kloc = self
                    .project_kloc(project.id, Some(&project.project_key), period_end(period))
                    .await?;
                project_klocs.insert(project.id, kloc);
            }
        }
        let klocs = self.developer_klocs(&metrics, &project_klocs).await?;
        Ok(klocs.get(&developer_id).copied().unwrap_or_default())
    }
}
