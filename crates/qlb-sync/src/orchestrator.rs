use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use qlb_core::{
    format_display_name, parse_effort_minutes, Clock, IssueDraft, IssueStatus, IssueType,
    NewDeveloper, Project, ProjectMetricsDaily, Severity, SyncLog, SyncStatus, SyncType,
    UpsertOutcome,
};
use qlb_remote::{decode_issue_records, IssueSearchResponse, RemoteApiGateway, RemoteIssue};
use qlb_storage::{EntityStore, StoreError};
use serde_json::json;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aggregator::MetricsAggregator;
use crate::config::SyncSettings;
use crate::pagination::{fetch_all_pages, PageLimits, Shutdown};
use crate::{ImportResult, PipelineError, ProjectSyncStats, SyncResult, SyncStats};

/// Maps a remote issue onto local references. Unknown enum values fall back
/// to their documented defaults and bad effort strings count as zero.
pub fn issue_draft(remote: &RemoteIssue, project_id: Uuid, developer_id: Option<Uuid>) -> IssueDraft {
    IssueDraft {
        issue_key: remote.key.clone(),
        project_id,
        developer_id,
        rule_key: remote.rule.clone(),
        severity: Severity::from_remote(remote.severity.as_deref()),
        issue_type: IssueType::from_remote(remote.issue_type.as_deref()),
        status: IssueStatus::from_remote(remote.status.as_deref()),
        component_path: remote.component.clone(),
        line_number: remote.line,
        message: remote.message.clone(),
        effort_minutes: parse_effort_minutes(remote.effort.as_deref()),
        created_date: remote.creation_date,
        updated_date: remote.update_date,
        resolved_date: remote.close_date,
    }
}

/// Builds the daily project snapshot from remote measures; absent or
/// unparsable values become zero.
pub fn project_metrics_snapshot(
    project_id: Uuid,
    date: NaiveDate,
    measures: &HashMap<String, String>,
) -> ProjectMetricsDaily {
    let number = |key: &str| -> f64 {
        measures
            .get(key)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite())
            .unwrap_or_default()
    };
    let count = |key: &str| number(key).max(0.0) as i32;
    ProjectMetricsDaily {
        project_id,
        date_recorded: date,
        lines_of_code: number("ncloc").max(0.0) as i64,
        bugs_count: count("bugs"),
        vulnerabilities_count: count("vulnerabilities"),
        code_smells_count: count("code_smells"),
        reliability_rating: number("reliability_rating"),
        security_rating: number("security_rating"),
        maintainability_rating: number("sqale_rating"),
    }
}

/// The project key an imported issue belongs to: its `project` field, else
/// the component prefix before `:`.
fn import_project_key(issue: &RemoteIssue) -> Option<String> {
    let explicit = issue
        .project
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty());
    if let Some(project) = explicit {
        return Some(project.to_string());
    }
    issue
        .component
        .as_deref()
        .and_then(|c| c.split_once(':'))
        .map(|(project, _)| project.trim())
        .filter(|p| !p.is_empty())
        .map(String::from)
}

/// Start of the default sync window. A span too large for the calendar
/// reaches back to the earliest representable instant.
fn lookback_start(now: DateTime<Utc>, historical_days: i64) -> DateTime<Utc> {
    Duration::try_days(historical_days.max(0))
        .and_then(|span| now.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn touched_dates(issue: &RemoteIssue) -> impl Iterator<Item = NaiveDate> {
    [issue.creation_date, issue.close_date]
        .into_iter()
        .flatten()
        .map(|ts| ts.date_naive())
}

/// Drives full and incremental synchronisation against one gateway. Built
/// per run; holds no state between runs apart from the store.
pub struct SyncOrchestrator {
    store: Arc<dyn EntityStore>,
    gateway: Arc<dyn RemoteApiGateway>,
    clock: Arc<dyn Clock>,
    settings: SyncSettings,
    shutdown: Shutdown,
    aggregator: MetricsAggregator,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn EntityStore>,
        gateway: Arc<dyn RemoteApiGateway>,
        clock: Arc<dyn Clock>,
        settings: SyncSettings,
    ) -> Self {
        let aggregator = MetricsAggregator::new(store.clone(), Some(gateway.clone()));
        Self {
            store,
            gateway,
            clock,
            settings,
            shutdown: Shutdown::never(),
            aggregator,
        }
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    fn limits(&self) -> PageLimits {
        PageLimits {
            page_size: self.settings.page_size,
            max_pages: self.settings.max_pages,
            delay: self.settings.request_delay,
        }
    }

    /// Syncs every remote project. Per-project failures are recorded and
    /// skipped; only a failure to list projects at all fails the run.
    pub async fn sync_all(&self, full_sync: bool) -> Result<SyncResult, PipelineError> {
        self.sync_all_inner(full_sync)
            .instrument(info_span!("sync_all", full_sync))
            .await
    }

    async fn sync_all_inner(&self, full_sync: bool) -> Result<SyncResult, PipelineError> {
        let mut log = SyncLog::started(None, SyncType::for_run(full_sync), self.clock.now());
        self.store.insert_sync_log(&log).await?;

        let limits = self.limits();
        let gateway = self.gateway.clone();
        let fetched = fetch_all_pages(limits, &self.shutdown, |page| {
            let gateway = gateway.clone();
            async move { gateway.list_projects(page, limits.page_size).await }
        })
        .await;

        let mut stats = SyncStats::default();
        let mut errors = Vec::new();

        if fetched.failed_on_first_page {
            let message = format!(
                "failed to fetch projects: {}",
                fetched.error.unwrap_or_default()
            );
            error!(%message, "sync run failed");
            log.error_message = Some(message.clone());
            return self.close_run(log, SyncStatus::Failed, message, stats, vec![]).await;
        }
        if let Some(err) = fetched.error {
            errors.push(format!("project listing truncated: {err}"));
        }
        if fetched.items.is_empty() {
            return self
                .close_run(log, SyncStatus::Success, "no projects to synchronise".into(), stats, errors)
                .await;
        }

        let mut developers = HashMap::new();
        let mut interrupted = fetched.interrupted;
        for (index, remote) in fetched.items.iter().enumerate() {
            if interrupted {
                break;
            }
            if index > 0 && !self.shutdown.pause(self.settings.request_delay).await {
                interrupted = true;
                break;
            }
            let project = match self
                .store
                .upsert_project(&remote.key, &remote.name, self.clock.now())
                .await
            {
                Ok((project, outcome)) => {
                    if outcome == UpsertOutcome::Created {
                        stats.projects_created += 1;
                    }
                    project
                }
                Err(err) => {
                    warn!(project_key = %remote.key, error = %err, "project upsert failed, skipping");
                    stats.projects_failed += 1;
                    errors.push(format!("{}: {err}", remote.key));
                    continue;
                }
            };
            if !project.is_active {
                info!(project_key = %project.project_key, "project inactive, skipping");
                continue;
            }
            let project_stats = self
                .sync_project_with(&project, full_sync, SyncType::for_run(full_sync), &mut developers)
                .await;
            match project_stats {
                Ok(project_stats) => {
                    errors.extend(
                        project_stats
                            .errors
                            .iter()
                            .map(|e| format!("{}: {e}", project_stats.project_key)),
                    );
                    stats.absorb(&project_stats);
                }
                Err(err) => {
                    warn!(project_key = %project.project_key, error = %err, "project sync failed");
                    stats.projects_failed += 1;
                    errors.push(format!("{}: {err}", project.project_key));
                }
            }
        }

        let (status, message) = if interrupted {
            (SyncStatus::Partial, "sync interrupted by shutdown".to_string())
        } else {
            (
                SyncStatus::Success,
                format!(
                    "synchronised {} projects, {} issues",
                    stats.projects_processed, stats.issues_processed
                ),
            )
        };
        self.close_run(log, status, message, stats, errors).await
    }

    async fn close_run(
        &self,
        mut log: SyncLog,
        status: SyncStatus,
        message: String,
        stats: SyncStats,
        errors: Vec<String>,
    ) -> Result<SyncResult, PipelineError> {
        log.records_processed = saturating_i32(stats.issues_processed);
        log.records_created = saturating_i32(stats.issues_created);
        log.records_updated = saturating_i32(stats.issues_updated);
        log.sync_details = Some(json!({ "stats": stats, "errors": errors }));
        if status == SyncStatus::Partial && log.error_message.is_none() {
            log.error_message = Some(message.clone());
        }
        log.finish(status, self.clock.now());
        self.store.update_sync_log(&log).await?;
        info!(status = status.as_str(), %message, "sync run finished");

        Ok(SyncResult {
            success: status != SyncStatus::Failed,
            message,
            sync_log_id: Some(log.id),
            stats,
            errors,
            duration_ms: log.duration_ms().unwrap_or_default(),
        })
    }

    /// Syncs one project's issues from its watermark, refreshes its metrics
    /// snapshot and recomputes developer metrics for the window. Writes one
    /// sync log of `sync_type` for the project.
    pub async fn sync_project(
        &self,
        project: &Project,
        full_sync: bool,
        sync_type: SyncType,
    ) -> Result<ProjectSyncStats, PipelineError> {
        self.sync_project_with(project, full_sync, sync_type, &mut HashMap::new())
            .await
    }

    async fn sync_project_with(
        &self,
        project: &Project,
        full_sync: bool,
        sync_type: SyncType,
        developers: &mut HashMap<String, Uuid>,
    ) -> Result<ProjectSyncStats, PipelineError> {
        let span = info_span!("sync_project", project_key = %project.project_key, full_sync);
        async move {
            let mut log = SyncLog::started(Some(project.id), sync_type, self.clock.now());
            self.store.insert_sync_log(&log).await?;

            let mut stats = ProjectSyncStats {
                project_key: project.project_key.clone(),
                sync_log_id: log.id,
                status: SyncStatus::Started,
                pages_fetched: 0,
                issues_processed: 0,
                issues_created: 0,
                issues_updated: 0,
                developers_created: 0,
                metrics_rows: 0,
                errors: Vec::new(),
            };

            let status = match self.run_project(project, full_sync, developers, &mut stats).await {
                Ok(status) => status,
                Err(err) => {
                    error!(error = %err, "project sync aborted");
                    stats.errors.push(err.to_string());
                    log.error_message = Some(err.to_string());
                    SyncStatus::Failed
                }
            };
            stats.status = status;

            log.records_processed = saturating_i32(stats.issues_processed);
            log.records_created = saturating_i32(stats.issues_created);
            log.records_updated = saturating_i32(stats.issues_updated);
            log.sync_details = Some(json!({
                "pagesFetched": stats.pages_fetched,
                "developersCreated": stats.developers_created,
                "metricsRows": stats.metrics_rows,
                "errors": stats.errors,
            }));
            if status != SyncStatus::Success && log.error_message.is_none() {
                log.error_message = stats.errors.first().cloned();
            }
            log.finish(status, self.clock.now());
            self.store.update_sync_log(&log).await?;
            info!(
                status = status.as_str(),
                issues = stats.issues_processed,
                created = stats.issues_created,
                updated = stats.issues_updated,
                "project sync finished"
            );
            Ok::<_, PipelineError>(stats)
        }
        .instrument(span)
        .await
    }

    async fn run_project(
        &self,
        project: &Project,
        full_sync: bool,
        developers: &mut HashMap<String, Uuid>,
        stats: &mut ProjectSyncStats,
    ) -> Result<SyncStatus, StoreError> {
        let now = self.clock.now();
        let lookback = lookback_start(now, self.settings.historical_days);
        let watermark = if full_sync {
            lookback
        } else {
            self.store
                .last_successful_project_sync(project.id)
                .await?
                .and_then(|log| log.end_time)
                .unwrap_or(lookback)
        };
        info!(%watermark, "fetching issues");

        let limits = self.limits();
        let gateway = self.gateway.clone();
        let key = project.project_key.clone();
        let fetched = fetch_all_pages(limits, &self.shutdown, |page| {
            let gateway = gateway.clone();
            let key = key.clone();
            async move {
                gateway
                    .list_issues(&key, Some(watermark), None, page, limits.page_size)
                    .await
            }
        })
        .await;
        stats.pages_fetched = fetched.pages_fetched;
        stats.errors.extend(fetched.rejected.iter().cloned());
        if let Some(err) = &fetched.error {
            stats.errors.push(err.clone());
        }
        if fetched.failed_on_first_page {
            return Ok(SyncStatus::Failed);
        }

        for remote in &fetched.items {
            stats.issues_processed += 1;
            let developer_id = match remote.author_key() {
                Some(author) => match self.ensure_developer(author, developers, stats).await {
                    Ok(id) => Some(id),
                    Err(err) => {
                        warn!(issue_key = %remote.key, error = %err, "developer upsert failed, skipping issue");
                        stats.errors.push(format!("issue {}: {err}", remote.key));
                        continue;
                    }
                },
                None => None,
            };
            match self
                .store
                .upsert_issue(issue_draft(remote, project.id, developer_id))
                .await
            {
                Ok(UpsertOutcome::Created) => stats.issues_created += 1,
                Ok(UpsertOutcome::Updated) => stats.issues_updated += 1,
                Err(err) => {
                    warn!(issue_key = %remote.key, error = %err, "issue upsert failed, skipping");
                    stats.errors.push(format!("issue {}: {err}", remote.key));
                }
            }
        }

        let today = self.clock.today();
        match self.gateway.get_project_measures(&project.project_key).await {
            Ok(measures) => {
                self.store
                    .upsert_project_metrics(project_metrics_snapshot(project.id, today, &measures))
                    .await?;
            }
            Err(err) => {
                warn!(error = %err, "project measures unavailable");
                stats.errors.push(format!("measures: {err}"));
            }
        }

        let rows = self
            .aggregator
            .compute_developer_metrics_for_range(project.id, watermark.date_naive(), today)
            .await?;
        stats.metrics_rows = u32::try_from(rows).unwrap_or(u32::MAX);

        Ok(if stats.errors.is_empty() && !fetched.interrupted {
            SyncStatus::Success
        } else {
            SyncStatus::Partial
        })
    }

    /// Returns the local id for `author_key`, creating the developer on first
    /// sight with a remote display name or a key-derived fallback.
    async fn ensure_developer(
        &self,
        author_key: &str,
        cache: &mut HashMap<String, Uuid>,
        stats: &mut ProjectSyncStats,
    ) -> Result<Uuid, StoreError> {
        let (id, created) = resolve_developer(
            self.store.as_ref(),
            self.gateway.as_ref(),
            self.clock.as_ref(),
            author_key,
            cache,
        )
        .await?;
        if created {
            stats.developers_created += 1;
        }
        Ok(id)
    }

    /// Imports an issues-search payload, creating missing projects and
    /// developers, then recomputes developer metrics for the touched days.
    pub async fn import_issues(&self, payload: &str) -> Result<ImportResult, PipelineError> {
        let parsed: IssueSearchResponse = if payload.trim().is_empty() {
            IssueSearchResponse::default()
        } else {
            serde_json::from_str(payload)
                .map_err(|err| PipelineError::InvalidPayload(err.to_string()))?
        };
        let (issues, rejected) = decode_issue_records(parsed.issues);
        if issues.is_empty() && rejected.is_empty() {
            return Ok(ImportResult {
                success: true,
                message: "nothing imported".into(),
                ..ImportResult::default()
            });
        }

        let mut result = ImportResult {
            errors: rejected,
            ..ImportResult::default()
        };
        let mut projects: HashMap<String, Uuid> = HashMap::new();
        let mut developers: HashMap<String, Uuid> = HashMap::new();
        let mut touched: BTreeSet<(Uuid, NaiveDate)> = BTreeSet::new();

        for remote in &issues {
            let Some(project_key) = import_project_key(remote) else {
                result.errors.push(format!("issue {}: no project key", remote.key));
                continue;
            };
            let project_id = match projects.get(&project_key) {
                Some(id) => *id,
                None => match self.import_project(&project_key).await {
                    Ok(id) => {
                        projects.insert(project_key.clone(), id);
                        id
                    }
                    Err(err) => {
                        result.errors.push(format!("issue {}: {err}", remote.key));
                        continue;
                    }
                },
            };
            let developer_id = match remote.author_key() {
                Some(author) => match resolve_developer(
                    self.store.as_ref(),
                    self.gateway.as_ref(),
                    self.clock.as_ref(),
                    author,
                    &mut developers,
                )
                .await
                {
                    Ok((id, _)) => Some(id),
                    Err(err) => {
                        result.errors.push(format!("issue {}: {err}", remote.key));
                        continue;
                    }
                },
                None => None,
            };
            match self
                .store
                .upsert_issue(issue_draft(remote, project_id, developer_id))
                .await
            {
                Ok(outcome) => {
                    result.imported += 1;
                    match outcome {
                        UpsertOutcome::Created => result.created += 1,
                        UpsertOutcome::Updated => result.updated += 1,
                    }
                    touched.extend(touched_dates(remote).map(|d| (project_id, d)));
                }
                Err(err) => result.errors.push(format!("issue {}: {err}", remote.key)),
            }
        }

        for (project_id, date) in touched {
            if let Err(err) = self
                .aggregator
                .compute_developer_metrics_for_date(project_id, date)
                .await
            {
                result.errors.push(format!("metrics for {date}: {err}"));
            }
        }

        result.success = true;
        result.message = format!(
            "imported {} issues ({} created, {} updated)",
            result.imported, result.created, result.updated
        );
        info!(imported = result.imported, errors = result.errors.len(), "issue import finished");
        Ok(result)
    }

    /// Existing projects are reused untouched; unknown keys are created with
    /// the key as their name.
    async fn import_project(&self, project_key: &str) -> Result<Uuid, StoreError> {
        if let Some(project) = self.store.find_project_by_key(project_key).await? {
            return Ok(project.id);
        }
        let (project, _) = self
            .store
            .upsert_project(project_key, project_key, self.clock.now())
            .await?;
        Ok(project.id)
    }
}

async fn resolve_developer(
    store: &dyn EntityStore,
    gateway: &dyn RemoteApiGateway,
    clock: &dyn Clock,
    author_key: &str,
    cache: &mut HashMap<String, Uuid>,
) -> Result<(Uuid, bool), StoreError> {
    if let Some(id) = cache.get(author_key) {
        return Ok((*id, false));
    }
    if let Some(existing) = store.find_developer_by_key(author_key).await? {
        cache.insert(author_key.to_string(), existing.id);
        return Ok((existing.id, false));
    }

    let (display_name, email) = match gateway.resolve_user(author_key).await {
        Ok(Some(user)) => {
            let name = user
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| format_display_name(author_key));
            (name, user.email)
        }
        Ok(None) => (format_display_name(author_key), None),
        Err(err) => {
            warn!(author_key, error = %err, "user lookup failed, using formatted key");
            (format_display_name(author_key), None)
        }
    };
    let developer = store
        .insert_developer(
            NewDeveloper {
                author_key: author_key.to_string(),
                display_name,
                email,
            },
            clock.now(),
        )
        .await?;
    cache.insert(author_key.to_string(), developer.id);
    Ok((developer.id, true))
}

fn saturating_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn remote(key: &str) -> RemoteIssue {
        RemoteIssue {
            key: key.to_string(),
            rule: Some("java:S1481".into()),
            severity: Some("BLOCKER_PLUS".into()),
            component: Some("billing:src/Invoice.java".into()),
            project: None,
            line: Some(7),
            status: Some("resolved".into()),
            message: Some("unused variable".into()),
            effort: Some("1h30min".into()),
            author: Some("jane".into()),
            issue_type: None,
            creation_date: Some(Utc.with_ymd_and_hms(2024, 3, 2, 8, 0, 0).unwrap()),
            update_date: None,
            close_date: Some(Utc.with_ymd_and_hms(2024, 3, 4, 8, 0, 0).unwrap()),
        }
    }

    #[test]
    fn drafts_apply_fallbacks_and_parse_effort() {
        let project = Uuid::new_v4();
        let draft = issue_draft(&remote("AX-1"), project, None);
        assert_eq!(draft.severity, Severity::Major);
        assert_eq!(draft.issue_type, IssueType::CodeSmell);
        assert_eq!(draft.status, IssueStatus::Resolved);
        assert_eq!(draft.effort_minutes, 90);
        assert_eq!(draft.project_id, project);
        assert!(draft.resolved_date.is_some());
    }

    #[test]
    fn import_key_prefers_project_then_component_prefix() {
        let mut issue = remote("AX-1");
        assert_eq!(import_project_key(&issue).as_deref(), Some("billing"));
        issue.project = Some("core".into());
        assert_eq!(import_project_key(&issue).as_deref(), Some("core"));
        issue.project = None;
        issue.component = Some("no-separator".into());
        assert_eq!(import_project_key(&issue), None);
    }

    #[test]
    fn lookback_saturates_instead_of_overflowing() {
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();
        assert_eq!(
            lookback_start(now, 90),
            Utc.with_ymd_and_hms(2023, 12, 16, 12, 0, 0).unwrap()
        );
        assert_eq!(lookback_start(now, 0), now);
        assert_eq!(lookback_start(now, -5), now);
        assert_eq!(lookback_start(now, i64::MAX), DateTime::<Utc>::MIN_UTC);
        assert_eq!(lookback_start(now, 400_000_000), DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn measures_snapshot_defaults_missing_values() {
        let measures = HashMap::from([
            ("ncloc".to_string(), "12345".to_string()),
            ("bugs".to_string(), "4".to_string()),
            ("sqale_rating".to_string(), "2.0".to_string()),
            ("code_smells".to_string(), "n/a".to_string()),
        ]);
        let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        let snapshot = project_metrics_snapshot(Uuid::nil(), date, &measures);
        assert_eq!(snapshot.lines_of_code, 12345);
        assert_eq!(snapshot.bugs_count, 4);
        assert_eq!(snapshot.code_smells_count, 0);
        assert_eq!(snapshot.vulnerabilities_count, 0);
        assert_eq!(snapshot.maintainability_rating, 2.0);
        assert_eq!(snapshot.kloc(), 12.35);
    }
}
