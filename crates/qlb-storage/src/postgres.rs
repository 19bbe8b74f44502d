use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use qlb_core::{
    Category, CategoryScores, Developer, DeveloperMetricsDaily, EntityType, IndividualRanking,
    Issue, IssueDraft, IssueStatus, IssueTally, IssueType, MonthlyChampion, NewDeveloper, Project,
    ProjectMetricsDaily, ProjectRanking, Severity, StoredRemoteConfig, SyncLog, SyncStatus,
    SyncType, UpsertOutcome,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::{EntityStore, ProjectCounts, StoreError, StoreResult};

const FOREIGN_KEY_VIOLATION: &str = "23503";

#[derive(Clone)]
pub struct Database {
    pub pool: PgPool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Arc<Self>> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(60 * 5))
            .connect(database_url)
            .await
            .context("connecting to the database")?;
        Ok(Arc::new(Self { pool }))
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running database migrations")?;
        info!("database migrations applied");
        Ok(())
    }

    pub fn store(&self) -> PgStore {
        PgStore::new(self.pool.clone())
    }
}

/// PostgreSQL implementation of [`EntityStore`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn corrupt(table: &'static str, detail: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        table,
        detail: detail.into(),
    }
}

fn project_from_row(row: &PgRow) -> StoreResult<Project> {
    Ok(Project {
        id: row.try_get("id")?,
        project_key: row.try_get("project_key")?,
        name: row.try_get("name")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn developer_from_row(row: &PgRow) -> StoreResult<Developer> {
    Ok(Developer {
        id: row.try_get("id")?,
        author_key: row.try_get("author_key")?,
        display_name: row.try_get("display_name")?,
        email: row.try_get("email")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn issue_from_row(row: &PgRow) -> StoreResult<Issue> {
    let severity: String = row.try_get("severity")?;
    let issue_type: String = row.try_get("issue_type")?;
    let status: String = row.try_get("status")?;
    Ok(Issue {
        id: row.try_get("id")?,
        issue_key: row.try_get("issue_key")?,
        project_id: row.try_get("project_id")?,
        developer_id: row.try_get("developer_id")?,
        rule_key: row.try_get("rule_key")?,
        severity: Severity::from_remote(Some(&severity)),
        issue_type: IssueType::from_remote(Some(&issue_type)),
        status: IssueStatus::from_remote(Some(&status)),
        component_path: row.try_get("component_path")?,
        line_number: row.try_get("line_number")?,
        message: row.try_get("message")?,
        effort_minutes: row.try_get("effort_minutes")?,
        created_date: row.try_get("created_date")?,
        updated_date: row.try_get("updated_date")?,
        resolved_date: row.try_get("resolved_date")?,
    })
}

fn tally_from_row(row: &PgRow) -> StoreResult<IssueTally> {
    Ok(IssueTally {
        violations_introduced: row.try_get("violations_introduced")?,
        violations_resolved: row.try_get("violations_resolved")?,
        bugs_introduced: row.try_get("bugs_introduced")?,
        vulnerabilities_introduced: row.try_get("vulnerabilities_introduced")?,
        code_smells_introduced: row.try_get("code_smells_introduced")?,
    })
}

fn developer_metrics_from_row(row: &PgRow) -> StoreResult<DeveloperMetricsDaily> {
    Ok(DeveloperMetricsDaily {
        developer_id: row.try_get("developer_id")?,
        project_id: row.try_get("project_id")?,
        date_recorded: row.try_get("date_recorded")?,
        tally: tally_from_row(row)?,
        lines_of_code_contributed: row.try_get("lines_of_code_contributed")?,
    })
}

fn project_metrics_from_row(row: &PgRow) -> StoreResult<ProjectMetricsDaily> {
    Ok(ProjectMetricsDaily {
        project_id: row.try_get("project_id")?,
        date_recorded: row.try_get("date_recorded")?,
        lines_of_code: row.try_get("lines_of_code")?,
        bugs_count: row.try_get("bugs_count")?,
        vulnerabilities_count: row.try_get("vulnerabilities_count")?,
        code_smells_count: row.try_get("code_smells_count")?,
        reliability_rating: row.try_get("reliability_rating")?,
        security_rating: row.try_get("security_rating")?,
        maintainability_rating: row.try_get("maintainability_rating")?,
    })
}

fn scores_from_row(row: &PgRow) -> StoreResult<CategoryScores> {
    Ok(CategoryScores {
        tally: tally_from_row(row)?,
        total_kloc: row.try_get("total_kloc")?,
        defect_terminator_score: row.try_get("defect_terminator_score")?,
        defect_terminator_rank: row.try_get("defect_terminator_rank")?,
        code_rock_score: row.try_get("code_rock_score")?,
        code_rock_rank: row.try_get("code_rock_rank")?,
        code_shield_score: row.try_get("code_shield_score")?,
        code_shield_rank: row.try_get("code_shield_rank")?,
        craftsman_score: row.try_get("craftsman_score")?,
        craftsman_rank: row.try_get("craftsman_rank")?,
    })
}

fn individual_ranking_from_row(row: &PgRow) -> StoreResult<IndividualRanking> {
    Ok(IndividualRanking {
        id: row.try_get("id")?,
        developer_id: row.try_get("developer_id")?,
        ranking_period: row.try_get("ranking_period")?,
        scores: scores_from_row(row)?,
        climber_score: row.try_get("climber_score")?,
        climber_rank: row.try_get("climber_rank")?,
    })
}

fn project_ranking_from_row(row: &PgRow) -> StoreResult<ProjectRanking> {
    Ok(ProjectRanking {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        ranking_period: row.try_get("ranking_period")?,
        scores: scores_from_row(row)?,
    })
}

fn champion_from_row(row: &PgRow) -> StoreResult<MonthlyChampion> {
    let category: String = row.try_get("category")?;
    let entity_type: String = row.try_get("entity_type")?;
    Ok(MonthlyChampion {
        id: row.try_get("id")?,
        period: row.try_get("period")?,
        category: Category::parse(&category)
            .ok_or_else(|| corrupt("monthly_champions", format!("category {category}")))?,
        entity_type: EntityType::parse(&entity_type)
            .ok_or_else(|| corrupt("monthly_champions", format!("entity_type {entity_type}")))?,
        entity_id: row.try_get("entity_id")?,
        entity_name: row.try_get("entity_name")?,
        score: row.try_get("score")?,
        metric_details: row.try_get("metric_details")?,
        created_at: row.try_get("created_at")?,
    })
}

fn sync_log_from_row(row: &PgRow) -> StoreResult<SyncLog> {
    let sync_type: String = row.try_get("sync_type")?;
    let status: String = row.try_get("status")?;
    Ok(SyncLog {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        sync_type: SyncType::parse(&sync_type)
            .ok_or_else(|| corrupt("sync_logs", format!("sync_type {sync_type}")))?,
        status: SyncStatus::parse(&status)
            .ok_or_else(|| corrupt("sync_logs", format!("status {status}")))?,
        records_processed: row.try_get("records_processed")?,
        records_created: row.try_get("records_created")?,
        records_updated: row.try_get("records_updated")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        error_message: row.try_get("error_message")?,
        sync_details: row.try_get("sync_details")?,
    })
}

fn outcome_from_row(row: &PgRow) -> StoreResult<UpsertOutcome> {
    let inserted: bool = row.try_get("inserted")?;
    Ok(if inserted {
        UpsertOutcome::Created
    } else {
        UpsertOutcome::Updated
    })
}

const RANKING_COLUMNS: &str = "violations_introduced, violations_resolved, bugs_introduced, \
     vulnerabilities_introduced, code_smells_introduced, total_kloc, \
     defect_terminator_score, defect_terminator_rank, code_rock_score, code_rock_rank, \
     code_shield_score, code_shield_rank, craftsman_score, craftsman_rank";

fn bind_scores<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    scores: &CategoryScores,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(scores.tally.violations_introduced)
        .bind(scores.tally.violations_resolved)
        .bind(scores.tally.bugs_introduced)
        .bind(scores.tally.vulnerabilities_introduced)
        .bind(scores.tally.code_smells_introduced)
        .bind(scores.total_kloc)
        .bind(scores.defect_terminator_score)
        .bind(scores.defect_terminator_rank)
        .bind(scores.code_rock_score)
        .bind(scores.code_rock_rank)
        .bind(scores.code_shield_score)
        .bind(scores.code_shield_rank)
        .bind(scores.craftsman_score)
        .bind(scores.craftsman_rank)
}

#[async_trait]
impl EntityStore for PgStore {
    async fn upsert_project(
        &self,
        project_key: &str,
        name: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<(Project, UpsertOutcome)> {
        let row = sqlx::query(
            r#"
            INSERT INTO projects (id, project_key, name, is_active, created_at, updated_at)
            VALUES ($1, $2, $3, TRUE, $4, $4)
            ON CONFLICT (project_key) DO UPDATE
               SET name = EXCLUDED.name,
                   updated_at = CASE WHEN projects.name <> EXCLUDED.name
                                     THEN EXCLUDED.updated_at
                                     ELSE projects.updated_at END
            RETURNING *, (xmax = 0) AS inserted
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(project_key)
        .bind(name)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok((project_from_row(&row)?, outcome_from_row(&row)?))
    }

    async fn find_project_by_key(&self, project_key: &str) -> StoreResult<Option<Project>> {
        sqlx::query("SELECT * FROM projects WHERE project_key = $1")
            .bind(project_key)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(project_from_row)
            .transpose()
    }

    async fn list_active_projects(&self) -> StoreResult<Vec<Project>> {
        let rows = sqlx::query("SELECT * FROM projects WHERE is_active ORDER BY project_key")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(project_from_row).collect()
    }

    async fn project_counts(&self) -> StoreResult<ProjectCounts> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, COUNT(*) FILTER (WHERE is_active) AS active FROM projects",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(ProjectCounts {
            total: row.try_get("total")?,
            active: row.try_get("active")?,
        })
    }

    async fn find_developer_by_key(&self, author_key: &str) -> StoreResult<Option<Developer>> {
        sqlx::query("SELECT * FROM developers WHERE author_key = $1")
            .bind(author_key)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(developer_from_row)
            .transpose()
    }

    async fn insert_developer(
        &self,
        developer: NewDeveloper,
        now: DateTime<Utc>,
    ) -> StoreResult<Developer> {
        // The no-op update makes RETURNING yield the existing row on conflict.
        let row = sqlx::query(
            r#"
            INSERT INTO developers (id, author_key, display_name, email, is_active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, TRUE, $5, $5)
            ON CONFLICT (author_key) DO UPDATE SET author_key = developers.author_key
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&developer.author_key)
        .bind(&developer.display_name)
        .bind(&developer.email)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        developer_from_row(&row)
    }

    async fn list_active_developers(&self) -> StoreResult<Vec<Developer>> {
        let rows = sqlx::query("SELECT * FROM developers WHERE is_active ORDER BY author_key")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(developer_from_row).collect()
    }

    async fn upsert_issue(&self, draft: IssueDraft) -> StoreResult<UpsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO issues (
                id, issue_key, project_id, developer_id, rule_key, severity, issue_type, status,
                component_path, line_number, message, effort_minutes,
                created_date, updated_date, resolved_date
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (issue_key) DO UPDATE
               SET project_id = EXCLUDED.project_id,
                   developer_id = EXCLUDED.developer_id,
                   rule_key = EXCLUDED.rule_key,
                   severity = EXCLUDED.severity,
                   issue_type = EXCLUDED.issue_type,
                   status = EXCLUDED.status,
                   component_path = EXCLUDED.component_path,
                   line_number = EXCLUDED.line_number,
                   message = EXCLUDED.message,
                   effort_minutes = EXCLUDED.effort_minutes,
                   created_date = EXCLUDED.created_date,
                   updated_date = EXCLUDED.updated_date,
                   resolved_date = EXCLUDED.resolved_date
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&draft.issue_key)
        .bind(draft.project_id)
        .bind(draft.developer_id)
        .bind(&draft.rule_key)
        .bind(draft.severity.as_str())
        .bind(draft.issue_type.as_str())
        .bind(draft.status.as_str())
        .bind(&draft.component_path)
        .bind(draft.line_number)
        .bind(&draft.message)
        .bind(draft.effort_minutes)
        .bind(draft.created_date)
        .bind(draft.updated_date)
        .bind(draft.resolved_date)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => outcome_from_row(&row),
            Err(sqlx::Error::Database(db))
                if db.code().as_deref() == Some(FOREIGN_KEY_VIOLATION)
                    && db.constraint() == Some("issues_project_id_fkey") =>
            {
                Err(StoreError::MissingProject {
                    issue_key: draft.issue_key,
                    project_id: draft.project_id,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn find_issue_by_key(&self, issue_key: &str) -> StoreResult<Option<Issue>> {
        sqlx::query("SELECT * FROM issues WHERE issue_key = $1")
            .bind(issue_key)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(issue_from_row)
            .transpose()
    }

    async fn count_issues(&self) -> StoreResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM issues")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    async fn count_project_issues(&self, project_id: Uuid) -> StoreResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM issues WHERE project_id = $1")
            .bind(project_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    async fn project_issues_touched_between(
        &self,
        project_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<Issue>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM issues
             WHERE project_id = $1
               AND ((created_date >= $2 AND created_date < $3)
                 OR (resolved_date >= $2 AND resolved_date < $3))
             ORDER BY issue_key
            "#,
        )
        .bind(project_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(issue_from_row).collect()
    }

    async fn issues_touched_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<Issue>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM issues
             WHERE (created_date >= $1 AND created_date < $2)
                OR (resolved_date >= $1 AND resolved_date < $2)
             ORDER BY issue_key
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(issue_from_row).collect()
    }

    async fn replace_developer_metrics(
        &self,
        project_id: Uuid,
        date: NaiveDate,
        rows: Vec<DeveloperMetricsDaily>,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM developer_metrics_daily WHERE project_id = $1 AND date_recorded = $2")
            .bind(project_id)
            .bind(date)
            .execute(&mut *tx)
            .await?;
        for row in &rows {
            sqlx::query(
                r#"
                INSERT INTO developer_metrics_daily (
                    developer_id, project_id, date_recorded, violations_introduced,
                    violations_resolved, bugs_introduced, vulnerabilities_introduced,
                    code_smells_introduced, lines_of_code_contributed
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(row.developer_id)
            .bind(project_id)
            .bind(date)
            .bind(row.tally.violations_introduced)
            .bind(row.tally.violations_resolved)
            .bind(row.tally.bugs_introduced)
            .bind(row.tally.vulnerabilities_introduced)
            .bind(row.tally.code_smells_introduced)
            .bind(row.lines_of_code_contributed)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn developer_metrics_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StoreResult<Vec<DeveloperMetricsDaily>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM developer_metrics_daily
             WHERE date_recorded BETWEEN $1 AND $2
             ORDER BY date_recorded, project_id, developer_id
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(developer_metrics_from_row).collect()
    }

    async fn upsert_project_metrics(&self, metrics: ProjectMetricsDaily) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO project_metrics_daily (
                project_id, date_recorded, lines_of_code, bugs_count, vulnerabilities_count,
                code_smells_count, reliability_rating, security_rating, maintainability_rating
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (project_id, date_recorded) DO UPDATE
               SET lines_of_code = EXCLUDED.lines_of_code,
                   bugs_count = EXCLUDED.bugs_count,
                   vulnerabilities_count = EXCLUDED.vulnerabilities_count,
                   code_smells_count = EXCLUDED.code_smells_count,
                   reliability_rating = EXCLUDED.reliability_rating,
                   security_rating = EXCLUDED.security_rating,
                   maintainability_rating = EXCLUDED.maintainability_rating
            "#,
        )
        .bind(metrics.project_id)
        .bind(metrics.date_recorded)
        .bind(metrics.lines_of_code)
        .bind(metrics.bugs_count)
        .bind(metrics.vulnerabilities_count)
        .bind(metrics.code_smells_count)
        .bind(metrics.reliability_rating)
        .bind(metrics.security_rating)
        .bind(metrics.maintainability_rating)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_project_metrics(
        &self,
        project_id: Uuid,
        on_or_before: NaiveDate,
    ) -> StoreResult<Option<ProjectMetricsDaily>> {
        sqlx::query(
            r#"
            SELECT * FROM project_metrics_daily
             WHERE project_id = $1 AND date_recorded <= $2
             ORDER BY date_recorded DESC
             LIMIT 1
            "#,
        )
        .bind(project_id)
        .bind(on_or_before)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(project_metrics_from_row)
        .transpose()
    }

    async fn replace_individual_rankings(
        &self,
        period: NaiveDate,
        rows: Vec<IndividualRanking>,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM individual_rankings WHERE ranking_period = $1")
            .bind(period)
            .execute(&mut *tx)
            .await?;
        let sql = format!(
            "INSERT INTO individual_rankings (id, developer_id, ranking_period, {RANKING_COLUMNS}, \
             climber_score, climber_rank) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)"
        );
        for row in &rows {
            let query = sqlx::query(&sql)
                .bind(row.id)
                .bind(row.developer_id)
                .bind(period);
            bind_scores(query, &row.scores)
                .bind(row.climber_score)
                .bind(row.climber_rank)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn replace_project_rankings(
        &self,
        period: NaiveDate,
        rows: Vec<ProjectRanking>,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM project_rankings WHERE ranking_period = $1")
            .bind(period)
            .execute(&mut *tx)
            .await?;
        let sql = format!(
            "INSERT INTO project_rankings (id, project_id, ranking_period, {RANKING_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)"
        );
        for row in &rows {
            let query = sqlx::query(&sql)
                .bind(row.id)
                .bind(row.project_id)
                .bind(period);
            bind_scores(query, &row.scores).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn individual_rankings_for_period(
        &self,
        period: NaiveDate,
    ) -> StoreResult<Vec<IndividualRanking>> {
        let rows = sqlx::query(
            "SELECT * FROM individual_rankings WHERE ranking_period = $1 ORDER BY developer_id",
        )
        .bind(period)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(individual_ranking_from_row).collect()
    }

    async fn project_rankings_for_period(
        &self,
        period: NaiveDate,
    ) -> StoreResult<Vec<ProjectRanking>> {
        let rows = sqlx::query(
            "SELECT * FROM project_rankings WHERE ranking_period = $1 ORDER BY project_id",
        )
        .bind(period)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(project_ranking_from_row).collect()
    }

    async fn replace_champions(
        &self,
        period: NaiveDate,
        rows: Vec<MonthlyChampion>,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM monthly_champions WHERE period = $1")
            .bind(period)
            .execute(&mut *tx)
            .await?;
        for champion in &rows {
            sqlx::query(
                r#"
                INSERT INTO monthly_champions (
                    id, period, category, entity_type, entity_id, entity_name,
                    score, metric_details, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(champion.id)
            .bind(period)
            .bind(champion.category.as_str())
            .bind(champion.entity_type.as_str())
            .bind(champion.entity_id)
            .bind(&champion.entity_name)
            .bind(champion.score)
            .bind(&champion.metric_details)
            .bind(champion.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn champions_for_period(&self, period: NaiveDate) -> StoreResult<Vec<MonthlyChampion>> {
        let rows = sqlx::query(
            "SELECT * FROM monthly_champions WHERE period = $1 ORDER BY entity_type, category",
        )
        .bind(period)
        .fetch_all(&self.pool)
        .await?;
        let mut champions = rows
            .iter()
            .map(champion_from_row)
            .collect::<StoreResult<Vec<_>>>()?;
        champions.sort_by_key(|c| (c.entity_type, c.category));
        Ok(champions)
    }

    async fn insert_sync_log(&self, log: &SyncLog) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_logs (
                id, project_id, sync_type, status, records_processed, records_created,
                records_updated, start_time, end_time, error_message, sync_details
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(log.id)
        .bind(log.project_id)
        .bind(log.sync_type.as_str())
        .bind(log.status.as_str())
        .bind(log.records_processed)
        .bind(log.records_created)
        .bind(log.records_updated)
        .bind(log.start_time)
        .bind(log.end_time)
        .bind(&log.error_message)
        .bind(&log.sync_details)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_sync_log(&self, log: &SyncLog) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_logs
               SET status = $2,
                   records_processed = $3,
                   records_created = $4,
                   records_updated = $5,
                   end_time = $6,
                   error_message = $7,
                   sync_details = $8
             WHERE id = $1 AND status = 'STARTED'
            "#,
        )
        .bind(log.id)
        .bind(log.status.as_str())
        .bind(log.records_processed)
        .bind(log.records_created)
        .bind(log.records_updated)
        .bind(log.end_time)
        .bind(&log.error_message)
        .bind(&log.sync_details)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        match self.find_sync_log(log.id).await? {
            Some(_) => Err(StoreError::SyncLogClosed(log.id)),
            None => Err(StoreError::SyncLogNotFound(log.id)),
        }
    }

    async fn find_sync_log(&self, id: Uuid) -> StoreResult<Option<SyncLog>> {
        sqlx::query("SELECT * FROM sync_logs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(sync_log_from_row)
            .transpose()
    }

    async fn last_successful_project_sync(
        &self,
        project_id: Uuid,
    ) -> StoreResult<Option<SyncLog>> {
        sqlx::query(
            r#"
            SELECT * FROM sync_logs
             WHERE project_id = $1 AND status = 'SUCCESS'
             ORDER BY end_time DESC NULLS LAST
             LIMIT 1
            "#,
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(sync_log_from_row)
        .transpose()
    }

    async fn recent_sync_logs(&self, limit: i64) -> StoreResult<Vec<SyncLog>> {
        let rows = sqlx::query("SELECT * FROM sync_logs ORDER BY start_time DESC LIMIT $1")
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(sync_log_from_row).collect()
    }

    async fn last_run_sync_log(&self) -> StoreResult<Option<SyncLog>> {
        sqlx::query(
            "SELECT * FROM sync_logs WHERE project_id IS NULL ORDER BY start_time DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(sync_log_from_row)
        .transpose()
    }

    async fn latest_remote_config(&self) -> StoreResult<Option<StoredRemoteConfig>> {
        let row = sqlx::query(
            "SELECT base_url, api_token, updated_at FROM remote_api_config ORDER BY updated_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(StoredRemoteConfig {
            base_url: row.try_get("base_url")?,
            api_token: row.try_get("api_token")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn save_remote_config(&self, config: StoredRemoteConfig) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO remote_api_config (base_url, api_token, updated_at) VALUES ($1, $2, $3)",
        )
        .bind(&config.base_url)
        .bind(&config.api_token)
        .bind(config.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
