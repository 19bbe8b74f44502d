//! Core domain model for the quality leaderboard: synced entities, metrics
//! snapshots, ranking snapshots, champions and the sync audit trail.

use std::fmt;

use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "qlb-core";

/// Rank assigned to entities that do not qualify for a density category.
pub const SENTINEL_RANK: i32 = 999;

/// Minimum KLOC before Code Rock / Code Shield / Craftsman rank an entity.
pub const QUALIFYING_KLOC: f64 = 1.0;

/// Lines of code credited per introduced issue. True SCM attribution is not
/// available, so daily snapshots carry this proxy instead of a measured value.
pub const LOC_PER_ISSUE: i32 = 50;

/// Minutes in one working day when parsing remote effort strings.
pub const MINUTES_PER_DAY: i32 = 480;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Blocker,
    Critical,
    Major,
    Minor,
    Info,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blocker => "BLOCKER",
            Self::Critical => "CRITICAL",
            Self::Major => "MAJOR",
            Self::Minor => "MINOR",
            Self::Info => "INFO",
        }
    }

    /// Missing or unknown values fall back to `MAJOR`.
    pub fn from_remote(value: Option<&str>) -> Self {
        let Some(raw) = non_blank(value) else {
            return Self::Major;
        };
        match raw.to_ascii_uppercase().as_str() {
            "BLOCKER" => Self::Blocker,
            "CRITICAL" => Self::Critical,
            "MAJOR" => Self::Major,
            "MINOR" => Self::Minor,
            "INFO" => Self::Info,
            _ => {
                warn!(severity = raw, "unknown severity, defaulting to MAJOR");
                Self::Major
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueType {
    Bug,
    Vulnerability,
    CodeSmell,
}

impl IssueType {
    pub const ALL: [IssueType; 3] = [Self::Bug, Self::Vulnerability, Self::CodeSmell];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bug => "BUG",
            Self::Vulnerability => "VULNERABILITY",
            Self::CodeSmell => "CODE_SMELL",
        }
    }

    /// Missing or unknown values fall back to `CODE_SMELL`.
    pub fn from_remote(value: Option<&str>) -> Self {
        let Some(raw) = non_blank(value) else {
            return Self::CodeSmell;
        };
        match raw.to_ascii_uppercase().as_str() {
            "BUG" => Self::Bug,
            "VULNERABILITY" => Self::Vulnerability,
            "CODE_SMELL" => Self::CodeSmell,
            _ => {
                warn!(issue_type = raw, "unknown issue type, defaulting to CODE_SMELL");
                Self::CodeSmell
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueStatus {
    Open,
    Confirmed,
    Reopened,
    Resolved,
    Closed,
}

impl IssueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Confirmed => "CONFIRMED",
            Self::Reopened => "REOPENED",
            Self::Resolved => "RESOLVED",
            Self::Closed => "CLOSED",
        }
    }

    /// Missing or unknown values fall back to `OPEN`.
    pub fn from_remote(value: Option<&str>) -> Self {
        let Some(raw) = non_blank(value) else {
            return Self::Open;
        };
        match raw.to_ascii_uppercase().as_str() {
            "OPEN" => Self::Open,
            "CONFIRMED" => Self::Confirmed,
            "REOPENED" => Self::Reopened,
            "RESOLVED" => Self::Resolved,
            "CLOSED" => Self::Closed,
            _ => {
                warn!(status = raw, "unknown issue status, defaulting to OPEN");
                Self::Open
            }
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub project_key: String,
    pub name: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Developer {
    pub id: Uuid,
    pub author_key: String,
    pub display_name: String,
    pub email: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDeveloper {
    pub author_key: String,
    pub display_name: String,
    pub email: Option<String>,
}

/// Remote issue state mapped onto local references, ready to be upserted by
/// `issue_key`. Every mutable field overwrites the stored row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueDraft {
    pub issue_key: String,
    pub project_id: Uuid,
    pub developer_id: Option<Uuid>,
    pub rule_key: Option<String>,
    pub severity: Severity,
    pub issue_type: IssueType,
    pub status: IssueStatus,
    pub component_path: Option<String>,
    pub line_number: Option<i32>,
    pub message: Option<String>,
    pub effort_minutes: i32,
    pub created_date: Option<DateTime<Utc>>,
    pub updated_date: Option<DateTime<Utc>>,
    pub resolved_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: Uuid,
    pub issue_key: String,
    pub project_id: Uuid,
    pub developer_id: Option<Uuid>,
    pub rule_key: Option<String>,
    pub severity: Severity,
    pub issue_type: IssueType,
    pub status: IssueStatus,
    pub component_path: Option<String>,
    pub line_number: Option<i32>,
    pub message: Option<String>,
    pub effort_minutes: i32,
    pub created_date: Option<DateTime<Utc>>,
    pub updated_date: Option<DateTime<Utc>>,
    pub resolved_date: Option<DateTime<Utc>>,
}

impl Issue {
    pub fn from_draft(id: Uuid, draft: IssueDraft) -> Self {
        Self {
            id,
            issue_key: draft.issue_key,
            project_id: draft.project_id,
            developer_id: draft.developer_id,
            rule_key: draft.rule_key,
            severity: draft.severity,
            issue_type: draft.issue_type,
            status: draft.status,
            component_path: draft.component_path,
            line_number: draft.line_number,
            message: draft.message,
            effort_minutes: draft.effort_minutes,
            created_date: draft.created_date,
            updated_date: draft.updated_date,
            resolved_date: draft.resolved_date,
        }
    }

    pub fn created_on(&self, date: NaiveDate) -> bool {
        self.created_date.map(|d| d.date_naive()) == Some(date)
    }

    pub fn resolved_on(&self, date: NaiveDate) -> bool {
        self.resolved_date.map(|d| d.date_naive()) == Some(date)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// Introduced/resolved counters shared by daily snapshots and monthly totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueTally {
    pub violations_introduced: i32,
    pub violations_resolved: i32,
    pub bugs_introduced: i32,
    pub vulnerabilities_introduced: i32,
    pub code_smells_introduced: i32,
}

impl IssueTally {
    pub fn record_introduced(&mut self, issue_type: IssueType) {
        self.violations_introduced += 1;
        match issue_type {
            IssueType::Bug => self.bugs_introduced += 1,
            IssueType::Vulnerability => self.vulnerabilities_introduced += 1,
            IssueType::CodeSmell => self.code_smells_introduced += 1,
        }
    }

    pub fn record_resolved(&mut self) {
        self.violations_resolved += 1;
    }

    pub fn merge(&mut self, other: &IssueTally) {
        self.violations_introduced += other.violations_introduced;
        self.violations_resolved += other.violations_resolved;
        self.bugs_introduced += other.bugs_introduced;
        self.vulnerabilities_introduced += other.vulnerabilities_introduced;
        self.code_smells_introduced += other.code_smells_introduced;
    }

    pub fn introduced_of(&self, issue_type: IssueType) -> i32 {
        match issue_type {
            IssueType::Bug => self.bugs_introduced,
            IssueType::Vulnerability => self.vulnerabilities_introduced,
            IssueType::CodeSmell => self.code_smells_introduced,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeveloperMetricsDaily {
    pub developer_id: Uuid,
    pub project_id: Uuid,
    pub date_recorded: NaiveDate,
    #[serde(flatten)]
    pub tally: IssueTally,
    pub lines_of_code_contributed: i32,
}

impl DeveloperMetricsDaily {
    pub fn empty(developer_id: Uuid, project_id: Uuid, date_recorded: NaiveDate) -> Self {
        Self {
            developer_id,
            project_id,
            date_recorded,
            tally: IssueTally::default(),
            lines_of_code_contributed: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectMetricsDaily {
    pub project_id: Uuid,
    pub date_recorded: NaiveDate,
    pub lines_of_code: i64,
    pub bugs_count: i32,
    pub vulnerabilities_count: i32,
    pub code_smells_count: i32,
    pub reliability_rating: f64,
    pub security_rating: f64,
    pub maintainability_rating: f64,
}

impl ProjectMetricsDaily {
    pub fn kloc(&self) -> f64 {
        if self.lines_of_code <= 0 {
            return 0.0;
        }
        round_half_up(self.lines_of_code as f64 / 1000.0, 2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    DefectTerminator,
    CodeRock,
    CodeShield,
    Craftsman,
    Climber,
}

impl Category {
    /// Categories ranked for both individuals and projects.
    pub const BASE: [Category; 4] = [
        Self::DefectTerminator,
        Self::CodeRock,
        Self::CodeShield,
        Self::Craftsman,
    ];

    pub const DENSITY: [Category; 3] = [Self::CodeRock, Self::CodeShield, Self::Craftsman];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DefectTerminator => "DEFECT_TERMINATOR",
            Self::CodeRock => "CODE_ROCK",
            Self::CodeShield => "CODE_SHIELD",
            Self::Craftsman => "CRAFTSMAN",
            Self::Climber => "CLIMBER",
        }
    }

    pub fn slug(self) -> &'static str {
        match self {
            Self::DefectTerminator => "defect-terminator",
            Self::CodeRock => "code-rock",
            Self::CodeShield => "code-shield",
            Self::Craftsman => "craftsman",
            Self::Climber => "climber",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        match slug.to_ascii_lowercase().as_str() {
            "defect-terminator" => Some(Self::DefectTerminator),
            "code-rock" => Some(Self::CodeRock),
            "code-shield" => Some(Self::CodeShield),
            "craftsman" => Some(Self::Craftsman),
            "climber" => Some(Self::Climber),
            _ => None,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "DEFECT_TERMINATOR" => Some(Self::DefectTerminator),
            "CODE_ROCK" => Some(Self::CodeRock),
            "CODE_SHIELD" => Some(Self::CodeShield),
            "CRAFTSMAN" => Some(Self::Craftsman),
            "CLIMBER" => Some(Self::Climber),
            _ => None,
        }
    }

    pub fn requires_kloc(self) -> bool {
        Self::DENSITY.contains(&self)
    }

    /// The issue type whose density a category measures.
    pub fn density_issue_type(self) -> Option<IssueType> {
        match self {
            Self::CodeRock => Some(IssueType::Bug),
            Self::CodeShield => Some(IssueType::Vulnerability),
            Self::Craftsman => Some(IssueType::CodeSmell),
            _ => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Individual,
    Project,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Individual => "INDIVIDUAL",
            Self::Project => "PROJECT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "INDIVIDUAL" => Some(Self::Individual),
            "PROJECT" => Some(Self::Project),
            _ => None,
        }
    }
}

/// Raw scores and ranks for the four categories shared by individual and
/// project snapshots.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CategoryScores {
    #[serde(flatten)]
    pub tally: IssueTally,
    pub total_kloc: f64,
    pub defect_terminator_score: i32,
    pub defect_terminator_rank: i32,
    pub code_rock_score: f64,
    pub code_rock_rank: i32,
    pub code_shield_score: f64,
    pub code_shield_rank: i32,
    pub craftsman_score: f64,
    pub craftsman_rank: i32,
}

impl CategoryScores {
    pub fn is_qualified(&self) -> bool {
        self.total_kloc >= QUALIFYING_KLOC
    }

    pub fn score(&self, category: Category) -> Option<f64> {
        match category {
            Category::DefectTerminator => Some(f64::from(self.defect_terminator_score)),
            Category::CodeRock => Some(self.code_rock_score),
            Category::CodeShield => Some(self.code_shield_score),
            Category::Craftsman => Some(self.craftsman_score),
            Category::Climber => None,
        }
    }

    pub fn rank(&self, category: Category) -> Option<i32> {
        match category {
            Category::DefectTerminator => Some(self.defect_terminator_rank),
            Category::CodeRock => Some(self.code_rock_rank),
            Category::CodeShield => Some(self.code_shield_rank),
            Category::Craftsman => Some(self.craftsman_rank),
            Category::Climber => None,
        }
    }

    pub fn set_rank(&mut self, category: Category, rank: i32) {
        match category {
            Category::DefectTerminator => self.defect_terminator_rank = rank,
            Category::CodeRock => self.code_rock_rank = rank,
            Category::CodeShield => self.code_shield_rank = rank,
            Category::Craftsman => self.craftsman_rank = rank,
            Category::Climber => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndividualRanking {
    pub id: Uuid,
    pub developer_id: Uuid,
    pub ranking_period: NaiveDate,
    #[serde(flatten)]
    pub scores: CategoryScores,
    pub climber_score: f64,
    pub climber_rank: i32,
}

impl IndividualRanking {
    /// Stable row id so recomputing a period rewrites identical rows.
    pub fn snapshot_id(developer_id: Uuid, period: NaiveDate) -> Uuid {
        Uuid::new_v5(
            &Uuid::NAMESPACE_OID,
            format!("individual:{developer_id}:{period}").as_bytes(),
        )
    }

    pub fn rank(&self, category: Category) -> i32 {
        match category {
            Category::Climber => self.climber_rank,
            other => self.scores.rank(other).unwrap_or(SENTINEL_RANK),
        }
    }

    pub fn score(&self, category: Category) -> f64 {
        match category {
            Category::Climber => self.climber_score,
            other => self.scores.score(other).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRanking {
    pub id: Uuid,
    pub project_id: Uuid,
    pub ranking_period: NaiveDate,
    #[serde(flatten)]
    pub scores: CategoryScores,
}

impl ProjectRanking {
    pub fn snapshot_id(project_id: Uuid, period: NaiveDate) -> Uuid {
        Uuid::new_v5(
            &Uuid::NAMESPACE_OID,
            format!("project:{project_id}:{period}").as_bytes(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyChampion {
    pub id: Uuid,
    pub period: NaiveDate,
    pub category: Category,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub entity_name: String,
    pub score: f64,
    pub metric_details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl MonthlyChampion {
    pub fn champion_id(period: NaiveDate, category: Category, entity_type: EntityType) -> Uuid {
        Uuid::new_v5(
            &Uuid::NAMESPACE_OID,
            format!("champion:{period}:{category}:{}", entity_type.as_str()).as_bytes(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncType {
    Full,
    Incremental,
    Manual,
}

impl SyncType {
    pub fn for_run(full_sync: bool) -> Self {
        if full_sync {
            Self::Full
        } else {
            Self::Incremental
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "FULL",
            Self::Incremental => "INCREMENTAL",
            Self::Manual => "MANUAL",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "FULL" => Some(Self::Full),
            "INCREMENTAL" => Some(Self::Incremental),
            "MANUAL" => Some(Self::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Started,
    Success,
    Failed,
    Partial,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "STARTED",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Partial => "PARTIAL",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "STARTED" => Some(Self::Started),
            "SUCCESS" => Some(Self::Success),
            "FAILED" => Some(Self::Failed),
            "PARTIAL" => Some(Self::Partial),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Started)
    }
}

/// Audit record for one sync run. Created as `STARTED`, closed exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLog {
    pub id: Uuid,
    pub project_id: Option<Uuid>,
    pub sync_type: SyncType,
    pub status: SyncStatus,
    pub records_processed: i32,
    pub records_created: i32,
    pub records_updated: i32,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub sync_details: Option<serde_json::Value>,
}

impl SyncLog {
    pub fn started(project_id: Option<Uuid>, sync_type: SyncType, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            sync_type,
            status: SyncStatus::Started,
            records_processed: 0,
            records_created: 0,
            records_updated: 0,
            start_time: now,
            end_time: None,
            error_message: None,
            sync_details: None,
        }
    }

    /// Moves the log into a terminal state. A log that is already terminal is
    /// left untouched and `false` is returned.
    pub fn finish(&mut self, status: SyncStatus, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.end_time = Some(now);
        true
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds())
    }
}

/// Remote API settings persisted by an administrator; takes precedence over
/// static configuration when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRemoteConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub updated_at: DateTime<Utc>,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// First day of the month containing `date`.
pub fn period_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

pub fn previous_period(period: NaiveDate) -> NaiveDate {
    let start = period_start(period);
    start.checked_sub_months(Months::new(1)).unwrap_or(start)
}

pub fn next_period(period: NaiveDate) -> NaiveDate {
    let start = period_start(period);
    start.checked_add_months(Months::new(1)).unwrap_or(start)
}

/// Last calendar day of the period.
pub fn period_end(period: NaiveDate) -> NaiveDate {
    next_period(period).pred_opt().unwrap_or(period)
}

/// Half-open UTC instant range `[first day 00:00, next month 00:00)`.
pub fn period_bounds(period: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    (start_of_day(period_start(period)), start_of_day(next_period(period)))
}

pub fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

/// Rounds half away from zero at `places` decimals. A tiny nudge keeps values
/// such as 1.005 from rounding down due to binary representation.
pub fn round_half_up(value: f64, places: i32) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    let factor = 10f64.powi(places);
    let scaled = value * factor;
    let nudged = scaled + scaled.signum() * 1e-9;
    nudged.round() / factor
}

/// Parses compound durations such as `1h30min`, `2d` or `10min` into minutes.
/// Empty, absent, unrecognised or out-of-range input yields 0.
pub fn parse_effort_minutes(effort: Option<&str>) -> i32 {
    let Some(raw) = non_blank(effort) else {
        return 0;
    };
    let lower = raw.to_ascii_lowercase();
    let mut total: i64 = 0;
    let mut digits = String::new();
    let mut unit = String::new();

    let mut flush = |digits: &mut String, unit: &mut String| -> Option<()> {
        if digits.is_empty() {
            return if unit.is_empty() { Some(()) } else { None };
        }
        let amount: i64 = digits.parse().ok()?;
        let factor = match unit.as_str() {
            "d" => i64::from(MINUTES_PER_DAY),
            "h" => 60,
            "min" | "m" | "" => 1,
            _ => return None,
        };
        total = amount.checked_mul(factor).and_then(|m| total.checked_add(m))?;
        digits.clear();
        unit.clear();
        Some(())
    };

    for ch in lower.chars() {
        if ch.is_ascii_digit() {
            if !unit.is_empty() && flush(&mut digits, &mut unit).is_none() {
                return 0;
            }
            digits.push(ch);
        } else if ch.is_ascii_alphabetic() {
            unit.push(ch);
        } else if !ch.is_whitespace() {
            return 0;
        }
    }
    if flush(&mut digits, &mut unit).is_none() {
        return 0;
    }
    i32::try_from(total).unwrap_or(0)
}

/// Derives a readable name from an author key: `john.doe` -> `John Doe`.
/// Any e-mail domain is dropped first.
pub fn format_display_name(author_key: &str) -> String {
    let local = author_key.split('@').next().unwrap_or_default();
    let name = local
        .split(['.', '_', '-'])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ");
    if name.is_empty() {
        "Unknown".to_string()
    } else {
        name
    }
}

/// Converts a raw `ncloc` measure into KLOC (2 decimals, half-up). Absent or
/// unparsable measures yield zero.
pub fn kloc_from_ncloc(ncloc: Option<&str>) -> f64 {
    let Some(raw) = non_blank(ncloc) else {
        return 0.0;
    };
    match raw.parse::<f64>() {
        Ok(lines) if lines.is_finite() && lines > 0.0 => round_half_up(lines / 1000.0, 2),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn effort_strings_parse_to_minutes() {
        assert_eq!(parse_effort_minutes(Some("1h30min")), 90);
        assert_eq!(parse_effort_minutes(Some("45min")), 45);
        assert_eq!(parse_effort_minutes(Some("10min")), 10);
        assert_eq!(parse_effort_minutes(Some("2d")), 960);
        assert_eq!(parse_effort_minutes(Some("1d2h30min")), 630);
        assert_eq!(parse_effort_minutes(Some("")), 0);
        assert_eq!(parse_effort_minutes(None), 0);
        assert_eq!(parse_effort_minutes(Some("soon")), 0);
        assert_eq!(parse_effort_minutes(Some("5x")), 0);
    }

    #[test]
    fn oversized_efforts_are_treated_as_unparseable() {
        // Fits i64 but overflows once scaled to minutes.
        assert_eq!(parse_effort_minutes(Some("99999999999999999d")), 0);
        assert_eq!(parse_effort_minutes(Some("9000000000000000000h")), 0);
        // Too many digits for i64.
        assert_eq!(parse_effort_minutes(Some("99999999999999999999min")), 0);
        // Sum overflows across components.
        assert_eq!(parse_effort_minutes(Some("9223372036854775807min1min")), 0);
        // Fits i64 but not the i32 column.
        assert_eq!(parse_effort_minutes(Some("5000000d")), 0);
        assert_eq!(parse_effort_minutes(Some("4473924d")), 2_147_483_520);
    }

    #[test]
    fn display_name_falls_back_to_key_format() {
        assert_eq!(format_display_name("john.doe"), "John Doe");
        assert_eq!(format_display_name("MARY_ann-smith"), "Mary Ann Smith");
        assert_eq!(format_display_name("jdoe@example.com"), "Jdoe");
        assert_eq!(format_display_name(""), "Unknown");
        assert_eq!(format_display_name("..."), "Unknown");
    }

    #[test]
    fn unknown_enum_values_use_documented_fallbacks() {
        assert_eq!(Severity::from_remote(Some("critical")), Severity::Critical);
        assert_eq!(Severity::from_remote(Some("HIGH")), Severity::Major);
        assert_eq!(Severity::from_remote(None), Severity::Major);
        assert_eq!(IssueType::from_remote(Some("bug")), IssueType::Bug);
        assert_eq!(IssueType::from_remote(Some("SECURITY_HOTSPOT")), IssueType::CodeSmell);
        assert_eq!(IssueType::from_remote(Some("")), IssueType::CodeSmell);
        assert_eq!(IssueStatus::from_remote(Some("Closed")), IssueStatus::Closed);
        assert_eq!(IssueStatus::from_remote(Some("ACCEPTED")), IssueStatus::Open);
    }

    #[test]
    fn kloc_is_rounded_half_up() {
        assert_eq!(kloc_from_ncloc(Some("12345")), 12.35);
        assert_eq!(kloc_from_ncloc(Some("1005")), 1.01);
        assert_eq!(kloc_from_ncloc(Some("500")), 0.5);
        assert_eq!(kloc_from_ncloc(Some("n/a")), 0.0);
        assert_eq!(kloc_from_ncloc(None), 0.0);
    }

    #[test]
    fn periods_normalize_to_first_of_month() {
        let d = NaiveDate::from_ymd_opt(2024, 3, 17).unwrap();
        assert_eq!(period_start(d), NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        assert_eq!(previous_period(d), NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
        assert_eq!(period_end(d), NaiveDate::from_ymd_opt(2024, 3, 31).unwrap());
        assert_eq!(
            previous_period(NaiveDate::from_ymd_opt(2024, 1, 9).unwrap()),
            NaiveDate::from_ymd_opt(2023, 12, 1).unwrap()
        );
        let (from, to) = period_bounds(d);
        assert_eq!(from, Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
        assert_eq!(to, Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn sync_log_terminal_status_is_never_reopened() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 3, 1, 2, 5, 0).unwrap();
        let mut log = SyncLog::started(None, SyncType::Full, t0);
        assert!(log.finish(SyncStatus::Success, t1));
        assert!(!log.finish(SyncStatus::Failed, t1));
        assert_eq!(log.status, SyncStatus::Success);
        assert_eq!(log.duration_ms(), Some(300_000));
    }

    #[test]
    fn tally_buckets_by_issue_type() {
        let mut tally = IssueTally::default();
        tally.record_introduced(IssueType::Bug);
        tally.record_introduced(IssueType::CodeSmell);
        tally.record_introduced(IssueType::CodeSmell);
        tally.record_resolved();
        assert_eq!(tally.violations_introduced, 3);
        assert_eq!(tally.bugs_introduced, 1);
        assert_eq!(tally.code_smells_introduced, 2);
        assert_eq!(tally.violations_resolved, 1);
        assert_eq!(tally.introduced_of(IssueType::Vulnerability), 0);
    }
}
