//! Client side of the code-quality analysis API: the gateway contract, its
//! wire model, an HTTP implementation and a fixture-backed implementation.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::warn;

mod fixture;
mod http;
mod sonar;

pub use fixture::{load_fixture_bundle, Endpoint, FixtureBundle, FixtureGateway};
pub use http::{
    retryable_status, BasicAuth, FetchError, HttpClientConfig, HttpFetcher, RequestThrottle,
    RetryPolicy, ThrottleConfig,
};
pub use sonar::SonarGateway;

pub const CRATE_NAME: &str = "qlb-remote";

/// Measures requested for the project metrics snapshot.
pub const MEASURE_KEYS: [&str; 7] = [
    "ncloc",
    "bugs",
    "vulnerabilities",
    "code_smells",
    "reliability_rating",
    "security_rating",
    "sqale_rating",
];

#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// One message per record on this page that could not be decoded.
    pub rejected: Vec<String>,
    /// Derived from the server's paging block. Informational only; callers
    /// terminate on page-size undershoot.
    pub has_more: bool,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, has_more: bool) -> Self {
        Self {
            items,
            rejected: Vec::new(),
            has_more,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), false)
    }

    /// Records the server returned on this page, decoded or not.
    pub fn served(&self) -> usize {
        self.items.len() + self.rejected.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteProject {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub qualifier: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteIssue {
    pub key: String,
    #[serde(default)]
    pub rule: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub component: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub line: Option<i32>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub effort: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(rename = "type", default)]
    pub issue_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub creation_date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub update_date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub close_date: Option<DateTime<Utc>>,
}

impl RemoteIssue {
    /// Author login, if the issue has one that is not blank.
    pub fn author_key(&self) -> Option<&str> {
        self.author.as_deref().map(str::trim).filter(|a| !a.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteUser {
    pub login: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Paging {
    pub page_index: u32,
    pub page_size: u32,
    pub total: u64,
}

impl Paging {
    pub fn has_more(&self) -> bool {
        u64::from(self.page_index) * u64::from(self.page_size) < self.total
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComponentSearchResponse {
    #[serde(default)]
    pub paging: Option<Paging>,
    #[serde(default)]
    pub components: Vec<RemoteProject>,
}

/// Body of an issues search; also the accepted payload of a JSON import.
/// Issues stay undecoded here so one malformed record cannot sink the page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueSearchResponse {
    #[serde(default)]
    pub paging: Option<Paging>,
    #[serde(default)]
    pub issues: Vec<serde_json::Value>,
}

impl IssueSearchResponse {
    pub fn into_page(self) -> Page<RemoteIssue> {
        let has_more = self.paging.is_some_and(|p| p.has_more());
        let (items, rejected) = decode_issue_records(self.issues);
        Page {
            items,
            rejected,
            has_more,
        }
    }
}

/// Decodes issue records one by one. Records that fail are logged and
/// returned as messages naming the issue key, or the 1-based position when
/// the key is unreadable.
pub fn decode_issue_records(
    records: Vec<serde_json::Value>,
) -> (Vec<RemoteIssue>, Vec<String>) {
    let mut issues = Vec::with_capacity(records.len());
    let mut rejected = Vec::new();
    for (index, record) in records.into_iter().enumerate() {
        let label = match record.get("key").and_then(serde_json::Value::as_str) {
            Some(key) => key.to_string(),
            None => format!("#{}", index + 1),
        };
        match serde_json::from_value::<RemoteIssue>(record) {
            Ok(issue) => issues.push(issue),
            Err(err) => {
                warn!(issue = %label, error = %err, "skipping malformed issue record");
                rejected.push(format!("issue {label}: malformed record: {err}"));
            }
        }
    }
    (issues, rejected)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MeasuresResponse {
    #[serde(default)]
    pub component: Option<MeasuredComponent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MeasuredComponent {
    #[serde(default)]
    pub measures: Vec<Measure>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Measure {
    pub metric: String,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserSearchResponse {
    #[serde(default)]
    pub users: Vec<RemoteUser>,
}

/// Accepts RFC 3339 and the remote's `+0000` offset form. Anything else is
/// logged and treated as absent.
pub fn parse_remote_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z") {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    warn!(timestamp = raw, "unparsable remote timestamp, treating as absent");
    None
}

/// Formats a watermark the way the issues search expects it.
pub fn format_remote_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%z").to_string()
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_remote_timestamp))
}

#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Token(String),
    Basic { username: String, password: String },
    None,
}

impl Credentials {
    /// A token wins over username/password; blank values count as missing.
    pub fn resolve(
        token: Option<&str>,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Self {
        let present = |v: Option<&str>| v.map(str::trim).filter(|v| !v.is_empty()).map(String::from);
        if let Some(token) = present(token) {
            return Self::Token(token);
        }
        match (present(username), password) {
            (Some(username), password) => Self::Basic {
                username,
                password: password.unwrap_or_default().to_string(),
            },
            (None, _) => Self::None,
        }
    }

    pub fn is_configured(&self) -> bool {
        !matches!(self, Self::None)
    }

    pub fn to_basic_auth(&self) -> Option<BasicAuth> {
        match self {
            Self::Token(token) => Some(BasicAuth::token(token.clone())),
            Self::Basic { username, password } => Some(BasicAuth {
                username: username.clone(),
                password: password.clone(),
            }),
            Self::None => None,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Token(_) => f.write_str("Token(<redacted>)"),
            Self::Basic { username, .. } => write!(f, "Basic({username}, <redacted>)"),
            Self::None => f.write_str("None"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub credentials: Credentials,
    pub timeout: Duration,
    pub user_agent: String,
    /// Client-side request rate cap; `None` sends as fast as pagination asks.
    pub throttle: Option<ThrottleConfig>,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("remote API credentials are not configured")]
    MissingCredentials,
    #[error("invalid remote base url {url}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("remote API rejected the credentials: {0}")]
    Unauthorized(#[source] FetchError),
    #[error(transparent)]
    Fetch(FetchError),
    #[error("remote API unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Injected(String),
}

impl From<FetchError> for GatewayError {
    fn from(err: FetchError) -> Self {
        if err.is_auth_failure() {
            Self::Unauthorized(err)
        } else {
            Self::Fetch(err)
        }
    }
}

/// Contract of the remote analysis service. Pages are 1-based.
#[async_trait]
pub trait RemoteApiGateway: Send + Sync {
    async fn list_projects(
        &self,
        page: u32,
        page_size: u32,
    ) -> Result<Page<RemoteProject>, GatewayError>;

    async fn list_issues(
        &self,
        project_key: &str,
        created_after: Option<DateTime<Utc>>,
        created_before: Option<DateTime<Utc>>,
        page: u32,
        page_size: u32,
    ) -> Result<Page<RemoteIssue>, GatewayError>;

    async fn get_project_measures(
        &self,
        project_key: &str,
    ) -> Result<HashMap<String, String>, GatewayError>;

    /// Exact case-insensitive login match only.
    async fn resolve_user(&self, login: &str) -> Result<Option<RemoteUser>, GatewayError>;
}

/// Stands in for a gateway that could not be built (missing credentials,
/// bad base URL). Every call fails, so the run records the precondition
/// failure in its sync log.
#[derive(Debug, Clone)]
pub struct UnavailableGateway {
    reason: String,
}

impl UnavailableGateway {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn error(&self) -> GatewayError {
        GatewayError::Unavailable(self.reason.clone())
    }
}

#[async_trait]
impl RemoteApiGateway for UnavailableGateway {
    async fn list_projects(&self, _: u32, _: u32) -> Result<Page<RemoteProject>, GatewayError> {
        Err(self.error())
    }

    async fn list_issues(
        &self,
        _: &str,
        _: Option<DateTime<Utc>>,
        _: Option<DateTime<Utc>>,
        _: u32,
        _: u32,
    ) -> Result<Page<RemoteIssue>, GatewayError> {
        Err(self.error())
    }

    async fn get_project_measures(&self, _: &str) -> Result<HashMap<String, String>, GatewayError> {
        Err(self.error())
    }

    async fn resolve_user(&self, _: &str) -> Result<Option<RemoteUser>, GatewayError> {
        Err(self.error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_accept_both_offset_styles() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 5, 10, 15, 0).unwrap();
        assert_eq!(parse_remote_timestamp("2024-03-05T10:15:00+0000"), Some(expected));
        assert_eq!(parse_remote_timestamp("2024-03-05T12:15:00+02:00"), Some(expected));
        assert_eq!(parse_remote_timestamp("2024-03-05T10:15:00Z"), Some(expected));
        assert_eq!(parse_remote_timestamp("yesterday"), None);
        assert_eq!(format_remote_timestamp(expected), "2024-03-05T10:15:00+0000");
    }

    #[test]
    fn issue_payload_tolerates_bad_dates_and_unknown_fields() {
        let issue: RemoteIssue = serde_json::from_value(serde_json::json!({
            "key": "AX-1",
            "type": "BUG",
            "author": "  ",
            "creationDate": "not-a-date",
            "closeDate": "2024-03-06T08:00:00+0000",
            "flows": []
        }))
        .unwrap();
        assert_eq!(issue.issue_type.as_deref(), Some("BUG"));
        assert!(issue.creation_date.is_none());
        assert!(issue.close_date.is_some());
        assert_eq!(issue.author_key(), None);
    }

    #[test]
    fn one_malformed_issue_does_not_sink_the_page() {
        let body: IssueSearchResponse = serde_json::from_value(serde_json::json!({
            "paging": { "pageIndex": 1, "pageSize": 3, "total": 7 },
            "issues": [
                { "key": "AX-1", "type": "BUG" },
                { "key": "AX-2", "line": "forty-two" },
                { "rule": "java:S1" },
                { "key": "AX-4", "effort": "5min" }
            ]
        }))
        .unwrap();
        let page = body.into_page();
        let keys: Vec<_> = page.items.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, ["AX-1", "AX-4"]);
        assert_eq!(page.rejected.len(), 2);
        assert!(page.rejected[0].starts_with("issue AX-2: malformed record"));
        assert!(page.rejected[1].starts_with("issue #3: malformed record"));
        assert_eq!(page.served(), 4);
        assert!(page.has_more);
    }

    #[test]
    fn token_takes_precedence_over_basic_credentials() {
        assert_eq!(
            Credentials::resolve(Some("tok"), Some("admin"), Some("pw")),
            Credentials::Token("tok".into())
        );
        assert_eq!(
            Credentials::resolve(Some(" "), Some("admin"), None),
            Credentials::Basic {
                username: "admin".into(),
                password: String::new()
            }
        );
        assert!(!Credentials::resolve(None, None, Some("pw")).is_configured());
    }

    #[test]
    fn rejected_credentials_are_reported_as_such() {
        let status = |code: u16| FetchError::Status {
            status: code,
            url: "https://sonar.example.com/api/issues/search".into(),
            body: "{}".into(),
        };
        let denied = GatewayError::from(status(401));
        assert!(matches!(denied, GatewayError::Unauthorized(_)));
        assert!(denied.to_string().starts_with("remote API rejected the credentials"));
        assert!(matches!(GatewayError::from(status(403)), GatewayError::Unauthorized(_)));
        assert!(matches!(GatewayError::from(status(500)), GatewayError::Fetch(_)));
    }

    #[test]
    fn paging_reports_more_until_total_is_covered() {
        let paging = Paging {
            page_index: 2,
            page_size: 500,
            total: 1137,
        };
        assert!(paging.has_more());
        let last = Paging {
            page_index: 3,
            ..paging
        };
        assert!(!last.has_more());
    }
}
