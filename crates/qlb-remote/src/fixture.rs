use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    decode_issue_records, GatewayError, Page, RemoteApiGateway, RemoteIssue, RemoteProject,
    RemoteUser,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Endpoint {
    Projects,
    Issues,
    Measures,
    Users,
}

/// Canned remote state: projects, issues keyed by project key, measures
/// keyed by project key, and users. `raw_issues` are served verbatim after
/// the typed ones and decoded like a live response; they ignore date windows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixtureBundle {
    #[serde(default)]
    pub projects: Vec<RemoteProject>,
    #[serde(default)]
    pub issues: BTreeMap<String, Vec<RemoteIssue>>,
    #[serde(default)]
    pub raw_issues: BTreeMap<String, Vec<serde_json::Value>>,
    #[serde(default)]
    pub measures: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub users: Vec<RemoteUser>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FailureRule {
    endpoint: Endpoint,
    page: Option<u32>,
    message: String,
}

/// In-process [`RemoteApiGateway`] serving a [`FixtureBundle`] with the same
/// paging contract as the HTTP gateway.
#[derive(Debug, Default)]
pub struct FixtureGateway {
    bundle: Mutex<FixtureBundle>,
    requests: Mutex<HashMap<Endpoint, usize>>,
    failures: Mutex<Vec<FailureRule>>,
}

impl FixtureGateway {
    pub fn new(bundle: FixtureBundle) -> Self {
        Self {
            bundle: Mutex::new(bundle),
            ..Default::default()
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_fixture_bundle(path)?))
    }

    pub async fn replace_bundle(&self, bundle: FixtureBundle) {
        *self.bundle.lock().await = bundle;
    }

    /// Makes `endpoint` fail, on every page or only the given one.
    pub async fn fail_on(&self, endpoint: Endpoint, page: Option<u32>, message: impl Into<String>) {
        self.failures.lock().await.push(FailureRule {
            endpoint,
            page,
            message: message.into(),
        });
    }

    pub async fn clear_failures(&self) {
        self.failures.lock().await.clear();
    }

    pub async fn request_count(&self, endpoint: Endpoint) -> usize {
        self.requests
            .lock()
            .await
            .get(&endpoint)
            .copied()
            .unwrap_or_default()
    }

    async fn record(&self, endpoint: Endpoint, page: Option<u32>) -> Result<(), GatewayError> {
        *self.requests.lock().await.entry(endpoint).or_default() += 1;
        let failures = self.failures.lock().await;
        let hit = failures
            .iter()
            .find(|f| f.endpoint == endpoint && (f.page.is_none() || f.page == page));
        match hit {
            Some(rule) => Err(GatewayError::Injected(rule.message.clone())),
            None => Ok(()),
        }
    }
}

fn paginate<T: Clone>(items: &[T], page: u32, page_size: u32) -> Page<T> {
    let size = page_size.max(1) as usize;
    let start = (page.max(1) as usize - 1).saturating_mul(size);
    let slice: Vec<T> = items.iter().skip(start).take(size).cloned().collect();
    let has_more = start.saturating_add(slice.len()) < items.len();
    Page::new(slice, has_more)
}

#[async_trait]
impl RemoteApiGateway for FixtureGateway {
    async fn list_projects(
        &self,
        page: u32,
        page_size: u32,
    ) -> Result<Page<RemoteProject>, GatewayError> {
        self.record(Endpoint::Projects, Some(page)).await?;
        let bundle = self.bundle.lock().await;
        Ok(paginate(&bundle.projects, page, page_size))
    }

    async fn list_issues(
        &self,
        project_key: &str,
        created_after: Option<DateTime<Utc>>,
        created_before: Option<DateTime<Utc>>,
        page: u32,
        page_size: u32,
    ) -> Result<Page<RemoteIssue>, GatewayError> {
        self.record(Endpoint::Issues, Some(page)).await?;
        let bundle = self.bundle.lock().await;
        let typed = bundle.issues.get(project_key).map(Vec::as_slice).unwrap_or_default();
        let raw = bundle.raw_issues.get(project_key).map(Vec::as_slice).unwrap_or_default();
        // Issues without a creation date are only served when no window is set.
        let mut matching = Vec::with_capacity(typed.len() + raw.len());
        for issue in typed.iter().filter(|issue| match issue.creation_date {
            Some(created) => {
                created_after.map_or(true, |after| created >= after)
                    && created_before.map_or(true, |before| created < before)
            }
            None => created_after.is_none() && created_before.is_none(),
        }) {
            let record = serde_json::to_value(issue)
                .map_err(|err| GatewayError::Unavailable(format!("encoding fixture issue: {err}")))?;
            matching.push(record);
        }
        matching.extend(raw.iter().cloned());

        let served = paginate(&matching, page, page_size);
        let (items, rejected) = decode_issue_records(served.items);
        Ok(Page {
            items,
            rejected,
            has_more: served.has_more,
        })
    }

    async fn get_project_measures(
        &self,
        project_key: &str,
    ) -> Result<HashMap<String, String>, GatewayError> {
        self.record(Endpoint::Measures, None).await?;
        let bundle = self.bundle.lock().await;
        Ok(bundle
            .measures
            .get(project_key)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn resolve_user(&self, login: &str) -> Result<Option<RemoteUser>, GatewayError> {
        self.record(Endpoint::Users, None).await?;
        let bundle = self.bundle.lock().await;
        Ok(bundle
            .users
            .iter()
            .find(|u| u.login.eq_ignore_ascii_case(login))
            .cloned())
    }
}
