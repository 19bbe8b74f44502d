use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use tracing::debug;

use crate::http::{HttpClientConfig, HttpFetcher};
use crate::{
    format_remote_timestamp, ComponentSearchResponse, GatewayConfig, GatewayError,
    IssueSearchResponse, MeasuresResponse, Page, RemoteApiGateway, RemoteIssue, RemoteProject,
    RemoteUser, UserSearchResponse, MEASURE_KEYS,
};

/// HTTP gateway for a SonarQube-compatible analysis server.
#[derive(Debug)]
pub struct SonarGateway {
    base_url: Url,
    http: HttpFetcher,
}

impl SonarGateway {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let auth = config
            .credentials
            .to_basic_auth()
            .ok_or(GatewayError::MissingCredentials)?;
        let base_url = parse_base_url(&config.base_url)?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.timeout,
            user_agent: Some(config.user_agent.clone()),
            throttle: config.throttle,
            auth: Some(auth),
            ..Default::default()
        })
        .map_err(|err| GatewayError::InvalidBaseUrl {
            url: config.base_url.clone(),
            reason: format!("{err:#}"),
        })?;
        Ok(Self { base_url, http })
    }

    fn endpoint(&self, path: &str, params: &[(&str, String)]) -> Result<Url, GatewayError> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|err| GatewayError::InvalidBaseUrl {
                url: self.base_url.to_string(),
                reason: err.to_string(),
            })?;
        {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in params {
                pairs.append_pair(name, value);
            }
        }
        Ok(url)
    }
}

/// Normalises the base URL so relative endpoint paths join under it.
fn parse_base_url(raw: &str) -> Result<Url, GatewayError> {
    let trimmed = raw.trim();
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    };
    Url::parse(&with_slash).map_err(|err| GatewayError::InvalidBaseUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })
}

#[async_trait]
impl RemoteApiGateway for SonarGateway {
    async fn list_projects(
        &self,
        page: u32,
        page_size: u32,
    ) -> Result<Page<RemoteProject>, GatewayError> {
        let url = self.endpoint(
            "api/components/search",
            &[
                ("qualifiers", "TRK".to_string()),
                ("p", page.to_string()),
                ("ps", page_size.to_string()),
            ],
        )?;
        let body: ComponentSearchResponse = self.http.get_json(url.as_str()).await?;
        debug!(page, count = body.components.len(), "fetched project page");
        Ok(Page::new(
            body.components,
            body.paging.is_some_and(|p| p.has_more()),
        ))
    }

    async fn list_issues(
        &self,
        project_key: &str,
        created_after: Option<DateTime<Utc>>,
        created_before: Option<DateTime<Utc>>,
        page: u32,
        page_size: u32,
    ) -> Result<Page<RemoteIssue>, GatewayError> {
        let mut params = vec![("componentKeys", project_key.to_string())];
        if let Some(after) = created_after {
            params.push(("createdAfter", format_remote_timestamp(after)));
        }
        if let Some(before) = created_before {
            params.push(("createdBefore", format_remote_timestamp(before)));
        }
        params.push(("p", page.to_string()));
        params.push(("ps", page_size.to_string()));

        let url = self.endpoint("api/issues/search", &params)?;
        let body: IssueSearchResponse = self.http.get_json(url.as_str()).await?;
        let page_of_issues = body.into_page();
        debug!(
            project_key,
            page,
            count = page_of_issues.items.len(),
            rejected = page_of_issues.rejected.len(),
            "fetched issue page"
        );
        Ok(page_of_issues)
    }

    async fn get_project_measures(
        &self,
        project_key: &str,
    ) -> Result<HashMap<String, String>, GatewayError> {
        let url = self.endpoint(
            "api/measures/component",
            &[
                ("component", project_key.to_string()),
                ("metricKeys", MEASURE_KEYS.join(",")),
            ],
        )?;
        let body: MeasuresResponse = self.http.get_json(url.as_str()).await?;
        Ok(body
            .component
            .map(|c| c.measures)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| m.value.map(|v| (m.metric, v)))
            .collect())
    }

    async fn resolve_user(&self, login: &str) -> Result<Option<RemoteUser>, GatewayError> {
        let url = self.endpoint("api/users/search", &[("q", login.to_string())])?;
        let body: UserSearchResponse = self.http.get_json(url.as_str()).await?;
        Ok(body
            .users
            .into_iter()
            .find(|u| u.login.eq_ignore_ascii_case(login)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Credentials;
    use std::time::Duration;

    fn config(base_url: &str, credentials: Credentials) -> GatewayConfig {
        GatewayConfig {
            base_url: base_url.to_string(),
            credentials,
            timeout: Duration::from_secs(5),
            user_agent: "qlb-test".into(),
            throttle: None,
        }
    }

    #[test]
    fn missing_credentials_is_rejected_up_front() {
        let err = SonarGateway::new(config("https://sonar.example.com", Credentials::None))
            .unwrap_err();
        assert!(matches!(err, GatewayError::MissingCredentials));
    }

    #[test]
    fn endpoints_join_under_base_path() {
        let gateway = SonarGateway::new(config(
            "https://ci.example.com/sonar",
            Credentials::Token("t".into()),
        ))
        .unwrap();
        let url = gateway
            .endpoint(
                "api/issues/search",
                &[("componentKeys", "my:proj".into()), ("p", "2".into())],
            )
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://ci.example.com/sonar/api/issues/search?componentKeys=my%3Aproj&p=2"
        );
    }

    #[test]
    fn malformed_base_url_is_reported() {
        let err = SonarGateway::new(config("not a url", Credentials::Token("t".into())))
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidBaseUrl { .. }));
    }
}
