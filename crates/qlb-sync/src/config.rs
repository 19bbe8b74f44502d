use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use qlb_core::StoredRemoteConfig;
use qlb_remote::{Credentials, GatewayConfig, ThrottleConfig};
use serde::{Deserialize, Serialize};

/// Upper bound on the sync look-back window, about a century.
pub const MAX_HISTORICAL_DAYS: i64 = 36_500;

/// Runtime configuration, built once per process (or per run when a stored
/// remote override applies) and passed down explicitly.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_url: Option<String>,
    pub remote_base_url: String,
    pub remote_token: Option<String>,
    pub remote_username: Option<String>,
    pub remote_password: Option<String>,
    pub page_size: u32,
    pub max_pages: u32,
    pub request_delay_ms: u64,
    pub historical_days: i64,
    pub http_timeout_secs: u64,
    /// Remote request rate cap; 0 disables throttling.
    pub max_requests_per_sec: u32,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub ranking_cron: String,
    pub web_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            remote_base_url: "http://localhost:9000".to_string(),
            remote_token: None,
            remote_username: None,
            remote_password: None,
            page_size: 500,
            max_pages: 100,
            request_delay_ms: 100,
            historical_days: 90,
            http_timeout_secs: 20,
            max_requests_per_sec: 0,
            user_agent: "qlb-sync/0.1".to_string(),
            scheduler_enabled: false,
            sync_cron: "0 0 2 * * *".to_string(),
            ranking_cron: "0 0 3 1 * *".to_string(),
            web_port: 8000,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &self.database_url.as_ref().map(|_| "<set>"))
            .field("remote_base_url", &self.remote_base_url)
            .field("credentials", &self.credentials())
            .field("page_size", &self.page_size)
            .field("max_pages", &self.max_pages)
            .field("request_delay_ms", &self.request_delay_ms)
            .field("historical_days", &self.historical_days)
            .field("max_requests_per_sec", &self.max_requests_per_sec)
            .field("scheduler_enabled", &self.scheduler_enabled)
            .finish_non_exhaustive()
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source; unset or
    /// unparsable values keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        fn parse_with<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            lookup(key).and_then(|v| v.trim().parse().ok())
        }
        Self {
            database_url: lookup("DATABASE_URL"),
            remote_base_url: lookup("QLB_REMOTE_BASE_URL").unwrap_or(defaults.remote_base_url),
            remote_token: lookup("QLB_REMOTE_TOKEN"),
            remote_username: lookup("QLB_REMOTE_USERNAME"),
            remote_password: lookup("QLB_REMOTE_PASSWORD"),
            page_size: parse_with(&lookup, "QLB_PAGE_SIZE")
                .filter(|v: &u32| *v > 0)
                .unwrap_or(defaults.page_size),
            max_pages: parse_with(&lookup, "QLB_MAX_PAGES")
                .filter(|v: &u32| *v > 0)
                .unwrap_or(defaults.max_pages),
            request_delay_ms: parse_with(&lookup, "QLB_REQUEST_DELAY_MS").unwrap_or(defaults.request_delay_ms),
            historical_days: parse_with(&lookup, "QLB_HISTORICAL_DAYS")
                .filter(|v: &i64| *v >= 0)
                .unwrap_or(defaults.historical_days),
            http_timeout_secs: parse_with(&lookup, "QLB_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            max_requests_per_sec: parse_with(&lookup, "QLB_MAX_REQUESTS_PER_SEC")
                .unwrap_or(defaults.max_requests_per_sec),
            user_agent: lookup("QLB_USER_AGENT").unwrap_or(defaults.user_agent),
            scheduler_enabled: lookup("QLB_SCHEDULER_ENABLED")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.scheduler_enabled),
            sync_cron: lookup("QLB_SYNC_CRON").unwrap_or(defaults.sync_cron),
            ranking_cron: lookup("QLB_RANKING_CRON").unwrap_or(defaults.ranking_cron),
            web_port: parse_with(&lookup, "QLB_WEB_PORT").unwrap_or(defaults.web_port),
        }
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_yaml::from_str(&yaml).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Applies a persisted remote-API override: its base URL and token take
    /// precedence over static values when present.
    pub fn with_stored_remote(mut self, stored: Option<StoredRemoteConfig>) -> Self {
        let Some(stored) = stored else {
            return self;
        };
        if !stored.base_url.trim().is_empty() {
            self.remote_base_url = stored.base_url;
        }
        if let Some(token) = stored.api_token.filter(|t| !t.trim().is_empty()) {
            self.remote_token = Some(token);
        }
        self
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::resolve(
            self.remote_token.as_deref(),
            self.remote_username.as_deref(),
            self.remote_password.as_deref(),
        )
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            base_url: self.remote_base_url.clone(),
            credentials: self.credentials(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone(),
            throttle: self.throttle(),
        }
    }

    /// A burst of `max_requests_per_sec`, refilled one slot per
    /// `1s / max_requests_per_sec`.
    fn throttle(&self) -> Option<ThrottleConfig> {
        let rate = self.max_requests_per_sec;
        (rate > 0).then(|| ThrottleConfig {
            burst: rate,
            interval: Duration::from_secs(1) / rate,
        })
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            page_size: self.page_size.max(1),
            max_pages: self.max_pages.max(1),
            request_delay: Duration::from_millis(self.request_delay_ms),
            historical_days: self.historical_days.clamp(0, MAX_HISTORICAL_DAYS),
        }
    }
}

/// The subset of [`Config`] the sync loop needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub page_size: u32,
    pub max_pages: u32,
    pub request_delay: Duration,
    pub historical_days: i64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Config::default().sync_settings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;

    #[test]
    fn env_values_override_defaults_and_bad_values_are_ignored() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("QLB_PAGE_SIZE", "250"),
            ("QLB_MAX_PAGES", "zero"),
            ("QLB_REQUEST_DELAY_MS", "0"),
            ("QLB_SCHEDULER_ENABLED", "true"),
            ("QLB_REMOTE_TOKEN", "tok"),
            ("QLB_MAX_REQUESTS_PER_SEC", "4"),
        ]);
        let config = Config::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.page_size, 250);
        assert_eq!(config.max_pages, 100);
        assert_eq!(config.request_delay_ms, 0);
        assert_eq!(config.historical_days, 90);
        assert!(config.scheduler_enabled);
        assert_eq!(config.sync_cron, "0 0 2 * * *");
        assert_eq!(config.credentials(), Credentials::Token("tok".into()));
        assert_eq!(
            config.gateway_config().throttle,
            Some(ThrottleConfig {
                burst: 4,
                interval: Duration::from_millis(250),
            })
        );
        assert_eq!(Config::default().gateway_config().throttle, None);
    }

    #[test]
    fn look_back_window_is_clamped() {
        let huge = Config {
            historical_days: i64::MAX,
            ..Config::default()
        };
        assert_eq!(huge.sync_settings().historical_days, MAX_HISTORICAL_DAYS);
        let negative = Config {
            historical_days: -3,
            ..Config::default()
        };
        assert_eq!(negative.sync_settings().historical_days, 0);
    }

    #[test]
    fn stored_remote_config_wins_for_url_and_token() {
        let config = Config {
            remote_base_url: "http://static:9000".into(),
            remote_username: Some("admin".into()),
            remote_password: Some("admin".into()),
            ..Config::default()
        };
        let stored = StoredRemoteConfig {
            base_url: "https://sonar.internal".into(),
            api_token: Some("stored-token".into()),
            updated_at: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
        };
        let resolved = config.clone().with_stored_remote(Some(stored));
        assert_eq!(resolved.remote_base_url, "https://sonar.internal");
        assert_eq!(resolved.credentials(), Credentials::Token("stored-token".into()));

        let untouched = config.with_stored_remote(None);
        assert_eq!(untouched.remote_base_url, "http://static:9000");
        assert!(matches!(untouched.credentials(), Credentials::Basic { .. }));
    }

    #[test]
    fn yaml_file_fills_missing_fields_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qlb.yaml");
        std::fs::write(&path, "remote_base_url: https://sonar.example.com\npage_size: 100\n").unwrap();
        let config = Config::from_yaml_file(&path).unwrap();
        assert_eq!(config.remote_base_url, "https://sonar.example.com");
        assert_eq!(config.page_size, 100);
        assert_eq!(config.historical_days, 90);
        assert_eq!(config.web_port, 8000);
    }
}
