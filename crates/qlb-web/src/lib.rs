//! Axum JSON API over the leaderboard: exposed sync, ranking and import
//! triggers plus read-only ranking, champion and sync-log queries.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use qlb_core::{period_start, Category, EntityType, SyncStatus, SyncType};
use qlb_storage::StoreError;
use qlb_sync::{Leaderboard, PipelineError};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "qlb-web";

const DEFAULT_LOG_LIMIT: i64 = 20;
const MAX_LOG_LIMIT: i64 = 200;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<Leaderboard>,
}

impl AppState {
    pub fn new(service: Arc<Leaderboard>) -> Self {
        Self { service }
    }
}

#[derive(Debug, Default, Deserialize)]
struct MonthQuery {
    month: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Top3Query {
    month: Option<String>,
    #[serde(rename = "type")]
    entity_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SyncQuery {
    #[serde(rename = "fullSync", default)]
    full_sync: bool,
}

#[derive(Debug, Default, Deserialize)]
struct LogsQuery {
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChampionsView {
    month: NaiveDate,
    individual_champions: Vec<qlb_core::MonthlyChampion>,
    project_champions: Vec<qlb_core::MonthlyChampion>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncStatusView {
    last_sync_time: Option<DateTime<Utc>>,
    last_sync_status: Option<SyncStatus>,
    last_sync_type: Option<SyncType>,
    last_sync_duration_ms: Option<i64>,
    total_projects: i64,
    active_projects: i64,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/rankings/individual", get(individual_rankings_handler))
        .route("/api/rankings/project", get(project_rankings_handler))
        .route("/api/rankings/top3/{category}", get(top3_handler))
        .route("/api/rankings/champions", get(champions_handler))
        .route("/api/rankings/calculate", post(calculate_handler))
        .route("/api/sync/logs", get(sync_logs_handler))
        .route("/api/sync/logs/{id}", get(sync_log_handler))
        .route("/api/sync/status", get(sync_status_handler))
        .route("/api/sync/all", post(sync_all_handler))
        .route("/api/sync/project/{project_key}", post(sync_project_handler))
        .route("/api/import", post(import_handler))
        .with_state(Arc::new(state))
}

/// Serves the API on `0.0.0.0:port` until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "leaderboard api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn individual_rankings_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MonthQuery>,
) -> Response {
    let period = match requested_period(&state, query.month.as_deref()) {
        Ok(period) => period,
        Err(resp) => return resp,
    };
    match state.service.store().individual_rankings_for_period(period).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => store_error(err),
    }
}

async fn project_rankings_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MonthQuery>,
) -> Response {
    let period = match requested_period(&state, query.month.as_deref()) {
        Ok(period) => period,
        Err(resp) => return resp,
    };
    match state.service.store().project_rankings_for_period(period).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => store_error(err),
    }
}

async fn top3_handler(
    State(state): State<Arc<AppState>>,
    Path(category): Path<String>,
    Query(query): Query<Top3Query>,
) -> Response {
    let Some(category) = Category::from_slug(&category).or_else(|| Category::parse(&category))
    else {
        return bad_request(format!("unknown category {category}"));
    };
    let entity_type = match query.entity_type.as_deref() {
        None => EntityType::Individual,
        Some(raw) => match EntityType::parse(raw) {
            Some(entity_type) => entity_type,
            None => return bad_request(format!("unknown entity type {raw}")),
        },
    };
    let period = match requested_period(&state, query.month.as_deref()) {
        Ok(period) => period,
        Err(resp) => return resp,
    };
    let store = state.service.store();

    match entity_type {
        EntityType::Individual => match store.individual_rankings_for_period(period).await {
            Ok(rows) => {
                let mut top: Vec<_> = rows
                    .into_iter()
                    .filter(|row| row.rank(category) <= 3)
                    .collect();
                top.sort_by_key(|row| row.rank(category));
                Json(top).into_response()
            }
            Err(err) => store_error(err),
        },
        EntityType::Project => {
            if category == Category::Climber {
                return bad_request("climber is ranked for individuals only".into());
            }
            match store.project_rankings_for_period(period).await {
                Ok(rows) => {
                    let rank = |row: &qlb_core::ProjectRanking| {
                        row.scores.rank(category).unwrap_or(qlb_core::SENTINEL_RANK)
                    };
                    let mut top: Vec<_> = rows.into_iter().filter(|row| rank(row) <= 3).collect();
                    top.sort_by_key(|row| rank(row));
                    Json(top).into_response()
                }
                Err(err) => store_error(err),
            }
        }
    }
}

async fn champions_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MonthQuery>,
) -> Response {
    let period = match requested_period(&state, query.month.as_deref()) {
        Ok(period) => period,
        Err(resp) => return resp,
    };
    match state.service.store().champions_for_period(period).await {
        Ok(champions) => {
            let (individual_champions, project_champions): (Vec<_>, Vec<_>) = champions
                .into_iter()
                .partition(|c| c.entity_type == EntityType::Individual);
            Json(ChampionsView {
                month: period,
                individual_champions,
                project_champions,
            })
            .into_response()
        }
        Err(err) => store_error(err),
    }
}

async fn calculate_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MonthQuery>,
) -> Response {
    let period = match requested_period(&state, query.month.as_deref()) {
        Ok(period) => period,
        Err(resp) => return resp,
    };
    match state.service.trigger_ranking_calculation(period).await {
        Ok(result) => run_response(result.success, result),
        Err(err) => pipeline_error(err),
    }
}

async fn sync_logs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);
    match state.service.store().recent_sync_logs(limit).await {
        Ok(logs) => Json(logs).into_response(),
        Err(err) => store_error(err),
    }
}

async fn sync_log_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.service.store().find_sync_log(id).await {
        Ok(Some(log)) => Json(log).into_response(),
        Ok(None) => not_found(format!("sync log {id} not found")),
        Err(err) => store_error(err),
    }
}

async fn sync_status_handler(State(state): State<Arc<AppState>>) -> Response {
    let store = state.service.store();
    let last = match store.last_run_sync_log().await {
        Ok(last) => last,
        Err(err) => return store_error(err),
    };
    let counts = match store.project_counts().await {
        Ok(counts) => counts,
        Err(err) => return store_error(err),
    };
    Json(SyncStatusView {
        last_sync_time: last.as_ref().map(|log| log.start_time),
        last_sync_status: last.as_ref().map(|log| log.status),
        last_sync_type: last.as_ref().map(|log| log.sync_type),
        last_sync_duration_ms: last.as_ref().and_then(|log| log.duration_ms()),
        total_projects: counts.total,
        active_projects: counts.active,
    })
    .into_response()
}

async fn sync_all_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SyncQuery>,
) -> Response {
    match state.service.trigger_sync(query.full_sync).await {
        Ok(result) => run_response(result.success, result),
        Err(err) => pipeline_error(err),
    }
}

async fn sync_project_handler(
    State(state): State<Arc<AppState>>,
    Path(project_key): Path<String>,
    Query(query): Query<SyncQuery>,
) -> Response {
    match state
        .service
        .trigger_project_sync(&project_key, query.full_sync)
        .await
    {
        Ok(result) => run_response(result.success, result),
        Err(err) => pipeline_error(err),
    }
}

async fn import_handler(State(state): State<Arc<AppState>>, body: String) -> Response {
    match state.service.import_issues(&body).await {
        Ok(result) => run_response(result.success, result),
        Err(err) => pipeline_error(err),
    }
}

/// Normalised period for `?month=`, accepting `YYYY-MM-DD` or `YYYY-MM`;
/// the current month when absent.
fn requested_period(state: &AppState, month: Option<&str>) -> Result<NaiveDate, Response> {
    let Some(raw) = month.map(str::trim).filter(|m| !m.is_empty()) else {
        return Ok(period_start(state.service.clock().today()));
    };
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(&format!("{raw}-01"), "%Y-%m-%d"))
        .map(period_start)
        .map_err(|_| bad_request(format!("invalid month {raw}, expected YYYY-MM-DD")))
}

fn run_response<T: Serialize>(success: bool, body: T) -> Response {
    let status = if success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(body)).into_response()
}

fn pipeline_error(err: PipelineError) -> Response {
    let status = match &err {
        PipelineError::Busy => StatusCode::CONFLICT,
        PipelineError::ProjectNotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
        PipelineError::Remote(_) | PipelineError::Store(_) => {
            error!(error = %err, "pipeline run failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    message_response(status, err.to_string())
}

fn store_error(err: StoreError) -> Response {
    error!(error = %err, "store query failed");
    message_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

fn bad_request(message: String) -> Response {
    message_response(StatusCode::BAD_REQUEST, message)
}

fn not_found(message: String) -> Response {
    message_response(StatusCode::NOT_FOUND, message)
}

fn message_response(status: StatusCode, message: String) -> Response {
    (
        status,
        Json(serde_json::json!({ "success": false, "message": message })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::TimeZone;
    use http_body_util::BodyExt;
    use qlb_core::FixedClock;
    use qlb_remote::{
        Endpoint, FixtureBundle, FixtureGateway, RemoteApiGateway, RemoteIssue, RemoteProject,
    };
    use qlb_storage::InMemoryStore;
    use qlb_sync::{GatewaySource, SyncSettings};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tower::ServiceExt;

    fn issue(key: &str, author: &str, created: u32, closed: Option<u32>) -> RemoteIssue {
        let at = |day: u32| Utc.with_ymd_and_hms(2024, 3, day, 8, 0, 0).unwrap();
        RemoteIssue {
            key: key.into(),
            rule: None,
            severity: Some("MAJOR".into()),
            component: None,
            project: None,
            line: None,
            status: Some(if closed.is_some() { "CLOSED" } else { "OPEN" }.into()),
            message: None,
            effort: None,
            author: Some(author.into()),
            issue_type: Some("BUG".into()),
            creation_date: Some(at(created)),
            update_date: None,
            close_date: closed.map(at),
        }
    }

    fn fixture() -> (Arc<FixtureGateway>, Router) {
        let mut bundle = FixtureBundle {
            projects: vec![RemoteProject {
                key: "alpha".into(),
                name: "Alpha".into(),
                qualifier: Some("TRK".into()),
            }],
            ..FixtureBundle::default()
        };
        bundle.issues.insert(
            "alpha".into(),
            vec![
                issue("A-1", "jane.roe", 4, None),
                issue("A-2", "john.doe", 6, Some(20)),
            ],
        );
        bundle.measures.insert(
            "alpha".into(),
            BTreeMap::from([("ncloc".to_string(), "20000".to_string())]),
        );

        let gateway = Arc::new(FixtureGateway::new(bundle));
        let dyn_gateway: Arc<dyn RemoteApiGateway> = gateway.clone();
        let service = Leaderboard::new(
            Arc::new(InMemoryStore::new()),
            GatewaySource::Fixed(dyn_gateway),
            Arc::new(FixedClock(Utc.with_ymd_and_hms(2024, 3, 31, 12, 0, 0).unwrap())),
            SyncSettings {
                request_delay: Duration::ZERO,
                ..SyncSettings::default()
            },
        );
        (gateway, app(AppState::new(Arc::new(service))))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn sync_then_rank_then_query() {
        let (_, app) = fixture();

        let (status, body) = call(&app, "GET", "/api/sync/status", "").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["lastSyncTime"].is_null());
        assert_eq!(body["totalProjects"], 0);

        let (status, body) = call(&app, "POST", "/api/sync/all?fullSync=true", "").await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["success"], true);
        assert_eq!(body["stats"]["issuesCreated"], 2);

        let (status, body) = call(&app, "GET", "/api/sync/status", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["lastSyncStatus"], "SUCCESS");
        assert_eq!(body["lastSyncType"], "FULL");
        assert_eq!(body["activeProjects"], 1);

        let (status, body) = call(&app, "POST", "/api/rankings/calculate?month=2024-03-15", "").await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["period"], "2024-03-01");
        assert_eq!(body["individualsRanked"], 2);

        let (status, body) = call(&app, "GET", "/api/rankings/individual?month=2024-03", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);

        let (status, body) = call(
            &app,
            "GET",
            "/api/rankings/top3/defect-terminator?month=2024-03&type=individual",
            "",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let ranks: Vec<_> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|row| row["defect_terminator_rank"].as_i64().unwrap())
            .collect();
        assert_eq!(ranks, vec![1, 2]);

        let (status, body) = call(&app, "GET", "/api/rankings/champions?month=2024-03-01", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["month"], "2024-03-01");
        assert!(body["individualChampions"].is_array());
        assert!(body["projectChampions"].is_array());

        let (status, body) = call(&app, "GET", "/api/sync/logs?limit=1", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn top3_rejects_unknown_category_and_project_climber() {
        let (_, app) = fixture();
        let (status, _) = call(&app, "GET", "/api/rankings/top3/fastest-typist", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, "GET", "/api/rankings/top3/climber?type=project", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, "GET", "/api/rankings/top3/craftsman?type=team", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(&app, "GET", "/api/rankings/top3/CLIMBER?type=individual", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!([]));
    }

    #[tokio::test]
    async fn missing_resources_are_404() {
        let (_, app) = fixture();
        let (status, _) = call(&app, "GET", &format!("/api/sync/logs/{}", Uuid::new_v4()), "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&app, "POST", "/api/sync/project/ghost", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["message"].as_str().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn failed_sync_returns_500_with_the_result() {
        let (gateway, app) = fixture();
        gateway
            .fail_on(Endpoint::Projects, None, "connection refused")
            .await;
        let (status, body) = call(&app, "POST", "/api/sync/all", "").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert!(body["message"].as_str().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn import_validates_the_body() {
        let (_, app) = fixture();
        let (status, _) = call(&app, "POST", "/api/import", "{broken").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(&app, "POST", "/api/import", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["imported"], 0);
    }

    #[tokio::test]
    async fn invalid_month_is_rejected() {
        let (_, app) = fixture();
        let (status, _) = call(&app, "GET", "/api/rankings/individual?month=March", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
