pub mod aggregator;
pub mod analyzer;
pub mod cancel;
pub mod config;
pub mod contributors;
pub mod error;
pub mod feedback;
pub mod github;
pub mod membership;
pub mod metrics;
pub mod prs;
pub mod querier;
pub mod retry;

use aggregator::RepoAggregator;
use analyzer::IssueAnalyzer;
use axum::http::StatusCode;
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveDate, TimeZone, Utc};
use config::{AppConfig, RepoId};
use contributors::{ContributorRecord, ContributorService};
use error::QueryError;
use feedback::{FeedbackEntry, FeedbackStore};
use github::GitHubClient;
use membership::MembershipResolver;
use prs::{PullStats, PullStatsService};
use querier::{IssueMetricsResponse, IssueQuerier};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

type Client = Arc<GitHubClient>;
type Querier = IssueQuerier<Client, MembershipResolver<Client>>;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

/// Shared application state accessible to all request handlers.
pub struct AppState {
    pub querier: Querier,
    pub contributors: ContributorService<Client>,
    pub pulls: PullStatsService<Client>,
    /// Absent when the feedback store credentials are not configured.
    pub feedback: Option<FeedbackStore>,
    pub config: AppConfig,
}

impl AppState {
    /// Wires the full pipeline: one GitHub client shared by the issue
    /// querier, the contributor service and the PR stats service.
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let client = Arc::new(GitHubClient::new(
            config.github_token.clone(),
            config.retry_policy(),
        )?);

        let resolver = MembershipResolver::new(
            client.clone(),
            config.github_org.clone(),
            config.member_cache_max_capacity,
        );
        let analyzer = IssueAnalyzer::new(resolver, config.ops_label.clone());
        let aggregator = Arc::new(RepoAggregator::new(client.clone(), analyzer, &config));
        let querier = IssueQuerier::new(aggregator, &config);

        Ok(Self {
            querier,
            contributors: ContributorService::new(client.clone(), &config),
            pulls: PullStatsService::new(client, &config),
            feedback: FeedbackStore::from_config(&config),
            config,
        })
    }
}

pub fn create_app(state: Arc<AppState>) -> Router {
    let serve_dir = ServeDir::new("dist").not_found_service(ServeFile::new("dist/index.html"));

    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/repos", get(get_repo_catalog))
        .route("/api/issues/metrics", post(get_issue_metrics))
        .route("/api/contributors", post(get_contributors))
        .route("/api/prs/stats", post(get_pull_stats))
        .route("/api/feedback/query", post(query_feedback))
        .route("/api/feedback/resolve", post(resolve_feedback))
        .fallback_service(serve_dir)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "pulseboard",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn get_repo_catalog(State(state): State<Arc<AppState>>) -> Json<Vec<RepoId>> {
    Json(state.config.repo_catalog.clone())
}

/// Request body shared by the metrics, contributor and PR endpoints. Field
/// names mirror what the dashboard frontend sends.
#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub repos: Vec<String>,
    #[serde(rename = "startDate")]
    pub start_date: NaiveDate,
    #[serde(rename = "endDate")]
    pub end_date: NaiveDate,
}

impl RangeQuery {
    fn repo_ids(&self) -> Result<Vec<RepoId>, (StatusCode, String)> {
        self.repos
            .iter()
            .map(|s| s.parse::<RepoId>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| (StatusCode::BAD_REQUEST, e))
    }

    /// Window as UTC instants, the whole end date included.
    fn window(&self) -> (chrono::DateTime<Utc>, chrono::DateTime<Utc>) {
        let since = Utc.from_utc_datetime(&self.start_date.and_hms_opt(0, 0, 0).unwrap());
        let until_date = self.end_date.succ_opt().unwrap_or(self.end_date);
        let until = Utc.from_utc_datetime(&until_date.and_hms_opt(0, 0, 0).unwrap());
        (since, until)
    }
}

pub async fn get_issue_metrics(
    State(state): State<Arc<AppState>>,
    Json(query): Json<RangeQuery>,
) -> Result<Json<IssueMetricsResponse>, (StatusCode, String)> {
    let repos = query.repo_ids()?;

    match state
        .querier
        .get_issue_metrics(&repos, query.start_date, query.end_date, None)
        .await
    {
        Ok(response) => {
            tracing::debug!(
                repos = repos.len(),
                issues = response.issues.len(),
                failures = response.failures.len(),
                "returning issue metrics"
            );
            Ok(Json(response))
        }
        Err(e) => Err(map_query_error(e)),
    }
}

pub async fn get_contributors(
    State(state): State<Arc<AppState>>,
    Json(query): Json<RangeQuery>,
) -> Result<Json<Vec<ContributorRecord>>, (StatusCode, String)> {
    let repos = query.repo_ids()?;
    let (since, until) = query.window();

    state
        .contributors
        .contributor_stats(&repos, since, until)
        .await
        .map(Json)
        .map_err(map_query_error)
}

pub async fn get_pull_stats(
    State(state): State<Arc<AppState>>,
    Json(query): Json<RangeQuery>,
) -> Result<Json<PullStats>, (StatusCode, String)> {
    let repos = query.repo_ids()?;
    let (since, until) = query.window();

    state
        .pulls
        .pull_stats(&repos, since, until)
        .await
        .map(Json)
        .map_err(map_query_error)
}

#[derive(Debug, Deserialize)]
pub struct FeedbackQuery {
    #[serde(rename = "startDate")]
    pub start_date: NaiveDate,
    #[serde(rename = "endDate")]
    pub end_date: NaiveDate,
    #[serde(default)]
    pub repo: Option<String>,
}

pub async fn query_feedback(
    State(state): State<Arc<AppState>>,
    Json(query): Json<FeedbackQuery>,
) -> Result<Json<Vec<FeedbackEntry>>, (StatusCode, String)> {
    let store = feedback_store(&state)?;
    let repo = query
        .repo
        .as_deref()
        .map(|s| s.parse::<RepoId>())
        .transpose()
        .map_err(|e| (StatusCode::BAD_REQUEST, e))?;

    store
        .query(query.start_date, query.end_date, repo.as_ref())
        .await
        .map(Json)
        .map_err(|e| map_query_error(e.into()))
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    #[serde(rename = "objectId")]
    pub object_id: String,
    pub resolved: bool,
}

#[derive(Serialize)]
pub struct ResolveResponse {
    pub success: bool,
}

pub async fn resolve_feedback(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<ResolveResponse>, (StatusCode, String)> {
    let store = feedback_store(&state)?;

    store
        .set_resolved(&request.object_id, request.resolved)
        .await
        .map(|_| Json(ResolveResponse { success: true }))
        .map_err(|e| map_query_error(e.into()))
}

fn feedback_store(state: &AppState) -> Result<&FeedbackStore, (StatusCode, String)> {
    state.feedback.as_ref().ok_or((
        StatusCode::SERVICE_UNAVAILABLE,
        "feedback store is not configured".to_string(),
    ))
}

fn map_query_error(err: QueryError) -> (StatusCode, String) {
    tracing::error!(category = err.category(), error = %err, "request failed");
    let status = match &err {
        QueryError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        QueryError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        QueryError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        QueryError::Network(_) => StatusCode::BAD_GATEWAY,
        QueryError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        // The request was superseded by a newer one with a different
        // repository selection.
        QueryError::Cancelled => StatusCode::CONFLICT,
    };
    (status, err.to_string())
}
