//! Feedback store client.
//!
//! User feedback lives in a LeanCloud-style object store, queried over its
//! REST API. This client is a thin authenticated pass-through: a date-window
//! query over a configured object class and a resolved-flag update. Nothing
//! here is cached; feedback volumes are tiny compared to issue data.

use crate::config::{AppConfig, RepoId};
use crate::error::FetchError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackEntry {
    #[serde(rename = "objectId")]
    pub object_id: String,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub rating: Option<i32>,
    #[serde(default)]
    pub comment: Option<String>,
    /// "1" when resolved, "0" or absent otherwise.
    #[serde(default, rename = "isResolved")]
    pub is_resolved: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

impl FeedbackEntry {
    pub fn resolved(&self) -> bool {
        self.is_resolved.as_deref() == Some("1")
    }
}

#[derive(Debug, Deserialize)]
struct QueryResults {
    results: Vec<FeedbackEntry>,
}

pub struct FeedbackStore {
    http: reqwest::Client,
    base_url: String,
    class: String,
    app_id: String,
    app_key: String,
    query_limit: u32,
}

impl FeedbackStore {
    /// `None` when the store credentials are not configured; the feedback
    /// endpoints then report the feature as unavailable.
    pub fn from_config(config: &AppConfig) -> Option<Self> {
        let app_id = config.leancloud_app_id.clone()?;
        let app_key = config.leancloud_app_key.clone()?;
        Some(Self {
            http: reqwest::Client::new(),
            base_url: config.leancloud_base_url.trim_end_matches('/').to_string(),
            class: config.leancloud_class.clone(),
            app_id,
            app_key,
            query_limit: config.feedback_query_limit,
        })
    }

    /// Feedback entries created within `[start, end]`, optionally filtered to
    /// one repository.
    pub async fn query(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        repo: Option<&RepoId>,
    ) -> Result<Vec<FeedbackEntry>, FetchError> {
        let selector = where_clause(start, end, repo);
        let url = format!("{}/1.1/classes/{}", self.base_url, self.class);

        let response = self
            .authed(self.http.get(&url))
            .query(&[
                ("where", selector.to_string()),
                ("limit", self.query_limit.to_string()),
                ("order", "-createdAt".to_string()),
            ])
            .send()
            .await
            .map_err(into_fetch_error)?;

        let response = check_status(response).await?;
        let results: QueryResults = response.json().await.map_err(into_fetch_error)?;
        Ok(results.results)
    }

    /// Flips the resolved flag on one feedback entry.
    pub async fn set_resolved(&self, object_id: &str, resolved: bool) -> Result<(), FetchError> {
        let url = format!("{}/1.1/classes/{}/{}", self.base_url, self.class, object_id);
        let body = json!({ "isResolved": if resolved { "1" } else { "0" } });

        let response = self
            .authed(self.http.put(&url))
            .json(&body)
            .send()
            .await
            .map_err(into_fetch_error)?;

        check_status(response).await?;
        Ok(())
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("X-LC-Id", &self.app_id)
            .header("X-LC-Key", &self.app_key)
            .header("Content-Type", "application/json")
    }
}

/// LeanCloud `where` document: `createdAt` bounded by the date window (end
/// exclusive at the following midnight), plus an optional exact repo match.
fn where_clause(start: NaiveDate, end: NaiveDate, repo: Option<&RepoId>) -> serde_json::Value {
    let end_exclusive = end.succ_opt().unwrap_or(end);
    let mut selector = json!({
        "createdAt": {
            "$gte": { "__type": "Date", "iso": format!("{start}T00:00:00.000Z") },
            "$lt": { "__type": "Date", "iso": format!("{end_exclusive}T00:00:00.000Z") },
        }
    });
    if let Some(repo) = repo {
        selector["repo"] = json!(repo.to_string());
    }
    selector
}

fn into_fetch_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Network(err.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, FetchError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(FetchError::Status {
        status: status.as_u16(),
        message,
    })
}
