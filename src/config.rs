//! Application configuration and environment variable parsing.
//!
//! This module handles loading configuration settings from the environment (e.g., .env file).
//! It defines the `AppConfig` struct which governs behavior such as retry/backoff tuning,
//! query ceilings, cache capacities, and the repository catalog shown on the dashboard.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration as StdDuration;

/// A unique identifier for a GitHub repository.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoId {
    /// The owner of the repository (e.g., "antvis").
    pub owner: String,
    /// The name of the repository (e.g., "g2").
    pub repo: String,
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

impl FromStr for RepoId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        if parts.len() == 2 && !parts[0].is_empty() && !parts[1].is_empty() {
            Ok(RepoId {
                owner: parts[0].trim().to_string(),
                repo: parts[1].trim().to_string(),
            })
        } else {
            Err(format!("expected owner/repo, got '{s}'"))
        }
    }
}

/// Application configuration loaded from environment variables.
#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    /// Optional GitHub Personal Access Token for higher rate limits.
    #[serde(default)]
    pub github_token: Option<String>,

    /// GitHub organization whose members count as maintainers.
    #[serde(default)]
    pub github_org: Option<String>,

    /// Repository catalog shown on the dashboard and queried by default.
    /// Expected format: comma-separated string of "owner/repo" pairs.
    /// Example: "antvis/g2,antvis/g6"
    #[serde(default, deserialize_with = "deserialize_repo_catalog")]
    pub repo_catalog: Vec<RepoId>,

    /// Hard limit on the number of repositories accepted in one query.
    #[serde(default = "default_max_repos_per_query")]
    pub max_repos_per_query: usize,

    /// Hard limit on the span of the requested date range, in days.
    #[serde(default = "default_max_date_range_days")]
    pub max_date_range_days: i64,

    /// Page size for issue search requests (GitHub caps this at 100).
    #[serde(default = "default_search_page_size")]
    pub search_page_size: u32,

    /// Upper bound on analyzed issues per repository and date range.
    #[serde(default = "default_issue_result_cap")]
    pub issue_result_cap: usize,

    /// Pause between successive per-issue detail fetches, in milliseconds.
    #[serde(default = "default_detail_fetch_delay_ms")]
    pub detail_fetch_delay_ms: u64,

    /// Maximum attempts for a single upstream call.
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    /// Base delay for exponential backoff, in milliseconds.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Minimum wait after a rate-limit rejection, in milliseconds.
    #[serde(default = "default_rate_limit_floor_ms")]
    pub rate_limit_floor_ms: u64,

    /// Maximum number of entries in the analyzed-issue cache.
    #[serde(default = "default_cache_max_capacity")]
    pub cache_max_capacity: u64,

    /// Maximum number of entries in the membership cache.
    #[serde(default = "default_member_cache_max_capacity")]
    pub member_cache_max_capacity: u64,

    /// Maximum number of repositories fetched concurrently in one aggregation.
    #[serde(default = "default_repo_fetch_concurrency")]
    pub repo_fetch_concurrency: usize,

    /// Label whose addition counts as a response regardless of the actor
    /// (used for triage labels applied by automation on behalf of the team).
    #[serde(default)]
    pub ops_label: Option<String>,

    /// LeanCloud application id for the feedback store.
    #[serde(default)]
    pub leancloud_app_id: Option<String>,

    /// LeanCloud application key for the feedback store.
    #[serde(default)]
    pub leancloud_app_key: Option<String>,

    /// Base URL of the feedback store API.
    #[serde(default = "default_leancloud_base_url")]
    pub leancloud_base_url: String,

    /// Object class holding user feedback entries.
    #[serde(default = "default_leancloud_class")]
    pub leancloud_class: String,

    /// Result limit for feedback queries.
    #[serde(default = "default_feedback_query_limit")]
    pub feedback_query_limit: u32,
}

fn default_max_repos_per_query() -> usize {
    10
}

fn default_max_date_range_days() -> i64 {
    366
}

fn default_search_page_size() -> u32 {
    100
}

fn default_issue_result_cap() -> usize {
    1000
}

fn default_detail_fetch_delay_ms() -> u64 {
    100
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    2000
}

fn default_rate_limit_floor_ms() -> u64 {
    10_000
}

fn default_cache_max_capacity() -> u64 {
    100
}

fn default_member_cache_max_capacity() -> u64 {
    10_000
}

fn default_repo_fetch_concurrency() -> usize {
    4
}

fn default_leancloud_base_url() -> String {
    "https://api.leancloud.cn".to_string()
}

fn default_leancloud_class() -> String {
    "UserFeedback".to_string()
}

fn default_feedback_query_limit() -> u32 {
    1000
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::from_env()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: StdDuration::from_millis(self.retry_base_delay_ms),
            rate_limit_floor: StdDuration::from_millis(self.rate_limit_floor_ms),
        }
    }

    pub fn detail_fetch_delay(&self) -> StdDuration {
        StdDuration::from_millis(self.detail_fetch_delay_ms)
    }
}

impl Default for AppConfig {
    /// Defaults used by tests; production loads from the environment.
    fn default() -> Self {
        envy::from_iter::<_, Self>(std::iter::empty::<(String, String)>())
            .expect("all AppConfig fields have defaults")
    }
}

fn deserialize_repo_catalog<'de, D>(deserializer: D) -> Result<Vec<RepoId>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Ok(parse_repo_catalog(&s))
}

fn parse_repo_catalog(s: &str) -> Vec<RepoId> {
    s.split(',')
        .filter_map(|part| part.trim().parse::<RepoId>().ok())
        .collect()
}
