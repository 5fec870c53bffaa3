//! Pull-request statistics for a repository selection and date window.
//!
//! Counts by state, the merge rate, and two distributions: one keyed by
//! conventional-commit title prefix, one by repository. Computation over
//! fetched records is pure; only the listing calls touch the network.

use crate::config::{AppConfig, RepoId};
use crate::error::{FetchError, QueryError};
use crate::github::{GitHubClient, PullRecord};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use std::collections::BTreeMap;

/// Pagination bound per repository.
const MAX_PAGES: u32 = 10;

const PR_TYPES: &[&str] = &[
    "feat", "fix", "docs", "style", "refactor", "test", "chore",
];

/// Pull-request listing, implemented by [`GitHubClient`] and by fakes.
pub trait PullSource: Send + Sync {
    fn pulls_page<'a>(
        &'a self,
        repo: &'a RepoId,
        page: u32,
        per_page: u32,
    ) -> BoxFuture<'a, Result<Vec<PullRecord>, FetchError>>;
}

impl PullSource for GitHubClient {
    fn pulls_page<'a>(
        &'a self,
        repo: &'a RepoId,
        page: u32,
        per_page: u32,
    ) -> BoxFuture<'a, Result<Vec<PullRecord>, FetchError>> {
        Box::pin(self.list_pulls_page(repo, page, per_page))
    }
}

impl<S: PullSource> PullSource for std::sync::Arc<S> {
    fn pulls_page<'a>(
        &'a self,
        repo: &'a RepoId,
        page: u32,
        per_page: u32,
    ) -> BoxFuture<'a, Result<Vec<PullRecord>, FetchError>> {
        (**self).pulls_page(repo, page, per_page)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PullStats {
    pub total: usize,
    pub open: usize,
    pub merged: usize,
    /// Closed without being merged.
    pub closed: usize,
    /// Percentage of pull requests that were merged.
    #[serde(rename = "mergeRate")]
    pub merge_rate: u32,
    #[serde(rename = "typeDistribution")]
    pub type_distribution: BTreeMap<String, usize>,
    #[serde(rename = "repoDistribution")]
    pub repo_distribution: BTreeMap<String, usize>,
}

pub struct PullStatsService<S> {
    source: S,
    config: AppConfig,
}

impl<S: PullSource> PullStatsService<S> {
    pub fn new(source: S, config: &AppConfig) -> Self {
        Self {
            source,
            config: config.clone(),
        }
    }

    pub async fn pull_stats(
        &self,
        repos: &[RepoId],
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<PullStats, QueryError> {
        let concurrency = self.config.repo_fetch_concurrency.max(1);

        let per_repo: Vec<Vec<PullRecord>> = stream::iter(repos.iter().cloned())
            .map(|repo| async move { self.window_pulls(&repo, since, until).await })
            .buffer_unordered(concurrency)
            .try_collect()
            .await?;

        let pulls: Vec<PullRecord> = per_repo.into_iter().flatten().collect();
        tracing::debug!(pulls = pulls.len(), "computing pull-request stats");
        Ok(compute_pull_stats(&pulls))
    }

    /// The listing is sorted by creation date descending, so pagination stops
    /// at the first page that reaches past the window start.
    async fn window_pulls(
        &self,
        repo: &RepoId,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<PullRecord>, QueryError> {
        let per_page = self.config.search_page_size.min(100);
        let mut pulls = Vec::new();

        for page in 1..=MAX_PAGES {
            let batch = self.source.pulls_page(repo, page, per_page).await?;
            let short = (batch.len() as u32) < per_page;
            let past_window = batch.iter().any(|p| p.created_at < since);

            pulls.extend(
                batch
                    .into_iter()
                    .filter(|p| p.created_at >= since && p.created_at <= until),
            );

            if short || past_window {
                break;
            }
        }

        Ok(pulls)
    }
}

pub fn compute_pull_stats(pulls: &[PullRecord]) -> PullStats {
    let total = pulls.len();
    let merged = pulls.iter().filter(|p| p.merged_at.is_some()).count();
    let closed = pulls
        .iter()
        .filter(|p| p.merged_at.is_none() && p.closed_at.is_some())
        .count();
    let open = total - merged - closed;

    let mut type_distribution = BTreeMap::new();
    let mut repo_distribution = BTreeMap::new();
    for pull in pulls {
        *type_distribution
            .entry(pull_type(&pull.title).to_string())
            .or_insert(0) += 1;
        *repo_distribution.entry(pull.repo.to_string()).or_insert(0) += 1;
    }

    let merge_rate = if total > 0 {
        ((merged as f64 / total as f64) * 100.0).round() as u32
    } else {
        0
    };

    PullStats {
        total,
        open,
        merged,
        closed,
        merge_rate,
        type_distribution,
        repo_distribution,
    }
}

/// Conventional-commit prefix of a PR title; anything unrecognized lands in
/// "other". Scoped prefixes like `fix(axis):` count toward their type.
pub fn pull_type(title: &str) -> &'static str {
    let head = title
        .split(|c| c == ':' || c == '(')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase();

    PR_TYPES
        .iter()
        .find(|t| **t == head)
        .copied()
        .unwrap_or("other")
}
