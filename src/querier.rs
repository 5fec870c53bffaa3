//! Multi-repository query orchestration.
//!
//! `IssueQuerier` validates a request, fans out to the per-repository
//! aggregator with bounded concurrency, and merges the results into one
//! response: the combined issue list (newest first), per-repository rollups,
//! a cross-repository summary, and the list of repositories that failed.
//! A failed repository never sinks the batch.

use crate::aggregator::{IssueSource, ProgressFn, RepoAggregator};
use crate::analyzer::{AnalyzedIssue, PrivilegeChecker};
use crate::cancel::CancelToken;
use crate::config::{AppConfig, RepoId};
use crate::error::QueryError;
use crate::metrics::{repo_metrics, summary_metrics, RepoMetrics, SummaryMetrics};
use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// One repository that could not be fetched, reported alongside the partial
/// results from the repositories that could.
#[derive(Debug, Clone, Serialize)]
pub struct RepoFailure {
    pub repo: RepoId,
    /// Stable failure category ("rate-limited", "timeout", "network", ...).
    pub category: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IssueMetricsResponse {
    pub issues: Vec<AnalyzedIssue>,
    #[serde(rename = "repoMetrics")]
    pub repo_metrics: Vec<RepoMetrics>,
    pub summary: SummaryMetrics,
    pub failures: Vec<RepoFailure>,
}

/// Repositories currently being fetched, used to decide whether a newly
/// arriving request should cancel the in-flight one.
struct ActiveQuery {
    token: CancelToken,
    repos: HashSet<RepoId>,
}

pub struct IssueQuerier<S, P> {
    aggregator: Arc<RepoAggregator<S, P>>,
    config: AppConfig,
    active: Mutex<Option<ActiveQuery>>,
}

impl<S: IssueSource, P: PrivilegeChecker> IssueQuerier<S, P> {
    pub fn new(aggregator: Arc<RepoAggregator<S, P>>, config: &AppConfig) -> Self {
        Self {
            aggregator,
            config: config.clone(),
            active: Mutex::new(None),
        }
    }

    /// Fetches and merges metrics for a repository selection.
    pub async fn get_issue_metrics(
        &self,
        repos: &[RepoId],
        start: NaiveDate,
        end: NaiveDate,
        progress: Option<Arc<ProgressFn>>,
    ) -> Result<IssueMetricsResponse, QueryError> {
        let cancel = self.begin_query(repos);
        let result = self
            .get_issue_metrics_with_cancel(repos, start, end, progress, &cancel)
            .await;
        self.finish_query(&cancel);

        match result {
            // A superseding request cancelled us mid-flight; the caller that
            // issued the superseding request gets the real answer.
            Ok(None) => Err(QueryError::Cancelled),
            Ok(Some(response)) => Ok(response),
            Err(err) => Err(err),
        }
    }

    /// Cancellable variant. A cancelled run resolves to `Ok(None)` and leaves
    /// no trace in the cache.
    pub async fn get_issue_metrics_with_cancel(
        &self,
        repos: &[RepoId],
        start: NaiveDate,
        end: NaiveDate,
        progress: Option<Arc<ProgressFn>>,
        cancel: &CancelToken,
    ) -> Result<Option<IssueMetricsResponse>, QueryError> {
        self.validate(repos, start, end)?;

        if cancel.is_cancelled() {
            return Ok(None);
        }

        let concurrency = self.config.repo_fetch_concurrency.max(1);
        let outcomes: Vec<(RepoId, Result<Arc<Vec<AnalyzedIssue>>, QueryError>)> =
            stream::iter(repos.iter().cloned())
                .map(|repo| {
                    let aggregator = self.aggregator.clone();
                    let progress = progress.clone();
                    let cancel = cancel.clone();
                    async move {
                        let result = aggregator
                            .fetch_repo_issues(&repo, start, end, progress, &cancel)
                            .await;
                        (repo, result)
                    }
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;

        if cancel.is_cancelled() {
            return Ok(None);
        }

        let mut per_repo = Vec::with_capacity(repos.len());
        let mut failures = Vec::new();
        let mut issues: Vec<AnalyzedIssue> = Vec::new();

        for (repo, outcome) in outcomes {
            match outcome {
                Ok(analyzed) => {
                    per_repo.push(repo_metrics(&repo, &analyzed));
                    issues.extend(analyzed.iter().cloned());
                }
                Err(QueryError::Cancelled) => return Ok(None),
                Err(err) => {
                    tracing::warn!(%repo, error = %err, "repository fetch failed");
                    failures.push(RepoFailure {
                        repo,
                        category: err.category(),
                        message: err.to_string(),
                    });
                }
            }
        }

        // Repo rollups come back in fan-out completion order.
        per_repo.sort_by_key(|m| repos.iter().position(|r| *r == m.repo));
        issues.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let summary = summary_metrics(&issues);

        self.evict_outside_selection(repos).await;

        Ok(Some(IssueMetricsResponse {
            issues,
            repo_metrics: per_repo,
            summary,
            failures,
        }))
    }

    /// Whether every requested repository is already cached for this range.
    pub async fn is_cache_valid(&self, repo: &RepoId, start: NaiveDate, end: NaiveDate) -> bool {
        self.aggregator.is_cache_valid(repo, start, end).await
    }

    fn validate(&self, repos: &[RepoId], start: NaiveDate, end: NaiveDate) -> Result<(), QueryError> {
        if repos.is_empty() {
            return Err(QueryError::InvalidInput(
                "at least one repository is required".into(),
            ));
        }
        if repos.len() > self.config.max_repos_per_query {
            return Err(QueryError::InvalidInput(format!(
                "at most {} repositories per query",
                self.config.max_repos_per_query
            )));
        }
        if start > end {
            return Err(QueryError::InvalidInput(
                "start date must not be after end date".into(),
            ));
        }
        let span = end.signed_duration_since(start).num_days();
        if span > self.config.max_date_range_days {
            return Err(QueryError::InvalidInput(format!(
                "date range must not exceed {} days",
                self.config.max_date_range_days
            )));
        }
        Ok(())
    }

    /// Registers a new query, cancelling any in-flight one whose repository
    /// set no longer overlaps the new selection. Overlapping queries keep
    /// running since their cache entries stay useful.
    fn begin_query(&self, repos: &[RepoId]) -> CancelToken {
        let requested: HashSet<RepoId> = repos.iter().cloned().collect();
        let mut active = self.active.lock().expect("active query lock poisoned");

        if let Some(current) = active.as_ref() {
            if should_cancel_in_flight(&current.repos, &requested) {
                tracing::debug!("cancelling in-flight query with disjoint repository set");
                current.token.cancel();
            }
        }

        let token = CancelToken::new();
        *active = Some(ActiveQuery {
            token: token.clone(),
            repos: requested,
        });
        token
    }

    fn finish_query(&self, token: &CancelToken) {
        let mut active = self.active.lock().expect("active query lock poisoned");
        // Only clear our own registration; a superseding query may already
        // have replaced it.
        if let Some(current) = active.as_ref() {
            if current.token.same_as(token) {
                *active = None;
            }
        }
    }

    /// Cache entries for repositories outside the selection and the catalog
    /// are dropped after every query.
    async fn evict_outside_selection(&self, repos: &[RepoId]) {
        let keep: HashSet<RepoId> = repos
            .iter()
            .chain(self.config.repo_catalog.iter())
            .cloned()
            .collect();
        self.aggregator.retain_repos(&keep).await;
    }
}

/// Whether a newly requested repository selection warrants cancelling the
/// in-flight one: only when the two sets share no repository at all.
pub fn should_cancel_in_flight(current: &HashSet<RepoId>, requested: &HashSet<RepoId>) -> bool {
    !current.is_empty() && current.is_disjoint(requested)
}
