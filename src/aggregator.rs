//! Per-repository issue fetching, analysis and caching.
//!
//! `RepoAggregator` pulls the issue set for one repository and date window,
//! runs every issue through the analyzer, and caches the result keyed by
//! `(repo, start, end)`. Overlapping loads for the same key are coalesced by
//! the cache so concurrent dashboard requests never duplicate API spend.

use crate::analyzer::{AnalyzedIssue, IssueAnalyzer, PrivilegeChecker};
use crate::cancel::CancelToken;
use crate::config::{AppConfig, RepoId};
use crate::error::{FetchError, QueryError};
use crate::github::{GitHubClient, IssueDetails, IssueRecord, SearchPage};
use chrono::{NaiveDate, Utc};
use futures::future::BoxFuture;
use moka::future::Cache;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Upstream issue data needed by the aggregator; implemented by
/// [`GitHubClient`] and by in-memory fakes in tests.
pub trait IssueSource: Send + Sync {
    fn search_page<'a>(
        &'a self,
        repo: &'a RepoId,
        start: NaiveDate,
        end: NaiveDate,
        page: u32,
        per_page: u32,
    ) -> BoxFuture<'a, Result<SearchPage, FetchError>>;

    fn issue_details<'a>(
        &'a self,
        repo: &'a RepoId,
        number: u64,
    ) -> BoxFuture<'a, Result<IssueDetails, FetchError>>;
}

impl IssueSource for GitHubClient {
    fn search_page<'a>(
        &'a self,
        repo: &'a RepoId,
        start: NaiveDate,
        end: NaiveDate,
        page: u32,
        per_page: u32,
    ) -> BoxFuture<'a, Result<SearchPage, FetchError>> {
        Box::pin(self.search_issues_page(repo, start, end, page, per_page))
    }

    fn issue_details<'a>(
        &'a self,
        repo: &'a RepoId,
        number: u64,
    ) -> BoxFuture<'a, Result<IssueDetails, FetchError>> {
        Box::pin(self.fetch_issue_details(repo, number))
    }
}

impl<S: IssueSource> IssueSource for Arc<S> {
    fn search_page<'a>(
        &'a self,
        repo: &'a RepoId,
        start: NaiveDate,
        end: NaiveDate,
        page: u32,
        per_page: u32,
    ) -> BoxFuture<'a, Result<SearchPage, FetchError>> {
        (**self).search_page(repo, start, end, page, per_page)
    }

    fn issue_details<'a>(
        &'a self,
        repo: &'a RepoId,
        number: u64,
    ) -> BoxFuture<'a, Result<IssueDetails, FetchError>> {
        (**self).issue_details(repo, number)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IssueCacheKey {
    pub repo: RepoId,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Batch progress callback: `(completed, total)`.
pub type ProgressFn = dyn Fn(usize, usize) + Send + Sync;

pub struct RepoAggregator<S, P> {
    source: S,
    analyzer: IssueAnalyzer<P>,
    cache: Cache<IssueCacheKey, Arc<Vec<AnalyzedIssue>>>,
    /// Date range currently cached per repository, so a range change can
    /// drop the superseded entry.
    ranges: Mutex<HashMap<RepoId, (NaiveDate, NaiveDate)>>,
    config: AppConfig,
}

impl<S: IssueSource, P: PrivilegeChecker> RepoAggregator<S, P> {
    pub fn new(source: S, analyzer: IssueAnalyzer<P>, config: &AppConfig) -> Self {
        Self {
            source,
            analyzer,
            cache: Cache::builder()
                .max_capacity(config.cache_max_capacity)
                .build(),
            ranges: Mutex::new(HashMap::new()),
            config: config.clone(),
        }
    }

    /// Analyzed issues for one repository and date window, read-through
    /// cached. Concurrent calls for the same key share one upstream load.
    pub async fn fetch_repo_issues(
        &self,
        repo: &RepoId,
        start: NaiveDate,
        end: NaiveDate,
        progress: Option<Arc<ProgressFn>>,
        cancel: &CancelToken,
    ) -> Result<Arc<Vec<AnalyzedIssue>>, QueryError> {
        let key = IssueCacheKey {
            repo: repo.clone(),
            start,
            end,
        };

        self.replace_stale_range(&key).await;

        if cancel.is_cancelled() {
            return Err(QueryError::Cancelled);
        }

        self.cache
            .try_get_with(key, self.load(repo, start, end, progress, cancel))
            .await
            .map_err(|err: Arc<QueryError>| (*err).clone())
    }

    /// Whether a cached entry exists for exactly this key.
    pub async fn is_cache_valid(&self, repo: &RepoId, start: NaiveDate, end: NaiveDate) -> bool {
        self.cache.run_pending_tasks().await;
        self.cache.contains_key(&IssueCacheKey {
            repo: repo.clone(),
            start,
            end,
        })
    }

    /// Drops cache entries for repositories outside `keep`, bounding memory
    /// to the currently interesting repository set.
    pub async fn retain_repos(&self, keep: &HashSet<RepoId>) {
        let stale: Vec<Arc<IssueCacheKey>> = self
            .cache
            .iter()
            .filter(|(key, _)| !keep.contains(&key.repo))
            .map(|(key, _)| key)
            .collect();

        for key in stale {
            tracing::debug!(repo = %key.repo, "evicting deselected repository from cache");
            self.cache.invalidate(key.as_ref()).await;
        }

        let mut ranges = self.ranges.lock().expect("ranges lock poisoned");
        ranges.retain(|repo, _| keep.contains(repo));
    }

    /// A changed date range for an already-cached repo invalidates the old
    /// entry before the new one is loaded.
    async fn replace_stale_range(&self, key: &IssueCacheKey) {
        let previous = {
            let mut ranges = self.ranges.lock().expect("ranges lock poisoned");
            ranges.insert(key.repo.clone(), (key.start, key.end))
        };

        if let Some((start, end)) = previous {
            if (start, end) != (key.start, key.end) {
                self.cache
                    .invalidate(&IssueCacheKey {
                        repo: key.repo.clone(),
                        start,
                        end,
                    })
                    .await;
            }
        }
    }

    async fn load(
        &self,
        repo: &RepoId,
        start: NaiveDate,
        end: NaiveDate,
        progress: Option<Arc<ProgressFn>>,
        cancel: &CancelToken,
    ) -> Result<Arc<Vec<AnalyzedIssue>>, QueryError> {
        let issues = self.search_all(repo, start, end, cancel).await?;
        let total = issues.len();
        tracing::info!(%repo, total, "analyzing issues");

        let now = Utc::now();
        let mut analyzed = Vec::with_capacity(total);

        for issue in &issues {
            if cancel.is_cancelled() {
                return Err(QueryError::Cancelled);
            }

            let record = if issue.comment_count > 0 {
                self.analyze_with_details(issue, now, cancel).await?
            } else {
                self.analyzer.analyze(issue, None, now).await
            };

            analyzed.push(record);
            if let Some(report) = &progress {
                report(analyzed.len(), total);
            }
        }

        Ok(Arc::new(analyzed))
    }

    async fn analyze_with_details(
        &self,
        issue: &IssueRecord,
        now: chrono::DateTime<Utc>,
        cancel: &CancelToken,
    ) -> Result<AnalyzedIssue, QueryError> {
        let details = self.source.issue_details(&issue.repo, issue.number).await;
        if cancel.is_cancelled() {
            return Err(QueryError::Cancelled);
        }

        let record = match details {
            Ok(details) => {
                let record = self.analyzer.analyze(issue, Some(&details), now).await;
                // Pace the per-issue detail fetches so a large batch does not
                // burn through the rate limit in one burst.
                tokio::time::sleep(self.config.detail_fetch_delay()).await;
                record
            }
            Err(err) => {
                // One failing issue must not sink the batch: fall back to the
                // detail-less rules and mark the record.
                tracing::warn!(
                    repo = %issue.repo,
                    issue = issue.number,
                    error = %err,
                    "detail fetch failed, falling back to shallow analysis"
                );
                let mut record = self.analyzer.analyze(issue, None, now).await;
                record.error = Some("failed to fetch comments/timeline".to_string());
                record
            }
        };

        if cancel.is_cancelled() {
            return Err(QueryError::Cancelled);
        }
        Ok(record)
    }

    async fn search_all(
        &self,
        repo: &RepoId,
        start: NaiveDate,
        end: NaiveDate,
        cancel: &CancelToken,
    ) -> Result<Vec<IssueRecord>, QueryError> {
        let per_page = self.config.search_page_size.min(100);
        let cap = self.config.issue_result_cap;
        let mut collected = Vec::new();
        let mut page = 1u32;

        loop {
            if cancel.is_cancelled() {
                return Err(QueryError::Cancelled);
            }

            let result = self
                .source
                .search_page(repo, start, end, page, per_page)
                .await?;
            let fetched = result.issues.len();
            collected.extend(result.issues);

            tracing::debug!(
                %repo,
                page,
                fetched,
                total_count = result.total_count,
                "fetched issue search page"
            );

            if collected.len() >= cap {
                collected.truncate(cap);
                break;
            }
            let seen = page as u64 * per_page as u64;
            if (fetched as u32) < per_page || seen >= result.total_count {
                break;
            }
            page += 1;
        }

        Ok(collected)
    }
}
