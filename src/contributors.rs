//! Contributor statistics across a repository selection.
//!
//! Commit authors and pull-request authors inside a date window are merged
//! into one record per login, then each contributor's role is resolved
//! through the collaborator-permission lookup. Merging is pure; only the
//! fetching and the role lookups touch the network.

use crate::config::{AppConfig, RepoId};
use crate::error::{FetchError, QueryError};
use crate::github::{CommitRecord, ContributorRole, GitHubClient, PullRecord, UserRef};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use std::collections::HashMap;

/// Pagination bound per repository; windows larger than this are truncated
/// rather than fetched exhaustively.
const MAX_PAGES: u32 = 10;

/// Commit, pull and permission data needed for contributor stats.
pub trait ActivitySource: Send + Sync {
    fn commits_page<'a>(
        &'a self,
        repo: &'a RepoId,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        page: u32,
        per_page: u32,
    ) -> BoxFuture<'a, Result<Vec<CommitRecord>, FetchError>>;

    fn pulls_page<'a>(
        &'a self,
        repo: &'a RepoId,
        page: u32,
        per_page: u32,
    ) -> BoxFuture<'a, Result<Vec<PullRecord>, FetchError>>;

    fn permission<'a>(
        &'a self,
        repo: &'a RepoId,
        login: &'a str,
    ) -> BoxFuture<'a, Result<String, FetchError>>;
}

impl ActivitySource for GitHubClient {
    fn commits_page<'a>(
        &'a self,
        repo: &'a RepoId,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        page: u32,
        per_page: u32,
    ) -> BoxFuture<'a, Result<Vec<CommitRecord>, FetchError>> {
        Box::pin(self.list_commits_page(repo, since, until, page, per_page))
    }

    fn pulls_page<'a>(
        &'a self,
        repo: &'a RepoId,
        page: u32,
        per_page: u32,
    ) -> BoxFuture<'a, Result<Vec<PullRecord>, FetchError>> {
        Box::pin(self.list_pulls_page(repo, page, per_page))
    }

    fn permission<'a>(
        &'a self,
        repo: &'a RepoId,
        login: &'a str,
    ) -> BoxFuture<'a, Result<String, FetchError>> {
        Box::pin(self.collaborator_permission(repo, login))
    }
}

impl<S: ActivitySource> ActivitySource for std::sync::Arc<S> {
    fn commits_page<'a>(
        &'a self,
        repo: &'a RepoId,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        page: u32,
        per_page: u32,
    ) -> BoxFuture<'a, Result<Vec<CommitRecord>, FetchError>> {
        (**self).commits_page(repo, since, until, page, per_page)
    }

    fn pulls_page<'a>(
        &'a self,
        repo: &'a RepoId,
        page: u32,
        per_page: u32,
    ) -> BoxFuture<'a, Result<Vec<PullRecord>, FetchError>> {
        (**self).pulls_page(repo, page, per_page)
    }

    fn permission<'a>(
        &'a self,
        repo: &'a RepoId,
        login: &'a str,
    ) -> BoxFuture<'a, Result<String, FetchError>> {
        (**self).permission(repo, login)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContributorRecord {
    pub login: String,
    pub id: u64,
    pub avatar_url: String,
    pub html_url: String,
    /// Commits authored in the window across the selected repositories.
    pub contributions: usize,
    pub repos: Vec<RepoId>,
    #[serde(rename = "pullRequests")]
    pub pull_requests: usize,
    #[serde(rename = "isMaintainer")]
    pub is_maintainer: bool,
    pub role: ContributorRole,
}

pub struct ContributorService<S> {
    source: S,
    config: AppConfig,
}

impl<S: ActivitySource> ContributorService<S> {
    pub fn new(source: S, config: &AppConfig) -> Self {
        Self {
            source,
            config: config.clone(),
        }
    }

    /// Contributor records for the repo set and window, sorted by commit
    /// count descending.
    pub async fn contributor_stats(
        &self,
        repos: &[RepoId],
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<ContributorRecord>, QueryError> {
        let concurrency = self.config.repo_fetch_concurrency.max(1);

        let per_repo: Vec<(RepoId, Vec<CommitRecord>, Vec<PullRecord>)> =
            stream::iter(repos.iter().cloned())
                .map(|repo| async move {
                    let commits = self.all_commits(&repo, since, until).await?;
                    let pulls = self.window_pulls(&repo, since, until).await?;
                    Ok::<_, QueryError>((repo, commits, pulls))
                })
                .buffer_unordered(concurrency)
                .try_collect()
                .await?;

        let mut records = merge_contributors(&per_repo);
        self.resolve_roles(&mut records).await;
        Ok(records)
    }

    async fn all_commits(
        &self,
        repo: &RepoId,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<CommitRecord>, QueryError> {
        let per_page = self.config.search_page_size.min(100);
        let mut commits = Vec::new();

        for page in 1..=MAX_PAGES {
            let batch = self
                .source
                .commits_page(repo, since, until, page, per_page)
                .await?;
            let short = (batch.len() as u32) < per_page;
            commits.extend(batch);
            if short {
                break;
            }
        }

        tracing::debug!(%repo, commits = commits.len(), "fetched commits for contributor stats");
        Ok(commits)
    }

    /// Pulls created inside the window. The listing is sorted by creation
    /// date descending, so pagination stops at the first page reaching past
    /// the window start.
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

    /// Role lookup against the first repository each contributor touched.
    /// A failed lookup keeps the default role rather than failing the batch.
    async fn resolve_roles(&self, records: &mut [ContributorRecord]) {
        for record in records.iter_mut() {
            let Some(repo) = record.repos.first() else {
                continue;
            };
            match self.source.permission(repo, &record.login).await {
                Ok(permission) => {
                    record.role = ContributorRole::from_permission(&permission);
                    record.is_maintainer = record.role.is_maintainer();
                }
                Err(err) => {
                    tracing::warn!(
                        login = %record.login,
                        error = %err,
                        "permission lookup failed, keeping default role"
                    );
                }
            }
        }
    }
}

/// Merges commit and pull authors into one record per login. Bot-suffixed
/// logins are skipped; anonymous commits carry no author and are skipped too.
pub fn merge_contributors(
    per_repo: &[(RepoId, Vec<CommitRecord>, Vec<PullRecord>)],
) -> Vec<ContributorRecord> {
    let mut by_login: HashMap<String, ContributorRecord> = HashMap::new();

    for (repo, commits, pulls) in per_repo {
        for commit in commits {
            let Some(author) = &commit.author else {
                continue;
            };
            if author.login.ends_with("[bot]") {
                continue;
            }
            touch(&mut by_login, author, repo).contributions += 1;
        }
        for pull in pulls {
            let Some(author) = &pull.user else {
                continue;
            };
            if author.login.ends_with("[bot]") {
                continue;
            }
            touch(&mut by_login, author, repo).pull_requests += 1;
        }
    }

    let mut records: Vec<ContributorRecord> = by_login.into_values().collect();
    records.sort_by(|a, b| {
        b.contributions
            .cmp(&a.contributions)
            .then_with(|| a.login.cmp(&b.login))
    });
    records
}

fn touch<'a>(
    by_login: &'a mut HashMap<String, ContributorRecord>,
    user: &UserRef,
    repo: &RepoId,
) -> &'a mut ContributorRecord {
    let record = by_login
        .entry(user.login.clone())
        .or_insert_with(|| ContributorRecord {
            login: user.login.clone(),
            id: user.id,
            avatar_url: user.avatar_url.clone(),
            html_url: user.html_url.clone(),
            contributions: 0,
            repos: Vec::new(),
            pull_requests: 0,
            is_maintainer: false,
            role: ContributorRole::Contributor,
        });
    if !record.repos.contains(repo) {
        record.repos.push(repo.clone());
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn user(login: &str, id: u64) -> UserRef {
        UserRef {
            login: login.into(),
            id,
            avatar_url: format!("https://avatars.githubusercontent.com/u/{id}"),
            html_url: format!("https://github.com/{login}"),
        }
    }

    fn commit(login: Option<&str>) -> CommitRecord {
        CommitRecord {
            author: login.map(|l| user(l, 1)),
        }
    }

    fn pull(repo: &RepoId, number: u64, login: &str, day: u32) -> PullRecord {
        PullRecord {
            number,
            title: format!("fix: #{number}"),
            state: crate::github::IssueState::Open,
            created_at: Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap(),
            merged_at: None,
            closed_at: None,
            html_url: format!("https://github.com/{repo}/pull/{number}"),
            user: Some(user(login, 1)),
            repo: repo.clone(),
        }
    }

    #[test]
    fn test_merge_combines_commits_and_pulls_per_login() {
        let g2: RepoId = "antvis/g2".parse().unwrap();
        let g6: RepoId = "antvis/g6".parse().unwrap();

        let per_repo = vec![
            (
                g2.clone(),
                vec![commit(Some("alice")), commit(Some("alice")), commit(Some("bob"))],
                vec![pull(&g2, 1, "alice", 5)],
            ),
            (
                g6.clone(),
                vec![commit(Some("alice")), commit(None)],
                vec![pull(&g6, 2, "carol", 6)],
            ),
        ];

        let records = merge_contributors(&per_repo);

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].login, "alice");
        assert_eq!(records[0].contributions, 3);
        assert_eq!(records[0].pull_requests, 1);
        assert_eq!(records[0].repos, vec![g2.clone(), g6.clone()]);

        let carol = records.iter().find(|r| r.login == "carol").unwrap();
        assert_eq!(carol.contributions, 0);
        assert_eq!(carol.pull_requests, 1);
        assert_eq!(carol.role, ContributorRole::Contributor);
    }

    #[test]
    fn test_merge_skips_bots() {
        let g2: RepoId = "antvis/g2".parse().unwrap();
        let per_repo = vec![(
            g2.clone(),
            vec![commit(Some("renovate[bot]")), commit(Some("alice"))],
            vec![],
        )];

        let records = merge_contributors(&per_repo);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].login, "alice");
    }

    /// Fixed activity, counting permission lookups and optionally failing them.
    struct FakeActivity {
        commits: Vec<CommitRecord>,
        pulls: Vec<PullRecord>,
        permissions: Vec<(String, String)>,
        permission_calls: AtomicU32,
        fail_permissions: bool,
    }

    impl ActivitySource for FakeActivity {
        fn commits_page<'a>(
            &'a self,
            _repo: &'a RepoId,
            _since: DateTime<Utc>,
            _until: DateTime<Utc>,
            page: u32,
            _per_page: u32,
        ) -> BoxFuture<'a, Result<Vec<CommitRecord>, FetchError>> {
            let batch = if page == 1 { self.commits.clone() } else { vec![] };
            Box::pin(async move { Ok(batch) })
        }

        fn pulls_page<'a>(
            &'a self,
            _repo: &'a RepoId,
            page: u32,
            _per_page: u32,
        ) -> BoxFuture<'a, Result<Vec<PullRecord>, FetchError>> {
            let batch = if page == 1 { self.pulls.clone() } else { vec![] };
            Box::pin(async move { Ok(batch) })
        }

        fn permission<'a>(
            &'a self,
            _repo: &'a RepoId,
            login: &'a str,
        ) -> BoxFuture<'a, Result<String, FetchError>> {
            self.permission_calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if self.fail_permissions {
                    return Err(FetchError::Timeout);
                }
                Ok(self
                    .permissions
                    .iter()
                    .find(|(l, _)| l == login)
                    .map(|(_, p)| p.clone())
                    .unwrap_or_else(|| "none".to_string()))
            })
        }
    }

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_roles_resolved_through_permission_lookup() {
        let g2: RepoId = "antvis/g2".parse().unwrap();
        let source = Arc::new(FakeActivity {
            commits: vec![commit(Some("alice")), commit(Some("bob"))],
            pulls: vec![],
            permissions: vec![
                ("alice".into(), "admin".into()),
                ("bob".into(), "read".into()),
            ],
            permission_calls: AtomicU32::new(0),
            fail_permissions: false,
        });
        let service = ContributorService::new(source.clone(), &AppConfig::default());
        let (since, until) = window();

        let records = service
            .contributor_stats(&[g2], since, until)
            .await
            .unwrap();

        let alice = records.iter().find(|r| r.login == "alice").unwrap();
        assert_eq!(alice.role, ContributorRole::Owner);
        assert!(alice.is_maintainer);

        let bob = records.iter().find(|r| r.login == "bob").unwrap();
        assert_eq!(bob.role, ContributorRole::Collaborator);
        assert!(!bob.is_maintainer);

        assert_eq!(source.permission_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permission_failure_keeps_default_role() {
        let g2: RepoId = "antvis/g2".parse().unwrap();
        let source = Arc::new(FakeActivity {
            commits: vec![commit(Some("alice"))],
            pulls: vec![],
            permissions: vec![],
            permission_calls: AtomicU32::new(0),
            fail_permissions: true,
        });
        let service = ContributorService::new(source, &AppConfig::default());
        let (since, until) = window();

        let records = service
            .contributor_stats(&[g2], since, until)
            .await
            .unwrap();

        assert_eq!(records[0].role, ContributorRole::Contributor);
        assert!(!records[0].is_maintainer);
    }

    #[tokio::test]
    async fn test_pulls_outside_window_excluded() {
        let g2: RepoId = "antvis/g2".parse().unwrap();
        let mut early = pull(&g2, 9, "alice", 5);
        early.created_at = Utc.with_ymd_and_hms(2023, 12, 1, 0, 0, 0).unwrap();

        let source = Arc::new(FakeActivity {
            commits: vec![],
            pulls: vec![pull(&g2, 1, "alice", 10), early],
            permissions: vec![],
            permission_calls: AtomicU32::new(0),
            fail_permissions: false,
        });
        let service = ContributorService::new(source, &AppConfig::default());
        let (since, until) = window();

        let records = service
            .contributor_stats(&[g2], since, until)
            .await
            .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].pull_requests, 1);
    }
}
