//! GitHub API access: issue search, per-issue details, membership and
//! permission lookups.
//!
//! Every method performs exactly one logical upstream call, wrapped by the
//! retry decorator in [`crate::retry`]. Responses are deserialized into our
//! own wire structs and converted to the domain types consumed by the
//! analyzer and aggregators.

use crate::config::RepoId;
use crate::error::FetchError;
use crate::retry::{fetch_with_retry, RetryPolicy};
use chrono::{DateTime, Days, NaiveDate, Utc};
use octocrab::Octocrab;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Comments fetched per issue; the first qualifying response is almost always
/// within the first few.
const COMMENTS_PER_ISSUE: u32 = 10;
const TIMELINE_EVENTS_PER_ISSUE: u32 = 50;
const COMMENT_BODY_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    Open,
    Closed,
}

/// An issue as returned by the search endpoint, scoped to one repository.
#[derive(Debug, Clone, Serialize)]
pub struct IssueRecord {
    pub number: u64,
    pub title: String,
    pub html_url: String,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub state: IssueState,
    /// Login of the issue creator.
    pub user: String,
    pub labels: Vec<String>,
    /// Comment count reported by search; lets the aggregator skip detail
    /// fetches for issues nobody commented on.
    #[serde(skip_serializing)]
    pub comment_count: u32,
    pub repo: RepoId,
}

#[derive(Debug, Clone)]
pub struct IssueComment {
    pub id: u64,
    pub user: Option<String>,
    pub user_is_bot: bool,
    pub created_at: DateTime<Utc>,
    /// Truncated body, enough to display in a tooltip.
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineKind {
    Labeled,
    CrossReferenced,
    Other,
}

#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub kind: TimelineKind,
    pub actor: Option<String>,
    pub actor_is_bot: bool,
    pub created_at: Option<DateTime<Utc>>,
    /// Label name for `labeled` events.
    pub label: Option<String>,
    /// Source issue number for `cross-referenced` events.
    pub source_issue: Option<u64>,
    /// Whether the cross-reference source is itself a pull request.
    pub source_is_pull: bool,
}

/// Comments plus timeline for a single issue.
#[derive(Debug, Clone, Default)]
pub struct IssueDetails {
    pub comments: Vec<IssueComment>,
    pub timeline: Vec<TimelineEvent>,
}

/// One page of issue search results.
#[derive(Debug, Clone)]
pub struct SearchPage {
    pub total_count: u64,
    pub issues: Vec<IssueRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContributorRole {
    Owner,
    Member,
    Collaborator,
    Contributor,
}

impl ContributorRole {
    /// Maps a collaborator permission level to a dashboard role.
    pub fn from_permission(permission: &str) -> Self {
        match permission {
            "admin" => ContributorRole::Owner,
            "write" | "maintain" => ContributorRole::Member,
            "read" | "triage" => ContributorRole::Collaborator,
            _ => ContributorRole::Contributor,
        }
    }

    pub fn is_maintainer(&self) -> bool {
        matches!(self, ContributorRole::Owner | ContributorRole::Member)
    }
}

/// Commit/PR author identity used by the contributor stats.
#[derive(Debug, Clone, Serialize)]
pub struct UserRef {
    pub login: String,
    pub id: u64,
    pub avatar_url: String,
    pub html_url: String,
}

#[derive(Debug, Clone)]
pub struct CommitRecord {
    pub author: Option<UserRef>,
}

#[derive(Debug, Clone)]
pub struct PullRecord {
    pub number: u64,
    pub title: String,
    pub state: IssueState,
    pub created_at: DateTime<Utc>,
    pub merged_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub html_url: String,
    pub user: Option<UserRef>,
    pub repo: RepoId,
}

// Wire structs matching the REST payloads we consume.

#[derive(Deserialize)]
struct RawSearchResults {
    total_count: u64,
    items: Vec<RawIssue>,
}

#[derive(Deserialize)]
struct RawIssue {
    number: u64,
    title: String,
    html_url: String,
    created_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
    state: String,
    user: Option<RawActor>,
    #[serde(default)]
    labels: Vec<RawLabel>,
    #[serde(default)]
    comments: u32,
    pull_request: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct RawActor {
    login: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

impl RawActor {
    fn is_bot(&self) -> bool {
        self.kind.as_deref() == Some("Bot") || self.login.ends_with("[bot]")
    }
}

#[derive(Deserialize)]
struct RawLabel {
    name: String,
}

#[derive(Deserialize)]
struct RawComment {
    id: u64,
    user: Option<RawActor>,
    created_at: DateTime<Utc>,
    body: Option<String>,
}

#[derive(Deserialize)]
struct RawTimelineEvent {
    event: String,
    #[serde(default)]
    actor: Option<RawActor>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    label: Option<RawLabel>,
    #[serde(default)]
    source: Option<RawSource>,
}

#[derive(Deserialize)]
struct RawSource {
    issue: Option<RawSourceIssue>,
}

#[derive(Deserialize)]
struct RawSourceIssue {
    number: u64,
    pull_request: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct RawPermission {
    permission: String,
}

#[derive(Deserialize)]
struct RawRateLimit {
    rate: RawRate,
}

#[derive(Deserialize)]
struct RawRate {
    reset: i64,
}

#[derive(Deserialize)]
struct RawCommit {
    author: Option<RawUserRef>,
}

#[derive(Deserialize)]
struct RawUserRef {
    login: String,
    id: u64,
    avatar_url: String,
    html_url: String,
}

impl From<RawUserRef> for UserRef {
    fn from(raw: RawUserRef) -> Self {
        UserRef {
            login: raw.login,
            id: raw.id,
            avatar_url: raw.avatar_url,
            html_url: raw.html_url,
        }
    }
}

#[derive(Deserialize)]
struct RawPull {
    number: u64,
    title: String,
    state: String,
    created_at: DateTime<Utc>,
    merged_at: Option<DateTime<Utc>>,
    closed_at: Option<DateTime<Utc>>,
    html_url: String,
    user: Option<RawUserRef>,
}

#[derive(Serialize)]
struct SearchParams<'a> {
    q: &'a str,
    per_page: u32,
    page: u32,
    sort: &'a str,
    order: &'a str,
}

#[derive(Serialize)]
struct PageParams {
    per_page: u32,
    page: u32,
}

#[derive(Serialize)]
struct CommitParams<'a> {
    since: &'a str,
    until: &'a str,
    per_page: u32,
    page: u32,
}

#[derive(Serialize)]
struct PullParams<'a> {
    state: &'a str,
    sort: &'a str,
    direction: &'a str,
    per_page: u32,
    page: u32,
}

/// Search query scoping to a repository, excluding PRs, with the end boundary
/// advanced to the start of the following day so the entire end date is
/// included.
pub fn issue_search_query(repo: &RepoId, start: NaiveDate, end: NaiveDate) -> String {
    let end_exclusive = end.checked_add_days(Days::new(1)).unwrap_or(end);
    format!("repo:{repo} is:issue created:{start}T00:00:00Z..{end_exclusive}T00:00:00Z")
}

fn truncate_body(body: &str) -> String {
    if body.len() <= COMMENT_BODY_LIMIT {
        return body.to_string();
    }
    let mut end = COMMENT_BODY_LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

pub struct GitHubClient {
    octocrab: Octocrab,
    policy: RetryPolicy,
}

impl GitHubClient {
    pub fn new(token: Option<String>, policy: RetryPolicy) -> anyhow::Result<Self> {
        let mut builder = Octocrab::builder();
        if let Some(token) = token {
            builder = builder.personal_token(token);
        }

        Ok(Self {
            octocrab: builder.build()?,
            policy,
        })
    }

    /// Retrieves one page of issues created in the date window.
    pub async fn search_issues_page(
        &self,
        repo: &RepoId,
        start: NaiveDate,
        end: NaiveDate,
        page: u32,
        per_page: u32,
    ) -> Result<SearchPage, FetchError> {
        let query = issue_search_query(repo, start, end);
        let params = SearchParams {
            q: &query,
            per_page: per_page.min(100),
            page,
            sort: "created",
            order: "desc",
        };

        let results: RawSearchResults = self.get_json("/search/issues", Some(&params)).await?;

        let issues = results
            .items
            .into_iter()
            .filter(|item| item.pull_request.is_none())
            .map(|item| IssueRecord {
                number: item.number,
                title: item.title,
                html_url: item.html_url,
                created_at: item.created_at,
                closed_at: item.closed_at,
                state: if item.state == "closed" {
                    IssueState::Closed
                } else {
                    IssueState::Open
                },
                user: item
                    .user
                    .map(|u| u.login)
                    .unwrap_or_else(|| "ghost".to_string()),
                labels: item.labels.into_iter().map(|l| l.name).collect(),
                comment_count: item.comments,
                repo: repo.clone(),
            })
            .collect();

        Ok(SearchPage {
            total_count: results.total_count,
            issues,
        })
    }

    /// Retrieves comments and timeline events for a single issue.
    pub async fn fetch_issue_details(
        &self,
        repo: &RepoId,
        issue_number: u64,
    ) -> Result<IssueDetails, FetchError> {
        let comments_route = format!(
            "/repos/{}/{}/issues/{}/comments",
            repo.owner, repo.repo, issue_number
        );
        let timeline_route = format!(
            "/repos/{}/{}/issues/{}/timeline",
            repo.owner, repo.repo, issue_number
        );

        let comment_params = PageParams {
            per_page: COMMENTS_PER_ISSUE,
            page: 1,
        };
        let timeline_params = PageParams {
            per_page: TIMELINE_EVENTS_PER_ISSUE,
            page: 1,
        };

        let (comments, timeline) = futures::try_join!(
            self.get_json::<Vec<RawComment>, _>(&comments_route, Some(&comment_params)),
            self.get_json::<Vec<RawTimelineEvent>, _>(&timeline_route, Some(&timeline_params)),
        )?;

        Ok(IssueDetails {
            comments: comments
                .into_iter()
                .map(|c| IssueComment {
                    id: c.id,
                    user_is_bot: c.user.as_ref().is_some_and(RawActor::is_bot),
                    user: c.user.map(|u| u.login),
                    created_at: c.created_at,
                    body: truncate_body(c.body.as_deref().unwrap_or_default()),
                })
                .collect(),
            timeline: timeline.into_iter().map(map_timeline_event).collect(),
        })
    }

    /// Membership check: 2xx means member, 404 means not a member.
    pub async fn check_org_membership(
        &self,
        org: &str,
        username: &str,
    ) -> Result<bool, FetchError> {
        let route = format!("/orgs/{org}/members/{username}");
        fetch_with_retry(&self.policy, || self.membership_once(&route)).await
    }

    async fn membership_once(&self, route: &str) -> Result<bool, FetchError> {
        match self.octocrab._get(route.to_string()).await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    Ok(true)
                } else if status.as_u16() == 404 || status.as_u16() == 302 {
                    Ok(false)
                } else {
                    Err(self
                        .with_rate_limit_reset(FetchError::Status {
                            status: status.as_u16(),
                            message: "membership check failed".to_string(),
                        })
                        .await)
                }
            }
            Err(err) => {
                let classified = FetchError::from_octocrab(&err);
                if classified.is_not_found() {
                    Ok(false)
                } else {
                    Err(self.with_rate_limit_reset(classified).await)
                }
            }
        }
    }

    /// Permission level of a collaborator: admin, write, maintain, read,
    /// triage or none.
    pub async fn collaborator_permission(
        &self,
        repo: &RepoId,
        username: &str,
    ) -> Result<String, FetchError> {
        let route = format!(
            "/repos/{}/{}/collaborators/{}/permission",
            repo.owner, repo.repo, username
        );
        let raw: RawPermission = self.get_json(&route, None::<&()>).await?;
        Ok(raw.permission)
    }

    /// Commits in the window, one page at a time.
    pub async fn list_commits_page(
        &self,
        repo: &RepoId,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<CommitRecord>, FetchError> {
        let route = format!("/repos/{}/{}/commits", repo.owner, repo.repo);
        let since = since.to_rfc3339();
        let until = until.to_rfc3339();
        let params = CommitParams {
            since: &since,
            until: &until,
            per_page: per_page.min(100),
            page,
        };

        let commits: Vec<RawCommit> = self.get_json(&route, Some(&params)).await?;
        Ok(commits
            .into_iter()
            .map(|c| CommitRecord {
                author: c.author.map(UserRef::from),
            })
            .collect())
    }

    /// Pull requests sorted by creation date descending, one page at a time.
    pub async fn list_pulls_page(
        &self,
        repo: &RepoId,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<PullRecord>, FetchError> {
        let route = format!("/repos/{}/{}/pulls", repo.owner, repo.repo);
        let params = PullParams {
            state: "all",
            sort: "created",
            direction: "desc",
            per_page: per_page.min(100),
            page,
        };

        let pulls: Vec<RawPull> = self.get_json(&route, Some(&params)).await?;
        Ok(pulls
            .into_iter()
            .map(|p| PullRecord {
                number: p.number,
                title: p.title,
                state: if p.state == "closed" {
                    IssueState::Closed
                } else {
                    IssueState::Open
                },
                created_at: p.created_at,
                merged_at: p.merged_at,
                closed_at: p.closed_at,
                html_url: p.html_url,
                user: p.user.map(UserRef::from),
                repo: repo.clone(),
            })
            .collect())
    }

    async fn get_json<T, P>(&self, route: &str, params: Option<&P>) -> Result<T, FetchError>
    where
        T: DeserializeOwned,
        P: Serialize + ?Sized,
    {
        fetch_with_retry(&self.policy, || self.get_once(route, params)).await
    }

    async fn get_once<T, P>(&self, route: &str, params: Option<&P>) -> Result<T, FetchError>
    where
        T: DeserializeOwned,
        P: Serialize + ?Sized,
    {
        match self.octocrab.get::<T, _, _>(route, params).await {
            Ok(value) => Ok(value),
            Err(err) => Err(self
                .with_rate_limit_reset(FetchError::from_octocrab(&err))
                .await),
        }
    }

    /// Octocrab's error type does not carry response headers, so when a call
    /// is rejected for quota we ask the dedicated endpoint when the window
    /// resets. That endpoint is exempt from the rate limit itself.
    async fn with_rate_limit_reset(&self, err: FetchError) -> FetchError {
        match err {
            FetchError::RateLimited { reset: None } => FetchError::RateLimited {
                reset: self.rate_limit_reset().await,
            },
            other => other,
        }
    }

    async fn rate_limit_reset(&self) -> Option<DateTime<Utc>> {
        let limits: RawRateLimit = self.octocrab.get("/rate_limit", None::<&()>).await.ok()?;
        DateTime::<Utc>::from_timestamp(limits.rate.reset, 0)
    }
}

fn map_timeline_event(raw: RawTimelineEvent) -> TimelineEvent {
    let kind = match raw.event.as_str() {
        "labeled" => TimelineKind::Labeled,
        "cross-referenced" => TimelineKind::CrossReferenced,
        _ => TimelineKind::Other,
    };

    let (source_issue, source_is_pull) = raw
        .source
        .and_then(|s| s.issue)
        .map(|i| (Some(i.number), i.pull_request.is_some()))
        .unwrap_or((None, false));

    TimelineEvent {
        kind,
        actor_is_bot: raw.actor.as_ref().is_some_and(RawActor::is_bot),
        actor: raw.actor.map(|a| a.login),
        created_at: raw.created_at,
        label: raw.label.map(|l| l.name),
        source_issue,
        source_is_pull,
    }
}
