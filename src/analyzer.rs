//! Issue response-time analysis.
//!
//! Given one issue plus (optionally) its comments and timeline, decides
//! whether and when the issue received a qualifying first response. A
//! qualifying response is a comment, a label addition, or a pull-request
//! cross-reference by a non-creator, non-bot actor, with maintainers
//! preferred where the signal allows it. The earliest signal wins.

use crate::config::RepoId;
use crate::github::{IssueComment, IssueDetails, IssueRecord, IssueState, TimelineEvent, TimelineKind};
use crate::membership::{MembershipResolver, MembershipSource};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

/// Target for a first response, in hours.
pub const SLA_HOURS: f64 = 48.0;

/// Infallible maintainer lookup, implemented by [`MembershipResolver`].
pub trait PrivilegeChecker: Send + Sync {
    fn is_privileged<'a>(&'a self, login: &'a str) -> BoxFuture<'a, bool>;
}

impl<S: MembershipSource> PrivilegeChecker for MembershipResolver<S> {
    fn is_privileged<'a>(&'a self, login: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(MembershipResolver::is_privileged(self, login))
    }
}

/// Which mechanism produced the response timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseSource {
    Comment,
    Timeline,
    Closed,
    Maintainer,
}

/// An issue with its response-time classification attached.
///
/// Field names mirror the JSON the dashboard frontend consumes: GitHub-shaped
/// fields stay snake_case, derived fields are camelCase.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyzedIssue {
    pub number: u64,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub state: IssueState,
    pub html_url: String,
    pub user: String,
    pub labels: Vec<String>,
    pub repo: RepoId,
    #[serde(rename = "hasResponse")]
    pub has_response: bool,
    #[serde(rename = "responseTimeInHours")]
    pub response_time_in_hours: Option<f64>,
    #[serde(rename = "meetsSLA")]
    pub meets_sla: bool,
    #[serde(rename = "responseSource")]
    pub response_source: Option<ResponseSource>,
    /// Set when detail data could not be fetched and the issue was classified
    /// via the detail-less fallback.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

enum Outcome {
    Responded {
        at: DateTime<Utc>,
        source: ResponseSource,
    },
    Unresponded,
}

pub struct IssueAnalyzer<P> {
    privileges: P,
    /// Label whose addition counts as a response regardless of the actor.
    ops_label: Option<String>,
}

impl<P: PrivilegeChecker> IssueAnalyzer<P> {
    pub fn new(privileges: P, ops_label: Option<String>) -> Self {
        Self {
            privileges,
            ops_label,
        }
    }

    /// Classifies one issue. Never fails: a missing `details` falls back to
    /// the cheap closed/open rules.
    pub async fn analyze(
        &self,
        issue: &IssueRecord,
        details: Option<&IssueDetails>,
        now: DateTime<Utc>,
    ) -> AnalyzedIssue {
        // A maintainer filing an issue is presumed self-resolved from t=0.
        // This takes precedence over every other rule.
        if self.privileges.is_privileged(&issue.user).await {
            return assemble(
                issue,
                Outcome::Responded {
                    at: issue.created_at,
                    source: ResponseSource::Maintainer,
                },
                now,
            );
        }

        let outcome = match details {
            None => shallow_outcome(issue),
            Some(details) => self.full_outcome(issue, details).await,
        };

        assemble(issue, outcome, now)
    }

    async fn full_outcome(&self, issue: &IssueRecord, details: &IssueDetails) -> Outcome {
        // All three candidates are collected before comparison; an earlier
        // comment must beat a label event even though the label signal is
        // evaluated later.
        let mut candidates: Vec<(DateTime<Utc>, ResponseSource)> = Vec::new();

        if let Some(at) = self.first_comment_response(issue, &details.comments).await {
            candidates.push((at, ResponseSource::Comment));
        }
        if let Some(at) = self.first_label_response(issue, &details.timeline).await {
            candidates.push((at, ResponseSource::Timeline));
        }
        if let Some(at) = first_pull_reference(issue, &details.timeline) {
            candidates.push((at, ResponseSource::Timeline));
        }

        match candidates.into_iter().min_by_key(|(at, _)| *at) {
            Some((at, source)) => Outcome::Responded { at, source },
            None => shallow_outcome(issue),
        }
    }

    /// Earliest non-creator, non-bot comment, preferring one from a verified
    /// maintainer over an earlier one from anybody else.
    async fn first_comment_response(
        &self,
        issue: &IssueRecord,
        comments: &[IssueComment],
    ) -> Option<DateTime<Utc>> {
        let mut qualifying: Vec<&IssueComment> = comments
            .iter()
            .filter(|c| !c.user_is_bot && c.user.as_deref() != Some(issue.user.as_str()))
            .collect();
        qualifying.sort_by_key(|c| c.created_at);

        for comment in &qualifying {
            if let Some(login) = &comment.user {
                if self.privileges.is_privileged(login).await {
                    return Some(comment.created_at);
                }
            }
        }

        qualifying.first().map(|c| c.created_at)
    }

    /// Earliest qualifying `labeled` event: non-creator non-bot actor, or the
    /// configured ops label regardless of actor. Maintainer actors preferred.
    async fn first_label_response(
        &self,
        issue: &IssueRecord,
        timeline: &[TimelineEvent],
    ) -> Option<DateTime<Utc>> {
        let mut qualifying: Vec<&TimelineEvent> = timeline
            .iter()
            .filter(|e| e.kind == TimelineKind::Labeled && e.created_at.is_some())
            .filter(|e| {
                let by_team = e.actor.is_some()
                    && !e.actor_is_bot
                    && e.actor.as_deref() != Some(issue.user.as_str());
                let ops = self.ops_label.is_some() && e.label == self.ops_label;
                by_team || ops
            })
            .collect();
        qualifying.sort_by_key(|e| e.created_at);

        for event in &qualifying {
            if let Some(actor) = &event.actor {
                if !event.actor_is_bot && self.privileges.is_privileged(actor).await {
                    return event.created_at;
                }
            }
        }

        qualifying.first().and_then(|e| e.created_at)
    }
}

/// Earliest `cross-referenced` event whose source is a pull request, is not
/// the issue referencing itself, and was not produced by a bot.
fn first_pull_reference(issue: &IssueRecord, timeline: &[TimelineEvent]) -> Option<DateTime<Utc>> {
    timeline
        .iter()
        .filter(|e| {
            e.kind == TimelineKind::CrossReferenced
                && e.source_is_pull
                && e.source_issue != Some(issue.number)
                && !e.actor_is_bot
        })
        .filter_map(|e| e.created_at)
        .min()
}

/// Classification without comment/timeline data: closure counts as the
/// response, an open issue keeps waiting.
fn shallow_outcome(issue: &IssueRecord) -> Outcome {
    match (issue.state, issue.closed_at) {
        (IssueState::Closed, Some(closed_at)) => Outcome::Responded {
            at: closed_at,
            source: ResponseSource::Closed,
        },
        _ => Outcome::Unresponded,
    }
}

fn assemble(issue: &IssueRecord, outcome: Outcome, now: DateTime<Utc>) -> AnalyzedIssue {
    let (has_response, hours, source) = match outcome {
        Outcome::Responded { at, source } => {
            (true, hours_between(issue.created_at, at), Some(source))
        }
        // Running clock: how long the issue has been waiting so far.
        Outcome::Unresponded => (false, hours_between(issue.created_at, now), None),
    };

    let meets_sla = has_response && hours <= SLA_HOURS;

    AnalyzedIssue {
        number: issue.number,
        title: issue.title.clone(),
        created_at: issue.created_at,
        closed_at: issue.closed_at,
        state: issue.state,
        html_url: issue.html_url.clone(),
        user: issue.user.clone(),
        labels: issue.labels.clone(),
        repo: issue.repo.clone(),
        has_response,
        response_time_in_hours: Some(hours),
        meets_sla,
        response_source: source,
        error: None,
    }
}

/// Elapsed hours rounded to one decimal place, clamped at zero so timestamp
/// anomalies never produce a negative response time.
fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let millis = to.signed_duration_since(from).num_milliseconds() as f64;
    let hours = ((millis / 3_600_000.0) * 10.0).round() / 10.0;
    hours.max(0.0)
}


#[cfg(test)]
mod tests {
    use super::testing::StaticChecker;
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, 0, 0).unwrap()
    }

    fn issue(created: DateTime<Utc>) -> IssueRecord {
        IssueRecord {
            number: 1,
            title: "chart renders blank".into(),
            html_url: "https://github.com/antvis/g2/issues/1".into(),
            created_at: created,
            closed_at: None,
            state: IssueState::Open,
            user: "reporter".into(),
            labels: vec![],
            comment_count: 0,
            repo: "antvis/g2".parse().unwrap(),
        }
    }

    fn closed_issue(created: DateTime<Utc>, closed: DateTime<Utc>) -> IssueRecord {
        IssueRecord {
            closed_at: Some(closed),
            state: IssueState::Closed,
            ..issue(created)
        }
    }

    fn comment(user: &str, created: DateTime<Utc>) -> IssueComment {
        IssueComment {
            id: 1,
            user: Some(user.into()),
            user_is_bot: false,
            created_at: created,
            body: "looking into it".into(),
        }
    }

    fn bot_comment(user: &str, created: DateTime<Utc>) -> IssueComment {
        IssueComment {
            user_is_bot: true,
            ..comment(user, created)
        }
    }

    fn label_event(actor: &str, label: &str, created: DateTime<Utc>) -> TimelineEvent {
        TimelineEvent {
            kind: TimelineKind::Labeled,
            actor: Some(actor.into()),
            actor_is_bot: false,
            created_at: Some(created),
            label: Some(label.into()),
            source_issue: None,
            source_is_pull: false,
        }
    }

    fn pr_reference(actor: &str, source: u64, created: DateTime<Utc>) -> TimelineEvent {
        TimelineEvent {
            kind: TimelineKind::CrossReferenced,
            actor: Some(actor.into()),
            actor_is_bot: false,
            created_at: Some(created),
            label: None,
            source_issue: Some(source),
            source_is_pull: true,
        }
    }

    fn analyzer() -> IssueAnalyzer<StaticChecker> {
        IssueAnalyzer::new(StaticChecker::of(&["maintainer"]), Some("OSCP".into()))
    }

    #[tokio::test]
    async fn test_privileged_creator_is_self_resolved() {
        let analyzer = IssueAnalyzer::new(StaticChecker::of(&["reporter"]), None);
        let created = at(2024, 1, 1, 0);
        let mut subject = issue(created);
        subject.comment_count = 3;

        // Signals that would otherwise yield a later response are ignored.
        let details = IssueDetails {
            comments: vec![comment("someone", at(2024, 1, 5, 0))],
            timeline: vec![],
        };

        let analyzed = analyzer
            .analyze(&subject, Some(&details), at(2024, 1, 10, 0))
            .await;

        assert!(analyzed.has_response);
        assert_eq!(analyzed.response_time_in_hours, Some(0.0));
        assert!(analyzed.meets_sla);
        assert_eq!(analyzed.response_source, Some(ResponseSource::Maintainer));
    }

    #[tokio::test]
    async fn test_first_valid_comment_within_sla() {
        let created = at(2024, 1, 1, 0);
        let details = IssueDetails {
            comments: vec![comment("someone", at(2024, 1, 2, 12))],
            timeline: vec![],
        };

        let analyzed = analyzer()
            .analyze(&issue(created), Some(&details), at(2024, 1, 10, 0))
            .await;

        assert!(analyzed.has_response);
        assert_eq!(analyzed.response_time_in_hours, Some(36.0));
        assert!(analyzed.meets_sla);
        assert_eq!(analyzed.response_source, Some(ResponseSource::Comment));
    }

    #[tokio::test]
    async fn test_closed_without_signals_counts_as_closed_response() {
        let created = at(2024, 1, 1, 0);
        let subject = closed_issue(created, at(2024, 1, 5, 0));

        let details = IssueDetails::default();
        let analyzed = analyzer()
            .analyze(&subject, Some(&details), at(2024, 1, 10, 0))
            .await;

        assert!(analyzed.has_response);
        assert_eq!(analyzed.response_time_in_hours, Some(96.0));
        assert!(!analyzed.meets_sla);
        assert_eq!(analyzed.response_source, Some(ResponseSource::Closed));
    }

    #[tokio::test]
    async fn test_open_unresponded_runs_the_clock() {
        let created = at(2024, 1, 1, 0);
        let now = created + chrono::Duration::days(10);

        let analyzed = analyzer().analyze(&issue(created), None, now).await;

        assert!(!analyzed.has_response);
        assert_eq!(analyzed.response_time_in_hours, Some(240.0));
        assert!(!analyzed.meets_sla);
        assert_eq!(analyzed.response_source, None);
    }

    #[tokio::test]
    async fn test_shallow_mode_closed_issue() {
        let created = at(2024, 1, 1, 0);
        let subject = closed_issue(created, at(2024, 1, 2, 0));

        let analyzed = analyzer().analyze(&subject, None, at(2024, 1, 10, 0)).await;

        assert!(analyzed.has_response);
        assert_eq!(analyzed.response_time_in_hours, Some(24.0));
        assert!(analyzed.meets_sla);
        assert_eq!(analyzed.response_source, Some(ResponseSource::Closed));
    }

    #[tokio::test]
    async fn test_earliest_candidate_wins_regardless_of_kind() {
        let created = at(2024, 1, 1, 0);

        // Comment earliest.
        let details = IssueDetails {
            comments: vec![comment("someone", at(2024, 1, 1, 6))],
            timeline: vec![
                label_event("triager", "bug", at(2024, 1, 1, 12)),
                pr_reference("fixer", 99, at(2024, 1, 2, 0)),
            ],
        };
        let analyzed = analyzer()
            .analyze(&issue(created), Some(&details), at(2024, 1, 10, 0))
            .await;
        assert_eq!(analyzed.response_source, Some(ResponseSource::Comment));
        assert_eq!(analyzed.response_time_in_hours, Some(6.0));

        // Label earliest.
        let details = IssueDetails {
            comments: vec![comment("someone", at(2024, 1, 2, 0))],
            timeline: vec![label_event("triager", "bug", at(2024, 1, 1, 3))],
        };
        let analyzed = analyzer()
            .analyze(&issue(created), Some(&details), at(2024, 1, 10, 0))
            .await;
        assert_eq!(analyzed.response_source, Some(ResponseSource::Timeline));
        assert_eq!(analyzed.response_time_in_hours, Some(3.0));

        // PR reference earliest.
        let details = IssueDetails {
            comments: vec![comment("someone", at(2024, 1, 2, 0))],
            timeline: vec![pr_reference("fixer", 99, at(2024, 1, 1, 1))],
        };
        let analyzed = analyzer()
            .analyze(&issue(created), Some(&details), at(2024, 1, 10, 0))
            .await;
        assert_eq!(analyzed.response_source, Some(ResponseSource::Timeline));
        assert_eq!(analyzed.response_time_in_hours, Some(1.0));
    }

    #[tokio::test]
    async fn test_creator_and_bot_comments_do_not_qualify() {
        let created = at(2024, 1, 1, 0);
        let details = IssueDetails {
            comments: vec![
                comment("reporter", at(2024, 1, 1, 1)),
                bot_comment("helper[bot]", at(2024, 1, 1, 2)),
                comment("someone", at(2024, 1, 3, 0)),
            ],
            timeline: vec![],
        };

        let analyzed = analyzer()
            .analyze(&issue(created), Some(&details), at(2024, 1, 10, 0))
            .await;

        assert_eq!(analyzed.response_time_in_hours, Some(48.0));
        assert!(analyzed.meets_sla);
    }

    #[tokio::test]
    async fn test_maintainer_comment_preferred_over_earlier_outsider() {
        let created = at(2024, 1, 1, 0);
        let details = IssueDetails {
            comments: vec![
                comment("someone", at(2024, 1, 1, 2)),
                comment("maintainer", at(2024, 1, 1, 8)),
            ],
            timeline: vec![],
        };

        let analyzed = analyzer()
            .analyze(&issue(created), Some(&details), at(2024, 1, 10, 0))
            .await;

        assert_eq!(analyzed.response_time_in_hours, Some(8.0));
        assert_eq!(analyzed.response_source, Some(ResponseSource::Comment));
    }

    #[tokio::test]
    async fn test_ops_label_qualifies_even_from_bot() {
        let created = at(2024, 1, 1, 0);
        let mut event = label_event("triage-app[bot]", "OSCP", at(2024, 1, 1, 4));
        event.actor_is_bot = true;

        let details = IssueDetails {
            comments: vec![],
            timeline: vec![event],
        };

        let analyzed = analyzer()
            .analyze(&issue(created), Some(&details), at(2024, 1, 10, 0))
            .await;

        assert!(analyzed.has_response);
        assert_eq!(analyzed.response_time_in_hours, Some(4.0));
        assert_eq!(analyzed.response_source, Some(ResponseSource::Timeline));
    }

    #[tokio::test]
    async fn test_bot_label_without_ops_name_ignored() {
        let created = at(2024, 1, 1, 0);
        let mut event = label_event("triage-app[bot]", "bug", at(2024, 1, 1, 4));
        event.actor_is_bot = true;

        let details = IssueDetails {
            comments: vec![],
            timeline: vec![event],
        };

        let analyzed = analyzer()
            .analyze(&issue(created), Some(&details), at(2024, 1, 10, 0))
            .await;

        assert!(!analyzed.has_response);
    }

    #[tokio::test]
    async fn test_self_reference_and_non_pr_sources_ignored() {
        let created = at(2024, 1, 1, 0);
        let self_ref = pr_reference("someone", 1, at(2024, 1, 1, 1));
        let mut issue_ref = pr_reference("someone", 50, at(2024, 1, 1, 2));
        issue_ref.source_is_pull = false;

        let details = IssueDetails {
            comments: vec![],
            timeline: vec![self_ref, issue_ref],
        };

        let analyzed = analyzer()
            .analyze(&issue(created), Some(&details), at(2024, 1, 10, 0))
            .await;

        assert!(!analyzed.has_response);
    }

    #[tokio::test]
    async fn test_negative_delta_clamped_to_zero() {
        // Imported issues can carry comments timestamped before the issue
        // itself.
        let created = at(2024, 1, 2, 0);
        let details = IssueDetails {
            comments: vec![comment("someone", at(2024, 1, 1, 0))],
            timeline: vec![],
        };

        let analyzed = analyzer()
            .analyze(&issue(created), Some(&details), at(2024, 1, 10, 0))
            .await;

        assert_eq!(analyzed.response_time_in_hours, Some(0.0));
        assert!(analyzed.meets_sla);
    }

    #[tokio::test]
    async fn test_rounding_to_one_decimal() {
        let created = at(2024, 1, 1, 0);
        let details = IssueDetails {
            comments: vec![comment(
                "someone",
                created + chrono::Duration::minutes(30),
            )],
            timeline: vec![],
        };

        let analyzed = analyzer()
            .analyze(&issue(created), Some(&details), at(2024, 1, 10, 0))
            .await;

        assert_eq!(analyzed.response_time_in_hours, Some(0.5));
    }

    #[tokio::test]
    async fn test_closed_issue_with_earlier_signal_uses_the_signal() {
        let created = at(2024, 1, 1, 0);
        let subject = closed_issue(created, at(2024, 1, 8, 0));
        let details = IssueDetails {
            comments: vec![comment("someone", at(2024, 1, 2, 0))],
            timeline: vec![],
        };

        let analyzed = analyzer()
            .analyze(&subject, Some(&details), at(2024, 1, 10, 0))
            .await;

        assert_eq!(analyzed.response_source, Some(ResponseSource::Comment));
        assert_eq!(analyzed.response_time_in_hours, Some(24.0));
    }
}
