//! Aggregate metric computation over analyzed issues.
//!
//! Pure functions over [`AnalyzedIssue`] slices; all fetching and caching
//! happens upstream of this module.

use crate::analyzer::AnalyzedIssue;
use crate::config::RepoId;
use crate::github::IssueState;
use serde::Serialize;

/// Per-repository rollup shown in the product comparison table.
#[derive(Debug, Clone, Serialize)]
pub struct RepoMetrics {
    pub repo: RepoId,
    pub total_issues: usize,
    pub resolved_count: usize,
    pub responded_count: usize,
    pub responded_48h_count: usize,
    /// Percentage of issues closed.
    pub resolve_rate: u32,
    /// Percentage of issues with any qualifying response.
    pub response_rate: u32,
    /// Percentage of issues responded to within the SLA.
    pub response_48h_rate: u32,
    pub avg_response_time_hours: Option<f64>,
}

/// Rollup for one repository. A repo with no issues in range reports full
/// compliance: the absence of problems is not a missed SLA.
pub fn repo_metrics(repo: &RepoId, issues: &[AnalyzedIssue]) -> RepoMetrics {
    let total = issues.len();
    if total == 0 {
        return RepoMetrics {
            repo: repo.clone(),
            total_issues: 0,
            resolved_count: 0,
            responded_count: 0,
            responded_48h_count: 0,
            resolve_rate: 100,
            response_rate: 100,
            response_48h_rate: 100,
            avg_response_time_hours: None,
        };
    }

    let resolved = issues
        .iter()
        .filter(|i| i.state == IssueState::Closed)
        .count();
    let responded = issues.iter().filter(|i| i.has_response).count();
    let responded_48h = issues.iter().filter(|i| i.meets_sla).count();

    RepoMetrics {
        repo: repo.clone(),
        total_issues: total,
        resolved_count: resolved,
        responded_count: responded,
        responded_48h_count: responded_48h,
        resolve_rate: percent(resolved, total),
        response_rate: percent(responded, total),
        response_48h_rate: percent(responded_48h, total),
        avg_response_time_hours: average_response_time(issues),
    }
}

/// Headline numbers across the whole selection.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryMetrics {
    pub total_issues: usize,
    pub responded_issues: usize,
    pub response_rate: u32,
    pub within_sla: usize,
    pub sla_rate: u32,
    pub avg_response_time: Option<f64>,
    pub median_response_time: Option<f64>,
}

pub fn summary_metrics(issues: &[AnalyzedIssue]) -> SummaryMetrics {
    let total = issues.len();
    let responded = issues.iter().filter(|i| i.has_response).count();
    let within_sla = issues.iter().filter(|i| i.meets_sla).count();

    let mut response_times: Vec<f64> = issues
        .iter()
        .filter(|i| i.has_response)
        .filter_map(|i| i.response_time_in_hours)
        .collect();
    response_times.sort_by(|a, b| a.total_cmp(b));

    let median = if response_times.is_empty() {
        None
    } else {
        Some(response_times[response_times.len() / 2])
    };

    SummaryMetrics {
        total_issues: total,
        responded_issues: responded,
        response_rate: if total > 0 { percent(responded, total) } else { 0 },
        within_sla,
        sla_rate: if total > 0 { percent(within_sla, total) } else { 0 },
        avg_response_time: average_response_time(issues),
        median_response_time: median,
    }
}

fn percent(part: usize, total: usize) -> u32 {
    ((part as f64 / total as f64) * 100.0).round() as u32
}

fn average_response_time(issues: &[AnalyzedIssue]) -> Option<f64> {
    let times: Vec<f64> = issues
        .iter()
        .filter(|i| i.has_response)
        .filter_map(|i| i.response_time_in_hours)
        .collect();

    if times.is_empty() {
        return None;
    }

    let avg = times.iter().sum::<f64>() / times.len() as f64;
    Some((avg * 10.0).round() / 10.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::ResponseSource;
    use chrono::{TimeZone, Utc};

    fn analyzed(
        state: IssueState,
        has_response: bool,
        hours: Option<f64>,
        meets_sla: bool,
    ) -> AnalyzedIssue {
        AnalyzedIssue {
            number: 1,
            title: "t".into(),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            closed_at: None,
            state,
            html_url: String::new(),
            user: "reporter".into(),
            labels: vec![],
            repo: "antvis/g2".parse().unwrap(),
            has_response,
            response_time_in_hours: hours,
            meets_sla,
            response_source: has_response.then_some(ResponseSource::Comment),
            error: None,
        }
    }

    #[test]
    fn test_zero_issue_repo_defaults_to_full_compliance() {
        let repo: RepoId = "antvis/g2".parse().unwrap();
        let metrics = repo_metrics(&repo, &[]);

        assert_eq!(metrics.total_issues, 0);
        assert_eq!(metrics.resolve_rate, 100);
        assert_eq!(metrics.response_rate, 100);
        assert_eq!(metrics.response_48h_rate, 100);
        assert_eq!(metrics.avg_response_time_hours, None);
    }

    #[test]
    fn test_repo_metrics_with_data() {
        let repo: RepoId = "antvis/g2".parse().unwrap();
        let issues = vec![
            analyzed(IssueState::Closed, true, Some(10.0), true),
            analyzed(IssueState::Closed, true, Some(30.0), true),
            analyzed(IssueState::Open, true, Some(80.0), false),
            analyzed(IssueState::Open, false, Some(200.0), false),
        ];

        let metrics = repo_metrics(&repo, &issues);

        assert_eq!(metrics.total_issues, 4);
        assert_eq!(metrics.resolved_count, 2);
        assert_eq!(metrics.responded_count, 3);
        assert_eq!(metrics.responded_48h_count, 2);
        assert_eq!(metrics.resolve_rate, 50);
        assert_eq!(metrics.response_rate, 75);
        assert_eq!(metrics.response_48h_rate, 50);
        // Unresponded running clocks are excluded from the average.
        assert_eq!(metrics.avg_response_time_hours, Some(40.0));
    }

    #[test]
    fn test_summary_empty_is_all_zeros() {
        let summary = summary_metrics(&[]);
        assert_eq!(summary.total_issues, 0);
        assert_eq!(summary.response_rate, 0);
        assert_eq!(summary.sla_rate, 0);
        assert_eq!(summary.avg_response_time, None);
        assert_eq!(summary.median_response_time, None);
    }

    #[test]
    fn test_summary_with_data() {
        let issues = vec![
            analyzed(IssueState::Closed, true, Some(12.0), true),
            analyzed(IssueState::Open, true, Some(24.0), true),
            analyzed(IssueState::Open, true, Some(72.0), false),
            analyzed(IssueState::Open, false, Some(100.0), false),
        ];

        let summary = summary_metrics(&issues);

        assert_eq!(summary.total_issues, 4);
        assert_eq!(summary.responded_issues, 3);
        assert_eq!(summary.response_rate, 75);
        assert_eq!(summary.within_sla, 2);
        assert_eq!(summary.sla_rate, 50);
        assert_eq!(summary.avg_response_time, Some(36.0));
        assert_eq!(summary.median_response_time, Some(24.0));
    }
}
