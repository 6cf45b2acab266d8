//! Core entity model and calendar helpers for lead-time tracking.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "leadtime-core";

/// Issue-tracker project. `internal_id` is the tracker's own stable id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub internal_id: String,
    pub key: String,
    pub title: String,
    pub project_type: String,
}

/// A released, dated fix version belonging to a project (by key).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Release {
    pub internal_id: String,
    pub title: String,
    pub description: Option<String>,
    pub date: NaiveDate,
    pub project_key: String,
}

/// One story membership in one release. A story fixed in two versions yields two values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Story {
    pub key: String,
    pub title: String,
    pub story_type: String,
    pub created: DateTime<Utc>,
    pub resolved: Option<DateTime<Utc>>,
    pub release_internal_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PullRequestIdentifier {
    pub owner: String,
    pub repository: String,
    pub number: u64,
}

impl PullRequestIdentifier {
    pub fn new(owner: impl Into<String>, repository: impl Into<String>, number: u64) -> Self {
        Self {
            owner: owner.into(),
            repository: repository.into(),
            number,
        }
    }

    pub fn url(&self) -> String {
        format!(
            "https://github.com/{}/{}/pull/{}",
            self.owner, self.repository, self.number
        )
    }

    /// Parse `https://github.com/<owner>/<repo>/pull/<number>`.
    pub fn parse_url(url: &str) -> Option<Self> {
        let parts = url.split('/').collect::<Vec<_>>();
        let owner = parts.get(3).filter(|s| !s.is_empty())?;
        let repository = parts.get(4).filter(|s| !s.is_empty())?;
        let number = parts.get(6)?.parse::<u64>().ok()?;
        Some(Self::new(*owner, *repository, number))
    }
}

impl fmt::Display for PullRequestIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.owner, self.repository, self.number)
    }
}

/// Stored identifier row whose detail fields have not been fetched yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPullRequest {
    pub id: i64,
    pub identifier: PullRequestIdentifier,
}

/// Pull request details, keyed by the surrogate id of the stored identifier row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: i64,
    pub identifier: PullRequestIdentifier,
    pub title: String,
    pub open_date: Option<NaiveDate>,
    pub close_date: Option<NaiveDate>,
    pub commit_count: u32,
    pub earliest_commit: Option<NaiveDate>,
    pub latest_commit: Option<NaiveDate>,
}

/// Story key -> linked pull requests. An empty list records a confirmed absence.
pub type PullRequestLinks = BTreeMap<String, Vec<PullRequestIdentifier>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Self {
        Self { year, month }
    }

    pub fn label(&self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }

    pub fn next(self) -> Self {
        if self.month == 12 {
            Self::new(self.year + 1, 1)
        } else {
            Self::new(self.year, self.month + 1)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthBoundary {
    pub year: i32,
    pub month: u32,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Calendar months touched by `[start, end]`, both ends inclusive.
pub fn months_between(start: NaiveDate, end: NaiveDate) -> Vec<YearMonth> {
    let last = YearMonth::new(end.year(), end.month());
    let mut current = YearMonth::new(start.year(), start.month());
    let mut months = Vec::new();
    while current <= last {
        months.push(current);
        current = current.next();
    }
    months
}

/// First and last calendar day of a month; `None` when `month` is outside 1..=12.
pub fn month_bounds(year: i32, month: u32) -> Option<MonthBoundary> {
    let start = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = YearMonth::new(year, month).next();
    let end = NaiveDate::from_ymd_opt(next.year, next.month, 1)? - Duration::days(1);
    Some(MonthBoundary {
        year,
        month,
        start,
        end,
    })
}
