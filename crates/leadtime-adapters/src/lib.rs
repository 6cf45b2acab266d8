//! Issue-tracker and source-host adapter contracts plus their HTTP implementations.
//!
//! All knowledge of remote JSON shapes lives in the pure `parse_*` functions
//! of the [`jira`] and [`github`] modules; the clients only sequence requests.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use leadtime_core::{PendingPullRequest, Project, PullRequest, PullRequestLinks, Release, Story};
use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod github;
pub mod http;
pub mod jira;

pub use github::GitHubClient;
pub use http::{Auth, FetchError, HttpClientConfig, HttpFetcher, RateLimit};
pub use jira::{JiraClient, JiraCredentials};

pub const CRATE_NAME: &str = "leadtime-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected payload: {0}")]
    Payload(String),
}

impl From<serde_json::Error> for AdapterError {
    fn from(err: serde_json::Error) -> Self {
        AdapterError::Payload(err.to_string())
    }
}

#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn list_projects(&self) -> Result<Vec<Project>, AdapterError>;

    /// Released, dated versions with a release date in `[start, end]`, across all projects.
    async fn list_releases(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<Release>, AdapterError>;

    /// One entry per (story, requested release) membership.
    async fn list_stories(&self, release_ids: &[String]) -> Result<Vec<Story>, AdapterError>;

    /// One entry per requested key; a key whose lookup failed maps to an empty list.
    async fn list_pull_request_links(&self, story_keys: &[String]) -> Result<PullRequestLinks, AdapterError>;
}

#[async_trait]
pub trait SourceHost: Send + Sync {
    /// Details for the identifiers that could be fetched. Skipped items are logged, never stubbed.
    async fn fetch_pull_request_details(
        &self,
        pending: &[PendingPullRequest],
    ) -> Result<Vec<PullRequest>, AdapterError>;
}

/// Rejects an empty list or blank entries before any request is made.
pub fn validate_identifiers(what: &str, values: &[String]) -> Result<(), AdapterError> {
    if values.is_empty() {
        return Err(AdapterError::InvalidInput(format!("{what} cannot be empty")));
    }
    if values.iter().any(|v| v.trim().is_empty()) {
        return Err(AdapterError::InvalidInput(format!("{what} cannot contain blank entries")));
    }
    Ok(())
}

/// RFC 3339, or the `+0000` offset form some trackers emit.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z")
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

/// Calendar day of a plain ISO date or of a timestamp (taken in UTC).
pub fn parse_day(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_timestamp(value).map(|ts| ts.date_naive()))
}

pub(crate) fn required_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>, AdapterError> {
    parse_timestamp(value).ok_or_else(|| AdapterError::Payload(format!("{field}: unparseable timestamp {value:?}")))
}

pub(crate) fn optional_day(field: &str, value: Option<&str>) -> Result<Option<NaiveDate>, AdapterError> {
    value
        .map(|v| parse_day(v).ok_or_else(|| AdapterError::Payload(format!("{field}: unparseable date {v:?}"))))
        .transpose()
}

/// Remote ids arrive as strings from some endpoints and numbers from others.
pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match JsonValue::deserialize(deserializer)? {
        JsonValue::String(s) => Ok(s),
        JsonValue::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("expected string or number id, got {other}"))),
    }
}
