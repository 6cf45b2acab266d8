//! GitHub REST adapter for pull request details.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use leadtime_core::{PendingPullRequest, PullRequest};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{error, info, warn};

use crate::http::{Auth, HttpFetcher};
use crate::{optional_day, AdapterError, SourceHost};

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
pub const COMMITS_PER_PAGE: u32 = 100;
/// GitHub stops listing a pull request's commits after this many, however it is paged.
pub const MAX_LISTED_COMMITS: usize = 250;
const PROGRESS_EVERY: usize = 25;

#[derive(Debug, Deserialize)]
struct PullRequestPayload {
    title: String,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    closed_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommitPayload {
    commit: CommitDetail,
}

#[derive(Debug, Deserialize)]
struct CommitDetail {
    committer: Committer,
}

#[derive(Debug, Deserialize)]
struct Committer {
    date: String,
}

/// Committer day of every commit in a pull request's commit listing.
pub fn parse_commit_dates(body: JsonValue) -> Result<Vec<NaiveDate>, AdapterError> {
    let commits: Vec<CommitPayload> = serde_json::from_value(body)?;
    commits
        .iter()
        .map(|c| {
            optional_day("commit.committer.date", Some(c.commit.committer.date.as_str()))?
                .ok_or_else(|| AdapterError::Payload("commit without committer date".into()))
        })
        .collect()
}

/// Page to request after `page` returned `page_len` entries with `listed`
/// collected so far. `None` once a short page or the listing cap is reached.
pub fn next_commit_page(page: u32, page_len: usize, listed: usize) -> Option<u32> {
    if page_len < COMMITS_PER_PAGE as usize || listed >= MAX_LISTED_COMMITS {
        None
    } else {
        Some(page + 1)
    }
}

/// Combines the pull request payload with its commit days into a detail record.
pub fn parse_pull_request(
    pending: &PendingPullRequest,
    body: JsonValue,
    commit_dates: &[NaiveDate],
) -> Result<PullRequest, AdapterError> {
    let payload: PullRequestPayload = serde_json::from_value(body)?;
    Ok(PullRequest {
        id: pending.id,
        identifier: pending.identifier.clone(),
        title: payload.title,
        open_date: optional_day("created_at", payload.created_at.as_deref())?,
        close_date: optional_day("closed_at", payload.closed_at.as_deref())?,
        commit_count: u32::try_from(commit_dates.len()).unwrap_or(u32::MAX),
        earliest_commit: commit_dates.iter().min().copied(),
        latest_commit: commit_dates.iter().max().copied(),
    })
}

#[derive(Debug, Clone)]
pub struct GitHubClient {
    http: HttpFetcher,
    api_base: String,
    tokens: BTreeMap<String, String>,
}

impl GitHubClient {
    /// `tokens` maps an owner (organisation or user) to its API token.
    pub fn new(tokens: BTreeMap<String, String>, http: HttpFetcher) -> Result<Self, AdapterError> {
        let tokens = tokens
            .into_iter()
            .filter(|(_, token)| !token.trim().is_empty())
            .collect::<BTreeMap<_, _>>();
        if tokens.is_empty() {
            return Err(AdapterError::Config("no GitHub tokens configured".into()));
        }
        Ok(Self {
            http,
            api_base: DEFAULT_API_BASE.to_string(),
            tokens,
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn owners(&self) -> impl Iterator<Item = &str> {
        self.tokens.keys().map(String::as_str)
    }

    async fn fetch_one(&self, pending: &PendingPullRequest, auth: &Auth) -> Result<PullRequest, AdapterError> {
        let id = &pending.identifier;
        let pr_url = format!("{}/repos/{}/{}/pulls/{}", self.api_base, id.owner, id.repository, id.number);
        let body = self.http.get_json(&pr_url, &[], auth).await?;

        let commit_dates = self.fetch_commit_dates(&format!("{pr_url}/commits"), pending, auth).await?;
        parse_pull_request(pending, body, &commit_dates)
    }

    async fn fetch_commit_dates(
        &self,
        commits_url: &str,
        pending: &PendingPullRequest,
        auth: &Auth,
    ) -> Result<Vec<NaiveDate>, AdapterError> {
        let mut dates = Vec::new();
        let mut page = 1;
        loop {
            let query = [
                ("per_page", COMMITS_PER_PAGE.to_string()),
                ("page", page.to_string()),
            ];
            let body = match self.http.get_json(commits_url, &query, auth).await {
                Ok(body) => body,
                Err(err) => {
                    warn!(
                        pull_request = %pending.identifier,
                        page,
                        listed = dates.len(),
                        error = %err,
                        "commit listing unavailable, keeping commits listed so far"
                    );
                    break;
                }
            };
            let page_dates = parse_commit_dates(body)?;
            let page_len = page_dates.len();
            dates.extend(page_dates);
            match next_commit_page(page, page_len, dates.len()) {
                Some(next) => page = next,
                None => break,
            }
        }
        dates.truncate(MAX_LISTED_COMMITS);
        Ok(dates)
    }
}

#[async_trait]
impl SourceHost for GitHubClient {
    async fn fetch_pull_request_details(
        &self,
        pending: &[PendingPullRequest],
    ) -> Result<Vec<PullRequest>, AdapterError> {
        let mut details = Vec::with_capacity(pending.len());
        for (index, item) in pending.iter().enumerate() {
            let Some(token) = self.tokens.get(&item.identifier.owner) else {
                warn!(owner = %item.identifier.owner, pull_request = %item.identifier, "no token for owner, skipping");
                continue;
            };

            match self.fetch_one(item, &Auth::Token(token.clone())).await {
                Ok(detail) => details.push(detail),
                Err(err) => error!(pull_request = %item.identifier, error = %err, "could not fetch pull request details"),
            }

            let processed = index + 1;
            if processed % PROGRESS_EVERY == 0 {
                info!(processed, total = pending.len(), "pull requests processed");
            }
        }

        info!(fetched = details.len(), total = pending.len(), "pull request details fetched");
        Ok(details)
    }
}
