//! Jira Cloud REST v3 issue-tracker adapter.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::NaiveDate;
use leadtime_core::{Project, PullRequestIdentifier, PullRequestLinks, Release, Story};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{error, info, warn};

use crate::http::{Auth, HttpFetcher};
use crate::{optional_day, required_timestamp, string_or_number, validate_identifiers, AdapterError, IssueTracker};

pub const SEARCH_PAGE_SIZE: u32 = 25;
pub const VERSION_PAGE_SIZE: u32 = 50;
pub const SOFTWARE_PROJECT_TYPE: &str = "software";
pub const SEARCH_FIELDS: &str = "fixVersions,key,summary,issuetype,created,resolutiondate";
const PROGRESS_EVERY: usize = 25;

#[derive(Clone, PartialEq, Eq)]
pub struct JiraCredentials {
    pub instance: String,
    pub email: String,
    pub token: String,
}

impl std::fmt::Debug for JiraCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JiraCredentials")
            .field("instance", &self.instance)
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct ProjectPayload {
    #[serde(deserialize_with = "string_or_number")]
    id: String,
    key: String,
    name: String,
    #[serde(rename = "projectTypeKey", default)]
    project_type_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VersionPagePayload {
    #[serde(default)]
    values: Vec<VersionPayload>,
    #[serde(rename = "isLast", default)]
    is_last: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct VersionPayload {
    #[serde(deserialize_with = "string_or_number")]
    id: String,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    released: bool,
    #[serde(rename = "releaseDate", default)]
    release_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchPayload {
    total: u64,
    #[serde(default)]
    issues: Vec<IssuePayload>,
}

#[derive(Debug, Deserialize)]
struct IssuePayload {
    key: String,
    fields: IssueFields,
}

#[derive(Debug, Deserialize)]
struct IssueFields {
    summary: String,
    issuetype: IssueType,
    created: String,
    #[serde(default)]
    resolutiondate: Option<String>,
    #[serde(rename = "fixVersions", default)]
    fix_versions: Vec<FixVersion>,
}

#[derive(Debug, Deserialize)]
struct IssueType {
    name: String,
}

#[derive(Debug, Deserialize)]
struct FixVersion {
    #[serde(deserialize_with = "string_or_number")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct IssueIdPayload {
    #[serde(deserialize_with = "string_or_number")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct DevStatusPayload {
    #[serde(default)]
    detail: Vec<DevStatusDetail>,
}

#[derive(Debug, Deserialize)]
struct DevStatusDetail {
    #[serde(rename = "pullRequests", default)]
    pull_requests: Vec<DevStatusPullRequest>,
}

#[derive(Debug, Deserialize)]
struct DevStatusPullRequest {
    #[serde(default)]
    url: Option<String>,
}

/// Software projects only, ordered by title.
pub fn parse_projects(body: JsonValue) -> Result<Vec<Project>, AdapterError> {
    let payload: Vec<ProjectPayload> = serde_json::from_value(body)?;
    let mut projects = payload
        .into_iter()
        .filter(|p| p.project_type_key.as_deref() == Some(SOFTWARE_PROJECT_TYPE))
        .map(|p| Project {
            internal_id: p.id,
            key: p.key,
            title: p.name,
            project_type: SOFTWARE_PROJECT_TYPE.to_string(),
        })
        .collect::<Vec<_>>();
    projects.sort_by(|a, b| a.title.cmp(&b.title));
    Ok(projects)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionPage {
    pub releases: Vec<Release>,
    pub fetched: usize,
    pub is_last: bool,
}

/// One page of a project's versions, keeping released versions dated within `[start, end]`.
/// A bare array (the unpaginated endpoint) is treated as a single last page.
pub fn parse_versions(
    project_key: &str,
    body: JsonValue,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<VersionPage, AdapterError> {
    let (versions, is_last) = if body.is_array() {
        (serde_json::from_value::<Vec<VersionPayload>>(body)?, true)
    } else {
        let page: VersionPagePayload = serde_json::from_value(body)?;
        let is_last = page.is_last.unwrap_or(true) || page.values.is_empty();
        (page.values, is_last)
    };

    let fetched = versions.len();
    let mut releases = Vec::new();
    for version in versions {
        if !version.released {
            continue;
        }
        let Some(date) = optional_day("releaseDate", version.release_date.as_deref())? else {
            continue;
        };
        if date < start || date > end {
            continue;
        }
        releases.push(Release {
            internal_id: version.id,
            title: version.name,
            description: version.description,
            date,
            project_key: project_key.to_string(),
        });
    }

    Ok(VersionPage {
        releases,
        fetched,
        is_last,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPage {
    pub stories: Vec<Story>,
    pub issue_count: usize,
    pub total: u64,
}

/// One search page. An issue fixed in several requested versions yields one story per version.
pub fn parse_search_page(body: JsonValue, release_ids: &[String]) -> Result<SearchPage, AdapterError> {
    let payload: SearchPayload = serde_json::from_value(body)?;
    let issue_count = payload.issues.len();
    let mut stories = Vec::new();

    for issue in payload.issues {
        let created = required_timestamp("created", &issue.fields.created)?;
        let resolved = issue
            .fields
            .resolutiondate
            .as_deref()
            .map(|value| required_timestamp("resolutiondate", value))
            .transpose()?;
        for version in &issue.fields.fix_versions {
            if !release_ids.contains(&version.id) {
                continue;
            }
            stories.push(Story {
                key: issue.key.clone(),
                title: issue.fields.summary.clone(),
                story_type: issue.fields.issuetype.name.clone(),
                created,
                resolved,
                release_internal_id: version.id.clone(),
            });
        }
    }

    Ok(SearchPage {
        stories,
        issue_count,
        total: payload.total,
    })
}

pub fn parse_issue_id(body: JsonValue) -> Result<String, AdapterError> {
    let payload: IssueIdPayload = serde_json::from_value(body)?;
    Ok(payload.id)
}

/// Pull request identifiers from a development-status payload. URLs that do
/// not look like pull request links are logged and skipped.
pub fn parse_dev_status(body: JsonValue) -> Result<Vec<PullRequestIdentifier>, AdapterError> {
    let payload: DevStatusPayload = serde_json::from_value(body)?;
    let mut identifiers = Vec::new();
    for url in payload
        .detail
        .into_iter()
        .flat_map(|detail| detail.pull_requests)
        .filter_map(|pr| pr.url)
    {
        match PullRequestIdentifier::parse_url(&url) {
            Some(identifier) => identifiers.push(identifier),
            None => warn!(url, "skipping unrecognised pull request url"),
        }
    }
    Ok(identifiers)
}

pub fn stories_jql(release_ids: &[String]) -> String {
    format!(
        "fixVersion IN ({}) AND issuetype NOT IN ('Sub-task', \"Feature\", \"Epic\")",
        release_ids.join(",")
    )
}

#[derive(Debug, Clone)]
pub struct JiraClient {
    http: HttpFetcher,
    base_url: String,
    auth: Auth,
}

impl JiraClient {
    pub fn new(credentials: JiraCredentials, http: HttpFetcher) -> Result<Self, AdapterError> {
        let JiraCredentials { instance, email, token } = credentials;
        if [&instance, &email, &token].iter().any(|v| v.trim().is_empty()) {
            return Err(AdapterError::Config(
                "missing Jira credentials: JIRA_INSTANCE, EMAIL and ATLASSIAN_TOKEN are required".into(),
            ));
        }
        Ok(Self {
            http,
            base_url: base_url(&instance),
            auth: Auth::Basic {
                username: email,
                password: token,
            },
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<JsonValue, AdapterError> {
        let url = format!("{}{}", self.base_url, path);
        Ok(self.http.get_json(&url, query, &self.auth).await?)
    }

    async fn project_releases(
        &self,
        project_key: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Release>, AdapterError> {
        let path = format!("/rest/api/3/project/{project_key}/version");
        let mut start_at = 0usize;
        let mut releases = Vec::new();
        loop {
            let body = self
                .get(
                    &path,
                    &[
                        ("startAt", start_at.to_string()),
                        ("maxResults", VERSION_PAGE_SIZE.to_string()),
                    ],
                )
                .await?;
            let page = parse_versions(project_key, body, start, end)?;
            releases.extend(page.releases);
            start_at += page.fetched;
            if page.is_last {
                break;
            }
        }
        Ok(releases)
    }

    async fn story_pull_requests(&self, story_key: &str) -> Result<Vec<PullRequestIdentifier>, AdapterError> {
        let issue = self
            .get(&format!("/rest/api/3/issue/{story_key}"), &[("fields", "id".to_string())])
            .await?;
        let issue_id = parse_issue_id(issue)?;
        let dev_status = self
            .get(
                "/rest/dev-status/latest/issue/detail",
                &[
                    ("issueId", issue_id),
                    ("applicationType", "GitHub".to_string()),
                    ("dataType", "pullrequest".to_string()),
                ],
            )
            .await?;
        parse_dev_status(dev_status)
    }
}

fn base_url(instance: &str) -> String {
    let trimmed = instance.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

#[async_trait]
impl IssueTracker for JiraClient {
    async fn list_projects(&self) -> Result<Vec<Project>, AdapterError> {
        let body = self.get("/rest/api/3/project", &[]).await?;
        let projects = parse_projects(body)?;
        info!(count = projects.len(), "fetched software projects");
        Ok(projects)
    }

    async fn list_releases(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<Release>, AdapterError> {
        if start > end {
            return Err(AdapterError::InvalidInput(format!("release window {start}..{end} is reversed")));
        }

        let projects = self.list_projects().await?;
        let mut seen = HashSet::new();
        let mut releases = Vec::new();
        for project in &projects {
            match self.project_releases(&project.key, start, end).await {
                Ok(found) => {
                    for release in found {
                        if seen.insert(release.clone()) {
                            releases.push(release);
                        }
                    }
                }
                Err(err) => warn!(project = %project.key, error = %err, "skipping project versions"),
            }
        }

        info!(projects = projects.len(), count = releases.len(), %start, %end, "fetched releases");
        Ok(releases)
    }

    async fn list_stories(&self, release_ids: &[String]) -> Result<Vec<Story>, AdapterError> {
        validate_identifiers("release ids", release_ids)?;

        let jql = stories_jql(release_ids);
        let mut start_at: u64 = 0;
        let mut stories = Vec::new();
        loop {
            info!(start_at, "fetching stories page");
            let body = self
                .get(
                    "/rest/api/3/search",
                    &[
                        ("jql", jql.clone()),
                        ("maxResults", SEARCH_PAGE_SIZE.to_string()),
                        ("startAt", start_at.to_string()),
                        ("fields", SEARCH_FIELDS.to_string()),
                    ],
                )
                .await?;
            let page = parse_search_page(body, release_ids)?;
            start_at += page.issue_count as u64;
            stories.extend(page.stories);
            info!(issues = page.issue_count, start_at, total = page.total, stories = stories.len(), "stories page");

            if start_at >= page.total {
                break;
            }
            if page.issue_count == 0 {
                warn!(start_at, total = page.total, "empty stories page before reaching total");
                break;
            }
        }

        info!(releases = release_ids.len(), count = stories.len(), "fetched stories");
        Ok(stories)
    }

    async fn list_pull_request_links(&self, story_keys: &[String]) -> Result<PullRequestLinks, AdapterError> {
        validate_identifiers("story keys", story_keys)?;

        let mut links = PullRequestLinks::new();
        let mut without_prs = 0usize;
        for (index, story_key) in story_keys.iter().enumerate() {
            let prs = match self.story_pull_requests(story_key).await {
                Ok(prs) => prs,
                Err(err) => {
                    error!(story = %story_key, error = %err, "pull request lookup failed");
                    Vec::new()
                }
            };
            if prs.is_empty() {
                without_prs += 1;
            }
            links.insert(story_key.clone(), prs);

            let processed = index + 1;
            if processed % PROGRESS_EVERY == 0 {
                info!(processed, without_prs, "stories checked for pull requests");
            }
        }

        info!(processed = story_keys.len(), without_prs, "stories checked for pull requests");
        Ok(links)
    }
}
