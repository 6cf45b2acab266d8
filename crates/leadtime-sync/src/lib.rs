//! Five-stage incremental sync: projects, releases, stories, pull request
//! links, pull request details. Progress is derived from the store's gap
//! queries on every run; there is no checkpoint state of its own.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use leadtime_adapters::{
    GitHubClient, HttpClientConfig, HttpFetcher, IssueTracker, JiraClient, JiraCredentials, SourceHost,
    RateLimit,
};
use leadtime_storage::{LinkOutcome, MergeOutcome, Store};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "leadtime-sync";
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Env files read by [`load_env_files`], highest precedence first.
pub const ENV_FILES: [&str; 2] = [".env.params", ".env"];

/// Loads `.env.params` then `.env` from `dir` into the process environment.
/// Variables that are already set are never overwritten, so the real
/// environment wins over both files and `.env.params` wins over `.env`.
/// Missing files are skipped. Returns the files that were read.
pub fn load_env_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut loaded = Vec::new();
    for name in ENV_FILES {
        let path = dir.join(name);
        if !path.is_file() {
            continue;
        }
        dotenvy::from_path(&path).with_context(|| format!("loading {}", path.display()))?;
        info!(path = %path.display(), "loaded env file");
        loaded.push(path);
    }
    Ok(loaded)
}

#[derive(Clone)]
pub struct SyncConfig {
    pub sqlite_path: PathBuf,
    pub jira_instance: String,
    pub jira_email: String,
    pub atlassian_token: String,
    /// Owner -> API token, already resolved from the environment.
    pub github_tokens: BTreeMap<String, String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub batch_size: usize,
    /// Zero disables client-side rate limiting.
    pub requests_per_minute: u32,
}

impl std::fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConfig")
            .field("sqlite_path", &self.sqlite_path)
            .field("jira_instance", &self.jira_instance)
            .field("jira_email", &self.jira_email)
            .field("github_owners", &self.github_tokens.keys().collect::<Vec<_>>())
            .field("user_agent", &self.user_agent)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("batch_size", &self.batch_size)
            .field("requests_per_minute", &self.requests_per_minute)
            .finish_non_exhaustive()
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("./releases.db"),
            jira_instance: String::new(),
            jira_email: String::new(),
            atlassian_token: String::new(),
            github_tokens: BTreeMap::new(),
            user_agent: "leadtime/0.1".to_string(),
            http_timeout_secs: 30,
            batch_size: DEFAULT_BATCH_SIZE,
            requests_per_minute: 0,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            sqlite_path: std::env::var("SQLITE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.sqlite_path),
            jira_instance: std::env::var("JIRA_INSTANCE").unwrap_or_default(),
            jira_email: std::env::var("EMAIL").unwrap_or_default(),
            atlassian_token: std::env::var("ATLASSIAN_TOKEN").unwrap_or_default(),
            github_tokens: resolve_github_tokens(
                std::env::var("GITHUB_ORG_TOKENS_MAP").ok().as_deref(),
                |name| std::env::var(name).ok(),
            ),
            user_agent: std::env::var("LEADTIME_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("LEADTIME_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            batch_size: std::env::var("LEADTIME_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v: &usize| *v > 0)
                .unwrap_or(defaults.batch_size),
            requests_per_minute: std::env::var("LEADTIME_REQUESTS_PER_MINUTE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.requests_per_minute),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            rate_limit: RateLimit::per_minute(self.requests_per_minute),
        }
    }
}

/// Resolves `{"<owner>": "<ENV_VAR_NAME>"}` into owner -> token. Invalid JSON
/// yields an empty map; owners whose variable is unset are left out.
pub fn resolve_github_tokens(
    map_json: Option<&str>,
    lookup: impl Fn(&str) -> Option<String>,
) -> BTreeMap<String, String> {
    let Some(raw) = map_json.filter(|s| !s.trim().is_empty()) else {
        return BTreeMap::new();
    };
    let owner_vars: BTreeMap<String, String> = match serde_json::from_str(raw) {
        Ok(map) => map,
        Err(err) => {
            error!(error = %err, "GITHUB_ORG_TOKENS_MAP is not a JSON object of strings");
            return BTreeMap::new();
        }
    };

    let mut tokens = BTreeMap::new();
    for (owner, var_name) in owner_vars {
        match lookup(&var_name).filter(|t| !t.trim().is_empty()) {
            Some(token) => {
                tokens.insert(owner, token);
            }
            None => warn!(owner, var_name, "no GitHub token found in environment"),
        }
    }
    tokens
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Schema,
    Projects,
    Releases,
    Stories,
    PullRequestLinks,
    PullRequestDetails,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageFailure {
    pub stage: Stage,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub projects_inserted: u64,
    pub releases: MergeOutcome,
    pub stories: MergeOutcome,
    pub link_batches: usize,
    pub links: LinkOutcome,
    pub detail_batches: usize,
    pub details_updated: u64,
    pub details_skipped: usize,
    pub failures: Vec<StageFailure>,
}

impl SyncRunSummary {
    fn new(start: NaiveDate, end: NaiveDate) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            window_start: start,
            window_end: end,
            projects_inserted: 0,
            releases: MergeOutcome::default(),
            stories: MergeOutcome::default(),
            link_batches: 0,
            links: LinkOutcome::default(),
            detail_batches: 0,
            details_updated: 0,
            details_skipped: 0,
            failures: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, stage: Stage, err: impl std::fmt::Display) {
        let message = err.to_string();
        error!(run_id = %self.run_id, ?stage, %message, "sync stage failed");
        self.failures.push(StageFailure { stage, message });
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: Store,
    tracker: Box<dyn IssueTracker>,
    host: Box<dyn SourceHost>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, tracker: Box<dyn IssueTracker>, host: Box<dyn SourceHost>) -> Self {
        let store = Store::open(config.sqlite_path.clone());
        Self {
            config,
            store,
            tracker,
            host,
        }
    }

    /// Builds the Jira and GitHub adapters; missing credentials fail here, before any stage runs.
    pub fn from_config(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        let tracker = JiraClient::new(
            JiraCredentials {
                instance: config.jira_instance.clone(),
                email: config.jira_email.clone(),
                token: config.atlassian_token.clone(),
            },
            http.clone(),
        )
        .context("configuring Jira client")?;
        let host = GitHubClient::new(config.github_tokens.clone(), http).context("configuring GitHub client")?;
        Ok(Self::new(config, Box::new(tracker), Box::new(host)))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Runs every stage in dependency order. Only schema creation is fatal;
    /// other failures are recorded in the summary and the run moves on.
    pub async fn run(&self, start: NaiveDate, end: NaiveDate) -> Result<SyncRunSummary> {
        let mut summary = SyncRunSummary::new(start, end);
        info!(run_id = %summary.run_id, %start, %end, db = %self.store.path().display(), "sync started");

        info!("-- 1. Creating schema");
        self.store.create_schema().await.context("creating schema")?;

        info!("-- 2. Syncing projects");
        self.sync_projects(&mut summary).await;

        info!("-- 3. Syncing releases");
        self.sync_releases(&mut summary, start, end).await;

        info!("-- 4. Syncing stories");
        self.sync_stories(&mut summary).await;

        info!("-- 5. Syncing story pull requests");
        self.sync_pull_request_links(&mut summary).await;

        info!("-- 6. Syncing pull request details");
        self.sync_pull_request_details(&mut summary).await;

        summary.finished_at = Utc::now();
        info!(
            run_id = %summary.run_id,
            projects = summary.projects_inserted,
            releases = summary.releases.inserted,
            stories = summary.stories.inserted,
            link_batches = summary.link_batches,
            details = summary.details_updated,
            failures = summary.failures.len(),
            "sync finished"
        );
        Ok(summary)
    }

    async fn sync_projects(&self, summary: &mut SyncRunSummary) {
        let projects = match self.tracker.list_projects().await {
            Ok(projects) => projects,
            Err(err) => return summary.fail(Stage::Projects, err),
        };
        match self.store.save_projects(&projects).await {
            Ok(inserted) => summary.projects_inserted = inserted,
            Err(err) => summary.fail(Stage::Projects, err),
        }
    }

    async fn sync_releases(&self, summary: &mut SyncRunSummary, start: NaiveDate, end: NaiveDate) {
        let releases = match self.tracker.list_releases(start, end).await {
            Ok(releases) => releases,
            Err(err) => return summary.fail(Stage::Releases, err),
        };
        match self.store.save_releases(&releases).await {
            Ok(outcome) => {
                if outcome.orphaned > 0 {
                    warn!(orphaned = outcome.orphaned, "releases dropped for unknown project keys");
                }
                summary.releases = outcome;
            }
            Err(err) => summary.fail(Stage::Releases, err),
        }
    }

    async fn sync_stories(&self, summary: &mut SyncRunSummary) {
        let release_ids = match self.store.releases_without_stories().await {
            Ok(ids) => ids,
            Err(err) => return summary.fail(Stage::Stories, err),
        };
        if release_ids.is_empty() {
            info!("no releases without stories");
            return;
        }

        let stories = match self.tracker.list_stories(&release_ids).await {
            Ok(stories) => stories,
            Err(err) => return summary.fail(Stage::Stories, err),
        };
        match self.store.save_stories(&stories).await {
            Ok(outcome) => {
                if outcome.orphaned > 0 {
                    warn!(orphaned = outcome.orphaned, "stories dropped for unknown releases");
                }
                summary.stories = outcome;
            }
            Err(err) => summary.fail(Stage::Stories, err),
        }
    }

    async fn sync_pull_request_links(&self, summary: &mut SyncRunSummary) {
        let batch_size = self.config.batch_size.max(1);
        loop {
            let story_keys = match self.store.stories_without_pull_requests(batch_size).await {
                Ok(keys) => keys,
                Err(err) => return summary.fail(Stage::PullRequestLinks, err),
            };
            if story_keys.is_empty() {
                break;
            }

            let links = match self.tracker.list_pull_request_links(&story_keys).await {
                Ok(links) => links,
                Err(err) => return summary.fail(Stage::PullRequestLinks, err),
            };
            let outcome = match self.store.save_pull_request_links(&links).await {
                Ok(outcome) => outcome,
                Err(err) => return summary.fail(Stage::PullRequestLinks, err),
            };
            summary.link_batches += 1;
            summary.links.absorb(outcome);
            info!(batch = summary.link_batches, stories = story_keys.len(), ?outcome, "pull request link batch saved");

            if outcome.checked_stories == 0 {
                return summary.fail(
                    Stage::PullRequestLinks,
                    format!("batch of {} stories made no progress", story_keys.len()),
                );
            }
        }
    }

    async fn sync_pull_request_details(&self, summary: &mut SyncRunSummary) {
        let batch_size = self.config.batch_size.max(1);
        let mut after_id = 0;
        loop {
            let pending = match self.store.pull_requests_without_details_after(after_id, batch_size).await {
                Ok(pending) => pending,
                Err(err) => return summary.fail(Stage::PullRequestDetails, err),
            };
            let Some(last) = pending.last() else {
                break;
            };
            after_id = last.id;

            let details = match self.host.fetch_pull_request_details(&pending).await {
                Ok(details) => details,
                Err(err) => return summary.fail(Stage::PullRequestDetails, err),
            };
            summary.detail_batches += 1;
            summary.details_skipped += pending.len().saturating_sub(details.len());
            if details.is_empty() {
                continue;
            }

            match self.store.save_pull_request_details(&details).await {
                Ok(updated) => summary.details_updated += updated,
                Err(err) => return summary.fail(Stage::PullRequestDetails, err),
            }
        }
    }
}

/// `types: { <type>: [<project key>, ...] }`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectTypesFile {
    #[serde(default)]
    pub types: BTreeMap<String, Vec<String>>,
}

impl ProjectTypesFile {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).context("parsing project types yaml")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&raw)
    }
}

/// Returns the number of project rows whose type was overwritten.
pub async fn apply_project_types(store: &Store, file: &ProjectTypesFile) -> Result<u64> {
    let mut updated = 0;
    for (project_type, keys) in &file.types {
        if keys.is_empty() {
            continue;
        }
        updated += store
            .update_project_types(keys, project_type)
            .await
            .with_context(|| format!("updating projects to type {project_type}"))?;
    }
    Ok(updated)
}
