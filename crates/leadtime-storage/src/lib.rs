//! SQLite persistence for the release/story/pull-request snapshot.
//!
//! Every operation opens its own connection, runs inside a single
//! transaction where it issues more than one statement, and closes the
//! connection before returning. Bulk loads that carry natural keys go
//! through a connection-scoped staging table and a set-based join-insert.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use leadtime_core::{PendingPullRequest, Project, PullRequest, PullRequestIdentifier, PullRequestLinks, Release, Story};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Column, Connection, QueryBuilder, Row, Sqlite, TypeInfo, ValueRef};
use thiserror::Error;
use tracing::{debug, info};

pub mod codec;

pub const CRATE_NAME: &str = "leadtime-storage";

/// Rows per staged `INSERT`, kept well below SQLite's bind-parameter limit.
const STAGE_CHUNK_ROWS: usize = 500;

pub const TABLES: &[&str] = &[
    "projects",
    "releases",
    "stories",
    "pull_requests",
    "story_pr_links",
    "story_pr_checked",
];

const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS projects (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        internal_id TEXT NOT NULL,
        key TEXT NOT NULL,
        title TEXT NOT NULL,
        type TEXT NOT NULL,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        UNIQUE(internal_id),
        UNIQUE(key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS releases (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        internal_id TEXT NOT NULL,
        title TEXT NOT NULL,
        description TEXT,
        date TEXT NOT NULL,
        project_id INTEGER NOT NULL REFERENCES projects (id),
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        UNIQUE(internal_id, project_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stories (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        key TEXT NOT NULL,
        title TEXT NOT NULL,
        type TEXT NOT NULL,
        created TEXT NOT NULL,
        resolved TEXT,
        release_id INTEGER NOT NULL REFERENCES releases (id),
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        UNIQUE(key, release_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_stories_release_id ON stories (release_id)",
    "CREATE INDEX IF NOT EXISTS idx_stories_key ON stories (key)",
    r#"
    CREATE TABLE IF NOT EXISTS pull_requests (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        owner TEXT NOT NULL,
        repo TEXT NOT NULL,
        number INTEGER NOT NULL,
        title TEXT,
        open_date TEXT,
        close_date TEXT,
        commit_count INTEGER,
        earliest_commit TEXT,
        latest_commit TEXT,
        url TEXT GENERATED ALWAYS AS (
            'https://github.com/' || owner || '/' || repo || '/pull/' || number
        ) VIRTUAL,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        UNIQUE(owner, repo, number)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS story_pr_links (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        story_id INTEGER NOT NULL REFERENCES stories (id),
        pr_id INTEGER NOT NULL REFERENCES pull_requests (id),
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        UNIQUE(story_id, pr_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS story_pr_checked (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        story_key TEXT NOT NULL,
        pr_count INTEGER NOT NULL,
        checked_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        UNIQUE(story_key)
    )
    "#,
    "DROP VIEW IF EXISTS lead_times",
    r#"
    CREATE VIEW lead_times AS
    SELECT
        releases.id AS release_id,
        releases.internal_id AS release_internal_id,
        releases.title AS release_title,
        releases.date AS release_date,
        projects.key AS project_key,
        stories.key AS story_key,
        pull_requests.id AS pr_id,
        pull_requests.title AS pr_title,
        pull_requests.owner AS pr_owner,
        pull_requests.repo AS pr_repo,
        pull_requests.number AS pr_number,
        pull_requests.earliest_commit AS earliest_commit,
        julianday(releases.date) - julianday(pull_requests.earliest_commit) + 1
            AS lead_time_days
    FROM
        releases
        JOIN projects ON releases.project_id = projects.id
        JOIN stories ON stories.release_id = releases.id
        JOIN story_pr_links ON story_pr_links.story_id = stories.id
        JOIN pull_requests ON story_pr_links.pr_id = pull_requests.id
    "#,
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("preparing database location: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot decode {column} value {value:?}: {reason}")]
    Decode {
        column: &'static str,
        value: String,
        reason: String,
    },
    #[error("unknown table {0}")]
    UnknownTable(String),
}

/// Result of a staged merge. `orphaned` counts staged rows whose parent
/// natural key did not resolve and were therefore not inserted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub staged: u64,
    pub inserted: u64,
    pub orphaned: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkOutcome {
    pub staged_links: u64,
    pub inserted_pull_requests: u64,
    pub inserted_links: u64,
    pub checked_stories: u64,
}

impl LinkOutcome {
    pub fn absorb(&mut self, other: LinkOutcome) {
        self.staged_links += other.staged_links;
        self.inserted_pull_requests += other.inserted_pull_requests;
        self.inserted_links += other.inserted_links;
        self.checked_stories += other.checked_stories;
    }
}

/// Dynamically typed result of an ad-hoc query.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<JsonValue>>,
}

impl Table {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
    options: SqliteConnectOptions,
}

impl Store {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        Self { path, options }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens a fresh connection. Callers own it and should `close()` it.
    pub async fn connect(&self) -> Result<SqliteConnection, StoreError> {
        let conn = SqliteConnection::connect_with(&self.options).await?;
        debug!(path = %self.path.display(), "connected");
        Ok(conn)
    }

    pub async fn create_schema(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut conn = self.connect().await?;
        let mut tx = conn.begin().await?;
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        conn.close().await?;

        info!(path = %self.path.display(), "schema ready");
        Ok(())
    }

    /// First write wins: rows colliding on internal id or key are skipped.
    pub async fn save_projects(&self, projects: &[Project]) -> Result<u64, StoreError> {
        let mut conn = self.connect().await?;
        let mut tx = conn.begin().await?;
        let mut inserted = 0;
        for project in projects {
            inserted += sqlx::query(
                "INSERT OR IGNORE INTO projects (internal_id, key, title, type) VALUES (?, ?, ?, ?)",
            )
            .bind(&project.internal_id)
            .bind(&project.key)
            .bind(&project.title)
            .bind(&project.project_type)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        conn.close().await?;

        info!(received = projects.len(), inserted, "saved projects");
        Ok(inserted)
    }

    pub async fn update_project_types(
        &self,
        project_keys: &[String],
        project_type: &str,
    ) -> Result<u64, StoreError> {
        let mut conn = self.connect().await?;
        let mut tx = conn.begin().await?;
        let mut updated = 0;
        for key in project_keys {
            updated += sqlx::query("UPDATE projects SET type = ? WHERE key = ?")
                .bind(project_type)
                .bind(key)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        conn.close().await?;

        info!(project_type, updated, "updated project types");
        Ok(updated)
    }

    pub async fn retrieve_all_projects(&self) -> Result<Vec<Project>, StoreError> {
        let mut conn = self.connect().await?;
        let rows = sqlx::query("SELECT internal_id, key, title, type FROM projects ORDER BY id")
            .fetch_all(&mut conn)
            .await?;
        conn.close().await?;

        let projects = rows
            .iter()
            .map(|row| {
                Ok(Project {
                    internal_id: row.try_get("internal_id")?,
                    key: row.try_get("key")?,
                    title: row.try_get("title")?,
                    project_type: row.try_get("type")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        debug!(count = projects.len(), "retrieved projects");
        Ok(projects)
    }

    /// Project key -> title for projects whose type is one of `project_types`.
    pub async fn retrieve_projects_by_type(
        &self,
        project_types: &[String],
    ) -> Result<BTreeMap<String, String>, StoreError> {
        let projects = self.retrieve_all_projects().await?;
        Ok(projects
            .into_iter()
            .filter(|p| project_types.contains(&p.project_type))
            .map(|p| (p.key, p.title))
            .collect())
    }

    /// Stage releases by internal id, then join-insert them resolving the
    /// project key to its surrogate id. Releases with an unknown project key
    /// are counted as orphans and dropped.
    pub async fn save_releases(&self, releases: &[Release]) -> Result<MergeOutcome, StoreError> {
        let mut conn = self.connect().await?;
        let mut tx = conn.begin().await?;

        sqlx::query(
            r#"
            CREATE TEMP TABLE IF NOT EXISTS stage_releases (
                internal_id TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                date TEXT NOT NULL,
                project_key TEXT NOT NULL,
                UNIQUE(internal_id)
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM stage_releases").execute(&mut *tx).await?;

        let mut staged = 0;
        for chunk in releases.chunks(STAGE_CHUNK_ROWS) {
            let mut builder = QueryBuilder::<Sqlite>::new(
                "INSERT OR IGNORE INTO stage_releases (internal_id, title, description, date, project_key) ",
            );
            builder.push_values(chunk, |mut row, release| {
                row.push_bind(release.internal_id.clone())
                    .push_bind(release.title.clone())
                    .push_bind(release.description.clone())
                    .push_bind(codec::encode_date(release.date))
                    .push_bind(release.project_key.clone());
            });
            staged += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        let orphaned: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
              FROM stage_releases
              LEFT JOIN projects ON stage_releases.project_key = projects.key
             WHERE projects.id IS NULL
            "#,
        )
        .fetch_one(&mut *tx)
        .await?;

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO releases (internal_id, title, description, date, project_id)
            SELECT stage_releases.internal_id,
                   stage_releases.title,
                   stage_releases.description,
                   stage_releases.date,
                   projects.id
              FROM stage_releases
              JOIN projects ON stage_releases.project_key = projects.key
             ORDER BY stage_releases.rowid
            "#,
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query("DROP TABLE IF EXISTS temp.stage_releases")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        conn.close().await?;

        let outcome = MergeOutcome {
            staged,
            inserted,
            orphaned: orphaned as u64,
        };
        info!(staged, inserted, orphaned, "saved releases");
        Ok(outcome)
    }

    /// Internal ids of releases that have no story rows yet.
    pub async fn releases_without_stories(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connect().await?;
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT releases.internal_id
              FROM releases
              LEFT JOIN stories ON releases.id = stories.release_id
             WHERE stories.release_id IS NULL
             ORDER BY releases.id
            "#,
        )
        .fetch_all(&mut conn)
        .await?;
        conn.close().await?;

        info!(count = ids.len(), "releases without stories");
        Ok(ids)
    }

    /// Same staged merge as releases, resolving `release_internal_id`.
    pub async fn save_stories(&self, stories: &[Story]) -> Result<MergeOutcome, StoreError> {
        let mut conn = self.connect().await?;
        let mut tx = conn.begin().await?;

        sqlx::query(
            r#"
            CREATE TEMP TABLE IF NOT EXISTS stage_stories (
                key TEXT NOT NULL,
                title TEXT NOT NULL,
                type TEXT NOT NULL,
                created TEXT NOT NULL,
                resolved TEXT,
                release_internal_id TEXT NOT NULL,
                UNIQUE(key, release_internal_id)
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM stage_stories").execute(&mut *tx).await?;

        let mut staged = 0;
        for chunk in stories.chunks(STAGE_CHUNK_ROWS) {
            let mut builder = QueryBuilder::<Sqlite>::new(
                "INSERT OR IGNORE INTO stage_stories (key, title, type, created, resolved, release_internal_id) ",
            );
            builder.push_values(chunk, |mut row, story| {
                row.push_bind(story.key.clone())
                    .push_bind(story.title.clone())
                    .push_bind(story.story_type.clone())
                    .push_bind(codec::encode_timestamp(story.created))
                    .push_bind(codec::encode_optional_timestamp(story.resolved))
                    .push_bind(story.release_internal_id.clone());
            });
            staged += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        let orphaned: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
              FROM stage_stories
              LEFT JOIN releases ON stage_stories.release_internal_id = releases.internal_id
             WHERE releases.id IS NULL
            "#,
        )
        .fetch_one(&mut *tx)
        .await?;

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO stories (key, title, type, created, resolved, release_id)
            SELECT stage_stories.key,
                   stage_stories.title,
                   stage_stories.type,
                   stage_stories.created,
                   stage_stories.resolved,
                   releases.id
              FROM stage_stories
              JOIN releases ON stage_stories.release_internal_id = releases.internal_id
             ORDER BY stage_stories.rowid
            "#,
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        // A key already checked in an earlier run is hidden from the gap query,
        // so new memberships take the links of its existing rows.
        let carried_links = sqlx::query(
            r#"
            INSERT OR IGNORE INTO story_pr_links (story_id, pr_id)
            SELECT DISTINCT stories.id, story_pr_links.pr_id
              FROM stories
              JOIN stories AS linked
                ON linked.key = stories.key
               AND linked.id <> stories.id
              JOIN story_pr_links ON story_pr_links.story_id = linked.id
             WHERE stories.key IN (SELECT key FROM stage_stories)
            "#,
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query("DROP TABLE IF EXISTS temp.stage_stories")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        conn.close().await?;

        let outcome = MergeOutcome {
            staged,
            inserted,
            orphaned: orphaned as u64,
        };
        info!(staged, inserted, orphaned, carried_links, "saved stories");
        Ok(outcome)
    }

    /// Distinct story keys with no `story_pr_checked` marker. `limit == 0` is unbounded.
    pub async fn stories_without_pull_requests(&self, limit: usize) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connect().await?;
        let keys: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT stories.key
              FROM stories
              LEFT JOIN story_pr_checked ON stories.key = story_pr_checked.story_key
             WHERE story_pr_checked.story_key IS NULL
             GROUP BY stories.key
             ORDER BY MIN(stories.id)
             LIMIT ?
            "#,
        )
        .bind(sql_limit(limit))
        .fetch_all(&mut conn)
        .await?;
        conn.close().await?;

        info!(count = keys.len(), "stories without pull request check");
        Ok(keys)
    }

    /// Persist the pull requests found for a batch of stories and mark every
    /// story in the batch as checked, including those with no pull requests.
    pub async fn save_pull_request_links(&self, links: &PullRequestLinks) -> Result<LinkOutcome, StoreError> {
        if links.is_empty() {
            return Ok(LinkOutcome::default());
        }

        let flattened = links
            .iter()
            .flat_map(|(story_key, prs)| prs.iter().map(move |pr| (story_key, pr)))
            .collect::<Vec<_>>();

        let mut conn = self.connect().await?;
        let mut tx = conn.begin().await?;

        sqlx::query(
            r#"
            CREATE TEMP TABLE IF NOT EXISTS stage_story_pull_requests (
                story_key TEXT NOT NULL,
                owner TEXT NOT NULL,
                repo TEXT NOT NULL,
                number INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM stage_story_pull_requests")
            .execute(&mut *tx)
            .await?;

        let mut staged_links = 0;
        for chunk in flattened.chunks(STAGE_CHUNK_ROWS) {
            let mut builder = QueryBuilder::<Sqlite>::new(
                "INSERT INTO stage_story_pull_requests (story_key, owner, repo, number) ",
            );
            builder.push_values(chunk, |mut row, (story_key, pr)| {
                row.push_bind((*story_key).clone())
                    .push_bind(pr.owner.clone())
                    .push_bind(pr.repository.clone())
                    .push_bind(number_to_sql(pr.number));
            });
            staged_links += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        let inserted_pull_requests = sqlx::query(
            r#"
            INSERT OR IGNORE INTO pull_requests (owner, repo, number)
            SELECT DISTINCT owner, repo, number
              FROM stage_story_pull_requests
            "#,
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let inserted_links = sqlx::query(
            r#"
            INSERT OR IGNORE INTO story_pr_links (story_id, pr_id)
            SELECT stories.id, pull_requests.id
              FROM stage_story_pull_requests
              JOIN stories
                ON stage_story_pull_requests.story_key = stories.key
              JOIN pull_requests
                ON stage_story_pull_requests.owner = pull_requests.owner
               AND stage_story_pull_requests.repo = pull_requests.repo
               AND stage_story_pull_requests.number = pull_requests.number
            "#,
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query("DROP TABLE IF EXISTS temp.stage_story_pull_requests")
            .execute(&mut *tx)
            .await?;

        let counts = links.iter().collect::<Vec<_>>();
        let mut checked_stories = 0;
        for chunk in counts.chunks(STAGE_CHUNK_ROWS) {
            let mut builder =
                QueryBuilder::<Sqlite>::new("INSERT OR IGNORE INTO story_pr_checked (story_key, pr_count) ");
            builder.push_values(chunk, |mut row, (story_key, prs)| {
                row.push_bind((*story_key).clone()).push_bind(prs.len() as i64);
            });
            checked_stories += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        conn.close().await?;

        let outcome = LinkOutcome {
            staged_links,
            inserted_pull_requests,
            inserted_links,
            checked_stories,
        };
        info!(
            stories = links.len(),
            staged_links, inserted_pull_requests, inserted_links, checked_stories, "saved story pull requests"
        );
        Ok(outcome)
    }

    /// Identifier rows whose details are still missing. `limit == 0` is unbounded.
    pub async fn pull_requests_without_details(
        &self,
        limit: usize,
    ) -> Result<Vec<PendingPullRequest>, StoreError> {
        self.pull_requests_without_details_after(0, limit).await
    }

    /// Cursor form of [`Store::pull_requests_without_details`]: only rows with `id > after_id`.
    pub async fn pull_requests_without_details_after(
        &self,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<PendingPullRequest>, StoreError> {
        let mut conn = self.connect().await?;
        let rows = sqlx::query(
            r#"
            SELECT id, owner, repo, number
              FROM pull_requests
             WHERE title IS NULL
               AND id > ?
             ORDER BY id
             LIMIT ?
            "#,
        )
        .bind(after_id)
        .bind(sql_limit(limit))
        .fetch_all(&mut conn)
        .await?;
        conn.close().await?;

        let pending = rows
            .iter()
            .map(pending_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        info!(count = pending.len(), after_id, "pull requests without details");
        Ok(pending)
    }

    /// Update-in-place by surrogate id. Never inserts.
    pub async fn save_pull_request_details(&self, details: &[PullRequest]) -> Result<u64, StoreError> {
        let mut conn = self.connect().await?;
        let mut tx = conn.begin().await?;
        let mut updated = 0;
        for pr in details {
            updated += sqlx::query(
                r#"
                UPDATE pull_requests
                   SET title = ?,
                       open_date = ?,
                       close_date = ?,
                       commit_count = ?,
                       earliest_commit = ?,
                       latest_commit = ?
                 WHERE id = ?
                "#,
            )
            .bind(&pr.title)
            .bind(codec::encode_optional_date(pr.open_date))
            .bind(codec::encode_optional_date(pr.close_date))
            .bind(i64::from(pr.commit_count))
            .bind(codec::encode_optional_date(pr.earliest_commit))
            .bind(codec::encode_optional_date(pr.latest_commit))
            .bind(pr.id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        conn.close().await?;

        info!(received = details.len(), updated, "saved pull request details");
        Ok(updated)
    }

    /// Reads one pull request row back in domain form; `None` when absent or still pending.
    pub async fn retrieve_pull_request(&self, id: i64) -> Result<Option<PullRequest>, StoreError> {
        let mut conn = self.connect().await?;
        let row = sqlx::query(
            r#"
            SELECT id, owner, repo, number, title, open_date, close_date,
                   commit_count, earliest_commit, latest_commit
              FROM pull_requests
             WHERE id = ? AND title IS NOT NULL
            "#,
        )
        .bind(id)
        .fetch_optional(&mut conn)
        .await?;
        conn.close().await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let pending = pending_from_row(&row)?;
        let commit_count: Option<i64> = row.try_get("commit_count")?;
        Ok(Some(PullRequest {
            id: pending.id,
            identifier: pending.identifier,
            title: row.try_get("title")?,
            open_date: codec::decode_optional_date("open_date", row.try_get::<Option<String>, _>("open_date")?.as_deref())?,
            close_date: codec::decode_optional_date("close_date", row.try_get::<Option<String>, _>("close_date")?.as_deref())?,
            commit_count: commit_count.unwrap_or_default().clamp(0, i64::from(u32::MAX)) as u32,
            earliest_commit: codec::decode_optional_date(
                "earliest_commit",
                row.try_get::<Option<String>, _>("earliest_commit")?.as_deref(),
            )?,
            latest_commit: codec::decode_optional_date(
                "latest_commit",
                row.try_get::<Option<String>, _>("latest_commit")?.as_deref(),
            )?,
        }))
    }

    /// Stories stored for a key, one per release membership.
    pub async fn retrieve_stories(&self, story_key: &str) -> Result<Vec<Story>, StoreError> {
        let mut conn = self.connect().await?;
        let rows = sqlx::query(
            r#"
            SELECT stories.key, stories.title, stories.type, stories.created, stories.resolved,
                   releases.internal_id AS release_internal_id
              FROM stories
              JOIN releases ON stories.release_id = releases.id
             WHERE stories.key = ?
             ORDER BY stories.id
            "#,
        )
        .bind(story_key)
        .fetch_all(&mut conn)
        .await?;
        conn.close().await?;

        rows.iter()
            .map(|row| {
                let created: String = row.try_get("created")?;
                let resolved: Option<String> = row.try_get("resolved")?;
                Ok(Story {
                    key: row.try_get("key")?,
                    title: row.try_get("title")?,
                    story_type: row.try_get("type")?,
                    created: codec::decode_timestamp("created", &created)?,
                    resolved: codec::decode_optional_timestamp("resolved", resolved.as_deref())?,
                    release_internal_id: row.try_get("release_internal_id")?,
                })
            })
            .collect()
    }

    pub async fn count_rows(&self, table: &str) -> Result<i64, StoreError> {
        if !TABLES.contains(&table) && table != "lead_times" {
            return Err(StoreError::UnknownTable(table.to_string()));
        }
        let mut conn = self.connect().await?;
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&mut conn)
            .await?;
        conn.close().await?;
        Ok(count)
    }

    /// Names of schema objects of the given kind (`table`, `view`, `index`).
    pub async fn object_names(&self, kind: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connect().await?;
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = ? AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .bind(kind)
        .fetch_all(&mut conn)
        .await?;
        conn.close().await?;
        Ok(names)
    }

    pub async fn table_names(&self) -> Result<Vec<String>, StoreError> {
        self.object_names("table").await
    }

    pub async fn view_names(&self) -> Result<Vec<String>, StoreError> {
        self.object_names("view").await
    }

    /// Execute an opaque query and return its rows with SQLite's dynamic types.
    pub async fn query_table(&self, sql: &str) -> Result<Table, StoreError> {
        let mut conn = self.connect().await?;
        let rows = sqlx::query(sql).fetch_all(&mut conn).await?;
        conn.close().await?;

        let columns = rows
            .first()
            .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();
        let rows = rows
            .iter()
            .map(|row| (0..row.len()).map(|i| cell_value(row, i)).collect())
            .collect::<Result<Vec<Vec<_>>, _>>()?;

        debug!(rows = rows.len(), "query returned");
        Ok(Table { columns, rows })
    }
}

fn sql_limit(limit: usize) -> i64 {
    if limit == 0 {
        -1
    } else {
        i64::try_from(limit).unwrap_or(i64::MAX)
    }
}

fn number_to_sql(number: u64) -> i64 {
    i64::try_from(number).unwrap_or(i64::MAX)
}

fn pending_from_row(row: &SqliteRow) -> Result<PendingPullRequest, StoreError> {
    let number: i64 = row.try_get("number")?;
    let number = u64::try_from(number).map_err(|err| StoreError::Decode {
        column: "number",
        value: number.to_string(),
        reason: err.to_string(),
    })?;
    Ok(PendingPullRequest {
        id: row.try_get("id")?,
        identifier: PullRequestIdentifier {
            owner: row.try_get("owner")?,
            repository: row.try_get("repo")?,
            number,
        },
    })
}

fn cell_value(row: &SqliteRow, index: usize) -> Result<JsonValue, StoreError> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(JsonValue::Null);
    }
    let type_name = raw.type_info().name().to_ascii_uppercase();
    let value = match type_name.as_str() {
        "INTEGER" | "BOOLEAN" => JsonValue::from(row.try_get_unchecked::<i64, _>(index)?),
        "REAL" | "NUMERIC" => serde_json::Number::from_f64(row.try_get_unchecked::<f64, _>(index)?)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        "BLOB" => JsonValue::from(hex::encode(row.try_get_unchecked::<Vec<u8>, _>(index)?)),
        _ => JsonValue::from(row.try_get_unchecked::<String, _>(index)?),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use tempfile::{tempdir, TempDir};

    async fn fresh_store() -> (TempDir, Store) {
        let dir = tempdir().expect("tempdir");
        let store = Store::open(dir.path().join("db").join("releases.db"));
        store.create_schema().await.expect("schema");
        (dir, store)
    }

    fn project(internal_id: &str, key: &str, project_type: &str) -> Project {
        Project {
            internal_id: internal_id.into(),
            key: key.into(),
            title: format!("Project {key}"),
            project_type: project_type.into(),
        }
    }

    fn release(internal_id: &str, project_key: &str, date: NaiveDate) -> Release {
        Release {
            internal_id: internal_id.into(),
            title: format!("v{internal_id}"),
            description: None,
            date,
            project_key: project_key.into(),
        }
    }

    fn story(key: &str, release_internal_id: &str) -> Story {
        Story {
            key: key.into(),
            title: format!("Story {key}"),
            story_type: "Story".into(),
            created: Utc.with_ymd_and_hms(2023, 5, 1, 8, 0, 0).unwrap(),
            resolved: Some(Utc.with_ymd_and_hms(2023, 6, 5, 17, 0, 0).unwrap()),
            release_internal_id: release_internal_id.into(),
        }
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn schema_creation_is_idempotent() {
        let (_dir, store) = fresh_store().await;
        store.create_schema().await.expect("second create");

        let tables = store.table_names().await.unwrap();
        for table in TABLES {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
        assert!(!tables.iter().any(|t| t.starts_with("stage_")));
        assert_eq!(store.view_names().await.unwrap(), vec!["lead_times"]);
    }

    #[tokio::test]
    async fn saving_projects_twice_keeps_first_write() {
        let (_dir, store) = fresh_store().await;
        let projects = vec![project("1", "PROJ1", "software"), project("2", "PROJ2", "software")];

        assert_eq!(store.save_projects(&projects).await.unwrap(), 2);
        let renamed = vec![Project {
            title: "Renamed".into(),
            ..project("1", "PROJ1", "business")
        }];
        assert_eq!(store.save_projects(&projects).await.unwrap(), 0);
        assert_eq!(store.save_projects(&renamed).await.unwrap(), 0);

        let stored = store.retrieve_all_projects().await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].title, "Project PROJ1");
        assert_eq!(stored[0].project_type, "software");
    }

    #[tokio::test]
    async fn project_types_are_overwritten_for_listed_keys_only() {
        let (_dir, store) = fresh_store().await;
        store
            .save_projects(&[
                project("1", "PROJ1", "software"),
                project("2", "PROJ2", "software"),
                project("3", "PROJ3", "software"),
            ])
            .await
            .unwrap();

        let updated = store
            .update_project_types(&["PROJ1".into(), "PROJ2".into(), "NOPE".into()], "painter")
            .await
            .unwrap();
        assert_eq!(updated, 2);

        let painters = store.retrieve_projects_by_type(&["painter".into()]).await.unwrap();
        assert_eq!(painters.keys().collect::<Vec<_>>(), vec!["PROJ1", "PROJ2"]);
        let software = store.retrieve_projects_by_type(&["software".into()]).await.unwrap();
        assert_eq!(software.get("PROJ3").map(String::as_str), Some("Project PROJ3"));
    }

    #[tokio::test]
    async fn releases_merge_resolves_project_keys_and_counts_orphans() {
        let (_dir, store) = fresh_store().await;
        store.save_projects(&[project("1", "PROJ", "software")]).await.unwrap();

        let releases = vec![
            release("100", "PROJ", ymd(2023, 6, 15)),
            release("101", "PROJ", ymd(2023, 7, 1)),
            release("900", "GHOST", ymd(2023, 7, 1)),
        ];
        let first = store.save_releases(&releases).await.unwrap();
        assert_eq!(first, MergeOutcome { staged: 3, inserted: 2, orphaned: 1 });

        let second = store.save_releases(&releases).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(store.count_rows("releases").await.unwrap(), 2);
        assert!(!store
            .table_names()
            .await
            .unwrap()
            .contains(&"stage_releases".to_string()));
    }

    #[tokio::test]
    async fn stories_fill_release_gap_and_keep_one_row_per_membership() {
        let (_dir, store) = fresh_store().await;
        store.save_projects(&[project("1", "PROJ", "software")]).await.unwrap();
        store
            .save_releases(&[
                release("100", "PROJ", ymd(2023, 6, 15)),
                release("101", "PROJ", ymd(2023, 7, 1)),
                release("102", "PROJ", ymd(2023, 7, 2)),
            ])
            .await
            .unwrap();
        assert_eq!(
            store.releases_without_stories().await.unwrap(),
            vec!["100", "101", "102"]
        );

        let stories = vec![story("PROJ-1", "100"), story("PROJ-1", "101"), story("PROJ-2", "555")];
        let outcome = store.save_stories(&stories).await.unwrap();
        assert_eq!(outcome, MergeOutcome { staged: 3, inserted: 2, orphaned: 1 });
        assert_eq!(store.save_stories(&stories).await.unwrap().inserted, 0);

        assert_eq!(store.releases_without_stories().await.unwrap(), vec!["102"]);
        let memberships = store.retrieve_stories("PROJ-1").await.unwrap();
        assert_eq!(memberships.len(), 2);
        assert_eq!(memberships[0], story("PROJ-1", "100"));
        assert_eq!(memberships[1].release_internal_id, "101");
    }

    #[tokio::test]
    async fn zero_pull_request_results_are_never_requeried() {
        let (_dir, store) = fresh_store().await;
        store.save_projects(&[project("1", "PROJ", "software")]).await.unwrap();
        store.save_releases(&[release("100", "PROJ", ymd(2023, 6, 15))]).await.unwrap();
        store
            .save_stories(&[story("PROJ-1", "100"), story("PROJ-2", "100"), story("PROJ-3", "100")])
            .await
            .unwrap();

        assert_eq!(
            store.stories_without_pull_requests(0).await.unwrap(),
            vec!["PROJ-1", "PROJ-2", "PROJ-3"]
        );

        let mut links = PullRequestLinks::new();
        links.insert("PROJ-1".into(), vec![]);
        links.insert(
            "PROJ-2".into(),
            vec![
                PullRequestIdentifier::new("acme", "api", 7),
                PullRequestIdentifier::new("acme", "web", 9),
            ],
        );
        let outcome = store.save_pull_request_links(&links).await.unwrap();
        assert_eq!(outcome.checked_stories, 2);
        assert_eq!(outcome.inserted_pull_requests, 2);
        assert_eq!(outcome.inserted_links, 2);

        assert_eq!(store.stories_without_pull_requests(0).await.unwrap(), vec!["PROJ-3"]);
        assert_eq!(store.count_rows("story_pr_links").await.unwrap(), 2);
    }

    async fn detail_pull_request(store: &Store, number: u64, earliest_commit: NaiveDate) {
        let pending = store.pull_requests_without_details(0).await.unwrap();
        let target = pending
            .iter()
            .find(|p| p.identifier.number == number)
            .expect("pending pull request");
        store
            .save_pull_request_details(&[PullRequest {
                id: target.id,
                identifier: target.identifier.clone(),
                title: "Fix".into(),
                open_date: None,
                close_date: None,
                commit_count: 1,
                earliest_commit: Some(earliest_commit),
                latest_commit: Some(earliest_commit),
            }])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn story_in_two_releases_is_checked_once_and_linked_to_both() {
        let (_dir, store) = fresh_store().await;
        store.save_projects(&[project("1", "PROJ", "software")]).await.unwrap();
        store
            .save_releases(&[
                release("100", "PROJ", ymd(2023, 6, 15)),
                release("101", "PROJ", ymd(2023, 7, 1)),
            ])
            .await
            .unwrap();
        store
            .save_stories(&[story("PROJ-1", "100"), story("PROJ-1", "101")])
            .await
            .unwrap();

        assert_eq!(store.stories_without_pull_requests(0).await.unwrap(), vec!["PROJ-1"]);

        let mut links = PullRequestLinks::new();
        links.insert("PROJ-1".into(), vec![PullRequestIdentifier::new("acme", "api", 1)]);
        let outcome = store.save_pull_request_links(&links).await.unwrap();
        assert_eq!(outcome.staged_links, 1);
        assert_eq!(outcome.inserted_pull_requests, 1);
        assert_eq!(outcome.inserted_links, 2);
        assert_eq!(outcome.checked_stories, 1);
        assert!(store.stories_without_pull_requests(0).await.unwrap().is_empty());

        detail_pull_request(&store, 1, ymd(2023, 6, 10)).await;
        let table = store
            .query_table("SELECT release_internal_id, lead_time_days FROM lead_times ORDER BY release_internal_id")
            .await
            .unwrap();
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0][0], JsonValue::from("100"));
        assert_eq!(table.rows[0][1].as_f64(), Some(6.0));
        assert_eq!(table.rows[1][0], JsonValue::from("101"));
        assert_eq!(table.rows[1][1].as_f64(), Some(22.0));
    }

    #[tokio::test]
    async fn checked_story_joining_a_later_release_carries_its_links() {
        let (_dir, store) = fresh_store().await;
        store.save_projects(&[project("1", "PROJ", "software")]).await.unwrap();
        store
            .save_releases(&[
                release("100", "PROJ", ymd(2023, 6, 15)),
                release("101", "PROJ", ymd(2023, 7, 1)),
            ])
            .await
            .unwrap();
        store.save_stories(&[story("PROJ-1", "100")]).await.unwrap();
        let mut links = PullRequestLinks::new();
        links.insert(
            "PROJ-1".into(),
            vec![
                PullRequestIdentifier::new("acme", "api", 1),
                PullRequestIdentifier::new("acme", "api", 2),
            ],
        );
        store.save_pull_request_links(&links).await.unwrap();
        assert_eq!(store.count_rows("story_pr_links").await.unwrap(), 2);

        let outcome = store.save_stories(&[story("PROJ-1", "101")]).await.unwrap();
        assert_eq!(outcome.inserted, 1);
        assert!(store.stories_without_pull_requests(0).await.unwrap().is_empty());
        assert_eq!(store.count_rows("story_pr_links").await.unwrap(), 4);
        assert_eq!(store.count_rows("story_pr_checked").await.unwrap(), 1);

        store.save_stories(&[story("PROJ-1", "101")]).await.unwrap();
        assert_eq!(store.count_rows("story_pr_links").await.unwrap(), 4);

        detail_pull_request(&store, 1, ymd(2023, 6, 10)).await;
        let table = store
            .query_table("SELECT DISTINCT release_internal_id FROM lead_times ORDER BY release_internal_id")
            .await
            .unwrap();
        assert_eq!(table.rows, vec![vec![JsonValue::from("100")], vec![JsonValue::from("101")]]);
    }

    #[tokio::test]
    async fn pull_request_identifiers_are_shared_across_stories() {
        let (_dir, store) = fresh_store().await;
        store.save_projects(&[project("1", "PROJ", "software")]).await.unwrap();
        store.save_releases(&[release("100", "PROJ", ymd(2023, 6, 15))]).await.unwrap();
        store
            .save_stories(&[story("PROJ-1", "100"), story("PROJ-2", "100")])
            .await
            .unwrap();

        let shared = PullRequestIdentifier::new("acme", "api", 7);
        let mut links = PullRequestLinks::new();
        links.insert("PROJ-1".into(), vec![shared.clone()]);
        links.insert("PROJ-2".into(), vec![shared.clone()]);
        let outcome = store.save_pull_request_links(&links).await.unwrap();
        assert_eq!(outcome.staged_links, 2);
        assert_eq!(outcome.inserted_pull_requests, 1);
        assert_eq!(outcome.inserted_links, 2);

        let again = store.save_pull_request_links(&links).await.unwrap();
        assert_eq!(again.inserted_pull_requests, 0);
        assert_eq!(again.inserted_links, 0);
        assert_eq!(again.checked_stories, 0);
        assert_eq!(store.count_rows("pull_requests").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn pull_request_details_are_written_in_place() {
        let (_dir, store) = fresh_store().await;
        store.save_projects(&[project("1", "PROJ", "software")]).await.unwrap();
        store.save_releases(&[release("100", "PROJ", ymd(2023, 6, 15))]).await.unwrap();
        store.save_stories(&[story("PROJ-1", "100")]).await.unwrap();
        let mut links = PullRequestLinks::new();
        links.insert(
            "PROJ-1".into(),
            vec![
                PullRequestIdentifier::new("acme", "api", 1),
                PullRequestIdentifier::new("acme", "api", 2),
            ],
        );
        store.save_pull_request_links(&links).await.unwrap();

        let pending = store.pull_requests_without_details(0).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(store.pull_requests_without_details(1).await.unwrap().len(), 1);
        assert_eq!(
            store.pull_requests_without_details_after(pending[0].id, 0).await.unwrap(),
            vec![pending[1].clone()]
        );

        let details = PullRequest {
            id: pending[0].id,
            identifier: pending[0].identifier.clone(),
            title: "Test PR".into(),
            open_date: Some(ymd(2023, 6, 9)),
            close_date: Some(ymd(2023, 6, 12)),
            commit_count: 3,
            earliest_commit: Some(ymd(2023, 6, 10)),
            latest_commit: Some(ymd(2023, 6, 11)),
        };
        assert_eq!(store.save_pull_request_details(&[details.clone()]).await.unwrap(), 1);

        let unknown = PullRequest { id: 9999, ..details.clone() };
        assert_eq!(store.save_pull_request_details(&[unknown]).await.unwrap(), 0);
        assert_eq!(store.count_rows("pull_requests").await.unwrap(), 2);

        assert_eq!(store.retrieve_pull_request(details.id).await.unwrap(), Some(details));
        assert_eq!(store.pull_requests_without_details(0).await.unwrap(), vec![pending[1].clone()]);
    }

    #[tokio::test]
    async fn lead_time_view_adds_one_day() {
        let (_dir, store) = fresh_store().await;
        store.save_projects(&[project("1", "PROJ", "software")]).await.unwrap();
        store.save_releases(&[release("100", "PROJ", ymd(2023, 6, 15))]).await.unwrap();
        store.save_stories(&[story("PROJ-1", "100")]).await.unwrap();
        let mut links = PullRequestLinks::new();
        links.insert("PROJ-1".into(), vec![PullRequestIdentifier::new("acme", "api", 1)]);
        store.save_pull_request_links(&links).await.unwrap();
        let pending = store.pull_requests_without_details(0).await.unwrap();
        store
            .save_pull_request_details(&[PullRequest {
                id: pending[0].id,
                identifier: pending[0].identifier.clone(),
                title: "Fix".into(),
                open_date: None,
                close_date: None,
                commit_count: 1,
                earliest_commit: Some(ymd(2023, 6, 10)),
                latest_commit: Some(ymd(2023, 6, 10)),
            }])
            .await
            .unwrap();

        let table = store
            .query_table("SELECT project_key, pr_number, lead_time_days FROM lead_times")
            .await
            .unwrap();
        assert_eq!(table.columns, vec!["project_key", "pr_number", "lead_time_days"]);
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0][0], JsonValue::from("PROJ"));
        assert_eq!(table.rows[0][1], JsonValue::from(1));
        assert_eq!(table.rows[0][2].as_f64(), Some(6.0));

        let urls = store.query_table("SELECT url FROM pull_requests").await.unwrap();
        assert_eq!(urls.rows[0][0], JsonValue::from("https://github.com/acme/api/pull/1"));
    }

    #[tokio::test]
    async fn query_errors_are_reported_not_swallowed() {
        let (_dir, store) = fresh_store().await;
        assert!(matches!(
            store.query_table("SELECT * FROM no_such_table").await,
            Err(StoreError::Sqlx(_))
        ));
        assert!(matches!(
            store.count_rows("sqlite_master; DROP TABLE projects").await,
            Err(StoreError::UnknownTable(_))
        ));
    }

    #[test]
    fn zero_limit_means_unbounded() {
        assert_eq!(sql_limit(0), -1);
        assert_eq!(sql_limit(100), 100);
    }
}
