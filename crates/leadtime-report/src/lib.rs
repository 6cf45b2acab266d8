//! Lead-time aggregation over the `lead_times` view, outlier reports and snapshot export.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use leadtime_core::{month_bounds, months_between};
use leadtime_storage::{codec, Store, StoreError, Table};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Connection, QueryBuilder, Row, Sqlite};
use thiserror::Error;
use tracing::{debug, info};

pub mod export;

pub use export::{export_snapshot, monthly_chart, trend_line, ExportManifest, ExportManifestFile};

pub const CRATE_NAME: &str = "leadtime-report";
pub const DEFAULT_SQL_DIR: &str = "reports/sql";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("sqlite: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("report query file {0} not found")]
    MissingSql(PathBuf),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unknown outlier report {0}")]
    UnknownReport(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeadTimeResult {
    pub project_keys: Vec<String>,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub average_lead_time: f64,
    /// Number of lead-time rows (release/pull request pairs) averaged.
    pub number_of_releases: i64,
}

impl LeadTimeResult {
    fn empty(project_keys: &[String], start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            project_keys: project_keys.to_vec(),
            start,
            end,
            average_lead_time: 0.0,
            number_of_releases: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonthlyLeadTime {
    pub label: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// Average lead time in days, truncated toward zero.
    pub lead_time: i64,
    pub releases: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeadTimeRow {
    pub release_internal_id: String,
    pub release_title: String,
    pub release_date: NaiveDate,
    pub project_key: String,
    pub story_key: String,
    pub pull_request: String,
    pub pr_title: Option<String>,
    pub earliest_commit: Option<NaiveDate>,
    pub lead_time_days: Option<f64>,
}

pub struct LeadTimeReport {
    store: Store,
}

impl LeadTimeReport {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Average and count of `lead_time_days` for the projects, releases dated in `[start, end]`.
    /// The average is 0 when nothing matches.
    pub async fn calculate_lead_time(
        &self,
        project_keys: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<LeadTimeResult, ReportError> {
        if project_keys.is_empty() {
            return Ok(LeadTimeResult::empty(project_keys, start, end));
        }

        let mut builder = QueryBuilder::<Sqlite>::new(
            r#"
            SELECT
                CASE WHEN COUNT(lead_time_days) = 0 THEN 0.0 ELSE AVG(lead_time_days) END
                    AS average_lead_time,
                COUNT(lead_time_days) AS number_of_releases
            FROM lead_times
            WHERE "#,
        );
        push_window_filter(&mut builder, project_keys, start, end);

        let mut conn = self.store.connect().await?;
        let row = builder.build().fetch_one(&mut conn).await?;
        conn.close().await?;

        let result = LeadTimeResult {
            project_keys: project_keys.to_vec(),
            start,
            end,
            average_lead_time: row.try_get("average_lead_time")?,
            number_of_releases: row.try_get("number_of_releases")?,
        };
        debug!(?result, "lead time calculated");
        Ok(result)
    }

    /// One entry per calendar month touched by `[start, end]`, each month taken whole.
    pub async fn monthly_lead_time_report(
        &self,
        project_keys: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<MonthlyLeadTime>, ReportError> {
        let mut report = Vec::new();
        for month in months_between(start, end) {
            let Some(bounds) = month_bounds(month.year, month.month) else {
                continue;
            };
            let result = self.calculate_lead_time(project_keys, bounds.start, bounds.end).await?;
            report.push(MonthlyLeadTime {
                label: month.label(),
                start: bounds.start,
                end: bounds.end,
                lead_time: result.average_lead_time.trunc() as i64,
                releases: result.number_of_releases,
            });
        }
        info!(months = report.len(), projects = ?project_keys, "monthly lead time report built");
        Ok(report)
    }

    /// Raw view rows behind the aggregate, ordered by release date.
    pub async fn lead_time_rows(
        &self,
        project_keys: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<LeadTimeRow>, ReportError> {
        if project_keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::<Sqlite>::new(
            r#"
            SELECT release_internal_id, release_title, release_date, project_key, story_key,
                   pr_owner, pr_repo, pr_number, pr_title, earliest_commit, lead_time_days
              FROM lead_times
             WHERE "#,
        );
        push_window_filter(&mut builder, project_keys, start, end);
        builder.push(" ORDER BY release_date, release_id, story_key, pr_id");

        let mut conn = self.store.connect().await?;
        let rows = builder.build().fetch_all(&mut conn).await?;
        conn.close().await?;

        rows.iter().map(lead_time_row).collect()
    }
}

fn push_window_filter(
    builder: &mut QueryBuilder<'_, Sqlite>,
    project_keys: &[String],
    start: NaiveDate,
    end: NaiveDate,
) {
    builder.push("project_key IN (");
    let mut keys = builder.separated(", ");
    for key in project_keys {
        keys.push_bind(key.clone());
    }
    keys.push_unseparated(") AND release_date BETWEEN ");
    builder.push_bind(codec::encode_date(start));
    builder.push(" AND ");
    builder.push_bind(codec::encode_date(end));
}

fn lead_time_row(row: &SqliteRow) -> Result<LeadTimeRow, ReportError> {
    let release_date: String = row.try_get("release_date")?;
    let earliest_commit: Option<String> = row.try_get("earliest_commit")?;
    let owner: String = row.try_get("pr_owner")?;
    let repo: String = row.try_get("pr_repo")?;
    let number: i64 = row.try_get("pr_number")?;
    Ok(LeadTimeRow {
        release_internal_id: row.try_get("release_internal_id")?,
        release_title: row.try_get("release_title")?,
        release_date: codec::decode_date("release_date", &release_date)?,
        project_key: row.try_get("project_key")?,
        story_key: row.try_get("story_key")?,
        pull_request: format!("{owner}/{repo}#{number}"),
        pr_title: row.try_get("pr_title")?,
        earliest_commit: codec::decode_optional_date("earliest_commit", earliest_commit.as_deref())?,
        lead_time_days: row.try_get("lead_time_days")?,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutlierReport {
    ProjectsWithoutReleases,
    ReleasesWithOpenStories,
    StoriesInMultipleReleases,
    ReleasesWithOpenPullRequests,
    CountsOfStoriesWithoutPullRequests,
    StoriesWithoutPullRequests,
}

impl OutlierReport {
    pub const ALL: [OutlierReport; 6] = [
        OutlierReport::ProjectsWithoutReleases,
        OutlierReport::ReleasesWithOpenStories,
        OutlierReport::StoriesInMultipleReleases,
        OutlierReport::ReleasesWithOpenPullRequests,
        OutlierReport::CountsOfStoriesWithoutPullRequests,
        OutlierReport::StoriesWithoutPullRequests,
    ];

    pub fn file_stem(self) -> &'static str {
        match self {
            OutlierReport::ProjectsWithoutReleases => "A_projects_without_releases",
            OutlierReport::ReleasesWithOpenStories => "B_releases_with_open_stories",
            OutlierReport::StoriesInMultipleReleases => "C_stories_in_multiple_releases",
            OutlierReport::ReleasesWithOpenPullRequests => "D_releases_with_open_pull_requests",
            OutlierReport::CountsOfStoriesWithoutPullRequests => "E_counts_of_stories_without_pull_requests",
            OutlierReport::StoriesWithoutPullRequests => "E_stories_without_pull_requests",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            OutlierReport::ProjectsWithoutReleases => "Projects without releases",
            OutlierReport::ReleasesWithOpenStories => "Releases with stories unresolved at release time",
            OutlierReport::StoriesInMultipleReleases => "Stories in more than one release",
            OutlierReport::ReleasesWithOpenPullRequests => "Releases with pull requests open at release time",
            OutlierReport::CountsOfStoriesWithoutPullRequests => "Stories without pull requests, counted per release",
            OutlierReport::StoriesWithoutPullRequests => "Stories without pull requests",
        }
    }

    /// Accepts the file stem, with or without `.sql`, or the stem minus its letter prefix.
    pub fn from_name(name: &str) -> Result<Self, ReportError> {
        let wanted = name.trim().trim_end_matches(".sql");
        Self::ALL
            .into_iter()
            .find(|report| {
                let stem = report.file_stem();
                stem == wanted || stem.split_once('_').map(|(_, rest)| rest) == Some(wanted)
            })
            .ok_or_else(|| ReportError::UnknownReport(name.to_string()))
    }
}

pub struct OutlierReports {
    store: Store,
    sql_dir: PathBuf,
}

impl OutlierReports {
    pub fn new(store: Store, sql_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            sql_dir: sql_dir.into(),
        }
    }

    pub fn sql_dir(&self) -> &Path {
        &self.sql_dir
    }

    /// Query text of `<sql_dir>/<name>.sql`; `.sql` is appended when missing.
    pub async fn read_sql(&self, name: &str) -> Result<String, ReportError> {
        let file_name = if name.ends_with(".sql") {
            name.to_string()
        } else {
            format!("{name}.sql")
        };
        let path = self.sql_dir.join(file_name);
        match tokio::fs::read_to_string(&path).await {
            Ok(sql) => Ok(sql),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(ReportError::MissingSql(path)),
            Err(source) => Err(ReportError::Io { path, source }),
        }
    }

    pub async fn execute_query(&self, sql: &str) -> Result<Table, ReportError> {
        let table = self.store.query_table(sql).await?;
        debug!(rows = table.rows.len(), "outlier query returned");
        Ok(table)
    }

    pub async fn run(&self, report: OutlierReport) -> Result<Table, ReportError> {
        let sql = self.read_sql(report.file_stem()).await?;
        let table = self.execute_query(&sql).await?;
        info!(report = report.file_stem(), rows = table.rows.len(), "outlier report");
        Ok(table)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use leadtime_core::{PendingPullRequest, Project, PullRequest, PullRequestIdentifier, PullRequestLinks, Release, Story};
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    pub(crate) fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn repo_sql_dir() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../..").join(DEFAULT_SQL_DIR)
    }

    struct Fixture {
        _dir: TempDir,
        store: Store,
    }

    async fn seed_release(store: &Store, internal_id: &str, date: NaiveDate, story: &str, pr: u64, earliest: NaiveDate) {
        store
            .save_releases(&[Release {
                internal_id: internal_id.into(),
                title: format!("v{internal_id}"),
                description: None,
                date,
                project_key: "PROJ".into(),
            }])
            .await
            .unwrap();
        store
            .save_stories(&[Story {
                key: story.into(),
                title: format!("Story {story}"),
                story_type: "Story".into(),
                created: Utc.with_ymd_and_hms(2023, 5, 1, 0, 0, 0).unwrap(),
                resolved: Some(Utc.with_ymd_and_hms(2023, 6, 5, 0, 0, 0).unwrap()),
                release_internal_id: internal_id.into(),
            }])
            .await
            .unwrap();
        let identifier = PullRequestIdentifier::new("acme", "api", pr);
        let mut links = PullRequestLinks::new();
        links.insert(story.into(), vec![identifier.clone()]);
        store.save_pull_request_links(&links).await.unwrap();

        let pending: Vec<PendingPullRequest> = store.pull_requests_without_details(0).await.unwrap();
        let id = pending.iter().find(|p| p.identifier == identifier).unwrap().id;
        store
            .save_pull_request_details(&[PullRequest {
                id,
                identifier,
                title: "Test PR".into(),
                open_date: Some(earliest),
                close_date: Some(earliest),
                commit_count: 1,
                earliest_commit: Some(earliest),
                latest_commit: Some(earliest),
            }])
            .await
            .unwrap();
    }

    async fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("releases.db"));
        store.create_schema().await.unwrap();
        store
            .save_projects(&[Project {
                internal_id: "10000".into(),
                key: "PROJ".into(),
                title: "Project".into(),
                project_type: "software".into(),
            }])
            .await
            .unwrap();
        seed_release(&store, "100", ymd(2023, 6, 15), "PROJ-1", 1, ymd(2023, 6, 10)).await;
        Fixture { _dir: dir, store }
    }

    pub(crate) async fn seeded_store() -> (TempDir, Store) {
        let fixture = fixture().await;
        (fixture._dir, fixture.store)
    }

    #[tokio::test]
    async fn single_release_scenario_averages_six_days() {
        let fx = fixture().await;
        let report = LeadTimeReport::new(fx.store.clone());
        let result = report
            .calculate_lead_time(&["PROJ".into()], ymd(2023, 6, 1), ymd(2023, 6, 30))
            .await
            .unwrap();
        assert_eq!(result.average_lead_time, 6.0);
        assert_eq!(result.number_of_releases, 1);
    }

    #[tokio::test]
    async fn empty_aggregate_defaults_to_zero() {
        let fx = fixture().await;
        let report = LeadTimeReport::new(fx.store.clone());

        let other_project = report
            .calculate_lead_time(&["NOPE".into()], ymd(2023, 6, 1), ymd(2023, 6, 30))
            .await
            .unwrap();
        assert_eq!(other_project.average_lead_time, 0.0);
        assert_eq!(other_project.number_of_releases, 0);

        let no_keys = report.calculate_lead_time(&[], ymd(2023, 6, 1), ymd(2023, 6, 30)).await.unwrap();
        assert_eq!(no_keys.number_of_releases, 0);
    }

    #[tokio::test]
    async fn window_bounds_are_inclusive() {
        let fx = fixture().await;
        let report = LeadTimeReport::new(fx.store.clone());
        let keys = ["PROJ".to_string()];
        let on_day = report.calculate_lead_time(&keys, ymd(2023, 6, 15), ymd(2023, 6, 15)).await.unwrap();
        assert_eq!(on_day.number_of_releases, 1);
        let after = report.calculate_lead_time(&keys, ymd(2023, 6, 16), ymd(2023, 6, 30)).await.unwrap();
        assert_eq!(after.number_of_releases, 0);
    }

    #[tokio::test]
    async fn monthly_report_covers_every_touched_month() {
        let fx = fixture().await;
        seed_release(&fx.store, "101", ymd(2023, 8, 2), "PROJ-2", 2, ymd(2023, 7, 30)).await;
        seed_release(&fx.store, "102", ymd(2023, 8, 20), "PROJ-3", 3, ymd(2023, 8, 19)).await;
        let report = LeadTimeReport::new(fx.store.clone());

        let monthly = report
            .monthly_lead_time_report(&["PROJ".into()], ymd(2023, 5, 15), ymd(2023, 8, 10))
            .await
            .unwrap();
        let summary = monthly
            .iter()
            .map(|m| (m.label.as_str(), m.lead_time, m.releases))
            .collect::<Vec<_>>();
        // August: (4 + 2) / 2 = 3, including the release after the 10th.
        assert_eq!(
            summary,
            vec![("2023-05", 0, 0), ("2023-06", 6, 1), ("2023-07", 0, 0), ("2023-08", 3, 2)]
        );
        assert_eq!(monthly[3].end, ymd(2023, 8, 31));
    }

    #[tokio::test]
    async fn lead_time_rows_expose_view_shape() {
        let fx = fixture().await;
        let report = LeadTimeReport::new(fx.store.clone());
        let rows = report
            .lead_time_rows(&["PROJ".into()], ymd(2023, 1, 1), ymd(2023, 12, 31))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pull_request, "acme/api#1");
        assert_eq!(rows[0].release_date, ymd(2023, 6, 15));
        assert_eq!(rows[0].earliest_commit, Some(ymd(2023, 6, 10)));
        assert_eq!(rows[0].lead_time_days, Some(6.0));
    }

    #[test]
    fn outlier_names_resolve_with_or_without_prefix() {
        assert_eq!(
            OutlierReport::from_name("C_stories_in_multiple_releases.sql").unwrap(),
            OutlierReport::StoriesInMultipleReleases
        );
        assert_eq!(
            OutlierReport::from_name("stories_without_pull_requests").unwrap(),
            OutlierReport::StoriesWithoutPullRequests
        );
        assert!(matches!(
            OutlierReport::from_name("Z_everything"),
            Err(ReportError::UnknownReport(_))
        ));
    }

    #[tokio::test]
    async fn missing_sql_file_is_an_error() {
        let fx = fixture().await;
        let dir = tempdir().unwrap();
        let reports = OutlierReports::new(fx.store.clone(), dir.path());
        assert!(matches!(
            reports.read_sql("A_projects_without_releases").await,
            Err(ReportError::MissingSql(_))
        ));

        std::fs::write(dir.path().join("custom.sql"), "SELECT key FROM projects").unwrap();
        let sql = reports.read_sql("custom").await.unwrap();
        let table = reports.execute_query(&sql).await.unwrap();
        assert_eq!(table.rows, vec![vec![json!("PROJ")]]);
    }

    #[tokio::test]
    async fn shipped_outlier_queries_run_against_the_schema() {
        let fx = fixture().await;
        let store = &fx.store;
        store
            .save_projects(&[Project {
                internal_id: "20000".into(),
                key: "IDLE".into(),
                title: "Idle".into(),
                project_type: "software".into(),
            }])
            .await
            .unwrap();
        store
            .save_releases(&[Release {
                internal_id: "200".into(),
                title: "v200".into(),
                description: None,
                date: ymd(2023, 6, 1),
                project_key: "PROJ".into(),
            }])
            .await
            .unwrap();
        store
            .save_stories(&[
                Story {
                    key: "PROJ-1".into(),
                    title: "Story PROJ-1".into(),
                    story_type: "Story".into(),
                    created: Utc.with_ymd_and_hms(2023, 5, 1, 0, 0, 0).unwrap(),
                    resolved: Some(Utc.with_ymd_and_hms(2023, 6, 5, 0, 0, 0).unwrap()),
                    release_internal_id: "200".into(),
                },
                Story {
                    key: "PROJ-9".into(),
                    title: "Orphan work".into(),
                    story_type: "Bug".into(),
                    created: Utc.with_ymd_and_hms(2023, 5, 1, 0, 0, 0).unwrap(),
                    resolved: None,
                    release_internal_id: "200".into(),
                },
            ])
            .await
            .unwrap();
        let mut links = PullRequestLinks::new();
        links.insert("PROJ-9".into(), vec![]);
        store.save_pull_request_links(&links).await.unwrap();

        let reports = OutlierReports::new(store.clone(), repo_sql_dir());
        let projects = reports.run(OutlierReport::ProjectsWithoutReleases).await.unwrap();
        assert_eq!(projects.rows.len(), 1);
        assert!(projects.rows[0].contains(&json!("IDLE")));

        let open_stories = reports.run(OutlierReport::ReleasesWithOpenStories).await.unwrap();
        assert_eq!(open_stories.rows.len(), 2);

        let multiple = reports.run(OutlierReport::StoriesInMultipleReleases).await.unwrap();
        assert_eq!(multiple.rows.len(), 1);
        assert!(multiple.rows[0].contains(&json!("PROJ-1")));

        // PROJ-1 carries PR 1 into v200, which shipped before that PR closed.
        let open_prs = reports.run(OutlierReport::ReleasesWithOpenPullRequests).await.unwrap();
        assert_eq!(open_prs.rows.len(), 1);
        assert!(open_prs.rows[0].contains(&json!("v200")));
        assert!(open_prs.rows[0].contains(&json!("PROJ-1")));

        let without = reports.run(OutlierReport::StoriesWithoutPullRequests).await.unwrap();
        assert_eq!(without.rows.len(), 1);
        assert!(without.rows[0].contains(&json!("PROJ-9")));

        let counts = reports.run(OutlierReport::CountsOfStoriesWithoutPullRequests).await.unwrap();
        assert_eq!(counts.rows.len(), 1);
    }
}
