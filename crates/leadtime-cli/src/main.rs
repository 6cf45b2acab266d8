use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use leadtime_report::{export_snapshot, LeadTimeReport, OutlierReport, OutlierReports, DEFAULT_SQL_DIR};
use leadtime_storage::{Store, Table};
use leadtime_sync::{apply_project_types, load_env_files, ProjectTypesFile, SyncConfig, SyncPipeline};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "leadtime")]
#[command(about = "DORA lead time for changes from Jira releases and GitHub pull requests")]
struct Cli {
    /// SQLite database file; defaults to SQLITE_PATH or ./releases.db.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull projects, releases, stories and pull requests into the database.
    Sync {
        #[arg(long, env = "START_DATE")]
        start: NaiveDate,
        #[arg(long, env = "END_DATE")]
        end: NaiveDate,
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Create or upgrade the database schema.
    Migrate,
    /// Overwrite the type of the given projects.
    Classify {
        #[arg(long = "type", required_unless_present = "file")]
        project_type: Option<String>,
        #[arg(requires = "project_type")]
        keys: Vec<String>,
        /// YAML file of the form `types: { <type>: [<key>, ...] }`.
        #[arg(long, conflicts_with = "project_type")]
        file: Option<PathBuf>,
    },
    /// List stored projects, optionally filtered by type.
    Projects {
        #[arg(long = "type")]
        types: Vec<String>,
    },
    /// Average lead time for the projects over a date window.
    LeadTime {
        #[arg(long, value_delimiter = ',', required = true)]
        projects: Vec<String>,
        #[arg(long, env = "START_DATE")]
        start: NaiveDate,
        #[arg(long, env = "END_DATE")]
        end: NaiveDate,
        /// Break the window down by calendar month.
        #[arg(long)]
        monthly: bool,
    },
    /// Run the outlier reports (all of them unless one is named).
    Outliers {
        #[arg(long)]
        report: Option<String>,
        #[arg(long, default_value = DEFAULT_SQL_DIR)]
        sql_dir: PathBuf,
    },
    /// Write parquet files, a chart spec and a manifest for the monthly report.
    Export {
        #[arg(long, value_delimiter = ',', required = true)]
        projects: Vec<String>,
        #[arg(long, env = "START_DATE")]
        start: NaiveDate,
        #[arg(long, env = "END_DATE")]
        end: NaiveDate,
        #[arg(long, default_value = "reports/out")]
        out: PathBuf,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();
    // Before parsing: START_DATE and END_DATE may come from these files.
    load_env_files(Path::new("."))?;
    let cli = Cli::parse();

    let mut config = SyncConfig::from_env();
    if let Some(db) = cli.db {
        config.sqlite_path = db;
    }
    let store = Store::open(config.sqlite_path.clone());

    match cli.command {
        Commands::Sync { start, end, json } => {
            if start > end {
                bail!("--start {start} is after --end {end}");
            }
            let pipeline = SyncPipeline::from_config(config)?;
            let summary = pipeline.run(start, end).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "sync complete: run_id={} projects={} releases={} stories={} link_batches={} details={} failures={}",
                    summary.run_id,
                    summary.projects_inserted,
                    summary.releases.inserted,
                    summary.stories.inserted,
                    summary.link_batches,
                    summary.details_updated,
                    summary.failures.len()
                );
                for failure in &summary.failures {
                    println!("  failed {:?}: {}", failure.stage, failure.message);
                }
            }
        }
        Commands::Migrate => {
            store.create_schema().await.context("creating schema")?;
            println!("schema ready at {}", store.path().display());
            println!("tables: {}", store.table_names().await?.join(", "));
            println!("views: {}", store.view_names().await?.join(", "));
        }
        Commands::Classify {
            project_type,
            keys,
            file,
        } => {
            let types = match (file, project_type) {
                (Some(path), _) => ProjectTypesFile::load(&path).await?,
                (None, Some(project_type)) => {
                    let mut file = ProjectTypesFile::default();
                    file.types.insert(project_type, keys);
                    file
                }
                (None, None) => bail!("either --type with project keys or --file is required"),
            };
            let updated = apply_project_types(&store, &types).await?;
            println!("updated {updated} project(s)");
        }
        Commands::Projects { types } => {
            if types.is_empty() {
                for project in store.retrieve_all_projects().await? {
                    println!("{}\t{}\t{}", project.key, project.project_type, project.title);
                }
            } else {
                for (key, title) in store.retrieve_projects_by_type(&types).await? {
                    println!("{key}\t{title}");
                }
            }
        }
        Commands::LeadTime {
            projects,
            start,
            end,
            monthly,
        } => {
            let report = LeadTimeReport::new(store);
            if monthly {
                println!("month\tlead_time_days\treleases");
                for month in report.monthly_lead_time_report(&projects, start, end).await? {
                    println!("{}\t{}\t{}", month.label, month.lead_time, month.releases);
                }
            } else {
                let result = report.calculate_lead_time(&projects, start, end).await?;
                println!(
                    "{} {}..{}: average lead time {:.2} days over {} release(s)",
                    result.project_keys.join(","),
                    result.start,
                    result.end,
                    result.average_lead_time,
                    result.number_of_releases
                );
            }
        }
        Commands::Outliers { report, sql_dir } => {
            let reports = OutlierReports::new(store, sql_dir);
            let selected = match report {
                Some(name) => vec![OutlierReport::from_name(&name)?],
                None => OutlierReport::ALL.to_vec(),
            };
            for report in selected {
                let table = reports.run(report).await?;
                print_table(report.title(), &table);
            }
        }
        Commands::Export {
            projects,
            start,
            end,
            out,
        } => {
            let report = LeadTimeReport::new(store);
            let monthly = report.monthly_lead_time_report(&projects, start, end).await?;
            let rows = report.lead_time_rows(&projects, start, end).await?;
            let manifest = export_snapshot(&out, &monthly, &rows).await?;
            info!(manifest = %manifest.display(), "export written");
            println!("export complete: manifest={}", manifest.display());
        }
    }

    Ok(())
}

fn print_table(title: &str, table: &Table) {
    println!("== {title} ({} rows)", table.rows.len());
    if table.is_empty() {
        return;
    }
    println!("{}", table.columns.join("\t"));
    for row in &table.rows {
        let cells = row
            .iter()
            .map(|cell| match cell {
                serde_json::Value::Null => String::new(),
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>();
        println!("{}", cells.join("\t"));
    }
}
