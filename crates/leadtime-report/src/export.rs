//! Parquet + chart snapshot of a lead-time report, with a checksummed manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;

use crate::{LeadTimeRow, MonthlyLeadTime};

pub const MONTHLY_PARQUET: &str = "monthly_lead_time.parquet";
pub const ROWS_PARQUET: &str = "lead_times.parquet";
pub const CHART_JSON: &str = "monthly_lead_time_chart.json";
pub const MANIFEST_JSON: &str = "manifest.json";

#[derive(Debug, Clone, Serialize)]
pub struct ExportManifest {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub files: Vec<ExportManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes the monthly series, the underlying rows and a chart spec into `dir`,
/// then a manifest describing them. Returns the manifest path.
pub async fn export_snapshot(dir: &Path, monthly: &[MonthlyLeadTime], rows: &[LeadTimeRow]) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let monthly_path = dir.join(MONTHLY_PARQUET);
    let rows_path = dir.join(ROWS_PARQUET);
    let chart_path = dir.join(CHART_JSON);

    write_monthly_parquet(&monthly_path, monthly)?;
    write_rows_parquet(&rows_path, rows)?;

    let chart = monthly_chart(monthly, "Monthly Lead Time for Changes", true);
    let chart_bytes = serde_json::to_vec_pretty(&chart).context("serializing chart")?;
    fs::write(&chart_path, chart_bytes)
        .await
        .with_context(|| format!("writing {}", chart_path.display()))?;

    let manifest = ExportManifest {
        schema_version: 1,
        generated_at: Utc::now(),
        files: vec![
            manifest_entry("monthly_lead_time", dir, &monthly_path)?,
            manifest_entry("lead_times", dir, &rows_path)?,
            manifest_entry("monthly_lead_time_chart", dir, &chart_path)?,
        ],
    };

    let manifest_path = dir.join(MANIFEST_JSON);
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing export manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    info!(dir = %dir.display(), months = monthly.len(), rows = rows.len(), "snapshot exported");
    Ok(manifest_path)
}

/// Plotly figure with one line per metric. Lead time is solid, releases
/// dashed; `show_trend` adds a least-squares line for each.
pub fn monthly_chart(monthly: &[MonthlyLeadTime], title: &str, show_trend: bool) -> JsonValue {
    let x = monthly.iter().map(|m| m.label.clone()).collect::<Vec<_>>();
    let series = [
        ("Lead Time", "blue", "solid", monthly.iter().map(|m| m.lead_time as f64).collect::<Vec<_>>()),
        ("Releases", "cyan", "dash", monthly.iter().map(|m| m.releases as f64).collect::<Vec<_>>()),
    ];

    let mut data = Vec::new();
    for (name, color, dash, y) in series {
        let trend = if show_trend { trend_line(&y) } else { None };
        data.push(json!({
            "type": "scatter",
            "mode": "lines+markers",
            "name": name,
            "x": x,
            "y": y,
            "line": {"color": color, "dash": dash}
        }));
        if let Some(trend) = trend {
            data.push(json!({
                "type": "scatter",
                "mode": "lines",
                "name": format!("{name} trend"),
                "x": x,
                "y": trend,
                "line": {"color": color, "dash": "dot"}
            }));
        }
    }

    json!({
        "data": data,
        "layout": {
            "title": title,
            "xaxis": {"title": "Month", "tickangle": -45},
            "yaxis": {"title": "Values"},
            "paper_bgcolor": "#ffffff",
            "plot_bgcolor": "#f8fafc"
        }
    })
}

/// Degree-one least-squares fit evaluated at `0..n`. `None` with fewer than two points.
pub fn trend_line(values: &[f64]) -> Option<Vec<f64>> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / n;
    let (mut covariance, mut variance) = (0.0, 0.0);
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - mean_x;
        covariance += dx * (y - mean_y);
        variance += dx * dx;
    }
    let slope = covariance / variance;
    let intercept = mean_y - slope * mean_x;
    Some((0..values.len()).map(|i| intercept + slope * i as f64).collect())
}

fn write_monthly_parquet(path: &Path, monthly: &[MonthlyLeadTime]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("month", DataType::Utf8, false),
        ArrowField::new("start_date", DataType::Utf8, false),
        ArrowField::new("end_date", DataType::Utf8, false),
        ArrowField::new("lead_time_days", DataType::Int64, false),
        ArrowField::new("releases", DataType::Int64, false),
    ]));

    let months = StringArray::from(monthly.iter().map(|m| m.label.clone()).collect::<Vec<_>>());
    let starts = StringArray::from(monthly.iter().map(|m| m.start.to_string()).collect::<Vec<_>>());
    let ends = StringArray::from(monthly.iter().map(|m| m.end.to_string()).collect::<Vec<_>>());
    let lead_times = Int64Array::from(monthly.iter().map(|m| m.lead_time).collect::<Vec<_>>());
    let releases = Int64Array::from(monthly.iter().map(|m| m.releases).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(months),
            Arc::new(starts),
            Arc::new(ends),
            Arc::new(lead_times),
            Arc::new(releases),
        ],
    )
    .context("building monthly lead time record batch")?;
    write_parquet(path, batch)
}

fn write_rows_parquet(path: &Path, rows: &[LeadTimeRow]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("release_internal_id", DataType::Utf8, false),
        ArrowField::new("release_title", DataType::Utf8, false),
        ArrowField::new("release_date", DataType::Utf8, false),
        ArrowField::new("project_key", DataType::Utf8, false),
        ArrowField::new("story_key", DataType::Utf8, false),
        ArrowField::new("pull_request", DataType::Utf8, false),
        ArrowField::new("pr_title", DataType::Utf8, true),
        ArrowField::new("earliest_commit", DataType::Utf8, true),
        ArrowField::new("lead_time_days", DataType::Float64, true),
    ]));

    let release_ids = StringArray::from(rows.iter().map(|r| Some(r.release_internal_id.as_str())).collect::<Vec<_>>());
    let release_titles = StringArray::from(rows.iter().map(|r| Some(r.release_title.as_str())).collect::<Vec<_>>());
    let release_dates = StringArray::from(rows.iter().map(|r| Some(r.release_date.to_string())).collect::<Vec<_>>());
    let project_keys = StringArray::from(rows.iter().map(|r| Some(r.project_key.as_str())).collect::<Vec<_>>());
    let story_keys = StringArray::from(rows.iter().map(|r| Some(r.story_key.as_str())).collect::<Vec<_>>());
    let pull_requests = StringArray::from(rows.iter().map(|r| Some(r.pull_request.as_str())).collect::<Vec<_>>());
    let pr_titles = StringArray::from(rows.iter().map(|r| r.pr_title.as_deref()).collect::<Vec<_>>());
    let earliest = StringArray::from(
        rows.iter()
            .map(|r| r.earliest_commit.map(|d| d.to_string()))
            .collect::<Vec<_>>(),
    );
    let lead_times = Float64Array::from(rows.iter().map(|r| r.lead_time_days).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(release_ids),
            Arc::new(release_titles),
            Arc::new(release_dates),
            Arc::new(project_keys),
            Arc::new(story_keys),
            Arc::new(pull_requests),
            Arc::new(pr_titles),
            Arc::new(earliest),
            Arc::new(lead_times),
        ],
    )
    .context("building lead time rows record batch")?;
    write_parquet(path, batch)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, dir: &Path, path: &Path) -> Result<ExportManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(dir).unwrap_or(path).display().to_string();
    Ok(ExportManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}
