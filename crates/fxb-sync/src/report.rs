//! Per-run reports: `summary.md`, `run.json` and parquet snapshots with a sha256 manifest.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use fxb_core::{BrokerRef, FieldChanges};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

use crate::update::{BatchOutcome, UpdateFailure};

const SUMMARY_REVIEW_LIMIT: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub run_id: Uuid,
    pub job: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub loaded: usize,
    pub planned: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub retried: usize,
    pub review_items: usize,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl JobSummary {
    pub fn start(job: &str, dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            job: job.to_string(),
            started_at: now,
            finished_at: now,
            dry_run,
            loaded: 0,
            planned: 0,
            updated: 0,
            skipped: 0,
            failed: 0,
            retried: 0,
            review_items: 0,
            notes: Vec::new(),
        }
    }

    pub fn record_outcome(&mut self, outcome: &BatchOutcome) {
        self.updated += outcome.updated;
        self.skipped += outcome.skipped;
        self.failed += outcome.failed;
        self.retried += outcome.retried;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewKind {
    Unmatched,
    DuplicateMatch,
    UnknownTier,
    NearDuplicate,
    ValidationError,
    ValidationWarning,
    UploadFailed,
    UndecodableRow,
    Blocked,
}

impl ReviewKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewKind::Unmatched => "unmatched",
            ReviewKind::DuplicateMatch => "duplicate_match",
            ReviewKind::UnknownTier => "unknown_tier",
            ReviewKind::NearDuplicate => "near_duplicate",
            ReviewKind::ValidationError => "validation_error",
            ReviewKind::ValidationWarning => "validation_warning",
            ReviewKind::UploadFailed => "upload_failed",
            ReviewKind::UndecodableRow => "undecodable_row",
            ReviewKind::Blocked => "blocked",
        }
    }
}

/// Something a person has to look at; the pipeline never guesses past these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewItem {
    pub kind: ReviewKind,
    pub subject: String,
    pub broker: Option<BrokerRef>,
    pub detail: String,
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedChange {
    pub broker: BrokerRef,
    pub changes: FieldChanges,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub summary: JobSummary,
    pub changes: Vec<PlannedChange>,
    pub review: Vec<ReviewItem>,
    pub failures: Vec<UpdateFailure>,
}

impl RunReport {
    pub fn new(summary: JobSummary) -> Self {
        Self {
            summary,
            changes: Vec::new(),
            review: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn flag(
        &mut self,
        kind: ReviewKind,
        subject: impl Into<String>,
        detail: impl Into<String>,
    ) -> &mut ReviewItem {
        self.review.push(ReviewItem {
            kind,
            subject: subject.into(),
            broker: None,
            detail: detail.into(),
            score: None,
        });
        let last = self.review.len() - 1;
        &mut self.review[last]
    }

    /// Flags a broker, using its display form as the subject.
    pub fn flag_broker(&mut self, kind: ReviewKind, broker: BrokerRef, detail: impl Into<String>) -> &mut ReviewItem {
        let subject = broker.to_string();
        let item = self.flag(kind, subject, detail);
        item.broker = Some(broker);
        item
    }

    /// Stamps the finish time and folds counts into the summary.
    pub fn finish(mut self, outcome: Option<BatchOutcome>) -> Self {
        if let Some(outcome) = outcome {
            self.summary.record_outcome(&outcome);
            self.failures.extend(outcome.failures);
        }
        self.summary.planned = self.changes.len();
        self.summary.review_items = self.review.len();
        self.summary.finished_at = Utc::now();
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct WrittenReport {
    pub reports_dir: PathBuf,
    pub manifest_path: PathBuf,
}

pub async fn write_run_report(workspace_root: &Path, report: &RunReport) -> Result<WrittenReport> {
    let reports_dir = workspace_root
        .join("reports")
        .join(report.summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    fs::write(reports_dir.join("summary.md"), render_summary_markdown(report))
        .await
        .context("writing summary.md")?;

    let run_json = serde_json::to_vec_pretty(report).context("serializing run report")?;
    fs::write(reports_dir.join("run.json"), run_json)
        .await
        .context("writing run.json")?;

    let manifest_path = export_parquet_snapshots(&reports_dir, report).await?;
    Ok(WrittenReport {
        reports_dir,
        manifest_path,
    })
}

pub fn render_summary_markdown(report: &RunReport) -> String {
    let s = &report.summary;
    let mut lines = vec![
        format!("# Broker pipeline run: {}", s.job),
        String::new(),
        format!("- Run ID: `{}`", s.run_id),
        format!("- Started: {}", s.started_at),
        format!("- Finished: {}", s.finished_at),
        format!("- Mode: {}", if s.dry_run { "dry run" } else { "write" }),
        format!("- Loaded: {}", s.loaded),
        format!("- Planned changes: {}", s.planned),
        format!("- Updated: {}", s.updated),
        format!("- Skipped: {}", s.skipped),
        format!("- Failed: {}", s.failed),
        format!("- Retried: {}", s.retried),
        format!("- Review items: {}", s.review_items),
    ];
    for note in &s.notes {
        lines.push(format!("- Note: {note}"));
    }

    let mut by_kind: BTreeMap<&str, usize> = BTreeMap::new();
    for item in &report.review {
        *by_kind.entry(item.kind.as_str()).or_default() += 1;
    }
    if !by_kind.is_empty() {
        lines.push(String::new());
        lines.push("## Review Counts".to_string());
        lines.extend(by_kind.iter().map(|(k, v)| format!("- {k}: {v}")));

        lines.push(String::new());
        lines.push("## Review Queue".to_string());
        for item in report.review.iter().take(SUMMARY_REVIEW_LIMIT) {
            let score = item.score.map(|s| format!(" ({s:.2})")).unwrap_or_default();
            lines.push(format!("- [{}] {}{}: {}", item.kind.as_str(), item.subject, score, item.detail));
        }
        if report.review.len() > SUMMARY_REVIEW_LIMIT {
            lines.push(format!(
                "- ... {} more in run.json",
                report.review.len() - SUMMARY_REVIEW_LIMIT
            ));
        }
    }

    if !report.failures.is_empty() {
        lines.push(String::new());
        lines.push("## Failures".to_string());
        for failure in &report.failures {
            lines.push(format!(
                "- {} after {} attempt(s): {}",
                failure.key, failure.attempts, failure.error
            ));
        }
    }

    lines.push(String::new());
    lines.join("\n")
}

async fn export_parquet_snapshots(reports_dir: &Path, report: &RunReport) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let changes_path = snapshot_dir.join("changes.parquet");
    let review_path = snapshot_dir.join("review.parquet");
    write_changes_parquet(&changes_path, report)?;
    write_review_parquet(&review_path, report)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("changes", reports_dir, &changes_path)?,
            manifest_entry("review", reports_dir, &review_path)?,
        ],
    };

    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
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

/// One row per changed column.
fn write_changes_parquet(path: &Path, report: &RunReport) -> Result<()> {
    let rows = report
        .changes
        .iter()
        .flat_map(|change| {
            change.changes.as_map().iter().map(move |(column, value)| {
                (
                    change.broker.slug.as_str(),
                    change.broker.id.as_ref().map(|id| id.to_string()),
                    column.as_str(),
                    value.to_string(),
                    change.reason.as_str(),
                )
            })
        })
        .collect::<Vec<_>>();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("slug", DataType::Utf8, false),
        ArrowField::new("broker_id", DataType::Utf8, true),
        ArrowField::new("column", DataType::Utf8, false),
        ArrowField::new("new_value", DataType::Utf8, false),
        ArrowField::new("reason", DataType::Utf8, false),
    ]));
    let slugs = StringArray::from(rows.iter().map(|r| Some(r.0)).collect::<Vec<_>>());
    let ids = StringArray::from(rows.iter().map(|r| r.1.as_deref()).collect::<Vec<_>>());
    let columns = StringArray::from(rows.iter().map(|r| Some(r.2)).collect::<Vec<_>>());
    let values = StringArray::from(rows.iter().map(|r| Some(r.3.as_str())).collect::<Vec<_>>());
    let reasons = StringArray::from(rows.iter().map(|r| Some(r.4)).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(slugs),
            Arc::new(ids),
            Arc::new(columns),
            Arc::new(values),
            Arc::new(reasons),
        ],
    )
    .context("building changes record batch")?;
    write_parquet(path, batch)
}

fn write_review_parquet(path: &Path, report: &RunReport) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("kind", DataType::Utf8, false),
        ArrowField::new("subject", DataType::Utf8, false),
        ArrowField::new("slug", DataType::Utf8, true),
        ArrowField::new("detail", DataType::Utf8, false),
        ArrowField::new("score", DataType::Float64, true),
    ]));

    let kinds = StringArray::from(
        report
            .review
            .iter()
            .map(|r| Some(r.kind.as_str()))
            .collect::<Vec<_>>(),
    );
    let subjects = StringArray::from(
        report
            .review
            .iter()
            .map(|r| Some(r.subject.as_str()))
            .collect::<Vec<_>>(),
    );
    let slugs = StringArray::from(
        report
            .review
            .iter()
            .map(|r| r.broker.as_ref().map(|b| b.slug.as_str()))
            .collect::<Vec<_>>(),
    );
    let details = StringArray::from(
        report
            .review
            .iter()
            .map(|r| Some(r.detail.as_str()))
            .collect::<Vec<_>>(),
    );
    let scores = Float64Array::from(report.review.iter().map(|r| r.score).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(kinds),
            Arc::new(subjects),
            Arc::new(slugs),
            Arc::new(details),
            Arc::new(scores),
        ],
    )
    .context("building review record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

/// Markdown digest of the most recent runs under `reports/`, newest first.
pub fn report_recent_markdown(runs: usize, workspace_root: &Path) -> Result<String> {
    let reports_root = workspace_root.join("reports");
    let mut summaries = Vec::new();
    for entry in std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
    {
        let run_path = entry.path().join("run.json");
        if !run_path.exists() {
            continue;
        }
        let value: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&run_path)
                .with_context(|| format!("reading {}", run_path.display()))?,
        )
        .with_context(|| format!("parsing {}", run_path.display()))?;
        let summary: JobSummary = serde_json::from_value(value["summary"].clone())
            .with_context(|| format!("decoding summary in {}", run_path.display()))?;
        summaries.push((summary, entry.path()));
    }
    summaries.sort_by(|a, b| b.0.started_at.cmp(&a.0.started_at));

    let mut lines = vec!["# Broker Pipeline Runs".to_string(), String::new()];
    for (summary, dir) in summaries.into_iter().take(runs.max(1)) {
        lines.push(format!("## `{}` ({})", summary.job, summary.run_id));
        lines.push(format!("- started: {}", summary.started_at));
        lines.push(format!(
            "- updated {} / skipped {} / failed {}",
            summary.updated, summary.skipped, summary.failed
        ));
        lines.push(format!("- review items: {}", summary.review_items));
        let manifest_path = dir.join("snapshots").join("manifest.json");
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        lines.push(format!("- summary: `{}`", dir.join("summary.md").display()));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
