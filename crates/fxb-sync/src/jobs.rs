//! Batch jobs. Each one loads the broker table once, plans changes, writes them
//! through the update queue and leaves a report under `reports/<run_id>/`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fxb_adapters::{
    clean_display_name, load_scrape_bundle, load_seed_bundle, prepare_seed_rows, read_logo_bytes, LabelSource,
    LogoDirectory,
};
use fxb_core::{Broker, BrokerRef, FieldChanges};
use fxb_storage::{
    content_hash, logo_object_key, BrokerStore, LocalObjectStore, ObjectStore, PgStore, RestClientConfig,
    RestObjectStore, RestStore, SelectQuery,
};
use serde_json::Value as JsonValue;
use tracing::{info, info_span, warn, Instrument};

use crate::classify::TierClassifier;
use crate::dedup::DedupEngine;
use crate::matcher::{FuzzyMatcher, MatchBatch};
use crate::report::{write_run_report, JobSummary, PlannedChange, ReviewKind, RunReport};
use crate::rules::LookupTables;
use crate::update::{BatchOutcome, BatchUpdater, UpdateTask};
use crate::validate::{Severity, Validator};
use crate::PipelineConfig;

/// Broker rows as stored plus the ones that decode into [`Broker`].
#[derive(Debug, Clone, Default)]
pub struct LoadedBrokers {
    pub rows: Vec<JsonValue>,
    pub brokers: Vec<Broker>,
    pub undecodable: Vec<(BrokerRef, String)>,
}

#[derive(Debug, Clone)]
pub struct JobRun {
    pub report: RunReport,
    pub reports_dir: PathBuf,
}

pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<dyn BrokerStore>,
    objects: Arc<dyn ObjectStore>,
    tables: Arc<LookupTables>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn BrokerStore>,
        objects: Arc<dyn ObjectStore>,
        tables: Arc<LookupTables>,
    ) -> Self {
        Self {
            config,
            store,
            objects,
            tables,
        }
    }

    /// Picks the Postgres backend when `DATABASE_URL` is set, else the REST
    /// endpoint. Logos go to the hosted bucket when REST credentials exist and
    /// to `artifacts/logos` otherwise.
    pub async fn connect(config: PipelineConfig) -> Result<Self> {
        let tables = LookupTables::from_workspace_root(&config.workspace_root)?;
        let rest_credentials = config.store_url.clone().zip(config.store_key.clone());

        let store: Arc<dyn BrokerStore> = match (&config.database_url, &rest_credentials) {
            (Some(url), _) => Arc::new(
                PgStore::connect(url, &config.brokers_table)
                    .await
                    .context("connecting to postgres")?,
            ),
            (None, Some((base, key))) => {
                let mut rest = RestClientConfig::new(base.clone(), key.clone());
                rest.table = config.brokers_table.clone();
                rest.timeout = Duration::from_secs(config.http_timeout_secs);
                rest.user_agent = Some(config.user_agent.clone());
                Arc::new(RestStore::new(rest).context("building REST store client")?)
            }
            (None, None) => anyhow::bail!(
                "no broker store configured: set DATABASE_URL or FXB_STORE_URL and FXB_STORE_KEY"
            ),
        };

        let objects: Arc<dyn ObjectStore> = match &rest_credentials {
            Some((base, key)) => Arc::new(
                RestObjectStore::new(base, key, &config.logo_bucket, config.backoff())
                    .context("building object store client")?,
            ),
            None => {
                let root = config.artifacts_dir.join("logos");
                let public_base = format!("file://{}", root.display());
                Arc::new(LocalObjectStore::new(root, public_base))
            }
        };

        Ok(Self::new(config, store, objects, Arc::new(tables)))
    }

    pub fn classifier(&self) -> TierClassifier {
        TierClassifier::new(self.tables.clone())
    }

    /// Reads the whole table once. Any store failure here aborts the job.
    pub async fn load_brokers(&self) -> Result<LoadedBrokers> {
        let rows = self
            .store
            .select(&SelectQuery::all().order_by("id", true))
            .await
            .with_context(|| format!("loading brokers from `{}`", self.store.table()))?;

        let mut loaded = LoadedBrokers::default();
        for row in &rows {
            match serde_json::from_value::<Broker>(row.clone()) {
                Ok(broker) => loaded.brokers.push(broker),
                Err(err) => loaded.undecodable.push((BrokerRef::from_row(row), err.to_string())),
            }
        }
        loaded.rows = rows;
        info!(
            rows = loaded.rows.len(),
            undecodable = loaded.undecodable.len(),
            "brokers loaded"
        );
        Ok(loaded)
    }

    async fn load_for(&self, report: &mut RunReport) -> Result<LoadedBrokers> {
        let loaded = self.load_brokers().await?;
        report.summary.loaded = loaded.rows.len();
        for (broker, err) in &loaded.undecodable {
            report.flag_broker(ReviewKind::UndecodableRow, broker.clone(), err.clone());
        }
        Ok(loaded)
    }

    async fn finish(&self, report: RunReport) -> Result<JobRun> {
        let written = write_run_report(&self.config.workspace_root, &report).await?;
        let s = &report.summary;
        info!(
            job = %s.job,
            run_id = %s.run_id,
            planned = s.planned,
            updated = s.updated,
            failed = s.failed,
            review = s.review_items,
            "job finished"
        );
        Ok(JobRun {
            report,
            reports_dir: written.reports_dir,
        })
    }

    /// Turns planned changes into update tasks; brokers without an id are sent to review.
    async fn write_changes(&self, report: &mut RunReport, dry_run: bool) -> BatchOutcome {
        let mut tasks = Vec::with_capacity(report.changes.len());
        let mut missing_ids = Vec::new();
        for change in &report.changes {
            match &change.broker.id {
                Some(id) => tasks.push(UpdateTask::new(
                    change.broker.slug.clone(),
                    id.clone(),
                    change.changes.clone(),
                )),
                None => missing_ids.push(change.broker.clone()),
            }
        }
        for broker in missing_ids {
            report.flag_broker(ReviewKind::UndecodableRow, broker, "row has no id; change not sent");
        }
        BatchUpdater::new(self.store.as_ref(), self.config.updater_config(dry_run))
            .apply(tasks)
            .await
    }

    fn flag_match_review(report: &mut RunReport, batch: &MatchBatch) {
        for dup in &batch.duplicates {
            let item = report.flag(
                ReviewKind::DuplicateMatch,
                dup.item.raw_label.clone(),
                format!(
                    "also matches {} already claimed by item {}",
                    dup.candidate.broker, dup.canonical_item_id
                ),
            );
            item.broker = Some(dup.candidate.broker.clone());
            item.score = Some(dup.candidate.score);
        }
        for unmatched in &batch.unmatched {
            let detail = match &unmatched.best {
                _ if unmatched.item.extracted_name.is_empty() => "no candidate name after cleaning".to_string(),
                Some(best) => format!(
                    "`{}` best guess {} via {} below threshold",
                    unmatched.item.extracted_name,
                    best.broker,
                    best.match_type.as_str()
                ),
                None => format!("`{}` shares nothing with any broker", unmatched.item.extracted_name),
            };
            let item = report.flag(ReviewKind::Unmatched, unmatched.item.raw_label.clone(), detail);
            item.score = Some(unmatched.best.as_ref().map(|b| b.score).unwrap_or(0.0));
        }
    }

    /// Matches logo files to brokers, uploads the matched images and points `logo_url` at them.
    pub async fn run_logo_job(&self, logo_dir: &Path, dry_run: bool) -> Result<JobRun> {
        let mut report = RunReport::new(JobSummary::start("match-logos", dry_run));
        let span = info_span!("job", job = "match-logos", run_id = %report.summary.run_id);
        let outcome = async {
            let loaded = self.load_for(&mut report).await?;
            let items = LogoDirectory::new(logo_dir)
                .load_items()
                .with_context(|| format!("scanning {}", logo_dir.display()))?;
            let batch = FuzzyMatcher::new(self.config.match_config()).match_batch(&items, &loaded.brokers);
            report.summary.notes.push(format!(
                "{} files, {} matched, {} duplicates, {} unmatched",
                items.len(),
                batch.accepted.len(),
                batch.duplicates.len(),
                batch.unmatched.len()
            ));
            Self::flag_match_review(&mut report, &batch);

            for accepted in &batch.accepted {
                let broker = &loaded.brokers[accepted.candidate.broker_index];
                let Some(path) = accepted.item.path.as_ref() else {
                    continue;
                };
                let content_type = accepted
                    .item
                    .content_type
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string());
                let bytes = match read_logo_bytes(path) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "unreadable logo");
                        report.summary.failed += 1;
                        report
                            .flag(ReviewKind::UploadFailed, accepted.item.raw_label.clone(), err.to_string())
                            .broker = Some(broker.reference());
                        continue;
                    }
                };
                let ext = path
                    .extension()
                    .map(|e| e.to_string_lossy().to_string())
                    .unwrap_or_default();
                let key = logo_object_key(&broker.slug, &content_hash(&bytes), &ext);

                let url = if dry_run {
                    self.objects.public_url(&key)
                } else {
                    match self.objects.put(&key, &content_type, &bytes).await {
                        Ok(stored) => stored.public_url,
                        Err(err) => {
                            warn!(key = %key, error = %err, "logo upload failed");
                            report.summary.failed += 1;
                            report
                                .flag(ReviewKind::UploadFailed, accepted.item.raw_label.clone(), err.to_string())
                                .broker = Some(broker.reference());
                            continue;
                        }
                    }
                };

                if broker.logo_url.as_deref() == Some(url.as_str()) {
                    report.summary.skipped += 1;
                    continue;
                }
                report.changes.push(PlannedChange {
                    broker: broker.reference(),
                    changes: FieldChanges::new().set("logo_url", &url),
                    reason: format!(
                        "`{}` matched by {} ({:.2})",
                        accepted.item.raw_label,
                        accepted.candidate.match_type.as_str(),
                        accepted.candidate.score
                    ),
                });
            }

            Ok::<_, anyhow::Error>(self.write_changes(&mut report, dry_run).await)
        }
        .instrument(span)
        .await?;
        self.finish(report.finish(Some(outcome))).await
    }

    /// Matches labels scraped from a saved broker directory page. Read-only:
    /// labels that match nobody are candidates for new broker rows.
    pub async fn run_label_job(&self, bundle_path: &Path) -> Result<JobRun> {
        let mut report = RunReport::new(JobSummary::start("match-labels", true));
        let bundle = load_scrape_bundle(bundle_path)?;
        let loaded = self.load_for(&mut report).await?;
        let items = bundle
            .load_items()
            .with_context(|| format!("extracting labels from {}", bundle_path.display()))?;
        let batch = FuzzyMatcher::new(self.config.match_config()).match_batch(&items, &loaded.brokers);

        report.summary.notes.push(format!(
            "{} labels from {}: {} matched, {} duplicates, {} unmatched",
            items.len(),
            bundle.captured_from_url,
            batch.accepted.len(),
            batch.duplicates.len(),
            batch.unmatched.len()
        ));
        for accepted in &batch.accepted {
            report.summary.notes.push(format!(
                "`{}` is {} ({} {:.2})",
                accepted.item.raw_label,
                accepted.candidate.broker,
                accepted.candidate.match_type.as_str(),
                accepted.candidate.score
            ));
        }
        Self::flag_match_review(&mut report, &batch);
        self.finish(report.finish(None)).await
    }

    /// Writes inferred tiers. Brokers the tables cannot place stay untouched and go to review.
    pub async fn run_tier_job(&self, dry_run: bool) -> Result<JobRun> {
        let mut report = RunReport::new(JobSummary::start("classify-tiers", dry_run));
        let loaded = self.load_for(&mut report).await?;
        let classifier = self.classifier();

        for broker in &loaded.brokers {
            let decision = classifier.classify_broker(broker);
            if !decision.tier.is_storable() {
                report.flag_broker(ReviewKind::UnknownTier, broker.reference(), decision.basis.label());
                continue;
            }
            if broker.regulation_tier == Some(decision.tier) {
                report.summary.skipped += 1;
                continue;
            }
            report.changes.push(PlannedChange {
                broker: broker.reference(),
                changes: FieldChanges::new().set("regulation_tier", decision.tier.as_str()),
                reason: decision.basis.label(),
            });
        }

        let outcome = self.write_changes(&mut report, dry_run).await;
        self.finish(report.finish(Some(outcome))).await
    }

    /// Collapses whitespace and strips trailing review/logo markers from display names.
    pub async fn run_name_job(&self, dry_run: bool) -> Result<JobRun> {
        let mut report = RunReport::new(JobSummary::start("clean-names", dry_run));
        let loaded = self.load_for(&mut report).await?;

        for broker in &loaded.brokers {
            let cleaned = clean_display_name(&broker.name);
            if cleaned == broker.name {
                continue;
            }
            report.changes.push(PlannedChange {
                broker: broker.reference(),
                changes: FieldChanges::new().set("name", &cleaned),
                reason: format!("`{}` -> `{cleaned}`", broker.name),
            });
        }

        let outcome = self.write_changes(&mut report, dry_run).await;
        self.finish(report.finish(Some(outcome))).await
    }

    /// Validates the raw rows. Never writes.
    pub async fn run_validate_job(&self) -> Result<JobRun> {
        let mut report = RunReport::new(JobSummary::start("validate", true));
        let loaded = self.load_for(&mut report).await?;
        let validation = Validator::new().validate_rows(&loaded.rows);

        report.summary.notes.push(format!(
            "{} rows checked: {} errors, {} warnings",
            validation.checked,
            validation.error_count(),
            validation.warning_count()
        ));
        for violation in validation.violations {
            let kind = match violation.severity {
                Severity::Error => ReviewKind::ValidationError,
                Severity::Warning => ReviewKind::ValidationWarning,
            };
            let subject = format!("{}.{}", violation.broker.slug, violation.field);
            report.flag(kind, subject, violation.message).broker = Some(violation.broker);
        }
        self.finish(report.finish(None)).await
    }

    /// Reports near-duplicate broker pairs. Never merges.
    pub async fn run_dedup_job(&self) -> Result<JobRun> {
        let mut report = RunReport::new(JobSummary::start("detect-duplicates", true));
        let loaded = self.load_for(&mut report).await?;
        let duplicates = DedupEngine::default().detect(&loaded.brokers);

        for cluster in &duplicates.clusters {
            let members = cluster
                .members
                .iter()
                .map(|m| m.slug.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            let item = report.flag(
                ReviewKind::NearDuplicate,
                cluster.cluster_id.clone(),
                format!("likely the same broker: {members}"),
            );
            item.score = Some(cluster.confidence_score);
            item.broker = cluster.members.first().cloned();
        }
        for pair in &duplicates.review_items {
            let item = report.flag(
                ReviewKind::NearDuplicate,
                format!("{} / {}", pair.broker_a.slug, pair.broker_b.slug),
                format!("possibly the same broker: {} and {}", pair.broker_a, pair.broker_b),
            );
            item.score = Some(pair.confidence_score);
            item.broker = Some(pair.broker_a.clone());
        }
        self.finish(report.finish(None)).await
    }

    /// Deletes rows whose names match the junk patterns. Only reports unless `execute` is set.
    pub async fn run_purge_job(&self, execute: bool) -> Result<JobRun> {
        let mut report = RunReport::new(JobSummary::start("purge-junk", !execute));
        let loaded = self.load_for(&mut report).await?;

        let mut ids = Vec::new();
        for row in &loaded.rows {
            let name = row.get("name").and_then(|v| v.as_str()).unwrap_or_default();
            if !self.tables.is_junk_name(name) {
                continue;
            }
            let broker = BrokerRef::from_row(row);
            let Some(id) = broker.id.clone() else {
                report.flag_broker(ReviewKind::UndecodableRow, broker, "junk row has no id");
                continue;
            };
            ids.push(id);
            report.changes.push(PlannedChange {
                broker,
                changes: FieldChanges::new(),
                reason: format!("delete: name `{name}` matches a junk pattern"),
            });
        }

        let outcome = BatchUpdater::new(self.store.as_ref(), self.config.updater_config(!execute))
            .delete_in_chunks(ids)
            .await;
        self.finish(report.finish(Some(outcome))).await
    }

    /// Upserts a seed bundle keyed on slug. Any validation error blocks the
    /// whole import unless `force` is set.
    pub async fn run_seed_job(&self, bundle_path: &Path, force: bool, dry_run: bool) -> Result<JobRun> {
        let mut report = RunReport::new(JobSummary::start("seed", dry_run));
        let bundle = load_seed_bundle(bundle_path)?;
        let rows = prepare_seed_rows(&bundle);
        report.summary.loaded = rows.len();
        report
            .summary
            .notes
            .push(format!("bundle `{}` with {} brokers", bundle.bundle_id, rows.len()));

        let validation = Validator::new().validate_rows(&rows);
        for violation in validation.errors() {
            report
                .flag(
                    ReviewKind::ValidationError,
                    format!("{}.{}", violation.broker.slug, violation.field),
                    violation.message.clone(),
                )
                .broker = Some(violation.broker.clone());
        }

        if !validation.is_valid() && !force {
            report.flag(
                ReviewKind::Blocked,
                bundle.bundle_id.clone(),
                format!(
                    "{} validation errors; rerun with --force to import anyway",
                    validation.error_count()
                ),
            );
            report.summary.skipped = rows.len();
            return self.finish(report.finish(None)).await;
        }

        for row in &rows {
            let mut changes = FieldChanges::new();
            if let Some(map) = row.as_object() {
                for (column, value) in map {
                    changes.insert(column.clone(), value.clone());
                }
            }
            report.changes.push(PlannedChange {
                broker: BrokerRef::from_row(row),
                changes,
                reason: format!("seed bundle `{}`", bundle.bundle_id),
            });
        }

        let outcome = BatchUpdater::new(self.store.as_ref(), self.config.updater_config(dry_run))
            .upsert_rows(rows)
            .await;
        self.finish(report.finish(Some(outcome))).await
    }
}
