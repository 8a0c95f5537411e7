//! Broker normalization pipeline: matching, tier inference, validation and batch writes.

use std::path::PathBuf;
use std::time::Duration;

use fxb_storage::BackoffPolicy;

mod classify;
mod dedup;
mod jobs;
mod matcher;
mod report;
mod rules;
mod update;
mod validate;

pub use classify::{Classification, ClassificationBasis, TierClassifier};
pub use dedup::{DedupConfig, DedupEngine, DuplicateCluster, DuplicateReport, DuplicateReviewItem};
pub use jobs::{JobRun, LoadedBrokers, Pipeline};
pub use matcher::{
    readable_slug, score_broker, score_strings, AcceptedMatch, DuplicateMatch, FuzzyMatcher, MatchBatch,
    MatchConfig, UnmatchedItem, DEFAULT_MATCH_THRESHOLD,
};
pub use report::{
    render_summary_markdown, report_recent_markdown, write_run_report, JobSummary, ParquetManifest,
    ParquetManifestFile, PlannedChange, ReviewItem, ReviewKind, RunReport, WrittenReport,
};
pub use rules::{BrokerTierRule, LookupTables, Regulator};
pub use update::{
    BatchOutcome, BatchUpdater, UpdateFailure, UpdateTask, UpdaterConfig, DEFAULT_DELETE_CHUNK_SIZE,
};
pub use validate::{Severity, ValidationReport, Validator, Violation};

pub const CRATE_NAME: &str = "fxb-sync";

/// Everything a job needs to reach the store and shape its writes, built once per process.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub store_url: Option<String>,
    pub store_key: Option<String>,
    pub database_url: Option<String>,
    pub brokers_table: String,
    pub logo_bucket: String,
    pub match_threshold: f64,
    pub request_delay: Duration,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub max_retries: usize,
    pub delete_chunk_size: usize,
    pub workspace_root: PathBuf,
    pub artifacts_dir: PathBuf,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let workspace_root = var("FXB_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            store_url: var("FXB_STORE_URL"),
            store_key: var("FXB_STORE_KEY"),
            database_url: var("DATABASE_URL"),
            brokers_table: var("FXB_BROKERS_TABLE").unwrap_or_else(|| "brokers".to_string()),
            logo_bucket: var("FXB_LOGO_BUCKET").unwrap_or_else(|| "broker-logos".to_string()),
            match_threshold: var("FXB_MATCH_THRESHOLD")
                .and_then(|v| v.parse().ok())
                .filter(|t: &f64| (0.0..=1.0).contains(t))
                .unwrap_or(DEFAULT_MATCH_THRESHOLD),
            request_delay: Duration::from_millis(
                var("FXB_REQUEST_DELAY_MS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
            ),
            http_timeout_secs: var("FXB_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: var("FXB_USER_AGENT").unwrap_or_else(|| "fxb-pipeline/0.1".to_string()),
            max_retries: var("FXB_MAX_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            delete_chunk_size: var("FXB_DELETE_CHUNK_SIZE")
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(DEFAULT_DELETE_CHUNK_SIZE),
            artifacts_dir: var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace_root.join("artifacts")),
            workspace_root,
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            ..BackoffPolicy::default()
        }
    }

    pub fn match_config(&self) -> MatchConfig {
        MatchConfig {
            threshold: self.match_threshold,
        }
    }

    pub fn updater_config(&self, dry_run: bool) -> UpdaterConfig {
        UpdaterConfig {
            backoff: self.backoff(),
            request_delay: self.request_delay,
            delete_chunk_size: self.delete_chunk_size,
            dry_run,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(pairs: &[(&str, &str)]) -> PipelineConfig {
        let vars = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        PipelineConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_environment_is_empty() {
        let cfg = config(&[]);
        assert_eq!(cfg.brokers_table, "brokers");
        assert_eq!(cfg.logo_bucket, "broker-logos");
        assert_eq!(cfg.match_threshold, 0.6);
        assert_eq!(cfg.request_delay, Duration::ZERO);
        assert_eq!(cfg.http_timeout_secs, 20);
        assert_eq!(cfg.delete_chunk_size, 50);
        assert_eq!(cfg.workspace_root, PathBuf::from("."));
        assert_eq!(cfg.artifacts_dir, PathBuf::from("./artifacts"));
        assert!(cfg.store_url.is_none());
        assert!(cfg.database_url.is_none());
    }

    #[test]
    fn overrides_are_parsed_and_bad_values_ignored() {
        let cfg = config(&[
            ("FXB_STORE_URL", "https://db.example.com"),
            ("FXB_MATCH_THRESHOLD", "0.75"),
            ("FXB_REQUEST_DELAY_MS", "200"),
            ("FXB_DELETE_CHUNK_SIZE", "0"),
            ("FXB_MAX_RETRIES", "5"),
            ("DATABASE_URL", "  "),
        ]);
        assert_eq!(cfg.store_url.as_deref(), Some("https://db.example.com"));
        assert_eq!(cfg.match_config().threshold, 0.75);
        assert_eq!(cfg.updater_config(true).request_delay, Duration::from_millis(200));
        assert!(cfg.updater_config(true).dry_run);
        assert_eq!(cfg.delete_chunk_size, 50);
        assert_eq!(cfg.backoff().max_retries, 5);
        assert!(cfg.database_url.is_none());

        assert_eq!(config(&[("FXB_MATCH_THRESHOLD", "7")]).match_threshold, 0.6);
    }
}
