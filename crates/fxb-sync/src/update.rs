//! Sequential write queue: one round-trip per broker, retried on transient failures.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use fxb_core::{BrokerId, FieldChanges};
use fxb_storage::{BackoffPolicy, BrokerStore, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

pub const DEFAULT_DELETE_CHUNK_SIZE: usize = 50;

/// One broker's pending change. The write addresses `broker_id`; `slug` labels it in logs and failures.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateTask {
    pub slug: String,
    pub broker_id: BrokerId,
    pub changes: FieldChanges,
    #[serde(skip)]
    attempts: usize,
}

impl UpdateTask {
    pub fn new(slug: impl Into<String>, broker_id: BrokerId, changes: FieldChanges) -> Self {
        Self {
            slug: slug.into(),
            broker_id,
            changes,
            attempts: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateFailure {
    pub key: String,
    pub error: String,
    pub attempts: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub retried: usize,
    pub failures: Vec<UpdateFailure>,
}

#[derive(Debug, Clone, Copy)]
pub struct UpdaterConfig {
    pub backoff: BackoffPolicy,
    pub request_delay: Duration,
    pub delete_chunk_size: usize,
    pub dry_run: bool,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            request_delay: Duration::ZERO,
            delete_chunk_size: DEFAULT_DELETE_CHUNK_SIZE,
            dry_run: false,
        }
    }
}

enum Attempt {
    Done,
    Requeue,
    Failed(UpdateFailure),
}

pub struct BatchUpdater<'a> {
    store: &'a dyn BrokerStore,
    config: UpdaterConfig,
}

impl<'a> BatchUpdater<'a> {
    pub fn new(store: &'a dyn BrokerStore, config: UpdaterConfig) -> Self {
        Self { store, config }
    }

    /// Tasks for the same broker id are merged (later columns win) so each row gets one write.
    /// Rows that share a slug stay separate tasks.
    pub fn coalesce(tasks: Vec<UpdateTask>) -> Vec<UpdateTask> {
        let mut merged: Vec<UpdateTask> = Vec::with_capacity(tasks.len());
        let mut by_id: HashMap<BrokerId, usize> = HashMap::new();
        for task in tasks {
            match by_id.get(&task.broker_id) {
                Some(&index) => {
                    for (column, value) in task.changes.as_map() {
                        merged[index].changes.insert(column.clone(), value.clone());
                    }
                }
                None => {
                    by_id.insert(task.broker_id.clone(), merged.len());
                    merged.push(task);
                }
            }
        }
        merged
    }

    fn judge(&self, key: &str, attempts: usize, err: StoreError) -> Attempt {
        if err.is_retryable() && attempts <= self.config.backoff.max_retries {
            warn!(key, attempts, error = %err, "transient store failure; requeueing");
            Attempt::Requeue
        } else {
            warn!(key, attempts, error = %err, "store write failed");
            Attempt::Failed(UpdateFailure {
                key: key.to_string(),
                error: err.to_string(),
                attempts,
            })
        }
    }

    async fn pause(&self) {
        if !self.config.request_delay.is_zero() {
            tokio::time::sleep(self.config.request_delay).await;
        }
    }

    /// Applies each task as its own update. A failure never stops later tasks.
    pub async fn apply(&self, tasks: Vec<UpdateTask>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let mut queue = VecDeque::new();
        for task in Self::coalesce(tasks) {
            if task.changes.is_empty() {
                outcome.skipped += 1;
            } else {
                queue.push_back(task);
            }
        }

        while let Some(mut task) = queue.pop_front() {
            if self.config.dry_run {
                info!(slug = %task.slug, columns = task.changes.len(), "dry run; update not sent");
                outcome.skipped += 1;
                continue;
            }
            if task.attempts > 0 {
                tokio::time::sleep(self.config.backoff.delay_for_attempt(task.attempts - 1)).await;
            }
            task.attempts += 1;

            let result = self.store.update_by_id(&task.broker_id, &task.changes).await;
            let attempt = match result {
                Ok(_) => Attempt::Done,
                Err(err) => self.judge(&task.slug, task.attempts, err),
            };
            match attempt {
                Attempt::Done => outcome.updated += 1,
                Attempt::Requeue => {
                    outcome.retried += 1;
                    queue.push_back(task);
                }
                Attempt::Failed(failure) => {
                    outcome.failed += 1;
                    outcome.failures.push(failure);
                }
            }
            self.pause().await;
        }

        info!(
            updated = outcome.updated,
            skipped = outcome.skipped,
            failed = outcome.failed,
            retried = outcome.retried,
            "update batch finished"
        );
        outcome
    }

    /// Upserts rows keyed on `slug`; reruns with the same rows converge.
    pub async fn upsert_rows(&self, rows: Vec<JsonValue>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let mut queue = rows
            .into_iter()
            .map(|row| {
                let key = row
                    .get("slug")
                    .and_then(|v| v.as_str())
                    .unwrap_or("<no slug>")
                    .to_string();
                (key, row, 0usize)
            })
            .collect::<VecDeque<_>>();

        while let Some((key, row, mut attempts)) = queue.pop_front() {
            if self.config.dry_run {
                info!(slug = %key, "dry run; upsert not sent");
                outcome.skipped += 1;
                continue;
            }
            if attempts > 0 {
                tokio::time::sleep(self.config.backoff.delay_for_attempt(attempts - 1)).await;
            }
            attempts += 1;

            match self.store.upsert_by_slug(&row).await {
                Ok(_) => outcome.updated += 1,
                Err(err) => match self.judge(&key, attempts, err) {
                    Attempt::Requeue => {
                        outcome.retried += 1;
                        queue.push_back((key, row, attempts));
                    }
                    Attempt::Failed(failure) => {
                        outcome.failed += 1;
                        outcome.failures.push(failure);
                    }
                    Attempt::Done => outcome.updated += 1,
                },
            }
            self.pause().await;
        }
        outcome
    }

    /// Deletes in fixed-size chunks; a failed chunk is counted and the rest continue.
    pub async fn delete_in_chunks(&self, ids: Vec<BrokerId>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let chunk_size = self.config.delete_chunk_size.max(1);
        for chunk in ids.chunks(chunk_size) {
            if self.config.dry_run {
                info!(ids = chunk.len(), "dry run; delete not sent");
                outcome.skipped += chunk.len();
                continue;
            }
            let key = format!(
                "delete {}..{}",
                chunk.first().map(ToString::to_string).unwrap_or_default(),
                chunk.last().map(ToString::to_string).unwrap_or_default()
            );
            let mut attempts = 0usize;
            loop {
                if attempts > 0 {
                    tokio::time::sleep(self.config.backoff.delay_for_attempt(attempts - 1)).await;
                }
                attempts += 1;
                match self.store.delete_by_ids(chunk).await {
                    Ok(deleted) => {
                        outcome.updated += deleted;
                        outcome.skipped += chunk.len().saturating_sub(deleted);
                        break;
                    }
                    Err(err) => match self.judge(&key, attempts, err) {
                        Attempt::Requeue => outcome.retried += 1,
                        Attempt::Failed(failure) => {
                            outcome.failed += chunk.len();
                            outcome.failures.push(failure);
                            break;
                        }
                        Attempt::Done => break,
                    },
                }
            }
            self.pause().await;
        }
        outcome
    }
}
