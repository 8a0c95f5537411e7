//! Remote data store collaborators: broker table clients, logo object storage, retry policy.

use std::time::Duration;

use async_trait::async_trait;
use fxb_core::{BrokerId, FieldChanges};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;

mod memory;
mod objects;
mod postgres;
mod rest;

pub use memory::MemoryStore;
pub use objects::{content_hash, logo_object_key, LocalObjectStore, ObjectStore, RestObjectStore, StoredObject};
pub use postgres::PgStore;
pub use rest::{RestClientConfig, RestStore};

pub const CRATE_NAME: &str = "fxb-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decoding store response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no row with {key}")]
    NotFound { key: String },
    #[error("invalid column name `{0}`")]
    InvalidColumn(String),
    #[error("{0}")]
    Message(String),
}

impl StoreError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            StoreError::Request(err) => classify_reqwest_error(err),
            StoreError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            StoreError::Database(err) => classify_sqlx_error(err),
            _ => RetryDisposition::NonRetryable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.disposition() == RetryDisposition::Retryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            RetryDisposition::Retryable
        }
        _ => RetryDisposition::NonRetryable,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Row predicate understood by every store backend.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, JsonValue),
    /// Case-insensitive pattern; `*` and `%` both mean "any run of characters".
    ILike(String, String),
    Range {
        column: String,
        gte: Option<JsonValue>,
        lte: Option<JsonValue>,
    },
    In(String, Vec<JsonValue>),
}

impl Filter {
    pub fn column(&self) -> &str {
        match self {
            Filter::Eq(c, _) | Filter::ILike(c, _) | Filter::In(c, _) => c,
            Filter::Range { column, .. } => column,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectQuery {
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl SelectQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl Into<JsonValue>) -> Self {
        self.filters.push(Filter::Eq(column.to_string(), value.into()));
        self
    }

    pub fn ilike(mut self, column: &str, pattern: &str) -> Self {
        self.filters
            .push(Filter::ILike(column.to_string(), pattern.to_string()));
        self
    }

    pub fn range(
        mut self,
        column: &str,
        gte: Option<JsonValue>,
        lte: Option<JsonValue>,
    ) -> Self {
        self.filters.push(Filter::Range {
            column: column.to_string(),
            gte,
            lte,
        });
        self
    }

    pub fn in_set(mut self, column: &str, values: Vec<JsonValue>) -> Self {
        self.filters.push(Filter::In(column.to_string(), values));
        self
    }

    pub fn order_by(mut self, column: &str, ascending: bool) -> Self {
        self.order = Some(Order {
            column: column.to_string(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Every column referenced by the query must be a plain identifier.
    pub fn validate(&self) -> Result<(), StoreError> {
        for filter in &self.filters {
            ensure_column(filter.column())?;
        }
        if let Some(order) = &self.order {
            ensure_column(&order.column)?;
        }
        Ok(())
    }
}

pub fn ensure_column(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_lowercase() || first == '_' => {
            chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidColumn(name.to_string()))
    }
}

/// Table-oriented client for the broker table.
///
/// Rows travel as JSON objects so callers can observe what the store actually
/// holds, including mistyped values.
#[async_trait]
pub trait BrokerStore: Send + Sync {
    fn table(&self) -> &str;

    async fn select(&self, query: &SelectQuery) -> Result<Vec<JsonValue>, StoreError>;

    async fn insert(&self, rows: &[JsonValue]) -> Result<Vec<JsonValue>, StoreError>;

    async fn update_by_id(
        &self,
        id: &BrokerId,
        changes: &FieldChanges,
    ) -> Result<JsonValue, StoreError>;

    /// Insert or merge keyed on `slug`; reruns with the same row are no-ops.
    async fn upsert_by_slug(&self, row: &JsonValue) -> Result<JsonValue, StoreError>;

    async fn delete_by_ids(&self, ids: &[BrokerId]) -> Result<usize, StoreError>;
}
