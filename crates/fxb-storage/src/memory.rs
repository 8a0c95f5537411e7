//! In-process broker table with the same filter semantics as the remote backends.

use std::cmp::Ordering;

use async_trait::async_trait;
use fxb_core::{BrokerId, FieldChanges};
use serde_json::{Map as JsonMap, Value as JsonValue};
use tokio::sync::Mutex;

use crate::{BrokerStore, Filter, SelectQuery, StoreError};

#[derive(Debug)]
pub struct MemoryStore {
    table: String,
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: Vec<JsonValue>,
    next_id: i64,
}

impl MemoryState {
    fn assign_id(&mut self, row: &mut JsonMap<String, JsonValue>) {
        match row.get("id") {
            Some(JsonValue::Number(n)) => {
                if let Some(v) = n.as_i64() {
                    self.next_id = self.next_id.max(v + 1);
                }
            }
            Some(JsonValue::String(_)) => {}
            _ => {
                row.insert("id".to_string(), JsonValue::from(self.next_id));
                self.next_id += 1;
            }
        }
    }

    fn push(&mut self, row: JsonValue) -> Result<JsonValue, StoreError> {
        let JsonValue::Object(mut map) = row else {
            return Err(StoreError::Message("rows must be JSON objects".to_string()));
        };
        self.assign_id(&mut map);
        let row = JsonValue::Object(map);
        self.rows.push(row.clone());
        Ok(row)
    }
}

impl MemoryStore {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            state: Mutex::new(MemoryState {
                rows: Vec::new(),
                next_id: 1,
            }),
        }
    }

    /// Seeds the table; rows without an `id` get sequential integer ids.
    pub fn with_rows(rows: Vec<JsonValue>) -> Result<Self, StoreError> {
        let mut state = MemoryState {
            rows: Vec::with_capacity(rows.len()),
            next_id: 1,
        };
        for row in rows {
            state.push(row)?;
        }
        Ok(Self {
            table: "brokers".to_string(),
            state: Mutex::new(state),
        })
    }

    pub async fn snapshot(&self) -> Vec<JsonValue> {
        self.state.lock().await.rows.clone()
    }
}

fn as_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn loose_eq(a: &JsonValue, b: &JsonValue) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        (JsonValue::Number(_), _) | (_, JsonValue::Number(_)) => {
            matches!((as_number(a), as_number(b)), (Some(x), Some(y)) if x == y)
        }
        _ => false,
    }
}

fn compare_values(a: &JsonValue, b: &JsonValue) -> Ordering {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
    }
    match (a, b) {
        (JsonValue::Null, JsonValue::Null) => Ordering::Equal,
        (JsonValue::Null, _) => Ordering::Greater,
        (_, JsonValue::Null) => Ordering::Less,
        (JsonValue::String(x), JsonValue::String(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

/// Case-insensitive wildcard match where `*` and `%` match any run of characters.
pub(crate) fn ilike_match(text: &str, pattern: &str) -> bool {
    let text = text.to_lowercase().chars().collect::<Vec<_>>();
    let pattern = pattern.to_lowercase().chars().collect::<Vec<_>>();
    let (mut t, mut p) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '*' || pattern[p] == '%') {
            star = Some((p, t));
            p += 1;
        } else if p < pattern.len() && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '*' || *c == '%')
}

fn row_matches(row: &JsonValue, filter: &Filter) -> bool {
    let value = row.get(filter.column()).unwrap_or(&JsonValue::Null);
    match filter {
        Filter::Eq(_, expected) => loose_eq(value, expected),
        Filter::ILike(_, pattern) => value
            .as_str()
            .map(|text| ilike_match(text, pattern))
            .unwrap_or(false),
        Filter::Range { gte, lte, .. } => {
            if value.is_null() {
                return false;
            }
            let lower_ok = gte
                .as_ref()
                .map(|bound| compare_values(value, bound) != Ordering::Less)
                .unwrap_or(true);
            let upper_ok = lte
                .as_ref()
                .map(|bound| compare_values(value, bound) != Ordering::Greater)
                .unwrap_or(true);
            lower_ok && upper_ok
        }
        Filter::In(_, values) => values.iter().any(|v| loose_eq(value, v)),
    }
}

fn id_matches(row: &JsonValue, id: &BrokerId) -> bool {
    let Some(value) = row.get("id") else {
        return false;
    };
    match id {
        BrokerId::Int(v) => loose_eq(value, &JsonValue::from(*v)),
        BrokerId::Text(v) => value.as_str() == Some(v.as_str()),
    }
}

fn merge_into(row: &mut JsonValue, changes: &JsonMap<String, JsonValue>) {
    if let JsonValue::Object(map) = row {
        for (key, value) in changes {
            if key != "id" {
                map.insert(key.clone(), value.clone());
            }
        }
    }
}

#[async_trait]
impl BrokerStore for MemoryStore {
    fn table(&self) -> &str {
        &self.table
    }

    async fn select(&self, query: &SelectQuery) -> Result<Vec<JsonValue>, StoreError> {
        query.validate()?;
        let state = self.state.lock().await;
        let mut rows = state
            .rows
            .iter()
            .filter(|row| query.filters.iter().all(|f| row_matches(row, f)))
            .cloned()
            .collect::<Vec<_>>();
        if let Some(order) = &query.order {
            rows.sort_by(|a, b| {
                let a = a.get(&order.column).unwrap_or(&JsonValue::Null);
                let b = b.get(&order.column).unwrap_or(&JsonValue::Null);
                let ord = compare_values(a, b);
                if order.ascending {
                    ord
                } else {
                    ord.reverse()
                }
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn insert(&self, rows: &[JsonValue]) -> Result<Vec<JsonValue>, StoreError> {
        let mut state = self.state.lock().await;
        rows.iter().map(|row| state.push(row.clone())).collect()
    }

    async fn update_by_id(
        &self,
        id: &BrokerId,
        changes: &FieldChanges,
    ) -> Result<JsonValue, StoreError> {
        let mut state = self.state.lock().await;
        let row = state
            .rows
            .iter_mut()
            .find(|row| id_matches(row, id))
            .ok_or_else(|| StoreError::NotFound {
                key: format!("id={id}"),
            })?;
        merge_into(row, changes.as_map());
        Ok(row.clone())
    }

    async fn upsert_by_slug(&self, row: &JsonValue) -> Result<JsonValue, StoreError> {
        let Some(fields) = row.as_object() else {
            return Err(StoreError::Message("rows must be JSON objects".to_string()));
        };
        let slug = fields
            .get("slug")
            .and_then(|v| v.as_str())
            .ok_or_else(|| StoreError::Message("upsert row has no slug".to_string()))?;

        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .rows
            .iter_mut()
            .find(|r| r.get("slug").and_then(|v| v.as_str()) == Some(slug))
        {
            merge_into(existing, fields);
            return Ok(existing.clone());
        }
        state.push(row.clone())
    }

    async fn delete_by_ids(&self, ids: &[BrokerId]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.rows.len();
        state
            .rows
            .retain(|row| !ids.iter().any(|id| id_matches(row, id)));
        Ok(before - state.rows.len())
    }
}
