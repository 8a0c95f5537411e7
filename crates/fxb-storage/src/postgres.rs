//! Direct Postgres access to the broker table via `sqlx`.
//!
//! Rows are read back as `to_jsonb(t)` so this backend hands out exactly the
//! same JSON shape as the REST client. Writes go through
//! `jsonb_populate_record`, which casts each JSON value to the column type.

use async_trait::async_trait;
use fxb_core::{BrokerId, FieldChanges};
use serde_json::{Map as JsonMap, Value as JsonValue};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{info, info_span, Instrument};

use crate::{ensure_column, BrokerStore, Filter, SelectQuery, StoreError};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    table: String,
}

impl PgStore {
    pub async fn connect(database_url: &str, table: &str) -> Result<Self, StoreError> {
        ensure_column(table)?;
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self {
            pool,
            table: table.to_string(),
        })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Message(format!("running migrations: {e}")))?;
        info!(table = %self.table, "migrations applied");
        Ok(())
    }
}

fn object_columns(row: &JsonValue) -> Result<Vec<String>, StoreError> {
    let Some(map) = row.as_object() else {
        return Err(StoreError::Message("rows must be JSON objects".to_string()));
    };
    map.keys()
        .map(|k| ensure_column(k).map(|_| k.clone()))
        .collect()
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &Filter) {
    match filter {
        Filter::Eq(column, JsonValue::Null) => {
            qb.push(format!("t.{column} IS NULL"));
        }
        Filter::Eq(column, value) => {
            qb.push(format!("to_jsonb(t.{column}) = "));
            qb.push_bind(Json(value.clone()));
        }
        Filter::ILike(column, pattern) => {
            qb.push(format!("t.{column}::text ILIKE "));
            qb.push_bind(pattern.replace('*', "%"));
        }
        Filter::Range { column, gte, lte } => {
            qb.push(format!("t.{column} IS NOT NULL"));
            if let Some(v) = gte {
                qb.push(format!(" AND to_jsonb(t.{column}) >= "));
                qb.push_bind(Json(v.clone()));
            }
            if let Some(v) = lte {
                qb.push(format!(" AND to_jsonb(t.{column}) <= "));
                qb.push_bind(Json(v.clone()));
            }
        }
        Filter::In(column, values) => {
            qb.push_bind(Json(JsonValue::Array(values.clone())));
            qb.push(format!(" @> jsonb_build_array(to_jsonb(t.{column}))"));
        }
    }
}

/// Builds the SELECT statement; separated out so the SQL can be asserted on.
pub(crate) fn build_select<'a>(table: &str, query: &'a SelectQuery) -> QueryBuilder<'a, Postgres> {
    let mut qb = QueryBuilder::new(format!("SELECT to_jsonb(t) AS row FROM {table} AS t"));
    for (idx, filter) in query.filters.iter().enumerate() {
        qb.push(if idx == 0 { " WHERE " } else { " AND " });
        push_filter(&mut qb, filter);
    }
    if let Some(order) = &query.order {
        let dir = if order.ascending { "ASC" } else { "DESC" };
        qb.push(format!(" ORDER BY t.{} {dir} NULLS LAST", order.column));
    }
    if let Some(limit) = query.limit {
        qb.push(" LIMIT ");
        qb.push_bind(limit as i64);
    }
    qb
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<JsonValue, StoreError> {
    let Json(value): Json<JsonValue> = row.try_get("row")?;
    Ok(value)
}

#[async_trait]
impl BrokerStore for PgStore {
    fn table(&self) -> &str {
        &self.table
    }

    async fn select(&self, query: &SelectQuery) -> Result<Vec<JsonValue>, StoreError> {
        query.validate()?;
        let span = info_span!("store_select", table = %self.table, filters = query.filters.len());
        async {
            let rows = build_select(&self.table, query)
                .build()
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(decode_row).collect::<Result<Vec<_>, StoreError>>()
        }
        .instrument(span)
        .await
    }

    async fn insert(&self, rows: &[JsonValue]) -> Result<Vec<JsonValue>, StoreError> {
        let span = info_span!("store_insert", table = %self.table, rows = rows.len());
        async {
            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                let columns = object_columns(row)?.join(", ");
                let sql = format!(
                    "INSERT INTO {table} AS t ({columns}) \
                     SELECT {columns} FROM jsonb_populate_record(NULL::{table}, $1) \
                     RETURNING to_jsonb(t) AS row",
                    table = self.table
                );
                let inserted = sqlx::query(&sql)
                    .bind(Json(row.clone()))
                    .fetch_one(&self.pool)
                    .await?;
                out.push(decode_row(&inserted)?);
            }
            Ok::<_, StoreError>(out)
        }
        .instrument(span)
        .await
    }

    async fn update_by_id(
        &self,
        id: &BrokerId,
        changes: &FieldChanges,
    ) -> Result<JsonValue, StoreError> {
        let assignments = changes
            .columns()
            .filter(|c| *c != "id")
            .map(|c| ensure_column(c).map(|_| format!("{c} = r.{c}")))
            .collect::<Result<Vec<_>, _>>()?;
        if assignments.is_empty() {
            return Err(StoreError::Message("update has no columns".to_string()));
        }
        let span = info_span!("store_update", table = %self.table, %id, columns = assignments.len());
        async {
            let sql = format!(
                "UPDATE {table} AS t SET {set} \
                 FROM jsonb_populate_record(NULL::{table}, $1) AS r \
                 WHERE t.id::text = $2 \
                 RETURNING to_jsonb(t) AS row",
                table = self.table,
                set = assignments.join(", ")
            );
            let updated = sqlx::query(&sql)
                .bind(Json(JsonValue::Object(changes.as_map().clone())))
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
            match updated {
                Some(row) => decode_row(&row),
                None => Err(StoreError::NotFound {
                    key: format!("id={id}"),
                }),
            }
        }
        .instrument(span)
        .await
    }

    async fn upsert_by_slug(&self, row: &JsonValue) -> Result<JsonValue, StoreError> {
        let mut fields: JsonMap<String, JsonValue> = row
            .as_object()
            .cloned()
            .ok_or_else(|| StoreError::Message("rows must be JSON objects".to_string()))?;
        if !fields.get("slug").map(JsonValue::is_string).unwrap_or(false) {
            return Err(StoreError::Message("upsert row has no slug".to_string()));
        }
        fields.remove("id");
        let columns = object_columns(&JsonValue::Object(fields.clone()))?;
        let updates = columns
            .iter()
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let column_list = columns.join(", ");
        let span = info_span!("store_upsert", table = %self.table);
        async {
            let sql = format!(
                "INSERT INTO {table} AS t ({column_list}) \
                 SELECT {column_list} FROM jsonb_populate_record(NULL::{table}, $1) \
                 ON CONFLICT (slug) DO UPDATE SET {updates} \
                 RETURNING to_jsonb(t) AS row",
                table = self.table
            );
            let upserted = sqlx::query(&sql)
                .bind(Json(JsonValue::Object(fields)))
                .fetch_one(&self.pool)
                .await?;
            decode_row(&upserted)
        }
        .instrument(span)
        .await
    }

    async fn delete_by_ids(&self, ids: &[BrokerId]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let span = info_span!("store_delete", table = %self.table, ids = ids.len());
        async {
            let sql = format!("DELETE FROM {} AS t WHERE t.id::text = ANY($1)", self.table);
            let keys = ids.iter().map(ToString::to_string).collect::<Vec<_>>();
            let result = sqlx::query(&sql).bind(keys).execute(&self.pool).await?;
            Ok::<_, StoreError>(result.rows_affected() as usize)
        }
        .instrument(span)
        .await
    }
}
