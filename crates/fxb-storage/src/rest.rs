//! PostgREST-style HTTP client for the hosted broker table.

use std::time::Duration;

use async_trait::async_trait;
use fxb_core::{BrokerId, FieldChanges};
use reqwest::{Method, RequestBuilder};
use serde_json::Value as JsonValue;
use tracing::{debug, info_span, Instrument};

use crate::{ensure_column, BrokerStore, Filter, SelectQuery, StoreError};

#[derive(Debug, Clone)]
pub struct RestClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub table: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl RestClientConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            table: "brokers".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    table: String,
}

impl RestStore {
    pub fn new(config: RestClientConfig) -> Result<Self, StoreError> {
        ensure_column(&config.table)?;
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
            table: config.table,
        })
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, self.table)
    }

    fn request(&self, method: Method, prefer: Option<&str>) -> RequestBuilder {
        let builder = self
            .client
            .request(method, self.table_url())
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key);
        match prefer {
            Some(prefer) => builder.header("Prefer", prefer),
            None => builder,
        }
    }

    async fn send_json(&self, request: RequestBuilder) -> Result<JsonValue, StoreError> {
        let resp = request.send().await?;
        let status = resp.status();
        let url = resp.url().to_string();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(StoreError::HttpStatus {
                status: status.as_u16(),
                url,
                body,
            });
        }
        debug!(status = status.as_u16(), bytes = body.len(), "store response");
        if body.trim().is_empty() {
            return Ok(JsonValue::Array(Vec::new()));
        }
        Ok(serde_json::from_str(&body)?)
    }
}

fn rows_of(value: JsonValue) -> Vec<JsonValue> {
    match value {
        JsonValue::Array(rows) => rows,
        JsonValue::Null => Vec::new(),
        other => vec![other],
    }
}

fn scalar_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn quoted_list_item(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
        other => other.to_string(),
    }
}

/// Translates a query into PostgREST URL parameters.
pub fn query_params(query: &SelectQuery) -> Vec<(String, String)> {
    let mut params = vec![("select".to_string(), "*".to_string())];
    for filter in &query.filters {
        match filter {
            Filter::Eq(column, JsonValue::Null) => {
                params.push((column.clone(), "is.null".to_string()));
            }
            Filter::Eq(column, value) => {
                params.push((column.clone(), format!("eq.{}", scalar_text(value))));
            }
            Filter::ILike(column, pattern) => {
                params.push((column.clone(), format!("ilike.{}", pattern.replace('%', "*"))));
            }
            Filter::Range { column, gte, lte } => {
                if let Some(v) = gte {
                    params.push((column.clone(), format!("gte.{}", scalar_text(v))));
                }
                if let Some(v) = lte {
                    params.push((column.clone(), format!("lte.{}", scalar_text(v))));
                }
            }
            Filter::In(column, values) => {
                let items = values.iter().map(quoted_list_item).collect::<Vec<_>>();
                params.push((column.clone(), format!("in.({})", items.join(","))));
            }
        }
    }
    if let Some(order) = &query.order {
        let dir = if order.ascending { "asc" } else { "desc" };
        params.push(("order".to_string(), format!("{}.{dir}", order.column)));
    }
    if let Some(limit) = query.limit {
        params.push(("limit".to_string(), limit.to_string()));
    }
    params
}

fn id_param(id: &BrokerId) -> String {
    format!("eq.{id}")
}

#[async_trait]
impl BrokerStore for RestStore {
    fn table(&self) -> &str {
        &self.table
    }

    async fn select(&self, query: &SelectQuery) -> Result<Vec<JsonValue>, StoreError> {
        query.validate()?;
        let span = info_span!("store_select", table = %self.table, filters = query.filters.len());
        async {
            let request = self
                .request(Method::GET, None)
                .query(&query_params(query));
            Ok::<_, StoreError>(rows_of(self.send_json(request).await?))
        }
        .instrument(span)
        .await
    }

    async fn insert(&self, rows: &[JsonValue]) -> Result<Vec<JsonValue>, StoreError> {
        let span = info_span!("store_insert", table = %self.table, rows = rows.len());
        async {
            let request = self
                .request(Method::POST, Some("return=representation"))
                .json(rows);
            Ok::<_, StoreError>(rows_of(self.send_json(request).await?))
        }
        .instrument(span)
        .await
    }

    async fn update_by_id(
        &self,
        id: &BrokerId,
        changes: &FieldChanges,
    ) -> Result<JsonValue, StoreError> {
        for column in changes.columns() {
            ensure_column(column)?;
        }
        let span = info_span!("store_update", table = %self.table, %id, columns = changes.len());
        async {
            let request = self
                .request(Method::PATCH, Some("return=representation"))
                .query(&[("id", id_param(id))])
                .json(changes.as_map());
            rows_of(self.send_json(request).await?)
                .into_iter()
                .next()
                .ok_or_else(|| StoreError::NotFound {
                    key: format!("id={id}"),
                })
        }
        .instrument(span)
        .await
    }

    async fn upsert_by_slug(&self, row: &JsonValue) -> Result<JsonValue, StoreError> {
        let slug = row
            .get("slug")
            .and_then(|v| v.as_str())
            .ok_or_else(|| StoreError::Message("upsert row has no slug".to_string()))?
            .to_string();
        let span = info_span!("store_upsert", table = %self.table, %slug);
        async {
            let request = self
                .request(
                    Method::POST,
                    Some("resolution=merge-duplicates,return=representation"),
                )
                .query(&[("on_conflict", "slug")])
                .json(&[row]);
            rows_of(self.send_json(request).await?)
                .into_iter()
                .next()
                .ok_or(StoreError::NotFound {
                    key: format!("slug={slug}"),
                })
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
            let values = ids
                .iter()
                .map(|id| serde_json::to_value(id).unwrap_or(JsonValue::Null))
                .collect::<Vec<_>>();
            let params = query_params(&SelectQuery::all().in_set("id", values));
            let filter = params
                .into_iter()
                .filter(|(k, _)| k == "id")
                .collect::<Vec<_>>();
            let request = self
                .request(Method::DELETE, Some("return=representation"))
                .query(&filter);
            Ok::<_, StoreError>(rows_of(self.send_json(request).await?).len())
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_params_follow_postgrest_operators() {
        let query = SelectQuery::all()
            .eq("is_active", true)
            .ilike("name", "%markets%")
            .range("trust_score", Some(json!(50)), Some(json!(100)))
            .in_set("slug", vec![json!("ig-markets"), json!("oanda")])
            .order_by("name", true)
            .limit(25);

        let params = query_params(&query);
        let expect = |k: &str, v: &str| (k.to_string(), v.to_string());
        assert_eq!(
            params,
            vec![
                expect("select", "*"),
                expect("is_active", "eq.true"),
                expect("name", "ilike.*markets*"),
                expect("trust_score", "gte.50"),
                expect("trust_score", "lte.100"),
                expect("slug", "in.(\"ig-markets\",\"oanda\")"),
                expect("order", "name.asc"),
                expect("limit", "25"),
            ]
        );
    }

    #[test]
    fn null_equality_uses_is_operator() {
        let params = query_params(&SelectQuery::all().eq("logo_url", JsonValue::Null));
        assert_eq!(params[1], ("logo_url".to_string(), "is.null".to_string()));
    }

    #[test]
    fn store_url_trims_trailing_slash() {
        let store = RestStore::new(RestClientConfig::new("https://db.example.com/", "key")).unwrap();
        assert_eq!(store.table_url(), "https://db.example.com/rest/v1/brokers");
    }
}
