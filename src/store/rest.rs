//! Hosted document-query backend speaking the PostgREST dialect (Supabase).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::filter::{Condition, Filter, Predicate, Query};
use super::schema::Table;
use super::{now_timestamp, Row, Store, StoreError};

/// Most rows `sum` will pull to reduce client-side. PostgREST has no
/// aggregate endpoint unless explicitly enabled on the server.
pub const CLIENT_AGGREGATE_LIMIT: usize = 10_000;

const STOCK_UPDATE_ATTEMPTS: usize = 5;
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Deserialize)]
struct PostgrestError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RestStore {
    client: Client,
    base_url: String,
    api_key: String,
}

impl RestStore {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: format!("{}/rest/v1", base_url.trim_end_matches('/')),
            api_key: api_key.to_owned(),
        })
    }

    fn url(&self, table: Table) -> String {
        format!("{}/{}", self.base_url, table.name())
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn rows(response: Response) -> Result<Vec<Row>, StoreError> {
        let response = Self::check(response).await?;
        Ok(response.json::<Vec<Row>>().await?)
    }

    async fn check(response: Response) -> Result<Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let parsed: Option<PostgrestError> = serde_json::from_str(&body).ok();
        let code = parsed.as_ref().and_then(|e| e.code.as_deref());
        if code == Some(UNIQUE_VIOLATION) || (code.is_none() && status == StatusCode::CONFLICT) {
            return Err(StoreError::Duplicate);
        }
        let message = parsed.and_then(|e| e.message).unwrap_or(body);
        Err(StoreError::Rest {
            status: status.as_u16(),
            message,
        })
    }

    async fn stock_of(&self, product_id: i64) -> Result<Option<i64>, StoreError> {
        let response = self
            .authed(self.client.get(self.url(Table::Products)))
            .query(&[
                ("select", "stock".to_owned()),
                ("id", format!("eq.{product_id}")),
            ])
            .send()
            .await?;
        let rows = Self::rows(response).await?;
        Ok(rows
            .first()
            .and_then(|r| r.get("stock"))
            .and_then(Value::as_i64))
    }
}

/// Renders a literal for use inside `in.(...)` and `or=(...)` lists, where
/// reserved characters must be double-quoted.
fn list_literal(value: &Value) -> String {
    match value {
        Value::String(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
        other => plain_literal(other),
    }
}

fn plain_literal(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_owned(),
        other => other.to_string(),
    }
}

/// `op.operand` for a predicate; `quote` selects list quoting.
fn operator(condition: &Condition, quote: bool) -> String {
    let literal = |v: &Value| {
        if quote {
            list_literal(v)
        } else {
            plain_literal(v)
        }
    };
    match condition {
        Condition::Eq(Value::Null) => "is.null".to_owned(),
        Condition::Eq(v) => format!("eq.{}", literal(v)),
        // `ilike` turns `*` into `%` with no way to escape it, so match a
        // case-insensitive regex of the escaped term instead.
        Condition::Contains(term) => {
            let pattern = Value::String(regex::escape(term));
            format!("imatch.{}", literal(&pattern))
        }
        Condition::Gte(v) => format!("gte.{}", literal(v)),
        Condition::Lte(v) => format!("lte.{}", literal(v)),
        Condition::Gt(v) => format!("gt.{}", literal(v)),
        Condition::Lt(v) => format!("lt.{}", literal(v)),
        Condition::In(values) => format!(
            "in.({})",
            values.iter().map(list_literal).collect::<Vec<_>>().join(",")
        ),
    }
}

fn filter_params(filter: &Filter) -> Vec<(String, String)> {
    let mut params: Vec<(String, String)> = filter
        .all
        .iter()
        .map(|Predicate { field, condition }| (field.clone(), operator(condition, false)))
        .collect();

    if !filter.any.is_empty() {
        let group = filter
            .any
            .iter()
            .map(|p| format!("{}.{}", p.field, operator(&p.condition, true)))
            .collect::<Vec<_>>()
            .join(",");
        params.push(("or".to_owned(), format!("({group})")));
    }
    params
}

fn query_params(query: &Query) -> Vec<(String, String)> {
    let mut params = vec![("select".to_owned(), "*".to_owned())];
    params.extend(filter_params(&query.filter));
    if !query.order.is_empty() {
        let order = query
            .order
            .iter()
            .map(|o| format!("{}.{}", o.column, o.dir.as_str()))
            .collect::<Vec<_>>()
            .join(",");
        params.push(("order".to_owned(), order));
    }
    if let Some(limit) = query.limit {
        params.push(("limit".to_owned(), limit.to_string()));
    }
    if let Some(offset) = query.offset {
        params.push(("offset".to_owned(), offset.to_string()));
    }
    params
}

/// Total from a `Content-Range` header such as `0-24/3573` or `*/0`.
fn total_from_content_range(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

#[async_trait]
impl Store for RestStore {
    fn backend(&self) -> &'static str {
        "supabase"
    }

    async fn select(&self, table: Table, query: &Query) -> Result<Vec<Row>, StoreError> {
        let params = query_params(query);
        debug!(table = %table, ?params, "rest select");
        let response = self
            .authed(self.client.get(self.url(table)))
            .query(&params)
            .send()
            .await?;
        Self::rows(response).await
    }

    async fn count(&self, table: Table, filter: &Filter) -> Result<u64, StoreError> {
        let mut params = vec![("select".to_owned(), "id".to_owned())];
        params.extend(filter_params(filter));
        let response = self
            .authed(self.client.head(self.url(table)))
            .header("Prefer", "count=exact")
            .query(&params)
            .send()
            .await?;
        let response = Self::check(response).await?;
        let range = response
            .headers()
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        total_from_content_range(range).ok_or_else(|| StoreError::Rest {
            status: response.status().as_u16(),
            message: format!("unusable content-range header `{range}`"),
        })
    }

    async fn sum(&self, table: Table, column: &str, filter: &Filter) -> Result<f64, StoreError> {
        let mut params = vec![("select".to_owned(), column.to_owned())];
        params.extend(filter_params(filter));
        params.push(("limit".to_owned(), (CLIENT_AGGREGATE_LIMIT + 1).to_string()));
        let response = self
            .authed(self.client.get(self.url(table)))
            .query(&params)
            .send()
            .await?;
        let rows = Self::rows(response).await?;
        if rows.len() > CLIENT_AGGREGATE_LIMIT {
            warn!(table = %table, column, "client-side sum exceeds row ceiling");
            return Err(StoreError::AggregateTooLarge {
                table,
                limit: CLIENT_AGGREGATE_LIMIT,
            });
        }
        Ok(rows
            .iter()
            .filter_map(|r| r.get(column).and_then(Value::as_f64))
            .sum())
    }

    async fn find_by_pk(&self, table: Table, id: i64) -> Result<Option<Row>, StoreError> {
        let response = self
            .authed(self.client.get(self.url(table)))
            .query(&[
                ("select", "*".to_owned()),
                ("id", format!("eq.{id}")),
                ("limit", "1".to_owned()),
            ])
            .send()
            .await?;
        Ok(Self::rows(response).await?.into_iter().next())
    }

    async fn insert(&self, table: Table, row: Row) -> Result<Row, StoreError> {
        let mut created = self.insert_many(table, vec![row]).await?;
        created.pop().ok_or_else(|| StoreError::Rest {
            status: StatusCode::OK.as_u16(),
            message: "insert returned no representation".to_owned(),
        })
    }

    async fn insert_many(&self, table: Table, rows: Vec<Row>) -> Result<Vec<Row>, StoreError> {
        let response = self
            .authed(self.client.post(self.url(table)))
            .header("Prefer", "return=representation")
            .json(&rows)
            .send()
            .await?;
        Self::rows(response).await
    }

    async fn update(&self, table: Table, id: i64, changes: Row) -> Result<u64, StoreError> {
        let response = self
            .authed(self.client.patch(self.url(table)))
            .header("Prefer", "return=representation")
            .query(&[("id", format!("eq.{id}"))])
            .json(&changes)
            .send()
            .await?;
        Ok(Self::rows(response).await?.len() as u64)
    }

    async fn delete(&self, table: Table, id: i64) -> Result<u64, StoreError> {
        let response = self
            .authed(self.client.delete(self.url(table)))
            .header("Prefer", "return=representation")
            .query(&[("id", format!("eq.{id}"))])
            .send()
            .await?;
        Ok(Self::rows(response).await?.len() as u64)
    }

    /// Optimistic concurrency: the write only lands if the stock still holds
    /// the value it was computed from.
    async fn adjust_stock(&self, product_id: i64, delta: i64) -> Result<bool, StoreError> {
        for attempt in 1..=STOCK_UPDATE_ATTEMPTS {
            let Some(current) = self.stock_of(product_id).await? else {
                return Ok(false);
            };
            let next = current + delta;
            if next < 0 {
                return Ok(false);
            }

            let mut changes = Row::new();
            changes.insert("stock".to_owned(), Value::from(next));
            changes.insert("updatedAt".to_owned(), now_timestamp());
            let response = self
                .authed(self.client.patch(self.url(Table::Products)))
                .header("Prefer", "return=representation")
                .query(&[
                    ("id", format!("eq.{product_id}")),
                    ("stock", format!("eq.{current}")),
                ])
                .json(&changes)
                .send()
                .await?;
            if !Self::rows(response).await?.is_empty() {
                return Ok(true);
            }
            debug!(product_id, attempt, "stock changed concurrently, retrying");
        }
        Err(StoreError::Conflict {
            table: Table::Products,
            id: product_id,
        })
    }

    /// Postgres identity columns ignore explicit ids, and PostgREST cannot
    /// move the sequence without a server-side function.
    fn key_reset_statement(&self, table: Table) -> Option<String> {
        let name = table.name();
        Some(format!(
            "SELECT setval(pg_get_serial_sequence('public.\"{name}\"', 'id'), \
             COALESCE(MAX(\"id\"), 1)) FROM public.\"{name}\";"
        ))
    }
}
