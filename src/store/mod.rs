//! Persistence adapter.
//!
//! [`Store`] is the narrow contract each backend implements: filtered and
//! ordered selection, counting, aggregation and single-row writes. [`Db`]
//! builds the ORM-level operations (projection, relation embedding,
//! timestamps, bulk insert fallback) once on top of it, so every backend
//! behaves identically for callers.

pub mod filter;
pub mod mongo;
pub mod rest;
pub mod schema;
pub mod sqlite;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

pub use filter::{Condition, Filter, Include, OrderBy, Predicate, Query, SortDir};
pub use schema::{Kind, Relation, Table, ORDER_USER};

pub type Row = serde_json::Map<String, Value>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a record with the same unique value already exists")]
    Duplicate,

    #[error("unknown column `{column}` on table `{table}`")]
    UnknownColumn { table: Table, column: String },

    #[error("value for column `{column}` has the wrong type")]
    TypeMismatch { column: String },

    #[error("row could not be decoded: {0}")]
    Decode(String),

    #[error("aggregating `{table}` needs more than {limit} rows on this backend")]
    AggregateTooLarge { table: Table, limit: usize },

    #[error("row {id} of `{table}` kept changing underneath a conditional update")]
    Conflict { table: Table, id: i64 },

    #[error("sqlite error: {0}")]
    Sqlite(#[source] sqlx::Error),

    #[error("rest backend responded {status}: {message}")]
    Rest { status: u16, message: String },

    #[error("rest transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("mongodb error: {0}")]
    Mongo(#[source] mongodb::error::Error),
}

/// Result of a paginated query: the page of rows plus the number of rows that
/// match the filter regardless of `limit`/`offset`.
#[derive(Debug, Clone)]
pub struct Counted {
    pub rows: Vec<Row>,
    pub count: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BulkOptions {
    pub ignore_duplicates: bool,
}

/// Backend contract. Column names reaching a backend have already been
/// checked against [`Table::columns`] by [`Db`].
#[async_trait]
pub trait Store: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Applies `filter`, `order`, `limit` and `offset` of the query.
    /// Projection and relation embedding are handled by [`Db`].
    async fn select(&self, table: Table, query: &Query) -> Result<Vec<Row>, StoreError>;

    async fn count(&self, table: Table, filter: &Filter) -> Result<u64, StoreError>;

    async fn sum(&self, table: Table, column: &str, filter: &Filter) -> Result<f64, StoreError>;

    async fn find_by_pk(&self, table: Table, id: i64) -> Result<Option<Row>, StoreError>;

    async fn insert(&self, table: Table, row: Row) -> Result<Row, StoreError>;

    /// Inserts all rows or none of them where the backend allows it.
    async fn insert_many(&self, table: Table, rows: Vec<Row>) -> Result<Vec<Row>, StoreError>;

    async fn update(&self, table: Table, id: i64, changes: Row) -> Result<u64, StoreError>;

    async fn delete(&self, table: Table, id: i64) -> Result<u64, StoreError>;

    /// Adds `delta` to a product's stock as one atomic step. A negative delta
    /// only applies when the stock covers it; returns whether it applied.
    async fn adjust_stock(&self, product_id: i64, delta: i64) -> Result<bool, StoreError>;

    /// Statement an operator must run after rows were inserted with explicit
    /// ids, for backends whose key generator does not follow such inserts.
    fn key_reset_statement(&self, _table: Table) -> Option<String> {
        None
    }
}

#[derive(Clone)]
pub struct Db {
    store: Arc<dyn Store>,
}

impl Db {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    pub fn key_reset_statement(&self, table: Table) -> Option<String> {
        self.store.key_reset_statement(table)
    }

    pub async fn find_all(&self, table: Table, query: &Query) -> Result<Vec<Row>, StoreError> {
        validate_query(table, query)?;

        let mut rows = self.store.select(table, &with_tiebreaker(query)).await?;

        for include in &query.include {
            self.embed(&mut rows, include).await?;
        }

        if !query.exclude.is_empty() {
            for row in &mut rows {
                project(row, &query.exclude);
            }
        }

        debug!(table = %table, rows = rows.len(), "find_all");
        Ok(rows)
    }

    pub async fn find_and_count_all(
        &self,
        table: Table,
        query: &Query,
    ) -> Result<Counted, StoreError> {
        let (rows, count) =
            tokio::try_join!(self.find_all(table, query), self.count(table, &query.filter))?;
        Ok(Counted { rows, count })
    }

    pub async fn find_by_pk(&self, table: Table, id: i64) -> Result<Option<Row>, StoreError> {
        self.store.find_by_pk(table, id).await
    }

    pub async fn create(&self, table: Table, mut row: Row) -> Result<Row, StoreError> {
        row.remove("id");
        stamp_new(&mut row);
        validate_row(table, &row)?;

        let created = self.store.insert(table, row).await?;
        debug!(table = %table, id = ?created.get("id"), "created row");
        Ok(created)
    }

    /// Inserts `rows` in one backend call. With `ignore_duplicates`, a failed
    /// bulk insert falls back to row-by-row inserts that skip unique
    /// violations; any other error is still returned.
    pub async fn bulk_create(
        &self,
        table: Table,
        mut rows: Vec<Row>,
        options: BulkOptions,
    ) -> Result<Vec<Row>, StoreError> {
        for row in &mut rows {
            stamp_new(row);
            validate_row(table, row)?;
        }

        if !options.ignore_duplicates {
            return self.store.insert_many(table, rows).await;
        }

        match self.store.insert_many(table, rows.clone()).await {
            Ok(created) => Ok(created),
            Err(e) => {
                warn!(table = %table, error = %e, "bulk insert failed, retrying row by row");
                let mut created = Vec::with_capacity(rows.len());
                for row in rows {
                    match self.store.insert(table, row).await {
                        Ok(row) => created.push(row),
                        Err(StoreError::Duplicate) => {
                            warn!(table = %table, "skipping duplicate row");
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(created)
            }
        }
    }

    pub async fn update(&self, table: Table, id: i64, mut changes: Row) -> Result<u64, StoreError> {
        changes.remove("id");
        changes.remove("createdAt");
        changes.insert("updatedAt".to_owned(), now_timestamp());
        validate_row(table, &changes)?;

        self.store.update(table, id, changes).await
    }

    pub async fn destroy(&self, table: Table, id: i64) -> Result<u64, StoreError> {
        self.store.delete(table, id).await
    }

    pub async fn count(&self, table: Table, filter: &Filter) -> Result<u64, StoreError> {
        validate_filter(table, filter)?;
        self.store.count(table, filter).await
    }

    pub async fn sum(&self, table: Table, column: &str, filter: &Filter) -> Result<f64, StoreError> {
        let kind = check_column(table, column)?.kind;
        if !matches!(kind, Kind::Integer | Kind::Real) {
            return Err(StoreError::TypeMismatch {
                column: column.to_owned(),
            });
        }
        validate_filter(table, filter)?;
        self.store.sum(table, column, filter).await
    }

    pub async fn adjust_stock(&self, product_id: i64, delta: i64) -> Result<bool, StoreError> {
        self.store.adjust_stock(product_id, delta).await
    }

    /// Attaches related rows under the relation alias using one batched `IN`
    /// query for all distinct foreign keys in `rows`.
    async fn embed(&self, rows: &mut [Row], include: &Include) -> Result<(), StoreError> {
        let relation = include.relation;
        let keys: BTreeSet<i64> = rows
            .iter()
            .filter_map(|row| row.get(relation.foreign_key).and_then(Value::as_i64))
            .collect();

        let mut related: HashMap<i64, Row> = HashMap::with_capacity(keys.len());
        if !keys.is_empty() {
            let keys = keys.into_iter().map(Value::from).collect();
            let query = Query::new(Filter::new().with("id", Condition::In(keys)));
            for mut row in self.store.select(relation.target, &query).await? {
                project(&mut row, &include.exclude);
                if let Some(id) = row.get("id").and_then(Value::as_i64) {
                    related.insert(id, row);
                }
            }
        }

        for row in rows.iter_mut() {
            let embedded = row
                .get(relation.foreign_key)
                .and_then(Value::as_i64)
                .and_then(|id| related.get(&id))
                .map_or(Value::Null, |r| Value::Object(r.clone()));
            row.insert(relation.alias.to_owned(), embedded);
        }
        Ok(())
    }
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
pub fn now_string() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn now_timestamp() -> Value {
    Value::String(now_string())
}

pub fn to_row<T: Serialize>(value: &T) -> Result<Row, StoreError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(row)) => Ok(row),
        Ok(other) => Err(StoreError::Decode(format!("expected an object, got {other}"))),
        Err(e) => Err(StoreError::Decode(e.to_string())),
    }
}

pub fn from_row<T: DeserializeOwned>(row: Row) -> Result<T, StoreError> {
    serde_json::from_value(Value::Object(row)).map_err(|e| StoreError::Decode(e.to_string()))
}

fn stamp_new(row: &mut Row) {
    let now = now_timestamp();
    for key in ["createdAt", "updatedAt"] {
        if row.get(key).map_or(true, Value::is_null) {
            row.insert(key.to_owned(), now.clone());
        }
    }
}

fn project(row: &mut Row, exclude: &[&'static str]) {
    for column in exclude {
        row.remove(*column);
    }
}

fn with_tiebreaker(query: &Query) -> Query {
    let mut query = query.clone();
    if !query.order.iter().any(|o| o.column == "id") {
        let dir = query.order.first().map_or(SortDir::Asc, |o| o.dir);
        query.order.push(OrderBy {
            column: "id".to_owned(),
            dir,
        });
    }
    query
}

fn check_column(table: Table, name: &str) -> Result<&'static schema::Column, StoreError> {
    table.column(name).ok_or_else(|| StoreError::UnknownColumn {
        table,
        column: name.to_owned(),
    })
}

fn validate_filter(table: Table, filter: &Filter) -> Result<(), StoreError> {
    filter
        .predicates()
        .try_for_each(|p| check_column(table, &p.field).map(|_| ()))
}

fn validate_query(table: Table, query: &Query) -> Result<(), StoreError> {
    validate_filter(table, &query.filter)?;
    for order in &query.order {
        check_column(table, &order.column)?;
    }
    for include in &query.include {
        check_column(table, include.relation.foreign_key)?;
    }
    Ok(())
}

fn validate_row(table: Table, row: &Row) -> Result<(), StoreError> {
    row.keys().try_for_each(|key| check_column(table, key).map(|_| ()))
}
