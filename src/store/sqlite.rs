//! Relational backend on SQLite through `sqlx`.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use serde_json::{Number, Value};
use sqlx::error::{DatabaseError, ErrorKind};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row as _, Sqlite};
use tracing::info;

use super::filter::{Condition, Filter, Predicate, Query};
use super::schema::{Column, Kind, Table};
use super::{now_string, Row, Store, StoreError};

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        match error.as_database_error().map(DatabaseError::kind) {
            Some(ErrorKind::UniqueViolation) => StoreError::Duplicate,
            _ => StoreError::Sqlite(error),
        }
    }
}

/// A bindable value already coerced to the column's storage class.
#[derive(Debug, Clone, PartialEq)]
enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Boolean(bool),
}

impl SqlValue {
    fn coerce(column: &Column, value: &Value) -> Result<Self, StoreError> {
        let mismatch = || StoreError::TypeMismatch {
            column: column.name.to_owned(),
        };
        if value.is_null() {
            return Ok(SqlValue::Null);
        }
        Ok(match column.kind {
            Kind::Integer => SqlValue::Integer(value.as_i64().ok_or_else(mismatch)?),
            Kind::Real => SqlValue::Real(value.as_f64().ok_or_else(mismatch)?),
            Kind::Text | Kind::Timestamp => match value {
                Value::String(s) => SqlValue::Text(s.clone()),
                _ => return Err(mismatch()),
            },
            Kind::Boolean => SqlValue::Boolean(value.as_bool().ok_or_else(mismatch)?),
            Kind::Json => SqlValue::Text(value.to_string()),
        })
    }
}

fn push_value(qb: &mut QueryBuilder<'_, Sqlite>, value: SqlValue) {
    match value {
        SqlValue::Null => qb.push_bind(Option::<String>::None),
        SqlValue::Integer(v) => qb.push_bind(v),
        SqlValue::Real(v) => qb.push_bind(v),
        SqlValue::Text(v) => qb.push_bind(v),
        SqlValue::Boolean(v) => qb.push_bind(v),
    };
}

fn quoted(name: &str) -> String {
    format!("\"{name}\"")
}

fn column(table: Table, name: &str) -> Result<&'static Column, StoreError> {
    table.column(name).ok_or_else(|| StoreError::UnknownColumn {
        table,
        column: name.to_owned(),
    })
}

/// Case-insensitive literal match. `(?i)` folds Unicode, unlike `LOWER()`.
fn contains_pattern(term: &str) -> String {
    format!("(?i){}", regex::escape(term))
}

fn push_predicate(
    qb: &mut QueryBuilder<'_, Sqlite>,
    table: Table,
    predicate: &Predicate,
) -> Result<(), StoreError> {
    let col = column(table, &predicate.field)?;
    let name = quoted(col.name);

    let (op, value) = match &predicate.condition {
        Condition::Eq(Value::Null) => {
            qb.push(format!("{name} IS NULL"));
            return Ok(());
        }
        Condition::Contains(term) => {
            qb.push(format!("{name} REGEXP "));
            qb.push_bind(contains_pattern(term));
            return Ok(());
        }
        Condition::In(values) => {
            if values.is_empty() {
                qb.push("0 = 1");
                return Ok(());
            }
            qb.push(format!("{name} IN ("));
            for (i, value) in values.iter().enumerate() {
                if i > 0 {
                    qb.push(", ");
                }
                push_value(qb, SqlValue::coerce(col, value)?);
            }
            qb.push(")");
            return Ok(());
        }
        Condition::Eq(v) => ("=", v),
        Condition::Gte(v) => (">=", v),
        Condition::Lte(v) => ("<=", v),
        Condition::Gt(v) => (">", v),
        Condition::Lt(v) => ("<", v),
    };

    qb.push(format!("{name} {op} "));
    push_value(qb, SqlValue::coerce(col, value)?);
    Ok(())
}

fn push_where(
    qb: &mut QueryBuilder<'_, Sqlite>,
    table: Table,
    filter: &Filter,
) -> Result<(), StoreError> {
    qb.push(" WHERE 1 = 1");
    for predicate in &filter.all {
        qb.push(" AND ");
        push_predicate(qb, table, predicate)?;
    }
    if !filter.any.is_empty() {
        qb.push(" AND (");
        for (i, predicate) in filter.any.iter().enumerate() {
            if i > 0 {
                qb.push(" OR ");
            }
            push_predicate(qb, table, predicate)?;
        }
        qb.push(")");
    }
    Ok(())
}

fn column_list(table: Table) -> String {
    table
        .columns()
        .iter()
        .map(|c| quoted(c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn decode_row(table: Table, row: &SqliteRow) -> Result<Row, StoreError> {
    let mut out = Row::new();
    for col in table.columns() {
        let value = match col.kind {
            Kind::Integer => row
                .try_get::<Option<i64>, _>(col.name)?
                .map_or(Value::Null, Value::from),
            Kind::Real => row
                .try_get::<Option<f64>, _>(col.name)?
                .and_then(Number::from_f64)
                .map_or(Value::Null, Value::Number),
            Kind::Text | Kind::Timestamp => row
                .try_get::<Option<String>, _>(col.name)?
                .map_or(Value::Null, Value::String),
            Kind::Boolean => row
                .try_get::<Option<bool>, _>(col.name)?
                .map_or(Value::Null, Value::Bool),
            Kind::Json => match row.try_get::<Option<String>, _>(col.name)? {
                Some(text) => serde_json::from_str(&text)
                    .map_err(|e| StoreError::Decode(format!("{table}.{}: {e}", col.name)))?,
                None => Value::Null,
            },
        };
        out.insert(col.name.to_owned(), value);
    }
    Ok(out)
}

fn create_table_sql(table: Table) -> String {
    let columns = table
        .columns()
        .iter()
        .map(|c| {
            if c.name == "id" {
                return "\"id\" INTEGER PRIMARY KEY AUTOINCREMENT".to_owned();
            }
            let ty = match c.kind {
                Kind::Integer => "INTEGER",
                Kind::Real => "REAL",
                Kind::Boolean => "BOOLEAN",
                Kind::Text | Kind::Json | Kind::Timestamp => "TEXT",
            };
            let unique = if c.unique { " UNIQUE" } else { "" };
            format!("{} {ty}{unique}", quoted(c.name))
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE IF NOT EXISTS {} ({columns})", quoted(table.name()))
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database file and its tables.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| StoreError::Sqlite(sqlx::Error::Io(e)))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .with_regexp();
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        info!(path = %path.display(), "opened sqlite database");
        Self::with_pool(pool).await
    }

    /// A private in-memory database. The pool holds exactly one connection
    /// that is never recycled, since the data lives in that connection.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.with_regexp();
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        for table in Table::ALL {
            sqlx::query(&create_table_sql(table)).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    fn insert_query(table: Table, row: &Row) -> Result<QueryBuilder<'static, Sqlite>, StoreError> {
        let mut qb = QueryBuilder::new(format!("INSERT INTO {} ", quoted(table.name())));
        if row.is_empty() {
            qb.push("DEFAULT VALUES");
        } else {
            let names = row.keys().map(|k| quoted(k)).collect::<Vec<_>>().join(", ");
            qb.push(format!("({names}) VALUES ("));
            for (i, (key, value)) in row.iter().enumerate() {
                if i > 0 {
                    qb.push(", ");
                }
                push_value(&mut qb, SqlValue::coerce(column(table, key)?, value)?);
            }
            qb.push(")");
        }
        qb.push(format!(" RETURNING {}", column_list(table)));
        Ok(qb)
    }
}

#[async_trait]
impl Store for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn select(&self, table: Table, query: &Query) -> Result<Vec<Row>, StoreError> {
        let mut qb = QueryBuilder::new(format!(
            "SELECT {} FROM {}",
            column_list(table),
            quoted(table.name())
        ));
        push_where(&mut qb, table, &query.filter)?;

        if !query.order.is_empty() {
            let order = query
                .order
                .iter()
                .map(|o| {
                    column(table, &o.column)
                        .map(|c| format!("{} {}", quoted(c.name), o.dir.as_str().to_uppercase()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            qb.push(format!(" ORDER BY {}", order.join(", ")));
        }

        match (query.limit, query.offset) {
            (Some(limit), offset) => {
                qb.push(" LIMIT ");
                qb.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
                qb.push(" OFFSET ");
                qb.push_bind(i64::try_from(offset.unwrap_or(0)).unwrap_or(i64::MAX));
            }
            (None, Some(offset)) => {
                qb.push(" LIMIT -1 OFFSET ");
                qb.push_bind(i64::try_from(offset).unwrap_or(i64::MAX));
            }
            (None, None) => {}
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(|r| decode_row(table, r)).collect()
    }

    async fn count(&self, table: Table, filter: &Filter) -> Result<u64, StoreError> {
        let mut qb = QueryBuilder::new(format!("SELECT COUNT(*) FROM {}", quoted(table.name())));
        push_where(&mut qb, table, filter)?;
        let count: i64 = qb.build().fetch_one(&self.pool).await?.try_get(0)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn sum(&self, table: Table, column_name: &str, filter: &Filter) -> Result<f64, StoreError> {
        let col = column(table, column_name)?;
        let mut qb = QueryBuilder::new(format!(
            "SELECT CAST(COALESCE(SUM({}), 0) AS REAL) FROM {}",
            quoted(col.name),
            quoted(table.name())
        ));
        push_where(&mut qb, table, filter)?;
        Ok(qb.build().fetch_one(&self.pool).await?.try_get(0)?)
    }

    async fn find_by_pk(&self, table: Table, id: i64) -> Result<Option<Row>, StoreError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE \"id\" = ?",
            column_list(table),
            quoted(table.name())
        );
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(|r| decode_row(table, &r)).transpose()
    }

    async fn insert(&self, table: Table, row: Row) -> Result<Row, StoreError> {
        let mut qb = Self::insert_query(table, &row)?;
        let created = qb.build().fetch_one(&self.pool).await?;
        decode_row(table, &created)
    }

    async fn insert_many(&self, table: Table, rows: Vec<Row>) -> Result<Vec<Row>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut created = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut qb = Self::insert_query(table, row)?;
            let inserted = qb.build().fetch_one(&mut *tx).await?;
            created.push(decode_row(table, &inserted)?);
        }
        tx.commit().await?;
        Ok(created)
    }

    async fn update(&self, table: Table, id: i64, changes: Row) -> Result<u64, StoreError> {
        if changes.is_empty() {
            return Ok(u64::from(self.find_by_pk(table, id).await?.is_some()));
        }
        let mut qb = QueryBuilder::new(format!("UPDATE {} SET ", quoted(table.name())));
        for (i, (key, value)) in changes.iter().enumerate() {
            if i > 0 {
                qb.push(", ");
            }
            let col = column(table, key)?;
            qb.push(format!("{} = ", quoted(col.name)));
            push_value(&mut qb, SqlValue::coerce(col, value)?);
        }
        qb.push(" WHERE \"id\" = ");
        qb.push_bind(id);
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    async fn delete(&self, table: Table, id: i64) -> Result<u64, StoreError> {
        let sql = format!("DELETE FROM {} WHERE \"id\" = ?", quoted(table.name()));
        Ok(sqlx::query(&sql)
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected())
    }

    async fn adjust_stock(&self, product_id: i64, delta: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE \"products\" SET \"stock\" = \"stock\" + ?, \"updatedAt\" = ? \
             WHERE \"id\" = ? AND \"stock\" + ? >= 0",
        )
        .bind(delta)
        .bind(now_string())
        .bind(product_id)
        .bind(delta)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::super::filter::SortDir;
    use super::super::now_timestamp;
    use super::*;

    fn product(name: &str, price: f64, category: &str, active: bool) -> Row {
        let Value::Object(row) = json!({
            "name": name,
            "description": format!("{name} description"),
            "price": price,
            "category": category,
            "images": [],
            "specifications": {},
            "features": [],
            "stock": 5,
            "tags": [],
            "isActive": active,
            "isFeatured": false,
            "rating": {"average": 0.0, "count": 0},
            "createdAt": now_timestamp(),
            "updatedAt": now_timestamp(),
        }) else {
            unreachable!()
        };
        row
    }

    async fn seeded() -> SqliteStore {
        let store = SqliteStore::in_memory().await.unwrap();
        for (name, price, category, active) in [
            ("Canon EOS R5", 350_000.0, "cameras", true),
            ("Canon PowerShot", 900.0, "cameras", true),
            ("Nikon Z6", 250_000.0, "cameras", true),
            ("Canon Selphy", 15_000.0, "accessories", true),
            ("Canon EOS 90D", 120_000.0, "cameras", false),
        ] {
            store
                .insert(Table::Products, product(name, price, category, active))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn operators_are_anded_and_any_group_is_ored() {
        let store = seeded().await;
        let filter = Filter::new()
            .eq("isActive", true)
            .eq("category", "cameras")
            .with("price", Condition::Gte(json!(1000)))
            .with("price", Condition::Lte(json!(500_000)))
            .or("name", Condition::Contains("CANON".into()))
            .or("brand", Condition::Contains("CANON".into()));

        let query = Query::new(filter).order_by("price", SortDir::Desc);
        let rows = store.select(Table::Products, &query).await.unwrap();

        let names: Vec<_> = rows.iter().map(|r| r["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["Canon EOS R5"]);
        assert_eq!(store.count(Table::Products, &query.filter).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn like_wildcards_in_search_terms_are_literal() {
        let store = seeded().await;
        let filter = Filter::new().with("name", Condition::Contains("%".into()));
        assert_eq!(store.count(Table::Products, &filter).await.unwrap(), 0);

        let filter = Filter::new().with("name", Condition::Contains("EOS.R5".into()));
        assert_eq!(store.count(Table::Products, &filter).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn substring_match_folds_non_ascii_case() {
        let store = seeded().await;
        store
            .insert(Table::Products, product("ÉCRAN Pro", 40_000.0, "accessories", true))
            .await
            .unwrap();

        for term in ["écran", "ÉCRAN", "Écran pro"] {
            let filter = Filter::new().with("name", Condition::Contains(term.into()));
            assert_eq!(store.count(Table::Products, &filter).await.unwrap(), 1, "{term}");
        }
    }

    #[tokio::test]
    async fn find_by_pk_missing_is_none_and_delete_is_idempotent() {
        let store = seeded().await;
        assert!(store.find_by_pk(Table::Products, 99).await.unwrap().is_none());

        assert_eq!(store.delete(Table::Products, 1).await.unwrap(), 1);
        assert_eq!(store.delete(Table::Products, 1).await.unwrap(), 0);
        assert!(store.find_by_pk(Table::Products, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sum_is_computed_in_sql() {
        let store = seeded().await;
        let total = store
            .sum(Table::Products, "price", &Filter::new().eq("category", "cameras"))
            .await
            .unwrap();
        assert!((total - 720_900.0).abs() < f64::EPSILON);

        let none = store
            .sum(Table::Products, "price", &Filter::new().eq("category", "phones"))
            .await
            .unwrap();
        assert!(none.abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn json_columns_round_trip_in_order() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut row = product("Sony A7", 200_000.0, "cameras", true);
        row.insert(
            "images".into(),
            json!([
                {"url": "/a.jpg", "isPrimary": false},
                {"url": "/b.jpg", "isPrimary": true},
                {"url": "/c.jpg", "isPrimary": false}
            ]),
        );
        let created = store.insert(Table::Products, row).await.unwrap();
        let id = created["id"].as_i64().unwrap();

        let fetched = store.find_by_pk(Table::Products, id).await.unwrap().unwrap();
        assert_eq!(fetched["images"], created["images"]);
        assert_eq!(fetched["images"][1]["isPrimary"], json!(true));
        assert_eq!(fetched["isActive"], json!(true));
    }

    #[tokio::test]
    async fn stock_decrement_never_goes_negative() {
        let store = seeded().await;
        assert!(store.adjust_stock(1, -5).await.unwrap());
        assert!(!store.adjust_stock(1, -1).await.unwrap());
        assert!(store.adjust_stock(1, 2).await.unwrap());

        let row = store.find_by_pk(Table::Products, 1).await.unwrap().unwrap();
        assert_eq!(row["stock"], json!(2));
    }

    #[test]
    fn ddl_marks_unique_columns() {
        let sql = create_table_sql(Table::Users);
        assert!(sql.contains("\"email\" TEXT UNIQUE"));
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"users\""));
    }
}
