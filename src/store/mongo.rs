//! Document database backend on MongoDB.

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{
    FindOneAndUpdateOptions, FindOptions, IndexOptions, ReturnDocument, UpdateOptions,
};
use mongodb::{Client, Collection, Database, IndexModel};
use serde_json::Value;
use tracing::info;

use super::filter::{Condition, Filter, Predicate, Query, SortDir};
use super::schema::Table;
use super::{now_timestamp, Row, Store, StoreError};

const DUPLICATE_KEY: i32 = 11000;
const COUNTERS: &str = "counters";

impl From<mongodb::error::Error> for StoreError {
    fn from(error: mongodb::error::Error) -> Self {
        let duplicate = match error.kind.as_ref() {
            ErrorKind::Write(WriteFailure::WriteError(e)) => e.code == DUPLICATE_KEY,
            ErrorKind::BulkWrite(failure) => failure
                .write_errors
                .as_ref()
                .is_some_and(|errors| errors.iter().any(|e| e.code == DUPLICATE_KEY)),
            _ => false,
        };
        if duplicate {
            StoreError::Duplicate
        } else {
            StoreError::Mongo(error)
        }
    }
}

fn decode_err(error: impl std::fmt::Display) -> StoreError {
    StoreError::Decode(error.to_string())
}

/// Surrogate keys live in `_id`.
fn field(name: &str) -> &str {
    if name == "id" {
        "_id"
    } else {
        name
    }
}

fn to_bson(value: &Value) -> Result<Bson, StoreError> {
    bson::to_bson(value).map_err(decode_err)
}

fn predicate_doc(predicate: &Predicate) -> Result<Document, StoreError> {
    let condition = match &predicate.condition {
        Condition::Eq(v) => to_bson(v)?,
        Condition::Contains(term) => Bson::Document(doc! {
            "$regex": regex::escape(term),
            "$options": "i",
        }),
        Condition::Gte(v) => Bson::Document(doc! { "$gte": to_bson(v)? }),
        Condition::Lte(v) => Bson::Document(doc! { "$lte": to_bson(v)? }),
        Condition::Gt(v) => Bson::Document(doc! { "$gt": to_bson(v)? }),
        Condition::Lt(v) => Bson::Document(doc! { "$lt": to_bson(v)? }),
        Condition::In(values) => {
            let values = values.iter().map(to_bson).collect::<Result<Vec<_>, _>>()?;
            Bson::Document(doc! { "$in": values })
        }
    };
    let mut document = Document::new();
    document.insert(field(&predicate.field), condition);
    Ok(document)
}

/// Each predicate becomes its own clause so that several operators on one
/// field never overwrite each other.
fn filter_doc(filter: &Filter) -> Result<Document, StoreError> {
    let mut clauses = filter
        .all
        .iter()
        .map(predicate_doc)
        .collect::<Result<Vec<_>, _>>()?;
    if !filter.any.is_empty() {
        let any = filter
            .any
            .iter()
            .map(predicate_doc)
            .collect::<Result<Vec<_>, _>>()?;
        clauses.push(doc! { "$or": any });
    }
    Ok(match clauses.len() {
        0 => Document::new(),
        1 => clauses.remove(0),
        _ => doc! { "$and": clauses },
    })
}

fn sort_doc(query: &Query) -> Document {
    let mut sort = Document::new();
    for order in &query.order {
        let dir = match order.dir {
            SortDir::Asc => 1,
            SortDir::Desc => -1,
        };
        sort.insert(field(&order.column), dir);
    }
    sort
}

/// Rows carrying their own id (backup restores) keep it.
fn explicit_id(row: &Row) -> Option<i64> {
    row.get("id").and_then(Value::as_i64)
}

fn to_document(mut row: Row, id: i64) -> Result<Document, StoreError> {
    row.remove("id");
    let mut document = bson::to_document(&row).map_err(decode_err)?;
    document.insert("_id", id);
    Ok(document)
}

fn from_document(mut document: Document) -> Result<Row, StoreError> {
    if let Some(id) = document.remove("_id") {
        document.insert("id", id);
    }
    bson::from_document(document).map_err(decode_err)
}

#[derive(Debug, Clone)]
pub struct MongoStore {
    database: Database,
}

impl MongoStore {
    pub async fn connect(uri: &str, database: &str) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(uri).await?;
        let store = Self {
            database: client.database(database),
        };
        store.ensure_indexes().await?;
        info!(database, "connected to mongodb");
        Ok(store)
    }

    fn collection(&self, table: Table) -> Collection<Document> {
        self.database.collection(table.name())
    }

    async fn ensure_indexes(&self) -> Result<(), StoreError> {
        for table in Table::ALL {
            for column in table.columns().iter().filter(|c| c.unique) {
                let mut keys = Document::new();
                keys.insert(column.name, 1);
                let index = IndexModel::builder()
                    .keys(keys)
                    .options(IndexOptions::builder().unique(true).sparse(true).build())
                    .build();
                self.collection(table).create_index(index, None).await?;
            }
        }
        Ok(())
    }

    async fn next_id(&self, table: Table) -> Result<i64, StoreError> {
        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();
        let counter = self
            .database
            .collection::<Document>(COUNTERS)
            .find_one_and_update(
                doc! { "_id": table.name() },
                doc! { "$inc": { "seq": 1_i64 } },
                options,
            )
            .await?
            .ok_or_else(|| StoreError::Decode(format!("no id counter for `{table}`")))?;
        counter.get_i64("seq").map_err(decode_err)
    }

    /// Keeps the counter ahead of explicitly inserted ids.
    async fn raise_counter(&self, table: Table, id: i64) -> Result<(), StoreError> {
        self.database
            .collection::<Document>(COUNTERS)
            .update_one(
                doc! { "_id": table.name() },
                doc! { "$max": { "seq": id } },
                UpdateOptions::builder().upsert(true).build(),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Store for MongoStore {
    fn backend(&self) -> &'static str {
        "mongodb"
    }

    async fn select(&self, table: Table, query: &Query) -> Result<Vec<Row>, StoreError> {
        let options = FindOptions::builder()
            .sort(sort_doc(query))
            .skip(query.offset)
            .limit(query.limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX)))
            .build();
        let mut cursor = self
            .collection(table)
            .find(filter_doc(&query.filter)?, options)
            .await?;

        let mut rows = Vec::new();
        while let Some(document) = cursor.try_next().await? {
            rows.push(from_document(document)?);
        }
        Ok(rows)
    }

    async fn count(&self, table: Table, filter: &Filter) -> Result<u64, StoreError> {
        Ok(self
            .collection(table)
            .count_documents(filter_doc(filter)?, None)
            .await?)
    }

    async fn sum(&self, table: Table, column: &str, filter: &Filter) -> Result<f64, StoreError> {
        let pipeline = vec![
            doc! { "$match": filter_doc(filter)? },
            doc! { "$group": { "_id": Bson::Null, "total": { "$sum": format!("${column}") } } },
        ];
        let mut cursor = self.collection(table).aggregate(pipeline, None).await?;
        let total = match cursor.try_next().await? {
            Some(group) => match group.get("total") {
                Some(Bson::Double(v)) => *v,
                Some(Bson::Int64(v)) => *v as f64,
                Some(Bson::Int32(v)) => f64::from(*v),
                _ => 0.0,
            },
            None => 0.0,
        };
        Ok(total)
    }

    async fn find_by_pk(&self, table: Table, id: i64) -> Result<Option<Row>, StoreError> {
        self.collection(table)
            .find_one(doc! { "_id": id }, None)
            .await?
            .map(from_document)
            .transpose()
    }

    async fn insert(&self, table: Table, row: Row) -> Result<Row, StoreError> {
        let explicit = explicit_id(&row);
        let id = match explicit {
            Some(id) => id,
            None => self.next_id(table).await?,
        };
        let document = to_document(row, id)?;
        self.collection(table).insert_one(&document, None).await?;
        if explicit.is_some() {
            self.raise_counter(table, id).await?;
        }
        from_document(document)
    }

    async fn insert_many(&self, table: Table, rows: Vec<Row>) -> Result<Vec<Row>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let mut documents = Vec::with_capacity(rows.len());
        let mut max_id = 0;
        for row in rows {
            let id = match explicit_id(&row) {
                Some(id) => id,
                None => self.next_id(table).await?,
            };
            max_id = max_id.max(id);
            documents.push(to_document(row, id)?);
        }
        self.collection(table)
            .insert_many(&documents, None)
            .await?;
        self.raise_counter(table, max_id).await?;
        documents.into_iter().map(from_document).collect()
    }

    async fn update(&self, table: Table, id: i64, changes: Row) -> Result<u64, StoreError> {
        let changes = bson::to_document(&changes).map_err(decode_err)?;
        let result = self
            .collection(table)
            .update_one(doc! { "_id": id }, doc! { "$set": changes }, None)
            .await?;
        Ok(result.matched_count)
    }

    async fn delete(&self, table: Table, id: i64) -> Result<u64, StoreError> {
        let result = self
            .collection(table)
            .delete_one(doc! { "_id": id }, None)
            .await?;
        Ok(result.deleted_count)
    }

    async fn adjust_stock(&self, product_id: i64, delta: i64) -> Result<bool, StoreError> {
        let mut filter = doc! { "_id": product_id };
        if delta < 0 {
            filter.insert("stock", doc! { "$gte": -delta });
        }
        let updated_at = to_bson(&now_timestamp())?;
        let result = self
            .collection(Table::Products)
            .update_one(
                filter,
                doc! { "$inc": { "stock": delta }, "$set": { "updatedAt": updated_at } },
                None,
            )
            .await?;
        Ok(result.modified_count == 1)
    }
}
