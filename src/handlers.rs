pub mod admin;
pub mod orders;
pub mod products;

use actix_web::HttpResponse;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::envelope::Envelope;
use crate::error::ApiError;
use crate::query::Page;

/// `{success, data: {<key>: [...], pagination: {...}}}`
fn listing<T: Serialize>(key: &str, page: Page<T>) -> Result<HttpResponse, ApiError> {
    let items = serde_json::to_value(page.items).map_err(|e| ApiError::Internal(e.to_string()))?;
    let meta = serde_json::to_value(page.meta).map_err(|e| ApiError::Internal(e.to_string()))?;

    let mut data = Map::new();
    data.insert(key.to_owned(), items);
    data.insert("pagination".to_owned(), meta);
    Ok(HttpResponse::Ok().json(Envelope::ok(Value::Object(data))))
}

/// `{success, data: {<key>: value}}`
fn single<T: Serialize>(key: &str, value: T) -> Result<Envelope<Value>, ApiError> {
    let value = serde_json::to_value(value).map_err(|e| ApiError::Internal(e.to_string()))?;
    let mut data = Map::new();
    data.insert(key.to_owned(), value);
    Ok(Envelope::ok(Value::Object(data)))
}
