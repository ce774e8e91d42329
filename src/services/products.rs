use serde_json::json;
use tracing::info;
use validator::Validate;

use super::decode_all;
use crate::error::ApiError;
use crate::models::{CreateProductRequest, Product, UpdateProductRequest};
use crate::query::{search, ListParams, Page, Pagination, ADMIN_PAGE_SIZE, PUBLIC_PAGE_SIZE};
use crate::store::{from_row, to_row, Db, Filter, Query, Table};

const SEARCH_FIELDS: &[&str] = &["name", "description", "brand", "model", "category"];
const SORTABLE: &[&str] = &["createdAt", "updatedAt", "name", "price", "stock"];

/// Storefront listing: active products only.
pub async fn list_public(db: &Db, params: &ListParams) -> Result<Page<Product>, ApiError> {
    let pagination = params.pagination(PUBLIC_PAGE_SIZE)?;
    let filter = narrow(Filter::new().eq("isActive", true), params)?;
    list(db, filter, params, pagination).await
}

/// Admin listing: inactive products too, unless `isActive` narrows it.
pub async fn list_admin(db: &Db, params: &ListParams) -> Result<Page<Product>, ApiError> {
    let pagination = params.pagination(ADMIN_PAGE_SIZE)?;
    let mut filter = Filter::new();
    if let Some(active) = params.is_active {
        filter = filter.eq("isActive", active);
    }
    let filter = narrow(filter, params)?;
    list(db, filter, params, pagination).await
}

fn narrow(mut filter: Filter, params: &ListParams) -> Result<Filter, ApiError> {
    if let Some(category) = params.category {
        filter = filter.eq("category", category.as_str());
    }
    if params.featured == Some(true) {
        filter = filter.eq("isFeatured", true);
    }
    filter = params.price_range(filter)?;
    Ok(search(filter, params.search_term(), SEARCH_FIELDS))
}

async fn list(
    db: &Db,
    filter: Filter,
    params: &ListParams,
    pagination: Pagination,
) -> Result<Page<Product>, ApiError> {
    let (column, dir) = params.sort(SORTABLE)?;
    let query = pagination.apply(Query::new(filter).order_by(&column, dir));
    let found = db.find_and_count_all(Table::Products, &query).await?;

    Ok(Page {
        items: decode_all(found.rows)?,
        meta: pagination.meta(found.count, "totalProducts"),
    })
}

pub async fn find(db: &Db, id: i64) -> Result<Product, ApiError> {
    let row = db
        .find_by_pk(Table::Products, id)
        .await?
        .ok_or(ApiError::NotFound("Product"))?;
    Ok(from_row(row)?)
}

/// Inactive products are hidden from the storefront.
pub async fn find_public(db: &Db, id: i64) -> Result<Product, ApiError> {
    let product = find(db, id).await?;
    if !product.is_active {
        return Err(ApiError::NotFound("Product"));
    }
    Ok(product)
}

pub async fn create(db: &Db, request: CreateProductRequest) -> Result<Product, ApiError> {
    request.validate()?;

    let mut row = to_row(&request)?;
    row.insert("rating".into(), json!({ "average": 0.0, "count": 0 }));
    let product: Product = from_row(db.create(Table::Products, row).await?)?;

    info!(id = product.id, name = %product.name, "product created");
    Ok(product)
}

pub async fn update(db: &Db, id: i64, request: UpdateProductRequest) -> Result<Product, ApiError> {
    request.validate()?;

    let changes = to_row(&request)?;
    if db.update(Table::Products, id, changes).await? == 0 {
        return Err(ApiError::NotFound("Product"));
    }
    info!(id, "product updated");
    find(db, id).await
}

pub async fn delete(db: &Db, id: i64) -> Result<(), ApiError> {
    if db.destroy(Table::Products, id).await? == 0 {
        return Err(ApiError::NotFound("Product"));
    }
    info!(id, "product deleted");
    Ok(())
}
