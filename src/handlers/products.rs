use actix_web::{web, HttpResponse};
use tracing::debug;

use super::{listing, single};
use crate::envelope::Envelope;
use crate::error::ApiError;
use crate::models::{CreateProductRequest, UpdateProductRequest};
use crate::query::ListParams;
use crate::services::products;
use crate::store::Db;

pub async fn list_products(
    db: web::Data<Db>,
    params: web::Query<ListParams>,
) -> Result<HttpResponse, ApiError> {
    debug!(?params, "listing products");
    let page = products::list_public(&db, &params).await?;
    listing("products", page)
}

pub async fn get_product(db: web::Data<Db>, id: web::Path<i64>) -> Result<HttpResponse, ApiError> {
    let product = products::find_public(&db, id.into_inner()).await?;
    Ok(HttpResponse::Ok().json(single("product", product)?))
}

pub async fn create_product(
    db: web::Data<Db>,
    body: web::Json<CreateProductRequest>,
) -> Result<HttpResponse, ApiError> {
    let product = products::create(&db, body.into_inner()).await?;
    Ok(HttpResponse::Created()
        .json(single("product", product)?.with_message("Product created successfully")))
}

pub async fn update_product(
    db: web::Data<Db>,
    id: web::Path<i64>,
    body: web::Json<UpdateProductRequest>,
) -> Result<HttpResponse, ApiError> {
    let product = products::update(&db, id.into_inner(), body.into_inner()).await?;
    Ok(HttpResponse::Ok()
        .json(single("product", product)?.with_message("Product updated successfully")))
}

pub async fn delete_product(
    db: web::Data<Db>,
    id: web::Path<i64>,
) -> Result<HttpResponse, ApiError> {
    products::delete(&db, id.into_inner()).await?;
    Ok(HttpResponse::Ok().json(Envelope::message("Product deleted successfully")))
}
