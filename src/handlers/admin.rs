use actix_web::{web, HttpResponse};
use tracing::debug;

use super::{listing, single};
use crate::auth::Claims;
use crate::envelope::Envelope;
use crate::error::ApiError;
use crate::models::{UpdateOrderStatusRequest, UpdateRoleRequest};
use crate::query::ListParams;
use crate::services::{dashboard, orders, products, users};
use crate::store::Db;

pub async fn get_dashboard(db: web::Data<Db>) -> Result<HttpResponse, ApiError> {
    let dashboard = dashboard::load(&db).await?;
    Ok(HttpResponse::Ok().json(Envelope::ok(dashboard)))
}

pub async fn list_products(
    db: web::Data<Db>,
    params: web::Query<ListParams>,
) -> Result<HttpResponse, ApiError> {
    debug!(?params, "admin product listing");
    listing("products", products::list_admin(&db, &params).await?)
}

pub async fn list_orders(
    db: web::Data<Db>,
    params: web::Query<ListParams>,
) -> Result<HttpResponse, ApiError> {
    debug!(?params, "admin order listing");
    listing("orders", orders::list(&db, &params).await?)
}

pub async fn update_order_status(
    db: web::Data<Db>,
    id: web::Path<i64>,
    body: web::Json<UpdateOrderStatusRequest>,
) -> Result<HttpResponse, ApiError> {
    let order = orders::update_status(&db, id.into_inner(), body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(single("order", order)?.with_message("Order status updated")))
}

pub async fn list_users(
    db: web::Data<Db>,
    params: web::Query<ListParams>,
) -> Result<HttpResponse, ApiError> {
    listing("users", users::list(&db, &params).await?)
}

pub async fn update_user_role(
    db: web::Data<Db>,
    claims: Claims,
    id: web::Path<i64>,
    body: web::Json<UpdateRoleRequest>,
) -> Result<HttpResponse, ApiError> {
    let user = users::update_role(&db, claims.sub, id.into_inner(), body.role).await?;
    Ok(HttpResponse::Ok().json(single("user", user)?.with_message("User role updated")))
}
