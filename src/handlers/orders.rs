use actix_web::{web, HttpResponse};

use super::single;
use crate::auth::Claims;
use crate::error::ApiError;
use crate::models::PlaceOrderRequest;
use crate::services::orders;
use crate::store::Db;

pub async fn place_order(
    db: web::Data<Db>,
    claims: Claims,
    body: web::Json<PlaceOrderRequest>,
) -> Result<HttpResponse, ApiError> {
    let order = orders::place(&db, claims.sub, body.into_inner()).await?;
    Ok(HttpResponse::Created().json(single("order", order)?.with_message("Order placed successfully")))
}
