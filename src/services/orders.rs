//! Checkout and order administration.
//!
//! Stock is reserved line by line with the backend's atomic conditional
//! decrement. A line that cannot be covered rolls back every reservation made
//! so far, so concurrent checkouts can never push stock below zero.

use std::collections::HashMap;

use chrono::Utc;
use rand::Rng;
use serde_json::{json, Value};
use tracing::{error, info, warn};
use validator::Validate;

use super::decode_all;
use crate::error::ApiError;
use crate::models::{
    Order, OrderItem, OrderStatus, OrderWithUser, PaymentStatus, PlaceOrderRequest, Product,
    UpdateOrderStatusRequest,
};
use crate::query::{search, ListParams, Page, ADMIN_PAGE_SIZE};
use crate::store::{
    from_row, now_timestamp, to_row, Condition, Db, Filter, Query, Row, StoreError, Table,
    ORDER_USER,
};

const SORTABLE: &[&str] = &[
    "createdAt",
    "updatedAt",
    "orderNumber",
    "total",
    "orderStatus",
    "paymentStatus",
];

pub const FREE_SHIPPING_FROM: f64 = 10_000.0;
pub const SHIPPING_FEE: f64 = 300.0;
pub const TAX_RATE: f64 = 0.16;

const ORDER_NUMBER_ATTEMPTS: usize = 3;

/// Ceiling on customers an order search may expand into. Their ids become a
/// `userId IN (...)` list, which has to fit a URL on the REST backend and
/// the bind-parameter limit on SQLite.
pub const MAX_CUSTOMER_MATCHES: usize = 200;

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Totals {
    pub subtotal: f64,
    pub shipping_cost: f64,
    pub tax: f64,
    pub discount: f64,
    pub total: f64,
}

impl Totals {
    pub fn for_items(items: &[OrderItem]) -> Self {
        let subtotal = round_cents(
            items
                .iter()
                .map(|i| i.price * f64::from(i.quantity))
                .sum(),
        );
        let shipping_cost = if subtotal >= FREE_SHIPPING_FROM {
            0.0
        } else {
            SHIPPING_FEE
        };
        let tax = round_cents(subtotal * TAX_RATE);
        let discount = 0.0;
        Self {
            subtotal,
            shipping_cost,
            tax,
            discount,
            total: round_cents(subtotal + shipping_cost + tax - discount),
        }
    }
}

/// `GST-<last 6 digits of the ms timestamp>-<3 random digits>`.
pub fn order_number() -> String {
    let millis = Utc::now().timestamp_millis() % 1_000_000;
    let suffix: u16 = rand::thread_rng().gen_range(0..1000);
    format!("GST-{millis:06}-{suffix:03}")
}

pub async fn list(db: &Db, params: &ListParams) -> Result<Page<OrderWithUser>, ApiError> {
    let pagination = params.pagination(ADMIN_PAGE_SIZE)?;
    let mut filter = Filter::new();
    if let Some(status) = params.status {
        filter = filter.eq("orderStatus", status.as_str());
    }
    if let Some(payment) = params.payment_status {
        filter = filter.eq("paymentStatus", payment.as_str());
    }
    if let Some(term) = params.search_term() {
        filter = filter.or("orderNumber", Condition::Contains(term.to_owned()));
        let customers = customer_ids(db, term).await?;
        if !customers.is_empty() {
            filter = filter.or("userId", Condition::In(customers));
        }
    }

    let (column, dir) = params.sort(SORTABLE)?;
    let query = pagination
        .apply(Query::new(filter).order_by(&column, dir))
        .include(ORDER_USER, &["password"]);
    let found = db.find_and_count_all(Table::Orders, &query).await?;

    Ok(Page {
        items: decode_all(found.rows)?,
        meta: pagination.meta(found.count, "totalOrders"),
    })
}

/// Ids of users whose name or email contains `term`. A term matching more
/// than [`MAX_CUSTOMER_MATCHES`] customers is rejected rather than truncated.
async fn customer_ids(db: &Db, term: &str) -> Result<Vec<Value>, ApiError> {
    let query = Query::new(search(Filter::new(), Some(term), &["name", "email"]))
        .exclude(&["password"])
        .limit(MAX_CUSTOMER_MATCHES as u64 + 1);
    let users = db.find_all(Table::Users, &query).await?;
    if users.len() > MAX_CUSTOMER_MATCHES {
        return Err(ApiError::invalid(
            "search",
            format!("Search matches more than {MAX_CUSTOMER_MATCHES} customers; use a more specific term"),
        ));
    }
    Ok(users
        .into_iter()
        .filter_map(|mut u| u.remove("id"))
        .collect())
}

pub async fn find(db: &Db, id: i64) -> Result<OrderWithUser, ApiError> {
    let query = Query::new(Filter::new().eq("id", id))
        .limit(1)
        .include(ORDER_USER, &["password"]);
    let row = db
        .find_all(Table::Orders, &query)
        .await?
        .pop()
        .ok_or(ApiError::NotFound("Order"))?;
    Ok(from_row(row)?)
}

/// Quantities of repeated products are added up, first occurrence order kept.
fn merge_lines(request: &PlaceOrderRequest) -> Vec<(i64, u32)> {
    let mut merged: Vec<(i64, u32)> = Vec::with_capacity(request.items.len());
    for line in &request.items {
        match merged.iter_mut().find(|(id, _)| *id == line.product_id) {
            Some((_, quantity)) => *quantity = quantity.saturating_add(line.quantity),
            None => merged.push((line.product_id, line.quantity)),
        }
    }
    merged
}

pub async fn place(db: &Db, user_id: i64, request: PlaceOrderRequest) -> Result<Order, ApiError> {
    request.validate()?;
    let lines = merge_lines(&request);

    let ids = lines.iter().map(|(id, _)| Value::from(*id)).collect();
    let rows = db
        .find_all(
            Table::Products,
            &Query::new(Filter::new().with("id", Condition::In(ids))),
        )
        .await?;
    let products: HashMap<i64, Product> = decode_all::<Product>(rows)?
        .into_iter()
        .map(|p| (p.id, p))
        .collect();

    let mut items = Vec::with_capacity(lines.len());
    for (id, quantity) in lines {
        let product = products
            .get(&id)
            .filter(|p| p.is_active)
            .ok_or_else(|| ApiError::invalid("items", format!("Product {id} is not available")))?;
        items.push(OrderItem {
            product: id,
            name: product.name.clone(),
            quantity,
            price: product.price,
            image: product.primary_image().map(|i| i.url.clone()),
        });
    }

    reserve_stock(db, &items).await?;

    let totals = Totals::for_items(&items);
    let mut attempt = 0;
    let created = loop {
        attempt += 1;
        let row = to_row(&json!({
            "orderNumber": order_number(),
            "userId": user_id,
            "items": items,
            "shippingAddress": request.shipping_address,
            "billingAddress": request.billing_address,
            "paymentMethod": request.payment_method,
            "paymentStatus": PaymentStatus::Pending,
            "orderStatus": OrderStatus::Pending,
            "subtotal": totals.subtotal,
            "shippingCost": totals.shipping_cost,
            "tax": totals.tax,
            "discount": totals.discount,
            "total": totals.total,
            "notes": request.notes,
        }))?;
        match db.create(Table::Orders, row).await {
            Ok(row) => break row,
            Err(StoreError::Duplicate) if attempt < ORDER_NUMBER_ATTEMPTS => {
                warn!(attempt, "order number collision, regenerating");
            }
            Err(e) => {
                release_stock(db, &items).await;
                return Err(e.into());
            }
        }
    };

    let order: Order = from_row(created)?;
    info!(
        id = order.id,
        order_number = %order.order_number,
        user_id,
        total = order.total,
        "order placed"
    );
    Ok(order)
}

async fn reserve_stock(db: &Db, items: &[OrderItem]) -> Result<(), ApiError> {
    for (index, item) in items.iter().enumerate() {
        let failure = match db.adjust_stock(item.product, -i64::from(item.quantity)).await {
            Ok(true) => continue,
            Ok(false) => ApiError::Conflict(format!("Insufficient stock for {}", item.name)),
            Err(e) => e.into(),
        };
        release_stock(db, &items[..index]).await;
        return Err(failure);
    }
    Ok(())
}

async fn release_stock(db: &Db, items: &[OrderItem]) {
    for item in items {
        if let Err(e) = db.adjust_stock(item.product, i64::from(item.quantity)).await {
            error!(product = item.product, quantity = item.quantity, error = %e, "failed to release reserved stock");
        }
    }
}

pub async fn update_status(
    db: &Db,
    id: i64,
    request: UpdateOrderStatusRequest,
) -> Result<OrderWithUser, ApiError> {
    let current: Order = from_row(
        db.find_by_pk(Table::Orders, id)
            .await?
            .ok_or(ApiError::NotFound("Order"))?,
    )?;

    let from = current.order_status;
    let to = request.status;
    if !from.can_transition_to(to) {
        return Err(ApiError::invalid(
            "status",
            format!("Cannot change order status from {from} to {to}"),
        ));
    }

    let mut changes = Row::new();
    if from != to {
        changes.insert("orderStatus".into(), Value::from(to.as_str()));
        if to == OrderStatus::Delivered {
            changes.insert("deliveredAt".into(), now_timestamp());
        }
    }
    if let Some(payment) = request.payment_status {
        changes.insert("paymentStatus".into(), Value::from(payment.as_str()));
    }
    if let Some(tracking) = request.tracking_number {
        changes.insert("trackingNumber".into(), Value::from(tracking));
    }

    if !changes.is_empty() {
        db.update(Table::Orders, id, changes).await?;
        info!(id, %from, %to, "order status updated");
    }
    find(db, id).await
}
