use serde::Serialize;

use super::decode_all;
use crate::error::ApiError;
use crate::models::{OrderStatus, OrderWithUser, PaymentStatus, Product, Role};
use crate::store::{Db, Filter, Query, SortDir, Table, ORDER_USER};

const RECENT: u64 = 5;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub total_users: u64,
    pub total_customers: u64,
    pub total_products: u64,
    pub total_orders: u64,
    pub pending_orders: u64,
    pub total_revenue: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dashboard {
    pub stats: Stats,
    pub recent_orders: Vec<OrderWithUser>,
    pub recent_products: Vec<Product>,
}

/// None of the queries depends on another, so all of them run at once.
pub async fn load(db: &Db) -> Result<Dashboard, ApiError> {
    let everyone = Filter::new();
    let customers = Filter::new().eq("role", Role::User.as_str());
    let active_products = Filter::new().eq("isActive", true);
    let pending = Filter::new().eq("orderStatus", OrderStatus::Pending.as_str());
    let paid = Filter::new().eq("paymentStatus", PaymentStatus::Paid.as_str());
    let recent_orders = Query::default()
        .order_by("createdAt", SortDir::Desc)
        .limit(RECENT)
        .include(ORDER_USER, &["password"]);
    let recent_products = Query::default()
        .order_by("createdAt", SortDir::Desc)
        .limit(RECENT);

    let (
        total_users,
        total_customers,
        total_products,
        total_orders,
        pending_orders,
        total_revenue,
        orders,
        products,
    ) = tokio::try_join!(
        db.count(Table::Users, &everyone),
        db.count(Table::Users, &customers),
        db.count(Table::Products, &active_products),
        db.count(Table::Orders, &everyone),
        db.count(Table::Orders, &pending),
        db.sum(Table::Orders, "total", &paid),
        db.find_all(Table::Orders, &recent_orders),
        db.find_all(Table::Products, &recent_products),
    )?;

    Ok(Dashboard {
        stats: Stats {
            total_users,
            total_customers,
            total_products,
            total_orders,
            pending_orders,
            total_revenue,
        },
        recent_orders: decode_all(orders)?,
        recent_products: decode_all(products)?,
    })
}
