//! Fixtures shared by unit tests.

use std::sync::Arc;

use crate::models::{Address, Category, CreateProductRequest, OrderLine, PaymentMethod, PlaceOrderRequest};
use crate::store::sqlite::SqliteStore;
use crate::store::Db;

pub async fn memory_db() -> Db {
    Db::new(Arc::new(SqliteStore::in_memory().await.unwrap()))
}

pub fn product_request(name: &str, category: Category, price: f64) -> CreateProductRequest {
    CreateProductRequest {
        name: name.to_owned(),
        description: format!("{name} for everyday use"),
        price,
        original_price: None,
        category,
        subcategory: None,
        brand: None,
        model: None,
        images: Vec::new(),
        specifications: Default::default(),
        features: Vec::new(),
        stock: 5,
        sku: None,
        tags: Vec::new(),
        is_active: true,
        is_featured: false,
    }
}

pub fn order_request(product_id: i64, quantity: u32) -> PlaceOrderRequest {
    PlaceOrderRequest {
        items: vec![OrderLine {
            product_id,
            quantity,
        }],
        shipping_address: Address {
            full_name: "Achieng Otieno".into(),
            phone: "0712345678".into(),
            street: "Kenyatta Ave".into(),
            city: "Nairobi".into(),
            state: None,
            postal_code: None,
            country: "Kenya".into(),
        },
        billing_address: None,
        payment_method: PaymentMethod::Cash,
        notes: None,
    }
}
