//! Query-string parameters to store queries.
//!
//! Handlers deserialize a [`ListParams`], the domain services pick the parts
//! that apply to their entity, and the helpers here turn them into the
//! [`Filter`]/[`Query`] shape the persistence layer consumes.

use std::fmt;
use std::str::FromStr;

use serde::ser::{Serialize, SerializeMap, Serializer};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use validator::{Validate, ValidationError};

use crate::error::ApiError;
use crate::models::{Category, OrderStatus, PaymentStatus, Role};
use crate::store::{Condition, Filter, Query, SortDir};

pub const PUBLIC_PAGE_SIZE: u64 = 12;
pub const ADMIN_PAGE_SIZE: u64 = 20;
pub const MAX_PAGE_SIZE: u64 = 100;

/// Empty values (`?category=`) are treated as absent; everything else must
/// parse.
fn blank_as_none<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

/// `f64::from_str` accepts `NaN` and `inf`, which slip past range checks.
fn finite(value: f64) -> Result<(), ValidationError> {
    if value.is_finite() {
        return Ok(());
    }
    let mut error = ValidationError::new("finite");
    error.message = Some("Price must be a finite number".into());
    Err(error)
}

#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    #[validate(range(min = 1, message = "Page must be a positive integer"))]
    #[serde(default, deserialize_with = "blank_as_none")]
    pub page: Option<u64>,
    #[validate(range(min = 1, max = 100, message = "Limit must be between 1 and 100"))]
    #[serde(default, deserialize_with = "blank_as_none")]
    pub limit: Option<u64>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default, deserialize_with = "blank_as_none")]
    pub category: Option<Category>,
    #[validate(custom = "finite")]
    #[validate(range(min = 0.0, message = "Minimum price must be a positive number"))]
    #[serde(default, deserialize_with = "blank_as_none")]
    pub min_price: Option<f64>,
    #[validate(custom = "finite")]
    #[validate(range(min = 0.0, message = "Maximum price must be a positive number"))]
    #[serde(default, deserialize_with = "blank_as_none")]
    pub max_price: Option<f64>,
    #[serde(default, deserialize_with = "blank_as_none")]
    pub featured: Option<bool>,
    #[serde(default, deserialize_with = "blank_as_none")]
    pub is_active: Option<bool>,
    #[serde(default, deserialize_with = "blank_as_none")]
    pub role: Option<Role>,
    #[serde(default, deserialize_with = "blank_as_none")]
    pub status: Option<OrderStatus>,
    #[serde(default, deserialize_with = "blank_as_none")]
    pub payment_status: Option<PaymentStatus>,
    #[serde(default)]
    pub sort_by: Option<String>,
    #[serde(default, deserialize_with = "blank_as_none")]
    pub sort_order: Option<SortDir>,
}

impl ListParams {
    /// `search` wins over its `q` alias; blank terms count as no search.
    pub fn search_term(&self) -> Option<&str> {
        self.search
            .as_deref()
            .or(self.q.as_deref())
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    pub fn pagination(&self, default_limit: u64) -> Result<Pagination, ApiError> {
        self.validate()?;
        Ok(Pagination {
            page: self.page.unwrap_or(1),
            limit: self.limit.unwrap_or(default_limit).min(MAX_PAGE_SIZE),
        })
    }

    /// Single-column ordering, restricted to `allowed` columns.
    pub fn sort(&self, allowed: &[&str]) -> Result<(String, SortDir), ApiError> {
        let column = self
            .sort_by
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or("createdAt");
        if !allowed.contains(&column) {
            return Err(ApiError::invalid(
                "sortBy",
                format!("Cannot sort by `{column}`; use one of: {}", allowed.join(", ")),
            ));
        }
        Ok((column.to_owned(), self.sort_order.unwrap_or_default()))
    }

    /// Adds `price >= minPrice` / `price <= maxPrice` as provided.
    pub fn price_range(&self, mut filter: Filter) -> Result<Filter, ApiError> {
        self.validate()?;
        if let (Some(min), Some(max)) = (self.min_price, self.max_price) {
            if min > max {
                return Err(ApiError::invalid(
                    "minPrice",
                    "Minimum price cannot exceed maximum price",
                ));
            }
        }
        if let Some(min) = self.min_price {
            filter = filter.with("price", Condition::Gte(Value::from(min)));
        }
        if let Some(max) = self.max_price {
            filter = filter.with("price", Condition::Lte(Value::from(max)));
        }
        Ok(filter)
    }
}

/// Case-insensitive substring match of `term` across `fields`, as an OR group.
pub fn search(mut filter: Filter, term: Option<&str>, fields: &[&str]) -> Filter {
    if let Some(term) = term {
        for field in fields {
            filter = filter.or(field, Condition::Contains(term.to_owned()));
        }
    }
    filter
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: u64,
    pub limit: u64,
}

impl Pagination {
    pub fn offset(&self) -> u64 {
        (self.page - 1).saturating_mul(self.limit)
    }

    pub fn apply(&self, query: Query) -> Query {
        query.page(self.limit, self.offset())
    }

    /// Metadata labelled `total<Entity>`, e.g. `totalProducts`.
    pub fn meta(&self, total: u64, label: &'static str) -> PageMeta {
        PageMeta {
            current_page: self.page,
            total_pages: total.div_ceil(self.limit),
            total,
            label,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageMeta {
    pub current_page: u64,
    pub total_pages: u64,
    pub total: u64,
    label: &'static str,
}

impl Serialize for PageMeta {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("currentPage", &self.current_page)?;
        map.serialize_entry("totalPages", &self.total_pages)?;
        map.serialize_entry(self.label, &self.total)?;
        map.end()
    }
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub meta: PageMeta,
}
