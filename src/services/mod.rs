//! Domain queries and commands on top of [`crate::store::Db`].
//!
//! Each service fixes its baseline predicate, maps rows to typed models and
//! reports failures as [`crate::error::ApiError`].

pub mod dashboard;
pub mod orders;
pub mod products;
pub mod users;

use serde::de::DeserializeOwned;

use crate::error::ApiError;
use crate::store::{from_row, Row};

fn decode_all<T: DeserializeOwned>(rows: Vec<Row>) -> Result<Vec<T>, ApiError> {
    rows.into_iter()
        .map(|row| from_row(row).map_err(ApiError::from))
        .collect()
}
