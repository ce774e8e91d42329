use serde_json::json;
use tracing::info;

use super::decode_all;
use crate::error::ApiError;
use crate::models::{PublicUser, Role, User};
use crate::query::{search, ListParams, Page, ADMIN_PAGE_SIZE};
use crate::store::{from_row, to_row, Db, Filter, Query, Table};

const SEARCH_FIELDS: &[&str] = &["name", "email"];
const SORTABLE: &[&str] = &["createdAt", "updatedAt", "name", "email", "role"];

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub async fn list(db: &Db, params: &ListParams) -> Result<Page<PublicUser>, ApiError> {
    let pagination = params.pagination(ADMIN_PAGE_SIZE)?;
    let mut filter = Filter::new();
    if let Some(role) = params.role {
        filter = filter.eq("role", role.as_str());
    }
    if let Some(active) = params.is_active {
        filter = filter.eq("isActive", active);
    }
    let filter = search(filter, params.search_term(), SEARCH_FIELDS);

    let (column, dir) = params.sort(SORTABLE)?;
    let query = pagination
        .apply(Query::new(filter).order_by(&column, dir))
        .exclude(&["password"]);
    let found = db.find_and_count_all(Table::Users, &query).await?;

    Ok(Page {
        items: decode_all(found.rows)?,
        meta: pagination.meta(found.count, "totalUsers"),
    })
}

pub async fn find(db: &Db, id: i64) -> Result<User, ApiError> {
    let row = db
        .find_by_pk(Table::Users, id)
        .await?
        .ok_or(ApiError::NotFound("User"))?;
    Ok(from_row(row)?)
}

pub async fn find_by_email(db: &Db, email: &str) -> Result<Option<User>, ApiError> {
    let query = Query::new(Filter::new().eq("email", normalize_email(email))).limit(1);
    let mut rows = db.find_all(Table::Users, &query).await?;
    match rows.pop() {
        Some(row) => Ok(Some(from_row(row)?)),
        None => Ok(None),
    }
}

/// Stores a user whose password has already been hashed.
pub async fn create(
    db: &Db,
    name: &str,
    email: &str,
    password_hash: String,
    role: Role,
) -> Result<User, ApiError> {
    let row = to_row(&json!({
        "name": name.trim(),
        "email": normalize_email(email),
        "password": password_hash,
        "role": role,
        "isActive": true,
    }))?;
    let user: User = from_row(db.create(Table::Users, row).await?)?;
    info!(id = user.id, role = %user.role, "user created");
    Ok(user)
}

pub async fn set_phone(db: &Db, id: i64, phone: &str) -> Result<(), ApiError> {
    let changes = to_row(&json!({ "phone": phone.trim() }))?;
    if db.update(Table::Users, id, changes).await? == 0 {
        return Err(ApiError::NotFound("User"));
    }
    Ok(())
}

pub async fn update_role(
    db: &Db,
    actor_id: i64,
    id: i64,
    role: Role,
) -> Result<PublicUser, ApiError> {
    if actor_id == id {
        return Err(ApiError::BadRequest("You cannot change your own role".into()));
    }
    let mut user = find(db, id).await?;
    if user.role != role {
        db.update(Table::Users, id, to_row(&json!({ "role": role }))?)
            .await?;
        info!(id, %role, "user role changed");
        user.role = role;
    }
    Ok(user.into())
}
