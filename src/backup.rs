//! Periodic JSON snapshots of every table, and restore on an empty store.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::store::{now_string, BulkOptions, Db, Filter, Query, Row, SortDir, StoreError, Table};

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup file i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("backup file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("could not move backup into place: {0}")]
    Persist(#[from] tempfile::PersistError),

    #[error("backup task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub created_at: String,
    pub users: Vec<Row>,
    pub products: Vec<Row>,
    pub orders: Vec<Row>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Restored {
    pub users: usize,
    pub products: usize,
    pub orders: usize,
    pub key_resets: Vec<String>,
}

pub async fn snapshot(db: &Db) -> Result<Snapshot, StoreError> {
    let by_id = Query::default().order_by("id", SortDir::Asc);
    let (users, products, orders) = tokio::try_join!(
        db.find_all(Table::Users, &by_id),
        db.find_all(Table::Products, &by_id),
        db.find_all(Table::Orders, &by_id),
    )?;
    Ok(Snapshot {
        created_at: now_string(),
        users,
        products,
        orders,
    })
}

/// Writes to a temporary file next to `path` and renames it over the old
/// backup, so a crash mid-write never leaves a truncated file behind.
pub async fn write(db: &Db, path: &Path) -> Result<Snapshot, BackupError> {
    let snapshot = snapshot(db).await?;
    let bytes = serde_json::to_vec_pretty(&snapshot)?;
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<(), BackupError> {
        let dir = path
            .parent()
            .filter(|d| !d.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        std::fs::create_dir_all(&dir)?;
        let mut file = NamedTempFile::new_in(&dir)?;
        file.write_all(&bytes)?;
        file.as_file().sync_all()?;
        file.persist(&path)?;
        Ok(())
    })
    .await??;

    Ok(snapshot)
}

/// Loads the backup at `path` when the store has neither users nor products.
/// Rows that collide with existing unique values are skipped. Rows keep their
/// ids; where the backend's key generator does not follow explicit ids
/// (Supabase), the reset statement for each restored table is logged and
/// returned in [`Restored::key_resets`].
pub async fn restore_if_empty(db: &Db, path: &Path) -> Result<Option<Restored>, BackupError> {
    if !tokio::fs::try_exists(path).await? {
        return Ok(None);
    }
    let everything = Filter::new();
    let (users, products) = tokio::try_join!(
        db.count(Table::Users, &everything),
        db.count(Table::Products, &everything),
    )?;
    if users > 0 || products > 0 {
        info!(users, products, "store already populated, skipping restore");
        return Ok(None);
    }

    let snapshot: Snapshot = serde_json::from_slice(&tokio::fs::read(path).await?)?;
    let options = BulkOptions {
        ignore_duplicates: true,
    };
    let users = db.bulk_create(Table::Users, snapshot.users, options).await?.len();
    let products = db
        .bulk_create(Table::Products, snapshot.products, options)
        .await?
        .len();
    let orders = db.bulk_create(Table::Orders, snapshot.orders, options).await?.len();

    let restored_tables = [
        (Table::Users, users),
        (Table::Products, products),
        (Table::Orders, orders),
    ];
    let key_resets: Vec<String> = restored_tables
        .into_iter()
        .filter(|&(_, rows)| rows > 0)
        .filter_map(|(table, _)| db.key_reset_statement(table))
        .collect();
    for statement in &key_resets {
        warn!(%statement, "restored explicit ids; run this before accepting new rows");
    }

    let restored = Restored {
        users,
        products,
        orders,
        key_resets,
    };
    info!(
        from = %snapshot.created_at,
        users = restored.users,
        products = restored.products,
        orders = restored.orders,
        "restored backup"
    );
    Ok(Some(restored))
}

pub async fn run_periodic(db: Db, path: PathBuf, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match write(&db, &path).await {
            Ok(snapshot) => info!(
                path = %path.display(),
                users = snapshot.users.len(),
                products = snapshot.products.len(),
                orders = snapshot.orders.len(),
                "wrote backup"
            ),
            Err(BackupError::Store(e)) => warn!(error = %e, "backup skipped, store unavailable"),
            Err(e) => error!(error = %e, path = %path.display(), "backup failed"),
        }
    }
}
