mod auth;
mod backup;
mod config;
mod envelope;
mod error;
mod handlers;
mod models;
mod query;
mod rate_limit;
mod routes;
mod services;
mod store;
#[cfg(test)]
mod testing;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::http::{header, StatusCode};
use actix_web::middleware::{Condition, ErrorHandlers};
use actix_web::{rt, web, App, HttpServer};
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::EnvFilter;

use crate::auth::Auth;
use crate::config::{AppConfig, Backend};
use crate::rate_limit::RateLimit;
use crate::store::mongo::MongoStore;
use crate::store::rest::RestStore;
use crate::store::sqlite::SqliteStore;
use crate::store::{Db, Store, StoreError};

const DEFAULT_LOG_FILTER: &str = "info,actix_web=info,storefront_api=debug";
const LIMITER_SWEEP_EVERY: Duration = Duration::from_secs(60);

async fn connect(config: &AppConfig) -> Result<Arc<dyn Store>, StoreError> {
    let store: Arc<dyn Store> = match &config.backend {
        Backend::Sqlite { path } => Arc::new(SqliteStore::open(path).await?),
        Backend::Supabase { url, key } => Arc::new(RestStore::new(url, key, config.http_timeout)?),
        Backend::Mongo { uri, database } => Arc::new(MongoStore::connect(uri, database).await?),
    };
    Ok(store)
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let config = AppConfig::init().map_err(io::Error::other)?;
    info!(
        backend = config.backend.name(),
        production = config.is_production(),
        "starting storefront API"
    );

    let db = Db::new(connect(&config).await.map_err(io::Error::other)?);
    info!(backend = db.backend(), "persistence ready");

    match backup::restore_if_empty(&db, &config.backup_path).await {
        Ok(Some(restored)) => info!(?restored, "store seeded from backup"),
        Ok(None) => {}
        Err(e) => warn!(error = %e, path = %config.backup_path.display(), "backup restore failed"),
    }

    let auth = web::Data::new(Auth::new(&config.jwt_secret, config.bcrypt_cost));
    if let Some(seed) = &config.admin {
        if let Err(e) = auth::ensure_admin(&db, &auth, seed).await {
            error!(error = %e, "could not bootstrap admin account");
        }
    }

    if let Some(every) = config.backup_interval {
        rt::spawn(backup::run_periodic(db.clone(), config.backup_path.clone(), every));
    }

    let limiter = rate_limit::limiter(config.rate_limit_window, config.rate_limit_max)
        .ok_or_else(|| io::Error::other("RATE_LIMIT_MAX and RATE_LIMIT_WINDOW_SECS must be positive"))?;
    rt::spawn(rate_limit::sweep(limiter.clone(), LIMITER_SWEEP_EVERY));

    let production = config.is_production();
    let origins = config.cors_origins.clone();
    let db = web::Data::new(db);

    info!(host = %config.host, port = config.port, "listening");
    HttpServer::new(move || {
        let cors = origins
            .iter()
            .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin))
            .allowed_methods(vec!["GET", "POST", "PUT", "DELETE", "OPTIONS"])
            .allowed_headers(vec![header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
            .supports_credentials()
            .max_age(3600);

        App::new()
            .app_data(db.clone())
            .app_data(auth.clone())
            .wrap(Condition::new(
                production,
                ErrorHandlers::new().handler(StatusCode::INTERNAL_SERVER_ERROR, error::redact_internal),
            ))
            .wrap(RateLimit::new(limiter.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .configure(routes::configure)
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await
}
