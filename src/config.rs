use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use dotenv::dotenv;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{key} has an invalid value `{value}`")]
    Invalid { key: &'static str, value: String },

    #[error("{0} must be set")]
    Missing(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Backend {
    Sqlite { path: PathBuf },
    Supabase { url: String, key: String },
    Mongo { uri: String, database: String },
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Sqlite { .. } => "sqlite",
            Backend::Supabase { .. } => "supabase",
            Backend::Mongo { .. } => "mongodb",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdminSeed {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: Environment,
    pub host: String,
    pub port: u16,
    pub backend: Backend,
    pub http_timeout: Duration,
    pub jwt_secret: String,
    pub bcrypt_cost: u32,
    pub admin: Option<AdminSeed>,
    pub cors_origins: Vec<String>,
    pub rate_limit_window: Duration,
    pub rate_limit_max: u32,
    pub backup_path: PathBuf,
    /// `None` disables the periodic backup.
    pub backup_interval: Option<Duration>,
}

const DEV_JWT_SECRET: &str = "storefront-development-secret";

impl AppConfig {
    /// Loads `.env` and reads the process environment.
    pub fn init() -> Result<Self, ConfigError> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let environment = match get("APP_ENV").as_deref() {
            None | Some("development") | Some("test") => Environment::Development,
            Some("production") => Environment::Production,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "APP_ENV",
                    value: other.to_owned(),
                })
            }
        };

        let backend = match get("DATABASE_BACKEND").as_deref() {
            Some("sqlite") => sqlite(&get),
            Some("supabase") => Backend::Supabase {
                url: get("SUPABASE_URL").ok_or(ConfigError::Missing("SUPABASE_URL"))?,
                key: get("SUPABASE_KEY").ok_or(ConfigError::Missing("SUPABASE_KEY"))?,
            },
            Some("mongodb") => Backend::Mongo {
                uri: get("MONGODB_URI").unwrap_or_else(|| "mongodb://localhost:27017".into()),
                database: get("DATABASE_NAME").unwrap_or_else(|| "storefront".into()),
            },
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "DATABASE_BACKEND",
                    value: other.to_owned(),
                })
            }
            None => match (get("SUPABASE_URL"), get("SUPABASE_KEY")) {
                (Some(url), Some(key)) => Backend::Supabase { url, key },
                _ => sqlite(&get),
            },
        };

        let jwt_secret = match (get("JWT_SECRET"), environment) {
            (Some(secret), _) => secret,
            (None, Environment::Production) => return Err(ConfigError::Missing("JWT_SECRET")),
            (None, Environment::Development) => DEV_JWT_SECRET.to_owned(),
        };

        let admin = match (get("ADMIN_EMAIL"), get("ADMIN_PASSWORD")) {
            (Some(email), Some(password)) => Some(AdminSeed {
                name: get("ADMIN_NAME").unwrap_or_else(|| "Administrator".into()),
                email,
                password,
            }),
            _ => None,
        };

        let cors_origins: Vec<String> = get("CORS_ORIGINS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|o| !o.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        let backup_secs: u64 = parse(&get, "BACKUP_INTERVAL_SECS", 3600)?;

        Ok(Self {
            environment,
            host: get("HOST").unwrap_or_else(|| "127.0.0.1".into()),
            port: parse(&get, "PORT", 8080)?,
            backend,
            http_timeout: Duration::from_secs(parse(&get, "HTTP_TIMEOUT_SECS", 10)?),
            jwt_secret,
            bcrypt_cost: parse(&get, "BCRYPT_COST", bcrypt::DEFAULT_COST)?,
            admin,
            cors_origins: if cors_origins.is_empty() {
                vec!["http://localhost:3000".to_owned()]
            } else {
                cors_origins
            },
            rate_limit_window: Duration::from_secs(parse(&get, "RATE_LIMIT_WINDOW_SECS", 900)?),
            rate_limit_max: parse(&get, "RATE_LIMIT_MAX", 100)?,
            backup_path: get("BACKUP_PATH")
                .map_or_else(|| PathBuf::from("./data/backup.json"), PathBuf::from),
            backup_interval: (backup_secs > 0).then(|| Duration::from_secs(backup_secs)),
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }
}

fn sqlite(get: &impl Fn(&str) -> Option<String>) -> Backend {
    Backend::Sqlite {
        path: get("DATABASE_PATH")
            .map_or_else(|| PathBuf::from("./data/storefront.db"), PathBuf::from),
    }
}

fn parse<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_to_local_sqlite_in_development() {
        let config = config(&[]).unwrap();

        assert_eq!(config.environment, Environment::Development);
        assert_eq!(
            config.backend,
            Backend::Sqlite {
                path: PathBuf::from("./data/storefront.db")
            }
        );
        assert_eq!(config.port, 8080);
        assert_eq!(config.cors_origins, ["http://localhost:3000"]);
        assert_eq!(config.rate_limit_max, 100);
        assert_eq!(config.backup_interval, Some(Duration::from_secs(3600)));
        assert!(config.admin.is_none());
    }

    #[test]
    fn supabase_credentials_select_the_rest_backend() {
        let config = config(&[
            ("SUPABASE_URL", "https://abc.supabase.co"),
            ("SUPABASE_KEY", "service-key"),
        ])
        .unwrap();

        assert_eq!(config.backend.name(), "supabase");
    }

    #[test]
    fn production_requires_a_jwt_secret() {
        let err = config(&[("APP_ENV", "production")]).unwrap_err();
        assert_eq!(err, ConfigError::Missing("JWT_SECRET"));

        let config = config(&[("APP_ENV", "production"), ("JWT_SECRET", "s3cr3t")]).unwrap();
        assert!(config.is_production());
    }

    #[test]
    fn rejects_malformed_numbers_and_backends() {
        assert!(matches!(
            config(&[("PORT", "eighty")]),
            Err(ConfigError::Invalid { key: "PORT", .. })
        ));
        assert!(matches!(
            config(&[("DATABASE_BACKEND", "oracle")]),
            Err(ConfigError::Invalid { key: "DATABASE_BACKEND", .. })
        ));
    }

    #[test]
    fn splits_cors_origins_and_disables_backup() {
        let config = config(&[
            ("CORS_ORIGINS", "https://shop.example.com, https://admin.example.com,"),
            ("BACKUP_INTERVAL_SECS", "0"),
            ("ADMIN_EMAIL", "admin@example.com"),
            ("ADMIN_PASSWORD", "changeme123"),
        ])
        .unwrap();

        assert_eq!(
            config.cors_origins,
            ["https://shop.example.com", "https://admin.example.com"]
        );
        assert_eq!(config.backup_interval, None);
        assert_eq!(config.admin.unwrap().name, "Administrator");
    }
}
