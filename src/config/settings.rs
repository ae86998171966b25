//! Process settings: optional JSON defaults file, then environment, then `.env`.

use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_subscriber::EnvFilter;

use crate::error::AppError;
use crate::sql::Table;

pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_RECONCILE_CONCURRENCY: usize = 8;
pub const DEFAULT_LOG: &str = "dataops=info";

/// Shape of the file named by `DATAOPS_CONFIG`. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileDefaults {
    pub database_url: Option<String>,
    pub schema: Option<String>,
    pub max_connections: Option<u32>,
    pub reconcile_concurrency: Option<usize>,
    pub log: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub database_url: String,
    /// Schema applied to tables built through [`Settings::table`].
    pub schema: Option<String>,
    pub max_connections: u32,
    pub reconcile_concurrency: usize,
    pub log: String,
}

impl Settings {
    /// Read `.env`, the defaults file if any, and the environment.
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();
        let file = match std::env::var("DATAOPS_CONFIG") {
            Ok(path) if !path.trim().is_empty() => FileDefaults::load(&path)?,
            _ => FileDefaults::default(),
        };
        Settings::resolve(file, |key| std::env::var(key).ok())
    }

    /// Merge file defaults with variables from `lookup`; variables win.
    pub fn resolve<F>(file: FileDefaults, lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let database_url = var("DATABASE_URL")
            .or(file.database_url)
            .ok_or_else(|| AppError::config("DATABASE_URL is not set"))?;
        let max_connections = match var("DATAOPS_MAX_CONNECTIONS") {
            Some(v) => parse_number("DATAOPS_MAX_CONNECTIONS", &v)?,
            None => file.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
        };
        let reconcile_concurrency = match var("DATAOPS_RECONCILE_CONCURRENCY") {
            Some(v) => parse_number("DATAOPS_RECONCILE_CONCURRENCY", &v)?,
            None => file.reconcile_concurrency.unwrap_or(DEFAULT_RECONCILE_CONCURRENCY),
        };
        Ok(Settings {
            database_url,
            schema: var("DATAOPS_SCHEMA").or(file.schema),
            max_connections: max_connections.max(1),
            reconcile_concurrency: reconcile_concurrency.max(1),
            log: var("DATAOPS_LOG").or(file.log).unwrap_or_else(|| DEFAULT_LOG.into()),
        })
    }

    pub async fn connect(&self) -> Result<PgPool, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .connect(&self.database_url)
            .await?;
        tracing::info!(max_connections = self.max_connections, "connected to database");
        Ok(pool)
    }

    pub fn table(&self, name: &str) -> Table {
        match &self.schema {
            Some(schema) => Table::in_schema(schema.clone(), name),
            None => Table::new(name),
        }
    }
}

impl FileDefaults {
    pub fn load(path: &str) -> Result<Self, AppError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AppError::config(format!("cannot read {}: {}", path, e)))?;
        serde_json::from_str(&text).map_err(|e| AppError::config(format!("invalid {}: {}", path, e)))
    }
}

fn parse_number<N: std::str::FromStr>(key: &str, v: &str) -> Result<N, AppError> {
    v.trim()
        .parse()
        .map_err(|_| AppError::config(format!("{} must be a positive integer, got {}", key, v)))
}

/// Install the fmt subscriber. `RUST_LOG` wins over `settings.log`.
/// A no-op when a global subscriber is already set.
pub fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
