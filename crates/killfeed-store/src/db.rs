use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

use crate::error::StoreError;

/// Connection parameters, read from the process environment.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database host (`DB_HOST`).
    pub host: String,
    /// Database port (`DB_PORT`).
    pub port: u16,
    /// Database user (`DB_USER`).
    pub user: String,
    /// Database password (`DB_PASSWORD`).
    pub password: String,
    /// Database name (`DB_NAME`).
    pub database: String,
    /// Maximum pool size.
    pub max_connections: u32,
}

impl StoreConfig {
    /// Default maximum pool size.
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

    /// Read `DB_HOST`, `DB_PORT`, `DB_USER`, `DB_PASSWORD` and `DB_NAME`.
    ///
    /// Host and port fall back to `localhost:5432`; the remaining variables
    /// are required.
    pub fn from_env() -> Result<Self, StoreError> {
        fn required(name: &'static str) -> Result<String, StoreError> {
            std::env::var(name).map_err(|_| StoreError::MissingEnv(name))
        }

        let port = std::env::var("DB_PORT")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(5432);

        Ok(Self {
            host: std::env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port,
            user: required("DB_USER")?,
            password: required("DB_PASSWORD")?,
            database: required("DB_NAME")?,
            max_connections: Self::DEFAULT_MAX_CONNECTIONS,
        })
    }
}

/// Handle to the Postgres store. Cheap to clone; all methods take `&self`.
#[derive(Debug, Clone)]
pub struct Store {
    pub(crate) pool: PgPool,
}

impl Store {
    /// Connect and verify the connection.
    pub async fn connect(cfg: &StoreConfig) -> Result<Self, StoreError> {
        let options = PgConnectOptions::new()
            .host(&cfg.host)
            .port(cfg.port)
            .username(&cfg.user)
            .password(&cfg.password)
            .database(&cfg.database);

        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        tracing::info!(host = %cfg.host, database = %cfg.database, "connected to database");
        Ok(Self { pool })
    }

    /// Wrap an existing pool (used by tests).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}
