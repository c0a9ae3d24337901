//! Postgres persistence for tenant bindings.
//!
//! The database is optional: it is only opened when placement runs in
//! binding mode. Schema lives in `migrations/` next to this crate and is
//! applied at startup in dev mode.

mod bindings;
mod error;

pub use bindings::PgBindingStore;
pub use error::DbError;

use std::path::PathBuf;
use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};

/// Connection settings for the binding database.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/lbaas".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl DbConfig {
    /// Read `DATABASE_URL`, `DB_MAX_CONNECTIONS` and `DB_MIN_CONNECTIONS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let number = |key: &str, fallback: u32| {
            std::env::var(key)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(fallback)
        };

        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            max_connections: number("DB_MAX_CONNECTIONS", defaults.max_connections),
            min_connections: number("DB_MIN_CONNECTIONS", defaults.min_connections),
            acquire_timeout: defaults.acquire_timeout,
        }
    }
}

/// Pooled handle to the binding database.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        info!(
            max_connections = config.max_connections,
            "Connecting to binding database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .map_err(DbError::Connect)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }

    /// Apply the bundled migrations.
    ///
    /// Looks in `./migrations` first, then in this crate's source directory.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        let candidates = [
            PathBuf::from("./migrations"),
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        ];

        let mut last_error = None;
        for dir in &candidates {
            match sqlx::migrate::Migrator::new(dir.clone()).await {
                Ok(migrator) => {
                    migrator.run(&self.pool).await.map_err(DbError::Migration)?;
                    info!(migrations_dir = %dir.display(), "Migrations applied");
                    return Ok(());
                }
                Err(e) => {
                    debug!(migrations_dir = %dir.display(), error = %e, "No migrations here");
                    last_error = Some(e.to_string());
                }
            }
        }

        Err(DbError::MigrationDirNotFound {
            tried: candidates
                .iter()
                .map(|d| d.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            last_error: last_error.unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    pub fn binding_store(&self) -> PgBindingStore {
        PgBindingStore::new(self.pool.clone())
    }
}
