mod models;
mod retention;
mod schema;
mod settings;
mod tasks;

pub use models::{NewTaskRecord, RetentionRecord, TaskListFilter, TaskRecord, TaskUpdate};

use anyhow::{Context, Result, anyhow};
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations");

/// SQLite-backed store for tasks, retention records, and settings.
/// Schema management goes through Diesel's embedded migrations.
pub struct Database {
    pool: Arc<Pool<ConnectionManager<SqliteConnection>>>,
}

impl Database {
    /// Create or open the database at a specific path.
    /// The schema is migrated to the latest version on startup.
    pub fn with_path(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database parent dir {}", parent.display())
            })?;
        }

        let database_url = path
            .to_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("Invalid database path"))?;

        run_migrations(&database_url)?;

        let manager = ConnectionManager::<SqliteConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .context("Failed to build database connection pool")?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// In-memory database for tests. The pool is capped at one connection
    /// and migrations run against it, since every fresh `:memory:`
    /// connection starts with an empty schema.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let manager = ConnectionManager::<SqliteConnection>::new(":memory:");
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .context("Failed to build in-memory pool")?;
        {
            let mut conn = pool.get().context("Failed to get in-memory connection")?;
            conn.run_pending_migrations(MIGRATIONS)
                .map_err(|err| anyhow!("Failed to migrate in-memory database: {err}"))?;
        }
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    pub(crate) fn connection(
        &self,
    ) -> Result<PooledConnection<ConnectionManager<SqliteConnection>>> {
        self.pool
            .get()
            .context("Failed to get connection from database pool")
    }
}

fn run_migrations(database_url: &str) -> Result<()> {
    use diesel::Connection;
    let mut conn = SqliteConnection::establish(database_url)
        .with_context(|| format!("Failed to open database at {}", database_url))?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|err| anyhow!("Failed to run database migrations: {err}"))?;
    Ok(())
}
