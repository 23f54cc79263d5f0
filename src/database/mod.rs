pub mod custom_types;
mod sqlite;

use std::ops::Deref;

use sqlx::SqlitePool;

#[derive(Clone)]
pub struct Database(SqlitePool);

impl Database {
    pub async fn connect(db_url: &url::Url) -> Result<Self, DatabaseSetupError> {
        if db_url.scheme() == "sqlite" {
            let pool = sqlite::connect_sqlite(db_url.as_str()).await?;
            sqlite::migrate_sqlite(&pool).await?;
            return Ok(Database::new(pool));
        }

        Err(DatabaseSetupError::UnknownDbType(
            db_url.scheme().to_string(),
        ))
    }

    pub fn new(pool: SqlitePool) -> Self {
        Self(pool)
    }

    /// Migrations normally run during `connect`; tests building their pool by
    /// hand use this to bring an in-memory database up to date.
    pub async fn migrate(&self) -> Result<(), DatabaseSetupError> {
        sqlite::migrate_sqlite(&self.0).await
    }
}

impl Deref for Database {
    type Target = SqlitePool;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DatabaseSetupError {
    #[error("provided database url wasn't usable: {0}")]
    BadUrl(sqlx::Error),

    #[error("error occurred while attempting database migration: {0}")]
    MigrationFailed(sqlx::migrate::MigrateError),

    #[error("unable to perform initial connection and check of the database: {0}")]
    Unavailable(sqlx::Error),

    #[error("requested database type was not recognized: {0}")]
    UnknownDbType(String),
}
