use sqlx::sqlite::SqlitePoolOptions;

use crate::database::Database;

/// In-memory database with migrations applied. Kept to a single connection
/// because every pooled connection to `sqlite::memory:` would otherwise see
/// its own empty database.
pub(crate) async fn test_database() -> Database {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("db setup");

    let database = Database::new(pool);
    database.migrate().await.expect("migrations to apply");

    database
}
