//! Database pool initialization.
//!
//! SYSTEM CONTEXT
//! ==============
//! The pool backs the access gate only: ticket consumption and picture
//! permission lookups. Schema and migrations belong to the REST service that
//! owns users, pictures and spaces.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Initialize the `PostgreSQL` connection pool.
///
/// # Errors
///
/// Returns an error if the connection fails.
pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}
