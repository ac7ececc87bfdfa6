//! Shared harness for database-backed integration tests.
//!
//! Tests run only when `DATABASE_URL` points at a Postgres instance; without
//! it they print a skip notice and pass. Each test file gets its own schema
//! so concurrent tests never see each other's rows.

use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, PgConnection, PgPool};

/// Connect, recreate `schema`, run migrations in it, and return a pool whose
/// every connection has `search_path` pinned to that schema. `None` means
/// the environment has no test database; the caller should skip.
pub async fn test_pool(schema: &str) -> Option<PgPool> {
    let url = match std::env::var("DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("skipping: DATABASE_URL not set");
            return None;
        }
    };

    let mut conn = PgConnection::connect(&url)
        .await
        .expect("failed to connect to test database");
    sqlx::query(&format!("DROP SCHEMA IF EXISTS {schema} CASCADE"))
        .execute(&mut conn)
        .await
        .expect("failed to drop test schema");
    sqlx::query(&format!("CREATE SCHEMA {schema}"))
        .execute(&mut conn)
        .await
        .expect("failed to create test schema");
    conn.close().await.ok();

    let schema_owned = schema.to_string();
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .after_connect(move |conn, _meta| {
            let schema = schema_owned.clone();
            Box::pin(async move {
                sqlx::query(&format!("SET search_path TO {schema}"))
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
        })
        .connect(&url)
        .await
        .expect("failed to build test pool");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("failed to run migrations");

    Some(pool)
}
