//! Postgres pool setup and idempotent schema bootstrap, following the same
//! `CREATE TABLE IF NOT EXISTS` startup pattern used elsewhere in this
//! workspace. Nested, schema-light substructures (`config`, `events`,
//! `files`, `container`) are stored as `JSONB`, the idiomatic way this
//! codebase persists document-shaped data.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{error, info};

pub fn ensure_sslmode_disable(url: &str) -> String {
    if url.contains("sslmode=") {
        url.to_string()
    } else if url.contains('?') {
        format!("{url}&sslmode=disable")
    } else {
        format!("{url}?sslmode=disable")
    }
}

pub async fn init_pool(database_url: &str) -> PgPool {
    let db_url = ensure_sslmode_disable(database_url);
    match PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&db_url)
        .await
    {
        Ok(pool) => pool,
        Err(e) => {
            error!(%e, "failed to connect to Postgres");
            std::process::exit(1);
        }
    }
}

pub async fn init_schema(pool: &PgPool) {
    let statements = [
        "CREATE TABLE IF NOT EXISTS schedules (
            name TEXT PRIMARY KEY,
            enabled BOOLEAN NOT NULL DEFAULT true,
            config JSONB NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS requested_tasks (
            id UUID PRIMARY KEY,
            schedule_name TEXT,
            config JSONB NOT NULL,
            requested_by TEXT,
            priority INT NOT NULL DEFAULT 0,
            worker TEXT,
            timestamp_requested TIMESTAMPTZ NOT NULL,
            timestamp_reserved TIMESTAMPTZ,
            events JSONB NOT NULL DEFAULT '[]'
        )",
        "CREATE INDEX IF NOT EXISTS requested_tasks_sort_idx
            ON requested_tasks (priority DESC, timestamp_reserved DESC, timestamp_requested DESC)",
        "CREATE TABLE IF NOT EXISTS tasks (
            id UUID PRIMARY KEY,
            schedule_name TEXT,
            config JSONB NOT NULL,
            requested_by TEXT,
            priority INT NOT NULL,
            worker TEXT NOT NULL,
            status TEXT NOT NULL,
            timestamp_requested TIMESTAMPTZ NOT NULL,
            timestamp_reserved TIMESTAMPTZ NOT NULL,
            events JSONB NOT NULL,
            container JSONB NOT NULL DEFAULT '{}',
            files JSONB NOT NULL DEFAULT '{}',
            debug JSONB NOT NULL DEFAULT 'null'
        )",
        "CREATE INDEX IF NOT EXISTS tasks_status_idx
            ON tasks (status, timestamp_requested DESC)",
        "CREATE TABLE IF NOT EXISTS workers (
            name TEXT NOT NULL,
            username TEXT NOT NULL,
            last_seen TIMESTAMPTZ,
            resources JSONB NOT NULL DEFAULT '{}',
            offliners JSONB NOT NULL DEFAULT '[]',
            PRIMARY KEY (name, username)
        )",
    ];

    for stmt in statements {
        if let Err(e) = sqlx::query(stmt).execute(pool).await {
            error!(%e, statement = stmt, "failed to apply schema statement");
        }
    }
    info!("ensured zimfarm schema exists");
}
