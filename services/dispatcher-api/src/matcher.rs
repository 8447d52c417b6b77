//! The Scheduler / Matcher (C3): the match query and priority/timestamp
//! sort described in §4.3.

use chrono::{DateTime, Utc};
use shared::error::AppError;
use shared::model::RequestedTask;
use sqlx::{PgPool, Row};
use uuid::Uuid;

fn row_to_requested_task(row: &sqlx::postgres::PgRow) -> Result<RequestedTask, AppError> {
    let config: serde_json::Value = row.try_get("config").map_err(db_err)?;
    let events: serde_json::Value = row.try_get("events").map_err(db_err)?;
    Ok(RequestedTask {
        id: row.try_get("id").map_err(db_err)?,
        schedule_name: row.try_get("schedule_name").map_err(db_err)?,
        config: serde_json::from_value(config).map_err(parse_err)?,
        requested_by: row.try_get("requested_by").map_err(db_err)?,
        priority: row.try_get("priority").map_err(db_err)?,
        worker: row.try_get("worker").map_err(db_err)?,
        timestamp_requested: row.try_get("timestamp_requested").map_err(db_err)?,
        timestamp_reserved: row.try_get("timestamp_reserved").map_err(db_err)?,
        events: serde_json::from_value(events).map_err(parse_err)?,
    })
}

fn db_err(e: sqlx::Error) -> AppError {
    AppError::Transient(e.to_string())
}
fn parse_err(e: serde_json::Error) -> AppError {
    AppError::Fatal(format!("corrupt stored document: {e}"))
}

/// Runs the match query for a worker `W` with resources `(cpu, mem, disk)`
/// and offliner capability set `offliners`:
///
/// ```text
/// status = requested
/// AND (worker IS NULL OR worker = W)
/// AND config.resources.cpu    <= cpu
/// AND config.resources.memory <= mem
/// AND config.resources.disk   <= disk
/// AND config.task_name IN offliners
/// ```
///
/// ordered by `priority DESC, timestamp.reserved DESC, timestamp.requested
/// DESC`, ties broken by id, excluding any id already tried this
/// reservation attempt.
pub async fn find_candidates(
    pool: &PgPool,
    worker: &str,
    cpu: i64,
    memory: i64,
    disk: i64,
    offliners: &[String],
    exclude_ids: &[Uuid],
    limit: i64,
) -> Result<Vec<RequestedTask>, AppError> {
    let rows = sqlx::query(
        "SELECT * FROM requested_tasks
         WHERE (worker IS NULL OR worker = $1)
           AND (config->'resources'->>'cpu')::bigint <= $2
           AND (config->'resources'->>'memory')::bigint <= $3
           AND (config->'resources'->>'disk')::bigint <= $4
           AND config->>'task_name' = ANY($5)
           AND NOT (id = ANY($6))
         ORDER BY priority DESC, timestamp_reserved DESC NULLS LAST,
                  timestamp_requested DESC, id ASC
         LIMIT $7",
    )
    .bind(worker)
    .bind(cpu)
    .bind(memory)
    .bind(disk)
    .bind(offliners)
    .bind(exclude_ids)
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(db_err)?;

    rows.iter().map(row_to_requested_task).collect()
}

pub async fn touch_worker_last_seen(
    pool: &PgPool,
    name: &str,
    username: &str,
) -> Result<(), AppError> {
    let now: DateTime<Utc> = Utc::now();
    sqlx::query(
        "INSERT INTO workers (name, username, last_seen)
         VALUES ($1, $2, $3)
         ON CONFLICT (name, username) DO UPDATE SET last_seen = EXCLUDED.last_seen",
    )
    .bind(name)
    .bind(username)
    .bind(now)
    .execute(pool)
    .await
    .map_err(db_err)?;
    Ok(())
}
