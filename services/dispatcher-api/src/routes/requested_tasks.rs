//! `POST/GET /requested-tasks/`, `GET /requested-tasks/worker`,
//! `GET/PATCH/DELETE /requested-tasks/{id}` (§6, grounded on
//! `requested_task.py`).

use actix_web::{web, HttpResponse};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared::broadcaster::TaskUpdate;
use shared::error::AppError;
use shared::model::TaskConfig;
use shared::offliners::expanded_config;
use sqlx::Row;
use uuid::Uuid;

use crate::AppState;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route(
        "/requested-tasks/",
        web::post().to(create_requested_tasks),
    )
    .route("/requested-tasks/", web::get().to(list_requested_tasks))
    .route("/requested-tasks/worker", web::get().to(worker_poll))
    .route(
        "/requested-tasks/{id}",
        web::get().to(get_requested_task),
    )
    .route(
        "/requested-tasks/{id}",
        web::patch().to(patch_requested_task_priority),
    )
    .route(
        "/requested-tasks/{id}",
        web::delete().to(delete_requested_task),
    );
}

#[derive(Deserialize)]
struct CreateRequestedTasksBody {
    schedule_names: Vec<String>,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    worker: Option<String>,
    #[serde(default)]
    requested_by: Option<String>,
}

#[derive(Serialize)]
struct CreateRequestedTasksResponse {
    requested: Vec<Uuid>,
}

async fn create_requested_tasks(
    state: web::Data<AppState>,
    body: web::Json<CreateRequestedTasksBody>,
) -> Result<HttpResponse, AppError> {
    if body.schedule_names.is_empty() {
        return Err(AppError::Validation("schedule_names must not be empty".into()));
    }
    if !(0..=10).contains(&body.priority) {
        return Err(AppError::Validation("priority must be in 0..=10".into()));
    }

    let enabled_count: i64 = sqlx::query(
        "SELECT count(*) AS c FROM schedules WHERE name = ANY($1) AND enabled = true",
    )
    .bind(&body.schedule_names)
    .fetch_one(&state.store.pool)
    .await
    .map_err(|e| AppError::Transient(e.to_string()))?
    .try_get("c")
    .map_err(|e| AppError::Transient(e.to_string()))?;

    if enabled_count < body.schedule_names.len() as i64 {
        return Err(AppError::NotFound("one or more schedules not found or disabled".into()));
    }

    let mut created = Vec::new();
    for schedule_name in &body.schedule_names {
        let row = sqlx::query("SELECT config FROM schedules WHERE name = $1 AND enabled = true")
            .bind(schedule_name)
            .fetch_optional(&state.store.pool)
            .await
            .map_err(|e| AppError::Transient(e.to_string()))?;
        let Some(row) = row else { continue };
        let config_json: serde_json::Value = row
            .try_get("config")
            .map_err(|e| AppError::Transient(e.to_string()))?;
        let mut config: TaskConfig = serde_json::from_value(config_json)
            .map_err(|e| AppError::Fatal(format!("corrupt schedule config: {e}")))?;
        expanded_config(&mut config);

        let id = state
            .store
            .create_requested(
                Some(schedule_name),
                config,
                body.requested_by.as_deref(),
                body.priority,
                body.worker.as_deref(),
            )
            .await?;
        created.push(id);
    }

    Ok(HttpResponse::Created().json(CreateRequestedTasksResponse { requested: created }))
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default)]
    skip: i64,
    #[serde(default = "default_limit")]
    limit: i64,
    priority: Option<i32>,
    worker: Option<String>,
    schedule_name: Option<String>,
    matching_cpu: Option<i64>,
    matching_memory: Option<i64>,
    matching_disk: Option<i64>,
    /// Comma-separated offliner kinds (the wire-level analogue of the
    /// original's repeated `matching_offliners` query parameter).
    matching_offliners: Option<String>,
}

fn default_limit() -> i64 {
    100
}

#[derive(Serialize)]
struct ListMeta {
    skip: i64,
    limit: i64,
    count: i64,
}

#[derive(Serialize)]
struct ListResponse<T> {
    meta: ListMeta,
    items: Vec<T>,
}

async fn list_requested_tasks(
    state: web::Data<AppState>,
    query: web::Query<ListQuery>,
) -> Result<HttpResponse, AppError> {
    if query.skip < 0 {
        return Err(AppError::Validation("skip must be >= 0".into()));
    }
    if query.limit <= 0 || query.limit > 200 {
        return Err(AppError::Validation("limit must be in 1..=200".into()));
    }
    if let Some(p) = query.priority {
        if !(0..=10).contains(&p) {
            return Err(AppError::Validation("priority must be in 0..=10".into()));
        }
    }

    let offliners: Option<Vec<String>> = query
        .matching_offliners
        .as_ref()
        .map(|s| s.split(',').map(|s| s.trim().to_string()).collect());

    let rows = sqlx::query(
        "SELECT id, schedule_name, config, priority, worker, timestamp_requested
         FROM requested_tasks
         WHERE ($1::text IS NULL OR schedule_name = $1)
           AND ($2::int IS NULL OR priority >= $2)
           AND ($3::text IS NULL OR worker IS NULL OR worker = $3)
           AND ($4::bigint IS NULL OR (config->'resources'->>'cpu')::bigint <= $4)
           AND ($5::bigint IS NULL OR (config->'resources'->>'memory')::bigint <= $5)
           AND ($6::bigint IS NULL OR (config->'resources'->>'disk')::bigint <= $6)
           AND ($7::text[] IS NULL OR config->>'task_name' = ANY($7))
         ORDER BY priority DESC, timestamp_requested DESC
         OFFSET $8 LIMIT $9",
    )
    .bind(&query.schedule_name)
    .bind(query.priority)
    .bind(&query.worker)
    .bind(query.matching_cpu)
    .bind(query.matching_memory)
    .bind(query.matching_disk)
    .bind(&offliners)
    .bind(query.skip)
    .bind(query.limit)
    .fetch_all(&state.store.pool)
    .await
    .map_err(|e| AppError::Transient(e.to_string()))?;

    let items: Vec<serde_json::Value> = rows
        .iter()
        .map(|row| {
            let id: Uuid = row.try_get("id").unwrap_or_default();
            let schedule_name: Option<String> = row.try_get("schedule_name").unwrap_or(None);
            let config: serde_json::Value =
                row.try_get("config").unwrap_or(serde_json::Value::Null);
            let priority: i32 = row.try_get("priority").unwrap_or(0);
            let worker: Option<String> = row.try_get("worker").unwrap_or(None);
            json!({
                "_id": id,
                "status": "requested",
                "schedule_name": schedule_name,
                "config": {
                    "task_name": config.get("task_name"),
                    "resources": config.get("resources"),
                },
                "priority": priority,
                "worker": worker,
            })
        })
        .collect();

    let count: i64 = sqlx::query(
        "SELECT count(*) AS c FROM requested_tasks
         WHERE ($1::text IS NULL OR schedule_name = $1)
           AND ($2::int IS NULL OR priority >= $2)
           AND ($3::text IS NULL OR worker IS NULL OR worker = $3)",
    )
    .bind(&query.schedule_name)
    .bind(query.priority)
    .bind(&query.worker)
    .fetch_one(&state.store.pool)
    .await
    .map_err(|e| AppError::Transient(e.to_string()))?
    .try_get("c")
    .map_err(|e| AppError::Transient(e.to_string()))?;

    Ok(HttpResponse::Ok().json(ListResponse {
        meta: ListMeta {
            skip: query.skip,
            limit: query.limit,
            count,
        },
        items,
    }))
}

#[derive(Deserialize)]
struct WorkerPollQuery {
    worker: String,
    username: Option<String>,
    #[serde(default = "default_cpu")]
    matching_cpu: i64,
    #[serde(default = "default_mem")]
    matching_memory: i64,
    #[serde(default = "default_disk")]
    matching_disk: i64,
    matching_offliners: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
    /// Comma-separated ids to exclude (a worker retrying past a lost
    /// reservation race passes the ids it already tried).
    exclude_ids: Option<String>,
}

fn default_cpu() -> i64 {
    i64::MAX
}
fn default_mem() -> i64 {
    i64::MAX
}
fn default_disk() -> i64 {
    i64::MAX
}

/// Authenticated worker poll: runs the §4.3 match query for this worker's
/// advertised capability and records `worker.last_seen`.
async fn worker_poll(
    state: web::Data<AppState>,
    query: web::Query<WorkerPollQuery>,
) -> Result<HttpResponse, AppError> {
    if let Some(username) = &query.username {
        crate::matcher::touch_worker_last_seen(&state.store.pool, &query.worker, username).await?;
    }

    let offliners: Vec<String> = query
        .matching_offliners
        .as_ref()
        .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_default();

    let exclude_ids: Vec<Uuid> = query
        .exclude_ids
        .as_ref()
        .map(|s| s.split(',').filter_map(|s| s.trim().parse().ok()).collect())
        .unwrap_or_default();

    let candidates = crate::matcher::find_candidates(
        &state.store.pool,
        &query.worker,
        query.matching_cpu,
        query.matching_memory,
        query.matching_disk,
        &offliners,
        &exclude_ids,
        query.limit,
    )
    .await?;

    Ok(HttpResponse::Ok().json(candidates))
}

async fn get_requested_task(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let task = state.store.get_requested(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(task))
}

#[derive(Deserialize)]
struct PatchPriorityBody {
    priority: i32,
}

async fn patch_requested_task_priority(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<PatchPriorityBody>,
) -> Result<HttpResponse, AppError> {
    if !(0..=10).contains(&body.priority) {
        return Err(AppError::Validation("priority must be in 0..=10".into()));
    }
    let modified = state.store.set_priority(path.into_inner(), body.priority).await?;
    if modified {
        Ok(HttpResponse::Accepted().finish())
    } else {
        Ok(HttpResponse::Ok().finish())
    }
}

async fn delete_requested_task(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let id = path.into_inner();
    let deleted = state.store.delete_requested(id).await?;
    if !deleted {
        return Err(AppError::NotFound(format!("requested task {id}")));
    }
    state.broadcaster.publish(TaskUpdate {
        task_id: id,
        event: shared::model::Event {
            code: shared::model::EventCode::Requested,
            timestamp: Utc::now(),
            payload: json!({"deleted": true}),
        },
    });
    Ok(HttpResponse::Ok().json(json!({"deleted": 1})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use shared::broadcaster::Broadcaster;
    use sqlx::postgres::PgPoolOptions;

    /// A pool that never actually connects. Valid for exercising the
    /// boundary-case validation that runs before any query is issued.
    fn unreachable_state() -> web::Data<AppState> {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/zimfarm_test_unreachable")
            .expect("lazy pool construction never touches the network");
        web::Data::new(AppState {
            store: Store::new(pool),
            broadcaster: Broadcaster::default(),
        })
    }

    #[actix_web::test]
    async fn empty_schedule_names_is_rejected_before_any_query() {
        let state = unreachable_state();
        let body = web::Json(CreateRequestedTasksBody {
            schedule_names: vec![],
            priority: 0,
            worker: None,
            requested_by: None,
        });
        let err = create_requested_tasks(state, body).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[actix_web::test]
    async fn out_of_range_priority_is_rejected_before_any_query() {
        let state = unreachable_state();
        let body = web::Json(CreateRequestedTasksBody {
            schedule_names: vec!["wikipedia_en".into()],
            priority: 11,
            worker: None,
            requested_by: None,
        });
        let err = create_requested_tasks(state, body).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[actix_web::test]
    async fn limit_above_200_is_rejected() {
        let state = unreachable_state();
        let query = web::Query(ListQuery {
            skip: 0,
            limit: 201,
            priority: None,
            worker: None,
            schedule_name: None,
            matching_cpu: None,
            matching_memory: None,
            matching_disk: None,
            matching_offliners: None,
        });
        let err = list_requested_tasks(state, query).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[actix_web::test]
    async fn negative_skip_is_rejected() {
        let state = unreachable_state();
        let query = web::Query(ListQuery {
            skip: -1,
            limit: default_limit(),
            priority: None,
            worker: None,
            schedule_name: None,
            matching_cpu: None,
            matching_memory: None,
            matching_disk: None,
            matching_offliners: None,
        });
        let err = list_requested_tasks(state, query).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[actix_web::test]
    async fn priority_zero_is_a_valid_filter_boundary() {
        // priority=0 must pass validation (it matches priority>=0, per §8);
        // it fails afterwards on the unreachable pool, which proves
        // validation itself accepted it rather than rejecting outright.
        let state = unreachable_state();
        let query = web::Query(ListQuery {
            skip: 0,
            limit: default_limit(),
            priority: Some(0),
            worker: None,
            schedule_name: None,
            matching_cpu: None,
            matching_memory: None,
            matching_disk: None,
            matching_offliners: None,
        });
        let err = list_requested_tasks(state, query).await.unwrap_err();
        assert!(matches!(err, AppError::Transient(_)));
    }
}
