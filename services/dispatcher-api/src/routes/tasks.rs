//! `POST /tasks/{requested_id}?worker_name=…`, `GET /tasks/`,
//! `PATCH /tasks/{id}`, `POST /tasks/{id}/cancel` — C4 reservation and C7
//! event ingest (§4.4, §4.7, §6).

use actix_web::{web, HttpResponse};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use shared::broadcaster::TaskUpdate;
use shared::error::AppError;
use shared::model::{Event, EventCode};
use sqlx::Row;
use std::str::FromStr;
use uuid::Uuid;

use crate::AppState;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/tasks/{requested_id}", web::post().to(reserve_task))
        .route("/tasks/", web::get().to(list_tasks))
        .route("/tasks/{id}", web::get().to(get_task))
        .route("/tasks/{id}", web::patch().to(patch_task_event))
        .route("/tasks/{id}/cancel", web::post().to(cancel_task));
}

#[derive(Deserialize)]
struct ReserveQuery {
    worker_name: String,
}

/// `promote`: 201 with the reserved Task, or 423 Locked via
/// `AppError::AlreadyReserved` if another worker got there first.
async fn reserve_task(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    query: web::Query<ReserveQuery>,
) -> Result<HttpResponse, AppError> {
    let task = state.store.promote(path.into_inner(), &query.worker_name).await?;

    if let Some(event) = task.events.last().cloned() {
        state.broadcaster.publish(TaskUpdate {
            task_id: task.id,
            event,
        });
    }

    Ok(HttpResponse::Created().json(task))
}

/// `GET /tasks/{id}`: the full task document, as fetched by the task-worker
/// at the start of its run (§4.5 step 1) and by any client re-reading after
/// a `PATCH`.
async fn get_task(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let task = state.store.get_task(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(task))
}

#[derive(Deserialize)]
struct ListTasksQuery {
    /// Comma-separated status list.
    status: Option<String>,
    schedule_name: Option<String>,
}

async fn list_tasks(
    state: web::Data<AppState>,
    query: web::Query<ListTasksQuery>,
) -> Result<HttpResponse, AppError> {
    let statuses: Option<Vec<String>> = query
        .status
        .as_ref()
        .map(|s| s.split(',').map(|s| s.trim().to_string()).collect());

    let rows = sqlx::query(
        "SELECT id, status, schedule_name, worker, priority, timestamp_requested
         FROM tasks
         WHERE ($1::text[] IS NULL OR status = ANY($1))
           AND ($2::text IS NULL OR schedule_name = $2)
         ORDER BY timestamp_requested DESC",
    )
    .bind(&statuses)
    .bind(&query.schedule_name)
    .fetch_all(&state.store.pool)
    .await
    .map_err(|e| AppError::Transient(e.to_string()))?;

    let items: Vec<serde_json::Value> = rows
        .iter()
        .map(|row| {
            let id: Uuid = row.try_get("id").unwrap_or_default();
            let status: String = row.try_get("status").unwrap_or_default();
            let schedule_name: Option<String> = row.try_get("schedule_name").unwrap_or(None);
            let worker: String = row.try_get("worker").unwrap_or_default();
            let priority: i32 = row.try_get("priority").unwrap_or(0);
            json!({
                "_id": id,
                "status": status,
                "schedule_name": schedule_name,
                "worker": worker,
                "priority": priority,
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(json!({ "items": items })))
}

#[derive(Deserialize)]
struct PatchEventBody {
    event: String,
    #[serde(default)]
    payload: serde_json::Value,
}

/// §4.7: validates the event code and the requested transition, appends it,
/// broadcasts best-effort. 204 on accepted transition, 409 on forbidden, 404
/// if the task is unknown.
async fn patch_task_event(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: web::Json<PatchEventBody>,
) -> Result<HttpResponse, AppError> {
    let task_id = path.into_inner();
    let code = EventCode::from_str(&body.event)
        .map_err(|_| AppError::Validation(format!("unknown event code: {}", body.event)))?;

    state
        .store
        .append_event(task_id, code, body.payload.clone())
        .await?;

    state.broadcaster.publish(TaskUpdate {
        task_id,
        event: Event {
            code,
            timestamp: Utc::now(),
            payload: body.payload.clone(),
        },
    });

    Ok(HttpResponse::NoContent().finish())
}

#[derive(Deserialize, Default)]
struct CancelBody {
    #[serde(default)]
    canceled_by: Option<String>,
}

async fn cancel_task(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    body: Option<web::Json<CancelBody>>,
) -> Result<HttpResponse, AppError> {
    let task_id = path.into_inner();
    let payload = json!({ "canceled_by": body.and_then(|b| b.into_inner().canceled_by) });

    state
        .store
        .append_event(task_id, EventCode::CancelRequested, payload.clone())
        .await?;

    state.broadcaster.publish(TaskUpdate {
        task_id,
        event: Event {
            code: EventCode::CancelRequested,
            timestamp: Utc::now(),
            payload,
        },
    });

    Ok(HttpResponse::Accepted().finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use shared::broadcaster::Broadcaster;
    use sqlx::postgres::PgPoolOptions;

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
    async fn unknown_event_code_is_rejected_before_any_query() {
        let state = unreachable_state();
        let body = web::Json(PatchEventBody {
            event: "not_a_real_event".into(),
            payload: serde_json::Value::Null,
        });
        let err = patch_task_event(state, web::Path::from(Uuid::nil()), body)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[actix_web::test]
    async fn known_event_code_passes_validation_and_reaches_the_store() {
        let state = unreachable_state();
        let body = web::Json(PatchEventBody {
            event: "started".into(),
            payload: serde_json::Value::Null,
        });
        let err = patch_task_event(state, web::Path::from(Uuid::nil()), body)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Transient(_)));
    }
}
