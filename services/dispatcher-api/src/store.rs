//! The Task Store (C1) and Event Log (C2): transactional persistence for
//! requested tasks and tasks, with the `promote` and `append_event`
//! operations made linearizable per task id via `SELECT ... FOR UPDATE`
//! inside a single transaction.

use chrono::Utc;
use serde_json::json;
use shared::error::AppError;
use shared::model::{
    ContainerInfo, Event, EventCode, FileState, FileStatus, RequestedTask, Task, TaskConfig,
    TaskStatus,
};
use shared::statemachine::next_status;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Clone)]
pub struct Store {
    pub pool: PgPool,
}

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

fn row_to_task(row: &sqlx::postgres::PgRow) -> Result<Task, AppError> {
    let config: serde_json::Value = row.try_get("config").map_err(db_err)?;
    let events: serde_json::Value = row.try_get("events").map_err(db_err)?;
    let container: serde_json::Value = row.try_get("container").map_err(db_err)?;
    let files: serde_json::Value = row.try_get("files").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    Ok(Task {
        id: row.try_get("id").map_err(db_err)?,
        schedule_name: row.try_get("schedule_name").map_err(db_err)?,
        config: serde_json::from_value(config).map_err(parse_err)?,
        requested_by: row.try_get("requested_by").map_err(db_err)?,
        priority: row.try_get("priority").map_err(db_err)?,
        worker: row.try_get("worker").map_err(db_err)?,
        status: TaskStatus::from_str(&status).map_err(|_| AppError::Fatal("bad status".into()))?,
        timestamp_requested: row.try_get("timestamp_requested").map_err(db_err)?,
        timestamp_reserved: row.try_get("timestamp_reserved").map_err(db_err)?,
        events: serde_json::from_value(events).map_err(parse_err)?,
        container: serde_json::from_value(container).map_err(parse_err)?,
        files: serde_json::from_value(files).map_err(parse_err)?,
        debug: row.try_get("debug").map_err(db_err)?,
    })
}

fn db_err(e: sqlx::Error) -> AppError {
    AppError::Transient(e.to_string())
}

fn parse_err(e: serde_json::Error) -> AppError {
    AppError::Fatal(format!("corrupt stored document: {e}"))
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// `create_requested`: rejects duplicates per the `(schedule_name,
    /// worker)` invariant.
    pub async fn create_requested(
        &self,
        schedule_name: Option<&str>,
        config: TaskConfig,
        requested_by: Option<&str>,
        priority: i32,
        worker: Option<&str>,
    ) -> Result<Uuid, AppError> {
        let existing = sqlx::query(
            "SELECT 1 FROM requested_tasks WHERE schedule_name IS NOT DISTINCT FROM $1
             AND worker IS NOT DISTINCT FROM $2",
        )
        .bind(schedule_name)
        .bind(worker)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        if existing.is_some() {
            return Err(AppError::Validation(
                "a requested task for this (schedule_name, worker) already exists".into(),
            ));
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        let events = vec![Event {
            code: EventCode::Requested,
            timestamp: now,
            payload: serde_json::Value::Null,
        }];

        sqlx::query(
            "INSERT INTO requested_tasks
                (id, schedule_name, config, requested_by, priority, worker, timestamp_requested, events)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(id)
        .bind(schedule_name)
        .bind(serde_json::to_value(&config).map_err(parse_err)?)
        .bind(requested_by)
        .bind(priority)
        .bind(worker)
        .bind(now)
        .bind(serde_json::to_value(&events).map_err(parse_err)?)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(id)
    }

    pub async fn get_requested(&self, id: Uuid) -> Result<RequestedTask, AppError> {
        let row = sqlx::query("SELECT * FROM requested_tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| AppError::NotFound(format!("requested task {id}")))?;
        row_to_requested_task(&row)
    }

    pub async fn delete_requested(&self, id: Uuid) -> Result<bool, AppError> {
        let res = sqlx::query("DELETE FROM requested_tasks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn set_priority(&self, id: Uuid, priority: i32) -> Result<bool, AppError> {
        let res = sqlx::query(
            "UPDATE requested_tasks SET priority = $2 WHERE id = $1 AND priority IS DISTINCT FROM $2",
        )
        .bind(id)
        .bind(priority)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if res.rows_affected() == 0 {
            sqlx::query("SELECT 1 FROM requested_tasks WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?
                .ok_or_else(|| AppError::NotFound(format!("requested task {id}")))?;
        }
        Ok(res.rows_affected() > 0)
    }

    /// `promote`: single atomic operation — read the requested row, insert a
    /// task row with the identical id, delete the requested row, append a
    /// `reserved` event. Fails `AlreadyReserved` if the requested row is
    /// already gone (another worker got there first).
    pub async fn promote(&self, requested_id: Uuid, worker: &str) -> Result<Task, AppError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query("SELECT * FROM requested_tasks WHERE id = $1 FOR UPDATE")
            .bind(requested_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        let Some(row) = row else {
            return Err(AppError::AlreadyReserved);
        };
        let requested = row_to_requested_task(&row)?;

        let now = Utc::now();
        let mut events = requested.events;
        events.push(Event {
            code: EventCode::Reserved,
            timestamp: now,
            payload: serde_json::Value::Null,
        });

        let task = Task {
            id: requested.id,
            schedule_name: requested.schedule_name,
            config: requested.config,
            requested_by: requested.requested_by,
            priority: requested.priority,
            worker: worker.to_string(),
            status: TaskStatus::Reserved,
            timestamp_requested: requested.timestamp_requested,
            timestamp_reserved: now,
            events,
            container: ContainerInfo::default(),
            files: Default::default(),
            debug: serde_json::Value::Null,
        };

        sqlx::query(
            "INSERT INTO tasks
                (id, schedule_name, config, requested_by, priority, worker, status,
                 timestamp_requested, timestamp_reserved, events, container, files, debug)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13)",
        )
        .bind(task.id)
        .bind(&task.schedule_name)
        .bind(serde_json::to_value(&task.config).map_err(parse_err)?)
        .bind(&task.requested_by)
        .bind(task.priority)
        .bind(&task.worker)
        .bind(task.status.to_string())
        .bind(task.timestamp_requested)
        .bind(task.timestamp_reserved)
        .bind(serde_json::to_value(&task.events).map_err(parse_err)?)
        .bind(serde_json::to_value(&task.container).map_err(parse_err)?)
        .bind(json!({}))
        .bind(serde_json::Value::Null)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query("DELETE FROM requested_tasks WHERE id = $1")
            .bind(requested_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(task)
    }

    pub async fn get_task(&self, id: Uuid) -> Result<Task, AppError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| AppError::NotFound(format!("task {id}")))?;
        row_to_task(&row)
    }

    /// `append_event`: validates the transition (§4.2), updates denormalized
    /// `status` and the per-file map for file events. Re-submitting the same
    /// `{event, payload}` that is already the last recorded event is a
    /// no-op.
    pub async fn append_event(
        &self,
        task_id: Uuid,
        code: EventCode,
        payload: serde_json::Value,
    ) -> Result<TaskStatus, AppError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query("SELECT * FROM tasks WHERE id = $1 FOR UPDATE")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| AppError::NotFound(format!("task {task_id}")))?;
        let mut task = row_to_task(&row)?;

        if let Some(last) = task.events.last() {
            if last.code == code && last.payload == payload {
                return Ok(task.status);
            }
        }

        let new_status = next_status(task.status, code)
            .map_err(|e| AppError::Conflict(format!("forbidden transition: {e}")))?;

        if code == EventCode::Succeeded
            && !task.files.values().all(|f| f.status == FileStatus::Uploaded)
        {
            return Err(AppError::Conflict(
                "cannot succeed: not all files finished uploading".into(),
            ));
        }

        let now = Utc::now();
        task.events.push(Event {
            code,
            timestamp: now,
            payload: payload.clone(),
        });
        task.status = new_status;

        if code.is_file_event() {
            apply_file_event(&mut task, code, &payload);
        }
        if code == EventCode::ScraperCompleted {
            if let Some(exit_code) = payload.get("exit_code").and_then(|v| v.as_i64()) {
                task.container.exit_code = Some(exit_code);
            }
        }

        sqlx::query(
            "UPDATE tasks SET status=$2, events=$3, container=$4, files=$5 WHERE id=$1",
        )
        .bind(task.id)
        .bind(task.status.to_string())
        .bind(serde_json::to_value(&task.events).map_err(parse_err)?)
        .bind(serde_json::to_value(&task.container).map_err(parse_err)?)
        .bind(serde_json::to_value(&task.files).map_err(parse_err)?)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(new_status)
    }
}

fn apply_file_event(task: &mut Task, code: EventCode, payload: &serde_json::Value) {
    match code {
        // created_file's payload nests the file details under "file"
        // ({"file": {"name": …, "size": …}}), matching what the worker
        // sends and what spec §8 scenario 1 shows.
        EventCode::CreatedFile => {
            let Some(file) = payload.get("file") else { return };
            let Some(filename) = file.get("name").and_then(|v| v.as_str()) else {
                return;
            };
            let size = file.get("size").and_then(|v| v.as_u64()).unwrap_or(0);
            task.files.insert(
                filename.to_string(),
                FileState {
                    size,
                    status: FileStatus::Pending,
                },
            );
        }
        EventCode::UploadedFile => {
            let Some(filename) = payload.get("filename").and_then(|v| v.as_str()) else {
                return;
            };
            if let Some(f) = task.files.get_mut(filename) {
                f.status = FileStatus::Uploaded;
            }
        }
        EventCode::FailedFile => {
            let Some(filename) = payload.get("filename").and_then(|v| v.as_str()) else {
                return;
            };
            if let Some(f) = task.files.get_mut(filename) {
                f.status = FileStatus::Failed;
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::model::ImageRef;

    fn empty_task() -> Task {
        Task {
            id: Uuid::nil(),
            schedule_name: Some("wikipedia_en".into()),
            config: TaskConfig {
                task_name: "mwoffliner".into(),
                image: ImageRef { name: "openzim/mwoffliner".into(), tag: "latest".into() },
                flags: Default::default(),
                resources: ResourceSpec { cpu: 1, memory: 1, disk: 1, shm: None },
                warehouse_path: String::new(),
                queue: String::new(),
                command_information: None,
            },
            requested_by: None,
            priority: 0,
            worker: "W1".into(),
            status: TaskStatus::ScraperCompleted,
            timestamp_requested: Utc::now(),
            timestamp_reserved: Utc::now(),
            events: vec![],
            container: ContainerInfo::default(),
            files: Default::default(),
            debug: serde_json::Value::Null,
        }
    }

    #[test]
    fn created_file_reads_nested_file_object() {
        let mut task = empty_task();
        apply_file_event(
            &mut task,
            EventCode::CreatedFile,
            &json!({"file": {"name": "wp.zim", "size": 1234}}),
        );
        let entry = task.files.get("wp.zim").expect("wp.zim must be registered");
        assert_eq!(entry.size, 1234);
        assert_eq!(entry.status, FileStatus::Pending);
    }

    #[test]
    fn created_file_with_top_level_filename_is_ignored() {
        // guards against regressing to the wrong shape: a payload that only
        // has a top-level "filename" (the uploaded/failed shape) must not
        // register anything for created_file.
        let mut task = empty_task();
        apply_file_event(
            &mut task,
            EventCode::CreatedFile,
            &json!({"filename": "wp.zim", "size": 1234}),
        );
        assert!(task.files.is_empty());
    }

    #[test]
    fn uploaded_file_then_failed_file_use_top_level_filename() {
        let mut task = empty_task();
        apply_file_event(
            &mut task,
            EventCode::CreatedFile,
            &json!({"file": {"name": "wp.zim", "size": 1234}}),
        );
        apply_file_event(&mut task, EventCode::UploadedFile, &json!({"filename": "wp.zim"}));
        assert_eq!(task.files["wp.zim"].status, FileStatus::Uploaded);

        apply_file_event(&mut task, EventCode::FailedFile, &json!({"filename": "wp.zim"}));
        assert_eq!(task.files["wp.zim"].status, FileStatus::Failed);
    }
}
