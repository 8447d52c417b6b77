//! The Zimfarm domain model: schedules, requested tasks, tasks, events and
//! workers, as described by the request -> reserve -> run -> complete
//! lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum_macros::{Display, EnumString};
use uuid::Uuid;

/// Lifecycle status, derived as a pure function of the last recorded event's
/// code (see [`crate::statemachine`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Requested,
    Reserved,
    Started,
    ScraperStarted,
    ScraperCompleted,
    CancelRequested,
    Canceled,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

/// Lifecycle and file event codes. File codes never change `TaskStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventCode {
    Requested,
    Reserved,
    Started,
    ScraperStarted,
    ScraperCompleted,
    CancelRequested,
    Canceled,
    Succeeded,
    Failed,
    CreatedFile,
    UploadedFile,
    FailedFile,
}

impl EventCode {
    pub fn is_file_event(self) -> bool {
        matches!(
            self,
            EventCode::CreatedFile | EventCode::UploadedFile | EventCode::FailedFile
        )
    }
}

/// One entry in a task's append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub code: EventCode,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Resource requirements/advertisements: cpu cores, memory bytes, disk bytes,
/// optional shared-memory bytes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct ResourceSpec {
    pub cpu: u32,
    pub memory: u64,
    pub disk: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shm: Option<u64>,
}

/// Image reference for the scraper container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRef {
    pub name: String,
    pub tag: String,
}

/// The immutable, schedule-carried recipe for one archive build. The `flags`
/// map is scraper-specific and is only interpreted by
/// [`crate::offliners::command_for`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub task_name: String,
    pub image: ImageRef,
    #[serde(default)]
    pub flags: serde_json::Map<String, serde_json::Value>,
    pub resources: ResourceSpec,
    #[serde(default)]
    pub warehouse_path: String,
    #[serde(default)]
    pub queue: String,
    /// Filled in by `command_information_for` at request time: argv, the
    /// joined command string, and the resolved mount point.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_information: Option<CommandInformation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandInformation {
    pub command: Vec<String>,
    pub str_command: String,
    pub mount_point: String,
    #[serde(default)]
    pub cap_add: Vec<String>,
}

/// Named, reusable recipe. External input; enabled/disabled toggled by an
/// administrative surface outside this core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub name: String,
    pub enabled: bool,
    pub config: TaskConfig,
}

/// A schedule invocation waiting to be picked up by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestedTask {
    pub id: Uuid,
    #[serde(default)]
    pub schedule_name: Option<String>,
    pub config: TaskConfig,
    #[serde(default)]
    pub requested_by: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub worker: Option<String>,
    pub timestamp_requested: DateTime<Utc>,
    #[serde(default)]
    pub timestamp_reserved: Option<DateTime<Utc>>,
    #[serde(default)]
    pub events: Vec<Event>,
}

/// Per-file upload state, tracked on the running [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    Uploading,
    Uploaded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileState {
    pub size: u64,
    pub status: FileStatus,
}

/// Scraper container details recorded once the container starts.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContainerInfo {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub log_filename: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i64>,
}

/// A running or completed invocation, owned by exactly one worker. Inherits
/// `RequestedTask`'s fields; `id` equals the source `RequestedTask`'s id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    #[serde(default)]
    pub schedule_name: Option<String>,
    pub config: TaskConfig,
    #[serde(default)]
    pub requested_by: Option<String>,
    pub priority: i32,
    pub worker: String,
    pub status: TaskStatus,
    pub timestamp_requested: DateTime<Utc>,
    pub timestamp_reserved: DateTime<Utc>,
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub container: ContainerInfo,
    #[serde(default)]
    pub files: HashMap<String, FileState>,
    #[serde(default)]
    pub debug: serde_json::Value,
}

/// A fleet node that pulls reservable tasks and executes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub name: String,
    pub username: String,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    pub resources: ResourceSpec,
    #[serde(default)]
    pub offliners: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_code_roundtrips_snake_case() {
        let json = serde_json::to_string(&EventCode::ScraperStarted).unwrap();
        assert_eq!(json, "\"scraper_started\"");
        let back: EventCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, EventCode::ScraperStarted);
    }

    #[test]
    fn file_events_are_flagged() {
        assert!(EventCode::CreatedFile.is_file_event());
        assert!(!EventCode::Started.is_file_event());
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Canceled.is_terminal());
        assert!(!TaskStatus::Started.is_terminal());
    }
}
