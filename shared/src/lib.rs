//! Domain model and pure logic shared by `dispatcher-api` and `task-worker`:
//! configuration loading, error types, the Zimfarm task/event/worker model,
//! offliner command construction, lifecycle transition validation, and the
//! best-effort update broadcaster.

pub mod broadcaster;
pub mod config;
pub mod error;
pub mod model;
pub mod offliners;
pub mod statemachine;
