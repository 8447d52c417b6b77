//! Pure transition validation for the task lifecycle (the §4.2 table).
//!
//! File events (`created_file`/`uploaded_file`/`failed_file`) never change
//! `TaskStatus`; they are valid from any non-terminal status and leave it
//! unchanged. `succeeded`/`failed` preconditions that depend on file state
//! (all uploads ended `uploaded`, or any ended `failed`) are business rules
//! checked by the caller (the C7 ingest handler) before invoking
//! [`next_status`] — this function only knows about statuses and event
//! codes, not file maps.

use crate::model::{EventCode, TaskStatus};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("forbidden transition: {code} from {from}")]
pub struct TransitionError {
    pub from: TaskStatus,
    pub code: EventCode,
}

/// Computes the new status for `current` receiving event `code`, or rejects
/// the transition if it isn't one listed in the lifecycle table.
pub fn next_status(
    current: TaskStatus,
    code: EventCode,
) -> Result<TaskStatus, TransitionError> {
    use EventCode::*;
    use TaskStatus::*;

    if code.is_file_event() {
        return if current.is_terminal() {
            Err(TransitionError { from: current, code })
        } else {
            Ok(current)
        };
    }

    let result = match (current, code) {
        (Requested, Reserved) => Some(TaskStatus::Reserved),
        (TaskStatus::Reserved, Started) => Some(TaskStatus::Started),
        (Started, ScraperStarted) => Some(TaskStatus::ScraperStarted),
        (TaskStatus::ScraperStarted, ScraperCompleted) => Some(TaskStatus::ScraperCompleted),

        // idempotent: already cancel_requested stays cancel_requested.
        (TaskStatus::CancelRequested, CancelRequested) => Some(TaskStatus::CancelRequested),
        (from, CancelRequested) if !from.is_terminal() => Some(TaskStatus::CancelRequested),

        (TaskStatus::CancelRequested, Canceled)
        | (Started, Canceled)
        | (TaskStatus::ScraperStarted, Canceled)
        | (TaskStatus::ScraperCompleted, Canceled)
        | (TaskStatus::Reserved, Canceled) => Some(TaskStatus::Canceled),

        (TaskStatus::ScraperCompleted, Succeeded) => Some(TaskStatus::Succeeded),
        (TaskStatus::ScraperCompleted, EventCode::Failed) => Some(TaskStatus::Failed),
        (TaskStatus::Reserved, EventCode::Failed)
        | (Started, EventCode::Failed)
        | (TaskStatus::ScraperStarted, EventCode::Failed) => Some(TaskStatus::Failed),

        _ => None,
    };

    result.ok_or(TransitionError { from: current, code })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventCode::*, TaskStatus::*};

    #[test]
    fn happy_path() {
        assert_eq!(next_status(Requested, Reserved), Ok(TaskStatus::Reserved));
        assert_eq!(next_status(TaskStatus::Reserved, Started), Ok(TaskStatus::Started));
        assert_eq!(next_status(Started, ScraperStarted), Ok(TaskStatus::ScraperStarted));
        assert_eq!(
            next_status(TaskStatus::ScraperStarted, ScraperCompleted),
            Ok(TaskStatus::ScraperCompleted)
        );
        assert_eq!(
            next_status(TaskStatus::ScraperCompleted, Succeeded),
            Ok(TaskStatus::Succeeded)
        );
    }

    #[test]
    fn cancel_requested_is_idempotent() {
        assert_eq!(
            next_status(TaskStatus::CancelRequested, CancelRequested),
            Ok(TaskStatus::CancelRequested)
        );
        assert_eq!(
            next_status(Started, CancelRequested),
            Ok(TaskStatus::CancelRequested)
        );
    }

    #[test]
    fn file_events_never_change_status() {
        assert_eq!(next_status(Started, CreatedFile), Ok(Started));
        assert_eq!(
            next_status(TaskStatus::ScraperStarted, UploadedFile),
            Ok(TaskStatus::ScraperStarted)
        );
    }

    #[test]
    fn terminal_status_rejects_everything_but_forbidden_error() {
        assert!(next_status(TaskStatus::Succeeded, Started).is_err());
        assert!(next_status(TaskStatus::Failed, CreatedFile).is_err());
    }

    #[test]
    fn forbidden_direct_jump_is_rejected() {
        // requested -> started (skipping reserved) is not in the table.
        assert!(next_status(Requested, Started).is_err());
    }

    #[test]
    fn worker_crash_failure_from_any_in_flight_status() {
        assert_eq!(next_status(TaskStatus::Reserved, EventCode::Failed), Ok(TaskStatus::Failed));
        assert_eq!(next_status(Started, EventCode::Failed), Ok(TaskStatus::Failed));
        assert_eq!(
            next_status(TaskStatus::ScraperStarted, EventCode::Failed),
            Ok(TaskStatus::Failed)
        );
    }
}
