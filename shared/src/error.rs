//! Common error types shared between the dispatcher-api and task-worker.

use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

#[derive(Error, Debug)]
/// Error taxonomy for the task lifecycle: each variant maps to exactly one
/// HTTP status on the dispatcher side, and to a distinct handling policy on
/// the worker side (see `task-worker::client`).
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("conflicting state: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already reserved")]
    AlreadyReserved,

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("transient infrastructure error: {0}")]
    Transient(String),

    #[error("fatal error: {0}")]
    Fatal(String),
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        match self {
            AppError::Validation(msg) => HttpResponse::BadRequest().json(msg),
            AppError::Conflict(msg) => HttpResponse::Conflict().json(msg),
            AppError::NotFound(msg) => HttpResponse::NotFound().json(msg),
            AppError::AlreadyReserved => HttpResponse::Locked().finish(),
            AppError::Unauthorized => HttpResponse::Unauthorized().finish(),
            AppError::Forbidden => HttpResponse::Forbidden().finish(),
            AppError::Transient(msg) => HttpResponse::ServiceUnavailable().json(msg),
            AppError::Fatal(msg) => HttpResponse::InternalServerError().json(msg),
        }
    }
}

/// Convenience alias for results that use [`AppError`].
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_reserved_maps_to_locked() {
        let resp = AppError::AlreadyReserved.error_response();
        assert_eq!(resp.status().as_u16(), 423);
    }

    #[test]
    fn not_found_maps_to_404() {
        let resp = AppError::NotFound("task".into()).error_response();
        assert_eq!(resp.status().as_u16(), 404);
    }
}
