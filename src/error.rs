use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Driver {0} not found")]
    NotFound(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    /// Lost the race to reserve a driver. Recovered inside the matching
    /// engine and only visible to direct registry callers.
    #[error("Driver {0} is no longer available for reservation")]
    ReservationConflict(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ResponseError for DispatchError {
    fn error_response(&self) -> HttpResponse {
        match self {
            DispatchError::InvalidArgument(msg) => {
                HttpResponse::BadRequest().json(json!({
                    "error": "invalid_argument",
                    "message": msg
                }))
            }
            DispatchError::NotFound(_) => {
                HttpResponse::NotFound().json(json!({
                    "error": "not_found",
                    "message": self.to_string()
                }))
            }
            DispatchError::InvalidTransition(msg) => {
                HttpResponse::Conflict().json(json!({
                    "error": "invalid_transition",
                    "message": msg
                }))
            }
            DispatchError::ReservationConflict(_) => {
                HttpResponse::Conflict().json(json!({
                    "error": "reservation_conflict",
                    "message": self.to_string()
                }))
            }
            DispatchError::Internal(msg) => {
                log::error!("Internal error: {}", msg);
                HttpResponse::InternalServerError().json(json!({
                    "error": "internal_error",
                    "message": "An internal server error occurred"
                }))
            }
        }
    }
}
