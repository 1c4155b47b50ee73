mod execute;
mod status;

pub use execute::*;
pub use status::*;

use actix_web::error::{InternalError, JsonPayloadError};
use actix_web::{HttpRequest, HttpResponse};
use serde::Serialize;

use crate::error::EngineError;

#[derive(Serialize)]
struct ErrorResponse {
    reason: &'static str,
    code: u32,
}

#[derive(Serialize)]
struct ErrorResponseWithMessage {
    reason: &'static str,
    code: u32,
    message: String,
}

pub fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = HttpResponse::BadRequest().json(ErrorResponse {
        reason: "ERR_INVALID_ARGUMENT",
        code: 1,
    });
    InternalError::from_response(err, response).into()
}

/// Maps an engine rejection to its HTTP error body
fn engine_error_response(error: &EngineError) -> HttpResponse {
    let message = error.to_string();
    match error {
        EngineError::InvalidInput(_) => HttpResponse::BadRequest().json(ErrorResponseWithMessage {
            reason: "ERR_INVALID_ARGUMENT",
            code: 1,
            message,
        }),
        EngineError::UnsupportedLanguage(_) => {
            HttpResponse::NotFound().json(ErrorResponseWithMessage {
                reason: "ERR_NOT_FOUND",
                code: 3,
                message,
            })
        }
        EngineError::ResourceExhausted(_) => {
            HttpResponse::ServiceUnavailable().json(ErrorResponseWithMessage {
                reason: "ERR_RATE_LIMIT",
                code: 4,
                message,
            })
        }
    }
}

fn internal_error_response() -> HttpResponse {
    HttpResponse::InternalServerError().json(ErrorResponse {
        reason: "ERR_INTERNAL",
        code: 6,
    })
}
