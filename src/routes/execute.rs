use actix_web::{HttpResponse, Responder, post, web};

use super::engine_error_response;
use crate::engine::{Engine, ExecutionRequest};

#[post("/execute")]
pub async fn post_execute_handler(
    engine: web::Data<Engine>,
    body: web::Json<ExecutionRequest>,
) -> impl Responder {
    match engine.execute(&body).await {
        Ok(result) => HttpResponse::Ok().json(result),
        Err(e) => engine_error_response(&e),
    }
}
