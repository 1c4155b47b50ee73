use actix_web::{HttpResponse, Responder, get, web};
use serde::Serialize;

use super::internal_error_response;
use crate::engine::Engine;
use crate::stats::ExecutionStats;

#[derive(Serialize, Debug)]
pub struct HealthResponse {
    pub status: &'static str,
    pub runtime: &'static str,
    pub runtime_version: Option<String>,
}

#[derive(Serialize, Debug)]
pub struct LanguageInfo {
    pub id: String,
    pub aliases: Vec<String>,
    pub image: String,
    pub compiled: bool,
}

/// Reports whether the isolation runtime answers
#[get("/health")]
pub async fn get_health_handler(engine: web::Data<Engine>) -> impl Responder {
    let runner = engine.runner().clone();
    let runtime = runner.name();

    match web::block(move || runner.probe()).await {
        Ok(Ok(version)) => HttpResponse::Ok().json(HealthResponse {
            status: "healthy",
            runtime,
            runtime_version: Some(version),
        }),
        Ok(Err(e)) => {
            log::warn!("Health probe of {runtime} failed: {e:#}");
            HttpResponse::ServiceUnavailable().json(HealthResponse {
                status: "degraded",
                runtime,
                runtime_version: None,
            })
        }
        Err(e) => {
            log::error!("Health probe could not be scheduled: {e}");
            internal_error_response()
        }
    }
}

#[get("/languages")]
pub async fn get_languages_handler(engine: web::Data<Engine>) -> impl Responder {
    let languages: Vec<LanguageInfo> = engine
        .registry()
        .profiles()
        .iter()
        .map(|profile| LanguageInfo {
            id: profile.id.clone(),
            aliases: profile.aliases.clone(),
            image: profile.image.clone(),
            compiled: profile.is_compiled(),
        })
        .collect();
    HttpResponse::Ok().json(languages)
}

#[get("/stats")]
pub async fn get_stats_handler(stats: web::Data<ExecutionStats>) -> impl Responder {
    HttpResponse::Ok().json(stats.snapshot())
}
