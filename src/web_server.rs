use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, middleware, web};

use crate::config::ServerConfig;
use crate::engine::Engine;
use crate::routes::{
    get_health_handler, get_languages_handler, get_stats_handler, json_error_handler,
    post_execute_handler,
};
use crate::stats::ExecutionStats;

/// Registers every route; shared by the server and the HTTP tests
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(json_error_handler))
        .service(post_execute_handler)
        .service(get_health_handler)
        .service(get_languages_handler)
        .service(get_stats_handler);
}

pub fn build_server(
    server_config: &ServerConfig,
    engine: Arc<Engine>,
    stats: Arc<ExecutionStats>,
) -> std::io::Result<Server> {
    let engine = web::Data::from(engine);
    let stats = web::Data::from(stats);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(engine.clone())
            .app_data(stats.clone())
            .wrap(middleware::Logger::default())
            .configure(configure)
    })
    .bind((server_config.bind_address.as_str(), server_config.bind_port))?
    .run();

    log::info!(
        "Listening on {}:{}",
        server_config.bind_address,
        server_config.bind_port
    );
    Ok(server)
}
