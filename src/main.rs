use std::sync::Arc;

use clap::Parser;

use execbox::config::CliArgs;
use execbox::engine::Engine;
use execbox::stats::ExecutionStats;
use execbox::web_server::build_server;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let config = cli.to_config()?;

    let stats = Arc::new(ExecutionStats::new());
    let engine = Engine::from_config(&config)?.with_observer(stats.clone());

    // Leftovers of a previous process that did not shut down cleanly
    if let Err(e) = engine.workspaces().sweep_stale() {
        log::warn!("Failed to sweep stale workspaces: {e:#}");
    }
    let runner = engine.runner().clone();
    match tokio::task::spawn_blocking(move || {
        let version = runner.probe();
        let reclaimed = runner.reclaim_orphans();
        (runner.name(), version, reclaimed)
    })
    .await?
    {
        (name, Ok(version), reclaimed) => {
            log::info!("Isolation runtime {name} is available: {version}");
            if let Err(e) = reclaimed {
                log::warn!("Failed to reclaim orphaned sandboxes: {e:#}");
            }
        }
        (name, Err(e), _) => {
            log::warn!("Isolation runtime {name} is not available, executions will fail: {e:#}");
        }
    }

    let engine = Arc::new(engine);
    let shutdown_token = engine.shutdown_token();

    // ======= PREPARATION END, EXECUTION START =======

    let server = build_server(&config.server, engine, stats)?;
    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
        }
    }

    // 1. Stop every running sandbox so in-flight requests finish quickly
    shutdown_token.cancel();

    // 2. Shutdown actix-web server gracefully
    server_handle.stop(true).await;

    log::info!("Shutdown complete");
    Ok(())
}
