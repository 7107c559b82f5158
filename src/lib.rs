pub mod config;
pub mod control_server;
pub mod discord;
mod logging;
pub mod presence;

use std::future::Future;
use std::process::ExitCode;
use std::sync::Arc;

use control_server::ControlServer;
use discord::DiscordClient;
use presence::{start_heartbeat_background_task, ConnectionManager, PresenceError, SessionClient};

pub fn run() -> ExitCode {
    let _log_guard = logging::init_logging();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(serve(
        DiscordClient::new(),
        config::CONTROL_SERVER_ADDR,
        wait_for_shutdown_signal(),
    ));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Initial connection failed, exiting: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Connect, publish the default status, expose the control server and keep
/// the session alive until `shutdown` resolves. Only the initial bind is
/// fatal.
async fn serve<C, F>(client: C, addr: &str, shutdown: F) -> Result<(), PresenceError>
where
    C: SessionClient + 'static,
    F: Future<Output = ()>,
{
    let binding = config::default_binding();
    let start = config::default_start();
    let manager = Arc::new(ConnectionManager::new(client, binding.clone(), start));

    manager.bind(binding.client_id, &binding.app_name).await?;

    tracing::info!("Setting initial activity...");
    if let Err(e) = manager.apply(config::default_status(start)).await {
        tracing::warn!("Initial activity could not be set: {}", e);
    }

    let control_server = match ControlServer::start(
        addr,
        Arc::clone(&manager),
        tokio::runtime::Handle::current(),
    ) {
        Ok(server) => Some(server),
        Err(e) => {
            tracing::error!("{}", e);
            None
        }
    };

    let heartbeat =
        start_heartbeat_background_task(Arc::clone(&manager), config::HEARTBEAT_INTERVAL);

    shutdown.await;

    tracing::info!("Shutting down...");
    heartbeat.abort();
    if let Some(server) = control_server {
        server.stop();
    }
    manager.shutdown().await;

    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
        }
    }
}
