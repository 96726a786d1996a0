use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::PluginConfig;
use crate::detector::DeviceProbe;
use crate::errors::PluginError;
use crate::liveness::LivenessWatcher;
use crate::registration::register_with_kubelet;
use crate::server::PluginServer;

/// Run the device plugin until something requires a restart.
///
/// Returns `Ok` only when a termination signal was received; every other
/// way out is an error the caller must turn into a failing exit.
pub async fn run(
    config: PluginConfig,
    probe: impl DeviceProbe,
) -> Result<(), Report<PluginError>> {
    let config = Arc::new(config);
    let cancellation_token = CancellationToken::new();

    let result = run_until_stopped(config, &probe, cancellation_token.clone()).await;

    // ends every open ListAndWatch stream
    cancellation_token.cancel();
    result
}

async fn run_until_stopped(
    config: Arc<PluginConfig>,
    probe: &impl DeviceProbe,
    cancellation_token: CancellationToken,
) -> Result<(), Report<PluginError>> {
    let mut server = PluginServer::new(config.clone(), cancellation_token);
    let serve_task = server.start(probe).await?;

    // armed before registering so a kubelet restart during registration
    // is not missed
    let watcher = LivenessWatcher::new(&config)?;

    register_with_kubelet(&config).await?;
    server.mark_registered();

    tokio::select! {
        result = watcher.run() => result,
        result = wait_for_server(serve_task) => result,
        result = shutdown_signal() => result,
    }
}

/// The serve task only finishes when the server is gone for good.
async fn wait_for_server(
    serve_task: JoinHandle<Result<(), Report<PluginError>>>,
) -> Result<(), Report<PluginError>> {
    match serve_task.await {
        Ok(Ok(())) => Err(Report::new(PluginError::ServeTaskStopped)),
        Ok(Err(e)) => Err(e),
        Err(e) => Err(Report::new(e).change_context(PluginError::ServeTaskStopped)),
    }
}

async fn shutdown_signal() -> Result<(), Report<PluginError>> {
    use tokio::signal::unix::signal;
    use tokio::signal::unix::SignalKind;

    let mut sigterm = signal(SignalKind::terminate()).change_context(PluginError::SignalHandler)?;
    let mut sigint = signal(SignalKind::interrupt()).change_context(PluginError::SignalHandler)?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("Received SIGINT, shutting down"),
    }
    Ok(())
}
