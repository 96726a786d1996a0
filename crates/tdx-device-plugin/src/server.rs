//! Device plugin server lifecycle.
//!
//! Startup is strictly ordered: the inventory is built before the socket is
//! bound, and the socket must answer a self-connect probe before the caller
//! may register with kubelet. The serve loop runs in its own task under a
//! [`ServeSupervisor`] that re-enters serve on errors until the restart
//! budget is spent.

use std::fmt;
use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Arc;

use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use futures::Stream;
use futures::StreamExt;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::config::PluginConfig;
use crate::detector;
use crate::detector::DeviceProbe;
use crate::device_plugin::api::device_plugin_server::DevicePluginServer;
use crate::device_plugin::TdxDevicePluginService;
use crate::errors::PluginError;
use crate::inventory::Inventory;
use crate::uds::connect_uds;

/// Serve errors tolerated before the server is given up on.
pub const MAX_RESTART_COUNT: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ServerPhase {
    Unbound,
    Listening,
    Serving,
    Registered,
}

/// Re-enters a failing serve future until it has failed more than
/// `max_restarts` times in a row.
#[derive(Debug)]
pub struct ServeSupervisor {
    restarts: u32,
    max_restarts: u32,
}

impl ServeSupervisor {
    pub fn new(max_restarts: u32) -> Self {
        Self {
            restarts: 0,
            max_restarts,
        }
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Run `serve` until it returns `Ok`.
    ///
    /// # Errors
    ///
    /// [`PluginError::ServeCrashExhausted`] on the `max_restarts + 1`th error.
    pub async fn run<F, Fut, E>(&mut self, mut serve: F) -> Result<(), Report<PluginError>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: fmt::Display,
    {
        loop {
            match serve().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.restarts += 1;
                    if self.restarts > self.max_restarts {
                        return Err(Report::new(PluginError::ServeCrashExhausted {
                            restarts: self.restarts,
                        })
                        .attach_printable(format!("last error: {e}")));
                    }
                    warn!(
                        restarts = self.restarts,
                        max_restarts = self.max_restarts,
                        "device plugin server failed, restarting: {e}"
                    );
                }
            }
        }
    }
}

/// Owns the plugin socket and drives the server through its phases.
#[derive(Debug)]
pub struct PluginServer {
    config: Arc<PluginConfig>,
    cancellation_token: CancellationToken,
    phase: ServerPhase,
}

impl PluginServer {
    pub fn new(config: Arc<PluginConfig>, cancellation_token: CancellationToken) -> Self {
        Self {
            config,
            cancellation_token,
            phase: ServerPhase::Unbound,
        }
    }

    pub fn phase(&self) -> ServerPhase {
        self.phase
    }

    fn transition(&mut self, phase: ServerPhase) {
        info!(from = %self.phase, to = %phase, "device plugin server phase");
        self.phase = phase;
    }

    /// Kubelet accepted the registration.
    pub fn mark_registered(&mut self) {
        self.transition(ServerPhase::Registered);
    }

    /// Build the inventory, bind the socket, spawn the supervised serve task
    /// and wait for the socket to accept connections.
    ///
    /// The returned handle resolves only if the server stops for good.
    #[instrument(skip_all, fields(socket = %self.config.socket_path.display()))]
    pub async fn start(
        &mut self,
        probe: &impl DeviceProbe,
    ) -> Result<JoinHandle<Result<(), Report<PluginError>>>, Report<PluginError>> {
        let detected = detector::detect(&self.config.devices, probe)?;
        let inventory = Arc::new(Inventory::build(
            &detected,
            &self.config.device_type,
            self.config.pool_size,
        ));
        info!(
            devices = inventory.len(),
            tdx_version = %detected.version,
            "built device inventory"
        );

        if inventory.is_empty() {
            warn!("device pool is empty, nothing will be allocatable");
        }

        let listener = Arc::new(bind(&self.config.socket_path)?);
        self.transition(ServerPhase::Listening);

        let serve_task = tokio::spawn(supervise_serve(
            inventory,
            self.config.allocate_env.clone(),
            self.cancellation_token.clone(),
            move || incoming(listener.clone()),
        ));

        if let Err(e) = readiness_probe(&self.config).await {
            serve_task.abort();
            return Err(e);
        }
        self.transition(ServerPhase::Serving);

        Ok(serve_task)
    }
}

/// Remove a stale socket left by a previous run and bind a fresh listener.
fn bind(socket_path: &Path) -> Result<UnixListener, Report<PluginError>> {
    match std::fs::remove_file(socket_path) {
        Ok(()) => info!("removed stale socket {}", socket_path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(Report::new(e).change_context(PluginError::StaleSocket {
                path: socket_path.to_path_buf(),
            }))
        }
    }

    let listener = UnixListener::bind(socket_path).change_context_lazy(|| {
        PluginError::BindFailure {
            path: socket_path.to_path_buf(),
        }
    })?;
    info!("gRPC server is bound to: {}", socket_path.display());
    Ok(listener)
}

#[derive(Debug, thiserror::Error)]
enum ServeError {
    #[error("failed to accept connection: {0}")]
    Accept(io::Error),
    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),
}

/// Serve attempts over fresh accept streams from `accept` until one ends
/// cleanly or the restart budget is spent.
async fn supervise_serve<A, I>(
    inventory: Arc<Inventory>,
    allocate_env: String,
    cancellation_token: CancellationToken,
    mut accept: A,
) -> Result<(), Report<PluginError>>
where
    A: FnMut() -> I,
    I: Stream<Item = io::Result<UnixStream>> + Send + 'static,
{
    let mut supervisor = ServeSupervisor::new(MAX_RESTART_COUNT);
    supervisor
        .run(|| {
            serve_once(
                inventory.clone(),
                allocate_env.clone(),
                cancellation_token.clone(),
                accept(),
            )
        })
        .await
}

/// One serve attempt. An accept error ends the attempt and is returned once
/// the open connections have drained.
async fn serve_once<I>(
    inventory: Arc<Inventory>,
    allocate_env: String,
    cancellation_token: CancellationToken,
    incoming: I,
) -> Result<(), ServeError>
where
    I: Stream<Item = io::Result<UnixStream>> + Send + 'static,
{
    // cancelled on shutdown or when this attempt fails, which also ends the
    // ListAndWatch streams opened during it
    let attempt_token = cancellation_token.child_token();
    let service = TdxDevicePluginService::new(inventory, allocate_env, attempt_token.clone());
    let (accept_error_tx, mut accept_error_rx) = oneshot::channel();
    let incoming = stop_on_accept_error(incoming, attempt_token.clone(), accept_error_tx);

    let shutdown = async move {
        attempt_token.cancelled().await;
        info!("shutting down gRPC server");
    };
    tonic::transport::Server::builder()
        .add_service(DevicePluginServer::new(service))
        .serve_with_incoming_shutdown(Box::pin(incoming), shutdown)
        .await?;

    match accept_error_rx.try_recv() {
        Ok(e) => Err(ServeError::Accept(e)),
        Err(_) => Ok(()),
    }
}

/// Accept connections from a shared listener, so serve can be re-entered
/// after a failure without rebinding.
fn incoming(
    listener: Arc<UnixListener>,
) -> impl Stream<Item = io::Result<UnixStream>> + Send + 'static {
    futures::stream::unfold(listener, |listener| async move {
        let conn = listener.accept().await.map(|(stream, _addr)| stream);
        Some((conn, listener))
    })
}

/// End `incoming` at its first error, handing the error to `accept_error`.
///
/// tonic skips accept errors and polls again, so without this a persistent
/// failure such as EMFILE would spin forever inside a single attempt.
fn stop_on_accept_error<I>(
    incoming: I,
    attempt_token: CancellationToken,
    accept_error: oneshot::Sender<io::Error>,
) -> impl Stream<Item = io::Result<UnixStream>> + Send + 'static
where
    I: Stream<Item = io::Result<UnixStream>> + Send + 'static,
{
    futures::stream::unfold(
        (Box::pin(incoming), Some(accept_error)),
        move |(mut incoming, mut accept_error)| {
            let attempt_token = attempt_token.clone();
            async move {
                match incoming.next().await? {
                    Ok(conn) => Some((Ok(conn), (incoming, accept_error))),
                    Err(e) => {
                        warn!("failed to accept connection: {e}");
                        if let Some(tx) = accept_error.take() {
                            let _ = tx.send(e);
                        }
                        attempt_token.cancel();
                        None
                    }
                }
            }
        },
    )
}

/// Dial our own socket to confirm it accepts connections.
async fn readiness_probe(config: &PluginConfig) -> Result<(), Report<PluginError>> {
    let path = &config.socket_path;
    let channel = connect_uds(path, config.connect_timeout)
        .await
        .change_context_lazy(|| PluginError::ReadinessProbeFailure { path: path.clone() })?;
    drop(channel);
    info!("device plugin socket is accepting connections");
    Ok(())
}
