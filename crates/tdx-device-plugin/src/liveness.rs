//! Watches the kubelet device plugin directory for events that make the
//! running plugin unreachable.
//!
//! - kubelet recreates its socket when it restarts; the plugin must restart
//!   and register again.
//! - the plugin's own socket disappearing means kubelet can no longer reach
//!   it.
//!
//! Both end the watcher with an error, as does any failure to deliver
//! notifications.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use notify::Config;
use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::PluginConfig;
use crate::errors::PluginError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum LivenessTrigger {
    #[display("kubelet restarted")]
    KubeletRestarted,
    #[display("device plugin socket removed")]
    PluginSocketRemoved,
}

/// Decide whether a filesystem event requires a restart.
pub fn classify(
    event: &Event,
    kubelet_socket: &Path,
    plugin_socket: &Path,
) -> Option<LivenessTrigger> {
    let touches = |socket: &Path| event.paths.iter().any(|path| path == socket);

    match event.kind {
        EventKind::Create(_) if touches(kubelet_socket) => Some(LivenessTrigger::KubeletRestarted),
        EventKind::Remove(_) if touches(plugin_socket) => {
            Some(LivenessTrigger::PluginSocketRemoved)
        }
        _ => None,
    }
}

pub struct LivenessWatcher {
    kubelet_socket: PathBuf,
    plugin_socket: PathBuf,
    kubelet_restart_grace: Duration,
    rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    // dropping the watcher stops notifications
    _watcher: RecommendedWatcher,
}

impl LivenessWatcher {
    /// Start watching the directories holding the kubelet and plugin sockets.
    pub fn new(config: &PluginConfig) -> Result<Self, Report<PluginError>> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                // receiver gone means the watcher is shutting down
                let _ = tx.send(res);
            },
            Config::default(),
        )
        .change_context(PluginError::NotificationDeliveryFailure)
        .attach_printable("failed to create filesystem watcher")?;

        for dir in config.watched_dirs() {
            watcher
                .watch(&dir, RecursiveMode::NonRecursive)
                .change_context(PluginError::NotificationDeliveryFailure)
                .attach_printable_lazy(|| format!("failed to watch {}", dir.display()))?;
            info!("watching {}", dir.display());
        }

        Ok(Self {
            kubelet_socket: config.kubelet_socket.clone(),
            plugin_socket: config.socket_path.clone(),
            kubelet_restart_grace: config.kubelet_restart_grace,
            rx,
            _watcher: watcher,
        })
    }

    /// Block until a restart is required.
    ///
    /// Only ever returns an error: the reason the process has to go.
    pub async fn run(mut self) -> Result<(), Report<PluginError>> {
        loop {
            let Some(res) = self.rx.recv().await else {
                return Err(Report::new(PluginError::NotificationDeliveryFailure)
                    .attach_printable("notification channel closed"));
            };
            let event = res.change_context(PluginError::NotificationDeliveryFailure)?;

            match classify(&event, &self.kubelet_socket, &self.plugin_socket) {
                Some(LivenessTrigger::KubeletRestarted) => {
                    warn!("restart TDX device plugin due to kubelet restart");
                    // give kubelet time to come up before we are restarted
                    tokio::time::sleep(self.kubelet_restart_grace).await;
                    return Err(Report::new(PluginError::KubeletRestarted {
                        path: self.kubelet_socket,
                    }));
                }
                Some(LivenessTrigger::PluginSocketRemoved) => {
                    warn!("restart TDX device plugin due to device plugin socket being deleted");
                    return Err(Report::new(PluginError::PluginSocketRemoved {
                        path: self.plugin_socket,
                    }));
                }
                None => debug!("ignoring filesystem event: {event:?}"),
            }
        }
    }
}
