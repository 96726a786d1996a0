use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that stop the device plugin.
///
/// Every variant is fatal: it travels up to `main` inside an
/// [`error_stack::Report`] and the process exits so that the supervisor can
/// restart it.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("deprecated TDX device found at {}", path.display())]
    DeprecatedCapability { path: PathBuf },
    #[error("no TDX guest device found")]
    CapabilityNotFound,
    #[error("failed to remove stale socket {}", path.display())]
    StaleSocket { path: PathBuf },
    #[error("failed to bind device plugin socket {}", path.display())]
    BindFailure { path: PathBuf },
    #[error("failed to connect to {} within {timeout:?}", path.display())]
    Connect { path: PathBuf, timeout: Duration },
    #[error("device plugin socket {} is not accepting connections", path.display())]
    ReadinessProbeFailure { path: PathBuf },
    #[error("device plugin server crashed {restarts} times, giving up")]
    ServeCrashExhausted { restarts: u32 },
    #[error("device plugin server stopped unexpectedly")]
    ServeTaskStopped,
    #[error("failed to register with kubelet at {}", kubelet_socket.display())]
    RegistrationFailed { kubelet_socket: PathBuf },
    #[error("filesystem notification delivery failed")]
    NotificationDeliveryFailure,
    #[error("kubelet socket {} was recreated, kubelet restarted", path.display())]
    KubeletRestarted { path: PathBuf },
    #[error("device plugin socket {} was removed", path.display())]
    PluginSocketRemoved { path: PathBuf },
    #[error("failed to install signal handler")]
    SignalHandler,
}
