use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use utils::version;

use crate::detector::TdxDevicePaths;

pub const DEFAULT_PLUGIN_SOCKET: &str = "/var/lib/kubelet/device-plugins/tdxdp.sock";
pub const DEFAULT_KUBELET_SOCKET: &str = "/var/lib/kubelet/device-plugins/kubelet.sock";
pub const DEFAULT_RESOURCE_NAMESPACE: &str = "tdx.intel.com";
pub const DEFAULT_DEVICE_TYPE: &str = "tdx-guest";
pub const DEFAULT_ALLOCATE_ENV: &str = "TDX_DEVICES";
/// Mirrors the default per-node pod capacity of the kubelet.
pub const DEFAULT_POOL_SIZE: usize = 110;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_KUBELET_RESTART_GRACE: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the TDX device plugin
    Run(Box<RunArgs>),
    /// Detect the TDX guest device and exit
    Detect(DevicePathArgs),
}

#[derive(Args, Clone, Debug)]
pub struct DevicePathArgs {
    #[arg(
        long,
        default_value = "/dev/tdx-attest",
        value_hint = clap::ValueHint::FilePath,
        help = "Deprecated TDX attestation device; its presence blocks startup"
    )]
    pub deprecated_device: PathBuf,

    #[arg(
        long = "device-v1-0",
        default_value = "/dev/tdx-guest",
        value_hint = clap::ValueHint::FilePath,
        help = "TDX 1.0 guest device"
    )]
    pub device_v1_0: PathBuf,

    #[arg(
        long = "device-v1-5",
        default_value = "/dev/tdx_guest",
        value_hint = clap::ValueHint::FilePath,
        help = "TDX 1.5 guest device"
    )]
    pub device_v1_5: PathBuf,
}

impl From<&DevicePathArgs> for TdxDevicePaths {
    fn from(args: &DevicePathArgs) -> Self {
        Self {
            deprecated: args.deprecated_device.clone(),
            v1_0: args.device_v1_0.clone(),
            v1_5: args.device_v1_5.clone(),
        }
    }
}

#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    #[arg(
        long,
        env = "TDX_DP_SOCKET",
        default_value = DEFAULT_PLUGIN_SOCKET,
        value_hint = clap::ValueHint::FilePath,
        help = "Unix socket the device plugin listens on"
    )]
    pub socket_path: PathBuf,

    #[arg(
        long,
        env = "KUBELET_SOCKET",
        default_value = DEFAULT_KUBELET_SOCKET,
        value_hint = clap::ValueHint::FilePath,
        help = "Kubelet registration socket"
    )]
    pub kubelet_socket: PathBuf,

    #[arg(
        long,
        default_value = DEFAULT_RESOURCE_NAMESPACE,
        help = "Namespace of the advertised resource name"
    )]
    pub resource_namespace: String,

    #[arg(
        long,
        default_value = DEFAULT_DEVICE_TYPE,
        help = "Device type; also the prefix of every device id"
    )]
    pub device_type: String,

    #[arg(
        long,
        default_value_t = DEFAULT_POOL_SIZE,
        help = "Number of allocatable units to advertise"
    )]
    pub pool_size: usize,

    #[arg(
        long,
        default_value = DEFAULT_ALLOCATE_ENV,
        help = "Environment variable that receives the allocated device ids"
    )]
    pub allocate_env: String,

    #[arg(
        long,
        default_value_t = 5,
        help = "Timeout in seconds for unix socket connects"
    )]
    pub connect_timeout_secs: u64,

    #[arg(
        long,
        default_value_t = 1000,
        help = "Delay in milliseconds before exiting after a kubelet restart"
    )]
    pub kubelet_restart_grace_ms: u64,

    #[command(flatten)]
    pub devices: DevicePathArgs,
}

/// Runtime configuration of the device plugin.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    pub socket_path: PathBuf,
    pub kubelet_socket: PathBuf,
    pub resource_namespace: String,
    pub device_type: String,
    pub pool_size: usize,
    pub allocate_env: String,
    pub devices: TdxDevicePaths,
    pub connect_timeout: Duration,
    pub kubelet_restart_grace: Duration,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_PLUGIN_SOCKET),
            kubelet_socket: PathBuf::from(DEFAULT_KUBELET_SOCKET),
            resource_namespace: DEFAULT_RESOURCE_NAMESPACE.to_string(),
            device_type: DEFAULT_DEVICE_TYPE.to_string(),
            pool_size: DEFAULT_POOL_SIZE,
            allocate_env: DEFAULT_ALLOCATE_ENV.to_string(),
            devices: TdxDevicePaths::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            kubelet_restart_grace: DEFAULT_KUBELET_RESTART_GRACE,
        }
    }
}

impl From<&RunArgs> for PluginConfig {
    fn from(args: &RunArgs) -> Self {
        Self {
            socket_path: absolute_socket(&args.socket_path),
            kubelet_socket: absolute_socket(&args.kubelet_socket),
            resource_namespace: args.resource_namespace.clone(),
            device_type: args.device_type.clone(),
            pool_size: args.pool_size,
            allocate_env: args.allocate_env.clone(),
            devices: TdxDevicePaths::from(&args.devices),
            connect_timeout: Duration::from_secs(args.connect_timeout_secs),
            kubelet_restart_grace: Duration::from_millis(args.kubelet_restart_grace_ms),
        }
    }
}

/// Watcher event paths are built from the watched directory, so socket paths
/// must be absolute to compare equal to them.
fn absolute_socket(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

impl PluginConfig {
    /// Resource name advertised to kubelet, e.g. `tdx.intel.com/tdx-guest`.
    pub fn resource_name(&self) -> String {
        format!("{}/{}", self.resource_namespace, self.device_type)
    }

    /// Socket file name relative to the kubelet device plugin directory.
    pub fn endpoint(&self) -> String {
        self.socket_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Directories that must be watched to observe both sockets.
    pub fn watched_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = Vec::new();
        for socket in [&self.kubelet_socket, &self.socket_path] {
            let dir = socket
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .unwrap_or(Path::new("."))
                .to_path_buf();
            if !dirs.contains(&dir) {
                dirs.push(dir);
            }
        }
        dirs
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn defaults_match_kubelet_layout() {
        let config = PluginConfig::default();

        assert_eq!(config.resource_name(), "tdx.intel.com/tdx-guest");
        assert_eq!(config.endpoint(), "tdxdp.sock");
        assert_eq!(
            config.watched_dirs(),
            vec![PathBuf::from("/var/lib/kubelet/device-plugins")]
        );
    }

    #[test]
    fn run_args_parse_with_defaults() {
        let cli = Cli::try_parse_from(["tdx-device-plugin", "run", "--pool-size", "8"])
            .expect("should parse run args");

        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        let config = PluginConfig::from(args.as_ref());

        assert_eq!(config.pool_size, 8);
        assert_eq!(config.allocate_env, "TDX_DEVICES");
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.kubelet_restart_grace, Duration::from_secs(1));
        assert_eq!(config.devices, TdxDevicePaths::default());
    }

    #[test]
    fn relative_socket_paths_are_made_absolute() {
        let cli = Cli::try_parse_from([
            "tdx-device-plugin",
            "run",
            "--socket-path",
            "tdxdp.sock",
            "--kubelet-socket",
            "sockets/kubelet.sock",
        ])
        .expect("should parse run args");
        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };

        let config = PluginConfig::from(args.as_ref());
        let cwd = std::env::current_dir().expect("cwd");

        assert_eq!(config.socket_path, cwd.join("tdxdp.sock"));
        assert_eq!(config.kubelet_socket, cwd.join("sockets/kubelet.sock"));
        assert_eq!(config.endpoint(), "tdxdp.sock");
        assert_eq!(config.watched_dirs(), vec![cwd.join("sockets"), cwd]);
    }

    #[test]
    fn sockets_in_different_dirs_are_both_watched() {
        let config = PluginConfig {
            socket_path: PathBuf::from("/run/tdx/tdxdp.sock"),
            ..PluginConfig::default()
        };

        assert_eq!(
            config.watched_dirs(),
            vec![
                PathBuf::from("/var/lib/kubelet/device-plugins"),
                PathBuf::from("/run/tdx"),
            ]
        );
    }
}
