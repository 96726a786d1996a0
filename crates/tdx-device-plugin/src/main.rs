use std::process::ExitCode;

use clap::Parser;
use tdx_device_plugin::app;
use tdx_device_plugin::config::Cli;
use tdx_device_plugin::config::Commands;
use tdx_device_plugin::config::DevicePathArgs;
use tdx_device_plugin::config::PluginConfig;
use tdx_device_plugin::config::RunArgs;
use tdx_device_plugin::detector;
use tdx_device_plugin::detector::HostDeviceProbe;
use tdx_device_plugin::detector::TdxDevicePaths;
use utils::logging;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> ExitCode {
    setup_global_hooks();

    let cli = Cli::parse();
    logging::init();

    match cli.command {
        Commands::Run(run_args) => run_plugin(&run_args).await,
        Commands::Detect(device_args) => run_detect(&device_args),
    }
}

/// Every way out of the plugin except a termination signal is fatal, the
/// supervisor is expected to restart us.
async fn run_plugin(run_args: &RunArgs) -> ExitCode {
    tracing::info!("Intel TDX device plugin starting {}", &**version::VERSION);

    match app::run(PluginConfig::from(run_args), HostDeviceProbe).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(report) => {
            tracing::error!("TDX device plugin terminated: {report:?}");
            ExitCode::FAILURE
        }
    }
}

fn run_detect(device_args: &DevicePathArgs) -> ExitCode {
    match detector::detect(&TdxDevicePaths::from(device_args), &HostDeviceProbe) {
        Ok(detected) => {
            println!("TDX {} guest device: {}", detected.version, detected.path.display());
            ExitCode::SUCCESS
        }
        Err(report) => {
            tracing::error!("TDX device detection failed: {report:?}");
            ExitCode::FAILURE
        }
    }
}
