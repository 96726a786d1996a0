use error_stack::Report;
use error_stack::ResultExt;
use tonic::Request;
use tracing::info;
use tracing::instrument;

use crate::config::PluginConfig;
use crate::device_plugin::api::registration_client::RegistrationClient;
use crate::device_plugin::api::RegisterRequest;
use crate::device_plugin::API_VERSION;
use crate::device_plugin::PLUGIN_OPTIONS;
use crate::errors::PluginError;
use crate::uds::connect_uds;

/// Build the one-shot registration request for this plugin.
pub fn registration_request(config: &PluginConfig) -> RegisterRequest {
    RegisterRequest {
        version: API_VERSION.to_string(),
        endpoint: config.endpoint(),
        resource_name: config.resource_name(),
        options: Some(PLUGIN_OPTIONS),
    }
}

/// Register the device plugin with kubelet.
///
/// The connection is dropped as soon as the call returns. There is no retry:
/// a failed registration is fatal and the restart is left to the supervisor.
#[instrument(skip_all, fields(kubelet_socket = %config.kubelet_socket.display()))]
pub async fn register_with_kubelet(config: &PluginConfig) -> Result<(), Report<PluginError>> {
    let registration_failed = || PluginError::RegistrationFailed {
        kubelet_socket: config.kubelet_socket.clone(),
    };

    info!("registering device plugin with kubelet");

    let channel = connect_uds(&config.kubelet_socket, config.connect_timeout)
        .await
        .change_context_lazy(registration_failed)?;
    let mut client = RegistrationClient::new(channel);

    let request = registration_request(config);
    client
        .register(Request::new(request))
        .await
        .change_context_lazy(registration_failed)
        .attach_printable_lazy(|| format!("resource name: {}", config.resource_name()))?;

    info!(
        resource_name = %config.resource_name(),
        "successfully registered device plugin with kubelet"
    );
    Ok(())
}
