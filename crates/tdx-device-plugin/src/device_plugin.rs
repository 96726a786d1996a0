#![allow(clippy::doc_markdown)]
pub mod api {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use api::device_plugin_server::DevicePlugin;
use api::AllocateRequest;
use api::AllocateResponse;
use api::ContainerAllocateRequest;
use api::ContainerAllocateResponse;
use api::DevicePluginOptions;
use api::Empty;
use api::ListAndWatchResponse;
use api::PreStartContainerRequest;
use api::PreStartContainerResponse;
use api::PreferredAllocationRequest;
use api::PreferredAllocationResponse;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::inventory::Inventory;

/// Device plugin API version the plugin is built against.
pub const API_VERSION: &str = "v1beta1";

/// Options advertised to kubelet. PreStartContainer is required even though
/// it does nothing, GetPreferredAllocation is not offered.
pub const PLUGIN_OPTIONS: DevicePluginOptions = DevicePluginOptions {
    pre_start_required: true,
    get_preferred_allocation_available: false,
};

/// DevicePlugin service implementation
///
/// Handlers only read the inventory, so tonic may run them concurrently.
#[derive(Debug)]
pub struct TdxDevicePluginService {
    inventory: Arc<Inventory>,
    /// environment variable carrying the allocated device ids
    allocate_env: String,
    /// ends every ListAndWatch stream on shutdown
    cancellation_token: CancellationToken,
}

impl TdxDevicePluginService {
    pub fn new(
        inventory: Arc<Inventory>,
        allocate_env: String,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            inventory,
            allocate_env,
            cancellation_token,
        }
    }

    /// Requested ids are passed through verbatim. kubelet is trusted to only
    /// hand out advertised, unallocated ids, so nothing is validated here.
    fn container_response(&self, request: ContainerAllocateRequest) -> ContainerAllocateResponse {
        let devices = request.devices_ids.join(",");
        info!(devices = %devices, "received allocate request");

        ContainerAllocateResponse {
            envs: HashMap::from([(self.allocate_env.clone(), devices)]),
            ..Default::default()
        }
    }
}

#[tonic::async_trait]
impl DevicePlugin for TdxDevicePluginService {
    /// get device plugin options
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        debug!("getting device plugin options");

        Ok(Response::new(PLUGIN_OPTIONS))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    /// Send the full inventory once, then hold the stream open until shutdown.
    ///
    /// The inventory never changes, so there is never a second message.
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!("starting to watch device list");

        let (tx, rx) = mpsc::unbounded_channel();
        let cancellation_token = self.cancellation_token.clone();
        let devices = self.inventory.to_api_devices();

        tokio::spawn(async move {
            let device_count = devices.len();
            if let Err(e) = tx.send(Ok(ListAndWatchResponse { devices })) {
                error!("failed to send initial device list: {e}");
                return;
            }
            info!(device_count, "sent device list");

            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("ListAndWatch exit");
                }
                _ = tx.closed() => {
                    info!("ListAndWatch stream closed by kubelet");
                }
            }
        });

        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    /// no preference, kubelet falls back to its own selection
    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        debug!("getting preferred device allocation: {:?}", request.get_ref());
        Ok(Response::new(PreferredAllocationResponse::default()))
    }

    /// allocate devices to containers, one response per request in order
    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let req = request.into_inner();

        let container_responses: Vec<_> = req
            .container_requests
            .into_iter()
            .map(|container_req| self.container_response(container_req))
            .collect();

        debug!(
            containers = container_responses.len(),
            "device allocation completed"
        );
        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    async fn pre_start_container(
        &self,
        request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        debug!("pre-start container: {:?}", request.get_ref().devices_ids);
        Ok(Response::new(PreStartContainerResponse {}))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::time::Duration;

    use similar_asserts::assert_eq;
    use test_log::test;
    use tokio_stream::StreamExt;

    use super::*;
    use crate::detector::DetectedDevice;
    use crate::detector::TdxVersion;

    fn service(pool_size: usize, token: CancellationToken) -> TdxDevicePluginService {
        let detected = DetectedDevice {
            version: TdxVersion::V1_0,
            path: PathBuf::from("/dev/tdx-guest"),
        };
        let inventory = Arc::new(Inventory::build(&detected, "tdx-guest", pool_size));
        TdxDevicePluginService::new(inventory, "TDX_DEVICES".to_string(), token)
    }

    fn container(ids: &[&str]) -> ContainerAllocateRequest {
        ContainerAllocateRequest {
            devices_ids: ids.iter().map(|id| id.to_string()).collect(),
        }
    }

    #[test(tokio::test)]
    async fn options_require_pre_start() {
        let service = service(1, CancellationToken::new());

        let options = service
            .get_device_plugin_options(Request::new(Empty {}))
            .await
            .expect("options")
            .into_inner();

        assert!(options.pre_start_required);
        assert!(!options.get_preferred_allocation_available);
    }

    #[test(tokio::test)]
    async fn allocate_keeps_request_order_and_id_order() {
        let service = service(4, CancellationToken::new());
        let request = AllocateRequest {
            container_requests: vec![
                container(&["tdx-guest-3", "tdx-guest-1"]),
                container(&[]),
                container(&["a", "b"]),
            ],
        };

        let response = service
            .allocate(Request::new(request))
            .await
            .expect("allocate never fails")
            .into_inner();

        let envs: Vec<Option<&str>> = response
            .container_responses
            .iter()
            .map(|r| r.envs.get("TDX_DEVICES").map(String::as_str))
            .collect();
        assert_eq!(
            envs,
            vec![Some("tdx-guest-3,tdx-guest-1"), Some(""), Some("a,b")]
        );
        assert!(response
            .container_responses
            .iter()
            .all(|r| r.envs.len() == 1 && r.devices.is_empty() && r.mounts.is_empty()));
    }

    #[test(tokio::test)]
    async fn allocate_passes_unknown_and_duplicate_ids_through() {
        let service = service(1, CancellationToken::new());
        let request = AllocateRequest {
            container_requests: vec![container(&["nope", "nope"])],
        };

        let response = service
            .allocate(Request::new(request))
            .await
            .expect("allocate never fails")
            .into_inner();

        assert_eq!(response.container_responses[0].envs["TDX_DEVICES"], "nope,nope");
    }

    #[test(tokio::test)]
    async fn preferred_allocation_and_pre_start_are_empty() {
        let service = service(1, CancellationToken::new());

        let preferred = service
            .get_preferred_allocation(Request::new(PreferredAllocationRequest::default()))
            .await
            .expect("preferred allocation")
            .into_inner();
        assert!(preferred.container_responses.is_empty());

        service
            .pre_start_container(Request::new(PreStartContainerRequest {
                devices_ids: vec!["tdx-guest-0".to_string()],
            }))
            .await
            .expect("pre-start never fails");
    }

    #[test(tokio::test)]
    async fn list_and_watch_sends_inventory_once_and_ends_on_cancel() {
        let token = CancellationToken::new();
        let service = service(5, token.clone());

        let mut stream = service
            .list_and_watch(Request::new(Empty {}))
            .await
            .expect("list and watch")
            .into_inner();

        let first = stream
            .next()
            .await
            .expect("initial message")
            .expect("initial message is ok");
        let ids: HashSet<String> = first.devices.into_iter().map(|d| d.id).collect();
        let expected: HashSet<String> = (0..5).map(|i| format!("tdx-guest-{i}")).collect();
        assert_eq!(ids, expected);

        let pending = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
        assert!(pending.is_err(), "stream must stay open until cancellation");

        token.cancel();
        let end = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("stream should end after cancellation");
        assert!(end.is_none());
    }
}
