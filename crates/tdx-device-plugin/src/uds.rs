//! gRPC client channels over unix domain sockets.

use std::path::Path;
use std::time::Duration;

use error_stack::Report;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tower::service_fn;
use tracing::debug;

use crate::errors::PluginError;

/// Open a channel to the gRPC server behind `socket_path`, giving up after
/// `timeout`.
pub async fn connect_uds(
    socket_path: &Path,
    timeout: Duration,
) -> Result<Channel, Report<PluginError>> {
    let connector_path = socket_path.to_path_buf();
    let connect_error = || PluginError::Connect {
        path: socket_path.to_path_buf(),
        timeout,
    };

    // The HTTP URL is a placeholder since we're using a unix socket connector
    let endpoint = Endpoint::from_static("http://tonic");
    let connect = endpoint.connect_with_connector(service_fn(move |_: Uri| {
        let socket_path = connector_path.clone();
        async move {
            let stream = UnixStream::connect(socket_path).await?;
            Ok::<_, std::io::Error>(TokioIo::new(stream))
        }
    }));

    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(channel)) => {
            debug!(socket = %socket_path.display(), "connected");
            Ok(channel)
        }
        Ok(Err(e)) => Err(Report::new(e).change_context(connect_error())),
        Err(_) => Err(Report::new(connect_error()).attach_printable("connect timed out")),
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test(tokio::test)]
    async fn missing_socket_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket = dir.path().join("absent.sock");

        let err = connect_uds(&socket, Duration::from_millis(200))
            .await
            .expect_err("nothing listens there");

        assert!(matches!(
            err.current_context(),
            PluginError::Connect { path, .. } if path == &socket
        ));
    }
}
