//! Driver-wide constants and the Unix-domain-socket gRPC server both
//! processes run.

use std::path::Path;

use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::info;

use crate::controller::ControllerService;
use crate::csi::controller_server::ControllerServer;
use crate::csi::identity_server::IdentityServer;
use crate::csi::node_server::NodeServer;
use crate::identity::IdentityService;
use crate::node::NodeService;

/// CSI driver name advertised to the orchestrator.
pub const DRIVER_NAME: &str = "csi.emma.ms";

/// Driver version advertised to the orchestrator.
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Topology key carrying the data centre a node lives in.
pub const TOPOLOGY_DATACENTER_KEY: &str = "topology.csi.emma.ms/datacenter";

/// Environment variable the node agent reads its data centre from.
pub const DATACENTER_ENV: &str = "EMMA_DATACENTER_ID";

/// Provider limit on volumes attached to one VM.
pub const MAX_VOLUMES_PER_NODE: i64 = 16;

/// Strip the `unix://` scheme from a CSI endpoint.
pub fn socket_path(endpoint: &str) -> anyhow::Result<&str> {
    endpoint
        .strip_prefix("unix://")
        .filter(|path| path.starts_with('/'))
        .ok_or_else(|| {
            anyhow::anyhow!("invalid endpoint {endpoint}, expected unix:///path/to/csi.sock")
        })
}

/// Remove a stale socket file left behind by a previous run.
fn remove_socket_file(path: &str) -> anyhow::Result<()> {
    if Path::new(path).exists() {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

/// Serve the CSI services on the endpoint until SIGINT or SIGTERM.
/// Identity is always registered; controller and node depend on the
/// process role.
pub async fn serve(
    endpoint: &str,
    identity: IdentityService,
    controller: Option<ControllerService>,
    node: Option<NodeService>,
) -> anyhow::Result<()> {
    let path = socket_path(endpoint)?;
    remove_socket_file(path)?;
    if let Some(parent) = Path::new(path).parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let listener = UnixListener::bind(path)?;
    let incoming = UnixListenerStream::new(listener);
    info!(endpoint, "CSI gRPC server listening");

    Server::builder()
        .add_service(IdentityServer::new(identity))
        .add_optional_service(controller.map(ControllerServer::new))
        .add_optional_service(node.map(NodeServer::new))
        .serve_with_incoming_shutdown(incoming, shutdown_signal())
        .await?;

    info!("CSI gRPC server stopped");
    remove_socket_file(path)?;
    Ok(())
}

/// Resolve when the process receives SIGINT or SIGTERM.
async fn shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn socket_path_strips_the_unix_scheme() {
        assert_eq!(
            socket_path("unix:///var/lib/csi/csi.sock").unwrap(),
            "/var/lib/csi/csi.sock"
        );
    }

    #[test]
    fn socket_path_rejects_tcp_endpoints() {
        assert!(socket_path("tcp://0.0.0.0:10000").is_err());
        assert!(socket_path("unix://relative/path.sock").is_err());
        assert!(socket_path("/no/scheme.sock").is_err());
    }
}
