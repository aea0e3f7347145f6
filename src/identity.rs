//! The implementation for CSI identity service

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{debug, warn};

use crate::csi::identity_server::Identity;
use crate::csi::plugin_capability::service::Type as ServiceType;
use crate::csi::plugin_capability::Service;
use crate::csi::{
    GetPluginCapabilitiesRequest, GetPluginCapabilitiesResponse, GetPluginInfoRequest,
    GetPluginInfoResponse, PluginCapability, ProbeRequest, ProbeResponse,
};
use crate::driver::{DRIVER_NAME, DRIVER_VERSION};
use crate::emma::Client;

/// for `IdentityService` implementation
pub struct IdentityService {
    name: &'static str,
    version: &'static str,
    /// Present in the controller process; the probe uses it for a
    /// provider dependency check. The node process carries none.
    client: Option<Arc<Client>>,
}

impl IdentityService {
    /// Create `IdentityService`.
    pub fn new(client: Option<Arc<Client>>) -> Self {
        Self {
            name: DRIVER_NAME,
            version: DRIVER_VERSION,
            client,
        }
    }
}

#[tonic::async_trait]
impl Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        request: Request<GetPluginInfoRequest>,
    ) -> Result<Response<GetPluginInfoResponse>, Status> {
        debug!("get_plugin_info request: {:?}", request.get_ref());

        if self.name.is_empty() {
            return Err(Status::unavailable("driver name not configured"));
        }
        if self.version.is_empty() {
            return Err(Status::unavailable("driver version not configured"));
        }

        Ok(Response::new(GetPluginInfoResponse {
            name: self.name.to_owned(),
            vendor_version: self.version.to_owned(),
            ..Default::default()
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        request: Request<GetPluginCapabilitiesRequest>,
    ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
        debug!("get_plugin_capabilities request: {:?}", request.get_ref());

        let capabilities = [ServiceType::ControllerService, ServiceType::VolumeAccessibilityConstraints]
            .into_iter()
            .map(|service_type| PluginCapability {
                r#type: Some(crate::csi::plugin_capability::Type::Service(Service {
                    r#type: service_type as i32,
                })),
            })
            .collect();

        Ok(Response::new(GetPluginCapabilitiesResponse { capabilities }))
    }

    async fn probe(
        &self,
        request: Request<ProbeRequest>,
    ) -> Result<Response<ProbeResponse>, Status> {
        debug!("probe request: {:?}", request.get_ref());

        // The controller process checks that the provider API is
        // reachable and the credentials still work. A failure is
        // reported as not-ready, never as an RPC error.
        if let Some(client) = &self.client {
            if let Err(err) = client.get_data_centers().await {
                warn!(error = %err, "provider health check failed");
                return Ok(Response::new(ProbeResponse { ready: Some(false) }));
            }
            debug!("provider health check passed");
        }

        Ok(Response::new(ProbeResponse { ready: Some(true) }))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use axum::http::StatusCode as AxumStatus;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;

    async fn token_handler() -> impl IntoResponse {
        Json(json!({
            "accessToken": "fake-token",
            "refreshToken": "fake-refresh",
            "expiresIn": 3600,
        }))
    }

    async fn healthy_data_centers_handler() -> impl IntoResponse {
        Json(json!([{"id": "aws-eu-west-2", "name": "eu-west-2"}]))
    }

    async fn failing_data_centers_handler() -> impl IntoResponse {
        (
            AxumStatus::INTERNAL_SERVER_ERROR,
            Json(json!({"message": "upstream unavailable"})),
        )
    }

    /// Provider double whose data-centers endpoint is scripted healthy
    /// or broken; authentication always succeeds.
    async fn spawn_client(healthy: bool) -> Arc<Client> {
        let data_centers = if healthy {
            get(healthy_data_centers_handler)
        } else {
            get(failing_data_centers_handler)
        };
        let app = Router::new()
            .route("/v1/issue-token", post(token_handler))
            .route("/v1/data-centers", data_centers);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = Client::connect(&format!("http://{addr}"), "test-client", "test-secret")
            .await
            .unwrap();
        Arc::new(client)
    }

    #[tokio::test]
    async fn plugin_info_reports_driver_name_and_version() {
        let identity = IdentityService::new(None);
        let response = identity
            .get_plugin_info(Request::new(GetPluginInfoRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.name, "csi.emma.ms");
        assert_eq!(response.vendor_version, env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn plugin_capabilities_include_controller_service_and_topology() {
        let identity = IdentityService::new(None);
        let response = identity
            .get_plugin_capabilities(Request::new(GetPluginCapabilitiesRequest {}))
            .await
            .unwrap()
            .into_inner();

        let types: Vec<i32> = response
            .capabilities
            .iter()
            .filter_map(|capability| match &capability.r#type {
                Some(crate::csi::plugin_capability::Type::Service(service)) => {
                    Some(service.r#type)
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            types,
            vec![
                ServiceType::ControllerService as i32,
                ServiceType::VolumeAccessibilityConstraints as i32,
            ]
        );
    }

    #[tokio::test]
    async fn probe_without_provider_client_is_ready() {
        let identity = IdentityService::new(None);
        let response = identity
            .probe(Request::new(ProbeRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.ready, Some(true));
    }

    #[tokio::test]
    async fn probe_with_healthy_provider_is_ready() {
        let identity = IdentityService::new(Some(spawn_client(true).await));
        let response = identity
            .probe(Request::new(ProbeRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.ready, Some(true));
    }

    #[tokio::test]
    async fn probe_with_failing_provider_reports_not_ready() {
        let identity = IdentityService::new(Some(spawn_client(false).await));

        // The dependency-check failure must not fail the RPC itself.
        let response = identity
            .probe(Request::new(ProbeRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.ready, Some(false));
    }
}
