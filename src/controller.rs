//! The implementation for CSI controller service
//!
//! Maps controller RPCs onto ordered provider operations: validate,
//! quantise, mutate, then poll until the volume lifecycle reaches the
//! requested state. Every RPC re-reads provider state first so
//! repeated delivery converges instead of failing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::csi::controller_server::Controller;
use crate::csi::controller_service_capability::rpc::Type as RpcType;
use crate::csi::controller_service_capability::{self, Rpc};
use crate::csi::list_volumes_response;
use crate::csi::validate_volume_capabilities_response::Confirmed;
use crate::csi::volume_capability::access_mode::Mode as AccessMode;
use crate::csi::volume_capability::AccessType;
use crate::csi::{
    ControllerExpandVolumeRequest, ControllerExpandVolumeResponse, ControllerGetCapabilitiesRequest,
    ControllerGetCapabilitiesResponse, ControllerGetVolumeRequest, ControllerGetVolumeResponse,
    ControllerPublishVolumeRequest, ControllerPublishVolumeResponse, ControllerServiceCapability,
    ControllerUnpublishVolumeRequest, ControllerUnpublishVolumeResponse, CreateSnapshotRequest,
    CreateSnapshotResponse, CreateVolumeRequest, CreateVolumeResponse, DeleteSnapshotRequest,
    DeleteSnapshotResponse, DeleteVolumeRequest, DeleteVolumeResponse, GetCapacityRequest,
    GetCapacityResponse, ListSnapshotsRequest, ListSnapshotsResponse, ListVolumesRequest,
    ListVolumesResponse, ValidateVolumeCapabilitiesRequest, ValidateVolumeCapabilitiesResponse,
    Volume, VolumeCapability, VolumeCondition,
};
use crate::emma::{Client, EmmaError, VolumeStatus};
use crate::metrics::{self, OperationTimer};

/// StorageClass parameter naming the performance class.
const PARAM_TYPE: &str = "type";
/// StorageClass parameter naming the data centre. Required.
const PARAM_DATA_CENTER_ID: &str = "dataCenterId";
/// StorageClass parameter naming the filesystem.
const PARAM_FS_TYPE: &str = "fsType";

const DEFAULT_VOLUME_TYPE: &str = "ssd";
const DEFAULT_FS_TYPE: &str = "ext4";

const VOLUME_CREATE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const VOLUME_ATTACH_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const VOLUME_DETACH_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const VOLUME_RESIZE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Bytes per gibibyte.
const BYTES_PER_GIB: i64 = 1024 * 1024 * 1024;

/// Largest volume the provider accepts, in GiB.
const MAX_VOLUME_GIB: i64 = 2048;

impl From<EmmaError> for Status {
    fn from(error: EmmaError) -> Self {
        match error {
            EmmaError::InvalidArgument(message) => Status::invalid_argument(message),
            EmmaError::Unauthenticated(message) => Status::unauthenticated(message),
            EmmaError::PermissionDenied(message) => Status::permission_denied(message),
            EmmaError::NotFound { .. } => Status::not_found(error.to_string()),
            EmmaError::Conflict { .. } => Status::failed_precondition(error.to_string()),
            EmmaError::VolumeFailed { .. } | EmmaError::Timeout { .. } | EmmaError::Api { .. } => {
                Status::internal(error.to_string())
            }
            EmmaError::Http(_) => Status::unavailable(error.to_string()),
        }
    }
}

/// for `ControllerService` implementation
pub struct ControllerService {
    /// Controller capabilities
    caps: Vec<ControllerServiceCapability>,
    /// Provider API client, shared with the identity probe
    client: Arc<Client>,
}

impl ControllerService {
    /// Create `ControllerService`.
    pub fn new(client: Arc<Client>) -> Self {
        let cap_vec = vec![
            RpcType::CreateDeleteVolume,
            RpcType::PublishUnpublishVolume,
            RpcType::ExpandVolume,
            RpcType::ListVolumes,
        ];
        let caps = cap_vec
            .into_iter()
            .map(|rpc_type| ControllerServiceCapability {
                r#type: Some(controller_service_capability::Type::Rpc(Rpc {
                    r#type: rpc_type as i32,
                })),
            })
            .collect();

        Self { caps, client }
    }

    /// Validate request with controller capabilities.
    fn validate_request_capability(&self, rpc_type: RpcType) -> bool {
        rpc_type == RpcType::Unknown
            || self.caps.iter().any(|cap| {
                matches!(
                    &cap.r#type,
                    Some(controller_service_capability::Type::Rpc(rpc))
                        if rpc.r#type == rpc_type as i32
                )
            })
    }

    /// Resolve the orchestrator node identifier to a provider VM id:
    /// integer ids pass through, names are searched in the cluster
    /// membership records.
    async fn resolve_node_id(&self, node_id: &str) -> Result<i64, Status> {
        if let Ok(vm_id) = node_id.parse::<i64>() {
            return Ok(vm_id);
        }

        debug!(node_id, "node id is not numeric, searching cluster membership");
        let clusters = self
            .client
            .list_kubernetes_clusters()
            .await
            .map_err(|err| Status::internal(format!("failed to list clusters: {err}")))?;

        for cluster in &clusters {
            for group in &cluster.node_groups {
                for node in &group.nodes {
                    if node.name == node_id {
                        debug!(node_id, vm_id = node.id, cluster = %cluster.name, "resolved node");
                        return Ok(node.id);
                    }
                }
            }
        }

        Err(Status::invalid_argument(format!(
            "node not found with name: {node_id}"
        )))
    }

    async fn do_create_volume(
        &self,
        req: CreateVolumeRequest,
    ) -> Result<CreateVolumeResponse, Status> {
        let rpc_type = RpcType::CreateDeleteVolume;
        if !self.validate_request_capability(rpc_type) {
            return Err(Status::invalid_argument(format!(
                "unsupported capability {rpc_type:?}"
            )));
        }

        if req.name.is_empty() {
            return Err(Status::invalid_argument("name missing in request"));
        }
        if req.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument(
                "volume capabilities missing in request",
            ));
        }
        validate_volume_capabilities(&req.volume_capabilities)?;

        let requested_gib = requested_gib(req.capacity_range.as_ref())?;
        let size_gib = round_up_to_power_of_two(requested_gib);
        if size_gib != requested_gib {
            info!(
                requested_gib,
                size_gib, "rounded volume size to the next power of two"
            );
        }

        let volume_type = req
            .parameters
            .get(PARAM_TYPE)
            .filter(|value| !value.is_empty())
            .map_or(DEFAULT_VOLUME_TYPE, String::as_str);
        let data_center_id = req
            .parameters
            .get(PARAM_DATA_CENTER_ID)
            .filter(|value| !value.is_empty())
            .map(String::as_str)
            .ok_or_else(|| Status::invalid_argument("dataCenterId parameter is required"))?;
        let fs_type = req
            .parameters
            .get(PARAM_FS_TYPE)
            .filter(|value| !value.is_empty())
            .map_or(DEFAULT_FS_TYPE, String::as_str);
        if fs_type != "ext4" && fs_type != "xfs" {
            return Err(Status::invalid_argument(format!(
                "unsupported filesystem type: {fs_type} (supported: ext4, xfs)"
            )));
        }

        self.client
            .validate_data_center(data_center_id)
            .await
            .map_err(|err| Status::invalid_argument(format!("invalid data center: {err}")))?;

        info!(
            name = %req.name,
            size_gib,
            volume_type,
            data_center_id,
            fs_type,
            "creating volume"
        );
        let volume = self
            .client
            .create_volume(&req.name, size_gib, volume_type, data_center_id)
            .await
            .map_err(|err| Status::internal(format!("failed to create volume: {err}")))?;

        info!(volume_id = volume.id, "volume created, waiting for AVAILABLE status");
        let volume = match self
            .client
            .wait_for_volume_status(volume.id, VolumeStatus::Available, VOLUME_CREATE_TIMEOUT)
            .await
        {
            Ok(volume) => volume,
            Err(err) => {
                // Clean up the half-created volume so the orchestrator
                // retry starts from scratch.
                if let Err(delete_err) = self.client.delete_volume(volume.id).await {
                    warn!(
                        volume_id = volume.id,
                        error = %delete_err,
                        "failed to clean up volume after unsuccessful create"
                    );
                }
                return Err(Status::internal(format!(
                    "volume did not become available: {err}"
                )));
            }
        };

        info!(volume_id = volume.id, "volume available");
        let volume_context = HashMap::from([
            (PARAM_TYPE.to_owned(), volume.volume_type.clone()),
            (PARAM_DATA_CENTER_ID.to_owned(), volume.data_center_id.clone()),
            (PARAM_FS_TYPE.to_owned(), fs_type.to_owned()),
        ]);

        Ok(CreateVolumeResponse {
            volume: Some(Volume {
                volume_id: volume.id.to_string(),
                capacity_bytes: volume.size_gb * BYTES_PER_GIB,
                volume_context,
                ..Default::default()
            }),
        })
    }

    async fn do_delete_volume(
        &self,
        req: DeleteVolumeRequest,
    ) -> Result<DeleteVolumeResponse, Status> {
        let rpc_type = RpcType::CreateDeleteVolume;
        if !self.validate_request_capability(rpc_type) {
            return Err(Status::invalid_argument(format!(
                "unsupported capability {rpc_type:?}"
            )));
        }

        let volume_id = parse_volume_id(&req.volume_id)?;

        let volume = match self.client.get_volume(volume_id).await {
            Ok(volume) => volume,
            Err(EmmaError::NotFound { .. }) => {
                info!(volume_id, "volume not found, treating delete as success");
                return Ok(DeleteVolumeResponse {});
            }
            Err(err) => {
                return Err(Status::internal(format!("failed to get volume: {err}")));
            }
        };

        if let Some(vm_id) = volume.attached_to_id {
            info!(volume_id, vm_id, "volume still attached, detaching first");
            self.client
                .detach_volume(vm_id, volume_id)
                .await
                .map_err(|err| {
                    Status::internal(format!("failed to detach volume before delete: {err}"))
                })?;
            self.client
                .wait_for_volume_detachment(volume_id, VOLUME_DETACH_TIMEOUT)
                .await
                .map_err(|err| Status::internal(format!("volume did not detach: {err}")))?;
        }

        // A lingering 409 surfaces as internal so the orchestrator
        // keeps retrying the delete.
        self.client
            .delete_volume(volume_id)
            .await
            .map_err(|err| Status::internal(format!("failed to delete volume: {err}")))?;

        info!(volume_id, "volume deleted");
        Ok(DeleteVolumeResponse {})
    }

    async fn do_controller_publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<ControllerPublishVolumeResponse, Status> {
        let rpc_type = RpcType::PublishUnpublishVolume;
        if !self.validate_request_capability(rpc_type) {
            return Err(Status::invalid_argument(format!(
                "unsupported capability {rpc_type:?}"
            )));
        }

        let volume_id = parse_volume_id(&req.volume_id)?;
        if req.node_id.is_empty() {
            return Err(Status::invalid_argument("node ID missing in request"));
        }
        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("volume capability missing in request"))?;
        validate_volume_capabilities(std::slice::from_ref(capability))?;

        let vm_id = self.resolve_node_id(&req.node_id).await?;
        let attach_started = Instant::now();

        let volume = self
            .client
            .get_volume(volume_id)
            .await
            .map_err(Status::from)?;

        if let Some(attached_to) = volume.attached_to_id {
            if attached_to == vm_id {
                info!(volume_id, vm_id, "volume already attached to this node");
                return Ok(publish_response(volume_id));
            }
            return Err(Status::failed_precondition(format!(
                "volume {volume_id} is already attached to another node (VM {attached_to})"
            )));
        }

        info!(volume_id, vm_id, "attaching volume");
        self.client
            .attach_volume(vm_id, volume_id)
            .await
            .map_err(Status::from)?;

        self.client
            .wait_for_volume_attachment(volume_id, vm_id, VOLUME_ATTACH_TIMEOUT)
            .await
            .map_err(|err| Status::internal(format!("volume did not attach: {err}")))?;

        metrics::record_volume_attach(attach_started.elapsed());
        info!(volume_id, vm_id, "volume attached");
        Ok(publish_response(volume_id))
    }

    async fn do_controller_unpublish_volume(
        &self,
        req: ControllerUnpublishVolumeRequest,
    ) -> Result<ControllerUnpublishVolumeResponse, Status> {
        let rpc_type = RpcType::PublishUnpublishVolume;
        if !self.validate_request_capability(rpc_type) {
            return Err(Status::invalid_argument(format!(
                "unsupported capability {rpc_type:?}"
            )));
        }

        let volume_id = parse_volume_id(&req.volume_id)?;
        if req.node_id.is_empty() {
            return Err(Status::invalid_argument("node ID missing in request"));
        }
        let vm_id = self.resolve_node_id(&req.node_id).await?;
        let detach_started = Instant::now();

        let volume = match self.client.get_volume(volume_id).await {
            Ok(volume) => volume,
            Err(EmmaError::NotFound { .. }) => {
                info!(volume_id, "volume not found, treating detach as success");
                return Ok(ControllerUnpublishVolumeResponse {});
            }
            Err(err) => {
                return Err(Status::internal(format!("failed to get volume: {err}")));
            }
        };

        match volume.attached_to_id {
            None => {
                info!(volume_id, "volume already detached");
                return Ok(ControllerUnpublishVolumeResponse {});
            }
            Some(attached_to) if attached_to != vm_id => {
                info!(
                    volume_id,
                    attached_to, vm_id, "volume attached to a different node, nothing to detach"
                );
                return Ok(ControllerUnpublishVolumeResponse {});
            }
            Some(_) => {}
        }

        info!(volume_id, vm_id, "detaching volume");
        self.client
            .detach_volume(vm_id, volume_id)
            .await
            .map_err(Status::from)?;

        self.client
            .wait_for_volume_detachment(volume_id, VOLUME_DETACH_TIMEOUT)
            .await
            .map_err(|err| Status::internal(format!("volume did not detach: {err}")))?;

        metrics::record_volume_detach(detach_started.elapsed());
        info!(volume_id, vm_id, "volume detached");
        Ok(ControllerUnpublishVolumeResponse {})
    }

    async fn do_controller_expand_volume(
        &self,
        req: ControllerExpandVolumeRequest,
    ) -> Result<ControllerExpandVolumeResponse, Status> {
        let rpc_type = RpcType::ExpandVolume;
        if !self.validate_request_capability(rpc_type) {
            return Err(Status::invalid_argument(format!(
                "unsupported capability {rpc_type:?}"
            )));
        }

        let volume_id = parse_volume_id(&req.volume_id)?;
        let volume = self
            .client
            .get_volume(volume_id)
            .await
            .map_err(Status::from)?;

        let new_size_gib = round_up_to_power_of_two(requested_gib(req.capacity_range.as_ref())?);
        if new_size_gib <= volume.size_gb {
            return Err(Status::invalid_argument(format!(
                "new size ({new_size_gib} GiB) must be larger than current size ({} GiB)",
                volume.size_gb
            )));
        }

        info!(
            volume_id,
            current_gib = volume.size_gb,
            new_size_gib,
            "expanding volume"
        );
        self.client
            .resize_volume(volume_id, new_size_gib)
            .await
            .map_err(Status::from)?;

        // An attached volume settles back to ACTIVE, a detached one to
        // AVAILABLE.
        let target = if volume.attached_to_id.is_some() {
            VolumeStatus::Active
        } else {
            VolumeStatus::Available
        };
        self.client
            .wait_for_volume_status(volume_id, target, VOLUME_RESIZE_TIMEOUT)
            .await
            .map_err(|err| Status::internal(format!("volume resize did not complete: {err}")))?;

        info!(volume_id, new_size_gib, "volume expanded");
        Ok(ControllerExpandVolumeResponse {
            capacity_bytes: new_size_gib * BYTES_PER_GIB,
            node_expansion_required: true,
        })
    }

    async fn do_validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidateVolumeCapabilitiesResponse, Status> {
        let volume_id = parse_volume_id(&req.volume_id)?;
        if req.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument(
                "volume capabilities missing in request",
            ));
        }

        self.client
            .get_volume(volume_id)
            .await
            .map_err(|err| Status::not_found(format!("volume {volume_id} not found: {err}")))?;

        match validate_volume_capabilities(&req.volume_capabilities) {
            Ok(()) => Ok(ValidateVolumeCapabilitiesResponse {
                confirmed: Some(Confirmed {
                    volume_context: req.volume_context,
                    volume_capabilities: req.volume_capabilities,
                    parameters: req.parameters,
                }),
                message: String::new(),
            }),
            Err(status) => Ok(ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: status.message().to_owned(),
            }),
        }
    }

    async fn do_list_volumes(
        &self,
        _req: ListVolumesRequest,
    ) -> Result<ListVolumesResponse, Status> {
        let rpc_type = RpcType::ListVolumes;
        if !self.validate_request_capability(rpc_type) {
            return Err(Status::invalid_argument(format!(
                "unsupported capability {rpc_type:?}"
            )));
        }

        // The provider list endpoint is unpaged; paging parameters are
        // ignored and no next token is produced.
        let volumes = self
            .client
            .list_volumes()
            .await
            .map_err(|err| Status::internal(format!("failed to list volumes: {err}")))?;

        let entries = volumes
            .iter()
            .map(|volume| list_volumes_response::Entry {
                volume: Some(Volume {
                    volume_id: volume.id.to_string(),
                    capacity_bytes: volume.size_gb * BYTES_PER_GIB,
                    volume_context: HashMap::from([
                        (PARAM_TYPE.to_owned(), volume.volume_type.clone()),
                        (
                            PARAM_DATA_CENTER_ID.to_owned(),
                            volume.data_center_id.clone(),
                        ),
                    ]),
                    ..Default::default()
                }),
                status: Some(list_volumes_response::VolumeStatus {
                    volume_condition: Some(VolumeCondition {
                        abnormal: volume.status == VolumeStatus::Failed,
                        message: format!("Status: {}", volume.status),
                    }),
                    ..Default::default()
                }),
            })
            .collect();

        Ok(ListVolumesResponse {
            entries,
            next_token: String::new(),
        })
    }
}

#[tonic::async_trait]
impl Controller for ControllerService {
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        let req = request.into_inner();
        debug!("create_volume request: {:?}", req);
        let timer = OperationTimer::new("CreateVolume");
        let result = self.do_create_volume(req).await;
        timer.record(result.is_ok());
        result.map(Response::new)
    }

    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        let req = request.into_inner();
        debug!("delete_volume request: {:?}", req);
        let timer = OperationTimer::new("DeleteVolume");
        let result = self.do_delete_volume(req).await;
        timer.record(result.is_ok());
        result.map(Response::new)
    }

    async fn controller_publish_volume(
        &self,
        request: Request<ControllerPublishVolumeRequest>,
    ) -> Result<Response<ControllerPublishVolumeResponse>, Status> {
        let req = request.into_inner();
        debug!("controller_publish_volume request: {:?}", req);
        let timer = OperationTimer::new("ControllerPublishVolume");
        let result = self.do_controller_publish_volume(req).await;
        timer.record(result.is_ok());
        result.map(Response::new)
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<ControllerUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        debug!("controller_unpublish_volume request: {:?}", req);
        let timer = OperationTimer::new("ControllerUnpublishVolume");
        let result = self.do_controller_unpublish_volume(req).await;
        timer.record(result.is_ok());
        result.map(Response::new)
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();
        debug!("validate_volume_capabilities request: {:?}", req);
        self.do_validate_volume_capabilities(req)
            .await
            .map(Response::new)
    }

    async fn list_volumes(
        &self,
        request: Request<ListVolumesRequest>,
    ) -> Result<Response<ListVolumesResponse>, Status> {
        let req = request.into_inner();
        debug!("list_volumes request: {:?}", req);
        self.do_list_volumes(req).await.map(Response::new)
    }

    async fn get_capacity(
        &self,
        _request: Request<GetCapacityRequest>,
    ) -> Result<Response<GetCapacityResponse>, Status> {
        Err(Status::unimplemented("GetCapacity not supported"))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        Ok(Response::new(ControllerGetCapabilitiesResponse {
            capabilities: self.caps.clone(),
        }))
    }

    async fn create_snapshot(
        &self,
        _request: Request<CreateSnapshotRequest>,
    ) -> Result<Response<CreateSnapshotResponse>, Status> {
        Err(Status::unimplemented("CreateSnapshot not supported"))
    }

    async fn delete_snapshot(
        &self,
        _request: Request<DeleteSnapshotRequest>,
    ) -> Result<Response<DeleteSnapshotResponse>, Status> {
        Err(Status::unimplemented("DeleteSnapshot not supported"))
    }

    async fn list_snapshots(
        &self,
        _request: Request<ListSnapshotsRequest>,
    ) -> Result<Response<ListSnapshotsResponse>, Status> {
        Err(Status::unimplemented("ListSnapshots not supported"))
    }

    async fn controller_expand_volume(
        &self,
        request: Request<ControllerExpandVolumeRequest>,
    ) -> Result<Response<ControllerExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        debug!("controller_expand_volume request: {:?}", req);
        let timer = OperationTimer::new("ControllerExpandVolume");
        let result = self.do_controller_expand_volume(req).await;
        timer.record(result.is_ok());
        result.map(Response::new)
    }

    async fn controller_get_volume(
        &self,
        _request: Request<ControllerGetVolumeRequest>,
    ) -> Result<Response<ControllerGetVolumeResponse>, Status> {
        Err(Status::unimplemented("ControllerGetVolume not supported"))
    }
}

/// Publish response carrying the virtio-style device hint. The node
/// runs its own discovery and ignores the hint when the path is absent
/// on disk; it is informational only.
fn publish_response(volume_id: i64) -> ControllerPublishVolumeResponse {
    ControllerPublishVolumeResponse {
        publish_context: HashMap::from([(
            "devicePath".to_owned(),
            format!("/dev/disk/by-id/virtio-{volume_id}"),
        )]),
    }
}

/// Volume handles are decimal provider ids.
fn parse_volume_id(volume_id: &str) -> Result<i64, Status> {
    if volume_id.is_empty() {
        return Err(Status::invalid_argument("volume ID missing in request"));
    }
    volume_id
        .parse::<i64>()
        .map_err(|err| Status::invalid_argument(format!("invalid volume ID {volume_id}: {err}")))
}

/// Check every requested capability: only single-node writers, and
/// only ext4/xfs for mount access.
fn validate_volume_capabilities(capabilities: &[VolumeCapability]) -> Result<(), Status> {
    for capability in capabilities {
        let access_mode = capability
            .access_mode
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("access mode missing in request"))?;
        if access_mode.mode != AccessMode::SingleNodeWriter as i32 {
            return Err(Status::invalid_argument(format!(
                "unsupported access mode: {:?} (only ReadWriteOnce is supported)",
                AccessMode::try_from(access_mode.mode).unwrap_or(AccessMode::Unknown)
            )));
        }

        match &capability.access_type {
            None => {
                return Err(Status::invalid_argument("access type missing in request"));
            }
            Some(AccessType::Block(_)) => {}
            Some(AccessType::Mount(mount)) => {
                let fs_type = mount.fs_type.as_str();
                if !fs_type.is_empty() && fs_type != "ext4" && fs_type != "xfs" {
                    return Err(Status::invalid_argument(format!(
                        "unsupported filesystem type: {fs_type} (supported: ext4, xfs)"
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Requested size in GiB, rounded up from bytes. `required_bytes`
/// takes precedence over `limit_bytes`; both zero is an error.
fn requested_gib(range: Option<&crate::csi::CapacityRange>) -> Result<i64, Status> {
    let range = range.ok_or_else(|| Status::invalid_argument("volume capacity is required"))?;
    let bytes = if range.required_bytes > 0 {
        range.required_bytes
    } else {
        range.limit_bytes
    };
    if bytes == 0 {
        return Err(Status::invalid_argument("volume capacity is required"));
    }
    Ok(((bytes + BYTES_PER_GIB - 1) / BYTES_PER_GIB).max(1))
}

/// The provider only accepts power-of-two sizes between 1 and 2048
/// GiB; round up and clamp.
fn round_up_to_power_of_two(size_gib: i64) -> i64 {
    if size_gib <= 0 {
        return 1;
    }
    if size_gib >= MAX_VOLUME_GIB {
        return MAX_VOLUME_GIB;
    }
    if size_gib & (size_gib - 1) == 0 {
        return size_gib;
    }
    let mut power = 1;
    while power < size_gib {
        power *= 2;
    }
    power
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use axum::extract::{Path, State};
    use axum::http::StatusCode as AxumStatus;
    use axum::response::IntoResponse;
    use axum::routing::{delete, get, post};
    use axum::{Json, Router};
    use rstest::rstest;
    use serde_json::{json, Value};

    use crate::csi::volume_capability::{AccessMode as CsiAccessMode, MountVolume};

    #[rstest]
    #[case(0, 1)]
    #[case(1, 1)]
    #[case(3, 4)]
    #[case(15, 16)]
    #[case(16, 16)]
    #[case(17, 32)]
    #[case(1024, 1024)]
    #[case(2047, 2048)]
    #[case(2048, 2048)]
    #[case(4096, 2048)]
    fn sizes_round_up_to_the_provider_ladder(#[case] requested: i64, #[case] expected: i64) {
        assert_eq!(round_up_to_power_of_two(requested), expected);
    }

    #[test]
    fn required_bytes_take_precedence_over_limit() {
        let range = crate::csi::CapacityRange {
            required_bytes: 15 * BYTES_PER_GIB,
            limit_bytes: 64 * BYTES_PER_GIB,
        };
        assert_eq!(requested_gib(Some(&range)).unwrap(), 15);
    }

    #[test]
    fn limit_bytes_used_when_required_is_zero() {
        let range = crate::csi::CapacityRange {
            required_bytes: 0,
            limit_bytes: 8 * BYTES_PER_GIB,
        };
        assert_eq!(requested_gib(Some(&range)).unwrap(), 8);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let range = crate::csi::CapacityRange {
            required_bytes: 0,
            limit_bytes: 0,
        };
        let status = requested_gib(Some(&range)).unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn partial_gibibytes_round_up() {
        let range = crate::csi::CapacityRange {
            required_bytes: BYTES_PER_GIB + 1,
            limit_bytes: 0,
        };
        assert_eq!(requested_gib(Some(&range)).unwrap(), 2);
    }

    fn mount_capability(mode: AccessMode, fs_type: &str) -> VolumeCapability {
        VolumeCapability {
            access_mode: Some(CsiAccessMode { mode: mode as i32 }),
            access_type: Some(AccessType::Mount(MountVolume {
                fs_type: fs_type.to_owned(),
                mount_flags: Vec::new(),
            })),
        }
    }

    #[rstest]
    #[case(AccessMode::SingleNodeWriter, "ext4", true)]
    #[case(AccessMode::SingleNodeWriter, "xfs", true)]
    #[case(AccessMode::SingleNodeWriter, "", true)]
    #[case(AccessMode::SingleNodeWriter, "btrfs", false)]
    #[case(AccessMode::MultiNodeMultiWriter, "ext4", false)]
    #[case(AccessMode::MultiNodeSingleWriter, "ext4", false)]
    #[case(AccessMode::SingleNodeReaderOnly, "ext4", false)]
    fn capability_validation_only_accepts_single_node_writers(
        #[case] mode: AccessMode,
        #[case] fs_type: &str,
        #[case] accepted: bool,
    ) {
        let result = validate_volume_capabilities(&[mount_capability(mode, fs_type)]);
        assert_eq!(result.is_ok(), accepted, "mode {mode:?} fs {fs_type}");
    }

    #[test]
    fn block_capability_is_accepted() {
        let capability = VolumeCapability {
            access_mode: Some(CsiAccessMode {
                mode: AccessMode::SingleNodeWriter as i32,
            }),
            access_type: Some(AccessType::Block(
                crate::csi::volume_capability::BlockVolume {},
            )),
        };
        assert!(validate_volume_capabilities(&[capability]).is_ok());
    }

    #[test]
    fn capability_without_access_mode_is_rejected() {
        let capability = VolumeCapability {
            access_mode: None,
            access_type: Some(AccessType::Block(
                crate::csi::volume_capability::BlockVolume {},
            )),
        };
        assert!(validate_volume_capabilities(&[capability]).is_err());
    }

    /// Provider double for the controller flows: volumes live in a
    /// map, VM actions mutate attachment state synchronously.
    #[derive(Default)]
    struct Fake {
        volumes: Mutex<std::collections::HashMap<i64, Value>>,
        create_bodies: Mutex<Vec<Value>>,
        resize_bodies: Mutex<Vec<Value>>,
        vm_action_calls: AtomicUsize,
        next_id: AtomicUsize,
    }

    fn fake_volume(id: i64, size_gb: i64, status: &str, attached_to: Option<i64>) -> Value {
        json!({
            "id": id,
            "name": format!("vol-{id}"),
            "sizeGb": size_gb,
            "type": "ssd",
            "status": status,
            "attachedToId": attached_to,
            "dataCenterId": "aws-eu-west-2",
        })
    }

    async fn token_handler() -> impl IntoResponse {
        Json(json!({
            "accessToken": "fake-token",
            "refreshToken": "fake-refresh",
            "expiresIn": 3600,
        }))
    }

    async fn data_center_handler(Path(id): Path<String>) -> impl IntoResponse {
        if id == "aws-eu-west-2" {
            (
                AxumStatus::OK,
                Json(json!({"id": id, "name": "eu-west-2", "providerName": "AWS"})),
            )
        } else {
            (
                AxumStatus::NOT_FOUND,
                Json(json!({"message": "no such data center"})),
            )
        }
    }

    async fn create_volume_handler(
        State(fake): State<Arc<Fake>>,
        Json(body): Json<Value>,
    ) -> impl IntoResponse {
        fake.create_bodies.lock().unwrap().push(body.clone());
        let id = 100 + fake.next_id.fetch_add(1, Ordering::SeqCst) as i64;
        let size_gb = body["volumeGb"].as_i64().unwrap();
        // Created DRAFT, AVAILABLE by the time the controller polls.
        fake.volumes
            .lock()
            .unwrap()
            .insert(id, fake_volume(id, size_gb, "AVAILABLE", None));
        (
            AxumStatus::CREATED,
            Json(fake_volume(id, size_gb, "DRAFT", None)),
        )
    }

    async fn list_volumes_handler(State(fake): State<Arc<Fake>>) -> impl IntoResponse {
        let volumes: Vec<Value> = fake.volumes.lock().unwrap().values().cloned().collect();
        Json(volumes)
    }

    async fn get_volume_handler(
        State(fake): State<Arc<Fake>>,
        Path(id): Path<i64>,
    ) -> impl IntoResponse {
        match fake.volumes.lock().unwrap().get(&id) {
            Some(volume) => (AxumStatus::OK, Json(volume.clone())).into_response(),
            None => (
                AxumStatus::NOT_FOUND,
                Json(json!({"message": "volume not found"})),
            )
                .into_response(),
        }
    }

    async fn delete_volume_handler(
        State(fake): State<Arc<Fake>>,
        Path(id): Path<i64>,
    ) -> impl IntoResponse {
        match fake.volumes.lock().unwrap().remove(&id) {
            Some(_) => AxumStatus::OK,
            None => AxumStatus::NOT_FOUND,
        }
    }

    async fn volume_action_handler(
        State(fake): State<Arc<Fake>>,
        Path(id): Path<i64>,
        Json(body): Json<Value>,
    ) -> impl IntoResponse {
        fake.resize_bodies.lock().unwrap().push(body.clone());
        let mut volumes = fake.volumes.lock().unwrap();
        if let Some(volume) = volumes.get_mut(&id) {
            volume["sizeGb"] = body["sizeGb"].clone();
        }
        AxumStatus::ACCEPTED
    }

    async fn vm_action_handler(
        State(fake): State<Arc<Fake>>,
        Path(vm_id): Path<i64>,
        Json(body): Json<Value>,
    ) -> impl IntoResponse {
        fake.vm_action_calls.fetch_add(1, Ordering::SeqCst);
        let volume_id = body["volumeId"].as_i64().unwrap();
        let mut volumes = fake.volumes.lock().unwrap();
        if let Some(volume) = volumes.get_mut(&volume_id) {
            match body["action"].as_str().unwrap() {
                "attach" => {
                    volume["status"] = json!("ACTIVE");
                    volume["attachedToId"] = json!(vm_id);
                }
                "detach" => {
                    volume["status"] = json!("AVAILABLE");
                    volume["attachedToId"] = Value::Null;
                }
                _ => return AxumStatus::BAD_REQUEST,
            }
        }
        AxumStatus::ACCEPTED
    }

    async fn clusters_handler() -> impl IntoResponse {
        Json(json!([
            {
                "id": 1,
                "name": "production",
                "nodeGroups": [
                    {
                        "name": "workers",
                        "nodes": [
                            {"id": 42, "name": "worker-1"},
                            {"id": 43, "name": "worker-2"},
                        ],
                    },
                ],
            },
        ]))
    }

    async fn spawn_controller(fake: Arc<Fake>) -> ControllerService {
        let app = Router::new()
            .route("/v1/issue-token", post(token_handler))
            .route("/v1/data-centers/:id", get(data_center_handler))
            .route("/v1/volumes", post(create_volume_handler))
            .route("/v1/volumes", get(list_volumes_handler))
            .route("/v1/volumes/:id", get(get_volume_handler))
            .route("/v1/volumes/:id", delete(delete_volume_handler))
            .route("/v1/volumes/:id/actions", post(volume_action_handler))
            .route("/v1/vms/:id/actions", post(vm_action_handler))
            .route("/v1/kubernetes", get(clusters_handler))
            .with_state(fake);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = Client::connect(&format!("http://{addr}"), "test-client", "test-secret")
            .await
            .unwrap();
        ControllerService::new(Arc::new(client))
    }

    fn create_request(name: &str, required_bytes: i64) -> CreateVolumeRequest {
        CreateVolumeRequest {
            name: name.to_owned(),
            capacity_range: Some(crate::csi::CapacityRange {
                required_bytes,
                limit_bytes: 0,
            }),
            volume_capabilities: vec![mount_capability(AccessMode::SingleNodeWriter, "ext4")],
            parameters: HashMap::from([
                ("type".to_owned(), "ssd".to_owned()),
                ("dataCenterId".to_owned(), "aws-eu-west-2".to_owned()),
                ("fsType".to_owned(), "ext4".to_owned()),
            ]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_quantises_fifteen_gib_to_sixteen() {
        let fake = Arc::new(Fake::default());
        let service = spawn_controller(Arc::clone(&fake)).await;

        let response = service
            .do_create_volume(create_request("pvc-a", 16_106_127_360))
            .await
            .unwrap();

        let volume = response.volume.unwrap();
        assert_eq!(volume.capacity_bytes, 16 * BYTES_PER_GIB);
        assert_eq!(volume.volume_context["type"], "ssd");
        assert_eq!(volume.volume_context["dataCenterId"], "aws-eu-west-2");
        assert_eq!(volume.volume_context["fsType"], "ext4");

        let bodies = fake.create_bodies.lock().unwrap();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["volumeGb"], 16);
    }

    #[tokio::test]
    async fn create_rounds_one_byte_to_one_gib() {
        let fake = Arc::new(Fake::default());
        let service = spawn_controller(Arc::clone(&fake)).await;

        let response = service
            .do_create_volume(create_request("pvc-b", 1))
            .await
            .unwrap();

        assert_eq!(response.volume.unwrap().capacity_bytes, BYTES_PER_GIB);
        assert_eq!(fake.create_bodies.lock().unwrap()[0]["volumeGb"], 1);
    }

    #[tokio::test]
    async fn create_requires_a_data_center() {
        let fake = Arc::new(Fake::default());
        let service = spawn_controller(fake).await;

        let mut request = create_request("pvc-c", BYTES_PER_GIB);
        request.parameters.remove("dataCenterId");
        let status = service.do_create_volume(request).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn create_rejects_unknown_data_center() {
        let fake = Arc::new(Fake::default());
        let service = spawn_controller(fake).await;

        let mut request = create_request("pvc-d", BYTES_PER_GIB);
        request
            .parameters
            .insert("dataCenterId".to_owned(), "gcp-nowhere".to_owned());
        let status = service.do_create_volume(request).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn create_rejects_multi_writer_capabilities() {
        let fake = Arc::new(Fake::default());
        let service = spawn_controller(fake).await;

        let mut request = create_request("pvc-e", BYTES_PER_GIB);
        request.volume_capabilities =
            vec![mount_capability(AccessMode::MultiNodeMultiWriter, "ext4")];
        let status = service.do_create_volume(request).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn delete_of_missing_volume_is_success() {
        let fake = Arc::new(Fake::default());
        let service = spawn_controller(fake).await;

        service
            .do_delete_volume(DeleteVolumeRequest {
                volume_id: "12345".to_owned(),
                ..Default::default()
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delete_rejects_non_numeric_handles() {
        let fake = Arc::new(Fake::default());
        let service = spawn_controller(fake).await;

        let status = service
            .do_delete_volume(DeleteVolumeRequest {
                volume_id: "pvc-uuid".to_owned(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn delete_detaches_attached_volume_first() {
        let fake = Arc::new(Fake::default());
        fake.volumes
            .lock()
            .unwrap()
            .insert(7, fake_volume(7, 16, "ACTIVE", Some(42)));
        let service = spawn_controller(Arc::clone(&fake)).await;

        service
            .do_delete_volume(DeleteVolumeRequest {
                volume_id: "7".to_owned(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(fake.vm_action_calls.load(Ordering::SeqCst), 1);
        assert!(fake.volumes.lock().unwrap().is_empty());
    }

    fn publish_request(volume_id: &str, node_id: &str) -> ControllerPublishVolumeRequest {
        ControllerPublishVolumeRequest {
            volume_id: volume_id.to_owned(),
            node_id: node_id.to_owned(),
            volume_capability: Some(mount_capability(AccessMode::SingleNodeWriter, "ext4")),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn publish_attaches_and_returns_device_hint() {
        let fake = Arc::new(Fake::default());
        fake.volumes
            .lock()
            .unwrap()
            .insert(7, fake_volume(7, 16, "AVAILABLE", None));
        let service = spawn_controller(Arc::clone(&fake)).await;

        let response = service
            .do_controller_publish_volume(publish_request("7", "42"))
            .await
            .unwrap();

        assert_eq!(
            response.publish_context["devicePath"],
            "/dev/disk/by-id/virtio-7"
        );
        assert_eq!(fake.vm_action_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn publish_to_already_attached_node_issues_no_mutation() {
        let fake = Arc::new(Fake::default());
        fake.volumes
            .lock()
            .unwrap()
            .insert(7, fake_volume(7, 16, "ACTIVE", Some(42)));
        let service = spawn_controller(Arc::clone(&fake)).await;

        let response = service
            .do_controller_publish_volume(publish_request("7", "42"))
            .await
            .unwrap();

        assert!(response.publish_context.contains_key("devicePath"));
        assert_eq!(fake.vm_action_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn publish_with_foreign_attachment_is_failed_precondition() {
        let fake = Arc::new(Fake::default());
        fake.volumes
            .lock()
            .unwrap()
            .insert(7, fake_volume(7, 16, "ACTIVE", Some(42)));
        let service = spawn_controller(Arc::clone(&fake)).await;

        let status = service
            .do_controller_publish_volume(publish_request("7", "99"))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);
        assert_eq!(fake.vm_action_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn publish_resolves_node_names_through_cluster_membership() {
        let fake = Arc::new(Fake::default());
        fake.volumes
            .lock()
            .unwrap()
            .insert(7, fake_volume(7, 16, "AVAILABLE", None));
        let service = spawn_controller(Arc::clone(&fake)).await;

        service
            .do_controller_publish_volume(publish_request("7", "worker-1"))
            .await
            .unwrap();

        let volumes = fake.volumes.lock().unwrap();
        assert_eq!(volumes[&7]["attachedToId"], 42);
    }

    #[tokio::test]
    async fn unknown_node_name_is_invalid_argument() {
        let fake = Arc::new(Fake::default());
        let service = spawn_controller(fake).await;

        let status = service.resolve_node_id("worker-99").await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn unpublish_of_detached_volume_issues_no_mutation() {
        let fake = Arc::new(Fake::default());
        fake.volumes
            .lock()
            .unwrap()
            .insert(123, fake_volume(123, 16, "AVAILABLE", None));
        let service = spawn_controller(Arc::clone(&fake)).await;

        service
            .do_controller_unpublish_volume(ControllerUnpublishVolumeRequest {
                volume_id: "123".to_owned(),
                node_id: "42".to_owned(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(fake.vm_action_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unpublish_of_foreign_attachment_is_idempotent_success() {
        let fake = Arc::new(Fake::default());
        fake.volumes
            .lock()
            .unwrap()
            .insert(123, fake_volume(123, 16, "ACTIVE", Some(7)));
        let service = spawn_controller(Arc::clone(&fake)).await;

        service
            .do_controller_unpublish_volume(ControllerUnpublishVolumeRequest {
                volume_id: "123".to_owned(),
                node_id: "42".to_owned(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(fake.vm_action_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expand_rejects_non_growth_without_side_effects() {
        let fake = Arc::new(Fake::default());
        fake.volumes
            .lock()
            .unwrap()
            .insert(7, fake_volume(7, 32, "AVAILABLE", None));
        let service = spawn_controller(Arc::clone(&fake)).await;

        let status = service
            .do_controller_expand_volume(ControllerExpandVolumeRequest {
                volume_id: "7".to_owned(),
                capacity_range: Some(crate::csi::CapacityRange {
                    required_bytes: 32 * BYTES_PER_GIB,
                    limit_bytes: 0,
                }),
                ..Default::default()
            })
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(fake.resize_bodies.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn expand_quantises_and_requires_node_expansion() {
        let fake = Arc::new(Fake::default());
        fake.volumes
            .lock()
            .unwrap()
            .insert(7, fake_volume(7, 32, "AVAILABLE", None));
        let service = spawn_controller(Arc::clone(&fake)).await;

        let response = service
            .do_controller_expand_volume(ControllerExpandVolumeRequest {
                volume_id: "7".to_owned(),
                capacity_range: Some(crate::csi::CapacityRange {
                    required_bytes: 42_949_672_960,
                    limit_bytes: 0,
                }),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(response.capacity_bytes, 64 * BYTES_PER_GIB);
        assert!(response.node_expansion_required);
        assert_eq!(fake.resize_bodies.lock().unwrap()[0]["sizeGb"], 64);
    }

    #[tokio::test]
    async fn validate_capabilities_confirms_single_node_writer() {
        let fake = Arc::new(Fake::default());
        fake.volumes
            .lock()
            .unwrap()
            .insert(7, fake_volume(7, 16, "AVAILABLE", None));
        let service = spawn_controller(fake).await;

        let response = service
            .do_validate_volume_capabilities(ValidateVolumeCapabilitiesRequest {
                volume_id: "7".to_owned(),
                volume_capabilities: vec![mount_capability(AccessMode::SingleNodeWriter, "ext4")],
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(response.confirmed.is_some());

        let response = service
            .do_validate_volume_capabilities(ValidateVolumeCapabilitiesRequest {
                volume_id: "7".to_owned(),
                volume_capabilities: vec![mount_capability(
                    AccessMode::MultiNodeMultiWriter,
                    "ext4",
                )],
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(response.confirmed.is_none());
        assert!(!response.message.is_empty());
    }

    #[tokio::test]
    async fn list_volumes_carries_provider_status_condition() {
        let fake = Arc::new(Fake::default());
        {
            let mut volumes = fake.volumes.lock().unwrap();
            volumes.insert(1, fake_volume(1, 16, "AVAILABLE", None));
            volumes.insert(2, fake_volume(2, 32, "FAILED", None));
        }
        let service = spawn_controller(fake).await;

        let response = service
            .do_list_volumes(ListVolumesRequest::default())
            .await
            .unwrap();
        assert_eq!(response.entries.len(), 2);

        let failed = response
            .entries
            .iter()
            .find(|entry| entry.volume.as_ref().unwrap().volume_id == "2")
            .unwrap();
        let condition = failed
            .status
            .as_ref()
            .unwrap()
            .volume_condition
            .as_ref()
            .unwrap();
        assert!(condition.abnormal);
        assert_eq!(condition.message, "Status: FAILED");
    }

    #[tokio::test]
    async fn snapshot_rpcs_are_unimplemented() {
        let fake = Arc::new(Fake::default());
        let service = spawn_controller(fake).await;

        let status = service
            .create_snapshot(Request::new(CreateSnapshotRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unimplemented);

        let status = service
            .get_capacity(Request::new(GetCapacityRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unimplemented);
    }

    #[tokio::test]
    async fn capabilities_cover_the_supported_surface() {
        let fake = Arc::new(Fake::default());
        let service = spawn_controller(fake).await;

        let response = service
            .controller_get_capabilities(Request::new(ControllerGetCapabilitiesRequest {}))
            .await
            .unwrap()
            .into_inner();

        let types: Vec<i32> = response
            .capabilities
            .iter()
            .filter_map(|cap| match &cap.r#type {
                Some(controller_service_capability::Type::Rpc(rpc)) => Some(rpc.r#type),
                None => None,
            })
            .collect();
        assert_eq!(
            types,
            vec![
                RpcType::CreateDeleteVolume as i32,
                RpcType::PublishUnpublishVolume as i32,
                RpcType::ExpandVolume as i32,
                RpcType::ListVolumes as i32,
            ]
        );
    }
}
