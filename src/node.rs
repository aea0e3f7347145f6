//! The implementation for CSI node service
//!
//! Stages attached volumes onto the host and binds them into pods. No
//! state is kept between RPCs: the mount table and the device tree are
//! re-read on every call, which is what makes repeated delivery safe.

use std::path::Path;
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::csi::node_server::Node;
use crate::csi::node_service_capability::rpc::Type as RpcType;
use crate::csi::node_service_capability::{self, Rpc};
use crate::csi::volume_capability::AccessType;
use crate::csi::volume_usage::Unit;
use crate::csi::{
    NodeExpandVolumeRequest, NodeExpandVolumeResponse, NodeGetCapabilitiesRequest,
    NodeGetCapabilitiesResponse, NodeGetInfoRequest, NodeGetInfoResponse,
    NodeGetVolumeStatsRequest, NodeGetVolumeStatsResponse, NodePublishVolumeRequest,
    NodePublishVolumeResponse, NodeServiceCapability, NodeStageVolumeRequest,
    NodeStageVolumeResponse, NodeUnpublishVolumeRequest, NodeUnpublishVolumeResponse,
    NodeUnstageVolumeRequest, NodeUnstageVolumeResponse, Topology, VolumeCapability, VolumeUsage,
};
use crate::driver::{DATACENTER_ENV, MAX_VOLUMES_PER_NODE, TOPOLOGY_DATACENTER_KEY};
use crate::mount::{MountError, Mounter, SUPPORTED_FS_TYPES};

/// for `NodeService` implementation
pub struct NodeService {
    /// Node capabilities
    caps: Vec<NodeServiceCapability>,
    /// Orchestrator-assigned node identifier
    node_id: String,
    /// Host capability used for all device and mount work
    mounter: Arc<dyn Mounter>,
}

impl NodeService {
    /// Create `NodeService`.
    pub fn new(node_id: String, mounter: Arc<dyn Mounter>) -> Self {
        let cap_vec = vec![
            RpcType::StageUnstageVolume,
            RpcType::ExpandVolume,
            RpcType::GetVolumeStats,
        ];
        let caps = cap_vec
            .into_iter()
            .map(|rpc_type| NodeServiceCapability {
                r#type: Some(node_service_capability::Type::Rpc(Rpc {
                    r#type: rpc_type as i32,
                })),
            })
            .collect();
        Self {
            caps,
            node_id,
            mounter,
        }
    }
}

/// Filesystem type and mount flags requested for a mount-style volume.
/// `None` means the capability asked for raw block access.
fn mount_settings(capability: &VolumeCapability) -> Result<Option<(String, Vec<String>)>, Status> {
    match &capability.access_type {
        None => Err(Status::invalid_argument("access type missing in request")),
        Some(AccessType::Block(_)) => Ok(None),
        Some(AccessType::Mount(mount)) => {
            let fs_type = if mount.fs_type.is_empty() {
                "ext4".to_owned()
            } else {
                mount.fs_type.clone()
            };
            if !SUPPORTED_FS_TYPES.contains(&fs_type.as_str()) {
                return Err(Status::invalid_argument(format!(
                    "unsupported filesystem type: {fs_type}"
                )));
            }
            Ok(Some((fs_type, mount.mount_flags.clone())))
        }
    }
}

fn internal_mount_error(context: &str, err: MountError) -> Status {
    match err {
        MountError::UnsupportedFilesystem(fs_type) => {
            Status::invalid_argument(format!("unsupported filesystem type: {fs_type}"))
        }
        err => Status::internal(format!("{context}: {err}")),
    }
}

#[tonic::async_trait]
impl Node for NodeService {
    async fn node_stage_volume(
        &self,
        request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        let req = request.into_inner();
        debug!("node_stage_volume request: {:?}", req);

        let volume_id = req.volume_id.as_str();
        if volume_id.is_empty() {
            return Err(Status::invalid_argument("volume ID missing in request"));
        }
        let staging_path = req.staging_target_path.as_str();
        if staging_path.is_empty() {
            return Err(Status::invalid_argument(
                "staging target path missing in request",
            ));
        }
        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("volume capability missing in request"))?;
        let Some((fs_type, mount_flags)) = mount_settings(capability)? else {
            // Raw block volumes have nothing to stage.
            debug!(volume_id, "block access requested, nothing to stage");
            return Ok(Response::new(NodeStageVolumeResponse {}));
        };

        let not_mounted = self
            .mounter
            .is_likely_not_mount_point(Path::new(staging_path))
            .await
            .map_err(|err| internal_mount_error("failed to inspect staging path", err))?;
        if !not_mounted {
            info!(volume_id, staging_path, "volume already staged");
            return Ok(Response::new(NodeStageVolumeResponse {}));
        }

        let device = self
            .mounter
            .device_path(volume_id)
            .await
            .map_err(|err| internal_mount_error("failed to find device", err))?;
        info!(volume_id, device = %device.display(), "discovered block device");

        self.mounter
            .format_and_mount(&device, Path::new(staging_path), &fs_type, &mount_flags)
            .await
            .map_err(|err| internal_mount_error("failed to format and mount device", err))?;

        info!(volume_id, staging_path, "volume staged");
        Ok(Response::new(NodeStageVolumeResponse {}))
    }

    async fn node_unstage_volume(
        &self,
        request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        let req = request.into_inner();
        debug!("node_unstage_volume request: {:?}", req);

        let volume_id = req.volume_id.as_str();
        if volume_id.is_empty() {
            return Err(Status::invalid_argument("volume ID missing in request"));
        }
        let staging_path = req.staging_target_path.as_str();
        if staging_path.is_empty() {
            return Err(Status::invalid_argument(
                "staging target path missing in request",
            ));
        }

        let not_mounted = self
            .mounter
            .is_likely_not_mount_point(Path::new(staging_path))
            .await
            .map_err(|err| internal_mount_error("failed to inspect staging path", err))?;
        if not_mounted {
            info!(volume_id, staging_path, "staging path not mounted, nothing to unstage");
            return Ok(Response::new(NodeUnstageVolumeResponse {}));
        }

        self.mounter
            .unmount(Path::new(staging_path))
            .await
            .map_err(|err| internal_mount_error("failed to unmount staging path", err))?;

        if let Err(err) = std::fs::remove_dir(staging_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(staging_path, error = %err, "failed to remove staging directory");
            }
        }

        info!(volume_id, staging_path, "volume unstaged");
        Ok(Response::new(NodeUnstageVolumeResponse {}))
    }

    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        debug!("node_publish_volume request: {:?}", req);

        let volume_id = req.volume_id.as_str();
        if volume_id.is_empty() {
            return Err(Status::invalid_argument("volume ID missing in request"));
        }
        let staging_path = req.staging_target_path.as_str();
        if staging_path.is_empty() {
            return Err(Status::invalid_argument(
                "staging target path missing in request",
            ));
        }
        let target_path = req.target_path.as_str();
        if target_path.is_empty() {
            return Err(Status::invalid_argument("target path missing in request"));
        }
        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("volume capability missing in request"))?;

        let not_mounted = self
            .mounter
            .is_likely_not_mount_point(Path::new(target_path))
            .await
            .map_err(|err| internal_mount_error("failed to inspect target path", err))?;
        if !not_mounted {
            info!(volume_id, target_path, "volume already published");
            return Ok(Response::new(NodePublishVolumeResponse {}));
        }

        let mut options = vec!["bind".to_owned()];
        if req.readonly {
            options.push("ro".to_owned());
        }
        if let Some(AccessType::Mount(mount)) = &capability.access_type {
            options.extend(mount.mount_flags.iter().cloned());
        }

        self.mounter
            .mount(Path::new(staging_path), Path::new(target_path), None, &options)
            .await
            .map_err(|err| internal_mount_error("failed to bind mount volume", err))?;

        info!(volume_id, target_path, "volume published");
        Ok(Response::new(NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        debug!("node_unpublish_volume request: {:?}", req);

        let volume_id = req.volume_id.as_str();
        if volume_id.is_empty() {
            return Err(Status::invalid_argument("volume ID missing in request"));
        }
        let target_path = req.target_path.as_str();
        if target_path.is_empty() {
            return Err(Status::invalid_argument("target path missing in request"));
        }

        let not_mounted = self
            .mounter
            .is_likely_not_mount_point(Path::new(target_path))
            .await
            .map_err(|err| internal_mount_error("failed to inspect target path", err))?;
        if not_mounted {
            info!(volume_id, target_path, "target path not mounted, nothing to unpublish");
            return Ok(Response::new(NodeUnpublishVolumeResponse {}));
        }

        self.mounter
            .unmount(Path::new(target_path))
            .await
            .map_err(|err| internal_mount_error("failed to unmount target path", err))?;

        if let Err(err) = std::fs::remove_dir(target_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(target_path, error = %err, "failed to remove target directory");
            }
        }

        info!(volume_id, target_path, "volume unpublished");
        Ok(Response::new(NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_volume_stats(
        &self,
        request: Request<NodeGetVolumeStatsRequest>,
    ) -> Result<Response<NodeGetVolumeStatsResponse>, Status> {
        let req = request.into_inner();
        debug!("node_get_volume_stats request: {:?}", req);

        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume ID missing in request"));
        }
        let volume_path = req.volume_path.as_str();
        if volume_path.is_empty() {
            return Err(Status::invalid_argument("volume path missing in request"));
        }
        if !Path::new(volume_path).exists() {
            return Err(Status::not_found(format!(
                "volume path {volume_path} does not exist"
            )));
        }

        let stats = self
            .mounter
            .stats(Path::new(volume_path))
            .map_err(|err| internal_mount_error("failed to read volume stats", err))?;

        Ok(Response::new(NodeGetVolumeStatsResponse {
            usage: vec![
                VolumeUsage {
                    unit: Unit::Bytes as i32,
                    available: stats.available_bytes,
                    total: stats.total_bytes,
                    used: stats.used_bytes,
                },
                VolumeUsage {
                    unit: Unit::Inodes as i32,
                    available: stats.available_inodes,
                    total: stats.total_inodes,
                    used: stats.used_inodes,
                },
            ],
            ..Default::default()
        }))
    }

    async fn node_expand_volume(
        &self,
        request: Request<NodeExpandVolumeRequest>,
    ) -> Result<Response<NodeExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        debug!("node_expand_volume request: {:?}", req);

        let volume_id = req.volume_id.as_str();
        if volume_id.is_empty() {
            return Err(Status::invalid_argument("volume ID missing in request"));
        }
        let volume_path = req.volume_path.as_str();
        if volume_path.is_empty() {
            return Err(Status::invalid_argument("volume path missing in request"));
        }
        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("volume capability missing in request"))?;
        let Some((fs_type, _)) = mount_settings(capability)? else {
            return Err(Status::invalid_argument(
                "block volumes have no filesystem to expand",
            ));
        };

        info!(volume_id, volume_path, %fs_type, "expanding filesystem");
        match fs_type.as_str() {
            // ext4 grows from the device, xfs from the mount point.
            "ext4" => {
                let device = self
                    .mounter
                    .device_path(volume_id)
                    .await
                    .map_err(|err| internal_mount_error("failed to find device", err))?;
                self.mounter
                    .resize_device(&device)
                    .await
                    .map_err(|err| internal_mount_error("failed to resize filesystem", err))?;
            }
            "xfs" => {
                self.mounter
                    .grow_mounted_xfs(Path::new(volume_path))
                    .await
                    .map_err(|err| internal_mount_error("failed to grow filesystem", err))?;
            }
            _ => unreachable!("fs type validated by mount_settings"),
        }

        info!(volume_id, "filesystem expanded");
        let capacity_bytes = req
            .capacity_range
            .map(|range| range.required_bytes)
            .unwrap_or_default();
        Ok(Response::new(NodeExpandVolumeResponse { capacity_bytes }))
    }

    async fn node_get_capabilities(
        &self,
        request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        debug!("node_get_capabilities request: {:?}", request.get_ref());

        Ok(Response::new(NodeGetCapabilitiesResponse {
            capabilities: self.caps.clone(),
        }))
    }

    async fn node_get_info(
        &self,
        request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        debug!("node_get_info request: {:?}", request.get_ref());

        // The scheduler uses the datacenter segment to co-locate
        // volumes with the VMs that can reach them.
        let accessible_topology = std::env::var(DATACENTER_ENV).ok().map(|data_center| {
            Topology {
                segments: std::collections::HashMap::from([(
                    TOPOLOGY_DATACENTER_KEY.to_owned(),
                    data_center,
                )]),
            }
        });

        Ok(Response::new(NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: MAX_VOLUMES_PER_NODE,
            accessible_topology,
        }))
    }
}
