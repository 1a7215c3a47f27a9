use crate::{
    launcher::ClientLauncher,
    lifecycle::MountLifecycle,
    mount::Mounter,
    probe::{probe, MountHealth},
};
use csi_driver::{
    csi::{
        node_server, node_service_capability,
        volume_capability::{access_mode::Mode, AccessType},
        volume_usage::Unit,
        NodeGetCapabilitiesRequest, NodeGetCapabilitiesResponse, NodeGetInfoRequest,
        NodeGetInfoResponse, NodeGetVolumeStatsRequest, NodeGetVolumeStatsResponse,
        NodePublishVolumeRequest, NodePublishVolumeResponse, NodeServiceCapability,
        NodeStageVolumeRequest, NodeStageVolumeResponse, NodeUnpublishVolumeRequest,
        NodeUnpublishVolumeResponse, NodeUnstageVolumeRequest, NodeUnstageVolumeResponse,
        VolumeCapability, VolumeCondition, VolumeUsage,
    },
    VolumeParams,
};
use nix::{errno::Errno, sys};
use std::path::{Path, PathBuf};
use tonic::{Code, Request, Response, Status};
use tracing::{debug, trace};

/// The Csi Node implementation.
pub(crate) struct Node<M, L> {
    node_name: String,
    lifecycle: MountLifecycle<M, L>,
}

impl<M: Mounter, L: ClientLauncher> Node<M, L> {
    /// Creates new node.
    pub(crate) fn new(node_name: String, lifecycle: MountLifecycle<M, L>) -> Self {
        Self {
            node_name,
            lifecycle,
        }
    }
}

/// Check that the access mode of the capability is one we serve and work out whether it
/// forces a read-only mount.
fn check_access_mode(volume_capability: &Option<VolumeCapability>) -> Result<bool, String> {
    match volume_capability {
        Some(capability) => match &capability.access_mode {
            Some(access) => match Mode::try_from(access.mode) {
                Ok(Mode::SingleNodeReaderOnly | Mode::MultiNodeReaderOnly) => Ok(true),
                Ok(Mode::Unknown) => Err(String::from("volume capability: unknown access mode")),
                Ok(_) => Ok(false),
                Err(_) => Err(format!(
                    "volume capability: invalid access mode: {}",
                    access.mode
                )),
            },
            None => Err(String::from("volume capability: missing access mode")),
        },
        None => Err(String::from("missing volume capability")),
    }
}

/// Only filesystem mounts are served, raw block volumes make no sense for a
/// distributed filesystem.
fn check_access_type(volume_capability: &Option<VolumeCapability>) -> Result<(), String> {
    match volume_capability
        .as_ref()
        .and_then(|capability| capability.access_type.as_ref())
    {
        Some(AccessType::Mount(_)) => Ok(()),
        Some(AccessType::Block(_)) => Err(String::from("block volumes are not supported")),
        None => Err(String::from("missing access type")),
    }
}

fn statfs_usage(path: &Path) -> Result<Vec<VolumeUsage>, Status> {
    match sys::statfs::statfs(path) {
        Ok(info) => Ok(vec![
            VolumeUsage {
                total: info.blocks() as i64 * info.block_size(),
                unit: Unit::Bytes as i32,
                available: info.blocks_available() as i64 * info.block_size(),
                used: (info.blocks() - info.blocks_free()) as i64 * info.block_size(),
            },
            VolumeUsage {
                total: info.files() as i64,
                unit: Unit::Inodes as i32,
                available: info.files_free() as i64,
                used: (info.files() - info.files_free()) as i64,
            },
        ]),
        Err(err) => {
            let code = match err {
                Errno::ENOENT => Code::NotFound,
                Errno::EIO => Code::Internal,
                Errno::ENOSYS => Code::Unavailable,
                Errno::ENOTDIR => Code::Internal,
                _ => Code::InvalidArgument,
            };
            Err(Status::new(
                code,
                format!("Failed to get stats of {}: {err}", path.display()),
            ))
        }
    }
}

#[tonic::async_trait]
impl<M: Mounter, L: ClientLauncher> node_server::Node for Node<M, L> {
    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        debug!("NodeGetInfo request: ID={}", self.node_name);

        Ok(Response::new(NodeGetInfoResponse {
            node_id: self.node_name.clone(),
            max_volumes_per_node: 0,
            accessible_topology: None,
        }))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        let caps = vec![
            node_service_capability::rpc::Type::StageUnstageVolume,
            node_service_capability::rpc::Type::GetVolumeStats,
            node_service_capability::rpc::Type::VolumeCondition,
        ];

        debug!("NodeGetCapabilities request: {:?}", caps);

        Ok(Response::new(NodeGetCapabilitiesResponse {
            capabilities: caps
                .into_iter()
                .map(|c| NodeServiceCapability {
                    r#type: Some(node_service_capability::Type::Rpc(
                        node_service_capability::Rpc { r#type: c as i32 },
                    )),
                })
                .collect(),
        }))
    }

    async fn node_stage_volume(
        &self,
        request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        let msg = request.into_inner();
        trace!("node_stage_volume {:?}", msg.volume_id);

        if msg.volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to stage volume: missing volume id"
            ));
        }
        if msg.staging_target_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to stage volume {}: missing staging path",
                &msg.volume_id
            ));
        }
        if let Err(error) = check_access_type(&msg.volume_capability)
            .and_then(|_| check_access_mode(&msg.volume_capability))
        {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to stage volume {}: {}",
                &msg.volume_id,
                error
            ));
        }
        let params = VolumeParams::parse(&msg.volume_id, &msg.volume_context)?;

        self.lifecycle
            .stage(
                &msg.volume_id,
                &params,
                &PathBuf::from(&msg.staging_target_path),
            )
            .await?;
        Ok(Response::new(NodeStageVolumeResponse {}))
    }

    async fn node_unstage_volume(
        &self,
        request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        let msg = request.into_inner();
        trace!("node_unstage_volume {:?}", msg);

        if msg.volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to unstage volume: missing volume id"
            ));
        }
        if msg.staging_target_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to unstage volume {}: missing staging path",
                &msg.volume_id
            ));
        }

        self.lifecycle
            .unstage(&msg.volume_id, Path::new(&msg.staging_target_path))
            .await?;
        Ok(Response::new(NodeUnstageVolumeResponse {}))
    }

    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let msg = request.into_inner();
        trace!("node_publish_volume {:?}", msg.volume_id);

        if msg.volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to publish volume: missing volume id"
            ));
        }
        if msg.staging_target_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to publish volume {}: missing staging path",
                &msg.volume_id
            ));
        }
        if msg.target_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to publish volume {}: missing target path",
                &msg.volume_id
            ));
        }
        let reader_only = match check_access_type(&msg.volume_capability)
            .and_then(|_| check_access_mode(&msg.volume_capability))
        {
            Ok(reader_only) => reader_only,
            Err(error) => {
                return Err(failure!(
                    Code::InvalidArgument,
                    "Failed to publish volume {}: {}",
                    &msg.volume_id,
                    error
                ))
            }
        };

        self.lifecycle
            .publish(
                &msg.volume_id,
                Path::new(&msg.staging_target_path),
                Path::new(&msg.target_path),
                msg.readonly || reader_only,
            )
            .await?;
        Ok(Response::new(NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let msg = request.into_inner();
        trace!("node_unpublish_volume {:?}", msg);

        if msg.volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to unpublish volume: missing volume id"
            ));
        }
        if msg.target_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to unpublish volume {}: missing target path",
                &msg.volume_id
            ));
        }

        self.lifecycle
            .unpublish(&msg.volume_id, Path::new(&msg.target_path))
            .await?;
        Ok(Response::new(NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_volume_stats(
        &self,
        request: Request<NodeGetVolumeStatsRequest>,
    ) -> Result<Response<NodeGetVolumeStatsResponse>, Status> {
        let msg = request.into_inner();
        trace!("node_get_volume_stats {:?}", msg);
        if msg.volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to get volume stats: missing volume id"
            ));
        }
        if msg.volume_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to get volume stats: missing volume path"
            ));
        }
        let _guard = self.lifecycle.lock().shared().await;

        let volume_path = PathBuf::from(&msg.volume_path);
        match probe(self.lifecycle.mounter(), &volume_path).await? {
            MountHealth::Absent => Err(failure!(
                Code::NotFound,
                "Volume {} is not mounted on {}",
                &msg.volume_id,
                &msg.volume_path
            )),
            MountHealth::Corrupted => Ok(Response::new(NodeGetVolumeStatsResponse {
                usage: vec![],
                volume_condition: Some(VolumeCondition {
                    abnormal: true,
                    message: format!("the mount on {} is broken", msg.volume_path),
                }),
            })),
            MountHealth::Healthy => {
                trace!("Getting statfs metrics for : {:?}", volume_path);
                let usage = tokio::task::spawn_blocking(move || statfs_usage(&volume_path))
                    .await
                    .map_err(|error| Status::internal(error.to_string()))??;
                Ok(Response::new(NodeGetVolumeStatsResponse {
                    usage,
                    volume_condition: Some(VolumeCondition {
                        abnormal: false,
                        message: String::new(),
                    }),
                }))
            }
        }
    }
}
