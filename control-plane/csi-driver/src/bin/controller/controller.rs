use crate::{client::VolumeAdmin, pvstore::PvStore};

use csi_driver::{csi::*, limiter::VolumeOpGuard, CreateParams, VolumeParams};
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Prefix of the owners generated for volumes whose storage class names none.
const OWNER_PREFIX: &str = "csi_";
/// Length of a generated owner.
const OWNER_LEN: usize = 20;

/// The Csi Controller service, provisioning volumes on the storage cluster.
pub(crate) struct CsiControllerSvc<A, P> {
    admin: Arc<A>,
    pvs: Arc<P>,
}

impl<A: VolumeAdmin, P: PvStore> CsiControllerSvc<A, P> {
    pub(crate) fn new(admin: Arc<A>, pvs: Arc<P>) -> Self {
        Self { admin, pvs }
    }

    /// The volume parameters recorded in the PV of `volume_id`, `None` if it's gone.
    async fn recorded_params(&self, volume_id: &str) -> Result<Option<VolumeParams>, Status> {
        match self.pvs.volume_context(volume_id).await? {
            Some(context) => Ok(Some(VolumeParams::parse(volume_id, &context)?)),
            None => Ok(None),
        }
    }
}

/// Check whether target volume capabilities are valid. Volumes are only ever
/// consumed as filesystems.
fn check_volume_capabilities(capabilities: &[VolumeCapability]) -> Result<(), Status> {
    if capabilities.is_empty() {
        return Err(Status::invalid_argument("Missing volume capabilities"));
    }
    for capability in capabilities {
        match capability.access_type {
            Some(volume_capability::AccessType::Mount(_)) => {}
            Some(volume_capability::AccessType::Block(_)) => {
                return Err(Status::invalid_argument(
                    "Block access type is not supported",
                ))
            }
            None => return Err(Status::invalid_argument("Missing access type")),
        }
    }
    Ok(())
}

/// The requested capacity in bytes, and in whole GiB as the storage cluster takes it.
fn requested_capacity(range: Option<&CapacityRange>) -> Result<(i64, u64), Status> {
    let required = range.map(|range| range.required_bytes).unwrap_or_default();
    let gib = u64::try_from(required).unwrap_or_default() >> 30;
    if gib == 0 {
        return Err(Status::invalid_argument(format!(
            "Capacity must be at least 1GiB, requested {required} bytes"
        )));
    }
    Ok((required, gib))
}

/// A fresh volume owner.
fn generate_owner() -> String {
    let mut owner = format!("{OWNER_PREFIX}{}", Uuid::new_v4().simple());
    owner.truncate(OWNER_LEN);
    owner
}

#[tonic::async_trait]
impl<A: VolumeAdmin, P: PvStore> controller_server::Controller for CsiControllerSvc<A, P> {
    #[instrument(err, fields(volume.id = %request.get_ref().name), skip(self))]
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        let args = request.into_inner();
        tracing::trace!(request = ?args);

        if args.name.is_empty() {
            return Err(Status::invalid_argument("Missing volume name"));
        }
        let _guard = VolumeOpGuard::new(&args.name)?;
        check_volume_capabilities(&args.volume_capabilities)?;
        let (capacity_bytes, capacity_gib) = requested_capacity(args.capacity_range.as_ref())?;
        let params = CreateParams::parse(&args.name, &args.parameters, generate_owner)?;

        self.admin
            .create_volume(&params, capacity_gib)
            .await
            .map_err(|error| {
                failure!(
                    Code::Internal,
                    "Failed to create volume '{}': {}",
                    args.name,
                    error
                )
            })?;
        info!(
            volume.id = args.name,
            volume.name = params.volume().vol_name,
            capacity_gib,
            "Volume created"
        );

        Ok(Response::new(CreateVolumeResponse {
            volume: Some(Volume {
                capacity_bytes,
                volume_id: args.name,
                volume_context: params.volume().to_context(),
            }),
        }))
    }

    #[instrument(err, fields(volume.id = %request.get_ref().volume_id), skip(self))]
    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        let args = request.into_inner();
        tracing::trace!(volume.id = %args.volume_id, "DeleteVolume request");

        let _guard = VolumeOpGuard::new(&args.volume_id)?;
        let Some(params) = self.recorded_params(&args.volume_id).await? else {
            warn!(volume.id = args.volume_id, "PV not found, assuming the volume is deleted");
            return Ok(Response::new(DeleteVolumeResponse {}));
        };

        self.admin.delete_volume(&params).await.map_err(|error| {
            let status = Status::from(error);
            failure!(
                status.code();
                "Failed to delete volume '{}': {}",
                args.volume_id,
                status.message()
            )
        })?;
        info!(
            volume.id = args.volume_id,
            volume.name = params.vol_name,
            "Volume deleted"
        );
        Ok(Response::new(DeleteVolumeResponse {}))
    }

    #[instrument(err, fields(volume.id = %request.get_ref().volume_id), skip(self))]
    async fn validate_volume_capabilities(
        &self,
        request: Request<ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<ValidateVolumeCapabilitiesResponse>, Status> {
        let args = request.into_inner();
        tracing::trace!(request = ?args);

        if args.volume_id.is_empty() {
            return Err(Status::invalid_argument("Missing volume id"));
        }
        if args.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument("Missing volume capabilities"));
        }

        let response = match check_volume_capabilities(&args.volume_capabilities) {
            Ok(()) => ValidateVolumeCapabilitiesResponse {
                confirmed: Some(validate_volume_capabilities_response::Confirmed {
                    volume_context: args.volume_context,
                    volume_capabilities: args.volume_capabilities,
                    parameters: args.parameters,
                }),
                message: String::new(),
            },
            Err(status) => {
                debug!(volume.id = args.volume_id, reason = status.message(), "Capabilities not confirmed");
                ValidateVolumeCapabilitiesResponse {
                    confirmed: None,
                    message: status.message().to_string(),
                }
            }
        };
        Ok(Response::new(response))
    }

    #[instrument(err, skip(self))]
    async fn controller_get_capabilities(
        &self,
        _request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        let capabilities = vec![
            controller_service_capability::rpc::Type::CreateDeleteVolume,
            controller_service_capability::rpc::Type::ExpandVolume,
        ];

        Ok(Response::new(ControllerGetCapabilitiesResponse {
            capabilities: capabilities
                .into_iter()
                .map(|c| ControllerServiceCapability {
                    r#type: Some(controller_service_capability::Type::Rpc(
                        controller_service_capability::Rpc { r#type: c as i32 },
                    )),
                })
                .collect(),
        }))
    }

    #[instrument(err, fields(volume.id = %request.get_ref().volume_id), skip(self))]
    async fn controller_expand_volume(
        &self,
        request: Request<ControllerExpandVolumeRequest>,
    ) -> Result<Response<ControllerExpandVolumeResponse>, Status> {
        let args = request.into_inner();
        tracing::trace!(request = ?args);

        let _guard = VolumeOpGuard::new(&args.volume_id)?;
        if let Some(capability) = &args.volume_capability {
            check_volume_capabilities(std::slice::from_ref(capability))?;
        }
        let (capacity_bytes, capacity_gib) = requested_capacity(args.capacity_range.as_ref())?;
        let Some(params) = self.recorded_params(&args.volume_id).await? else {
            return Err(failure!(
                Code::NotFound,
                "Volume '{}' not found",
                args.volume_id
            ));
        };

        self.admin
            .expand_volume(&params, capacity_gib)
            .await
            .map_err(|error| {
                let status = Status::from(error);
                failure!(
                    status.code();
                    "Failed to expand volume '{}': {}",
                    args.volume_id,
                    status.message()
                )
            })?;
        info!(volume.id = args.volume_id, capacity_gib, "Volume expanded");

        Ok(Response::new(ControllerExpandVolumeResponse {
            capacity_bytes,
            node_expansion_required: false,
        }))
    }
}
