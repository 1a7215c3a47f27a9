//! CubeFS CSI plugin library.
//!
//! Shared between the `csi-node` and `csi-controller` binaries: the generated CSI protocol,
//! typed volume parameters, the identity service and a few process level helpers.

/// The CSI plugin's default name.
pub use utils::csi_plugin_name;

/// Volume Parameters parsed from context.
pub use context::{CreateParams, ParameterError, Parameters, VolumeParams};

/// The csi protocol, generated from `proto/csi.proto`.
#[allow(clippy::derive_partial_eq_without_eq)]
pub mod csi {
    tonic::include_proto!("csi.v1");
}

/// The volume contexts.
pub mod context;
/// The identity service, shared by node and controller.
pub mod identity;
/// Volume concurrency limiter.
pub mod limiter;
/// Contains tools to advertise the same set of capabilities across different
/// CSI microservices.
pub mod plugin_capabilities;
/// Shutdown on SIGINT/SIGTERM.
pub mod shutdown;
/// Unix domain socket listener for the CSI endpoint.
pub mod uds;
