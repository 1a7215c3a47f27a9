//! Implementation of gRPC methods from CSI Identity gRPC service.
//! Both the node and the controller plugin serve the same identity.

use crate::{csi::*, plugin_capabilities::plugin_capabilities};

use std::collections::HashMap;
use tonic::{Request, Response, Status};
use tracing::debug;

const PLUGIN_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The Csi Identity service.
#[derive(Clone, Debug)]
pub struct Identity {
    driver_name: String,
}

impl Identity {
    /// New identity reporting the given driver name.
    pub fn new(driver_name: impl Into<String>) -> Self {
        Self {
            driver_name: driver_name.into(),
        }
    }
}

#[tonic::async_trait]
impl identity_server::Identity for Identity {
    async fn get_plugin_info(
        &self,
        _request: Request<GetPluginInfoRequest>,
    ) -> Result<Response<GetPluginInfoResponse>, Status> {
        debug!(
            "GetPluginInfo request ({}:{})",
            self.driver_name, PLUGIN_VERSION
        );

        Ok(Response::new(GetPluginInfoResponse {
            name: self.driver_name.clone(),
            vendor_version: PLUGIN_VERSION.to_owned(),
            manifest: HashMap::new(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        request: Request<GetPluginCapabilitiesRequest>,
    ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
        debug!("GetPluginCapabilities request: {:?}", request);

        Ok(Response::new(GetPluginCapabilitiesResponse {
            capabilities: plugin_capabilities(),
        }))
    }

    async fn probe(
        &self,
        _request: Request<ProbeRequest>,
    ) -> Result<Response<ProbeResponse>, Status> {
        // Mounts are served by the client processes, the plugin itself is always ready.
        Ok(Response::new(ProbeResponse { ready: Some(true) }))
    }
}
