use k8s_openapi::api::core::v1::PersistentVolume;
use kube::{api::Api, Client, ResourceExt};
use snafu::{ResultExt, Snafu};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub(crate) enum PvError {
    #[snafu(display("Failed to connect to the k8s api: {source}"))]
    Connect { source: kube::Error },
    #[snafu(display("Failed to get PV '{pv}': {source}"))]
    Get { source: kube::Error, pv: String },
    #[snafu(display("PV '{pv}' is not provisioned by {driver}"))]
    Foreign { pv: String, driver: String },
}

impl From<PvError> for tonic::Status {
    fn from(error: PvError) -> Self {
        match error {
            PvError::Connect { .. } | PvError::Get { .. } => {
                tonic::Status::unavailable(error.to_string())
            }
            PvError::Foreign { .. } => tonic::Status::failed_precondition(error.to_string()),
        }
    }
}

/// Where the volume context of provisioned volumes is kept.
#[tonic::async_trait]
pub(crate) trait PvStore: Send + Sync + 'static {
    /// The volume context recorded in the PV, `None` when there is no such PV.
    async fn volume_context(&self, pv: &str) -> Result<Option<HashMap<String, String>>, PvError>;
}

/// PVs read through the k8s api.
#[derive(Clone)]
pub(crate) struct KubePvStore {
    pvs: Api<PersistentVolume>,
    driver_name: String,
}

impl KubePvStore {
    pub(crate) async fn new(driver_name: &str) -> Result<Self, PvError> {
        let client = Client::try_default().await.context(Connect)?;
        Ok(Self {
            pvs: Api::<PersistentVolume>::all(client),
            driver_name: driver_name.to_string(),
        })
    }
}

#[tonic::async_trait]
impl PvStore for KubePvStore {
    async fn volume_context(&self, pv: &str) -> Result<Option<HashMap<String, String>>, PvError> {
        match self.pvs.get_opt(pv).await.context(Get { pv })? {
            Some(volume) => csi_attributes(&volume, &self.driver_name).map(Some),
            None => {
                debug!(pv.name = pv, "PV not present on API server");
                Ok(None)
            }
        }
    }
}

/// The CSI volume attributes of a PV provisioned by `driver`.
fn csi_attributes(pv: &PersistentVolume, driver: &str) -> Result<HashMap<String, String>, PvError> {
    let csi = pv
        .spec
        .as_ref()
        .and_then(|spec| spec.csi.as_ref())
        .filter(|csi| csi.driver == driver);
    match csi {
        Some(csi) => Ok(csi
            .volume_attributes
            .clone()
            .map(|attributes| attributes.into_iter().collect())
            .unwrap_or_default()),
        None => Foreign {
            pv: pv.name_any(),
            driver,
        }
        .fail(),
    }
}
