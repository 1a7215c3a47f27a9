//! What the orchestrator knows about the volumes attached to this node and their consumers.
use crate::error::{Client, List, OrchestratorError};
use csi_driver::Parameters;
use k8s_openapi::api::{
    core::v1::{PersistentVolume, Pod},
    storage::v1::VolumeAttachment,
};
use kube::{api::ListParams, Api, ResourceExt};
use snafu::ResultExt;
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace};

/// A sub-path volume mount declared by a container.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct SubPath {
    pub(crate) container: String,
    /// Position of the volume mount in the container's volume mounts.
    pub(crate) index: usize,
    /// Directory within the volume.
    pub(crate) sub_path: String,
    pub(crate) read_only: bool,
}

/// A running pod which references an attached volume.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct Consumer {
    pub(crate) uid: String,
    pub(crate) namespace: String,
    pub(crate) name: String,
    /// Name of the pod volume which references the claim.
    pub(crate) pod_volume: String,
    pub(crate) read_only: bool,
    pub(crate) sub_paths: Vec<SubPath>,
}

/// A volume attached to this node by our driver.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct AttachedVolume {
    pub(crate) pv_name: String,
    /// The CSI volume handle.
    pub(crate) volume_id: String,
    /// The volume context the volume was staged with.
    pub(crate) attributes: HashMap<String, String>,
    pub(crate) read_only: bool,
    pub(crate) consumers: Vec<Consumer>,
}

/// Source of the attached volumes and their consumers.
#[tonic::async_trait]
pub(crate) trait VolumeInventory: Send + Sync + 'static {
    async fn attached_volumes(&self) -> Result<Vec<AttachedVolume>, OrchestratorError>;
}

/// Inventory backed by the k8s api-server.
#[derive(Clone)]
pub(crate) struct KubeInventory {
    client: kube::Client,
    node_name: String,
    driver_name: String,
}

impl KubeInventory {
    /// Create the inventory using the in-cluster (or kubeconfig) credentials.
    pub(crate) async fn new(node_name: &str, driver_name: &str) -> Result<Self, OrchestratorError> {
        let client = kube::Client::try_default().await.context(Client)?;
        Ok(Self {
            client,
            node_name: node_name.to_string(),
            driver_name: driver_name.to_string(),
        })
    }
}

#[tonic::async_trait]
impl VolumeInventory for KubeInventory {
    async fn attached_volumes(&self) -> Result<Vec<AttachedVolume>, OrchestratorError> {
        let attachments = Api::<VolumeAttachment>::all(self.client.clone())
            .list(&ListParams::default())
            .await
            .context(List {
                resource: "volumeattachments",
            })?;
        let pvs = Api::<PersistentVolume>::all(self.client.clone())
            .list(&ListParams::default())
            .await
            .context(List {
                resource: "persistentvolumes",
            })?;
        let pods = Api::<Pod>::all(self.client.clone())
            .list(&ListParams::default().fields(&format!("spec.nodeName={}", self.node_name)))
            .await
            .context(List { resource: "pods" })?;
        trace!(
            attachments = attachments.items.len(),
            pvs = pvs.items.len(),
            pods = pods.items.len(),
            "Listed orchestrator state"
        );

        Ok(collate(
            &self.node_name,
            &self.driver_name,
            &attachments.items,
            &pvs.items,
            &pods.items,
        ))
    }
}

fn is_running(pod: &Pod) -> bool {
    pod.status.as_ref().and_then(|status| status.phase.as_deref()) == Some("Running")
}

/// The pods among `pods` which use the claim `namespace/claim`.
fn consumers_of(pods: &[Pod], namespace: &str, claim: &str, pv_read_only: bool) -> Vec<Consumer> {
    let mut seen = HashSet::new();
    let mut consumers = Vec::new();
    for pod in pods.iter().filter(|pod| is_running(pod)) {
        if pod.namespace().as_deref() != Some(namespace) {
            continue;
        }
        let (Some(uid), Some(spec)) = (pod.uid(), pod.spec.as_ref()) else {
            continue;
        };
        let Some(volume) = spec.volumes.iter().flatten().find(|volume| {
            volume
                .persistent_volume_claim
                .as_ref()
                .map_or(false, |source| source.claim_name == claim)
        }) else {
            continue;
        };
        if !seen.insert(uid.clone()) {
            continue;
        }

        let sub_paths = spec
            .containers
            .iter()
            .flat_map(|container| {
                container
                    .volume_mounts
                    .iter()
                    .flatten()
                    .enumerate()
                    .filter(|(_, mount)| mount.name == volume.name)
                    .filter_map(|(index, mount)| {
                        let sub_path = mount.sub_path.as_deref().filter(|path| !path.is_empty())?;
                        Some(SubPath {
                            container: container.name.clone(),
                            index,
                            sub_path: sub_path.to_string(),
                            read_only: mount.read_only.unwrap_or(false),
                        })
                    })
            })
            .collect();

        let claim_read_only = volume
            .persistent_volume_claim
            .as_ref()
            .and_then(|source| source.read_only)
            .unwrap_or(false);
        consumers.push(Consumer {
            uid,
            namespace: namespace.to_string(),
            name: pod.name_any(),
            pod_volume: volume.name.clone(),
            read_only: pv_read_only || claim_read_only,
            sub_paths,
        });
    }
    consumers
}

/// Join attachments, persistent volumes and pods into the volumes attached to `node` by
/// `driver`, each with its running consumers.
pub(crate) fn collate(
    node: &str,
    driver: &str,
    attachments: &[VolumeAttachment],
    pvs: &[PersistentVolume],
    pods: &[Pod],
) -> Vec<AttachedVolume> {
    let attached = attachments
        .iter()
        .filter(|va| va.spec.attacher == driver && va.spec.node_name == node)
        .filter(|va| va.status.as_ref().map_or(false, |status| status.attached))
        .filter_map(|va| va.spec.source.persistent_volume_name.clone())
        .collect::<HashSet<_>>();

    let mut volumes = Vec::new();
    for pv in pvs {
        let pv_name = pv.name_any();
        if !attached.contains(&pv_name) {
            continue;
        }
        let Some(spec) = pv.spec.as_ref() else {
            continue;
        };
        let Some(csi) = spec.csi.as_ref().filter(|csi| csi.driver == driver) else {
            continue;
        };

        let mut attributes = csi
            .volume_attributes
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect::<HashMap<_, _>>();
        let read_only = csi.read_only.unwrap_or(false);

        let claim = spec
            .claim_ref
            .as_ref()
            .and_then(|claim| Some((claim.namespace.clone()?, claim.name.clone()?)));
        let consumers = match &claim {
            Some((namespace, name)) => {
                attributes.insert(Parameters::PvcName.to_string(), name.clone());
                attributes.insert(Parameters::PvcNamespace.to_string(), namespace.clone());
                consumers_of(pods, namespace, name, read_only)
            }
            None => {
                debug!(pv.name = pv_name, "Attached volume is not bound to a claim");
                Vec::new()
            }
        };

        volumes.push(AttachedVolume {
            pv_name,
            volume_id: csi.volume_handle.clone(),
            attributes,
            read_only,
            consumers,
        });
    }
    volumes
}
