//! Kubelet mount path layout, and the classifier which maps kernel mount table
//! entries back to the volumes and pods they belong to.
use crate::mount::MountInfo;
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};
use tracing::debug;

/// Mount source prefix of every filesystem client mount, followed by the volume name.
pub(crate) const FS_NAME_PREFIX: &str = "cubefs-";

static GLOBAL_MOUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^.*/csi/pv/([a-z0-9-]+)/globalmount$").expect("valid global mount regex")
});
static POD_MOUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^.*/([a-z0-9-]+)/volumes/kubernetes.io~csi/([a-z0-9-]+)/mount$")
        .expect("valid pod mount regex")
});

/// Whose mount this is.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) enum MountKind {
    /// The staging mount shared by every pod on the node.
    Global,
    /// A bind of the global mount into a pod.
    Consumer { pod_uid: String },
}

/// A client mount found in the kernel mount table.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct MountPoint {
    /// Mount source, ie the prefixed volume name.
    pub(crate) device: String,
    pub(crate) volume_name: String,
    pub(crate) path: PathBuf,
    /// Name of the persistent volume embedded in the path.
    pub(crate) pv_name: String,
    pub(crate) kind: MountKind,
}

impl MountPoint {
    /// Is this the global (staging) mount.
    pub(crate) fn is_global(&self) -> bool {
        self.kind == MountKind::Global
    }
    /// The pod which owns this mount, if any.
    pub(crate) fn pod_uid(&self) -> Option<&str> {
        match &self.kind {
            MountKind::Global => None,
            MountKind::Consumer { pod_uid } => Some(pod_uid),
        }
    }

    /// Classify a single mount table entry.
    /// Entries of other filesystems are ignored quietly, client mounts whose path matches
    /// neither shape are dropped with a diagnostic.
    pub(crate) fn classify(device: &str, path: &Path) -> Option<Self> {
        let volume_name = device.strip_prefix(FS_NAME_PREFIX)?;
        let path_str = path.to_string_lossy();

        let (pv_name, kind) = if let Some(captures) = GLOBAL_MOUNT.captures(&path_str) {
            (captures[1].to_string(), MountKind::Global)
        } else if let Some(captures) = POD_MOUNT.captures(&path_str) {
            (
                captures[2].to_string(),
                MountKind::Consumer {
                    pod_uid: captures[1].to_string(),
                },
            )
        } else {
            debug!(device, path = %path_str, "Ignoring mount with an unknown path layout");
            return None;
        };

        Some(Self {
            device: device.to_string(),
            volume_name: volume_name.to_string(),
            path: path.to_path_buf(),
            pv_name,
            kind,
        })
    }
}

/// Group the client mounts of the mount table by volume name.
pub(crate) fn classify_mounts(table: &[MountInfo]) -> HashMap<String, Vec<MountPoint>> {
    let mut volumes = HashMap::<String, Vec<MountPoint>>::new();
    for mount in table {
        if let Some(point) = MountPoint::classify(&mount.source, &mount.dest) {
            volumes
                .entry(point.volume_name.clone())
                .or_default()
                .push(point);
        }
    }
    volumes
}

/// The mount paths kubelet hands to the plugin, rooted at the kubelet directory.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct KubeletPaths {
    root: PathBuf,
}

impl KubeletPaths {
    pub(crate) fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
    /// Staging path of a persistent volume.
    pub(crate) fn global_mount(&self, pv_name: &str) -> PathBuf {
        self.root
            .join("plugins/kubernetes.io/csi/pv")
            .join(pv_name)
            .join("globalmount")
    }
    /// Publish path of a persistent volume in a pod.
    pub(crate) fn pod_mount(&self, pod_uid: &str, pv_name: &str) -> PathBuf {
        self.root
            .join("pods")
            .join(pod_uid)
            .join("volumes/kubernetes.io~csi")
            .join(pv_name)
            .join("mount")
    }
    /// Where kubelet binds the sub-path of the `index`th volume mount of a container.
    pub(crate) fn sub_path_mount(
        &self,
        pod_uid: &str,
        pod_volume: &str,
        container: &str,
        index: usize,
    ) -> PathBuf {
        self.root
            .join("pods")
            .join(pod_uid)
            .join("volume-subpaths")
            .join(pod_volume)
            .join(container)
            .join(index.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::tests::entry;

    const KUBELET_PLUGIN: &str = "/var/lib/kubelet/plugins/kubernetes.io/csi/pv";

    #[test]
    fn global_mount_point() {
        let path = format!("{KUBELET_PLUGIN}/pvc-3ce3451a-82b3-11ea-80b3-246e968d4b38/globalmount");
        let point = MountPoint::classify("cubefs-share_volume", Path::new(&path)).unwrap();
        assert!(point.is_global());
        assert_eq!(point.pod_uid(), None);
        assert_eq!(point.volume_name, "share_volume");
        assert_eq!(point.device, "cubefs-share_volume");
        assert_eq!(point.pv_name, "pvc-3ce3451a-82b3-11ea-80b3-246e968d4b38");
    }

    #[test]
    fn pod_mount_point() {
        let path = "/var/lib/kubelet/pods/4054c1bb-82b3-11ea-80b3-246e968d4b38/volumes/kubernetes.io~csi/pvc-3ce3451a-82b3-11ea-80b3-246e968d4b38/mount";
        let point = MountPoint::classify("cubefs-share_volume", Path::new(path)).unwrap();
        assert!(!point.is_global());
        assert_eq!(point.pod_uid(), Some("4054c1bb-82b3-11ea-80b3-246e968d4b38"));
        assert_eq!(point.volume_name, "share_volume");
        assert_eq!(point.pv_name, "pvc-3ce3451a-82b3-11ea-80b3-246e968d4b38");
    }

    #[test]
    fn unrelated_and_malformed_mounts_are_dropped() {
        let global = format!("{KUBELET_PLUGIN}/pvc-1/globalmount");
        assert!(MountPoint::classify("/dev/sda1", Path::new(&global)).is_none());
        assert!(MountPoint::classify("cubefs-v", Path::new("/mnt/elsewhere")).is_none());
        assert!(MountPoint::classify(
            "cubefs-v",
            Path::new("/var/lib/kubelet/pods/UPPER/volumes/kubernetes.io~csi/pvc-1/mount")
        )
        .is_none());
    }

    #[test]
    fn groups_by_volume() {
        let uuid_volume = "pvc-9ae9405c-7fb3-11ea-80b3-246e968d4b38";
        let share_pv = "pvc-3ce3451a-82b3-11ea-80b3-246e968d4b38";
        let table = vec![
            entry("0:50", "cubefs-share_volume", "/", &format!("{KUBELET_PLUGIN}/{share_pv}/globalmount")),
            entry(
                "0:50",
                "cubefs-share_volume",
                "/",
                &format!("/var/lib/kubelet/pods/4054c1bb-82b3-11ea-80b3-246e968d4b38/volumes/kubernetes.io~csi/{share_pv}/mount"),
            ),
            entry(
                "0:50",
                "cubefs-share_volume",
                "/",
                &format!("/var/lib/kubelet/pods/5a7c4e2d-82b3-11ea-80b3-246e968d4b38/volumes/kubernetes.io~csi/{share_pv}/mount"),
            ),
            entry(
                "0:51",
                &format!("cubefs-{uuid_volume}"),
                "/",
                &format!("{KUBELET_PLUGIN}/{uuid_volume}/globalmount"),
            ),
            entry(
                "0:51",
                &format!("cubefs-{uuid_volume}"),
                "/",
                &format!("/var/lib/kubelet/pods/6b1d2f3e-7fb3-11ea-80b3-246e968d4b38/volumes/kubernetes.io~csi/{uuid_volume}/mount"),
            ),
            entry(
                "0:51",
                &format!("cubefs-{uuid_volume}"),
                "/",
                &format!("/var/lib/kubelet/pods/7c2e3a4f-7fb3-11ea-80b3-246e968d4b38/volumes/kubernetes.io~csi/{uuid_volume}/mount"),
            ),
            entry("259:2", "/dev/nvme0n1p2", "/", "/"),
        ];

        let volumes = classify_mounts(&table);
        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes["share_volume"].len(), 3);
        assert_eq!(volumes[uuid_volume].len(), 3);
        assert_eq!(
            volumes[uuid_volume]
                .iter()
                .filter(|point| point.is_global())
                .count(),
            1
        );
        assert!(volumes["share_volume"]
            .iter()
            .all(|point| point.pv_name == share_pv));
    }

    #[test]
    fn kubelet_paths() {
        let paths = KubeletPaths::new("/var/lib/kubelet");
        assert_eq!(
            paths.global_mount("pvc-1"),
            PathBuf::from("/var/lib/kubelet/plugins/kubernetes.io/csi/pv/pvc-1/globalmount")
        );
        assert_eq!(
            paths.pod_mount("uid-1", "pvc-1"),
            PathBuf::from("/var/lib/kubelet/pods/uid-1/volumes/kubernetes.io~csi/pvc-1/mount")
        );
        assert_eq!(
            paths.sub_path_mount("uid-1", "data", "app", 2),
            PathBuf::from("/var/lib/kubelet/pods/uid-1/volume-subpaths/data/app/2")
        );

        // the paths we generate are the paths we classify
        let point = MountPoint::classify("cubefs-v", &paths.pod_mount("uid-1", "pvc-1")).unwrap();
        assert_eq!(point.pod_uid(), Some("uid-1"));
        let point = MountPoint::classify("cubefs-v", &paths.global_mount("pvc-1")).unwrap();
        assert!(point.is_global());
    }
}
