//! In-memory stand-ins for the mount namespace, the filesystem client and the orchestrator.
use crate::{
    error::{BindConflict, BrokenMount, LaunchError, MountError, OrchestratorError, StaleTarget},
    k8s::{AttachedVolume, VolumeInventory},
    launcher::ClientLauncher,
    mount::{bind_state, mount_at, mount_containing, BindState, MountInfo, MountState, Mounter},
    mountpoint::FS_NAME_PREFIX,
};
use csi_driver::VolumeParams;
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

/// A mount namespace changing operation.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) enum Op {
    Bind {
        source: PathBuf,
        target: PathBuf,
        readonly: bool,
    },
    Unbind(PathBuf),
    ForceUnmount(PathBuf),
}

#[derive(Debug, Clone)]
struct FakeMount {
    info: MountInfo,
    corrupted: bool,
}

#[derive(Debug, Default)]
struct FakeNamespace {
    mounts: Vec<FakeMount>,
    ops: Vec<Op>,
    next_device: u32,
}

impl FakeNamespace {
    fn table(&self) -> Vec<MountInfo> {
        self.mounts.iter().map(|mount| mount.info.clone()).collect()
    }
    fn top(&mut self, path: &Path) -> Option<&mut FakeMount> {
        self.mounts.iter_mut().rev().find(|mount| mount.info.dest == path)
    }
    fn remove_top(&mut self, path: &Path) -> bool {
        match self.mounts.iter().rposition(|mount| mount.info.dest == path) {
            Some(index) => {
                self.mounts.remove(index);
                true
            }
            None => false,
        }
    }
}

/// A mount namespace held in memory.
#[derive(Debug, Default)]
pub(crate) struct FakeMounter {
    inner: Mutex<FakeNamespace>,
}

impl FakeMounter {
    fn lock(&self) -> std::sync::MutexGuard<'_, FakeNamespace> {
        self.inner.lock().unwrap()
    }
    /// Mount a client for `volume_name` on `path`, without recording an operation.
    pub(crate) fn mount_client(&self, path: &Path, volume_name: &str) {
        let mut ns = self.lock();
        ns.next_device += 1;
        let info = MountInfo {
            device: format!("0:{}", 100 + ns.next_device),
            root: PathBuf::from("/"),
            dest: path.to_path_buf(),
            fstype: "fuse.cubefs".to_string(),
            source: format!("{FS_NAME_PREFIX}{volume_name}"),
            options: vec!["rw".to_string()],
        };
        ns.mounts.push(FakeMount {
            info,
            corrupted: false,
        });
    }
    /// Break every mount sharing the device of the mount on `path`, like a dead client does.
    pub(crate) fn corrupt(&self, path: &Path) {
        let mut ns = self.lock();
        let Some(device) = mount_at(&ns.table(), path).map(|mount| mount.device.clone()) else {
            return;
        };
        for mount in ns.mounts.iter_mut().filter(|mount| mount.info.device == device) {
            mount.corrupted = true;
        }
    }
    /// Break only the mount on `path`.
    pub(crate) fn corrupt_one(&self, path: &Path) {
        if let Some(mount) = self.lock().top(path) {
            mount.corrupted = true;
        }
    }
    pub(crate) fn ops(&self) -> Vec<Op> {
        self.lock().ops.clone()
    }
    pub(crate) fn clear_ops(&self) {
        self.lock().ops.clear();
    }
    pub(crate) fn is_mounted(&self, path: &Path) -> bool {
        mount_at(&self.lock().table(), path).is_some()
    }
    pub(crate) fn mount_count(&self, path: &Path) -> usize {
        self.lock()
            .mounts
            .iter()
            .filter(|mount| mount.info.dest == path)
            .count()
    }
}

#[tonic::async_trait]
impl Mounter for FakeMounter {
    async fn mount_table(&self) -> Result<Vec<MountInfo>, MountError> {
        Ok(self.lock().table())
    }

    async fn mount_state(&self, path: &Path) -> Result<MountState, MountError> {
        Ok(match self.lock().top(path) {
            None => MountState::NotMounted,
            Some(mount) if mount.corrupted => MountState::Stale,
            Some(_) => MountState::Mounted,
        })
    }

    async fn bind(&self, source: &Path, target: &Path, readonly: bool) -> Result<(), MountError> {
        let mut ns = self.lock();
        if ns.top(target).map_or(false, |mount| mount.corrupted) {
            return StaleTarget { target }.fail();
        }
        let table = ns.table();
        match bind_state(&table, source, target) {
            BindState::Bound { readonly: current } if current == readonly => return Ok(()),
            BindState::Bound { .. } => {
                return BindConflict {
                    source_path: source,
                    target,
                    existing: "readonly mismatch".to_string(),
                }
                .fail()
            }
            BindState::Foreign { existing } => {
                return BindConflict {
                    source_path: source,
                    target,
                    existing,
                }
                .fail()
            }
            BindState::Unbound => {}
        }
        let Some(origin) = mount_containing(&table, source) else {
            return BindConflict {
                source_path: source,
                target,
                existing: "nothing mounted at the source".to_string(),
            }
            .fail();
        };
        let relative = source.strip_prefix(&origin.dest).unwrap_or(Path::new(""));
        let info = MountInfo {
            root: origin.root.join(relative),
            dest: target.to_path_buf(),
            options: vec![if readonly { "ro" } else { "rw" }.to_string()],
            ..origin.clone()
        };
        let corrupted = ns
            .mounts
            .iter()
            .any(|mount| mount.info.device == info.device && mount.corrupted);
        ns.mounts.push(FakeMount { info, corrupted });
        ns.ops.push(Op::Bind {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            readonly,
        });
        Ok(())
    }

    async fn unbind(&self, target: &Path) -> Result<(), MountError> {
        let mut ns = self.lock();
        if ns.remove_top(target) {
            ns.ops.push(Op::Unbind(target.to_path_buf()));
        }
        Ok(())
    }

    async fn force_unmount(&self, target: &Path) -> Result<(), MountError> {
        let mut ns = self.lock();
        ns.remove_top(target);
        ns.ops.push(Op::ForceUnmount(target.to_path_buf()));
        Ok(())
    }
}

/// A launcher which mounts a fake client on the mount path.
pub(crate) struct FakeLauncher {
    mounter: Arc<FakeMounter>,
    launches: Mutex<Vec<(String, PathBuf)>>,
    releases: Mutex<Vec<String>>,
    failing: HashSet<String>,
    /// Volumes whose next launch reports success but leaves a broken mount.
    broken_once: Mutex<HashSet<String>>,
    /// How long each launch takes before the client mounts.
    delay: Duration,
}

impl FakeLauncher {
    pub(crate) fn new(mounter: Arc<FakeMounter>) -> Self {
        Self {
            mounter,
            launches: Mutex::default(),
            releases: Mutex::default(),
            failing: HashSet::new(),
            broken_once: Mutex::default(),
            delay: Duration::ZERO,
        }
    }
    /// Every launch takes `delay` to mount.
    pub(crate) fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
    /// Every launch of `volume_id` fails.
    pub(crate) fn failing(mut self, volume_id: &str) -> Self {
        self.failing.insert(volume_id.to_string());
        self
    }
    /// The next launch of `volume_id` leaves a corrupted mount behind.
    pub(crate) fn broken_once(self, volume_id: &str) -> Self {
        self.broken_once
            .lock()
            .unwrap()
            .insert(volume_id.to_string());
        self
    }
    pub(crate) fn launches(&self) -> Vec<(String, PathBuf)> {
        self.launches.lock().unwrap().clone()
    }
    pub(crate) fn releases(&self) -> Vec<String> {
        self.releases.lock().unwrap().clone()
    }
}

#[tonic::async_trait]
impl ClientLauncher for FakeLauncher {
    async fn ensure_mounted(
        &self,
        volume_id: &str,
        params: &VolumeParams,
        mount_path: &Path,
    ) -> Result<(), LaunchError> {
        self.launches
            .lock()
            .unwrap()
            .push((volume_id.to_string(), mount_path.to_path_buf()));
        if self.failing.contains(volume_id) {
            return BrokenMount { mount_path }.fail();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.mounter.mount_client(mount_path, &params.vol_name);
        if self.broken_once.lock().unwrap().remove(volume_id) {
            self.mounter.corrupt_one(mount_path);
        }
        Ok(())
    }

    async fn release(&self, volume_id: &str) {
        self.releases.lock().unwrap().push(volume_id.to_string());
    }
}

/// A fixed orchestrator view.
pub(crate) struct FakeInventory {
    volumes: Vec<AttachedVolume>,
    unavailable: bool,
}

impl FakeInventory {
    pub(crate) fn new(volumes: Vec<AttachedVolume>) -> Self {
        Self {
            volumes,
            unavailable: false,
        }
    }
    /// An orchestrator which can't be reached.
    pub(crate) fn unavailable() -> Self {
        Self {
            volumes: Vec::new(),
            unavailable: true,
        }
    }
}

#[tonic::async_trait]
impl VolumeInventory for FakeInventory {
    async fn attached_volumes(&self) -> Result<Vec<AttachedVolume>, OrchestratorError> {
        if self.unavailable {
            return Err(OrchestratorError::List {
                source: kube::Error::Api(kube::core::ErrorResponse {
                    status: "Failure".to_string(),
                    message: "service unavailable".to_string(),
                    reason: "ServiceUnavailable".to_string(),
                    code: 503,
                }),
                resource: "volumeattachments",
            });
        }
        Ok(self.volumes.clone())
    }
}
