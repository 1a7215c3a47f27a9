//! The stage/publish state machine of a volume on this node.
use crate::{
    error::{CreateDir, MountError},
    launcher::ClientLauncher,
    mount::Mounter,
    probe::{probe, MountHealth},
};
use csi_driver::VolumeParams;
use snafu::ResultExt;
use std::{io::ErrorKind, path::Path, sync::Arc};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tonic::Status;
use tracing::{debug, info, warn};

/// Serializes every change to the node's mount namespace.
/// Mutations hold the exclusive side, readers of mount state the shared side.
#[derive(Debug, Clone, Default)]
pub(crate) struct MountLock(Arc<RwLock<()>>);

impl MountLock {
    pub(crate) async fn exclusive(&self) -> OwnedRwLockWriteGuard<()> {
        self.0.clone().write_owned().await
    }
    pub(crate) async fn shared(&self) -> OwnedRwLockReadGuard<()> {
        self.0.clone().read_owned().await
    }
}

/// Remove an emptied mount directory, tolerating it being gone already.
async fn remove_mount_dir(path: &Path) {
    match tokio::fs::remove_dir(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed mount directory"),
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => warn!(%error, path = %path.display(), "Failed to remove mount directory"),
    }
}

/// Drives the global and consumer mounts of volumes through the node RPCs.
pub(crate) struct MountLifecycle<M, L> {
    mounter: Arc<M>,
    launcher: Arc<L>,
    lock: MountLock,
}

impl<M, L> Clone for MountLifecycle<M, L> {
    fn clone(&self) -> Self {
        Self {
            mounter: self.mounter.clone(),
            launcher: self.launcher.clone(),
            lock: self.lock.clone(),
        }
    }
}

impl<M: Mounter, L: ClientLauncher> MountLifecycle<M, L> {
    pub(crate) fn new(mounter: Arc<M>, launcher: Arc<L>, lock: MountLock) -> Self {
        Self {
            mounter,
            launcher,
            lock,
        }
    }
    pub(crate) fn mounter(&self) -> &M {
        &self.mounter
    }
    pub(crate) fn lock(&self) -> &MountLock {
        &self.lock
    }

    /// Make sure the global mount of the volume is up and healthy on `staging_path`.
    pub(crate) async fn stage(
        &self,
        volume_id: &str,
        params: &VolumeParams,
        staging_path: &Path,
    ) -> Result<(), Status> {
        let _guard = self.lock.exclusive().await;

        match probe(self.mounter.as_ref(), staging_path).await? {
            MountHealth::Healthy => {
                debug!(volume.id = volume_id, path = %staging_path.display(), "Volume already staged");
                return Ok(());
            }
            MountHealth::Corrupted => {
                warn!(
                    volume.id = volume_id,
                    path = %staging_path.display(),
                    "Staging path is corrupted, remounting"
                );
                self.mounter.force_unmount(staging_path).await?;
            }
            MountHealth::Absent => {}
        }

        tokio::fs::create_dir_all(staging_path)
            .await
            .context(CreateDir { path: staging_path })
            .map_err(Status::from)?;

        if let Err(error) = self
            .launcher
            .ensure_mounted(volume_id, params, staging_path)
            .await
        {
            // the launcher cleans up after itself, this is for whatever it couldn't see
            if let Err(cleanup) = self.mounter.force_unmount(staging_path).await {
                warn!(%cleanup, "Failed to clean up the staging path");
            }
            return Err(failure!(
                Code::Internal,
                "Failed to stage volume '{}' on {}: {}",
                volume_id,
                staging_path.display(),
                error
            ));
        }
        info!(volume.id = volume_id, path = %staging_path.display(), "Volume staged");
        Ok(())
    }

    /// Tear down the global mount of the volume.
    pub(crate) async fn unstage(&self, volume_id: &str, staging_path: &Path) -> Result<(), Status> {
        let _guard = self.lock.exclusive().await;

        self.mounter.unbind(staging_path).await?;
        remove_mount_dir(staging_path).await;
        self.launcher.release(volume_id).await;
        info!(volume.id = volume_id, path = %staging_path.display(), "Volume unstaged");
        Ok(())
    }

    /// Bind the staged volume into a consumer's target path.
    pub(crate) async fn publish(
        &self,
        volume_id: &str,
        staging_path: &Path,
        target_path: &Path,
        readonly: bool,
    ) -> Result<(), Status> {
        let _guard = self.lock.exclusive().await;

        match probe(self.mounter.as_ref(), staging_path).await? {
            MountHealth::Healthy => {}
            health => {
                return Err(failure!(
                    Code::FailedPrecondition,
                    "Volume '{}' is not staged on {}: {:?}",
                    volume_id,
                    staging_path.display(),
                    health
                ))
            }
        }
        if probe(self.mounter.as_ref(), target_path).await? == MountHealth::Corrupted {
            warn!(
                volume.id = volume_id,
                path = %target_path.display(),
                "Target path is corrupted, rebinding"
            );
            self.mounter.force_unmount(target_path).await?;
        }

        self.mounter
            .bind(staging_path, target_path, readonly)
            .await
            .map_err(|error: MountError| {
                let status = Status::from(error);
                failure!(
                    status.code();
                    "Failed to publish volume '{}' on {}: {}",
                    volume_id,
                    target_path.display(),
                    status.message()
                )
            })?;
        info!(
            volume.id = volume_id,
            path = %target_path.display(),
            readonly,
            "Volume published"
        );
        Ok(())
    }

    /// Remove a consumer's bind of the volume.
    pub(crate) async fn unpublish(&self, volume_id: &str, target_path: &Path) -> Result<(), Status> {
        let _guard = self.lock.exclusive().await;

        self.mounter.unbind(target_path).await?;
        remove_mount_dir(target_path).await;
        info!(volume.id = volume_id, path = %target_path.display(), "Volume unpublished");
        Ok(())
    }
}
