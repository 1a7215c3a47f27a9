use crate::{
    error::MountError,
    mount::{MountState, Mounter},
};
use std::path::Path;

/// Health of a mount path.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum MountHealth {
    /// Nothing is mounted there, the path may not even exist.
    Absent,
    Healthy,
    /// Still in the mount table but I/O fails, typically because the client died.
    Corrupted,
}

impl From<MountState> for MountHealth {
    fn from(state: MountState) -> Self {
        match state {
            MountState::Mounted => Self::Healthy,
            MountState::NotMounted => Self::Absent,
            MountState::Stale => Self::Corrupted,
        }
    }
}

/// Probe the health of the mount at `path`.
pub(crate) async fn probe<M: Mounter + ?Sized>(
    mounter: &M,
    path: &Path,
) -> Result<MountHealth, MountError> {
    mounter.mount_state(path).await.map(MountHealth::from)
}
