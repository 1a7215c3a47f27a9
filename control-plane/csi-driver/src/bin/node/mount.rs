//! Kernel mount table access and bind mount management.
//!
//! Every operation which changes the mount namespace goes through the [`Mounter`] trait,
//! [`SysMounter`] being the real implementation on top of `sys_mount`.
use crate::error::{Bind, BindConflict, CreateDir, MountError, MountTable, StaleTarget, Stat, Task, Unmount};
use nix::errno::Errno;
use snafu::ResultExt;
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};
use sys_mount::{unmount, FilesystemType, Mount, MountFlags, UnmountFlags};
use tokio::task::spawn_blocking;
use tracing::{debug, warn};

const MOUNTINFO: &str = "/proc/self/mountinfo";

/// A single entry of the kernel mount table.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct MountInfo {
    /// `major:minor` of the mounted filesystem.
    pub(crate) device: String,
    /// Directory of the mounted filesystem which appears at `dest`.
    pub(crate) root: PathBuf,
    pub(crate) dest: PathBuf,
    pub(crate) fstype: String,
    /// Mount source, e.g. `cubefs-share_volume` for a client mount.
    pub(crate) source: String,
    pub(crate) options: Vec<String>,
}

impl MountInfo {
    /// Mounted read-only.
    pub(crate) fn readonly(&self) -> bool {
        self.options.iter().any(|option| option == "ro")
    }
}

/// Decode the octal escapes (`\040` etc) the kernel uses for whitespace in paths.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits
                    .iter()
                    .fold(0u16, |acc, d| acc * 8 + u16::from(d - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn parse_line(line: &str) -> Option<MountInfo> {
    let mut fields = line.split_whitespace();
    let _mount_id = fields.next()?;
    let _parent_id = fields.next()?;
    let device = fields.next()?;
    let root = fields.next()?;
    let dest = fields.next()?;
    let options = fields.next()?;
    // optional fields are terminated by a single hyphen
    while fields.next()? != "-" {}
    let fstype = fields.next()?;
    let source = fields.next()?;

    Some(MountInfo {
        device: device.to_string(),
        root: PathBuf::from(unescape(root)),
        dest: PathBuf::from(unescape(dest)),
        fstype: fstype.to_string(),
        source: unescape(source),
        options: options.split(',').map(ToString::to_string).collect(),
    })
}

/// Parse the content of a `mountinfo` file, skipping lines which can't be understood.
pub(crate) fn parse_mountinfo(content: &str) -> Vec<MountInfo> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let info = parse_line(line);
            if info.is_none() {
                warn!(line, "Skipping malformed mountinfo line");
            }
            info
        })
        .collect()
}

/// Read the mount table of our mount namespace.
pub(crate) fn read_mount_table() -> std::io::Result<Vec<MountInfo>> {
    Ok(parse_mountinfo(&std::fs::read_to_string(MOUNTINFO)?))
}

/// The top-most mount at exactly `path`.
pub(crate) fn mount_at<'a>(table: &'a [MountInfo], path: &Path) -> Option<&'a MountInfo> {
    table.iter().rev().find(|mount| mount.dest == path)
}

/// The mount which serves `path`, ie the deepest mount point which is a prefix of it.
pub(crate) fn mount_containing<'a>(table: &'a [MountInfo], path: &Path) -> Option<&'a MountInfo> {
    table
        .iter()
        .filter(|mount| path.starts_with(&mount.dest))
        .max_by_key(|mount| mount.dest.components().count())
}

/// Relation between a bind target and the source we want bound there.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum BindState {
    /// Nothing is mounted on the target.
    Unbound,
    /// The target already shows the source.
    Bound { readonly: bool },
    /// Something else is mounted on the target.
    Foreign { existing: String },
}

/// Work out whether `target` is a bind mount of `source`.
/// A bind of a sub-directory shows up with the same device and source as the mount it
/// comes from, but with the sub-directory appended to the root.
pub(crate) fn bind_state(table: &[MountInfo], source: &Path, target: &Path) -> BindState {
    let Some(current) = mount_at(table, target) else {
        return BindState::Unbound;
    };
    let existing = format!("{}:{}", current.source, current.root.display());
    let Some(origin) = mount_containing(table, source) else {
        return BindState::Foreign { existing };
    };
    let relative = source.strip_prefix(&origin.dest).unwrap_or(Path::new(""));
    let expected_root = origin.root.join(relative);
    if current.device == origin.device
        && current.source == origin.source
        && current.root == expected_root
    {
        BindState::Bound {
            readonly: current.readonly(),
        }
    } else {
        BindState::Foreign { existing }
    }
}

/// Mount state of a path, as seen through the kernel mount table and a stat of the path.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum MountState {
    Mounted,
    NotMounted,
    /// The path fails I/O with a transport or stale handle error, so whether anything
    /// usable is mounted can't be told.
    Stale,
}

/// Errors which mean the filesystem behind a path has gone away.
pub(crate) fn is_stale_errno(errno: Errno) -> bool {
    matches!(
        errno,
        Errno::ENOTCONN | Errno::ESTALE | Errno::EIO | Errno::EHOSTDOWN | Errno::EACCES
    )
}

/// Resolve symlinks in the parent of `path`, leaving the last component untouched since
/// it may be a stale mount point which can't be resolved.
fn resolve(path: &Path) -> PathBuf {
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => std::fs::canonicalize(parent)
            .map(|parent| parent.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

/// Operations on the node's mount namespace.
#[tonic::async_trait]
pub(crate) trait Mounter: Send + Sync + 'static {
    /// Current kernel mount table.
    async fn mount_table(&self) -> Result<Vec<MountInfo>, MountError>;
    /// Whether something is mounted on `path`.
    async fn mount_state(&self, path: &Path) -> Result<MountState, MountError>;
    /// Bind `source` onto `target`, creating `target` if needed.
    /// Binding an already bound target is a no-op, binding over a different mount fails.
    async fn bind(&self, source: &Path, target: &Path, readonly: bool) -> Result<(), MountError>;
    /// Unmount `target`; an unmounted target is a success.
    async fn unbind(&self, target: &Path) -> Result<(), MountError>;
    /// Lazily detach whatever is mounted on `target`, stale or not.
    async fn force_unmount(&self, target: &Path) -> Result<(), MountError>;
}

/// Unmount errors which mean there was nothing to unmount.
fn not_mounted(error: &std::io::Error) -> bool {
    matches!(
        error.raw_os_error().map(Errno::from_i32),
        Some(Errno::EINVAL) | Some(Errno::ENOENT)
    )
}

fn unmount_blocking(target: &Path, flags: UnmountFlags) -> Result<(), MountError> {
    match unmount(target, flags) {
        Ok(()) => {
            debug!(path = %target.display(), flags = flags.bits(), "Unmounted");
            Ok(())
        }
        Err(error) if not_mounted(&error) => {
            debug!(path = %target.display(), "Nothing mounted");
            Ok(())
        }
        Err(error) => Err(error).context(Unmount { target }),
    }
}

/// The real mounter, working on the kernel mount namespace.
#[derive(Debug, Clone)]
pub(crate) struct SysMounter {
    probe_timeout: Duration,
}

impl SysMounter {
    /// New mounter whose path probes give up after `probe_timeout`.
    pub(crate) fn new(probe_timeout: Duration) -> Self {
        Self { probe_timeout }
    }
}

#[tonic::async_trait]
impl Mounter for SysMounter {
    async fn mount_table(&self) -> Result<Vec<MountInfo>, MountError> {
        spawn_blocking(read_mount_table)
            .await
            .context(Task)?
            .context(MountTable)
    }

    async fn mount_state(&self, path: &Path) -> Result<MountState, MountError> {
        let owned = path.to_path_buf();
        let stat = spawn_blocking(move || std::fs::metadata(owned).map(|_| ()));
        match tokio::time::timeout(self.probe_timeout, stat).await {
            Err(_) => {
                warn!(path = %path.display(), "Timed out probing path");
                return Ok(MountState::Stale);
            }
            Ok(result) => match result.context(Task)? {
                Ok(()) => {}
                Err(error) if error.kind() == ErrorKind::NotFound => {
                    return Ok(MountState::NotMounted)
                }
                Err(error) => match error.raw_os_error().map(Errno::from_i32) {
                    Some(errno) if is_stale_errno(errno) => return Ok(MountState::Stale),
                    _ => return Err(error).context(Stat { path }),
                },
            },
        }
        let table = self.mount_table().await?;
        Ok(match mount_at(&table, &resolve(path)) {
            Some(_) => MountState::Mounted,
            None => MountState::NotMounted,
        })
    }

    async fn bind(&self, source: &Path, target: &Path, readonly: bool) -> Result<(), MountError> {
        if self.mount_state(target).await? == MountState::Stale {
            return StaleTarget { target }.fail();
        }
        tokio::fs::create_dir_all(target)
            .await
            .context(CreateDir { path: target })?;

        let table = self.mount_table().await?;
        match bind_state(&table, &resolve(source), &resolve(target)) {
            BindState::Bound { readonly: current } if current == readonly => {
                debug!(
                    source = %source.display(),
                    path = %target.display(),
                    "Already bind mounted"
                );
                return Ok(());
            }
            BindState::Bound { .. } => {
                return BindConflict {
                    source_path: source,
                    target,
                    existing: format!("{} (readonly={})", source.display(), !readonly),
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

        let source = source.to_path_buf();
        let target = target.to_path_buf();
        spawn_blocking(move || {
            Mount::builder()
                .fstype(FilesystemType::Manual("none"))
                .flags(MountFlags::BIND | MountFlags::REC)
                .mount(&source, &target)
                .context(Bind {
                    source_path: &source,
                    target: &target,
                })?;

            if readonly {
                let remount = Mount::builder()
                    .fstype(FilesystemType::Manual("none"))
                    .flags(MountFlags::BIND | MountFlags::REMOUNT | MountFlags::RDONLY)
                    .mount("none", &target);
                if let Err(error) = remount {
                    // don't leave a writable bind behind
                    unmount_blocking(&target, UnmountFlags::empty())?;
                    return Err(error).context(Bind {
                        source_path: &source,
                        target: &target,
                    });
                }
            }
            debug!(
                source = %source.display(),
                path = %target.display(),
                readonly,
                "Bind mounted"
            );
            Ok(())
        })
        .await
        .context(Task)?
    }

    async fn unbind(&self, target: &Path) -> Result<(), MountError> {
        let flags = match self.mount_state(target).await? {
            MountState::NotMounted => return Ok(()),
            MountState::Mounted => UnmountFlags::empty(),
            MountState::Stale => UnmountFlags::DETACH,
        };
        let target = target.to_path_buf();
        spawn_blocking(move || unmount_blocking(&target, flags))
            .await
            .context(Task)?
    }

    async fn force_unmount(&self, target: &Path) -> Result<(), MountError> {
        let target = target.to_path_buf();
        spawn_blocking(move || unmount_blocking(&target, UnmountFlags::DETACH))
            .await
            .context(Task)?
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a mount table entry.
    pub(crate) fn entry(device: &str, source: &str, root: &str, dest: &str) -> MountInfo {
        MountInfo {
            device: device.to_string(),
            root: PathBuf::from(root),
            dest: PathBuf::from(dest),
            fstype: "fuse.cubefs".to_string(),
            source: source.to_string(),
            options: vec!["rw".to_string(), "relatime".to_string()],
        }
    }

    const MOUNTINFO_SAMPLE: &str = "\
22 1 259:2 / / rw,relatime shared:1 - ext4 /dev/nvme0n1p2 rw
1210 22 0:98 / /var/lib/kubelet/plugins/kubernetes.io/csi/pv/pvc-1/globalmount rw,nosuid,nodev,relatime shared:600 - fuse.cubefs cubefs-vol1 rw,user_id=0,group_id=0
1320 22 0:98 / /var/lib/kubelet/pods/4054c1bb/volumes/kubernetes.io~csi/pvc-1/mount rw,nosuid,nodev,relatime shared:600 - fuse.cubefs cubefs-vol1 rw,user_id=0,group_id=0
1330 22 0:98 /data /var/lib/kubelet/pods/4054c1bb/volume-subpaths/vol/app/0 ro,nosuid,nodev,relatime shared:600 - fuse.cubefs cubefs-vol1 rw,user_id=0,group_id=0
1400 22 0:99 / /mnt/with\\040space rw master:3 master:4 - tmpfs tmpfs rw
garbage line
";

    #[test]
    fn parses_mountinfo() {
        let table = parse_mountinfo(MOUNTINFO_SAMPLE);
        assert_eq!(table.len(), 5);
        let global = &table[1];
        assert_eq!(global.device, "0:98");
        assert_eq!(global.source, "cubefs-vol1");
        assert_eq!(global.fstype, "fuse.cubefs");
        assert_eq!(global.root, PathBuf::from("/"));
        assert!(!global.readonly());
        assert!(table[3].readonly());
        assert_eq!(table[4].dest, PathBuf::from("/mnt/with space"));
        assert_eq!(table[4].source, "tmpfs");
    }

    #[test]
    fn unescapes_octal() {
        assert_eq!(unescape("a\\040b\\011c"), "a b\tc");
        assert_eq!(unescape("plain"), "plain");
        assert_eq!(unescape("trailing\\04"), "trailing\\04");
    }

    #[test]
    fn bind_state_of_global_and_sub_path() {
        let table = parse_mountinfo(MOUNTINFO_SAMPLE);
        let global = Path::new("/var/lib/kubelet/plugins/kubernetes.io/csi/pv/pvc-1/globalmount");
        let pod = Path::new("/var/lib/kubelet/pods/4054c1bb/volumes/kubernetes.io~csi/pvc-1/mount");
        let sub = Path::new("/var/lib/kubelet/pods/4054c1bb/volume-subpaths/vol/app/0");

        assert_eq!(
            bind_state(&table, global, pod),
            BindState::Bound { readonly: false }
        );
        assert_eq!(
            bind_state(&table, &global.join("data"), sub),
            BindState::Bound { readonly: true }
        );
        // the sub-path target shows /data, not the root of the volume
        assert!(matches!(
            bind_state(&table, global, sub),
            BindState::Foreign { .. }
        ));
        assert_eq!(
            bind_state(&table, global, Path::new("/var/lib/kubelet/pods/x/mount")),
            BindState::Unbound
        );
        // a tmpfs mounted over the target is not our bind
        assert!(matches!(
            bind_state(&table, global, Path::new("/mnt/with space")),
            BindState::Foreign { .. }
        ));
    }

    #[test]
    fn stale_errnos() {
        assert!(is_stale_errno(Errno::ENOTCONN));
        assert!(is_stale_errno(Errno::ESTALE));
        assert!(!is_stale_errno(Errno::ENOENT));
        assert!(!is_stale_errno(Errno::EPERM));
    }

    #[tokio::test]
    async fn unmounted_paths() {
        let dir = tempfile::tempdir().unwrap();
        let mounter = SysMounter::new(Duration::from_secs(2));
        let missing = dir.path().join("missing");
        assert_eq!(
            mounter.mount_state(&missing).await.unwrap(),
            MountState::NotMounted
        );
        assert_eq!(
            mounter.mount_state(dir.path()).await.unwrap(),
            MountState::NotMounted
        );
        // unbinding something which isn't mounted is a success
        mounter.unbind(dir.path()).await.unwrap();
        mounter.unbind(&missing).await.unwrap();
    }

    #[tokio::test]
    async fn detaching_unmounted_paths() {
        let dir = tempfile::tempdir().unwrap();
        let mounter = SysMounter::new(Duration::from_secs(2));
        mounter.force_unmount(dir.path()).await.unwrap();
        mounter
            .force_unmount(&dir.path().join("missing"))
            .await
            .unwrap();
        assert!(dir.path().is_dir());
    }
}
