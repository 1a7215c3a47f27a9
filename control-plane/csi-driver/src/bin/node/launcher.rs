//! Starts the filesystem client which backs a global mount.
//!
//! The client is configured through a json file, regenerated on every launch, and is
//! expected to either daemonize or keep running in the foreground once the mount is up.
use crate::{
    config::ClientConfig,
    error::{Exited, LaunchError, Mount, NotMounted, Serialize as SerializeCtx, Spawn, WriteConfig},
    mount::Mounter,
    probe::{probe, MountHealth},
};
use csi_driver::VolumeParams;
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};
use tokio::{process::Child, time::Instant};
use tracing::{debug, info, warn};

const MOUNT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// File under the volume's log directory which receives the client's console output.
const CLIENT_OUTPUT: &str = "client.out";

/// Brings up the filesystem client of a volume on a mount path.
#[tonic::async_trait]
pub(crate) trait ClientLauncher: Send + Sync + 'static {
    /// Configure and start the client, returning once `mount_path` is a healthy mount.
    /// On failure nothing is left mounted on `mount_path`.
    /// Must not be called concurrently for the same volume.
    async fn ensure_mounted(
        &self,
        volume_id: &str,
        params: &VolumeParams,
        mount_path: &Path,
    ) -> Result<(), LaunchError>;
    /// Remove whatever was persisted for the volume by previous launches.
    async fn release(&self, volume_id: &str);
}

mod port_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(port: &u16, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&port.to_string())
    }
    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
        String::deserialize(deserializer)?
            .parse()
            .map_err(serde::de::Error::custom)
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// The configuration file handed to the client.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ClientProcessConfig {
    pub(crate) master_addr: String,
    pub(crate) vol_name: String,
    pub(crate) owner: String,
    pub(crate) mount_point: PathBuf,
    pub(crate) log_dir: PathBuf,
    pub(crate) log_level: String,
    #[serde(with = "port_string")]
    pub(crate) exporter_port: u16,
    #[serde(with = "port_string")]
    pub(crate) prof_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) consul_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) access_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) secret_key: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub(crate) enable_posix_acl: bool,
    #[serde(default, rename = "rdonly", skip_serializing_if = "is_false")]
    pub(crate) read_only: bool,
}

/// Best-effort free local port: bind an ephemeral port and release it again.
/// Nothing stops someone else from taking it before the client does.
fn free_port(fallback: u16) -> u16 {
    match std::net::TcpListener::bind(("127.0.0.1", 0)).and_then(|listener| listener.local_addr()) {
        Ok(addr) => addr.port(),
        Err(error) => {
            warn!(%error, fallback, "Failed to find a free port");
            fallback
        }
    }
}

impl ClientProcessConfig {
    /// Generate the client configuration of a volume mounted on `mount_path`.
    pub(crate) fn new(
        volume_id: &str,
        params: &VolumeParams,
        mount_path: &Path,
        client: &ClientConfig,
    ) -> Self {
        Self {
            master_addr: params.master_addr(),
            vol_name: params.vol_name.clone(),
            owner: params.owner.clone(),
            mount_point: mount_path.to_path_buf(),
            log_dir: client.log_dir(volume_id),
            log_level: params.log_level.clone(),
            exporter_port: free_port(utils::DEFAULT_EXPORTER_PORT),
            prof_port: free_port(utils::DEFAULT_PROF_PORT),
            consul_addr: params.consul_addr.clone(),
            access_key: params.access_key.clone(),
            secret_key: params.secret_key.clone(),
            enable_posix_acl: params.enable_posix_acl,
            read_only: params.read_only,
        }
    }

    /// Write the configuration to `path`, creating the config and log directories.
    pub(crate) async fn persist(&self, path: &Path) -> Result<(), LaunchError> {
        let content = serde_json::to_vec_pretty(self).context(SerializeCtx)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context(WriteConfig { path: parent })?;
        }
        tokio::fs::create_dir_all(&self.log_dir)
            .await
            .context(WriteConfig {
                path: &self.log_dir,
            })?;

        let staged = path.with_extension("json.tmp");
        tokio::fs::write(&staged, content)
            .await
            .context(WriteConfig { path: &staged })?;
        // it holds the volume's secret key
        tokio::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o600))
            .await
            .context(WriteConfig { path: &staged })?;
        tokio::fs::rename(&staged, path)
            .await
            .context(WriteConfig { path })
    }
}

/// Kills the client, detaches the mount path and removes the config if a launch is
/// abandoned half way, eg because the request future was dropped.
struct LaunchGuard {
    mount_path: PathBuf,
    conf_file: PathBuf,
    client: Option<u32>,
    armed: bool,
}

impl LaunchGuard {
    fn new(mount_path: &Path, conf_file: &Path) -> Self {
        Self {
            mount_path: mount_path.to_path_buf(),
            conf_file: conf_file.to_path_buf(),
            client: None,
            armed: true,
        }
    }
    fn track(&mut self, client: &Child) {
        self.client = client.id();
    }
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for LaunchGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(path = %self.mount_path.display(), "Cleaning up abandoned client launch");
        if let Some(pid) = self.client.and_then(|pid| i32::try_from(pid).ok()) {
            if let Err(error) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
                debug!(%error, pid, "Client already gone");
            }
        }
        if let Err(error) = sys_mount::unmount(&self.mount_path, sys_mount::UnmountFlags::DETACH) {
            debug!(%error, "Nothing to detach");
        }
        let _ = std::fs::remove_file(&self.conf_file);
    }
}

/// Kill the client if it's still running, so it can't mount after its launch failed.
async fn kill_client(child: &mut Child, mount_path: &Path) {
    match child.try_wait() {
        Ok(Some(_)) => {}
        Ok(None) | Err(_) => {
            warn!(path = %mount_path.display(), pid = child.id(), "Killing client of a failed launch");
            if let Err(error) = child.kill().await {
                warn!(%error, "Failed to kill the client");
            }
        }
    }
}

/// Launches the filesystem client binary.
pub(crate) struct CfsLauncher<M> {
    config: ClientConfig,
    mounter: Arc<M>,
}

impl<M: Mounter> CfsLauncher<M> {
    pub(crate) fn new(config: ClientConfig, mounter: Arc<M>) -> Self {
        Self { config, mounter }
    }

    /// Start the client with its output appended to the volume's client log.
    fn spawn_client(&self, conf_file: &Path, log: &Path) -> Result<Child, LaunchError> {
        let binary = &self.config.binary;
        let stdout = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log)
            .context(WriteConfig { path: log })?;
        let stderr = stdout.try_clone().context(WriteConfig { path: log })?;

        tokio::process::Command::new(binary)
            .arg("-c")
            .arg(conf_file)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .context(Spawn { binary })
    }

    /// Wait for the client to either detach or keep running past the grace period,
    /// and then for its mount to come up.
    async fn wait_client(
        &self,
        child: &mut Child,
        mount_path: &Path,
        log: &Path,
    ) -> Result<(), LaunchError> {
        let grace = self.config.grace_period;
        let deadline = Instant::now() + grace;
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) if !status.success() => {
                return Exited {
                    status,
                    mount_path,
                    log,
                }
                .fail()
            }
            Ok(Ok(_)) => debug!(path = %mount_path.display(), "Client daemonized"),
            Ok(Err(error)) => {
                return Err(error).context(Spawn {
                    binary: &self.config.binary,
                })
            }
            Err(_) => debug!(
                path = %mount_path.display(),
                "Client still running after the grace period"
            ),
        }
        self.wait_mounted(mount_path, deadline).await
    }

    /// Poll the mount path until it's healthy, giving up at `deadline`.
    async fn wait_mounted(&self, mount_path: &Path, deadline: Instant) -> Result<(), LaunchError> {
        loop {
            let health = probe(self.mounter.as_ref(), mount_path)
                .await
                .context(Mount)?;
            if health == MountHealth::Healthy {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return NotMounted {
                    mount_path,
                    grace: self.config.grace_period,
                }
                .fail();
            }
            tokio::time::sleep(MOUNT_POLL_INTERVAL).await;
        }
    }
}

#[tonic::async_trait]
impl<M: Mounter> ClientLauncher for CfsLauncher<M> {
    async fn ensure_mounted(
        &self,
        volume_id: &str,
        params: &VolumeParams,
        mount_path: &Path,
    ) -> Result<(), LaunchError> {
        let conf_file = self.config.conf_file(volume_id);
        let mut guard = LaunchGuard::new(mount_path, &conf_file);

        let conf = ClientProcessConfig::new(volume_id, params, mount_path, &self.config);
        let log = conf.log_dir.join(CLIENT_OUTPUT);
        let mut client = None;
        let result = match conf.persist(&conf_file).await {
            Ok(()) => match self.spawn_client(&conf_file, &log) {
                Ok(child) => {
                    guard.track(&child);
                    let child = client.insert(child);
                    self.wait_client(child, mount_path, &log).await
                }
                Err(error) => Err(error),
            },
            Err(error) => Err(error),
        };

        match result {
            Ok(()) => {
                guard.disarm();
                info!(
                    volume.id = volume_id,
                    volume.name = %conf.vol_name,
                    path = %mount_path.display(),
                    "Client mount established"
                );
                Ok(())
            }
            Err(error) => {
                if let Some(child) = client.as_mut() {
                    kill_client(child, mount_path).await;
                }
                guard.disarm();
                if let Err(unmount) = self.mounter.force_unmount(mount_path).await {
                    warn!(%unmount, "Failed to clean up after a failed client launch");
                }
                self.release(volume_id).await;
                Err(error)
            }
        }
    }

    async fn release(&self, volume_id: &str) {
        let conf_file = self.config.conf_file(volume_id);
        match tokio::fs::remove_file(&conf_file).await {
            Ok(()) => debug!(path = %conf_file.display(), "Removed client config"),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => warn!(%error, path = %conf_file.display(), "Failed to remove client config"),
        }
    }
}
