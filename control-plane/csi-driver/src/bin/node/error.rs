//! Errors of the node mount engine and their mapping onto gRPC status codes.
use csi_driver::ParameterError;
use snafu::Snafu;
use std::path::PathBuf;

/// Bind manager and prober failures.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub(crate) enum MountError {
    #[snafu(display("Failed to read the mount table: {source}"))]
    MountTable { source: std::io::Error },
    #[snafu(display("Failed to create directory {}: {source}", path.display()))]
    CreateDir {
        source: std::io::Error,
        path: PathBuf,
    },
    #[snafu(display("Failed to stat {}: {source}", path.display()))]
    Stat {
        source: std::io::Error,
        path: PathBuf,
    },
    #[snafu(display(
        "Failed to bind mount {} onto {}: {source}",
        source_path.display(),
        target.display()
    ))]
    Bind {
        source: std::io::Error,
        source_path: PathBuf,
        target: PathBuf,
    },
    #[snafu(display(
        "Target {} is already mounted from '{existing}', refusing to bind {} over it",
        target.display(),
        source_path.display()
    ))]
    BindConflict {
        source_path: PathBuf,
        target: PathBuf,
        existing: String,
    },
    #[snafu(display("Target {} has a stale mount", target.display()))]
    StaleTarget { target: PathBuf },
    #[snafu(display("Failed to unmount {}: {source}", target.display()))]
    Unmount {
        source: std::io::Error,
        target: PathBuf,
    },
    #[snafu(display("Mount task failed: {source}"))]
    Task { source: tokio::task::JoinError },
}

impl From<MountError> for tonic::Status {
    fn from(error: MountError) -> Self {
        match error {
            MountError::BindConflict { .. } => tonic::Status::already_exists(error.to_string()),
            _ => tonic::Status::internal(error.to_string()),
        }
    }
}

/// Failures to bring up the filesystem client for a volume.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub(crate) enum LaunchError {
    #[snafu(display("Failed to serialize client config: {source}"))]
    Serialize { source: serde_json::Error },
    #[snafu(display("Failed to write client config {}: {source}", path.display()))]
    WriteConfig {
        source: std::io::Error,
        path: PathBuf,
    },
    #[snafu(display("Failed to start client {}: {source}", binary.display()))]
    Spawn {
        source: std::io::Error,
        binary: PathBuf,
    },
    #[snafu(display(
        "Client exited with {status} while mounting {}, see {}",
        mount_path.display(),
        log.display()
    ))]
    Exited {
        status: std::process::ExitStatus,
        mount_path: PathBuf,
        log: PathBuf,
    },
    #[snafu(display(
        "Client did not establish a healthy mount on {} within {:?}",
        mount_path.display(),
        grace
    ))]
    NotMounted {
        mount_path: PathBuf,
        grace: std::time::Duration,
    },
    #[snafu(display("Client started but the mount on {} is not healthy", mount_path.display()))]
    BrokenMount { mount_path: PathBuf },
    #[snafu(display("{source}"))]
    Mount { source: MountError },
}

impl From<LaunchError> for tonic::Status {
    fn from(error: LaunchError) -> Self {
        tonic::Status::internal(error.to_string())
    }
}

/// Orchestrator queries made by the recovery scanner.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub(crate) enum OrchestratorError {
    #[snafu(display("Failed to create the k8s client: {source}"))]
    Client { source: kube::Error },
    #[snafu(display("Failed to list {resource}: {source}"))]
    List {
        source: kube::Error,
        resource: &'static str,
    },
}

/// Why a volume could not be repaired.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub(crate) enum RecoveryError {
    #[snafu(display("Invalid volume context of {pv}: {source}"))]
    InvalidContext {
        source: ParameterError,
        pv: String,
    },
    #[snafu(display("Failed to unmount the global mount of {pv}: {source}"))]
    GlobalUnmount { source: MountError, pv: String },
    #[snafu(display("Client launch for {pv} failed after {attempts} attempts: {source}"))]
    Launch {
        source: LaunchError,
        pv: String,
        attempts: u32,
    },
    #[snafu(display("Recovery task for {pv} aborted: {source}"))]
    Aborted {
        source: tokio::task::JoinError,
        pv: String,
    },
}
