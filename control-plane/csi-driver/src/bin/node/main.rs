//! CubeFS CSI node plugin.
//!
//! Stages volumes by starting the filesystem client on the global mount path, publishes
//! them into pods with bind mounts, and repairs the mounts left broken when the plugin
//! (and with it every client) restarts.

/// Log the message at error level and turn it into a `tonic::Status`.
macro_rules! failure {
    (Code::$code:ident, $msg:literal) => {{ tracing::error!($msg); tonic::Status::new(tonic::Code::$code, $msg) }};
    (Code::$code:ident, $fmt:literal $(,$args:expr)+) => {{ let message = format!($fmt $(,$args)+); tracing::error!("{}", message); tonic::Status::new(tonic::Code::$code, message) }};
    ($code:expr; $fmt:literal $(,$args:expr)+) => {{ let message = format!($fmt $(,$args)+); tracing::error!("{}", message); tonic::Status::new($code, message) }};
}

/// Configuration Parameters.
#[cfg(target_os = "linux")]
pub(crate) mod config;
#[cfg(target_os = "linux")]
mod error;
/// Orchestrator view of the attached volumes.
#[cfg(target_os = "linux")]
mod k8s;
#[cfg(target_os = "linux")]
mod launcher;
#[cfg(target_os = "linux")]
mod lifecycle;
#[cfg(target_os = "linux")]
mod main_;
#[cfg(target_os = "linux")]
mod mount;
#[cfg(target_os = "linux")]
mod mountpoint;
#[cfg(target_os = "linux")]
mod node;
#[cfg(target_os = "linux")]
mod probe;
/// Damaged mount recovery.
#[cfg(target_os = "linux")]
mod recovery;
#[cfg(all(test, target_os = "linux"))]
mod testing;

#[tokio::main]
#[cfg(target_os = "linux")]
async fn main() -> anyhow::Result<()> {
    main_::main().await.map_err(|error| {
        tracing::error!(%error, "Terminated with error");
        error
    })
}

#[tokio::main]
#[cfg(not(target_os = "linux"))]
async fn main() -> anyhow::Result<()> {
    Ok(())
}
