use futures::{Stream, TryFutureExt};
use std::{fs, io::ErrorKind, os::unix::fs::PermissionsExt, path::PathBuf};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info};

/// Parse a CSI endpoint of the form `unix:///path/to/csi.sock` (or a bare path)
/// into the socket path.
pub fn socket_path(endpoint: &str) -> anyhow::Result<PathBuf> {
    if endpoint.starts_with('/') {
        return Ok(PathBuf::from(endpoint));
    }
    let url = url::Url::parse(endpoint)?;
    anyhow::ensure!(
        url.scheme() == "unix",
        "Unsupported CSI endpoint scheme '{}', expected unix://",
        url.scheme()
    );
    anyhow::ensure!(!url.path().is_empty(), "CSI endpoint has no socket path");
    Ok(PathBuf::from(url.path()))
}

/// Bind the CSI socket, removing a stale socket from a previous instance, and
/// return the stream of incoming connections.
pub fn incoming(
    endpoint: &str,
) -> anyhow::Result<impl Stream<Item = std::io::Result<UnixStream>>> {
    let csi_socket = socket_path(endpoint)?;

    match fs::remove_file(&csi_socket) {
        Ok(_) => info!("Removed stale CSI socket {}", csi_socket.display()),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => anyhow::bail!(
            "Error removing stale CSI socket {}: {}",
            csi_socket.display(),
            err
        ),
    }
    if let Some(parent) = csi_socket.parent() {
        fs::create_dir_all(parent)?;
    }

    let uds = UnixListener::bind(&csi_socket)?;
    info!("CSI plugin bound to {}", csi_socket.display());

    // Allow non-privileged clients to access the socket.
    if let Err(e) = fs::set_permissions(&csi_socket, fs::Permissions::from_mode(0o777)) {
        error!("Failed to change permissions for CSI socket: {:?}", e);
    } else {
        debug!("Successfully changed file permissions for CSI socket");
    }

    Ok(async_stream::stream! {
        loop {
            let item = uds.accept().map_ok(|(st, _)| st).await;
            yield item;
        }
    })
}
