/// Product name, used as a prefix for logging and resource naming.
pub const PRODUCT_NAME: &str = "cubefs";

/// Domain name of the product, used for CSI driver naming and topology keys.
pub const PRODUCT_DOMAIN_NAME: &str = "cubefs.com";

/// Default CSI driver name, registered with the kubelet and matched against the
/// attacher of volume attachments.
pub fn csi_plugin_name() -> String {
    format!("csi.{PRODUCT_DOMAIN_NAME}")
}

/// The default CSI endpoint, served over a unix domain socket.
pub const DEFAULT_CSI_ENDPOINT: &str = "unix:///csi/csi.sock";

/// Default kubelet root directory.
pub const DEFAULT_KUBELET_ROOT_DIR: &str = "/var/lib/kubelet";

/// Default location of the filesystem client binary inside the node container.
pub const DEFAULT_CLIENT_BIN: &str = "/cfs/bin/cfs-client";

/// Default directory where per-volume client configuration files are written.
pub const DEFAULT_CLIENT_CONF_DIR: &str = "/cfs/conf";

/// Default directory under which per-volume client log directories are created.
pub const DEFAULT_CLIENT_LOGS_DIR: &str = "/cfs/logs";

/// Fallback exporter port handed to the client when no free port could be found.
pub const DEFAULT_EXPORTER_PORT: u16 = 9513;

/// Fallback profiling port handed to the client when no free port could be found.
pub const DEFAULT_PROF_PORT: u16 = 10094;

/// How long the launcher waits for the client to establish its mount.
pub const DEFAULT_MOUNT_GRACE_PERIOD: &str = "5s";

/// Upper bound on a single mount-health probe.
pub const DEFAULT_PROBE_TIMEOUT: &str = "2s";

/// Number of client launch attempts made per volume during recovery.
pub const DEFAULT_REMOUNT_RETRIES: &str = "3";

/// Timeout for requests to the storage cluster's admin API.
pub const DEFAULT_ADMIN_TIMEOUT: &str = "30s";
