//! CubeFS CSI node plugin.
//!
//! Implementation of the CSI node gRPC methods, plus the damaged mount
//! recovery which runs alongside them.

use crate::{
    config::NodeConfig,
    k8s::KubeInventory,
    launcher::CfsLauncher,
    lifecycle::{MountLifecycle, MountLock},
    mount::SysMounter,
    node::Node,
    recovery::Remounter,
};
use anyhow::Context;
use clap::{Arg, ArgAction};
use csi_driver::{
    csi::{identity_server::IdentityServer, node_server::NodeServer},
    identity::Identity,
    shutdown::Shutdown,
};
use std::sync::Arc;
use tonic::transport::Server;
use tracing::{error, info, warn};

/// The command line of the node plugin.
pub(crate) fn cli() -> clap::Command {
    clap::Command::new(utils::package_description!())
        .about("k8s CSI node plugin for CubeFS")
        .version(utils::version_info_str!())
        .arg(
            Arg::new("node-name")
                .short('n')
                .long("node-name")
                .env("NODE_NAME")
                .value_name("NAME")
                .help("Unique node name where this instance runs")
                .required(true),
        )
        .arg(
            Arg::new("csi-endpoint")
                .short('c')
                .long("csi-endpoint")
                .value_name("ENDPOINT")
                .default_value(utils::DEFAULT_CSI_ENDPOINT)
                .help("CSI gRPC listen endpoint, unix:///path or a bare socket path"),
        )
        .arg(
            Arg::new("driver-name")
                .long("driver-name")
                .value_name("NAME")
                .default_value(csi_driver::csi_plugin_name())
                .help("CSI driver name, as registered with the kubelet"),
        )
        .arg(
            Arg::new("kubelet-root-dir")
                .long("kubelet-root-dir")
                .value_name("PATH")
                .default_value(utils::DEFAULT_KUBELET_ROOT_DIR)
                .help("Root directory of the kubelet, where pod and staging mounts live"),
        )
        .arg(
            Arg::new("client-bin")
                .long("client-bin")
                .value_name("PATH")
                .default_value(utils::DEFAULT_CLIENT_BIN)
                .help("The filesystem client binary"),
        )
        .arg(
            Arg::new("conf-dir")
                .long("conf-dir")
                .value_name("PATH")
                .default_value(utils::DEFAULT_CLIENT_CONF_DIR)
                .help("Directory for the per-volume client configuration files"),
        )
        .arg(
            Arg::new("logs-dir")
                .long("logs-dir")
                .value_name("PATH")
                .default_value(utils::DEFAULT_CLIENT_LOGS_DIR)
                .help("Directory for the per-volume client logs"),
        )
        .arg(
            Arg::new("mount-grace-period")
                .long("mount-grace-period")
                .value_name("DURATION")
                .default_value(utils::DEFAULT_MOUNT_GRACE_PERIOD)
                .help("How long a client gets to establish its mount"),
        )
        .arg(
            Arg::new("probe-timeout")
                .long("probe-timeout")
                .value_name("DURATION")
                .default_value(utils::DEFAULT_PROBE_TIMEOUT)
                .help("Timeout of a single mount health probe"),
        )
        .arg(
            Arg::new("remount-damaged")
                .long("remount-damaged")
                .action(ArgAction::SetTrue)
                .help("Repair the mounts broken by a restart of the plugin"),
        )
        .arg(
            Arg::new("remount-interval")
                .long("remount-interval")
                .value_name("DURATION")
                .requires("remount-damaged")
                .help("Repeat the damaged mount recovery on this period"),
        )
        .arg(
            Arg::new("remount-retries")
                .long("remount-retries")
                .value_name("NUMBER")
                .default_value(utils::DEFAULT_REMOUNT_RETRIES)
                .help("Client launch attempts per volume during recovery"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .default_value("pretty")
                .value_parser(["compact", "pretty", "json"])
                .help("Formatting style of the logs"),
        )
}

pub(super) async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();

    utils::print_package_info!();

    let config = NodeConfig::try_from(&matches)?;
    utils::tracing_telemetry::init_tracing("csi-node", config.log_format);

    let client_bin = which::which(&config.client.binary).with_context(|| {
        format!(
            "Filesystem client {} not found",
            config.client.binary.display()
        )
    })?;
    info!(client = %client_bin.display(), node = config.node_name, "Starting the node plugin");

    let lock = MountLock::default();
    let mounter = Arc::new(SysMounter::new(config.probe_timeout));
    let mut client = config.client.clone();
    client.binary = client_bin;
    let launcher = Arc::new(CfsLauncher::new(client, mounter.clone()));
    let lifecycle = MountLifecycle::new(mounter.clone(), launcher.clone(), lock.clone());

    if config.remount.enabled {
        match KubeInventory::new(&config.node_name, &config.driver_name).await {
            Ok(inventory) => {
                let remounter = Remounter::new(
                    Arc::new(inventory),
                    mounter,
                    launcher,
                    lock,
                    config.kubelet.clone(),
                    config.remount.retries,
                );
                tokio::spawn(remounter.run(config.remount.interval, Shutdown::wait()));
            }
            Err(error) => {
                warn!(%error, "Damaged mount recovery is disabled, the k8s api is not reachable")
            }
        }
    }

    let incoming = csi_driver::uds::incoming(&config.csi_endpoint)?;
    Server::builder()
        .add_service(NodeServer::new(Node::new(config.node_name.clone(), lifecycle)))
        .add_service(IdentityServer::new(Identity::new(&config.driver_name)))
        .serve_with_incoming_shutdown(incoming, Shutdown::wait())
        .await
        .map_err(|error| {
            error!(%error, "CsiServer failed");
            error.into()
        })
}
