//! CubeFS CSI controller plugin.
//!
//! Creates, deletes and expands volumes through the admin API of the storage cluster's
//! masters.

/// Log the message at error level and turn it into a `tonic::Status`.
macro_rules! failure {
    (Code::$code:ident, $msg:literal) => {{ tracing::error!($msg); tonic::Status::new(tonic::Code::$code, $msg) }};
    (Code::$code:ident, $fmt:literal $(,$args:expr)+) => {{ let message = format!($fmt $(,$args)+); tracing::error!("{}", message); tonic::Status::new(tonic::Code::$code, message) }};
    ($code:expr; $fmt:literal $(,$args:expr)+) => {{ let message = format!($fmt $(,$args)+); tracing::error!("{}", message); tonic::Status::new($code, message) }};
}

mod client;
mod config;
mod controller;
mod pvstore;

use client::MasterClient;
use config::ControllerConfig;
use controller::CsiControllerSvc;
use pvstore::KubePvStore;

use anyhow::Context;
use clap::Arg;
use csi_driver::{
    csi::{controller_server::ControllerServer, identity_server::IdentityServer},
    identity::Identity,
    shutdown::Shutdown,
};
use std::sync::Arc;
use tonic::transport::Server;
use tracing::{error, info};

/// The command line of the controller plugin.
pub(crate) fn cli() -> clap::Command {
    clap::Command::new(utils::package_description!())
        .about("k8s CSI controller plugin for CubeFS")
        .version(utils::version_info_str!())
        .arg(
            Arg::new("csi-endpoint")
                .short('c')
                .long("csi-endpoint")
                .env("CSI_ENDPOINT")
                .value_name("ENDPOINT")
                .default_value(utils::DEFAULT_CSI_ENDPOINT)
                .help("CSI gRPC listen endpoint, unix:///path or a bare socket path"),
        )
        .arg(
            Arg::new("driver-name")
                .long("driver-name")
                .value_name("NAME")
                .default_value(csi_driver::csi_plugin_name())
                .help("CSI driver name, as registered with the external provisioner"),
        )
        .arg(
            Arg::new("admin-timeout")
                .short('t')
                .long("admin-timeout")
                .env("ADMIN_TIMEOUT")
                .value_name("DURATION")
                .default_value(utils::DEFAULT_ADMIN_TIMEOUT)
                .help("Timeout of each request to the master admin API"),
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

#[tokio::main(worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();

    utils::print_package_info!();

    let config = ControllerConfig::try_from(&matches)?;
    utils::tracing_telemetry::init_tracing("csi-controller", config.log_format);

    let admin = MasterClient::new(config.admin_timeout)
        .context("Failed to initialize the admin API client")?;
    let pvs = KubePvStore::new(&config.driver_name)
        .await
        .context("Failed to initialize the k8s API client")?;
    info!(
        driver = %config.driver_name,
        endpoint = %config.csi_endpoint,
        "Starting the controller plugin"
    );

    let incoming = csi_driver::uds::incoming(&config.csi_endpoint)?;
    Server::builder()
        .add_service(ControllerServer::new(CsiControllerSvc::new(
            Arc::new(admin),
            Arc::new(pvs),
        )))
        .add_service(IdentityServer::new(Identity::new(&config.driver_name)))
        .serve_with_incoming_shutdown(incoming, Shutdown::wait())
        .await
        .map_err(|error| {
            error!(%error, "CsiServer failed");
            error.into()
        })
}
