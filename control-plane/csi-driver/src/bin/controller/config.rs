use clap::ArgMatches;
use std::{str::FromStr, time::Duration};
use utils::tracing_telemetry::FmtStyle;

/// Controller plugin configuration, built once from the command line.
#[derive(Debug, Clone)]
pub(crate) struct ControllerConfig {
    pub(crate) csi_endpoint: String,
    pub(crate) driver_name: String,
    /// Timeout of each request to the master admin API.
    pub(crate) admin_timeout: Duration,
    pub(crate) log_format: FmtStyle,
}

fn required<'a>(matches: &'a ArgMatches, name: &str) -> anyhow::Result<&'a String> {
    matches
        .get_one::<String>(name)
        .ok_or_else(|| anyhow::anyhow!("Missing required argument --{name}"))
}

impl TryFrom<&ArgMatches> for ControllerConfig {
    type Error = anyhow::Error;

    fn try_from(matches: &ArgMatches) -> Result<Self, Self::Error> {
        let admin_timeout = humantime::Duration::from_str(required(matches, "admin-timeout")?)
            .map_err(|error| anyhow::anyhow!("Invalid value for --admin-timeout: {error}"))?;
        let log_format = FmtStyle::from_str(required(matches, "log-format")?)
            .map_err(|error| anyhow::anyhow!("Invalid value for --log-format: {error}"))?;

        Ok(Self {
            csi_endpoint: required(matches, "csi-endpoint")?.clone(),
            driver_name: required(matches, "driver-name")?.clone(),
            admin_timeout: admin_timeout.into(),
            log_format,
        })
    }
}
