use crate::mountpoint::KubeletPaths;
use clap::ArgMatches;
use std::{path::PathBuf, str::FromStr, time::Duration};
use utils::tracing_telemetry::FmtStyle;

/// Node plugin configuration, built once from the command line.
#[derive(Debug, Clone)]
pub(crate) struct NodeConfig {
    /// Name of the k8s node this instance runs on, reported as the CSI node id.
    pub(crate) node_name: String,
    pub(crate) driver_name: String,
    pub(crate) csi_endpoint: String,
    pub(crate) kubelet: KubeletPaths,
    pub(crate) client: ClientConfig,
    pub(crate) probe_timeout: Duration,
    pub(crate) remount: RemountConfig,
    pub(crate) log_format: FmtStyle,
}

/// Where the filesystem client lives and where its inputs and logs go.
#[derive(Debug, Clone)]
pub(crate) struct ClientConfig {
    pub(crate) binary: PathBuf,
    pub(crate) conf_dir: PathBuf,
    pub(crate) logs_dir: PathBuf,
    /// How long a freshly started client gets to establish its mount.
    pub(crate) grace_period: Duration,
}

impl ClientConfig {
    /// The configuration file of the given volume.
    pub(crate) fn conf_file(&self, volume_id: &str) -> PathBuf {
        self.conf_dir.join(format!("{volume_id}.json"))
    }
    /// The log directory of the given volume.
    pub(crate) fn log_dir(&self, volume_id: &str) -> PathBuf {
        self.logs_dir.join(volume_id)
    }
}

/// Damaged mount recovery settings.
#[derive(Debug, Clone)]
pub(crate) struct RemountConfig {
    /// Run the recovery pass at all.
    pub(crate) enabled: bool,
    /// Repeat the pass on this period, after the startup pass.
    pub(crate) interval: Option<Duration>,
    /// Client launch attempts per volume.
    pub(crate) retries: u32,
}

fn duration(matches: &ArgMatches, name: &str) -> anyhow::Result<Option<Duration>> {
    matches
        .get_one::<String>(name)
        .map(|value| {
            humantime::Duration::from_str(value)
                .map(Into::into)
                .map_err(|error| anyhow::anyhow!("Invalid value for --{name}: {error}"))
        })
        .transpose()
}

fn required<'a>(matches: &'a ArgMatches, name: &str) -> anyhow::Result<&'a String> {
    matches
        .get_one::<String>(name)
        .ok_or_else(|| anyhow::anyhow!("Missing required argument --{name}"))
}

impl TryFrom<&ArgMatches> for NodeConfig {
    type Error = anyhow::Error;

    fn try_from(matches: &ArgMatches) -> Result<Self, Self::Error> {
        let node_name = required(matches, "node-name")?.clone();
        anyhow::ensure!(!node_name.is_empty(), "--node-name must not be empty");

        let grace_period = duration(matches, "mount-grace-period")?
            .ok_or_else(|| anyhow::anyhow!("Missing --mount-grace-period"))?;
        let probe_timeout = duration(matches, "probe-timeout")?
            .ok_or_else(|| anyhow::anyhow!("Missing --probe-timeout"))?;
        let retries = required(matches, "remount-retries")?
            .parse::<u32>()
            .map_err(|error| anyhow::anyhow!("Invalid value for --remount-retries: {error}"))?;
        let log_format = FmtStyle::from_str(required(matches, "log-format")?)
            .map_err(|error| anyhow::anyhow!("Invalid value for --log-format: {error}"))?;

        Ok(Self {
            node_name,
            driver_name: required(matches, "driver-name")?.clone(),
            csi_endpoint: required(matches, "csi-endpoint")?.clone(),
            kubelet: KubeletPaths::new(required(matches, "kubelet-root-dir")?),
            client: ClientConfig {
                binary: PathBuf::from(required(matches, "client-bin")?),
                conf_dir: PathBuf::from(required(matches, "conf-dir")?),
                logs_dir: PathBuf::from(required(matches, "logs-dir")?),
                grace_period,
            },
            probe_timeout,
            remount: RemountConfig {
                enabled: matches.get_flag("remount-damaged"),
                interval: duration(matches, "remount-interval")?,
                retries: retries.max(1),
            },
            log_format,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_cli() {
        let matches = crate::main_::cli()
            .try_get_matches_from(["csi-node", "--node-name", "worker-1"])
            .unwrap();
        let config = NodeConfig::try_from(&matches).unwrap();
        assert_eq!(config.node_name, "worker-1");
        assert_eq!(config.driver_name, "csi.cubefs.com");
        assert_eq!(config.csi_endpoint, "unix:///csi/csi.sock");
        assert_eq!(config.client.grace_period, Duration::from_secs(5));
        assert_eq!(config.probe_timeout, Duration::from_secs(2));
        assert!(!config.remount.enabled);
        assert_eq!(config.remount.interval, None);
        assert_eq!(config.remount.retries, 3);
        assert_eq!(
            config.client.conf_file("pvc-1"),
            PathBuf::from("/cfs/conf/pvc-1.json")
        );
        assert_eq!(config.client.log_dir("pvc-1"), PathBuf::from("/cfs/logs/pvc-1"));
    }

    #[test]
    fn remount_flags() {
        let matches = crate::main_::cli()
            .try_get_matches_from([
                "csi-node",
                "--node-name",
                "worker-1",
                "--remount-damaged",
                "--remount-interval",
                "1m",
                "--remount-retries",
                "0",
            ])
            .unwrap();
        let config = NodeConfig::try_from(&matches).unwrap();
        assert!(config.remount.enabled);
        assert_eq!(config.remount.interval, Some(Duration::from_secs(60)));
        assert_eq!(config.remount.retries, 1);

        let matches = crate::main_::cli()
            .try_get_matches_from(["csi-node", "--node-name", "n", "--probe-timeout", "soon"])
            .unwrap();
        assert!(NodeConfig::try_from(&matches).is_err());
    }
}
