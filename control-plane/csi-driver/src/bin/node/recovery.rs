//! Damaged mount recovery.
//!
//! When the node plugin restarts, the client processes backing the global mounts are gone
//! while the kernel still holds their mounts, and the bind mounts of every pod using them.
//! The recovery pass relaunches the client of each damaged volume which is still in use and
//! rebinds its consumers, one task per volume.
use crate::{
    error::{
        Aborted, CreateDir, GlobalUnmount, InvalidContext, Launch, LaunchError, Mount,
        OrchestratorError, RecoveryError,
    },
    k8s::{AttachedVolume, VolumeInventory},
    launcher::ClientLauncher,
    lifecycle::MountLock,
    mount::Mounter,
    mountpoint::{classify_mounts, KubeletPaths, MountPoint},
    probe::{probe, MountHealth},
};
use csi_driver::VolumeParams;
use futures::future::join_all;
use snafu::ResultExt;
use std::{
    collections::{BTreeMap, HashSet},
    future::Future,
    path::Path,
    sync::Arc,
    time::Duration,
};
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, error, info, warn};

/// What happened to a volume during a recovery pass.
#[derive(Debug)]
pub(crate) enum VolumeOutcome {
    /// Every mount of the volume was healthy, nothing was touched.
    Healthy,
    /// The client was relaunched.
    Repaired { binds: usize, failed_binds: usize },
    Failed(RecoveryError),
}

/// Summary of a recovery pass.
#[derive(Debug, Default)]
pub(crate) struct RecoveryReport {
    /// Outcome per persistent volume.
    pub(crate) outcomes: BTreeMap<String, VolumeOutcome>,
    /// Attached volumes with no running consumer.
    pub(crate) skipped: Vec<String>,
    pub(crate) inventory_error: Option<OrchestratorError>,
    pub(crate) elapsed: Duration,
}

impl RecoveryReport {
    pub(crate) fn repaired(&self) -> impl Iterator<Item = &str> {
        self.outcomes.iter().filter_map(|(pv, outcome)| {
            matches!(outcome, VolumeOutcome::Repaired { .. }).then_some(pv.as_str())
        })
    }
    pub(crate) fn failed(&self) -> impl Iterator<Item = (&str, &RecoveryError)> {
        self.outcomes.iter().filter_map(|(pv, outcome)| match outcome {
            VolumeOutcome::Failed(error) => Some((pv.as_str(), error)),
            _ => None,
        })
    }

    /// Log the report, one line per volume which needed work.
    pub(crate) fn log(&self) {
        if let Some(error) = &self.inventory_error {
            error!(%error, "Damaged mount recovery could not list the attached volumes");
            return;
        }
        for (pv, outcome) in &self.outcomes {
            match outcome {
                VolumeOutcome::Healthy => debug!(pv.name = %pv, "Volume is healthy"),
                VolumeOutcome::Repaired {
                    binds,
                    failed_binds,
                } => info!(pv.name = %pv, binds, failed_binds, "Volume repaired"),
                VolumeOutcome::Failed(error) => error!(pv.name = %pv, %error, "Volume not repaired"),
            }
        }
        info!(
            volumes = self.outcomes.len(),
            repaired = self.repaired().count(),
            failed = self.failed().count(),
            skipped = self.skipped.len(),
            elapsed = ?self.elapsed,
            "Damaged mount recovery finished"
        );
    }
}

/// Relaunches the clients of damaged volumes and restores their bind mounts.
pub(crate) struct Remounter<I, M, L> {
    inventory: Arc<I>,
    mounter: Arc<M>,
    launcher: Arc<L>,
    lock: MountLock,
    paths: KubeletPaths,
    retries: u32,
    retry_delay: Duration,
}

impl<I, M, L> Clone for Remounter<I, M, L> {
    fn clone(&self) -> Self {
        Self {
            inventory: self.inventory.clone(),
            mounter: self.mounter.clone(),
            launcher: self.launcher.clone(),
            lock: self.lock.clone(),
            paths: self.paths.clone(),
            retries: self.retries,
            retry_delay: self.retry_delay,
        }
    }
}

impl<I: VolumeInventory, M: Mounter, L: ClientLauncher> Remounter<I, M, L> {
    pub(crate) fn new(
        inventory: Arc<I>,
        mounter: Arc<M>,
        launcher: Arc<L>,
        lock: MountLock,
        paths: KubeletPaths,
        retries: u32,
    ) -> Self {
        Self {
            inventory,
            mounter,
            launcher,
            lock,
            paths,
            retries: retries.max(1),
            retry_delay: Duration::from_secs(1),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Run a recovery pass now, and then every `interval` until `stop` completes.
    pub(crate) async fn run(self, interval: Option<Duration>, stop: impl Future<Output = ()>) {
        tokio::pin!(stop);
        loop {
            tokio::select! {
                report = self.remount_damaged() => report.log(),
                _ = &mut stop => break,
            }
            let Some(interval) = interval else {
                break;
            };
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = &mut stop => break,
            }
        }
        debug!("Damaged mount recovery stopped");
    }

    /// Repair every damaged volume which has consumers on this node.
    /// Volumes are repaired concurrently and independently of each other.
    pub(crate) async fn remount_damaged(&self) -> RecoveryReport {
        let started = Instant::now();
        let mut report = RecoveryReport::default();

        let volumes = match self.inventory.attached_volumes().await {
            Ok(volumes) => volumes,
            Err(error) => {
                report.inventory_error = Some(error);
                report.elapsed = started.elapsed();
                return report;
            }
        };

        let mut tasks = RepairTasks::default();
        for volume in volumes {
            if volume.consumers.is_empty() {
                debug!(pv.name = volume.pv_name, "No consumers, skipping");
                report.skipped.push(volume.pv_name);
                continue;
            }
            let remounter = self.clone();
            let pv_name = volume.pv_name.clone();
            tasks.0.push((
                pv_name,
                tokio::spawn(async move { remounter.repair(&volume).await }),
            ));
        }

        let results = join_all(tasks.0.iter_mut().map(|(_, handle)| handle)).await;
        for ((pv_name, _), result) in tasks.0.iter().zip(results) {
            let outcome = match result.context(Aborted { pv: pv_name }) {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(error)) | Err(error) => VolumeOutcome::Failed(error),
            };
            report.outcomes.insert(pv_name.clone(), outcome);
        }
        report.elapsed = started.elapsed();
        report
    }

    /// Check every mount of the volume and repair the damaged ones.
    /// The client is only relaunched when the global mount itself is damaged, in which
    /// case every consumer is rebound onto the new mount.
    pub(crate) async fn repair(&self, volume: &AttachedVolume) -> Result<VolumeOutcome, RecoveryError> {
        let pv = volume.pv_name.as_str();
        let params = VolumeParams::parse(&volume.volume_id, &volume.attributes)
            .context(InvalidContext { pv })?;

        let _guard = self.lock.exclusive().await;

        let global = self.paths.global_mount(pv);
        let recorded = self.recorded_mounts(pv).await;

        let relaunched = self.health(&global).await != MountHealth::Healthy;
        if relaunched {
            warn!(pv.name = pv, volume.name = %params.vol_name, "Relaunching the client of a damaged volume");
            self.mounter
                .force_unmount(&global)
                .await
                .context(GlobalUnmount { pv })?;
            self.relaunch(pv, &volume.volume_id, &params, &global).await?;
        }

        let mut binds = 0;
        let mut failed_binds = 0;
        let mut rebind = |result: Option<bool>| match result {
            Some(true) => binds += 1,
            Some(false) => failed_binds += 1,
            None => {}
        };
        let running = volume
            .consumers
            .iter()
            .map(|consumer| consumer.uid.as_str())
            .collect::<HashSet<_>>();

        for consumer in &volume.consumers {
            let target = self.paths.pod_mount(&consumer.uid, pv);
            let readonly = consumer.read_only || volume.read_only || params.read_only;
            rebind(self.restore(&global, &target, readonly, relaunched).await);

            for sub_path in &consumer.sub_paths {
                let source = global.join(&sub_path.sub_path);
                let target = self.paths.sub_path_mount(
                    &consumer.uid,
                    &consumer.pod_volume,
                    &sub_path.container,
                    sub_path.index,
                );
                rebind(
                    self.restore(&source, &target, readonly || sub_path.read_only, relaunched)
                        .await,
                );
            }
        }

        let mut detached = 0;
        for orphan in recorded
            .iter()
            .filter(|point| point.pod_uid().map_or(false, |uid| !running.contains(uid)))
        {
            if let Ok(MountHealth::Corrupted) = probe(self.mounter.as_ref(), &orphan.path).await {
                info!(
                    device = orphan.device,
                    path = %orphan.path.display(),
                    "Detaching damaged mount of a departed pod"
                );
                detached += 1;
                if let Err(error) = self.mounter.force_unmount(&orphan.path).await {
                    warn!(%error, "Failed to detach damaged mount");
                }
            }
        }

        if !relaunched && binds + failed_binds + detached == 0 {
            return Ok(VolumeOutcome::Healthy);
        }
        Ok(VolumeOutcome::Repaired {
            binds,
            failed_binds,
        })
    }

    /// The client mounts of `pv` found in the kernel mount table.
    async fn recorded_mounts(&self, pv: &str) -> Vec<MountPoint> {
        match self.mounter.mount_table().await {
            Ok(table) => classify_mounts(&table)
                .into_values()
                .flatten()
                .filter(|point| point.pv_name == pv)
                .collect(),
            Err(error) => {
                warn!(%error, "Failed to read the mount table");
                Vec::new()
            }
        }
    }

    /// Health of the mount on `path`, where a failed check counts as damaged.
    async fn health(&self, path: &Path) -> MountHealth {
        match probe(self.mounter.as_ref(), path).await {
            Ok(health) => health,
            Err(error) => {
                warn!(%error, path = %path.display(), "Failed to check mount");
                MountHealth::Corrupted
            }
        }
    }

    /// Launch the client on the global mount, retrying launches which fail or leave a
    /// broken mount behind.
    async fn relaunch(
        &self,
        pv: &str,
        volume_id: &str,
        params: &VolumeParams,
        global: &Path,
    ) -> Result<(), RecoveryError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut result = self.launch(volume_id, params, global).await;
            if result.is_ok() && self.health(global).await != MountHealth::Healthy {
                result = Err(LaunchError::BrokenMount {
                    mount_path: global.to_path_buf(),
                });
            }
            match result {
                Ok(()) => return Ok(()),
                Err(error) if attempt < self.retries => {
                    warn!(pv.name = pv, attempt, %error, "Client launch failed, retrying");
                    if let Err(error) = self.mounter.force_unmount(global).await {
                        warn!(%error, "Failed to detach the global mount");
                    }
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(error) => {
                    return Err(error).context(Launch {
                        pv,
                        attempts: attempt,
                    })
                }
            }
        }
    }

    async fn launch(
        &self,
        volume_id: &str,
        params: &VolumeParams,
        global: &Path,
    ) -> Result<(), LaunchError> {
        tokio::fs::create_dir_all(global)
            .await
            .context(CreateDir { path: global })
            .context(Mount)?;
        self.launcher.ensure_mounted(volume_id, params, global).await
    }

    /// Bind `source` onto `target` unless a healthy bind is already there, which after
    /// a relaunch still points at the old mount and is replaced too.
    /// Returns whether the bind succeeded, or `None` if it was left alone.
    async fn restore(
        &self,
        source: &Path,
        target: &Path,
        readonly: bool,
        relaunched: bool,
    ) -> Option<bool> {
        let health = self.health(target).await;
        if health == MountHealth::Healthy && !relaunched {
            return None;
        }
        if health != MountHealth::Absent {
            if let Err(error) = self.mounter.force_unmount(target).await {
                warn!(%error, path = %target.display(), "Failed to detach stale bind");
            }
        }
        match self.mounter.bind(source, target, readonly).await {
            Ok(()) => {
                debug!(path = %target.display(), readonly, "Rebound");
                Some(true)
            }
            Err(error) => {
                error!(%error, path = %target.display(), "Failed to rebind");
                Some(false)
            }
        }
    }
}

/// Recovery tasks of a pass, aborted if the pass is dropped before they finish.
#[derive(Default)]
struct RepairTasks(Vec<(String, JoinHandle<Result<VolumeOutcome, RecoveryError>>)>);

impl Drop for RepairTasks {
    fn drop(&mut self) {
        for (_, handle) in &self.0 {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        k8s::{Consumer, SubPath},
        testing::{FakeInventory, FakeLauncher, FakeMounter, Op},
    };
    use std::{collections::HashMap, path::PathBuf};

    fn volume(pv: &str, consumers: &[&str]) -> AttachedVolume {
        AttachedVolume {
            pv_name: pv.to_string(),
            volume_id: pv.to_string(),
            attributes: HashMap::from([
                ("masterAddr".to_string(), "10.0.0.1:17010".to_string()),
                ("volName".to_string(), format!("vol-{pv}")),
            ]),
            read_only: false,
            consumers: consumers
                .iter()
                .map(|uid| Consumer {
                    uid: uid.to_string(),
                    namespace: "default".to_string(),
                    name: format!("pod-{uid}"),
                    pod_volume: "data".to_string(),
                    read_only: false,
                    sub_paths: vec![],
                })
                .collect(),
        }
    }

    struct Fixture {
        _root: tempfile::TempDir,
        paths: KubeletPaths,
        mounter: Arc<FakeMounter>,
        launcher: Arc<FakeLauncher>,
        remounter: Remounter<FakeInventory, FakeMounter, FakeLauncher>,
    }

    fn fixture(
        volumes: Vec<AttachedVolume>,
        launcher: impl FnOnce(Arc<FakeMounter>) -> FakeLauncher,
    ) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let paths = KubeletPaths::new(root.path());
        let mounter = Arc::new(FakeMounter::default());
        let launcher = Arc::new(launcher(mounter.clone()));
        let remounter = Remounter::new(
            Arc::new(FakeInventory::new(volumes)),
            mounter.clone(),
            launcher.clone(),
            MountLock::default(),
            paths.clone(),
            3,
        )
        .with_retry_delay(Duration::from_millis(1));
        Fixture {
            _root: root,
            paths,
            mounter,
            launcher,
            remounter,
        }
    }

    impl Fixture {
        /// Mount the volume and bind it into its consumers, then kill its client.
        async fn damage(&self, volume: &AttachedVolume) {
            let global = self.global(&volume.pv_name);
            self.mounter
                .mount_client(&global, &format!("vol-{}", volume.pv_name));
            for consumer in &volume.consumers {
                let target = self.pod(&consumer.uid, &volume.pv_name);
                self.mounter.bind(&global, &target, false).await.unwrap();
            }
            self.mounter.corrupt(&global);
            self.mounter.clear_ops();
        }
        fn global(&self, pv: &str) -> PathBuf {
            self.paths.global_mount(pv)
        }
        fn pod(&self, uid: &str, pv: &str) -> PathBuf {
            self.paths.pod_mount(uid, pv)
        }
    }

    #[tokio::test]
    async fn corrupted_volume_is_relaunched_and_rebound() {
        let mut vol = volume("pvc-1", &["uid-a", "uid-b"]);
        vol.consumers[1].sub_paths.push(SubPath {
            container: "app".to_string(),
            index: 1,
            sub_path: "logs".to_string(),
            read_only: true,
        });
        let f = fixture(vec![], FakeLauncher::new);
        f.damage(&vol).await;

        let outcome = f.remounter.repair(&vol).await.unwrap();
        assert!(matches!(
            outcome,
            VolumeOutcome::Repaired {
                binds: 3,
                failed_binds: 0
            }
        ));
        assert_eq!(f.launcher.launches(), vec![("pvc-1".to_string(), f.global("pvc-1"))]);

        let sub_path = f.paths.sub_path_mount("uid-b", "data", "app", 1);
        assert_eq!(
            f.mounter.ops(),
            vec![
                Op::ForceUnmount(f.global("pvc-1")),
                Op::ForceUnmount(f.pod("uid-a", "pvc-1")),
                Op::Bind {
                    source: f.global("pvc-1"),
                    target: f.pod("uid-a", "pvc-1"),
                    readonly: false
                },
                Op::ForceUnmount(f.pod("uid-b", "pvc-1")),
                Op::Bind {
                    source: f.global("pvc-1"),
                    target: f.pod("uid-b", "pvc-1"),
                    readonly: false
                },
                Op::Bind {
                    source: f.global("pvc-1").join("logs"),
                    target: sub_path,
                    readonly: true
                },
            ]
        );

        // a second pass finds everything healthy
        f.mounter.clear_ops();
        let outcome = f.remounter.repair(&vol).await.unwrap();
        assert!(matches!(outcome, VolumeOutcome::Healthy));
        assert!(f.mounter.ops().is_empty());
        assert_eq!(f.launcher.launches().len(), 1);
    }

    #[tokio::test]
    async fn healthy_global_mount_is_kept_while_missing_binds_are_restored() {
        let vol = volume("pvc-1", &["uid-a", "uid-b"]);
        let f = fixture(vec![], FakeLauncher::new);
        let global = f.global("pvc-1");
        f.mounter.mount_client(&global, "vol-pvc-1");
        f.mounter
            .bind(&global, &f.pod("uid-a", "pvc-1"), false)
            .await
            .unwrap();
        f.mounter.clear_ops();

        let outcome = f.remounter.repair(&vol).await.unwrap();
        assert!(matches!(
            outcome,
            VolumeOutcome::Repaired {
                binds: 1,
                failed_binds: 0
            }
        ));
        assert!(f.launcher.launches().is_empty());
        assert_eq!(
            f.mounter.ops(),
            vec![Op::Bind {
                source: global.clone(),
                target: f.pod("uid-b", "pvc-1"),
                readonly: false
            }]
        );
        assert!(f.mounter.is_mounted(&global));
    }

    #[tokio::test]
    async fn damaged_bind_on_a_healthy_global_mount_is_replaced() {
        let vol = volume("pvc-1", &["uid-a", "uid-b"]);
        let f = fixture(vec![], FakeLauncher::new);
        let global = f.global("pvc-1");
        f.mounter.mount_client(&global, "vol-pvc-1");
        for uid in ["uid-a", "uid-b"] {
            f.mounter
                .bind(&global, &f.pod(uid, "pvc-1"), false)
                .await
                .unwrap();
        }
        f.mounter.corrupt_one(&f.pod("uid-a", "pvc-1"));
        f.mounter.clear_ops();

        let outcome = f.remounter.repair(&vol).await.unwrap();
        assert!(matches!(outcome, VolumeOutcome::Repaired { binds: 1, .. }));
        assert!(f.launcher.launches().is_empty());
        assert_eq!(
            f.mounter.ops(),
            vec![
                Op::ForceUnmount(f.pod("uid-a", "pvc-1")),
                Op::Bind {
                    source: global,
                    target: f.pod("uid-a", "pvc-1"),
                    readonly: false
                },
            ]
        );
    }

    #[tokio::test]
    async fn corrupted_volume_without_consumers_is_not_rebound() {
        let vol = volume("pvc-1", &[]);
        let f = fixture(vec![], FakeLauncher::new);
        f.damage(&vol).await;

        let outcome = f.remounter.repair(&vol).await.unwrap();
        assert!(matches!(
            outcome,
            VolumeOutcome::Repaired {
                binds: 0,
                failed_binds: 0
            }
        ));
        assert_eq!(f.mounter.ops(), vec![Op::ForceUnmount(f.global("pvc-1"))]);
        assert_eq!(f.launcher.launches().len(), 1);
    }

    #[tokio::test]
    async fn unused_volumes_are_skipped() {
        let vol = volume("pvc-1", &[]);
        let f = fixture(vec![vol.clone()], FakeLauncher::new);
        f.damage(&vol).await;

        let report = f.remounter.remount_damaged().await;
        assert_eq!(report.skipped, vec!["pvc-1".to_string()]);
        assert!(report.outcomes.is_empty());
        assert!(f.launcher.launches().is_empty());
    }

    #[tokio::test]
    async fn one_failing_volume_does_not_stop_the_others() {
        let good = volume("pvc-good", &["uid-a"]);
        let bad = volume("pvc-bad", &["uid-b"]);
        let f = fixture(vec![good.clone(), bad.clone()], |mounter| {
            FakeLauncher::new(mounter).failing("pvc-bad")
        });
        f.damage(&good).await;
        f.damage(&bad).await;

        let report = f.remounter.remount_damaged().await;
        assert!(report.inventory_error.is_none());
        assert_eq!(report.repaired().collect::<Vec<_>>(), vec!["pvc-good"]);
        let failed = report.failed().collect::<Vec<_>>();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, "pvc-bad");
        assert!(matches!(
            failed[0].1,
            RecoveryError::Launch { attempts: 3, .. }
        ));

        assert!(f.mounter.is_mounted(&f.pod("uid-a", "pvc-good")));
        assert_eq!(
            f.launcher
                .launches()
                .iter()
                .filter(|(id, _)| id == "pvc-bad")
                .count(),
            3
        );
    }

    #[tokio::test]
    async fn broken_launch_is_retried() {
        let vol = volume("pvc-1", &["uid-a"]);
        let f = fixture(vec![], |mounter| FakeLauncher::new(mounter).broken_once("pvc-1"));
        f.damage(&vol).await;

        let outcome = f.remounter.repair(&vol).await.unwrap();
        assert!(matches!(outcome, VolumeOutcome::Repaired { binds: 1, .. }));
        assert_eq!(f.launcher.launches().len(), 2);
        assert_eq!(f.mounter.mount_count(&f.global("pvc-1")), 1);
    }

    #[tokio::test]
    async fn invalid_context_fails_the_volume() {
        let mut vol = volume("pvc-1", &["uid-a"]);
        vol.attributes.remove("masterAddr");
        let f = fixture(vec![], FakeLauncher::new);

        let error = f.remounter.repair(&vol).await.unwrap_err();
        assert!(matches!(error, RecoveryError::InvalidContext { .. }));
        assert!(f.launcher.launches().is_empty());
    }

    #[tokio::test]
    async fn departed_consumer_mount_is_detached() {
        let vol = volume("pvc-1", &["uid-a", "uid-gone"]);
        let f = fixture(vec![], FakeLauncher::new);
        f.damage(&vol).await;
        let running = volume("pvc-1", &["uid-a"]);

        f.remounter.repair(&running).await.unwrap();
        assert!(f
            .mounter
            .ops()
            .contains(&Op::ForceUnmount(f.pod("uid-gone", "pvc-1"))));
        assert!(!f.mounter.is_mounted(&f.pod("uid-gone", "pvc-1")));
    }

    #[tokio::test]
    async fn unreachable_orchestrator_is_reported() {
        let mounter = Arc::new(FakeMounter::default());
        let remounter = Remounter::new(
            Arc::new(FakeInventory::unavailable()),
            mounter.clone(),
            Arc::new(FakeLauncher::new(mounter)),
            MountLock::default(),
            KubeletPaths::new("/var/lib/kubelet"),
            3,
        );
        let report = remounter.remount_damaged().await;
        assert!(report.inventory_error.is_some());
        assert!(report.outcomes.is_empty());
    }

    #[tokio::test]
    async fn run_stops_on_signal() {
        let f = fixture(vec![], FakeLauncher::new);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(
            f.remounter
                .clone()
                .run(Some(Duration::from_millis(5)), async move {
                    let _ = rx.await;
                }),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn stopping_aborts_repairs_in_flight() {
        let vol = volume("pvc-1", &["uid-a"]);
        let f = fixture(vec![vol.clone()], |mounter| {
            FakeLauncher::new(mounter).slow(Duration::from_millis(500))
        });
        f.damage(&vol).await;

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(f.remounter.clone().run(None, async move {
            let _ = rx.await;
        }));
        // wait for the launch to start, then stop before it mounts
        tokio::time::timeout(Duration::from_secs(5), async {
            while f.launcher.launches().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!f.mounter.is_mounted(&f.global("pvc-1")));
        assert!(!f
            .mounter
            .ops()
            .iter()
            .any(|op| matches!(op, Op::Bind { .. })));
    }
}
