//! Launcher control loop.
//!
//! Every slot follows a small state machine:
//! 1. Unconfigured: required keys are missing (or the last worker died)
//! 2. Configured: the workspace is prepared and the worker spawned
//! 3. Running: the worker is checked on every tick
//! 4. Dead or configuration removed: the record is cleared and the slot
//!    goes back to Unconfigured; a configured slot is respawned next tick
//!
//! A failure in one slot is logged and never stops the other slots.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use super::{ReconcileReport, SlotState};
use crate::config::{
    ConfigError, EnvSnapshot, EnvSource, KeyScheme, MAX_SLOTS, Resolution, Slot, SlotConfig,
    resolve,
};
use crate::supervisor::{Liveness, Supervisor};
use crate::workspace::WorkspaceLayout;

/// Messages that can be sent to the running launcher.
#[derive(Debug, Clone)]
pub enum LauncherMessage {
    /// Re-read the configuration and reconcile immediately.
    Reconcile,
    /// Stop monitoring. Workers keep running.
    Shutdown,
}

/// Drives all slots through their lifecycle.
pub struct Launcher {
    /// Naming convention of the configuration keys.
    scheme: KeyScheme,

    /// Where configuration snapshots come from.
    env: Box<dyn EnvSource>,

    /// Workspace layout shared by all slots.
    workspaces: WorkspaceLayout,

    /// Process supervisor.
    supervisor: Supervisor,

    /// Interval between monitoring ticks.
    check_interval: Duration,

    /// State per slot, indexed by `Slot::position`.
    slots: Vec<SlotState>,
}

impl Launcher {
    /// Creates a launcher with every slot unconfigured.
    #[must_use]
    pub fn new(
        scheme: KeyScheme,
        env: Box<dyn EnvSource>,
        workspaces: WorkspaceLayout,
        supervisor: Supervisor,
    ) -> Self {
        Self {
            scheme,
            env,
            workspaces,
            supervisor,
            check_interval: Duration::from_secs(30),
            slots: (0..MAX_SLOTS).map(|_| SlotState::default()).collect(),
        }
    }

    /// Sets the interval between monitoring ticks.
    #[must_use]
    pub const fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Returns the state of `slot`.
    #[must_use]
    pub fn state(&self, slot: Slot) -> &SlotState {
        &self.slots[slot.position()]
    }

    /// Lists running slots with their PIDs, in slot order.
    #[must_use]
    pub fn running(&self) -> Vec<(Slot, u32)> {
        Slot::all()
            .filter_map(|slot| self.state(slot).pid().map(|pid| (slot, pid)))
            .collect()
    }

    /// Returns the supervisor.
    #[must_use]
    pub const fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// First pass over all slots.
    ///
    /// Workers recorded by an earlier run are stopped if their slot lost its
    /// configuration, adopted if they are still alive, and forgotten if they
    /// are gone. A recorded PID that runs outside the slot workspace belongs
    /// to some other process and is only forgotten. Every other configured
    /// slot is spawned.
    pub async fn start(&mut self) -> ReconcileReport {
        let env = self.env.snapshot();
        let mut report = ReconcileReport::default();

        for slot in Slot::all() {
            let resolution = resolve(slot, self.scheme, &env);
            let workspace = self.workspaces.slot_dir(slot);
            let recovered = self.supervisor.recover(slot).and_then(|mut record| {
                if self.supervisor.runs_in(&record, &workspace) == Some(false) {
                    warn!(
                        "{}: PID {} on record is not a worker of this slot, ignoring it",
                        slot, record.pid
                    );
                    self.supervisor.forget(slot);
                    return None;
                }
                let liveness = self.supervisor.is_alive(&mut record);
                Some((record, liveness))
            });

            match (resolution, recovered) {
                (Resolution::Unconfigured { missing, .. }, Some((record, _))) => {
                    warn!(
                        "{}: configuration missing, stopping worker from previous run (PID {})",
                        slot, record.pid
                    );
                    self.supervisor.retire(record).await;
                    report.stopped.push(slot);
                    self.mark_unconfigured(slot, missing);
                }
                (Resolution::Unconfigured { missing, .. }, None) => {
                    self.mark_unconfigured(slot, missing);
                }
                (Resolution::Configured(_), Some((record, Liveness::Alive | Liveness::Unknown))) => {
                    info!("{}: adopting running worker (PID {})", slot, record.pid);
                    report.adopted.push(slot);
                    self.slots[slot.position()] = SlotState::Running(record);
                }
                (Resolution::Configured(config), stale) => {
                    if let Some((record, _)) = stale {
                        debug!("{}: clearing stale record (PID {})", slot, record.pid);
                        self.supervisor.forget(slot);
                    }
                    self.launch(config, &env, &mut report);
                }
            }
        }

        report.running = self.running().len();
        report
    }

    /// Re-resolves every slot and brings its worker in line.
    pub async fn reconcile(&mut self) -> ReconcileReport {
        let env = self.env.snapshot();
        let mut report = ReconcileReport::default();

        for slot in Slot::all() {
            let resolution = resolve(slot, self.scheme, &env);
            let state = std::mem::take(&mut self.slots[slot.position()]);

            match (state, resolution) {
                (SlotState::Running(mut record), Resolution::Configured(_)) => {
                    if self.supervisor.is_alive(&mut record) == Liveness::Dead {
                        warn!("{}: worker (PID {}) has stopped", slot, record.pid);
                        self.supervisor.forget(slot);
                        report.exited.push(slot);
                    } else {
                        self.slots[slot.position()] = SlotState::Running(record);
                    }
                }
                (SlotState::Running(record), Resolution::Unconfigured { missing, .. }) => {
                    warn!(
                        "{}: configuration removed, stopping worker (PID {})",
                        slot, record.pid
                    );
                    self.supervisor.retire(record).await;
                    report.stopped.push(slot);
                    self.mark_unconfigured(slot, missing);
                }
                (SlotState::Unconfigured { .. }, Resolution::Configured(config)) => {
                    self.launch(config, &env, &mut report);
                }
                (SlotState::Unconfigured { missing: previous }, Resolution::Unconfigured { missing, .. }) => {
                    self.slots[slot.position()] = SlotState::Unconfigured { missing: previous };
                    self.mark_unconfigured(slot, missing);
                }
            }
        }

        report.running = self.running().len();
        if !report.is_empty() {
            info!(
                "Reconciled: {} started, {} stopped, {} exited, {} failed, {} running",
                report.started.len(),
                report.stopped.len(),
                report.exited.len(),
                report.failed.len(),
                report.running
            );
        }

        report
    }

    /// Runs the monitoring loop until shut down.
    ///
    /// The first tick fires one interval after the call; [`start`](Self::start)
    /// is expected to have run already.
    pub async fn run(mut self, mut rx: mpsc::Receiver<LauncherMessage>) {
        info!(
            "Monitoring {} slot(s) every {:?}",
            MAX_SLOTS, self.check_interval
        );

        let mut check_timer = interval(self.check_interval);
        check_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        check_timer.tick().await;

        loop {
            tokio::select! {
                _ = check_timer.tick() => {
                    self.reconcile().await;
                }
                msg = rx.recv() => {
                    match msg {
                        Some(LauncherMessage::Reconcile) => {
                            debug!("Received reconcile message");
                            self.reconcile().await;
                        }
                        Some(LauncherMessage::Shutdown) | None => {
                            info!("Launcher shutting down");
                            break;
                        }
                    }
                }
            }
        }

        let running = self.running();
        if !running.is_empty() {
            info!(
                "{} worker(s) left running: {}",
                running.len(),
                running
                    .iter()
                    .map(|(slot, pid)| format!("{slot} (PID {pid})"))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
    }

    /// Prepares the workspace of a configured slot and spawns its worker.
    fn launch(&mut self, config: SlotConfig, env: &EnvSnapshot, report: &mut ReconcileReport) {
        let slot = config.slot;
        self.slots[slot.position()] = SlotState::default();

        let workspace = match self.workspaces.ensure_workspace(&config) {
            Ok(workspace) => workspace,
            Err(e) => {
                error!("{}: {}", slot, e);
                report.failed.push(slot);
                return;
            }
        };

        info!("{}: starting (storage namespace {})", slot, config.namespace);
        let overlay = config.env_overlay(&workspace.session_dir, self.workspaces.base_dir());

        match self.supervisor.spawn(&config, &workspace, env, &overlay) {
            Ok(record) => {
                info!("{}: started (PID {})", slot, record.pid);
                report.started.push(slot);
                self.slots[slot.position()] = SlotState::Running(record);
            }
            Err(e) => {
                error!("{}: {}", slot, e);
                report.failed.push(slot);
            }
        }
    }

    /// Marks `slot` unconfigured, logging the missing keys when they changed.
    fn mark_unconfigured(&mut self, slot: Slot, missing: Vec<String>) {
        let state = &mut self.slots[slot.position()];
        if state.missing() != missing.as_slice() {
            info!("{}", ConfigError::MissingKeys { slot, missing: missing.clone() });
        }
        *state = SlotState::Unconfigured { missing };
    }
}

impl std::fmt::Debug for Launcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launcher")
            .field("scheme", &self.scheme)
            .field("check_interval", &self.check_interval)
            .field("running", &self.running())
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use tempfile::TempDir;

    use super::*;
    use crate::supervisor::{
        OutputMode, PidRecordStore, SignalProbe, StopSignal, WorkerCommand, stop_process,
    };

    /// Configuration source the tests can edit between ticks.
    #[derive(Clone, Default)]
    struct EditableEnv(Arc<Mutex<HashMap<String, String>>>);

    impl EditableEnv {
        fn set(&self, key: &str, value: &str) {
            self.0.lock().unwrap().insert(key.to_owned(), value.to_owned());
        }

        fn remove(&self, key: &str) {
            self.0.lock().unwrap().remove(key);
        }

        fn configure(&self, slot: Slot) {
            for (key, value) in [
                ("API_ID", "1"),
                ("API_HASH", "hash"),
                ("SESSION", "session"),
                ("MONGO_URI", "mongodb://db.local"),
            ] {
                self.set(&slot.key(key), value);
            }
        }
    }

    impl EnvSource for EditableEnv {
        fn snapshot(&self) -> EnvSnapshot {
            let mut vars = self.0.lock().unwrap().clone();
            vars.insert("PATH".to_owned(), std::env::var("PATH").unwrap_or_default());
            vars.into_iter().collect()
        }
    }

    fn slot(index: usize) -> Slot {
        Slot::new(index).unwrap()
    }

    fn launcher(dir: &Path, env: &EditableEnv, script: &str) -> Launcher {
        let supervisor = Supervisor::new(
            WorkerCommand::new(
                "sh".to_owned(),
                vec!["-c".to_owned(), script.to_owned(), "worker".to_owned()],
            ),
            OutputMode::Capture,
            Box::new(SignalProbe),
            PidRecordStore::new(dir.to_path_buf()),
            Duration::from_secs(2),
        );
        let workspaces = WorkspaceLayout::new(dir.to_path_buf(), None, vec![], vec![]);
        Launcher::new(KeyScheme::Ultroid, Box::new(env.clone()), workspaces, supervisor)
    }

    async fn stop_all(launcher: &mut Launcher) {
        for slot in Slot::all() {
            if let SlotState::Running(record) = std::mem::take(&mut launcher.slots[slot.position()]) {
                launcher.supervisor.retire(record).await;
            }
        }
    }

    #[tokio::test]
    async fn test_nothing_configured_starts_nothing() {
        let tmp = TempDir::new().unwrap();
        let env = EditableEnv::default();
        let mut launcher = launcher(tmp.path(), &env, "exec sleep 30");

        let report = launcher.start().await;

        assert!(report.started.is_empty());
        assert!(report.nothing_running());
        assert!(launcher.running().is_empty());
        assert_eq!(
            launcher.state(slot(1)).missing(),
            ["API_ID", "API_HASH", "SESSION", "MONGO_URI"].map(str::to_owned)
        );
    }

    #[tokio::test]
    async fn test_removed_configuration_stops_only_that_slot() {
        let tmp = TempDir::new().unwrap();
        let env = EditableEnv::default();
        env.configure(slot(1));
        env.configure(slot(3));
        let mut launcher = launcher(tmp.path(), &env, "exec sleep 30");

        let report = launcher.start().await;
        assert_eq!(report.started, vec![slot(1), slot(3)]);
        assert_eq!(report.running, 2);
        assert!(!report.nothing_running());
        let records = launcher.supervisor().records().clone();
        assert!(records.path(slot(3)).exists());

        env.remove("SESSION2");
        let report = launcher.reconcile().await;

        assert_eq!(report.stopped, vec![slot(3)]);
        assert!(!records.path(slot(3)).exists());
        assert_eq!(launcher.state(slot(3)).missing(), ["SESSION2".to_owned()]);
        assert!(launcher.state(slot(1)).is_running());
        assert!(records.path(slot(1)).exists());

        stop_all(&mut launcher).await;
    }

    #[tokio::test]
    async fn test_new_configuration_is_started_on_tick() {
        let tmp = TempDir::new().unwrap();
        let env = EditableEnv::default();
        env.configure(slot(1));
        let mut launcher = launcher(tmp.path(), &env, "exec sleep 30");
        launcher.start().await;

        env.configure(slot(2));
        let report = launcher.reconcile().await;

        assert_eq!(report.started, vec![slot(2)]);
        assert_eq!(launcher.running().len(), 2);
        assert!(tmp.path().join("client_2/sessions").is_dir());

        stop_all(&mut launcher).await;
    }

    #[tokio::test]
    async fn test_dead_worker_is_respawned_next_tick() {
        let tmp = TempDir::new().unwrap();
        let env = EditableEnv::default();
        env.configure(slot(1));
        let mut launcher = launcher(tmp.path(), &env, "exit 0");
        launcher.start().await;

        let mut exited = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if launcher.reconcile().await.exited == vec![slot(1)] {
                exited = true;
                break;
            }
        }
        assert!(exited);
        assert!(!launcher.state(slot(1)).is_running());
        assert!(launcher.state(slot(1)).missing().is_empty());

        let report = launcher.reconcile().await;
        assert_eq!(report.started, vec![slot(1)]);
    }

    #[tokio::test]
    async fn test_spawn_failure_does_not_block_other_slots() {
        let tmp = TempDir::new().unwrap();
        let env = EditableEnv::default();
        env.configure(slot(1));
        env.configure(slot(2));
        // A file where the workspace of slot 1 should go.
        std::fs::write(tmp.path().join("client_1"), "in the way").unwrap();
        let mut launcher = launcher(tmp.path(), &env, "exec sleep 30");

        let report = launcher.start().await;

        assert_eq!(report.failed, vec![slot(1)]);
        assert_eq!(report.started, vec![slot(2)]);

        stop_all(&mut launcher).await;
    }

    /// Starts `sleep` inside `dir` and reaps it on a helper thread, so a
    /// killed process never lingers as a zombie.
    fn sleeper_in(dir: &Path) -> (u32, std::thread::JoinHandle<std::io::Result<std::process::ExitStatus>>) {
        std::fs::create_dir_all(dir).unwrap();
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .current_dir(dir)
            .spawn()
            .unwrap();
        let pid = child.id();
        (pid, std::thread::spawn(move || child.wait()))
    }

    #[tokio::test]
    async fn test_start_adopts_live_workers_and_retires_orphans() {
        let tmp = TempDir::new().unwrap();
        let env = EditableEnv::default();
        env.configure(slot(1));
        let records = PidRecordStore::new(tmp.path().to_path_buf());

        let (worker, worker_reaper) = sleeper_in(&tmp.path().join("client_1"));
        let (orphan, orphan_reaper) = sleeper_in(&tmp.path().join("client_2"));
        records.save(slot(1), worker).unwrap();
        records.save(slot(2), orphan).unwrap();

        let mut launcher = launcher(tmp.path(), &env, "exec sleep 30");
        let report = launcher.start().await;

        assert_eq!(report.adopted, vec![slot(1)]);
        assert_eq!(report.stopped, vec![slot(2)]);
        assert!(report.started.is_empty());
        assert_eq!(launcher.state(slot(1)).pid(), Some(worker));
        assert!(!records.path(slot(2)).exists());
        assert!(!orphan_reaper.join().unwrap().unwrap().success());

        stop_process(worker, StopSignal::Force).unwrap();
        worker_reaper.join().unwrap().unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_start_ignores_recorded_pids_of_other_processes() {
        use crate::supervisor::LivenessProbe;

        let tmp = TempDir::new().unwrap();
        let env = EditableEnv::default();
        env.configure(slot(1));
        let records = PidRecordStore::new(tmp.path().to_path_buf());

        // Same PID in both records, running outside any workspace.
        let (stranger, stranger_reaper) = sleeper_in(&tmp.path().join("elsewhere"));
        records.save(slot(1), stranger).unwrap();
        records.save(slot(2), stranger).unwrap();

        let mut launcher = launcher(tmp.path(), &env, "exec sleep 30");
        let report = launcher.start().await;

        assert!(report.adopted.is_empty());
        assert!(report.stopped.is_empty());
        assert_eq!(report.started, vec![slot(1)]);
        assert_ne!(launcher.state(slot(1)).pid(), Some(stranger));
        assert!(!records.path(slot(2)).exists());
        assert_eq!(SignalProbe.liveness(stranger), Liveness::Alive);

        stop_all(&mut launcher).await;
        stop_process(stranger, StopSignal::Force).unwrap();
        stranger_reaper.join().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let tmp = TempDir::new().unwrap();
        let env = EditableEnv::default();
        let launcher = launcher(tmp.path(), &env, "exec sleep 30")
            .with_check_interval(Duration::from_millis(20));
        let (tx, rx) = mpsc::channel(4);

        let handle = tokio::spawn(launcher.run(rx));
        tx.send(LauncherMessage::Reconcile).await.unwrap();
        tx.send(LauncherMessage::Shutdown).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
