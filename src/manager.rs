//! Single-instance capture session lifecycle.
//!
//! The liveness token is the only source of truth for whether a session is
//! running: every query re-reads it and probes the named process, so a
//! session that died on its own reads as stopped without any notification.
//! Start is check-then-spawn and is not atomic against a second controller
//! racing on the same state directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use nix::sys::signal::Signal;
use tracing::{debug, info, warn};

use crate::config::SessionSettings;
use crate::models::{SessionRecord, SessionStatus, StartOptions, StartOutcome};
use crate::process::{ExternalProcessHandle, SystemProcesses};
use crate::store::{FileSessionStore, SessionStore};
use crate::utils::{parse_key_values, render_key_values};

pub const ALREADY_RUNNING: &str = "Already running";

/// Picks the v4l2loopback device the capture tool should write to.
///
/// Looks for an entry under `probe_dir` whose `name` mentions `Android` or
/// `v4l2loopback`; falls back to `default` when none does or the directory
/// cannot be read.
pub fn resolve_capture_sink(probe_dir: &Path, default: &str) -> String {
    let Ok(entries) = fs::read_dir(probe_dir) else {
        return default.to_string();
    };
    let mut names: Vec<_> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name())
        .collect();
    names.sort();

    for name in names {
        let Ok(label) = fs::read_to_string(probe_dir.join(&name).join("name")) else {
            continue;
        };
        if label.contains("Android") || label.contains("v4l2loopback") {
            return format!("/dev/{}", name.to_string_lossy());
        }
    }
    default.to_string()
}

/// Command line for the capture tool.
pub fn capture_args(options: &StartOptions, sink: &str) -> Vec<String> {
    let mut args = vec![
        "--video-source=camera".to_string(),
        format!("--camera-id={}", options.camera_id),
        format!("--camera-size={}", options.resolution),
        format!("--camera-fps={}", options.fps),
        format!("--video-bit-rate={}", options.quality.bitrate()),
        format!("--v4l2-sink={}", sink),
        format!("--capture-orientation={}", options.orientation()),
        "--no-window".to_string(),
        "--no-audio".to_string(),
    ];
    if let Some(serial) = &options.serial {
        args.push(format!("--serial={}", serial));
    }
    args
}

pub struct SessionManager<S = FileSessionStore, P = SystemProcesses> {
    settings: SessionSettings,
    store: S,
    processes: P,
}

impl SessionManager {
    /// Manager over the state directory in `settings` and real processes.
    pub fn from_settings(settings: SessionSettings) -> Self {
        let store = FileSessionStore::new(settings.state_dir.clone());
        Self::new(settings, store, SystemProcesses)
    }
}

impl<S: SessionStore, P: ExternalProcessHandle> SessionManager<S, P> {
    pub fn new(settings: SessionSettings, store: S, processes: P) -> Self {
        Self {
            settings,
            store,
            processes,
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Pid of the running capture process, if the token names a live one.
    /// A stale token is left in place for the next start or stop.
    pub fn query_running(&self) -> Option<u32> {
        let pid = self.store.read_token()?;
        if self.processes.probe_alive(pid) {
            Some(pid)
        } else {
            debug!("Liveness token names {} which is gone", pid);
            None
        }
    }

    /// Last recorded configuration; empty when absent or unreadable.
    pub fn query_current_config(&self) -> BTreeMap<String, String> {
        self.store
            .read_config()
            .map(|raw| parse_key_values(&raw))
            .unwrap_or_default()
    }

    /// Running state, with the configuration only while running.
    pub fn status(&self) -> SessionStatus {
        let pid = self.query_running();
        let config = if pid.is_some() {
            self.query_current_config()
        } else {
            BTreeMap::new()
        };
        SessionStatus {
            running: pid.is_some(),
            pid,
            config,
        }
    }

    pub fn capture_sink(&self) -> String {
        resolve_capture_sink(&self.settings.sink_probe_dir, &self.settings.default_sink)
    }

    pub fn start(&self, options: &StartOptions) -> StartOutcome {
        if let Some(pid) = self.query_running() {
            info!("Capture session {} already running", pid);
            return StartOutcome::failed(ALREADY_RUNNING);
        }

        let sink = self.capture_sink();
        info!("Using device: {}", sink);
        let args = capture_args(options, &sink);

        let pid = match self.processes.spawn_detached(
            &self.settings.capture_program,
            &args,
            &self.settings.log_path(),
        ) {
            Ok(pid) => pid,
            Err(e) => {
                warn!("Starting capture failed: {:#}", e);
                return StartOutcome::failed(format!("{:#}", e));
            }
        };

        if let Err(e) = self.store.write_token(pid) {
            warn!("Recording capture process {} failed: {:#}", pid, e);
            self.terminate(pid);
            return StartOutcome::failed(format!("Failed to record session: {:#}", e));
        }

        let record = SessionRecord::new(pid, sink, options);
        if let Err(e) = self.store.write_config(&render_key_values(&record.snapshot())) {
            warn!("Recording session config failed: {:#}", e);
        }

        info!("Stream started! PID: {}", pid);
        StartOutcome::started(pid)
    }

    /// Stops the running session. `false` when none was running, including
    /// when only a stale token was left behind (which is removed).
    pub fn stop(&self) -> bool {
        let Some(pid) = self.query_running() else {
            if self.store.has_token() {
                self.forget_session();
            }
            return false;
        };

        info!("Stopping stream (PID: {})...", pid);
        self.terminate(pid);
        self.forget_session();
        true
    }

    /// SIGTERM to the process group, or to the process alone when the group
    /// cannot be signalled. Never fails.
    fn terminate(&self, pid: u32) {
        if let Err(group_err) = self.processes.signal_group(pid, Signal::SIGTERM) {
            debug!("Group signal failed, signalling {} directly: {:#}", pid, group_err);
            if let Err(e) = self.processes.signal(pid, Signal::SIGTERM) {
                debug!("Signalling {} failed: {:#}", pid, e);
            }
        }
    }

    fn forget_session(&self) {
        if let Err(e) = self.store.delete_token() {
            debug!("Removing liveness token failed: {:#}", e);
        }
        if let Err(e) = self.store.delete_config() {
            debug!("Removing session config failed: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{QualityTier, Rotation};
    use crate::store::MemorySessionStore;
    use anyhow::{Result, anyhow};
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeProcesses {
        alive: Mutex<HashSet<u32>>,
        spawned: Mutex<Vec<(String, Vec<String>, PathBuf)>>,
        signals: Mutex<Vec<(&'static str, u32)>>,
        fail_spawn: bool,
        deny_group_signal: bool,
    }

    impl FakeProcesses {
        fn spawn_count(&self) -> usize {
            self.spawned.lock().unwrap().len()
        }

        fn last_args(&self) -> Vec<String> {
            self.spawned.lock().unwrap().last().unwrap().1.clone()
        }

        fn kill_externally(&self, pid: u32) {
            self.alive.lock().unwrap().remove(&pid);
        }
    }

    impl ExternalProcessHandle for FakeProcesses {
        fn spawn_detached(&self, program: &str, args: &[String], log_path: &Path) -> Result<u32> {
            if self.fail_spawn {
                return Err(anyhow!("Failed to start {}", program));
            }
            let mut spawned = self.spawned.lock().unwrap();
            let pid = 1000 + spawned.len() as u32;
            spawned.push((program.to_string(), args.to_vec(), log_path.to_path_buf()));
            self.alive.lock().unwrap().insert(pid);
            Ok(pid)
        }

        fn probe_alive(&self, pid: u32) -> bool {
            self.alive.lock().unwrap().contains(&pid)
        }

        fn signal_group(&self, pid: u32, _signal: Signal) -> Result<()> {
            self.signals.lock().unwrap().push(("group", pid));
            if self.deny_group_signal {
                return Err(anyhow!("EPERM"));
            }
            self.alive.lock().unwrap().remove(&pid);
            Ok(())
        }

        fn signal(&self, pid: u32, _signal: Signal) -> Result<()> {
            self.signals.lock().unwrap().push(("pid", pid));
            if self.alive.lock().unwrap().remove(&pid) {
                Ok(())
            } else {
                Err(anyhow!("ESRCH"))
            }
        }
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            state_dir: PathBuf::from("/tmp/popdroidcam-unused"),
            capture_program: "scrcpy".to_string(),
            sink_probe_dir: PathBuf::from("/nonexistent/video4linux"),
            default_sink: "/dev/video6".to_string(),
        }
    }

    fn manager(processes: FakeProcesses) -> SessionManager<MemorySessionStore, FakeProcesses> {
        SessionManager::new(settings(), MemorySessionStore::new(), processes)
    }

    fn options() -> StartOptions {
        StartOptions {
            camera_id: "1".to_string(),
            resolution: "1920x1080".to_string(),
            fps: "30".to_string(),
            rotation: Rotation::Deg90,
            quality: QualityTier::High,
            mirror: true,
            serial: Some("192.168.1.20:41235".to_string()),
        }
    }

    #[test]
    fn start_spawns_and_records_session() {
        let manager = manager(FakeProcesses::default());
        let outcome = manager.start(&options());

        assert_eq!(outcome, StartOutcome::started(1000));
        assert_eq!(manager.query_running(), Some(1000));
        assert_eq!(
            manager.processes.last_args(),
            vec![
                "--video-source=camera",
                "--camera-id=1",
                "--camera-size=1920x1080",
                "--camera-fps=30",
                "--video-bit-rate=16M",
                "--v4l2-sink=/dev/video6",
                "--capture-orientation=flip90",
                "--no-window",
                "--no-audio",
                "--serial=192.168.1.20:41235",
            ]
        );
        let spawned = manager.processes.spawned.lock().unwrap();
        assert_eq!(spawned[0].0, "scrcpy");
        assert_eq!(spawned[0].2, PathBuf::from("/tmp/popdroidcam-unused/scrcpy.log"));
    }

    #[test]
    fn snapshot_matches_start_options() {
        let manager = manager(FakeProcesses::default());
        let mut opts = options();
        opts.mirror = false;
        opts.serial = None;
        assert!(manager.start(&opts).success);

        let config = manager.query_current_config();
        assert_eq!(config["res"], opts.resolution);
        assert_eq!(config["fps"], opts.fps);
        assert_eq!(config["camera_id"], opts.camera_id);
        assert_eq!(config["rotation"], "90");
        assert_eq!(config["quality"], "high");
        assert_eq!(config["mirror"], "false");
        assert_eq!(config["device"], "/dev/video6");
        assert!(!config.contains_key("serial"));
    }

    #[test]
    fn snapshot_records_mirror_and_serial() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("loopback"), "").unwrap();
        fs::create_dir(dir.path().join("video3")).unwrap();
        fs::write(dir.path().join("video3/name"), "v4l2loopback Camera\n").unwrap();
        let manager = SessionManager::new(
            SessionSettings {
                sink_probe_dir: dir.path().to_path_buf(),
                ..settings()
            },
            MemorySessionStore::new(),
            FakeProcesses::default(),
        );
        assert!(manager.start(&options()).success);

        let config = manager.query_current_config();
        assert_eq!(config["mirror"], "true");
        assert_eq!(config["serial"], "192.168.1.20:41235");
        assert_eq!(config["device"], "/dev/video3");
        assert_eq!(manager.status().config, config);
    }

    #[test]
    fn config_with_undecodable_line_keeps_good_entries() {
        let dir = TempDir::new().unwrap();
        let manager = SessionManager::new(
            settings(),
            FileSessionStore::new(dir.path()),
            FakeProcesses::default(),
        );
        fs::write(dir.path().join("config"), b"res=1920x1080\nfps=30\njunk=\xff\xfe\n").unwrap();

        let config = manager.query_current_config();
        assert_eq!(config["res"], "1920x1080");
        assert_eq!(config["fps"], "30");
    }

    #[test]
    fn stop_removes_unparseable_token() {
        let manager = manager(FakeProcesses::default());
        manager.store().set_raw_token("12abc");
        manager.store().write_config("res=1920x1080\n").unwrap();

        assert!(!manager.stop());
        assert!(!manager.store().has_token());
        assert!(manager.query_current_config().is_empty());
        assert!(manager.processes.signals.lock().unwrap().is_empty());
    }

    #[test]
    fn second_start_is_rejected_without_spawning() {
        let manager = manager(FakeProcesses::default());
        assert!(manager.start(&options()).success);

        let outcome = manager.start(&options());
        assert_eq!(outcome, StartOutcome::failed(ALREADY_RUNNING));
        assert_eq!(manager.processes.spawn_count(), 1);
    }

    #[test]
    fn stop_is_idempotent() {
        let manager = manager(FakeProcesses::default());
        assert!(manager.start(&options()).success);

        assert!(manager.stop());
        assert!(!manager.stop());
        assert_eq!(manager.query_running(), None);
        assert!(!manager.store().has_token());
        assert!(manager.query_current_config().is_empty());
        assert_eq!(*manager.processes.signals.lock().unwrap(), vec![("group", 1000)]);
    }

    #[test]
    fn stop_without_session_is_false() {
        let manager = manager(FakeProcesses::default());
        assert!(!manager.stop());
        assert!(manager.processes.signals.lock().unwrap().is_empty());
    }

    #[test]
    fn denied_group_signal_falls_back_to_pid() {
        let manager = manager(FakeProcesses {
            deny_group_signal: true,
            ..Default::default()
        });
        assert!(manager.start(&options()).success);

        assert!(manager.stop());
        assert_eq!(
            *manager.processes.signals.lock().unwrap(),
            vec![("group", 1000), ("pid", 1000)]
        );
        assert!(!manager.store().has_token());
    }

    #[test]
    fn stale_token_reads_as_not_running() {
        let manager = manager(FakeProcesses::default());
        manager.store().write_token(31337).unwrap();

        assert_eq!(manager.query_running(), None);
        assert!(!manager.status().running);
        assert!(manager.store().has_token());

        assert!(!manager.stop());
        assert!(!manager.store().has_token());
    }

    #[test]
    fn externally_killed_session_can_be_restarted() {
        let manager = manager(FakeProcesses::default());
        assert!(manager.start(&options()).success);
        manager.processes.kill_externally(1000);

        assert_eq!(manager.query_running(), None);
        assert_eq!(manager.start(&options()), StartOutcome::started(1001));
        assert_eq!(manager.query_running(), Some(1001));
    }

    #[test]
    fn spawn_failure_leaves_no_records() {
        let manager = manager(FakeProcesses {
            fail_spawn: true,
            ..Default::default()
        });
        let outcome = manager.start(&options());

        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("Failed to start scrcpy"));
        assert!(!manager.store().has_token());
        assert!(manager.query_current_config().is_empty());
    }

    #[test]
    fn malformed_config_lines_are_skipped() {
        let manager = manager(FakeProcesses::default());
        manager
            .store()
            .write_config("res=1280x720\n\u{0}\u{1}junk\nfps=60\n")
            .unwrap();
        let config = manager.query_current_config();
        assert_eq!(config.len(), 2);
        assert_eq!(config["fps"], "60");
    }

    #[test]
    fn status_reports_config_only_while_running() {
        let manager = manager(FakeProcesses::default());
        assert!(manager.start(&options()).success);

        let status = manager.status();
        assert!(status.running);
        assert_eq!(status.pid, Some(1000));
        assert_eq!(status.config["quality"], "high");

        manager.processes.kill_externally(1000);
        let status = manager.status();
        assert!(!status.running);
        assert!(status.config.is_empty());
    }

    #[test]
    fn file_backed_manager_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        let mut settings = settings();
        settings.state_dir = dir.path().to_path_buf();
        let processes = FakeProcesses::default();

        let first = SessionManager::new(
            settings.clone(),
            FileSessionStore::new(dir.path()),
            processes,
        );
        assert!(first.start(&options()).success);
        let processes = first.processes;

        let second = SessionManager::new(settings, FileSessionStore::new(dir.path()), processes);
        assert_eq!(second.query_running(), Some(1000));
        assert_eq!(second.query_current_config()["camera_id"], "1");
        assert!(second.stop());
        assert!(!dir.path().join("pid").exists());
    }

    #[test]
    fn sink_prefers_loopback_device() {
        let dir = TempDir::new().unwrap();
        for (entry, name) in [
            ("video0", "Integrated Camera\n"),
            ("video4", "Android Cam\n"),
            ("video5", "v4l2loopback\n"),
        ] {
            fs::create_dir(dir.path().join(entry)).unwrap();
            fs::write(dir.path().join(entry).join("name"), name).unwrap();
        }
        fs::create_dir(dir.path().join("video1")).unwrap();

        assert_eq!(resolve_capture_sink(dir.path(), "/dev/video6"), "/dev/video4");
    }

    #[test]
    fn sink_falls_back_to_default() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("video0")).unwrap();
        fs::write(dir.path().join("video0/name"), "Integrated Camera").unwrap();

        assert_eq!(resolve_capture_sink(dir.path(), "/dev/video6"), "/dev/video6");
        assert_eq!(
            resolve_capture_sink(&dir.path().join("missing"), "/dev/video6"),
            "/dev/video6"
        );
    }
}
