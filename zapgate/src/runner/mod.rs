//! Transcoder subprocess management.
//!
//! Spawns the compiled ffmpeg invocation in its own process group, owns its
//! stderr, and enforces start/stall deadlines through the watchdog. Stopping
//! signals the whole group so wrapper scripts cannot leak children.

mod line_ring;
mod stderr;
mod watchdog;

pub use line_ring::LineRing;
pub use stderr::{FfmpegErrorClass, classify_ffmpeg_error, classify_ffmpeg_tail};
pub use watchdog::{StallWatchdog, WatchdogState};

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use process_utils::{GroupSignal, signal_group, tokio_command};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RunnerConfig;
use crate::profile::ProfileSpec;
use crate::{Error, Result};

/// Lines of stderr retained for diagnostics.
const STDERR_TAIL_LINES: usize = 100;

/// Watchdog evaluation cadence.
const WATCHDOG_TICK: Duration = Duration::from_millis(250);

/// A compiled transcoder invocation.
///
/// `args` are opaque to the runner; the only contract is that all output
/// lands inside `work_dir`.
#[derive(Debug, Clone)]
pub struct RunnerSpec {
    /// Input URI, logged but otherwise opaque.
    pub input: String,
    /// Exclusive working directory; the child runs with this as cwd.
    pub work_dir: PathBuf,
    /// Primary output filename, relative to `work_dir`.
    pub output_name: String,
    /// Full argument list.
    pub args: Vec<String>,
    /// The profile the args were compiled from; opaque here.
    pub profile: ProfileSpec,
}

impl RunnerSpec {
    fn validate(&self) -> Result<()> {
        if self.output_name.is_empty() {
            return Err(Error::Runner("output name must not be empty".into()));
        }
        if self.output_name.ends_with('/') || self.output_name.ends_with('\\') {
            return Err(Error::Runner(format!(
                "output name {:?} must not end with a path separator",
                self.output_name
            )));
        }
        Ok(())
    }
}

/// Exit information published by the waiter task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Process exit code; `None` when killed by a signal.
    pub code: Option<i32>,
}

/// A progress heartbeat. Receipt is the signal; the payload is incidental.
#[derive(Debug, Clone, Copy)]
pub struct Heartbeat {
    pub at: Instant,
}

/// Live controller for a spawned transcoder.
pub struct Handle {
    pgid: u32,
    /// Direct-kill fallback for targets without process groups.
    kill_fallback: CancellationToken,
    /// Cancelled once the child has been reaped.
    done: CancellationToken,
    exit: watch::Receiver<Option<ExitInfo>>,
    progress: Mutex<Option<mpsc::Receiver<Heartbeat>>>,
    ring: Arc<LineRing>,
    watchdog: Arc<Mutex<StallWatchdog>>,
    stopping: AtomicBool,
}

impl Handle {
    /// Wait for the child to exit. Safe to call from any number of tasks;
    /// the child is reaped exactly once by the waiter task.
    pub async fn wait(&self) -> ExitInfo {
        let mut rx = self.exit.clone();
        match rx.wait_for(|v| v.is_some()).await {
            Ok(guard) => (*guard).expect("guarded by wait_for"),
            // Waiter gone without publishing: treat as signal death.
            Err(_) => ExitInfo { code: None },
        }
    }

    /// Cancelled once the child has been reaped.
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Exit info if the child already exited.
    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    /// Take the lazy heartbeat stream. Only the first caller receives it.
    pub fn take_progress(&self) -> Option<mpsc::Receiver<Heartbeat>> {
        self.progress.lock().take()
    }

    /// Bounded snapshot of recent stderr.
    pub fn diagnostics(&self) -> Vec<String> {
        self.ring.snapshot()
    }

    /// Current watchdog state.
    pub fn watchdog_state(&self) -> WatchdogState {
        self.watchdog.lock().state()
    }

    /// Stop the whole process group: TERM, wait `grace`, KILL, wait `kill`.
    ///
    /// Idempotent and re-entrant; concurrent callers all return once the
    /// child is reaped (or the bounded wait elapses).
    pub async fn stop(&self, grace: Duration, kill: Duration) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            let _ = tokio::time::timeout(grace + kill, self.done.cancelled()).await;
            return;
        }

        terminate_group(
            self.pgid,
            &self.kill_fallback,
            &self.done,
            grace,
            kill,
        )
        .await;
    }
}

/// TERM the group, escalate to KILL after `grace`, bounded-wait the reap.
async fn terminate_group(
    pgid: u32,
    kill_fallback: &CancellationToken,
    done: &CancellationToken,
    grace: Duration,
    kill: Duration,
) {
    if done.is_cancelled() {
        return;
    }

    if signal_group(pgid, GroupSignal::Term).is_err() {
        // No process groups here: have the waiter kill the child directly.
        kill_fallback.cancel();
    }

    if tokio::time::timeout(grace, done.cancelled()).await.is_ok() {
        return;
    }

    debug!(pgid, "grace elapsed, escalating to KILL");
    let _ = signal_group(pgid, GroupSignal::Kill);
    kill_fallback.cancel();

    if tokio::time::timeout(kill, done.cancelled()).await.is_err() {
        warn!(pgid, "process group did not exit after KILL");
    }
}

/// Spawns transcoder children and wires up their monitoring tasks.
#[derive(Debug, Clone)]
pub struct Runner {
    binary: PathBuf,
    config: RunnerConfig,
}

impl Runner {
    pub fn new(binary: PathBuf, config: RunnerConfig) -> Self {
        Self { binary, config }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Spawn `spec` in its own process group and start the monitor tasks.
    ///
    /// Spawn failures surface immediately; later failures are delivered via
    /// [`Handle::wait`].
    pub async fn start(&self, spec: &RunnerSpec) -> Result<Handle> {
        spec.validate()?;
        crate::utils::fs::ensure_dir_all(&spec.work_dir).await?;

        let mut command = tokio_command(&self.binary);
        command
            .args(&spec.args)
            .current_dir(&spec.work_dir)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| Error::Runner(format!("failed to spawn {}: {e}", self.binary.display())))?;

        let pgid = child
            .id()
            .ok_or_else(|| Error::Runner("child exited before its pid was read".into()))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Runner("failed to capture child stderr".into()))?;

        debug!(
            binary = %self.binary.display(),
            input = %spec.input,
            work_dir = %spec.work_dir.display(),
            pgid,
            "transcoder spawned"
        );

        let ring = Arc::new(LineRing::new(STDERR_TAIL_LINES));
        let watchdog = Arc::new(Mutex::new(StallWatchdog::new(
            self.config.start_timeout,
            self.config.stall_timeout,
            Instant::now(),
        )));
        let (heartbeat_tx, heartbeat_rx) = mpsc::channel::<Heartbeat>(16);
        let (exit_tx, exit_rx) = watch::channel::<Option<ExitInfo>>(None);
        let done = CancellationToken::new();
        let kill_fallback = CancellationToken::new();

        // Stderr reader: ring + watchdog + lossy heartbeats.
        {
            let ring = ring.clone();
            let watchdog = watchdog.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let now = Instant::now();
                    let meaningful = watchdog.lock().observe_line(&line, now);
                    ring.push(line);
                    if meaningful {
                        // Senders drop rather than block.
                        let _ = heartbeat_tx.try_send(Heartbeat { at: now });
                    }
                }
            });
        }

        // Waiter: reaps the child exactly once and publishes the exit.
        {
            let done = done.clone();
            let kill_fallback = kill_fallback.clone();
            tokio::spawn(async move {
                let info = tokio::select! {
                    status = child.wait() => match status {
                        Ok(status) => ExitInfo { code: status.code() },
                        Err(e) => {
                            warn!(error = %e, "error waiting for transcoder");
                            ExitInfo { code: Some(-1) }
                        }
                    },
                    _ = kill_fallback.cancelled() => {
                        let _ = child.kill().await;
                        match child.wait().await {
                            Ok(status) => ExitInfo { code: status.code() },
                            Err(_) => ExitInfo { code: None },
                        }
                    }
                };
                let _ = exit_tx.send(Some(info));
                done.cancel();
            });
        }

        // Watchdog driver: own ticker, independent of the heartbeat channel.
        {
            let watchdog = watchdog.clone();
            let done = done.clone();
            let kill_fallback = kill_fallback.clone();
            let grace = self.config.stop_grace;
            let kill = self.config.stop_kill;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(WATCHDOG_TICK);
                loop {
                    tokio::select! {
                        _ = done.cancelled() => return,
                        _ = ticker.tick() => {}
                    }

                    let state = watchdog.lock().tick(Instant::now());
                    if state.is_fatal() {
                        warn!(state = state.as_str(), pgid, "watchdog verdict, terminating");
                        terminate_group(pgid, &kill_fallback, &done, grace, kill).await;
                        return;
                    }
                }
            });
        }

        Ok(Handle {
            pgid,
            kill_fallback,
            done,
            exit: exit_rx,
            progress: Mutex::new(Some(heartbeat_rx)),
            ring,
            watchdog,
            stopping: AtomicBool::new(false),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::profile::ProfileSpec;

    fn sh_runner(start_timeout: Duration, stall_timeout: Duration) -> Runner {
        Runner::new(
            PathBuf::from("/bin/sh"),
            RunnerConfig {
                start_timeout,
                stall_timeout,
                stop_grace: Duration::from_millis(500),
                stop_kill: Duration::from_millis(500),
                ..Default::default()
            },
        )
    }

    fn sh_spec(dir: &std::path::Path, script: &str) -> RunnerSpec {
        RunnerSpec {
            input: "test://input".into(),
            work_dir: dir.to_path_buf(),
            output_name: "playlist.m3u8".into(),
            args: vec!["-c".into(), script.into()],
            profile: ProfileSpec::default(),
        }
    }

    #[test]
    fn spec_validation_rejects_bad_output_names() {
        let dir = std::path::Path::new("/tmp");
        let mut spec = sh_spec(dir, "true");
        spec.output_name = String::new();
        assert!(spec.validate().is_err());

        spec.output_name = "out/".into();
        assert!(spec.validate().is_err());

        spec.output_name = "playlist.m3u8".into();
        assert!(spec.validate().is_ok());
    }

    #[tokio::test]
    async fn wait_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let runner = sh_runner(Duration::from_secs(10), Duration::from_secs(10));
        let handle = runner.start(&sh_spec(dir.path(), "exit 3")).await.unwrap();

        let info = handle.wait().await;
        assert_eq!(info.code, Some(3));
        assert!(handle.done().is_cancelled());
    }

    #[tokio::test]
    async fn stderr_tail_is_captured() {
        let dir = tempfile::tempdir().unwrap();
        let runner = sh_runner(Duration::from_secs(10), Duration::from_secs(10));
        let handle = runner
            .start(&sh_spec(dir.path(), "echo oops >&2; exit 1"))
            .await
            .unwrap();

        handle.wait().await;
        // Reader task races the waiter; give it a moment to drain.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.diagnostics().iter().any(|l| l.contains("oops")));
    }

    #[tokio::test]
    async fn heartbeats_flow_from_progress_lines() {
        let dir = tempfile::tempdir().unwrap();
        let runner = sh_runner(Duration::from_secs(10), Duration::from_secs(10));
        let handle = runner
            .start(&sh_spec(
                dir.path(),
                "echo out_time_ms=1000 >&2; echo total_size=4096 >&2; sleep 0.3",
            ))
            .await
            .unwrap();

        let mut progress = handle.take_progress().expect("first take");
        assert!(handle.take_progress().is_none(), "progress is taken once");

        let beat = tokio::time::timeout(Duration::from_secs(2), progress.recv())
            .await
            .expect("heartbeat within deadline");
        assert!(beat.is_some());

        handle.wait().await;
        assert_eq!(handle.watchdog_state(), WatchdogState::Running);
    }

    #[tokio::test]
    async fn stop_is_idempotent_under_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let runner = sh_runner(Duration::from_secs(30), Duration::from_secs(30));
        let handle = Arc::new(
            runner
                .start(&sh_spec(dir.path(), "sleep 30"))
                .await
                .unwrap(),
        );

        let h1 = handle.clone();
        let first = tokio::spawn(async move {
            h1.stop(Duration::from_secs(2), Duration::from_secs(2)).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let h2 = handle.clone();
        let second = tokio::spawn(async move {
            h2.stop(Duration::from_secs(2), Duration::from_secs(2)).await;
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            first.await.unwrap();
            second.await.unwrap();
        })
        .await
        .expect("both stops return");

        assert!(handle.done().is_cancelled());
    }

    #[tokio::test]
    async fn stop_reaps_the_whole_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("grandchild.pid");
        let script = format!(
            "sleep 10 & echo $! > {}; wait",
            pid_file.display()
        );

        let runner = sh_runner(Duration::from_secs(30), Duration::from_secs(30));
        let handle = runner.start(&sh_spec(dir.path(), &script)).await.unwrap();

        // Wait for the grandchild pid to land on disk.
        let mut pid = None;
        for _ in 0..50 {
            if let Ok(text) = std::fs::read_to_string(&pid_file)
                && let Ok(parsed) = text.trim().parse::<i32>()
            {
                pid = Some(parsed);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let pid = pid.expect("grandchild pid recorded");

        let started = Instant::now();
        handle.stop(Duration::from_secs(2), Duration::from_secs(2)).await;
        assert!(started.elapsed() < Duration::from_secs(5));

        // The grandchild must be gone shortly after stop returns.
        let mut alive = true;
        for _ in 0..20 {
            alive = unsafe { libc::kill(pid, 0) } == 0;
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(!alive, "grandchild survived the group stop");
    }

    #[tokio::test]
    async fn watchdog_kills_a_silent_child() {
        let dir = tempfile::tempdir().unwrap();
        let runner = sh_runner(Duration::from_millis(400), Duration::from_secs(30));
        let handle = runner
            .start(&sh_spec(dir.path(), "sleep 30"))
            .await
            .unwrap();

        let info = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("watchdog ends the child");
        assert_ne!(info.code, Some(0));
        assert_eq!(handle.watchdog_state(), WatchdogState::TimedOut);
    }
}
