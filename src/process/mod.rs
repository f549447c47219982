//! Local process supervision.
//!
//! [`ProcessManager`] runs a set of [`Program`]s as plain OS processes (no
//! container runtime involved), with the same lifecycle contract as a
//! stack: `initialize()` starts everything marked `autostart`,
//! `stop(force)` asks every program to exit, and `wait()` blocks until all
//! supervisors have finished.
//!
//! Each program gets one supervisor task:
//!
//! ```text
//! Stopped ─▶ Starting ──(startsecs)──▶ Running ──exit──▶ Exited
//!               │                                          │ autorestart
//!          quick exit ─▶ Backoff ─▶ Starting ...  ◀────────┘
//!               │
//!         retries spent ─▶ Fatal
//! ```

use crate::env;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Process supervision errors.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// Program definition error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// No program with that name
    #[error("no such program {0:?}")]
    NotFound(String),

    /// Manager used before `initialize()`
    #[error("process manager is not initialized")]
    NotInitialized,

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for process operations.
pub type Result<T> = std::result::Result<T, ProcessError>;

/// A supervised program definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Program {
    /// Unique program name
    pub name: String,
    /// Shell command line
    pub command: String,
    /// Working directory
    pub directory: Option<PathBuf>,
    /// Extra environment variables
    pub environment: BTreeMap<String, String>,
    /// Start when the manager initializes
    pub autostart: bool,
    /// Relaunch after the program exits on its own
    pub autorestart: bool,
    /// Seconds a program must stay up before it counts as running
    pub startsecs: u64,
    /// Quick exits tolerated before the program is marked fatal
    pub startretries: u32,
}

impl Default for Program {
    fn default() -> Self {
        Self {
            name: String::new(),
            command: String::new(),
            directory: None,
            environment: BTreeMap::new(),
            autostart: true,
            autorestart: false,
            startsecs: 1,
            startretries: 3,
        }
    }
}

impl Program {
    /// Create a program running `command` under `sh -c`.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            ..Default::default()
        }
    }
}

/// Supervisor view of a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramState {
    /// Not running, not scheduled
    Stopped,
    /// Launched, not yet up for `startsecs`
    Starting,
    /// Up for at least `startsecs`
    Running,
    /// Waiting to relaunch after an exit
    Backoff,
    /// Being asked to exit
    Stopping,
    /// Exited on its own and will not be relaunched
    Exited,
    /// Gave up after exhausting start retries
    Fatal,
}

impl ProgramState {
    /// Whether a supervisor task is still responsible for the program.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ProgramState::Starting
                | ProgramState::Running
                | ProgramState::Backoff
                | ProgramState::Stopping
        )
    }
}

struct ProgramHandle {
    program: Program,
    state: Arc<RwLock<ProgramState>>,
    stop: CancellationToken,
    force: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

/// Supervisor for a set of local programs.
#[derive(Default, Serialize, Deserialize)]
pub struct ProcessManager {
    /// Program definitions
    #[serde(default)]
    pub programs: Vec<Program>,
    #[serde(skip)]
    handles: DashMap<String, ProgramHandle>,
    #[serde(skip)]
    initialized: AtomicBool,
    #[serde(skip)]
    init_lock: Mutex<()>,
}

impl std::fmt::Debug for ProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessManager")
            .field("programs", &self.programs)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl ProcessManager {
    /// Create a manager for the given programs.
    pub fn new(programs: Vec<Program>) -> Self {
        Self {
            programs,
            ..Default::default()
        }
    }

    /// Whether `initialize()` has completed.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Register every program and start those marked `autostart`.
    ///
    /// Calling this again after success does nothing.
    ///
    /// # Errors
    ///
    /// Returns error if a program has no name, no command, or a duplicate name.
    pub fn initialize(&self) -> Result<()> {
        let _guard = self.init_lock.lock();
        if self.is_initialized() {
            return Ok(());
        }

        let mut seen = HashSet::new();
        for program in &self.programs {
            if program.name.is_empty() {
                return Err(ProcessError::ConfigError(
                    "program: must specify a name".to_string(),
                ));
            }
            if program.command.trim().is_empty() {
                return Err(ProcessError::ConfigError(format!(
                    "program {:?}: must specify a command",
                    program.name
                )));
            }
            if !seen.insert(program.name.as_str()) {
                return Err(ProcessError::ConfigError(format!(
                    "program {:?} is declared more than once",
                    program.name
                )));
            }
        }

        for program in &self.programs {
            self.handles.insert(
                program.name.clone(),
                ProgramHandle {
                    program: program.clone(),
                    state: Arc::new(RwLock::new(ProgramState::Stopped)),
                    stop: CancellationToken::new(),
                    force: Arc::new(AtomicBool::new(false)),
                    task: None,
                },
            );
        }

        self.initialized.store(true, Ordering::Release);
        info!(programs = self.programs.len(), "process manager initialized");

        for program in self.programs.iter().filter(|p| p.autostart) {
            self.start_program(&program.name)?;
        }

        Ok(())
    }

    /// Start one program; does nothing if it is already active.
    ///
    /// # Errors
    ///
    /// Returns error if the manager is not initialized or the name is unknown.
    pub fn start_program(&self, name: &str) -> Result<()> {
        if !self.is_initialized() {
            return Err(ProcessError::NotInitialized);
        }

        let mut handle = self
            .handles
            .get_mut(name)
            .ok_or_else(|| ProcessError::NotFound(name.to_string()))?;

        if handle.state.read().is_active() {
            debug!(program = %name, "program already active");
            return Ok(());
        }

        handle.stop = CancellationToken::new();
        handle.force.store(false, Ordering::Release);
        *handle.state.write() = ProgramState::Starting;

        let task = tokio::spawn(supervise(
            handle.program.clone(),
            handle.state.clone(),
            handle.stop.clone(),
            handle.force.clone(),
        ));
        handle.task = Some(task);

        Ok(())
    }

    /// Stop one program and wait for its supervisor to finish.
    ///
    /// # Errors
    ///
    /// Returns error if the manager is not initialized or the name is unknown.
    pub async fn stop_program(&self, name: &str, force: bool) -> Result<()> {
        let task = {
            let mut handle = self
                .handles
                .get_mut(name)
                .ok_or_else(|| ProcessError::NotFound(name.to_string()))?;
            handle.force.store(force, Ordering::Release);
            handle.stop.cancel();
            handle.task.take()
        };

        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(program = %name, error = %e, "program supervisor panicked");
            }
        }

        Ok(())
    }

    /// Current state of one program.
    pub fn status(&self, name: &str) -> Option<ProgramState> {
        self.handles.get(name).map(|h| *h.state.read())
    }

    /// Current state of every program, by name.
    pub fn statuses(&self) -> BTreeMap<String, ProgramState> {
        self.handles
            .iter()
            .map(|h| (h.key().clone(), *h.state.read()))
            .collect()
    }

    /// Ask every program to exit; `force` kills without a grace period.
    ///
    /// Returns immediately; use [`ProcessManager::wait`] to block until done.
    pub fn stop(&self, force: bool) {
        info!(force, "stopping all programs");
        for handle in self.handles.iter() {
            handle.force.store(force, Ordering::Release);
            handle.stop.cancel();
        }
    }

    /// Wait for every supervisor to finish.
    pub async fn wait(&self) {
        let tasks: Vec<(String, JoinHandle<()>)> = self
            .handles
            .iter_mut()
            .filter_map(|mut h| {
                let name = h.key().clone();
                h.task.take().map(|t| (name, t))
            })
            .collect();

        for (name, task) in tasks {
            if let Err(e) = task.await {
                error!(program = %name, error = %e, "program supervisor panicked");
            }
        }
    }
}

enum Outcome {
    Stopped,
    Exited(std::io::Result<std::process::ExitStatus>),
}

async fn supervise(
    program: Program,
    state: Arc<RwLock<ProgramState>>,
    stop: CancellationToken,
    force: Arc<AtomicBool>,
) {
    let set = |s: ProgramState| *state.write() = s;
    let startsecs = Duration::from_secs(program.startsecs);
    let mut retries: u32 = 0;

    loop {
        set(ProgramState::Starting);

        let mut child = match spawn(&program) {
            Ok(child) => child,
            Err(e) => {
                error!(program = %program.name, error = %e, "failed to spawn program");
                retries += 1;
                if retries > program.startretries {
                    set(ProgramState::Fatal);
                    return;
                }
                set(ProgramState::Backoff);
                if !sleep_unless_stopped(&stop, backoff(retries)).await {
                    set(ProgramState::Stopped);
                    return;
                }
                continue;
            }
        };

        info!(program = %program.name, pid = ?child.id(), "program started");
        let started = Instant::now();
        let mut up_timer = std::pin::pin!(tokio::time::sleep(startsecs));
        let mut up = false;

        let outcome = loop {
            tokio::select! {
                _ = &mut up_timer, if !up => {
                    up = true;
                    set(ProgramState::Running);
                }
                _ = stop.cancelled() => break Outcome::Stopped,
                status = child.wait() => break Outcome::Exited(status),
            }
        };

        match outcome {
            Outcome::Stopped => {
                set(ProgramState::Stopping);
                let grace = if force.load(Ordering::Acquire) {
                    Duration::ZERO
                } else {
                    env::timing::PROCESS_EXIT_MAX_WAIT
                };
                if let Err(e) = terminate(&mut child, grace).await {
                    warn!(program = %program.name, error = %e, "failed to terminate program");
                }
                info!(program = %program.name, "program stopped");
                set(ProgramState::Stopped);
                return;
            }
            Outcome::Exited(status) => {
                match &status {
                    Ok(s) => info!(program = %program.name, status = %s, "program exited"),
                    Err(e) => warn!(program = %program.name, error = %e, "program wait failed"),
                }

                if started.elapsed() < startsecs {
                    retries += 1;
                    if retries > program.startretries {
                        error!(program = %program.name, retries, "program exited too quickly, giving up");
                        set(ProgramState::Fatal);
                        return;
                    }
                } else {
                    retries = 0;
                    if !program.autorestart {
                        set(ProgramState::Exited);
                        return;
                    }
                }

                set(ProgramState::Backoff);
                if !sleep_unless_stopped(&stop, backoff(retries)).await {
                    set(ProgramState::Stopped);
                    return;
                }
            }
        }
    }
}

fn spawn(program: &Program) -> std::io::Result<Child> {
    let shell = which::which(env::container::DEFAULT_SHELL)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string()))?;

    let mut command = Command::new(shell);
    command
        .arg("-c")
        .arg(&program.command)
        .envs(&program.environment)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    command.process_group(0);

    if let Some(dir) = &program.directory {
        command.current_dir(dir);
    }

    let mut child = command.spawn()?;

    for (stream, reader) in [
        ("stdout", child.stdout.take().map(boxed)),
        ("stderr", child.stderr.take().map(boxed)),
    ] {
        if let Some(reader) = reader {
            let name = program.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(reader).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(program = %name, stream, "{}", line);
                }
            });
        }
    }

    Ok(child)
}

type OutputReader = Box<dyn AsyncRead + Send + Unpin>;

fn boxed<R: AsyncRead + Send + Unpin + 'static>(reader: R) -> OutputReader {
    Box::new(reader)
}

fn backoff(retries: u32) -> Duration {
    let jitter = rand::rng().random_range(0..250u64);
    env::timing::PROGRAM_BACKOFF * retries.max(1) + Duration::from_millis(jitter)
}

/// Sleep for `delay`; returns false if `stop` fired first.
async fn sleep_unless_stopped(stop: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = stop.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Ask a child (and its process group) to exit, killing it after `grace`.
///
/// A zero grace period kills immediately. Already-exited children succeed.
pub(crate) async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<()> {
    if child.try_wait()?.is_some() {
        return Ok(());
    }

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        // Negative pid addresses the whole process group.
        let group = Pid::from_raw(-(pid as i32));

        if !grace.is_zero() {
            if let Err(e) = kill(group, Signal::SIGTERM) {
                debug!(pid, error = %e, "failed to send SIGTERM");
            }
            if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                return Ok(());
            }
            warn!(pid, "process ignored SIGTERM, killing");
        }

        if let Err(e) = kill(group, Signal::SIGKILL) {
            debug!(pid, error = %e, "failed to send SIGKILL");
        }
    }

    match child.kill().await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn wait_for_state(manager: &ProcessManager, name: &str, want: ProgramState) -> bool {
        for _ in 0..100 {
            if manager.status(name) == Some(want) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    fn quick(name: &str, command: &str) -> Program {
        Program {
            startsecs: 0,
            ..Program::new(name, command)
        }
    }

    #[test]
    fn test_program_defaults() {
        let program = Program::new("db", "sleep 1");
        assert!(program.autostart);
        assert!(!program.autorestart);
        assert_eq!(program.startsecs, 1);
        assert_eq!(program.startretries, 3);
    }

    #[test]
    fn test_program_deserialize_defaults() {
        let program: Program = serde_yaml::from_str("name: db\ncommand: redis-server\n").unwrap();
        assert_eq!(program.name, "db");
        assert!(program.autostart);
        assert_eq!(program.startretries, 3);
    }

    #[tokio::test]
    async fn test_initialize_rejects_bad_programs() {
        let manager = ProcessManager::new(vec![Program::new("", "sleep 1")]);
        assert!(matches!(manager.initialize(), Err(ProcessError::ConfigError(_))));

        let manager = ProcessManager::new(vec![Program::new("a", " ")]);
        assert!(matches!(manager.initialize(), Err(ProcessError::ConfigError(_))));

        let manager =
            ProcessManager::new(vec![Program::new("a", "sleep 1"), Program::new("a", "sleep 1")]);
        assert!(matches!(manager.initialize(), Err(ProcessError::ConfigError(_))));
        assert!(!manager.is_initialized());
    }

    #[tokio::test]
    async fn test_start_before_initialize() {
        let manager = ProcessManager::new(vec![Program::new("a", "sleep 1")]);
        assert!(matches!(
            manager.start_program("a"),
            Err(ProcessError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_autostart_and_stop() {
        let manager = ProcessManager::new(vec![
            quick("sleeper", "sleep 30"),
            Program {
                autostart: false,
                ..quick("idle", "sleep 30")
            },
        ]);
        manager.initialize().unwrap();
        manager.initialize().unwrap();

        assert!(wait_for_state(&manager, "sleeper", ProgramState::Running).await);
        assert_eq!(manager.status("idle"), Some(ProgramState::Stopped));

        manager.stop(false);
        tokio::time::timeout(Duration::from_secs(5), manager.wait())
            .await
            .expect("programs did not stop");
        assert_eq!(manager.status("sleeper"), Some(ProgramState::Stopped));
    }

    #[tokio::test]
    async fn test_start_and_stop_single_program() {
        let manager = ProcessManager::new(vec![Program {
            autostart: false,
            ..quick("idle", "sleep 30")
        }]);
        manager.initialize().unwrap();

        manager.start_program("idle").unwrap();
        assert!(wait_for_state(&manager, "idle", ProgramState::Running).await);

        manager.stop_program("idle", true).await.unwrap();
        assert_eq!(manager.status("idle"), Some(ProgramState::Stopped));

        assert!(matches!(
            manager.stop_program("nope", false).await,
            Err(ProcessError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_exit_without_autorestart() {
        let manager = ProcessManager::new(vec![quick("once", "true")]);
        manager.initialize().unwrap();
        assert!(wait_for_state(&manager, "once", ProgramState::Exited).await);
    }

    #[tokio::test]
    async fn test_autorestart_relaunches() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("runs");
        let manager = ProcessManager::new(vec![Program {
            autorestart: true,
            ..quick("loop", format!("echo run >> {}", marker.display()).as_str())
        }]);
        manager.initialize().unwrap();

        tokio::time::sleep(Duration::from_millis(2600)).await;
        manager.stop(false);
        manager.wait().await;

        let runs = std::fs::read_to_string(&marker).unwrap();
        assert!(runs.lines().count() >= 2, "expected relaunches, got {:?}", runs);
    }

    #[tokio::test]
    async fn test_quick_exits_become_fatal() {
        let manager = ProcessManager::new(vec![Program {
            startsecs: 5,
            startretries: 1,
            ..Program::new("flaky", "exit 1")
        }]);
        manager.initialize().unwrap();
        assert!(wait_for_state(&manager, "flaky", ProgramState::Fatal).await);
    }

    #[tokio::test]
    async fn test_terminate_exited_child() {
        let mut child = Command::new("true").spawn().unwrap();
        child.wait().await.unwrap();
        assert!(terminate(&mut child, Duration::from_secs(1)).await.is_ok());
    }
}
