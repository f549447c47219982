//! Stacks: named sets of containers run and monitored as a unit.
//!
//! ```text
//! Unvalidated ──validate()──▶ Validated ──run()──▶ Running ──stop()──▶ Stopping ──▶ Stopped
//! ```
//!
//! [`Stack::validate`] builds one [`Container`] per declared config, picking
//! the backend from its engine string. [`Stack::run`] starts every container
//! concurrently, waits for each to report an address, then polls liveness
//! until [`Stack::stop`] (or the cancellation token passed to `run`) ends
//! it. Teardown stops every container and reports all failures together.
//!
//! Individual containers can be started, stopped and restarted while the
//! monitor loop runs.

mod engine;

pub use engine::{EngineKind, EngineSpec};

use crate::container::{
    Container, ContainerConfig, ContainerError, LogOptions, OverflowPolicy, ScriptContainer,
    Scripts, parse_duration,
};
use crate::env;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(feature = "containers")]
use crate::container::DockerContainer;

#[cfg(feature = "kubernetes")]
use crate::container::KubernetesContainer;

/// Stack errors.
#[derive(Debug, thiserror::Error)]
pub enum StackError {
    /// Stack definition error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Engine family not known or not compiled in
    #[error("unsupported engine {0:?}")]
    UnsupportedEngine(String),

    /// Engine string is not a valid URI
    #[error("invalid engine {engine:?}: {reason}")]
    InvalidEngine { engine: String, reason: String },

    /// Two containers share a name
    #[error("container name {0:?} is declared more than once")]
    DuplicateName(String),

    /// `run()` called before `validate()`
    #[error("stack has not been validated")]
    NotValidated,

    /// `run()` called while already running
    #[error("stack is already running")]
    AlreadyRunning,

    /// No container with that name
    #[error("no such container {0:?}")]
    NoSuchContainer(String),

    /// Start phase did not finish within the stack start timeout
    #[error("stack did not start within {0:?}")]
    StartTimeout(Duration),

    /// Container started but never reported an address
    #[error("container {0} did not stay running")]
    DidNotStayRunning(String),

    /// Start aborted by an interrupt
    #[error("container {0} start interrupted")]
    Interrupted(String),

    /// A container operation failed
    #[error("container {name}: {source}")]
    Container {
        name: String,
        #[source]
        source: ContainerError,
    },

    /// One or more containers failed to stop
    #[error(transparent)]
    Teardown(#[from] TeardownError),
}

/// Result type for stack operations.
pub type Result<T> = std::result::Result<T, StackError>;

/// Every failure seen while stopping a stack's containers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownError {
    /// Container name and error message, per failed container
    pub failures: Vec<(String, String)>,
}

impl fmt::Display for TeardownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to stop {} container(s)", self.failures.len())?;
        for (i, (name, message)) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{}: {}", sep, name, message)?;
        }
        Ok(())
    }
}

impl std::error::Error for TeardownError {}

/// Polling intervals and waits used by a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// How long a started container has to report an address
    pub start_wait: Duration,
    /// Interval between checks while waiting for a start
    pub start_check_interval: Duration,
    /// Interval of the liveness monitor loop
    pub monitor_interval: Duration,
    /// Interval between checks while waiting for a container to stop
    pub restart_poll_interval: Duration,
    /// Interval between checks while waiting for the whole stack to stop
    pub stop_poll_interval: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            start_wait: env::timing::DEFAULT_START_WAIT,
            start_check_interval: env::timing::START_CHECK_INTERVAL,
            monitor_interval: env::timing::MONITOR_INTERVAL,
            restart_poll_interval: env::timing::RESTART_POLL_INTERVAL,
            stop_poll_interval: env::timing::STOP_ALL_POLL_INTERVAL,
        }
    }
}

/// Last observed state of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    pub engine: String,
    pub id: String,
    pub running: bool,
    pub address: String,
}

/// Snapshot of a stack for status reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackStatus {
    pub id: String,
    pub name: String,
    /// Whether `run()` is active
    pub running: bool,
    pub containers: Vec<ContainerStatus>,
}

type StopReply = std::result::Result<(), TeardownError>;

struct RunControl {
    active: bool,
    shutdown: CancellationToken,
    waiters: Vec<oneshot::Sender<StopReply>>,
}

/// State built by `validate()` and shared by the running tasks.
struct Runtime {
    validated: bool,
    start_timeout: Duration,
    containers: BTreeMap<String, Arc<Container>>,
    prestart: Vec<Arc<Container>>,
    states: DashMap<String, bool>,
    addrs: DashMap<String, String>,
    control: Mutex<RunControl>,
    timings: Timings,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            validated: false,
            start_timeout: env::timing::DEFAULT_STACK_START_TIMEOUT,
            containers: BTreeMap::new(),
            prestart: Vec::new(),
            states: DashMap::new(),
            addrs: DashMap::new(),
            control: Mutex::new(RunControl {
                active: false,
                shutdown: CancellationToken::new(),
                waiters: Vec::new(),
            }),
            timings: Timings::default(),
        }
    }
}

/// Marks `run()` inactive however it exits; pending `stop()` callers whose
/// reply sender is dropped here fall back to a direct teardown.
struct ActiveGuard<'a>(&'a Mutex<RunControl>);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let mut control = self.0.lock();
        control.active = false;
        control.waiters.clear();
    }
}

/// A named set of containers.
#[derive(Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Stack {
    /// Stable id; assigned at validation when empty
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Engine used by containers that do not name one
    pub engine: String,
    /// Named inline scripts for script containers
    pub scripts: BTreeMap<String, String>,
    /// Containers run to completion, in order, before the main set
    pub prestart: Vec<ContainerConfig>,
    /// Main containers
    pub containers: Vec<ContainerConfig>,
    /// Start timeout, e.g. `30s`
    pub timeout: String,
    /// Log buffer capacity per container; 0 uses the default
    pub log_buffer: usize,
    /// What a full log buffer does with new lines
    pub log_overflow: OverflowPolicy,
    #[serde(skip)]
    runtime: Runtime,
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("engine", &self.engine)
            .field("containers", &self.container_names())
            .field("validated", &self.runtime.validated)
            .finish()
    }
}

impl Stack {
    /// Create an empty stack.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Override the stack's polling intervals.
    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.runtime.timings = timings;
        self
    }

    /// Whether `validate()` has succeeded.
    pub fn is_validated(&self) -> bool {
        self.runtime.validated
    }

    /// Resolved start timeout.
    pub fn start_timeout(&self) -> Duration {
        self.runtime.start_timeout
    }

    /// Build the container set.
    ///
    /// Assigns an id when missing, names unnamed containers
    /// `<id>-container-<index>` (`<id>-prestart-<index>` for prestart
    /// containers), resolves every engine string and validates every
    /// container. Runs at most once; later calls return immediately.
    ///
    /// # Errors
    ///
    /// Returns error on a bad timeout, an unknown engine, a duplicate
    /// container name, or an invalid container config.
    pub fn validate(&mut self) -> Result<()> {
        if self.runtime.validated {
            return Ok(());
        }

        if self.id.is_empty() {
            self.id = uuid::Uuid::new_v4().to_string();
        }

        let start_timeout = if self.timeout.is_empty() {
            env::timing::DEFAULT_STACK_START_TIMEOUT
        } else {
            parse_duration(&self.timeout).unwrap_or_else(|e| {
                warn!(
                    stack = %self.id,
                    timeout = %self.timeout,
                    error = %e,
                    "invalid stack timeout, using default"
                );
                env::timing::DEFAULT_STACK_START_TIMEOUT
            })
        };

        let scripts: Scripts = Arc::new(self.scripts.clone());
        let logs = LogOptions {
            capacity: if self.log_buffer == 0 {
                env::LOG_BUFFER_CAPACITY
            } else {
                self.log_buffer
            },
            overflow: self.log_overflow,
        };

        let mut seen = HashSet::new();
        let mut prestart = Vec::with_capacity(self.prestart.len());
        for (index, config) in self.prestart.iter_mut().enumerate() {
            if config.name.is_empty() {
                config.name = format!("{}-prestart-{}", self.id, index);
            }
            if !seen.insert(config.name.clone()) {
                return Err(StackError::DuplicateName(config.name.clone()));
            }
            prestart.push(Arc::new(build_container(
                config.clone(),
                &self.engine,
                &scripts,
                logs,
            )?));
        }

        let mut containers = BTreeMap::new();
        for (index, config) in self.containers.iter_mut().enumerate() {
            if config.name.is_empty() {
                config.name = format!("{}-container-{}", self.id, index);
            }
            if !seen.insert(config.name.clone()) {
                return Err(StackError::DuplicateName(config.name.clone()));
            }
            let container = build_container(config.clone(), &self.engine, &scripts, logs)?;
            containers.insert(config.name.clone(), Arc::new(container));
        }

        for container in prestart.iter().chain(containers.values()) {
            container
                .validate()
                .map_err(|source| StackError::Container {
                    name: container.name(),
                    source,
                })?;
        }

        for name in containers.keys() {
            self.runtime.states.insert(name.clone(), false);
            self.runtime.addrs.insert(name.clone(), String::new());
        }

        self.runtime.start_timeout = start_timeout;
        self.runtime.containers = containers;
        self.runtime.prestart = prestart;
        self.runtime.validated = true;

        info!(stack = %self.id, name = %self.name, containers = self.runtime.containers.len(), "stack validated");
        Ok(())
    }

    /// Run the stack until stopped.
    ///
    /// Runs prestart containers, starts the main set concurrently, then
    /// monitors liveness until [`Stack::stop`] is called or `cancel` fires,
    /// and finally tears every container down.
    ///
    /// A failed start phase returns its error without stopping containers
    /// that did start; call [`Stack::stop`] to clean them up.
    ///
    /// # Errors
    ///
    /// Returns the first start failure, [`StackError::StartTimeout`], or the
    /// aggregated teardown failures.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        if !self.runtime.validated {
            return Err(StackError::NotValidated);
        }

        let shutdown = {
            let mut control = self.runtime.control.lock();
            if control.active {
                return Err(StackError::AlreadyRunning);
            }
            control.active = true;
            control.shutdown = CancellationToken::new();
            control.shutdown.clone()
        };
        let _guard = ActiveGuard(&self.runtime.control);

        let outcome = self.run_until_stopped(&cancel, &shutdown).await;

        let teardown = match &outcome {
            Ok(()) => Some(self.teardown().await),
            Err(e) => {
                error!(stack = %self.id, error = %e, "stack failed to start");
                None
            }
        };

        let waiters = {
            let mut control = self.runtime.control.lock();
            control.active = false;
            std::mem::take(&mut control.waiters)
        };

        if !waiters.is_empty() {
            let reply = match &teardown {
                Some(reply) => reply.clone(),
                None => self.teardown().await,
            };
            for waiter in waiters {
                let _ = waiter.send(reply.clone());
            }
        }

        outcome?;
        match teardown {
            Some(reply) => reply.map_err(StackError::Teardown),
            None => Ok(()),
        }
    }

    async fn run_until_stopped(
        &self,
        cancel: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        info!(stack = %self.id, name = %self.name, "starting stack");

        self.run_prestart(cancel, shutdown).await?;
        self.start_all(cancel, shutdown).await?;
        self.refresh().await;

        info!(stack = %self.id, "stack running");
        self.monitor(cancel, shutdown).await;

        Ok(())
    }

    async fn run_prestart(
        &self,
        cancel: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let limit = self.runtime.start_timeout;
        let interval = self.runtime.timings.start_check_interval;

        for container in &self.runtime.prestart {
            let name = container.name();
            debug!(stack = %self.id, container = %name, "running prestart container");

            container
                .start()
                .await
                .map_err(|source| StackError::Container {
                    name: name.clone(),
                    source,
                })?;

            let finished = async {
                while container.is_running().await {
                    tokio::time::sleep(interval).await;
                }
            };

            let result = tokio::select! {
                biased;
                _ = interrupted(cancel, shutdown) => Err(StackError::Interrupted(name.clone())),
                done = tokio::time::timeout(limit, finished) => {
                    done.map_err(|_| StackError::StartTimeout(limit))
                }
            };

            if let Err(e) = container.stop().await {
                warn!(stack = %self.id, container = %name, error = %e, "failed to remove prestart container");
            }
            result?;
        }

        Ok(())
    }

    async fn start_all(
        &self,
        cancel: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let mut starts = JoinSet::new();
        for container in self.runtime.containers.values() {
            starts.spawn(start_one(
                container.clone(),
                cancel.clone(),
                shutdown.clone(),
                self.runtime.timings,
            ));
        }

        let limit = self.runtime.start_timeout;
        let joined = tokio::time::timeout(limit, async {
            while let Some(joined) = starts.join_next().await {
                match joined {
                    Ok(result) => result?,
                    Err(e) => {
                        return Err(StackError::ConfigError(format!(
                            "container start task failed: {}",
                            e
                        )));
                    }
                }
            }
            Ok(())
        })
        .await;

        match joined {
            Ok(result) => result,
            Err(_) => Err(StackError::StartTimeout(limit)),
        }
    }

    async fn monitor(&self, cancel: &CancellationToken, shutdown: &CancellationToken) {
        let interval = self.runtime.timings.monitor_interval;
        loop {
            tokio::select! {
                _ = interrupted(cancel, shutdown) => break,
                _ = tokio::time::sleep(interval) => self.refresh().await,
            }
        }
        debug!(stack = %self.id, "monitor loop exited");
    }

    /// Probe every container and record the observed state.
    ///
    /// A probe whose container was stopped or restarted meanwhile (its id
    /// changed) is discarded so it cannot overwrite the newer state.
    async fn refresh(&self) {
        let probes = self.runtime.containers.iter().map(|(name, container)| async move {
            let id = container.id();
            let address = container.address().await;
            let running = !address.is_empty() || container.is_running().await;
            (name, container, id, running, address)
        });

        for (name, container, id, running, address) in join_all(probes).await {
            self.record(name, container, &id, running, address);
        }
    }

    /// Store one probe result unless the container's id moved on since
    /// `probed_id` was read.
    fn record(
        &self,
        name: &str,
        container: &Container,
        probed_id: &str,
        running: bool,
        address: String,
    ) {
        if container.id() != probed_id {
            debug!(stack = %self.id, container = %name, "discarding stale probe");
            return;
        }
        container.set_running(running);
        self.runtime.states.insert(name.to_string(), running);
        self.runtime.addrs.insert(name.to_string(), address);
    }

    async fn teardown(&self) -> StopReply {
        info!(stack = %self.id, "stopping stack");

        let stops = self
            .runtime
            .containers
            .iter()
            .map(|(name, container)| async move { (name, container, container.stop().await) });

        let mut failures = Vec::new();
        for (name, container, result) in join_all(stops).await {
            container.set_running(false);
            self.runtime.states.insert(name.clone(), false);
            self.runtime.addrs.insert(name.clone(), String::new());
            if let Err(e) = result {
                warn!(stack = %self.id, container = %name, error = %e, "failed to stop container");
                failures.push((name.clone(), e.to_string()));
            }
        }

        if failures.is_empty() {
            info!(stack = %self.id, "stack stopped");
            Ok(())
        } else {
            Err(TeardownError { failures })
        }
    }

    /// Stop the stack and wait for teardown to finish.
    ///
    /// While `run()` is active this signals its monitor loop and waits for
    /// the teardown it performs. Otherwise the containers are stopped
    /// directly, which also cleans up after a failed start.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::Teardown`] listing every container that failed
    /// to stop.
    pub async fn stop(&self) -> Result<()> {
        let reply = {
            let mut control = self.runtime.control.lock();
            if control.active {
                let (tx, rx) = oneshot::channel();
                control.waiters.push(tx);
                control.shutdown.cancel();
                Some(rx)
            } else {
                None
            }
        };

        let result = match reply {
            Some(rx) => match rx.await {
                Ok(result) => result,
                Err(_) => self.teardown().await,
            },
            None => self.teardown().await,
        };

        result.map_err(StackError::Teardown)
    }

    /// Whether any container was last observed running.
    pub fn has_running_containers(&self) -> bool {
        self.runtime.states.iter().any(|state| *state.value())
    }

    /// Wait until no container is observed running; false on timeout.
    pub async fn wait_for_shutdown(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while self.has_running_containers() {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.runtime.timings.stop_poll_interval).await;
        }
        true
    }

    /// Whether `run()` is active.
    pub fn is_active(&self) -> bool {
        self.runtime.control.lock().active
    }

    /// A container by name.
    pub fn container(&self, name: &str) -> Option<Arc<Container>> {
        self.runtime.containers.get(name).cloned()
    }

    /// Names of the main containers, sorted.
    pub fn container_names(&self) -> Vec<String> {
        self.runtime.containers.keys().cloned().collect()
    }

    fn lookup(&self, name: &str) -> Result<&Arc<Container>> {
        self.runtime
            .containers
            .get(name)
            .ok_or_else(|| StackError::NoSuchContainer(name.to_string()))
    }

    /// Start one container.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::NoSuchContainer`] for unknown names, or the
    /// container's start error.
    pub async fn start_container(&self, name: &str) -> Result<()> {
        let container = self.lookup(name)?;
        container
            .start()
            .await
            .map_err(|source| StackError::Container {
                name: name.to_string(),
                source,
            })?;
        info!(stack = %self.id, container = %name, "container started");
        Ok(())
    }

    /// Stop one container.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::NoSuchContainer`] for unknown names, or the
    /// container's stop error.
    pub async fn stop_container(&self, name: &str) -> Result<()> {
        let container = self.lookup(name)?;
        container
            .stop()
            .await
            .map_err(|source| StackError::Container {
                name: name.to_string(),
                source,
            })?;

        container.set_running(false);
        self.runtime.states.insert(name.to_string(), false);
        self.runtime.addrs.insert(name.to_string(), String::new());
        info!(stack = %self.id, container = %name, "container stopped");
        Ok(())
    }

    /// Stop one container, wait until it is observed down, then start it.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::NoSuchContainer`] for unknown names,
    /// [`StackError::DidNotStayRunning`] if it never goes down, or the
    /// container's stop/start error.
    pub async fn restart_container(&self, name: &str) -> Result<()> {
        self.stop_container(name).await?;
        if !self.wait_for_container_stop(name).await? {
            return Err(StackError::DidNotStayRunning(name.to_string()));
        }
        self.start_container(name).await
    }

    /// Poll until the container is not running; false if it stays up for
    /// the whole start wait.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::NoSuchContainer`] for unknown names.
    pub async fn wait_for_container_stop(&self, name: &str) -> Result<bool> {
        let container = self.lookup(name)?;
        let deadline = Instant::now() + self.runtime.timings.start_wait;

        while container.is_running().await {
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(self.runtime.timings.restart_poll_interval).await;
        }

        Ok(true)
    }

    /// Live liveness probe of one container.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::NoSuchContainer`] for unknown names.
    pub async fn is_running(&self, name: &str) -> Result<bool> {
        Ok(self.lookup(name)?.is_running().await)
    }

    /// Live address of one container; empty while not running.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::NoSuchContainer`] for unknown names.
    pub async fn address(&self, name: &str) -> Result<String> {
        Ok(self.lookup(name)?.address().await)
    }

    /// Snapshot of the last observed state.
    pub fn status(&self) -> StackStatus {
        let containers = self
            .runtime
            .containers
            .iter()
            .map(|(name, container)| ContainerStatus {
                name: name.clone(),
                engine: container.engine().to_string(),
                id: container.id(),
                running: self.runtime.states.get(name).is_some_and(|s| *s),
                address: self
                    .runtime
                    .addrs
                    .get(name)
                    .map(|a| a.clone())
                    .unwrap_or_default(),
            })
            .collect();

        StackStatus {
            id: self.id.clone(),
            name: self.name.clone(),
            running: self.is_active(),
            containers,
        }
    }
}

/// Construct the backend named by a container's engine string.
fn build_container(
    config: ContainerConfig,
    default_engine: &str,
    scripts: &Scripts,
    logs: LogOptions,
) -> Result<Container> {
    let engine = [config.engine.as_str(), default_engine]
        .into_iter()
        .find(|e| !e.is_empty())
        .unwrap_or(env::container::DEFAULT_RUNTIME);
    let spec = EngineSpec::parse(engine)?;
    debug!(container = %config.name, engine = %spec, "resolved engine");

    match spec.kind {
        EngineKind::Shell => Ok(Container::Script(ScriptContainer::new(
            config,
            spec.argument,
            Some(scripts.clone()),
            logs,
        ))),
        #[cfg(feature = "containers")]
        EngineKind::Docker => Ok(Container::Docker(DockerContainer::new(
            config,
            spec.variant,
            spec.argument,
            logs,
        ))),
        #[cfg(feature = "kubernetes")]
        EngineKind::Kubernetes => Ok(Container::Kubernetes(KubernetesContainer::new(
            config,
            spec.argument,
            logs,
        ))),
        #[allow(unreachable_patterns)]
        kind => Err(StackError::UnsupportedEngine(kind.to_string())),
    }
}

async fn interrupted(cancel: &CancellationToken, shutdown: &CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = shutdown.cancelled() => {}
    }
}

/// Start one container and wait for it to report an address.
async fn start_one(
    container: Arc<Container>,
    cancel: CancellationToken,
    shutdown: CancellationToken,
    timings: Timings,
) -> Result<()> {
    let name = container.name();

    let ready = async {
        container
            .start()
            .await
            .map_err(|source| StackError::Container {
                name: name.clone(),
                source,
            })?;

        let deadline = Instant::now() + timings.start_wait;
        loop {
            if !container.address().await.is_empty() {
                debug!(container = %name, "container reported an address");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(StackError::DidNotStayRunning(name.clone()));
            }
            tokio::time::sleep(timings.start_check_interval).await;
        }
    };

    tokio::select! {
        biased;
        _ = interrupted(&cancel, &shutdown) => {
            if let Err(e) = container.stop().await {
                warn!(container = %name, error = %e, "failed to stop interrupted container");
            }
            Err(StackError::Interrupted(name.clone()))
        }
        result = ready => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> Timings {
        Timings {
            start_wait: Duration::from_secs(2),
            start_check_interval: Duration::from_millis(25),
            monitor_interval: Duration::from_millis(50),
            restart_poll_interval: Duration::from_millis(25),
            stop_poll_interval: Duration::from_millis(25),
        }
    }

    fn script(name: &str) -> ContainerConfig {
        ContainerConfig {
            name: name.to_string(),
            engine: format!("shell://{}", name),
            ..Default::default()
        }
    }

    fn script_stack(scripts: &[(&str, &str)]) -> Stack {
        let mut stack = Stack::new("test").with_timings(fast());
        for (name, body) in scripts {
            stack.scripts.insert(name.to_string(), body.to_string());
            stack.containers.push(script(name));
        }
        stack
    }

    #[test]
    fn test_validate_names_unnamed_containers() {
        let mut stack = Stack::new("test");
        stack.engine = "shell://".to_string();
        stack.containers = vec![ContainerConfig::default(), ContainerConfig::default()];

        stack.validate().unwrap();
        let id = stack.id.clone();
        assert!(!id.is_empty());
        assert_eq!(
            stack.container_names(),
            vec![format!("{}-container-0", id), format!("{}-container-1", id)]
        );

        stack.validate().unwrap();
        assert_eq!(stack.id, id);
        assert_eq!(stack.container_names().len(), 2);
    }

    #[test]
    fn test_validate_keeps_explicit_id() {
        let mut stack = script_stack(&[("web", "sleep 1")]);
        stack.id = "fixed".to_string();
        stack.validate().unwrap();
        assert_eq!(stack.id, "fixed");
        assert!(stack.is_validated());
    }

    #[test]
    fn test_duplicate_names_fail() {
        let mut stack = script_stack(&[("web", "sleep 1")]);
        stack.containers.push(script("web"));
        assert!(matches!(
            stack.validate(),
            Err(StackError::DuplicateName(name)) if name == "web"
        ));
        assert!(!stack.is_validated());
    }

    #[test]
    fn test_unknown_engine_fails() {
        let mut stack = Stack::new("test");
        stack.containers.push(ContainerConfig::new("web", "nginx").with_engine("carrierpigeon://"));
        assert!(matches!(
            stack.validate(),
            Err(StackError::UnsupportedEngine(_))
        ));
    }

    #[test]
    fn test_bad_timeout_uses_default() {
        for timeout in ["soon", "9999999999999999999h"] {
            let mut stack = script_stack(&[("web", "sleep 1")]);
            stack.timeout = timeout.to_string();
            stack.validate().unwrap();
            assert_eq!(
                stack.start_timeout(),
                env::timing::DEFAULT_STACK_START_TIMEOUT
            );
        }
    }

    #[test]
    fn test_compound_timeout_is_parsed() {
        let mut stack = script_stack(&[("web", "sleep 1")]);
        stack.timeout = "1m30s".to_string();
        stack.validate().unwrap();
        assert_eq!(stack.start_timeout(), Duration::from_secs(90));

        let mut stack = script_stack(&[("web", "sleep 1")]);
        stack.timeout = "1.5s".to_string();
        stack.validate().unwrap();
        assert_eq!(stack.start_timeout(), Duration::from_millis(1500));
    }

    #[test]
    fn test_timeout_is_parsed() {
        let mut stack = script_stack(&[("web", "sleep 1")]);
        stack.timeout = "5s".to_string();
        stack.validate().unwrap();
        assert_eq!(stack.start_timeout(), Duration::from_secs(5));
    }

    #[cfg(feature = "containers")]
    #[test]
    fn test_docker_engine_dispatch() {
        let mut stack = Stack::new("test");
        stack.engine = "docker://".to_string();
        stack.containers.push(ContainerConfig::new("web", "nginx"));
        stack.validate().unwrap();

        let container = stack.container("web").unwrap();
        assert!(matches!(&*container, Container::Docker(_)));
        assert_eq!(container.engine(), "docker");
    }

    #[cfg(feature = "containers")]
    #[test]
    fn test_default_engine_is_docker() {
        let mut stack = Stack::new("test");
        stack.containers.push(ContainerConfig::new("web", "nginx"));
        stack.validate().unwrap();
        assert_eq!(stack.container("web").unwrap().engine(), "docker");
    }

    #[cfg(feature = "containers")]
    #[test]
    fn test_container_config_error_fails_validate() {
        let mut stack = Stack::new("test");
        stack.containers.push(ContainerConfig::new("web", "").with_engine("docker://"));
        assert!(matches!(
            stack.validate(),
            Err(StackError::Container { name, .. }) if name == "web"
        ));
    }

    #[cfg(feature = "kubernetes")]
    #[test]
    fn test_kubernetes_engine_dispatch() {
        let mut stack = Stack::new("test");
        stack
            .containers
            .push(ContainerConfig::new("web", "nginx").with_engine("kubernetes://myns"));
        stack.validate().unwrap();

        match &*stack.container("web").unwrap() {
            Container::Kubernetes(k8s) => assert_eq!(k8s.namespace(), "myns"),
            other => panic!("unexpected backend {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_requires_validate() {
        let stack = script_stack(&[("web", "sleep 30")]);
        assert!(matches!(
            stack.run(CancellationToken::new()).await,
            Err(StackError::NotValidated)
        ));
    }

    async fn wait_running(stack: &Stack) {
        for _ in 0..100 {
            if stack.has_running_containers() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("stack never reported running containers");
    }

    #[tokio::test]
    async fn test_run_and_stop() {
        let mut stack = script_stack(&[("web", "sleep 30"), ("db", "sleep 30")]);
        stack.validate().unwrap();
        let stack = Arc::new(stack);

        let runner = {
            let stack = stack.clone();
            tokio::spawn(async move { stack.run(CancellationToken::new()).await })
        };

        wait_running(&stack).await;
        assert!(stack.is_active());
        assert_eq!(stack.address("web").await.unwrap(), "localhost");

        let status = stack.status();
        assert!(status.running);
        assert_eq!(status.containers.len(), 2);
        assert!(status.containers.iter().all(|c| c.engine == "shell"));

        tokio::time::timeout(Duration::from_secs(10), stack.stop())
            .await
            .expect("stop did not return")
            .unwrap();
        assert!(!stack.has_running_containers());
        assert!(!stack.is_running("web").await.unwrap());

        runner.await.unwrap().unwrap();
        assert!(!stack.is_active());
    }

    #[tokio::test]
    async fn test_cancel_ends_run() {
        let mut stack = script_stack(&[("web", "sleep 30")]);
        stack.validate().unwrap();
        let stack = Arc::new(stack);
        let cancel = CancellationToken::new();

        let runner = {
            let stack = stack.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { stack.run(cancel).await })
        };

        wait_running(&stack).await;
        cancel.cancel();
        runner.await.unwrap().unwrap();
        assert!(!stack.has_running_containers());
    }

    #[tokio::test]
    async fn test_interrupt_before_start_reports_interrupted() {
        let mut stack = script_stack(&[("web", "sleep 30")]);
        stack.validate().unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            stack.run(cancel).await,
            Err(StackError::Interrupted(name)) if name == "web"
        ));
        assert!(!stack.is_running("web").await.unwrap());
    }

    #[tokio::test]
    async fn test_exiting_container_did_not_stay_running() {
        let mut stack = script_stack(&[("web", "exit 0")]);
        stack.runtime.timings.start_wait = Duration::from_millis(300);
        stack.validate().unwrap();

        assert!(matches!(
            stack.run(CancellationToken::new()).await,
            Err(StackError::DidNotStayRunning(name)) if name == "web"
        ));
        assert!(!stack.is_active());
    }

    #[tokio::test]
    async fn test_start_timeout() {
        let mut stack = script_stack(&[("web", "exit 0")]);
        stack.timeout = "200ms".to_string();
        stack.runtime.timings.start_wait = Duration::from_secs(5);
        stack.validate().unwrap();

        assert!(matches!(
            stack.run(CancellationToken::new()).await,
            Err(StackError::StartTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_restart_container() {
        let dir = tempfile::tempdir().unwrap();
        let launches = dir.path().join("launches");
        let body = format!("echo up >> {}\nsleep 30", launches.display());
        let mut stack = script_stack(&[("web", body.as_str())]);
        stack.validate().unwrap();

        stack.start_container("web").await.unwrap();
        assert!(stack.is_running("web").await.unwrap());
        let first = stack.container("web").unwrap().id();

        stack.restart_container("web").await.unwrap();
        assert!(stack.is_running("web").await.unwrap());

        let second = stack.container("web").unwrap().id();
        assert!(!second.is_empty());
        assert_ne!(second, first);

        let mut count = 0;
        for _ in 0..100 {
            count = std::fs::read_to_string(&launches)
                .map(|s| s.lines().count())
                .unwrap_or(0);
            if count == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(count, 2);

        stack.stop_container("web").await.unwrap();
        assert!(stack.wait_for_container_stop("web").await.unwrap());
    }

    #[tokio::test]
    async fn test_probe_from_before_stop_is_discarded() {
        let mut stack = script_stack(&[("web", "sleep 30")]);
        stack.validate().unwrap();

        stack.start_container("web").await.unwrap();
        let container = stack.container("web").unwrap();
        let probed_id = container.id();

        stack.stop_container("web").await.unwrap();
        stack.record("web", &container, &probed_id, true, "localhost".to_string());

        assert!(!stack.has_running_containers());
        assert!(!container.config().running);
        assert_eq!(stack.status().containers[0].address, "");

        // A probe of the current launch is stored.
        stack.start_container("web").await.unwrap();
        let current = container.id();
        stack.record("web", &container, &current, true, "localhost".to_string());
        assert!(stack.has_running_containers());

        stack.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_container() {
        let mut stack = script_stack(&[("web", "sleep 30")]);
        stack.validate().unwrap();

        assert!(matches!(
            stack.start_container("nope").await,
            Err(StackError::NoSuchContainer(_))
        ));
        assert!(matches!(
            stack.restart_container("nope").await,
            Err(StackError::NoSuchContainer(_))
        ));
        assert!(stack.container("nope").is_none());
    }

    #[tokio::test]
    async fn test_stop_without_run_tears_down() {
        let mut stack = script_stack(&[("web", "sleep 30")]);
        stack.validate().unwrap();

        stack.start_container("web").await.unwrap();
        stack.stop().await.unwrap();
        assert!(!stack.is_running("web").await.unwrap());
        assert!(!stack.has_running_containers());
    }

    #[tokio::test]
    async fn test_prestart_runs_first() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ready");

        let body = format!("test -f {} && sleep 30", marker.display());
        let mut stack = script_stack(&[("web", body.as_str())]);
        stack
            .scripts
            .insert("init".to_string(), format!("touch {}", marker.display()));
        stack.prestart.push(script("init"));
        stack.validate().unwrap();
        let stack = Arc::new(stack);

        let runner = {
            let stack = stack.clone();
            tokio::spawn(async move { stack.run(CancellationToken::new()).await })
        };

        wait_running(&stack).await;
        assert!(marker.exists());
        stack.stop().await.unwrap();
        runner.await.unwrap().unwrap();
    }

    #[test]
    fn test_teardown_error_lists_failures() {
        let error = TeardownError {
            failures: vec![
                ("web".to_string(), "boom".to_string()),
                ("db".to_string(), "gone".to_string()),
            ],
        };
        assert_eq!(
            error.to_string(),
            "failed to stop 2 container(s): web: boom; db: gone"
        );
    }
}
