//! Container backends.
//!
//! A [`Container`] is one runnable workload bound to a [`ContainerConfig`].
//! The backend is chosen once, when the owning stack is validated, and never
//! changes afterwards:
//!
//! - [`ScriptContainer`]: runs an inline shell script from the stack's script table
//! - [`DockerContainer`]: a container managed through the Docker Engine API (bollard)
//! - [`KubernetesContainer`]: a pod managed through the Kubernetes API (kube)
//!
//! Every variant offers the same capability set: `start`, `stop`,
//! `is_running`, `address`, `tail`, `config` and `id`.
//!
//! ## Lifecycle
//!
//! ```text
//! new ──start()──▶ running ──stop()──▶ stopped ──start()──▶ running ...
//!                     │
//!               is_running() / address() / tail()
//! ```
//!
//! `stop()` is idempotent: stopping a never-started or already-stopped
//! container succeeds. It closes the log buffer before tearing down the
//! backend resource, so consumers of [`Container::tail`] see the close
//! promptly.

mod config;
mod logs;
mod script;

#[cfg(feature = "containers")]
mod docker;

#[cfg(feature = "kubernetes")]
mod kubernetes;

pub use config::{
    ContainerConfig, PortMapping, Requirements, Resources, join_host_port, parse_bytes,
    parse_duration, split_host_port,
};
pub use logs::{LogLine, LogTail, OverflowPolicy};
pub use script::{ScriptContainer, Scripts};

#[cfg(feature = "containers")]
pub use docker::DockerContainer;

#[cfg(feature = "kubernetes")]
pub use kubernetes::KubernetesContainer;

use crate::env;
use logs::LogPipe;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Container runtime errors.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    /// Container configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Script resolution or execution error
    #[error("Script error: {0}")]
    ScriptError(String),

    /// Docker API error
    #[cfg(feature = "containers")]
    #[error("Container API error: {0}")]
    ApiError(#[from] bollard::errors::Error),

    /// Kubernetes API error
    #[cfg(feature = "kubernetes")]
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Backend call did not finish in time
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// General error
    #[error("Container error: {0}")]
    Other(String),
}

/// Result type for container operations.
pub type Result<T> = std::result::Result<T, ContainerError>;

/// Sizing of a container's log buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogOptions {
    /// Maximum buffered lines
    pub capacity: usize,
    /// Behavior when the buffer is full
    pub overflow: OverflowPolicy,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            capacity: env::LOG_BUFFER_CAPACITY,
            overflow: OverflowPolicy::default(),
        }
    }
}

/// State shared by every backend: config, resolved resources, the
/// backend-assigned id and the log buffer.
pub(crate) struct ContainerCore {
    config: RwLock<ContainerConfig>,
    resources: RwLock<Resources>,
    id: RwLock<String>,
    validated: AtomicBool,
    logs: LogPipe,
}

impl ContainerCore {
    pub(crate) fn new(config: ContainerConfig, logs: LogOptions) -> Self {
        Self {
            config: RwLock::new(config),
            resources: RwLock::new(Resources::default()),
            id: RwLock::new(String::new()),
            validated: AtomicBool::new(false),
            logs: LogPipe::new(logs.capacity, logs.overflow),
        }
    }

    /// Validate once, applying backend defaults on the first success.
    pub(crate) fn validate(&self, requirements: Requirements) -> Result<()> {
        if self.validated.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut config = self.config.write();
        config.validate_with(requirements)?;
        *self.resources.write() = config.apply_defaults()?;
        self.validated.store(true, Ordering::Release);

        Ok(())
    }

    pub(crate) fn config(&self) -> ContainerConfig {
        self.config.read().clone()
    }

    pub(crate) fn name(&self) -> String {
        self.config.read().name.clone()
    }

    pub(crate) fn resources(&self) -> Resources {
        *self.resources.read()
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.config.write().running = running;
    }

    pub(crate) fn id(&self) -> String {
        self.id.read().clone()
    }

    pub(crate) fn set_id(&self, id: impl Into<String>) {
        *self.id.write() = id.into();
    }

    pub(crate) fn logs(&self) -> &LogPipe {
        &self.logs
    }
}

/// A workload bound to one backend.
pub enum Container {
    /// Inline shell script
    Script(ScriptContainer),
    /// Docker container
    #[cfg(feature = "containers")]
    Docker(DockerContainer),
    /// Kubernetes pod
    #[cfg(feature = "kubernetes")]
    Kubernetes(KubernetesContainer),
}

impl Container {
    fn core(&self) -> &ContainerCore {
        match self {
            Self::Script(c) => c.core(),
            #[cfg(feature = "containers")]
            Self::Docker(c) => c.core(),
            #[cfg(feature = "kubernetes")]
            Self::Kubernetes(c) => c.core(),
        }
    }

    /// Backend name for logging and status reports.
    pub fn engine(&self) -> &'static str {
        match self {
            Self::Script(_) => "shell",
            #[cfg(feature = "containers")]
            Self::Docker(_) => "docker",
            #[cfg(feature = "kubernetes")]
            Self::Kubernetes(_) => "kubernetes",
        }
    }

    /// Validate the config against this backend's requirements.
    ///
    /// Runs at most once; later calls return immediately.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for missing fields or bad sizes.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Script(c) => c.validate(),
            #[cfg(feature = "containers")]
            Self::Docker(c) => c.validate(),
            #[cfg(feature = "kubernetes")]
            Self::Kubernetes(c) => c.validate(),
        }
    }

    /// Start the workload.
    ///
    /// # Errors
    ///
    /// Returns error if the config is invalid or the backend refuses.
    pub async fn start(&self) -> Result<()> {
        match self {
            Self::Script(c) => c.start().await,
            #[cfg(feature = "containers")]
            Self::Docker(c) => c.start().await,
            #[cfg(feature = "kubernetes")]
            Self::Kubernetes(c) => c.start().await,
        }
    }

    /// Stop the workload and close its log buffer.
    ///
    /// # Errors
    ///
    /// Returns error only for genuine backend failures.
    pub async fn stop(&self) -> Result<()> {
        match self {
            Self::Script(c) => c.stop().await,
            #[cfg(feature = "containers")]
            Self::Docker(c) => c.stop().await,
            #[cfg(feature = "kubernetes")]
            Self::Kubernetes(c) => c.stop().await,
        }
    }

    /// Bounded liveness probe; failures read as not running.
    pub async fn is_running(&self) -> bool {
        match self {
            Self::Script(c) => c.is_running().await,
            #[cfg(feature = "containers")]
            Self::Docker(c) => c.is_running().await,
            #[cfg(feature = "kubernetes")]
            Self::Kubernetes(c) => c.is_running().await,
        }
    }

    /// Reachable `host:port`, or empty while not running.
    pub async fn address(&self) -> String {
        if !self.is_running().await {
            return String::new();
        }

        match self {
            Self::Script(c) => c.address(),
            #[cfg(feature = "containers")]
            Self::Docker(c) => c.address(),
            #[cfg(feature = "kubernetes")]
            Self::Kubernetes(c) => c.address().await,
        }
    }

    /// Consumer handle for this container's log lines.
    pub fn tail(&self) -> LogTail {
        self.core().logs().tail()
    }

    /// Snapshot of the container's config.
    pub fn config(&self) -> ContainerConfig {
        self.core().config()
    }

    /// Record the last observed running state in the config.
    pub fn set_running(&self, running: bool) {
        self.core().set_running(running);
    }

    /// Backend-assigned id; empty until the first successful start.
    pub fn id(&self) -> String {
        self.core().id()
    }

    /// Configured name.
    pub fn name(&self) -> String {
        self.core().name()
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("engine", &self.engine())
            .field("name", &self.name())
            .field("id", &self.id())
            .finish()
    }
}

/// Run a backend call with an upper bound on its duration.
pub(crate) async fn bounded<T, F>(limit: Duration, call: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| ContainerError::Timeout(limit))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_validates_once() {
        let core = ContainerCore::new(ContainerConfig::new("web", "nginx"), LogOptions::default());
        core.validate(Requirements::default()).unwrap();
        assert_eq!(core.config().memory, "512m");

        // A second call must not re-apply defaults over later edits.
        core.config.write().memory = "1g".to_string();
        core.validate(Requirements::default()).unwrap();
        assert_eq!(core.config().memory, "1g");
        assert_eq!(core.resources().memory, 512_000_000);
    }

    #[test]
    fn test_core_validation_failure_is_retried() {
        let core = ContainerCore::new(ContainerConfig::new("web", ""), LogOptions::default());
        assert!(core.validate(Requirements::default()).is_err());

        core.config.write().image = "nginx".to_string();
        assert!(core.validate(Requirements::default()).is_ok());
    }

    #[test]
    fn test_set_running_updates_config() {
        let core = ContainerCore::new(ContainerConfig::new("web", "nginx"), LogOptions::default());
        core.set_running(true);
        assert!(core.config().running);
        core.set_running(false);
        assert!(!core.config().running);
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let result: Result<()> = bounded(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(ContainerError::Timeout(_))));
    }
}
