//! Default constants for stacks, containers and supervised processes.
//!
//! This module centralizes every tunable default used throughout the
//! orchestrator, making them easier to maintain and modify.

use std::time::Duration;

/// Capacity of each container's log line buffer
pub const LOG_BUFFER_CAPACITY: usize = 1024;

/// Config file names searched when no path is given
pub const CONFIG_FILE_NAMES: &[&str] = &["hydra.yaml", "hydra.yml", "hydra.toml"];

/// Container defaults
pub mod container {
    /// Memory limit applied when a container does not declare one
    pub const DEFAULT_MEMORY: &str = "512m";

    /// Shared memory size applied when a container does not declare one
    pub const DEFAULT_SHARED_MEMORY: &str = "256m";

    /// Host used to build a container's target address
    pub const DEFAULT_TARGET_HOST: &str = "localhost";

    /// Engine used when neither the container nor its stack names one
    pub const DEFAULT_RUNTIME: &str = "docker";

    /// Transport used for port mappings that omit one
    pub const DEFAULT_PORT_TRANSPORT: &str = "tcp";

    /// Namespace used by `kubernetes://` engines without an argument
    pub const DEFAULT_KUBERNETES_NAMESPACE: &str = "default";

    /// Shell used to run script containers and supervised programs
    pub const DEFAULT_SHELL: &str = "sh";
}

/// Timing defaults
pub mod timing {
    use super::Duration;

    /// How long a freshly started container has to report an address
    pub const DEFAULT_START_WAIT: Duration = Duration::from_secs(10);

    /// Interval between liveness checks while waiting for a start
    pub const START_CHECK_INTERVAL: Duration = Duration::from_millis(125);

    /// How long a stopping process or container is given to exit
    pub const PROCESS_EXIT_MAX_WAIT: Duration = Duration::from_secs(10);

    /// How long a deleted pod may stay terminating before stop gives up
    pub const POD_DELETE_WAIT: Duration = Duration::from_secs(60);

    /// Upper bound on a single liveness probe
    pub const CONTAINER_INSPECT_TIMEOUT: Duration = Duration::from_secs(3);

    /// Stack start timeout used when the stack does not declare one
    pub const DEFAULT_STACK_START_TIMEOUT: Duration = Duration::from_secs(30);

    /// Interval of the stack's liveness monitor loop
    pub const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

    /// Interval used while waiting for a restarted container to go down
    pub const RESTART_POLL_INTERVAL: Duration = Duration::from_millis(250);

    /// Interval used while waiting for a whole stack to go down
    pub const STOP_ALL_POLL_INTERVAL: Duration = Duration::from_millis(100);

    /// Base delay before an autorestarted program is relaunched
    pub const PROGRAM_BACKOFF: Duration = Duration::from_secs(1);
}
