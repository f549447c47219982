//! # Hydra
//!
//! Runs stacks of sidecar workloads (inline shell scripts, Docker
//! containers, Kubernetes pods) and supervises local programs, with bounded
//! liveness probes, log streaming and coordinated shutdown.
//!
//! ## Architecture Overview
//!
//! - **[`container`]**: the [`Container`](container::Container) backends and
//!   their per-container config, log buffers and lifecycle
//! - **[`stack`]**: [`Stack`](stack::Stack), which validates, starts,
//!   monitors and tears down a set of containers
//! - **[`process`]**: [`ProcessManager`](process::ProcessManager), which
//!   supervises plain OS processes with autorestart
//! - **[`control`]**: request dispatch for start/stop/restart/tail from an
//!   outside caller
//! - **[`config`]**: YAML/TOML file loading
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hydra::container::ContainerConfig;
//! use hydra::stack::Stack;
//! use tokio_util::sync::CancellationToken;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut stack = Stack::new("demo");
//!     stack.engine = "docker://".to_string();
//!     stack.timeout = "30s".to_string();
//!     stack.containers.push(
//!         ContainerConfig::new("web", "nginx").with_cmd(["nginx", "-g", "daemon off;"]),
//!     );
//!     stack.validate()?;
//!
//!     let stack = Arc::new(stack);
//!     let runner = {
//!         let stack = stack.clone();
//!         tokio::spawn(async move { stack.run(CancellationToken::new()).await })
//!     };
//!
//!     // ... later, from anywhere:
//!     stack.stop().await?;
//!     runner.await??;
//!     Ok(())
//! }
//! ```

/// Workload backends and their configuration.
pub mod container;

/// Stack orchestration.
pub mod stack;

/// Local process supervision.
pub mod process;

/// Control requests against a running stack.
pub mod control;

/// Configuration file loading.
pub mod config;

/// Command line interface.
pub mod cli;

/// Default constants.
pub mod env;

pub use config::HydraConfig;
pub use container::{Container, ContainerConfig, ContainerError};
pub use control::{ControlReply, ControlRequest, Controller};
pub use process::{ProcessManager, Program, ProgramState};
pub use stack::{Stack, StackError};
