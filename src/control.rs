//! Control surface for a running stack.
//!
//! A [`Controller`] turns [`ControlRequest`]s into stack operations and
//! answers with a [`ControlReply`]. It is transport-agnostic: requests and
//! replies are serde-tagged so any framing (HTTP bodies, a socket, stdin)
//! can carry them, and [`ControlError::status_code`] gives the HTTP-style
//! status for failures.

use crate::container::{ContainerConfig, LogLine};
use crate::env;
use crate::stack::{Stack, StackError, StackStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Lines returned by a tail request that does not ask for a count.
const DEFAULT_TAIL_LINES: usize = 100;

fn default_tail_lines() -> usize {
    DEFAULT_TAIL_LINES
}

/// Request sent to a [`Controller`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ControlRequest {
    /// Stack state snapshot
    Status,

    /// Configs of every container
    Containers,

    /// Drain up to `lines` buffered log lines without waiting
    Tail {
        container: String,
        #[serde(default = "default_tail_lines")]
        lines: usize,
    },

    /// Start one container, or all of them
    Start {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        container: Option<String>,
    },

    /// Stop one container, or all of them
    Stop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        container: Option<String>,
    },

    /// Restart one container, or all of them
    Restart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        container: Option<String>,
    },

    /// Stop the whole stack in the background
    Shutdown,
}

/// Reply from a [`Controller`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ControlReply {
    /// Operation completed
    Ok,

    /// Operation started in the background
    Accepted,

    /// Stack state snapshot
    Status { status: StackStatus },

    /// Container configs
    Containers { containers: Vec<ContainerConfig> },

    /// Drained log lines, oldest first
    Lines { lines: Vec<LogLine> },

    /// Request failed
    Error { status: u16, message: String },
}

/// Control request errors.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Request is malformed
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Operation applied to every container failed for some of them
    #[error("{} container(s) failed: {}", .0.len(), join_failures(.0))]
    Partial(Vec<(String, String)>),

    /// Stack operation failed
    #[error(transparent)]
    Stack(#[from] StackError),
}

fn join_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(name, message)| format!("{}: {}", name, message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl ControlError {
    /// HTTP-style status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ControlError::BadRequest(_) => 400,
            ControlError::Stack(StackError::NoSuchContainer(_)) => 404,
            ControlError::Partial(_) | ControlError::Stack(_) => 500,
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Action {
    Start,
    Stop,
    Restart,
}

/// Dispatches control requests against a shared stack.
#[derive(Clone, Debug)]
pub struct Controller {
    stack: Arc<Stack>,
}

impl Controller {
    /// Create a controller for a validated stack.
    pub fn new(stack: Arc<Stack>) -> Self {
        Self { stack }
    }

    /// The controlled stack.
    pub fn stack(&self) -> &Arc<Stack> {
        &self.stack
    }

    /// Handle a request, folding failures into [`ControlReply::Error`].
    pub async fn respond(&self, request: ControlRequest) -> ControlReply {
        match self.handle(request).await {
            Ok(reply) => reply,
            Err(e) => ControlReply::Error {
                status: e.status_code(),
                message: e.to_string(),
            },
        }
    }

    /// Handle a request.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError`] for malformed requests, unknown containers
    /// and failed stack operations. Operations on every container attempt
    /// all of them before reporting.
    pub async fn handle(&self, request: ControlRequest) -> Result<ControlReply, ControlError> {
        debug!(request = ?request, "control request");

        match request {
            ControlRequest::Status => Ok(ControlReply::Status {
                status: self.stack.status(),
            }),
            ControlRequest::Containers => {
                let containers = self
                    .stack
                    .container_names()
                    .iter()
                    .filter_map(|name| self.stack.container(name))
                    .map(|c| c.config())
                    .collect();
                Ok(ControlReply::Containers { containers })
            }
            ControlRequest::Tail { container, lines } => {
                if lines == 0 || lines > env::LOG_BUFFER_CAPACITY {
                    return Err(ControlError::BadRequest(format!(
                        "lines must be between 1 and {}",
                        env::LOG_BUFFER_CAPACITY
                    )));
                }
                let handle = self
                    .stack
                    .container(&container)
                    .ok_or(StackError::NoSuchContainer(container))?;
                Ok(ControlReply::Lines {
                    lines: handle.tail().drain(lines),
                })
            }
            ControlRequest::Start { container } => self.apply(Action::Start, container).await,
            ControlRequest::Stop { container } => self.apply(Action::Stop, container).await,
            ControlRequest::Restart { container } => self.apply(Action::Restart, container).await,
            ControlRequest::Shutdown => {
                info!(stack = %self.stack.id, "shutdown requested");
                let stack = self.stack.clone();
                tokio::spawn(async move {
                    if let Err(e) = stack.stop().await {
                        error!(stack = %stack.id, error = %e, "stack shutdown failed");
                    }
                });
                Ok(ControlReply::Accepted)
            }
        }
    }

    async fn apply(
        &self,
        action: Action,
        container: Option<String>,
    ) -> Result<ControlReply, ControlError> {
        let Some(name) = container else {
            let mut failures = Vec::new();
            for name in self.stack.container_names() {
                if let Err(e) = self.apply_one(action, &name).await {
                    failures.push((name, e.to_string()));
                }
            }
            return if failures.is_empty() {
                Ok(ControlReply::Ok)
            } else {
                Err(ControlError::Partial(failures))
            };
        };

        self.apply_one(action, &name).await?;
        Ok(ControlReply::Ok)
    }

    async fn apply_one(&self, action: Action, name: &str) -> Result<(), StackError> {
        match action {
            Action::Start => self.stack.start_container(name).await,
            Action::Stop => self.stack.stop_container(name).await,
            Action::Restart => self.stack.restart_container(name).await,
        }
    }
}
