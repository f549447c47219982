//! Docker-backed containers.
//!
//! Talks to the Docker Engine API through bollard. The daemon is picked from
//! the engine string: `docker://` uses the local defaults (`DOCKER_HOST` or
//! the standard socket), `docker+unix:///path` a specific socket and
//! `docker+tcp://host:port` a remote daemon.

use super::logs::{RawLine, pump};
use super::{
    ContainerConfig, ContainerCore, ContainerError, LogOptions, Requirements, Result, bounded,
};
use crate::env;
use bollard::Docker;
use chrono::{DateTime, Utc};
use bollard::models::{HostConfig, PortBinding};
use futures::{StreamExt, future};
use std::collections::HashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Seconds the daemon waits after SIGTERM before killing a container.
const STOP_GRACE_SECS: i64 = 10;

/// A workload run as a Docker container.
pub struct DockerContainer {
    core: ContainerCore,
    variant: Option<String>,
    argument: String,
    client: OnceCell<Docker>,
}

impl DockerContainer {
    /// Create a Docker container.
    ///
    /// `variant` and `argument` come from the engine string and select the
    /// daemon to talk to.
    pub fn new(
        config: ContainerConfig,
        variant: Option<String>,
        argument: impl Into<String>,
        logs: LogOptions,
    ) -> Self {
        Self {
            core: ContainerCore::new(config, logs),
            variant,
            argument: argument.into(),
            client: OnceCell::new(),
        }
    }

    pub(crate) fn core(&self) -> &ContainerCore {
        &self.core
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.core.validate(Requirements::default())
    }

    async fn client(&self) -> Result<&Docker> {
        self.client
            .get_or_try_init(|| async { connect(self.variant.as_deref(), &self.argument) })
            .await
    }

    async fn ensure_image(&self, docker: &Docker, image: &str) -> Result<()> {
        match docker.inspect_image(image).await {
            Ok(_) => {
                debug!("Image {} already exists locally", image);
                return Ok(());
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(ContainerError::ApiError(e)),
        }

        info!("Pulling image: {}", image);
        let mut stream = docker.create_image(
            Some(bollard::image::CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(result) = stream.next().await {
            let info = result?;
            if let Some(status) = info.status {
                debug!("Pull: {}", status);
            }
            if let Some(error) = info.error {
                return Err(ContainerError::Other(format!("Pull failed: {}", error)));
            }
        }

        info!("Successfully pulled image: {}", image);
        Ok(())
    }

    pub(crate) async fn start(&self) -> Result<()> {
        self.validate()?;

        let config = self.core.config();
        let docker = self.client().await?;
        self.ensure_image(docker, &config.image).await?;

        let options = bollard::container::CreateContainerOptions {
            name: config.name.as_str(),
            ..Default::default()
        };
        let create = create_config(&config, self.core.resources())?;

        debug!("Creating container: {}", config.name);
        let response = docker.create_container(Some(options), create).await?;
        let id = response.id;

        if let Err(e) = docker
            .start_container(&id, None::<bollard::container::StartContainerOptions<String>>)
            .await
        {
            // Leave nothing behind that would block the next create with this name.
            if let Err(remove) = remove(docker, &id).await {
                warn!("Failed to remove container {} after failed start: {}", id, remove);
            }
            return Err(ContainerError::ApiError(e));
        }

        info!(container = %config.name, id = %id, "Started docker container");
        self.core.set_id(id.clone());

        let (sender, producers) = self.core.logs().open();
        let docker = docker.clone();
        let name = config.name.clone();
        tokio::spawn(async move {
            let output = docker.logs(
                &id,
                Some(bollard::container::LogsOptions::<String> {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    timestamps: true,
                    tail: "all".to_string(),
                    ..Default::default()
                }),
            );
            let lines = output
                .take_while(|result| future::ready(result.is_ok()))
                .filter_map(|result| future::ready(result.ok()))
                .flat_map(|log| {
                    let text = log.to_string();
                    futures::stream::iter(
                        text.lines().map(stamped).collect::<Vec<_>>(),
                    )
                });
            pump(name, sender, producers, lines).await;
        });

        Ok(())
    }

    pub(crate) async fn stop(&self) -> Result<()> {
        self.core.logs().close();

        let id = self.core.id();
        if id.is_empty() {
            return Ok(());
        }

        let docker = self.client().await?;
        debug!("Stopping container: {}", id);

        match docker
            .stop_container(
                &id,
                Some(bollard::container::StopContainerOptions { t: STOP_GRACE_SECS }),
            )
            .await
        {
            Ok(()) => {}
            Err(e) if is_gone(&e) => debug!("Container {} already stopped", id),
            Err(e) => return Err(ContainerError::ApiError(e)),
        }

        remove(docker, &id).await?;
        info!(container = %self.core.name(), id = %id, "Stopped docker container");
        self.core.set_id(String::new());

        Ok(())
    }

    pub(crate) async fn is_running(&self) -> bool {
        let id = self.core.id();
        if id.is_empty() {
            return false;
        }

        let probe = async {
            let docker = self.client().await?;
            let inspect = docker
                .inspect_container(&id, None::<bollard::query_parameters::InspectContainerOptions>)
                .await?;
            Ok::<_, ContainerError>(
                inspect
                    .state
                    .and_then(|state| state.running)
                    .unwrap_or(false),
            )
        };

        match bounded(env::timing::CONTAINER_INSPECT_TIMEOUT, probe).await {
            Ok(running) => running,
            Err(e) => {
                debug!("Liveness probe for {} failed: {}", id, e);
                false
            }
        }
    }

    pub(crate) fn address(&self) -> String {
        self.core.config().target_addr
    }
}

/// Connect to the daemon selected by an engine string.
fn connect(variant: Option<&str>, argument: &str) -> Result<Docker> {
    let docker = match (variant, argument) {
        (None, "") => Docker::connect_with_local_defaults()?,
        (Some("unix"), path) => {
            let path = if path.is_empty() {
                "/var/run/docker.sock"
            } else {
                path
            };
            Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)?
        }
        (None | Some("tcp") | Some("http"), addr) => Docker::connect_with_http(
            &format!("http://{}", addr),
            120,
            bollard::API_DEFAULT_VERSION,
        )?,
        (Some(other), _) => {
            return Err(ContainerError::ConfigError(format!(
                "unsupported docker transport {:?}",
                other
            )));
        }
    };

    debug!(variant = ?variant, argument, "Connected to docker daemon");
    Ok(docker)
}

fn create_config(
    config: &ContainerConfig,
    resources: super::Resources,
) -> Result<bollard::container::Config<String>> {
    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for mapping in config.port_mappings()? {
        let key = format!("{}/{}", mapping.container, mapping.protocol);
        exposed_ports.insert(key.clone(), HashMap::new());
        port_bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(mapping.host.to_string()),
            }]),
        );
    }

    let host_config = HostConfig {
        memory: Some(resources.memory as i64),
        shm_size: Some(resources.shared_memory as i64),
        port_bindings: Some(port_bindings),
        binds: (!config.volumes.is_empty()).then(|| config.volumes.clone()),
        privileged: Some(config.privileged),
        ..Default::default()
    };

    let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());

    Ok(bollard::container::Config {
        image: Some(config.image.clone()),
        hostname: non_empty(&config.hostname),
        user: non_empty(&config.user),
        cmd: (!config.cmd.is_empty()).then(|| config.cmd.clone()),
        env: Some(config.env_pairs()),
        working_dir: non_empty(&config.working_dir),
        labels: Some(config.labels.clone().into_iter().collect()),
        exposed_ports: Some(exposed_ports),
        host_config: Some(host_config),
        ..Default::default()
    })
}

async fn remove(docker: &Docker, id: &str) -> Result<()> {
    match docker
        .remove_container(
            id,
            Some(bollard::container::RemoveContainerOptions {
                force: true,
                v: true,
                ..Default::default()
            }),
        )
        .await
    {
        Ok(()) => Ok(()),
        Err(e) if is_gone(&e) => {
            debug!("Container {} already removed", id);
            Ok(())
        }
        Err(e) => Err(ContainerError::ApiError(e)),
    }
}

/// Errors that mean the container is already stopped, removed or going away.
fn is_gone(error: &bollard::errors::Error) -> bool {
    match error {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => {
            matches!(status_code, 304 | 404)
                || (*status_code == 409 && message.contains("already in progress"))
        }
        _ => false,
    }
}

/// Split the RFC 3339 timestamp the daemon prefixes to each line.
fn stamped(line: &str) -> RawLine {
    line.split_once(' ')
        .and_then(|(timestamp, message)| {
            DateTime::parse_from_rfc3339(timestamp)
                .ok()
                .map(|timestamp| RawLine::at(message, timestamp.with_timezone(&Utc)))
        })
        .unwrap_or_else(|| RawLine::from(line.to_string()))
}
