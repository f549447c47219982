//! Kubernetes-backed containers.
//!
//! Each container becomes one pod in the namespace named by the engine
//! argument (`kubernetes://myns`, or `default`). The pod counts as running
//! while its phase is `Running`, and its address is the pod IP plus the
//! first declared container port.
//!
//! Pod deletion is graceful, so `stop()` keeps the pod's id until the API
//! no longer returns the pod. A restart never races a terminating pod of
//! the same name.

use super::logs::pump;
use super::{
    ContainerConfig, ContainerCore, ContainerError, LogOptions, Requirements, Result, bounded,
};
use crate::env;
use futures::{AsyncBufReadExt, StreamExt, future};
use k8s_openapi::api::core::v1::{
    Container as PodContainer, ContainerPort, EnvVar, Pod, PodSpec, ResourceRequirements,
    SecurityContext,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use kube::api::{Api, DeleteParams, LogParams, PostParams};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info};

const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// A workload run as a single-container Kubernetes pod.
pub struct KubernetesContainer {
    core: ContainerCore,
    namespace: String,
    client: OnceCell<Client>,
}

impl KubernetesContainer {
    /// Create a Kubernetes container in `namespace` (empty means `default`).
    pub fn new(config: ContainerConfig, namespace: impl Into<String>, logs: LogOptions) -> Self {
        let namespace = namespace.into();
        let namespace = if namespace.is_empty() {
            env::container::DEFAULT_KUBERNETES_NAMESPACE.to_string()
        } else {
            namespace
        };

        Self {
            core: ContainerCore::new(config, logs),
            namespace,
            client: OnceCell::new(),
        }
    }

    /// Namespace pods are created in.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub(crate) fn core(&self) -> &ContainerCore {
        &self.core
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.core.validate(Requirements::default())
    }

    async fn pods(&self) -> Result<Api<Pod>> {
        let client = self
            .client
            .get_or_try_init(|| async { Client::try_default().await })
            .await?;
        Ok(Api::namespaced(client.clone(), &self.namespace))
    }

    fn pod_name(&self) -> String {
        pod_name(&self.core.name())
    }

    pub(crate) async fn start(&self) -> Result<()> {
        self.validate()?;

        let config = self.core.config();
        let pods = self.pods().await?;
        let pod = pod_spec(&config, self.core.resources())?;
        let name = self.pod_name();

        debug!(pod = %name, namespace = %self.namespace, "Creating pod");
        let created = pods.create(&PostParams::default(), &pod).await?;
        let id = created.metadata.uid.unwrap_or_else(|| name.clone());

        info!(container = %config.name, pod = %name, namespace = %self.namespace, "Created pod");
        self.core.set_id(id);

        let (sender, producers) = self.core.logs().open();
        let source = config.name.clone();
        tokio::spawn(async move {
            let params = LogParams {
                follow: true,
                ..Default::default()
            };

            // Logs are unavailable until the pod's container has started.
            let reader = loop {
                tokio::select! {
                    _ = producers.cancelled() => return,
                    result = pods.log_stream(&name, &params) => match result {
                        Ok(reader) => break reader,
                        Err(e) => {
                            debug!(pod = %name, error = %e, "Pod logs not ready");
                            tokio::time::sleep(env::timing::START_CHECK_INTERVAL).await;
                        }
                    },
                }
            };

            let lines = reader
                .lines()
                .take_while(|result| future::ready(result.is_ok()))
                .filter_map(|result| future::ready(result.ok()));
            pump(source, sender, producers, lines).await;
        });

        Ok(())
    }

    pub(crate) async fn stop(&self) -> Result<()> {
        self.core.logs().close();

        if self.core.id().is_empty() {
            return Ok(());
        }

        let pods = self.pods().await?;
        let name = self.pod_name();
        match pods.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {
                debug!(pod = %name, namespace = %self.namespace, "Waiting for pod deletion");
                let name = name.as_str();
                wait_until_gone(
                    env::timing::POD_DELETE_WAIT,
                    env::timing::RESTART_POLL_INTERVAL,
                    || self.pod_gone(name),
                )
                .await?;
                info!(pod = %name, namespace = %self.namespace, "Deleted pod");
            }
            Err(kube::Error::Api(response)) if response.code == 404 => {
                debug!(pod = %name, "Pod already deleted");
            }
            Err(e) => return Err(ContainerError::KubeError(e)),
        }

        self.core.set_id(String::new());
        Ok(())
    }

    async fn pod_gone(&self, name: &str) -> Result<bool> {
        let pods = self.pods().await?;
        let pod = bounded(env::timing::CONTAINER_INSPECT_TIMEOUT, async {
            Ok::<_, ContainerError>(pods.get_opt(name).await?)
        })
        .await?;
        Ok(pod.is_none())
    }

    async fn get(&self) -> Result<Pod> {
        let pods = self.pods().await?;
        Ok(pods.get(&self.pod_name()).await?)
    }

    pub(crate) async fn is_running(&self) -> bool {
        if self.core.id().is_empty() {
            return false;
        }

        match bounded(env::timing::CONTAINER_INSPECT_TIMEOUT, self.get()).await {
            Ok(pod) => pod
                .status
                .and_then(|status| status.phase)
                .is_some_and(|phase| phase == "Running"),
            Err(e) => {
                debug!(pod = %self.pod_name(), error = %e, "Liveness probe failed");
                false
            }
        }
    }

    pub(crate) async fn address(&self) -> String {
        let ip = match bounded(env::timing::CONTAINER_INSPECT_TIMEOUT, self.get()).await {
            Ok(pod) => pod.status.and_then(|status| status.pod_ip),
            Err(_) => None,
        };
        let config = self.core.config();
        let Some(ip) = ip else {
            return config.target_addr;
        };

        match config.port_mappings().ok().and_then(|p| p.first().cloned()) {
            Some(port) => super::join_host_port(&ip, port.container),
            None => ip,
        }
    }
}

/// Poll `gone` until it reports true; a timeout error after `limit`.
async fn wait_until_gone<F, Fut>(limit: Duration, interval: Duration, mut gone: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + limit;
    loop {
        if gone().await? {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(ContainerError::Timeout(limit));
        }
        tokio::time::sleep(interval).await;
    }
}

/// Turn a container name into a valid pod name (RFC 1123 label).
fn pod_name(name: &str) -> String {
    let mut label: String = name
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    label.truncate(63);
    label.trim_matches('-').to_string()
}

fn pod_spec(config: &ContainerConfig, resources: super::Resources) -> Result<Pod> {
    let ports = config
        .port_mappings()?
        .into_iter()
        .map(|mapping| ContainerPort {
            container_port: i32::from(mapping.container),
            protocol: Some(mapping.protocol.to_ascii_uppercase()),
            ..Default::default()
        })
        .collect::<Vec<_>>();

    let env = config
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect::<Vec<_>>();

    let mut labels = config.labels.clone();
    labels.insert(MANAGED_BY_LABEL.to_string(), "hydra".to_string());

    let limits = BTreeMap::from([(
        "memory".to_string(),
        Quantity(resources.memory.to_string()),
    )]);

    let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());

    let container = PodContainer {
        name: pod_name(&config.name),
        image: Some(config.image.clone()),
        args: (!config.cmd.is_empty()).then(|| config.cmd.clone()),
        env: (!env.is_empty()).then_some(env),
        ports: (!ports.is_empty()).then_some(ports),
        working_dir: non_empty(&config.working_dir),
        resources: Some(ResourceRequirements {
            limits: Some(limits),
            ..Default::default()
        }),
        security_context: config.privileged.then(|| SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    };

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(pod_name(&config.name)),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            hostname: Some(pod_name(&config.hostname)).filter(|h| !h.is_empty()),
            containers: vec![container],
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_name_is_dns_label() {
        assert_eq!(pod_name("Web_Server.1"), "web-server-1");
        assert_eq!(pod_name("-edge-"), "edge");
        assert_eq!(pod_name(&"x".repeat(80)).len(), 63);
    }

    #[test]
    fn test_empty_namespace_uses_default() {
        let config = ContainerConfig::new("web", "nginx");
        let container = KubernetesContainer::new(config, "", LogOptions::default());
        assert_eq!(container.namespace, "default");
    }

    #[test]
    fn test_pod_spec_maps_fields() {
        let mut config = ContainerConfig::new("web", "nginx")
            .with_cmd(["-g", "daemon off;"])
            .with_env("MODE", "test");
        config.add_port(8080, 80, "");
        let resources = config.apply_defaults().unwrap();

        let pod = pod_spec(&config, resources).unwrap();
        assert_eq!(pod.metadata.name.as_deref(), Some("web"));
        assert_eq!(
            pod.metadata.labels.as_ref().unwrap()[MANAGED_BY_LABEL],
            "hydra"
        );

        let spec = pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        let container = &spec.containers[0];
        assert_eq!(container.image.as_deref(), Some("nginx"));
        assert_eq!(container.args.as_ref().map(Vec::len), Some(2));
        let port = &container.ports.as_ref().unwrap()[0];
        assert_eq!(port.container_port, 80);
        assert_eq!(port.protocol.as_deref(), Some("TCP"));
        assert!(container.security_context.is_none());
        let limits = container.resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert_eq!(limits["memory"], Quantity("512000000".to_string()));
    }

    #[tokio::test]
    async fn test_wait_until_gone_polls_until_pod_disappears() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let polls = AtomicUsize::new(0);
        let result = wait_until_gone(Duration::from_secs(5), Duration::from_millis(5), || {
            let seen = polls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(seen >= 3) }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_wait_until_gone_times_out_on_terminating_pod() {
        let result = wait_until_gone(Duration::from_millis(50), Duration::from_millis(5), || async {
            Ok(false)
        })
        .await;
        assert!(matches!(result, Err(ContainerError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_wait_until_gone_propagates_probe_errors() {
        let result = wait_until_gone(Duration::from_secs(5), Duration::from_millis(5), || async {
            Err(ContainerError::Other("api unavailable".to_string()))
        })
        .await;
        assert!(matches!(result, Err(ContainerError::Other(_))));
    }

    #[tokio::test]
    async fn test_stop_never_started_needs_no_cluster() {
        let config = ContainerConfig::new("web", "nginx");
        let container = KubernetesContainer::new(config, "", LogOptions::default());
        assert!(container.stop().await.is_ok());
        assert!(!container.is_running().await);
    }
}
