//! Lifecycle operations on browser pods.
//!
//! [`ContainerClient`] keeps no per-pod state. Each query re-reads the pod
//! from the API server and hands it to the decisions in [`pod_status`].
//!
//! [`pod_status`]: crate::platform::k8s::pod_status

use std::sync::Arc;

use api_types::ContainerCreationStatus;
use api_types::ContainerRegistration;
use api_types::CreateRequest;
use error_stack::Report;
use error_stack::ResultExt;
use futures::future::join_all;
use k8s_openapi::api::core::v1::Pod;
use kube::api::DeleteParams;
use kube::api::ListParams;
use kube::api::PostParams;
use kube::Api;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use url::Host;
use url::Url;

use crate::config::KubernetesArgs;
use crate::platform::k8s::artifacts::ArtifactStream;
use crate::platform::k8s::discovery;
use crate::platform::k8s::discovery::ClientConfig;
use crate::platform::k8s::exec_command;
use crate::platform::k8s::exec_copy;
use crate::platform::k8s::is_not_found;
use crate::platform::k8s::pod_spec;
use crate::platform::k8s::pod_status;
use crate::platform::k8s::shared_volume;
use crate::platform::k8s::ContainerError;
use crate::platform::k8s::KubernetesError;
use crate::platform::kube_client;

/// How artifacts are pulled out of a browser pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStrategy {
    /// Read files from the shared artifacts mount
    SharedVolume,
    /// Stream a tar archive over an exec channel
    Exec,
}

impl CopyStrategy {
    pub fn for_config(config: &ClientConfig) -> Self {
        if config.shared_artifacts_mount.is_some() {
            Self::SharedVolume
        } else {
            Self::Exec
        }
    }
}

/// Outcome of a cleanup sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub deleted: usize,
    pub failed: usize,
}

/// Client for creating, observing and removing browser pods.
pub struct ContainerClient {
    pods: Api<Pod>,
    config: Arc<ClientConfig>,
    copy_strategy: CopyStrategy,
}

impl ContainerClient {
    pub fn new(pods: Api<Pod>, config: ClientConfig) -> Self {
        let copy_strategy = CopyStrategy::for_config(&config);
        Self {
            pods,
            config: Arc::new(config),
            copy_strategy,
        }
    }

    /// Connect to the cluster and discover our configuration.
    ///
    /// Discovery failures only degrade the client; connection failures are
    /// returned.
    pub async fn init(args: &KubernetesArgs) -> Result<Self, Report<KubernetesError>> {
        let client = kube_client::init_kube_client(args.kubeconfig.as_deref()).await?;
        let pods = kube_client::pods_api(client, args.namespace.as_deref());

        let config = match discovery::discover(&pods, args).await {
            Ok(config) => config,
            Err(e) => {
                warn!("Failed to discover own pod, continuing with defaults: {e:?}");
                ClientConfig::degraded(args)
            }
        };

        Ok(Self::new(pods, config))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn copy_strategy(&self) -> CopyStrategy {
        self.copy_strategy
    }

    /// Submit a browser pod for `request`. No retries.
    ///
    /// # Errors
    ///
    /// - [`ContainerError::CreationRejected`] if the API server refuses the pod
    #[tracing::instrument(skip_all, fields(prefix = %request.name_prefix, image = %request.image))]
    pub async fn create_container(
        &self,
        request: &CreateRequest,
    ) -> Result<ContainerCreationStatus, Report<ContainerError>> {
        let work_dir = match &self.config.shared_artifacts_mount {
            Some(mount) => Some(pod_spec::allocate_work_dir(mount).await),
            None => None,
        };
        let pod = pod_spec::build_pod(&self.config, request, work_dir.as_ref());

        let created = self
            .pods
            .create(&PostParams::default(), &pod)
            .await
            .change_context_lazy(|| ContainerError::CreationRejected {
                prefix: request.name_prefix.clone(),
            })?;

        let name = created
            .metadata
            .name
            .unwrap_or_else(|| request.name_prefix.clone());
        info!(container_id = %name, "Created browser pod");

        Ok(ContainerCreationStatus::created(name, request.node_port.clone()))
    }

    /// Request deletion without waiting for the pod to go away. An already
    /// absent pod is not an error.
    #[tracing::instrument(skip(self))]
    pub async fn stop_container(&self, container_id: &str) {
        match self.pods.delete(container_id, &DeleteParams::default()).await {
            Ok(_) => debug!("Requested pod deletion"),
            Err(e) if is_not_found(&e) => debug!("Pod already gone"),
            Err(e) => error!("Failed to delete pod: {e}"),
        }
    }

    async fn fetch(&self, container_id: &str) -> Result<Option<Pod>, kube::Error> {
        self.pods.get_opt(container_id).await
    }

    pub async fn is_ready(&self, container_id: &str) -> bool {
        match self.fetch(container_id).await {
            Ok(pod) => pod_status::is_pod_ready(pod.as_ref()),
            Err(e) => {
                warn!(container_id, "Failed to read pod readiness: {e}");
                false
            }
        }
    }

    pub async fn is_terminated(&self, container_id: &str) -> bool {
        match self.fetch(container_id).await {
            Ok(pod) => {
                if let Some(state) = pod.as_ref().and_then(pod_status::terminated_state) {
                    info!(
                        container_id,
                        reason = ?state.reason,
                        exit_code = state.exit_code,
                        "Pod terminated"
                    );
                }
                pod_status::is_pod_terminated(pod.as_ref())
            }
            Err(e) => {
                warn!(container_id, "Failed to read pod state: {e}");
                false
            }
        }
    }

    /// IP of the pod, once it has one.
    pub async fn get_container_ip(&self, container_id: &str) -> Option<String> {
        match self.fetch(container_id).await {
            Ok(pod) => pod.as_ref().and_then(pod_status::pod_ip).map(str::to_string),
            Err(e) => {
                warn!(container_id, "Failed to read pod ip: {e}");
                None
            }
        }
    }

    /// Images are refreshed through the pull policy, so the image is always
    /// the latest.
    pub fn get_latest_downloaded_image(&self, image: &str) -> String {
        image.to_string()
    }

    /// Copy `folder` out of the pod with the strategy chosen at startup.
    ///
    /// # Errors
    ///
    /// Only the shared volume strategy fails eagerly, see
    /// [`shared_volume::copy_from_shared_volume`]. Exec copies log remote
    /// failures and end the stream early.
    #[tracing::instrument(skip(self))]
    pub async fn copy_artifacts(
        &self,
        container_id: &str,
        folder: &str,
    ) -> Result<ArtifactStream, Report<ContainerError>> {
        match self.copy_strategy {
            CopyStrategy::SharedVolume => {
                shared_volume::copy_from_shared_volume(&self.pods, container_id, folder).await
            }
            CopyStrategy::Exec => {
                Ok(exec_copy::copy_through_exec(self.pods.clone(), container_id, folder).await)
            }
        }
    }

    pub async fn execute_command(&self, container_id: &str, command: Vec<String>, wait: bool) {
        exec_command::execute_command(&self.pods, container_id, command, wait).await;
    }

    /// Delete every pod carrying our `createdBy` label. Individual failures
    /// are logged and do not stop the others.
    ///
    /// # Errors
    ///
    /// - [`ContainerError::ListFailed`] if the pods cannot be listed
    pub async fn delete_leftover_pods(&self) -> Result<SweepSummary, Report<ContainerError>> {
        let selector = self.config.created_by_selector();
        let pods = self
            .pods
            .list(&ListParams::default().labels(&selector))
            .await
            .change_context_lazy(|| ContainerError::ListFailed {
                selector: selector.clone(),
            })?;

        let names: Vec<String> = pods
            .items
            .into_iter()
            .filter_map(|pod| pod.metadata.name)
            .collect();

        let results = join_all(names.iter().map(|name| async move {
            match self.pods.delete(name, &DeleteParams::default()).await {
                Ok(_) => true,
                Err(e) if is_not_found(&e) => true,
                Err(e) => {
                    warn!(container_id = %name, "Failed to delete leftover pod: {e}");
                    false
                }
            }
        }))
        .await;

        let deleted = results.iter().filter(|deleted| **deleted).count();
        let summary = SweepSummary {
            deleted,
            failed: results.len() - deleted,
        };
        info!(selector = %selector, deleted = summary.deleted, failed = summary.failed, "Swept leftover pods");
        Ok(summary)
    }

    async fn sweep(&self) {
        if let Err(e) = self.delete_leftover_pods().await {
            error!("Failed to clean up leftover pods: {e:?}");
        }
    }

    /// Remove pods left over by a previous run and install a hook that removes
    /// ours again on SIGINT/SIGTERM.
    ///
    /// The returned handle completes once the hook ran. Installing the hook
    /// replaces the default SIGINT/SIGTERM handling, so these signals no
    /// longer stop the process on their own: the caller must await the handle
    /// and exit once it completes.
    pub async fn initialize_environment(self: &Arc<Self>) -> JoinHandle<()> {
        self.sweep().await;

        let client = Arc::clone(self);
        tokio::spawn(async move {
            wait_for_termination().await;
            info!("Shutting down, removing browser pods");
            client.sweep().await;
        })
    }

    pub async fn shutdown(&self) {
        self.sweep().await;
    }

    /// Identify the browser pod behind a node address.
    ///
    /// # Errors
    ///
    /// - [`ContainerError::InvalidRemoteHost`] if the url has no host
    /// - [`ContainerError::ListFailed`] if the pods cannot be listed
    /// - [`ContainerError::NodeNotFound`] if no pod has the address
    /// - [`ContainerError::InvalidPreviewPort`] if the preview port is malformed
    #[tracing::instrument(skip(self, remote_host), fields(remote_host = %remote_host))]
    pub async fn register_node(
        &self,
        remote_host: &Url,
    ) -> Result<ContainerRegistration, Report<ContainerError>> {
        let ip = remote_host_ip(remote_host)?;
        let selector = self.config.created_by_selector();

        let pods = self
            .pods
            .list(&ListParams::default().labels(&selector))
            .await
            .change_context_lazy(|| ContainerError::ListFailed {
                selector: selector.clone(),
            })?;

        let pod = pod_status::find_pod_by_ip(&pods.items, &ip)
            .ok_or_else(|| Report::new(ContainerError::NodeNotFound { ip: ip.clone() }))?;

        pod_status::registration_from_pod(pod)
    }
}

/// Host part of a node address, IPv6 without brackets.
pub fn remote_host_ip(url: &Url) -> Result<String, Report<ContainerError>> {
    match url.host() {
        Some(Host::Ipv4(ip)) => Ok(ip.to_string()),
        Some(Host::Ipv6(ip)) => Ok(ip.to_string()),
        Some(Host::Domain(domain)) => Ok(domain.to_string()),
        None => Err(Report::new(ContainerError::InvalidRemoteHost {
            host: url.to_string(),
        })),
    }
}

/// Resolve on SIGINT or SIGTERM.
pub async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(e), _) | (_, Err(e)) => {
                    warn!("Failed to install signal handlers, cleanup on exit is disabled: {e}");
                    return std::future::pending().await;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler, cleanup on exit is disabled: {e}");
            return std::future::pending().await;
        }
        info!("Received Ctrl+C, initiating graceful shutdown");
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::VolumeMount;
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn exec_copy_without_shared_mount() {
        let config = ClientConfig::degraded(&KubernetesArgs::default());

        assert_eq!(CopyStrategy::for_config(&config), CopyStrategy::Exec);
    }

    #[test]
    fn shared_volume_copy_with_shared_mount() {
        let mut config = ClientConfig::degraded(&KubernetesArgs::default());
        config.shared_artifacts_mount = Some(VolumeMount {
            name: "grid-data".to_string(),
            mount_path: "/mnt/grid-data".to_string(),
            ..Default::default()
        });

        assert_eq!(CopyStrategy::for_config(&config), CopyStrategy::SharedVolume);
    }

    #[test]
    fn remote_host_ip_strips_scheme_and_port() {
        let url = Url::parse("http://10.12.0.7:5555").unwrap();
        assert_eq!(remote_host_ip(&url).unwrap(), "10.12.0.7");

        let url = Url::parse("http://[fd00::7]:5555/wd/hub").unwrap();
        assert_eq!(remote_host_ip(&url).unwrap(), "fd00::7");

        let url = Url::parse("http://grid-40000-abcde:5555").unwrap();
        assert_eq!(remote_host_ip(&url).unwrap(), "grid-40000-abcde");
    }

    #[test]
    fn remote_host_without_host_is_rejected() {
        let url = Url::parse("unix:/var/run/grid.sock").unwrap();

        assert!(remote_host_ip(&url).is_err());
    }
}
