//! Discovery of ambient configuration from the pod we run in.
//!
//! Browser pods inherit scheduling constraints, security contexts and shared
//! storage from their parent. All of it is read once at startup into an
//! immutable [`ClientConfig`]. Single steps are best-effort: a step that fails
//! leaves its field empty and the API server defaults apply.

use std::collections::BTreeMap;

use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::HostAlias;
use k8s_openapi::api::core::v1::LocalObjectReference;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::PodSecurityContext;
use k8s_openapi::api::core::v1::SecurityContext;
use k8s_openapi::api::core::v1::Toleration;
use k8s_openapi::api::core::v1::Volume;
use k8s_openapi::api::core::v1::VolumeMount;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::Resource;
use kube::Api;
use tracing::info;
use tracing::warn;

use crate::config::non_blank;
use crate::config::KubernetesArgs;
use crate::platform::k8s::DiscoveryError;

/// Mount points of our own pod that are never propagated to browser pods.
pub const PROTECTED_NODE_MOUNT_POINTS: [&str; 2] = ["/home/seluser/videos", "/dev/shm"];

/// Volumes with this name suffix are candidates for the shared artifacts mount.
pub const SHARED_VOLUME_SUFFIX: &str = "-data";

/// Label carrying the application name on our own pod.
pub const APP_LABEL: &str = "app";

/// Label marking browser pods created by this client.
pub const CREATED_BY_LABEL: &str = "createdBy";

const DEFAULT_IMAGE_PULL_POLICY: &str = "Always";

/// Identity of our own pod, used as owner of every browser pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerPod {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
}

/// A volume mount of our own pod together with the volume backing it.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedMount {
    pub mount: VolumeMount,
    pub volume: Volume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Cpu,
    Memory,
}

impl ResourceKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceClass {
    Request,
    Limit,
}

/// Resource quantities of browser pods, keyed by resource name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceQuantities {
    pub requests: BTreeMap<String, Quantity>,
    pub limits: BTreeMap<String, Quantity>,
}

impl ResourceQuantities {
    const OVERRIDES: [(ResourceKind, ResourceClass); 4] = [
        (ResourceKind::Cpu, ResourceClass::Request),
        (ResourceKind::Cpu, ResourceClass::Limit),
        (ResourceKind::Memory, ResourceClass::Request),
        (ResourceKind::Memory, ResourceClass::Limit),
    ];

    /// Collect the non-blank resource overrides. Nothing is synthesized for
    /// missing ones.
    pub fn from_args(args: &KubernetesArgs) -> Self {
        let mut quantities = Self::default();
        for (kind, class) in Self::OVERRIDES {
            let value = match (kind, class) {
                (ResourceKind::Cpu, ResourceClass::Request) => args.cpu_request.as_deref(),
                (ResourceKind::Cpu, ResourceClass::Limit) => args.cpu_limit.as_deref(),
                (ResourceKind::Memory, ResourceClass::Request) => args.memory_request.as_deref(),
                (ResourceKind::Memory, ResourceClass::Limit) => args.memory_limit.as_deref(),
            };
            let Some(value) = non_blank(value) else {
                continue;
            };
            let table = match class {
                ResourceClass::Request => &mut quantities.requests,
                ResourceClass::Limit => &mut quantities.limits,
            };
            table.insert(kind.as_str().to_string(), Quantity(value.to_string()));
        }
        quantities
    }
}

/// Configuration shared by every browser pod this client creates.
///
/// Built once and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub app_name: String,
    /// `None` when our own pod could not be discovered
    pub owner: Option<OwnerPod>,
    pub shared_mounts: Vec<SharedMount>,
    pub shared_artifacts_mount: Option<VolumeMount>,
    pub host_aliases: Vec<HostAlias>,
    pub node_selector: BTreeMap<String, String>,
    pub tolerations: Vec<Toleration>,
    pub image_pull_policy: String,
    pub image_pull_secrets: Vec<LocalObjectReference>,
    pub pod_security_context: Option<PodSecurityContext>,
    pub container_security_context: Option<SecurityContext>,
    pub scheduler_name: Option<String>,
    pub resources: ResourceQuantities,
    pub persistent_volume_claim: String,
    pub cache_mount_path: String,
}

impl ClientConfig {
    /// Build the configuration from our own pod and the operator overrides.
    ///
    /// A pod without an `app` label falls back to the configured app name;
    /// everything else is still taken from the pod.
    pub fn from_self_pod(pod: &Pod, args: &KubernetesArgs) -> Self {
        let pod_name = pod.metadata.name.clone().unwrap_or_default();
        let app_name = match pod
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(APP_LABEL))
        {
            Some(app_name) => app_name.clone(),
            None => {
                let report = Report::new(DiscoveryError::MissingAppLabel {
                    pod_name: pod_name.clone(),
                });
                warn!(app = %args.app_name, "Using configured app name: {report:?}");
                args.app_name.clone()
            }
        };

        let owner = pod.metadata.uid.clone().map(|uid| OwnerPod {
            api_version: Pod::API_VERSION.to_string(),
            kind: Pod::KIND.to_string(),
            name: pod_name,
            uid,
        });

        Self::assemble(app_name, owner, Some(pod), args)
    }

    /// Configuration used when our own pod cannot be discovered: only operator
    /// overrides and fixed defaults apply.
    pub fn degraded(args: &KubernetesArgs) -> Self {
        Self::assemble(args.app_name.clone(), None, None, args)
    }

    fn assemble(
        app_name: String,
        owner: Option<OwnerPod>,
        pod: Option<&Pod>,
        args: &KubernetesArgs,
    ) -> Self {
        let spec = pod.and_then(|pod| pod.spec.as_ref());

        let (shared_mounts, shared_artifacts_mount) = spec
            .map(|spec| {
                let mounts = spec
                    .containers
                    .first()
                    .and_then(|container| container.volume_mounts.as_deref())
                    .unwrap_or_default();
                discover_folder_mounts(mounts, spec.volumes.as_deref().unwrap_or_default())
            })
            .unwrap_or_default();

        let container_security_context = spec.and_then(|spec| {
            spec.containers
                .iter()
                .find(|container| container.name == args.container_name)
                .and_then(|container| container.security_context.clone())
        });

        Self {
            app_name,
            owner,
            shared_mounts,
            shared_artifacts_mount,
            host_aliases: spec
                .and_then(|spec| spec.host_aliases.clone())
                .unwrap_or_default(),
            node_selector: discover_node_selector(
                args.node_selector.as_deref(),
                spec.and_then(|spec| spec.node_selector.as_ref()),
            ),
            tolerations: discover_tolerations(
                args.tolerations.as_deref(),
                spec.and_then(|spec| spec.tolerations.as_deref()),
            ),
            image_pull_policy: non_blank(args.image_pull_policy.as_deref())
                .unwrap_or(DEFAULT_IMAGE_PULL_POLICY)
                .to_string(),
            image_pull_secrets: spec
                .and_then(|spec| spec.image_pull_secrets.clone())
                .unwrap_or_default(),
            pod_security_context: spec.and_then(|spec| spec.security_context.clone()),
            container_security_context,
            scheduler_name: spec
                .and_then(|spec| spec.scheduler_name.as_deref())
                .and_then(|name| non_blank(Some(name)))
                .map(str::to_string),
            resources: ResourceQuantities::from_args(args),
            persistent_volume_claim: args.persistent_volume_claim.clone(),
            cache_mount_path: args.volume_mount_path.clone(),
        }
    }

    /// `createdBy=<app>`, the label scoping cleanup and registration.
    pub fn created_by_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(CREATED_BY_LABEL.to_string(), self.app_name.clone())])
    }

    /// Owner labels set on every browser pod.
    pub fn owner_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.created_by_labels();
        labels.insert(APP_LABEL.to_string(), self.app_name.clone());
        labels
    }

    /// Label selector matching every browser pod we created.
    pub fn created_by_selector(&self) -> String {
        format!("{CREATED_BY_LABEL}={}", self.app_name)
    }
}

/// Split our own mounts into the ones propagated to browser pods and the
/// shared artifacts mount.
///
/// Mounts under a protected mount point are skipped. The first remaining
/// mount backed by a non-empty-dir volume whose name ends in
/// [`SHARED_VOLUME_SUFFIX`] becomes the shared artifacts mount.
pub fn discover_folder_mounts(
    mounts: &[VolumeMount],
    volumes: &[Volume],
) -> (Vec<SharedMount>, Option<VolumeMount>) {
    let mut shared_mounts = Vec::new();
    let mut shared_artifacts_mount = None;

    let valid_mounts = mounts.iter().filter(|mount| {
        !PROTECTED_NODE_MOUNT_POINTS
            .iter()
            .any(|path| mount.mount_path.starts_with(path))
    });

    for mount in valid_mounts {
        let Some(volume) = volumes
            .iter()
            .find(|volume| volume.name.eq_ignore_ascii_case(&mount.name))
        else {
            continue;
        };

        if shared_artifacts_mount.is_none()
            && volume.empty_dir.is_none()
            && volume.name.ends_with(SHARED_VOLUME_SUFFIX)
        {
            shared_artifacts_mount = Some(mount.clone());
        }

        shared_mounts.push(SharedMount {
            mount: mount.clone(),
            volume: volume.clone(),
        });
    }

    (shared_mounts, shared_artifacts_mount)
}

/// Parse a `key=value,key2=value2` node selector.
pub fn parse_node_selector(raw: &str) -> Result<BTreeMap<String, String>, Report<DiscoveryError>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.trim().to_string()))
            }
            _ => Err(Report::new(DiscoveryError::InvalidOverride {
                variable: "GRID_KUBERNETES_NODE_SELECTOR",
                message: format!("expected key=value, got `{pair}`"),
            })),
        })
        .collect()
}

/// Parse a YAML list of tolerations.
pub fn parse_tolerations(raw: &str) -> Result<Vec<Toleration>, Report<DiscoveryError>> {
    serde_yaml::from_str(raw).change_context(DiscoveryError::InvalidOverride {
        variable: "GRID_KUBERNETES_TOLERATIONS",
        message: "expected a YAML list of tolerations".to_string(),
    })
}

fn discover_node_selector(
    from_env: Option<&str>,
    configured: Option<&BTreeMap<String, String>>,
) -> BTreeMap<String, String> {
    if let Some(raw) = non_blank(from_env) {
        match parse_node_selector(raw) {
            Ok(selector) if !selector.is_empty() => return selector,
            Ok(_) => {}
            Err(e) => warn!("Ignoring node selector override: {e:?}"),
        }
    }
    configured.cloned().unwrap_or_default()
}

fn discover_tolerations(from_env: Option<&str>, configured: Option<&[Toleration]>) -> Vec<Toleration> {
    if let Some(raw) = non_blank(from_env) {
        match parse_tolerations(raw) {
            Ok(tolerations) if !tolerations.is_empty() => return tolerations,
            Ok(_) => {}
            Err(e) => warn!("Ignoring tolerations override: {e:?}"),
        }
    }
    configured.map(<[Toleration]>::to_vec).unwrap_or_default()
}

/// Resolve the name of our own pod: the configured pod name, else the
/// machine hostname.
pub async fn resolve_hostname(args: &KubernetesArgs) -> Result<String, Report<DiscoveryError>> {
    if let Some(name) = non_blank(args.pod_name.as_deref()) {
        return Ok(name.to_string());
    }

    let hostname = tokio::fs::read_to_string("/etc/hostname")
        .await
        .change_context(DiscoveryError::HostnameUnavailable)?;
    non_blank(Some(&hostname))
        .map(str::to_string)
        .ok_or_else(|| Report::new(DiscoveryError::HostnameUnavailable))
}

/// Look ourselves up through the API server and build the client configuration.
///
/// # Errors
///
/// - [`DiscoveryError::HostnameUnavailable`] if our own name cannot be resolved
/// - [`DiscoveryError::SelfPodLookupFailed`] if our own pod cannot be fetched
pub async fn discover(
    pods: &Api<Pod>,
    args: &KubernetesArgs,
) -> Result<ClientConfig, Report<DiscoveryError>> {
    let hostname = resolve_hostname(args).await?;

    let pod = pods
        .get(&hostname)
        .await
        .change_context(DiscoveryError::SelfPodLookupFailed {
            pod_name: hostname.clone(),
        })?;

    let config = ClientConfig::from_self_pod(&pod, args);

    info!(
        pod_name = %hostname,
        app = %config.app_name,
        shared_artifacts_mount = ?config.shared_artifacts_mount.as_ref().map(|m| &m.mount_path),
        shared_mounts = config.shared_mounts.len(),
        limits = ?config.resources.limits,
        requests = ?config.resources.requests,
        "Kubernetes support initialised"
    );

    Ok(config)
}
