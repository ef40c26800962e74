use std::path::PathBuf;

use clap::Args;

/// Kubernetes connection settings and operator overrides for discovery.
///
/// Every override falls back to what is discovered from our own pod when it is
/// unset or blank.
#[derive(Args, Clone, Debug, Default)]
pub struct KubernetesArgs {
    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "POD_NAMESPACE",
        help = "Namespace browser pods are created in (defaults to the client's namespace)"
    )]
    pub namespace: Option<String>,

    #[arg(
        long,
        env = "HOSTNAME",
        help = "Name of our own pod (falls back to /etc/hostname)"
    )]
    pub pod_name: Option<String>,

    #[arg(
        long,
        env = "GRID_CONTAINER_NAME",
        default_value = "grid",
        help = "Container of our own pod whose security context is propagated"
    )]
    pub container_name: String,

    #[arg(
        long,
        env = "GRID_APP_NAME",
        default_value = "grid",
        help = "App name used when our own pod cannot be discovered"
    )]
    pub app_name: String,

    #[arg(
        long,
        env = "GRID_KUBERNETES_TOLERATIONS",
        help = "YAML list of tolerations for browser pods"
    )]
    pub tolerations: Option<String>,

    #[arg(
        long,
        env = "GRID_KUBERNETES_NODE_SELECTOR",
        help = "Node selector for browser pods, e.g. pool=browsers,zone=a"
    )]
    pub node_selector: Option<String>,

    #[arg(
        long,
        env = "GRID_PERSISTENT_VOLUME_CLAIM",
        default_value = "browsercache-pvc",
        help = "Persistent volume claim backing the browser cache"
    )]
    pub persistent_volume_claim: String,

    #[arg(
        long,
        env = "GRID_VOLUME_MOUNT_PATH",
        default_value = "/home/seluser/.cache/google-chrome/Default/Cache",
        help = "Mount path of the browser cache inside browser pods"
    )]
    pub volume_mount_path: String,

    #[arg(
        long,
        env = "GRID_KUBERNETES_IMAGE_PULL_POLICY",
        help = "Image pull policy of browser pods (defaults to Always)"
    )]
    pub image_pull_policy: Option<String>,

    #[arg(long, env = "GRID_KUBERNETES_CPU_REQUEST")]
    pub cpu_request: Option<String>,

    #[arg(long, env = "GRID_KUBERNETES_CPU_LIMIT")]
    pub cpu_limit: Option<String>,

    #[arg(long, env = "GRID_KUBERNETES_MEMORY_REQUEST")]
    pub memory_request: Option<String>,

    #[arg(long, env = "GRID_KUBERNETES_MEMORY_LIMIT")]
    pub memory_limit: Option<String>,
}

/// Returns the value unless it is missing or blank.
pub(crate) fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
