//! Kubernetes integration module.
//!
//! This module provisions browser-node pods, watches their lifecycle and pulls
//! their artifacts back out once their work is done.
//!
//! The main components are:
//! - [`ClientConfig`]: Configuration discovered once from the pod we run in
//! - [`pod_spec`]: Pure assembly of the pod handed to the API server
//! - [`ContainerClient`]: Lifecycle operations on spawned pods
//! - [`exec_copy`] / [`shared_volume`]: The two artifact copy strategies

use core::error::Error;

pub mod artifacts;
pub mod container_client;
pub mod discovery;
pub mod exec_command;
pub mod exec_copy;
pub mod pod_spec;
pub mod pod_status;
pub mod shared_volume;

pub use artifacts::Artifact;
pub use artifacts::ArtifactStream;
pub use container_client::ContainerClient;
pub use container_client::CopyStrategy;
pub use container_client::SweepSummary;
pub use discovery::ClientConfig;

/// Errors that can occur while talking to the Kubernetes API.
#[derive(Debug, derive_more::Display)]
pub enum KubernetesError {
    #[display("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
}

impl Error for KubernetesError {}

/// Errors raised while discovering configuration from our own pod.
#[derive(Debug, derive_more::Display)]
pub enum DiscoveryError {
    #[display("Failed to resolve own hostname")]
    HostnameUnavailable,
    #[display("Failed to look up own pod {pod_name}")]
    SelfPodLookupFailed { pod_name: String },
    #[display("Own pod {pod_name} has no `app` label")]
    MissingAppLabel { pod_name: String },
    #[display("Invalid value for {variable}: {message}")]
    InvalidOverride {
        variable: &'static str,
        message: String,
    },
}

impl Error for DiscoveryError {}

/// Errors returned by container lifecycle and artifact operations.
#[derive(Debug, derive_more::Display)]
pub enum ContainerError {
    #[display("Failed to create pod with prefix {prefix}")]
    CreationRejected { prefix: String },
    #[display("Failed to look up pod {pod_name}")]
    LookupFailed { pod_name: String },
    #[display("Failed to list pods labelled {selector}")]
    ListFailed { selector: String },
    #[display("SHARED_DIR not present in pod {pod_name}")]
    SharedDirMissing { pod_name: String },
    #[display("Unable to locate pod by ip address {ip}, registration will fail")]
    NodeNotFound { ip: String },
    #[display("Remote host {host} has no host part")]
    InvalidRemoteHost { host: String },
    #[display("Invalid preview port `{value}` in pod {pod_name}")]
    InvalidPreviewPort { pod_name: String, value: String },
    #[display("Failed to execute command in {container_id}")]
    ExecFailed { container_id: String },
    #[display("Failed to read artifacts of {container_id}")]
    ArtifactReadFailed { container_id: String },
    #[display("Failed to write artifact {name} to {path}")]
    ArtifactWriteFailed { name: String, path: String },
}

impl Error for ContainerError {}

/// Whether the API server answered 404 for the requested object.
pub fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}

#[cfg(test)]
mod tests {
    use kube::error::ErrorResponse;

    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "pods \"grid-40000-abcde\" not found".to_string(),
            reason: "NotFound".to_string(),
            code,
        })
    }

    #[test]
    fn not_found_is_detected() {
        assert!(is_not_found(&api_error(404)));
    }

    #[test]
    fn other_api_errors_are_not_not_found() {
        assert!(!is_not_found(&api_error(409)));
        assert!(!is_not_found(&api_error(500)));
    }
}
