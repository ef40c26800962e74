//! Decisions over pod state read from the API server.
//!
//! Every lifecycle query re-reads the pod; nothing is tracked locally. The
//! functions here turn what was read into answers. Missing pods are biased
//! differently: readiness must be proven, while a pod the API server has
//! forgotten counts as terminated.

use api_types::ContainerRegistration;
use error_stack::Report;
use k8s_openapi::api::core::v1::ContainerStateTerminated;
use k8s_openapi::api::core::v1::Pod;
use tracing::warn;

use crate::platform::k8s::ContainerError;

/// Environment variable carrying the live preview port of a browser node.
pub const PREVIEW_PORT_ENV: &str = "NOVNC_PORT";

const READY_CONDITION: &str = "Ready";

/// Ready iff the pod exists and its `Ready` condition is `True`.
pub fn is_pod_ready(pod: Option<&Pod>) -> bool {
    pod.and_then(|pod| pod.status.as_ref())
        .and_then(|status| status.conditions.as_ref())
        .and_then(|conditions| {
            conditions
                .iter()
                .find(|condition| condition.type_ == READY_CONDITION)
        })
        .is_some_and(|condition| condition.status == "True")
}

/// First terminated state among the pod's container statuses.
pub fn terminated_state(pod: &Pod) -> Option<&ContainerStateTerminated> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find_map(|status| status.state.as_ref()?.terminated.as_ref())
}

/// Terminated iff the pod is gone or one of its containers terminated.
pub fn is_pod_terminated(pod: Option<&Pod>) -> bool {
    pod.map_or(true, |pod| terminated_state(pod).is_some())
}

pub fn pod_ip(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.pod_ip.as_deref()
}

/// First pod in list order whose IP matches.
///
/// Two pods sharing an IP would be a platform bug; list order decides then.
pub fn find_pod_by_ip<'a>(pods: &'a [Pod], ip: &str) -> Option<&'a Pod> {
    pods.iter().find(|pod| pod_ip(pod) == Some(ip))
}

/// Value of an environment variable of the pod's first container.
pub fn first_container_env<'a>(pod: &'a Pod, name: &str) -> Option<&'a str> {
    pod.spec
        .as_ref()?
        .containers
        .first()?
        .env
        .as_ref()?
        .iter()
        .find(|env| env.name == name)?
        .value
        .as_deref()
}

/// Parse a port written in decimal or `0x`-prefixed hexadecimal.
pub fn parse_port(value: &str) -> Option<u16> {
    let value = value.trim();
    match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .or_else(|| value.strip_prefix('#'))
    {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

/// Registration record of a matched pod.
///
/// # Errors
///
/// - [`ContainerError::InvalidPreviewPort`] if the preview port is not a port
pub fn registration_from_pod(pod: &Pod) -> Result<ContainerRegistration, Report<ContainerError>> {
    let container_id = pod.metadata.name.clone().unwrap_or_default();

    let no_vnc_port = match first_container_env(pod, PREVIEW_PORT_ENV) {
        Some(value) => Some(parse_port(value).ok_or_else(|| {
            Report::new(ContainerError::InvalidPreviewPort {
                pod_name: container_id.clone(),
                value: value.to_string(),
            })
        })?),
        None => {
            warn!(container_id = %container_id, "Couldn't find {PREVIEW_PORT_ENV}, live preview will not work");
            None
        }
    };

    Ok(ContainerRegistration {
        ip_address: pod_ip(pod).unwrap_or_default().to_string(),
        container_id,
        no_vnc_port,
    })
}
