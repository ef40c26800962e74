//! Shared API type definitions
//!
//! This crate contains the records exchanged between the grid controller and
//! the pod client: container creation requests, the status returned for a
//! created container, and the identity resolved when a node registers.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// Everything the controller decides about a container it wants created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    /// Name of the requesting grid component, used for tracing only
    pub name_prefix: String,
    /// Browser node image to run
    pub image: String,
    /// Environment variables passed to the browser node
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Port the node listens on; also part of the generated pod name
    pub node_port: String,
    /// Extra labels set by the caller; they win over owner labels on collision
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl CreateRequest {
    pub fn new(
        name_prefix: impl Into<String>,
        image: impl Into<String>,
        node_port: impl Into<String>,
    ) -> Self {
        Self {
            name_prefix: name_prefix.into(),
            image: image.into(),
            node_port: node_port.into(),
            ..Default::default()
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Result of a successful container creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerCreationStatus {
    pub is_created: bool,
    pub container_name: String,
    pub container_id: String,
    pub node_port: String,
}

impl ContainerCreationStatus {
    /// Status for a container accepted by the platform. Pods are addressed by
    /// name, so the name doubles as the container id.
    pub fn created(container_name: impl Into<String>, node_port: impl Into<String>) -> Self {
        let container_name = container_name.into();
        Self {
            is_created: true,
            container_id: container_name.clone(),
            container_name,
            node_port: node_port.into(),
        }
    }
}

impl std::fmt::Display for ContainerCreationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (port {})", self.container_name, self.node_port)
    }
}

/// Identity of a registering node, resolved from its IP address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRegistration {
    pub container_id: String,
    pub ip_address: String,
    /// Live preview port, when the node exposes one
    pub no_vnc_port: Option<u16>,
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn created_status_uses_name_as_id() {
        let status = ContainerCreationStatus::created("grid-40000-abcde", "40000");

        assert!(status.is_created);
        assert_eq!(status.container_id, "grid-40000-abcde");
        assert_eq!(status.container_name, "grid-40000-abcde");
        assert_eq!(status.node_port, "40000");
        assert_eq!(status.to_string(), "grid-40000-abcde (port 40000)");
    }

    #[test]
    fn create_request_deserializes_with_defaults() {
        let request: CreateRequest = serde_json::from_str(
            r#"{"namePrefix": "grid", "image": "selenium/node", "nodePort": "40000"}"#,
        )
        .unwrap();

        assert_eq!(request, CreateRequest::new("grid", "selenium/node", "40000"));
        assert!(request.env.is_empty());
        assert!(request.labels.is_empty());
    }

    #[test]
    fn registration_serializes_camel_case() {
        let registration = ContainerRegistration {
            container_id: "grid-40000-abcde".to_string(),
            ip_address: "10.0.0.7".to_string(),
            no_vnc_port: Some(6080),
        };

        let json = serde_json::to_value(&registration).unwrap();
        assert_eq!(json["containerId"], "grid-40000-abcde");
        assert_eq!(json["noVncPort"], 6080);
    }
}
