//! Assembly of browser pods.
//!
//! [`build_pod`] is a pure function of the discovered [`ClientConfig`], the
//! caller's [`CreateRequest`] and an optional shared working directory. The
//! only I/O, creating the working directory, lives in [`allocate_work_dir`].

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use api_types::CreateRequest;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::EmptyDirVolumeSource;
use k8s_openapi::api::core::v1::EnvVar;
use k8s_openapi::api::core::v1::ExecAction;
use k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::api::core::v1::Probe;
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::api::core::v1::Volume;
use k8s_openapi::api::core::v1::VolumeMount;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use tracing::error;
use uuid::Uuid;

use crate::platform::k8s::discovery::ClientConfig;
use crate::platform::k8s::discovery::OwnerPod;

/// Name of the single container of a browser pod.
pub const NODE_CONTAINER_NAME: &str = "selenium-node";

pub const SHARED_DIR_ENV: &str = "SHARED_DIR";
pub const VIDEOS_DIR_ENV: &str = "VIDEOS_DIR";
pub const LOGS_DIR_ENV: &str = "LOGS_DIR";

const SHM_VOLUME: &str = "dshm";
const SHM_MOUNT_PATH: &str = "/dev/shm";
const CACHE_VOLUME: &str = "cache";
const VIDEOS_SUBDIR: &str = "videos";
const LOGS_SUBDIR: &str = "var/log/cont";

/// Readiness probe timing. Browser nodes may take a while to boot, hence the
/// generous failure threshold.
pub mod readiness {
    pub const INITIAL_DELAY_SECONDS: i32 = 5;
    pub const FAILURE_THRESHOLD: i32 = 60;
    pub const PERIOD_SECONDS: i32 = 1;
    pub const TIMEOUT_SECONDS: i32 = 5;
    pub const SUCCESS_THRESHOLD: i32 = 1;
}

/// Per-pod working directory on the shared artifacts mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedWorkDir {
    root: PathBuf,
}

impl SharedWorkDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Fresh, uniquely named directory under the mount.
    pub fn unique_under(mount_path: &str) -> Self {
        Self::new(Path::new(mount_path).join(Uuid::new_v4().to_string()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn videos(&self) -> PathBuf {
        self.root.join(VIDEOS_SUBDIR)
    }

    pub fn logs(&self) -> PathBuf {
        self.root.join(LOGS_SUBDIR)
    }

    /// Environment variables telling the browser node where to write.
    pub fn env_vars(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (SHARED_DIR_ENV.to_string(), self.root.display().to_string()),
            (VIDEOS_DIR_ENV.to_string(), self.videos().display().to_string()),
            (LOGS_DIR_ENV.to_string(), self.logs().display().to_string()),
        ])
    }
}

/// Allocate a working directory under the shared artifacts mount and create
/// its tree locally; the mount is the same storage the browser pod sees.
///
/// Creation failures are logged only. The pod still runs, and artifacts can
/// still be copied out over exec.
pub async fn allocate_work_dir(mount: &VolumeMount) -> SharedWorkDir {
    let work_dir = SharedWorkDir::unique_under(&mount.mount_path);

    if !tokio::fs::try_exists(work_dir.root()).await.unwrap_or(false) {
        for dir in [work_dir.videos(), work_dir.logs()] {
            if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                error!(work_dir = %work_dir.root().display(), "Error creating folder {}: {e}", dir.display());
            }
        }
    }

    work_dir
}

/// `{app}-{port}-`, completed by the API server with a unique suffix.
pub fn generate_name(app_name: &str, node_port: &str) -> String {
    format!("{app_name}-{node_port}-")
}

/// Shell command polling the node's status endpoint until it reports ready.
pub fn readiness_command(node_port: &str) -> Vec<String> {
    vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        format!(
            "http_proxy=\"\" curl -s http://`hostname -i`:{node_port}/wd/hub/status | jq .value.ready | grep true"
        ),
    ]
}

pub fn readiness_probe(node_port: &str) -> Probe {
    Probe {
        exec: Some(ExecAction {
            command: Some(readiness_command(node_port)),
        }),
        initial_delay_seconds: Some(readiness::INITIAL_DELAY_SECONDS),
        failure_threshold: Some(readiness::FAILURE_THRESHOLD),
        period_seconds: Some(readiness::PERIOD_SECONDS),
        timeout_seconds: Some(readiness::TIMEOUT_SECONDS),
        success_threshold: Some(readiness::SUCCESS_THRESHOLD),
        ..Default::default()
    }
}

fn owner_reference(owner: &OwnerPod) -> OwnerReference {
    OwnerReference {
        api_version: owner.api_version.clone(),
        kind: owner.kind.clone(),
        name: owner.name.clone(),
        uid: owner.uid.clone(),
        controller: Some(true),
        block_owner_deletion: Some(false),
    }
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    (!items.is_empty()).then_some(items)
}

fn non_empty_map<V>(map: BTreeMap<String, V>) -> Option<BTreeMap<String, V>> {
    (!map.is_empty()).then_some(map)
}

/// Labels of a browser pod. Caller labels win over owner labels, except
/// `createdBy`: cleanup and registration select pods by it.
pub fn pod_labels(config: &ClientConfig, request: &CreateRequest) -> BTreeMap<String, String> {
    let mut labels = config.owner_labels();
    labels.extend(request.labels.clone());
    labels.extend(config.created_by_labels());
    labels
}

/// Caller variables plus the working directory variables, which win on
/// collision.
pub fn env_vars(request: &CreateRequest, work_dir: Option<&SharedWorkDir>) -> Vec<EnvVar> {
    let mut env = request.env.clone();
    if let Some(work_dir) = work_dir {
        env.extend(work_dir.env_vars());
    }

    env.into_iter()
        .map(|(name, value)| EnvVar {
            name,
            value: Some(value),
            value_from: None,
        })
        .collect()
}

/// Build the pod submitted for one creation request.
pub fn build_pod(
    config: &ClientConfig,
    request: &CreateRequest,
    work_dir: Option<&SharedWorkDir>,
) -> Pod {
    let mut volumes = vec![
        Volume {
            name: SHM_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource {
                medium: Some("Memory".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: CACHE_VOLUME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: config.persistent_volume_claim.clone(),
                read_only: Some(false),
            }),
            ..Default::default()
        },
    ];
    let mut volume_mounts = vec![
        VolumeMount {
            name: SHM_VOLUME.to_string(),
            mount_path: SHM_MOUNT_PATH.to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: CACHE_VOLUME.to_string(),
            mount_path: config.cache_mount_path.clone(),
            ..Default::default()
        },
    ];
    volumes.extend(config.shared_mounts.iter().map(|shared| shared.volume.clone()));
    volume_mounts.extend(config.shared_mounts.iter().map(|shared| shared.mount.clone()));

    let container = Container {
        name: NODE_CONTAINER_NAME.to_string(),
        image: Some(request.image.clone()),
        image_pull_policy: Some(config.image_pull_policy.clone()),
        env: Some(env_vars(request, work_dir)),
        security_context: config.container_security_context.clone(),
        volume_mounts: Some(volume_mounts),
        resources: Some(ResourceRequirements {
            limits: non_empty_map(config.resources.limits.clone()),
            requests: non_empty_map(config.resources.requests.clone()),
            ..Default::default()
        }),
        readiness_probe: Some(readiness_probe(&request.node_port)),
        ..Default::default()
    };

    Pod {
        metadata: ObjectMeta {
            generate_name: Some(generate_name(&config.app_name, &request.node_port)),
            labels: Some(pod_labels(config, request)),
            owner_references: config
                .owner
                .as_ref()
                .map(|owner| vec![owner_reference(owner)]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            node_selector: non_empty_map(config.node_selector.clone()),
            tolerations: non_empty(config.tolerations.clone()),
            security_context: config.pod_security_context.clone(),
            volumes: Some(volumes),
            restart_policy: Some("Never".to_string()),
            image_pull_secrets: non_empty(config.image_pull_secrets.clone()),
            scheduler_name: config.scheduler_name.clone().filter(|name| !name.is_empty()),
            host_aliases: non_empty(config.host_aliases.clone()),
            ..Default::default()
        }),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::HostAlias;
    use k8s_openapi::api::core::v1::LocalObjectReference;
    use k8s_openapi::api::core::v1::Toleration;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::config::KubernetesArgs;
    use crate::platform::k8s::discovery::SharedMount;

    fn test_config() -> ClientConfig {
        ClientConfig::degraded(&KubernetesArgs {
            app_name: "grid".to_string(),
            container_name: "grid".to_string(),
            persistent_volume_claim: "browsercache-pvc".to_string(),
            volume_mount_path: "/cache".to_string(),
            ..Default::default()
        })
    }

    fn spec_of(pod: &Pod) -> &PodSpec {
        pod.spec.as_ref().unwrap()
    }

    fn env_value<'a>(pod: &'a Pod, name: &str) -> Option<&'a str> {
        spec_of(pod).containers[0]
            .env
            .as_ref()?
            .iter()
            .find(|env| env.name == name)?
            .value
            .as_deref()
    }

    #[test]
    fn tolerations_and_host_aliases_round_trip() {
        let mut config = test_config();
        config.tolerations = vec![
            Toleration {
                key: Some("dedicated".to_string()),
                operator: Some("Exists".to_string()),
                ..Default::default()
            },
            Toleration {
                key: Some("spot".to_string()),
                operator: Some("Exists".to_string()),
                ..Default::default()
            },
        ];
        config.host_aliases = vec![HostAlias {
            hostnames: Some(vec!["grid.local".to_string()]),
            ..Default::default()
        }];

        let pod = build_pod(&config, &CreateRequest::new("grid", "selenium/node", "40000"), None);
        let spec = spec_of(&pod);

        assert_eq!(spec.tolerations.as_ref(), Some(&config.tolerations));
        assert_eq!(spec.host_aliases.as_ref(), Some(&config.host_aliases));
        assert_eq!(spec.scheduler_name, None);
    }

    #[test]
    fn scheduler_name_is_propagated_when_set() {
        let mut config = test_config();
        config.scheduler_name = Some("bin-packing".to_string());

        let pod = build_pod(&config, &CreateRequest::new("grid", "selenium/node", "40000"), None);

        assert_eq!(spec_of(&pod).scheduler_name.as_deref(), Some("bin-packing"));
    }

    #[test]
    fn metadata_carries_prefix_labels_and_owner() {
        let mut config = test_config();
        config.owner = Some(OwnerPod {
            api_version: "v1".to_string(),
            kind: "Pod".to_string(),
            name: "grid-hub-0".to_string(),
            uid: "3f1c-uid".to_string(),
        });
        let request = CreateRequest::new("grid", "selenium/node", "40000")
            .with_label("app", "override")
            .with_label("team", "qa");

        let pod = build_pod(&config, &request, None);

        assert_eq!(pod.metadata.generate_name.as_deref(), Some("grid-40000-"));
        assert_eq!(
            pod.metadata.labels,
            Some(BTreeMap::from([
                ("app".to_string(), "override".to_string()),
                ("createdBy".to_string(), "grid".to_string()),
                ("team".to_string(), "qa".to_string()),
            ]))
        );
        let owner = &pod.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.name, "grid-hub-0");
        assert_eq!(owner.uid, "3f1c-uid");
        assert_eq!(owner.controller, Some(true));
        assert_eq!(owner.block_owner_deletion, Some(false));
    }

    #[test]
    fn created_by_label_cannot_be_overridden() {
        let config = test_config();
        let request = CreateRequest::new("grid", "selenium/node", "40000")
            .with_label("createdBy", "someone-else");

        let pod = build_pod(&config, &request, None);

        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels.get("createdBy").map(String::as_str), Some("grid"));
        assert_eq!(
            config.created_by_selector(),
            format!("createdBy={}", labels["createdBy"])
        );
    }

    #[test]
    fn degraded_config_sets_no_owner_reference() {
        let pod = build_pod(
            &test_config(),
            &CreateRequest::new("grid", "selenium/node", "40000"),
            None,
        );

        assert_eq!(pod.metadata.owner_references, None);
    }

    #[test]
    fn container_has_fixed_ingredients() {
        let mut config = test_config();
        config.resources.limits.insert("cpu".to_string(), Quantity("1".to_string()));

        let pod = build_pod(&config, &CreateRequest::new("grid", "selenium/node", "40000"), None);
        let spec = spec_of(&pod);
        let container = &spec.containers[0];

        assert_eq!(spec.containers.len(), 1);
        assert_eq!(container.name, NODE_CONTAINER_NAME);
        assert_eq!(container.image.as_deref(), Some("selenium/node"));
        assert_eq!(container.image_pull_policy.as_deref(), Some("Always"));
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));

        let volumes: Vec<_> = spec.volumes.as_ref().unwrap().iter().map(|v| v.name.as_str()).collect();
        assert_eq!(volumes, vec!["dshm", "cache"]);
        let mounts: Vec<_> = container
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .map(|m| (m.name.as_str(), m.mount_path.as_str()))
            .collect();
        assert_eq!(mounts, vec![("dshm", "/dev/shm"), ("cache", "/cache")]);

        let resources = container.resources.as_ref().unwrap();
        assert_eq!(
            resources.limits,
            Some(BTreeMap::from([("cpu".to_string(), Quantity("1".to_string()))]))
        );
        assert_eq!(resources.requests, None);
    }

    #[test]
    fn readiness_probe_uses_fixed_policy() {
        let pod = build_pod(
            &test_config(),
            &CreateRequest::new("grid", "selenium/node", "40001"),
            None,
        );
        let probe = spec_of(&pod).containers[0].readiness_probe.clone().unwrap();

        let command = probe.exec.and_then(|exec| exec.command).unwrap();
        assert_eq!(command[0], "/bin/sh");
        assert_eq!(
            command[2],
            "http_proxy=\"\" curl -s http://`hostname -i`:40001/wd/hub/status | jq .value.ready | grep true"
        );
        assert_eq!(probe.initial_delay_seconds, Some(5));
        assert_eq!(probe.failure_threshold, Some(60));
        assert_eq!(probe.period_seconds, Some(1));
        assert_eq!(probe.timeout_seconds, Some(5));
        assert_eq!(probe.success_threshold, Some(1));
    }

    #[test]
    fn shared_mounts_are_propagated() {
        let mut config = test_config();
        let mount = VolumeMount {
            name: "grid-data".to_string(),
            mount_path: "/tmp/mounted".to_string(),
            ..Default::default()
        };
        let volume = Volume {
            name: "grid-data".to_string(),
            ..Default::default()
        };
        config.shared_mounts = vec![SharedMount {
            mount: mount.clone(),
            volume: volume.clone(),
        }];

        let pod = build_pod(&config, &CreateRequest::new("grid", "selenium/node", "40000"), None);
        let spec = spec_of(&pod);

        assert!(spec.volumes.as_ref().unwrap().contains(&volume));
        assert!(spec.containers[0]
            .volume_mounts
            .as_ref()
            .unwrap()
            .contains(&mount));
    }

    #[test]
    fn work_dir_injects_environment() {
        let request = CreateRequest::new("grid", "selenium/node", "40000")
            .with_env("SCREEN_WIDTH", "1920")
            .with_env(SHARED_DIR_ENV, "/somewhere/else");
        let work_dir = SharedWorkDir::new("/tmp/mounted/1234");

        let pod = build_pod(&test_config(), &request, Some(&work_dir));

        assert_eq!(env_value(&pod, "SCREEN_WIDTH"), Some("1920"));
        assert_eq!(env_value(&pod, SHARED_DIR_ENV), Some("/tmp/mounted/1234"));
        assert_eq!(env_value(&pod, VIDEOS_DIR_ENV), Some("/tmp/mounted/1234/videos"));
        assert_eq!(env_value(&pod, LOGS_DIR_ENV), Some("/tmp/mounted/1234/var/log/cont"));
    }

    #[test]
    fn no_work_dir_means_no_derived_environment() {
        let pod = build_pod(
            &test_config(),
            &CreateRequest::new("grid", "selenium/node", "40000"),
            None,
        );

        assert_eq!(env_value(&pod, SHARED_DIR_ENV), None);
        assert_eq!(env_value(&pod, VIDEOS_DIR_ENV), None);
        assert_eq!(env_value(&pod, LOGS_DIR_ENV), None);
    }

    #[test]
    fn empty_scheduling_fields_are_omitted() {
        let pod = build_pod(
            &test_config(),
            &CreateRequest::new("grid", "selenium/node", "40000"),
            None,
        );
        let spec = spec_of(&pod);

        assert_eq!(spec.node_selector, None);
        assert_eq!(spec.tolerations, None);
        assert_eq!(spec.image_pull_secrets, None);
        assert_eq!(spec.host_aliases, None);
    }

    #[test]
    fn image_pull_secrets_are_propagated() {
        let mut config = test_config();
        let secret: LocalObjectReference =
            serde_json::from_value(serde_json::json!({ "name": "regcred" })).unwrap();
        config.image_pull_secrets = vec![secret.clone()];

        let pod = build_pod(&config, &CreateRequest::new("grid", "selenium/node", "40000"), None);

        assert_eq!(spec_of(&pod).image_pull_secrets, Some(vec![secret]));
    }

    #[test_log::test(tokio::test)]
    async fn allocate_work_dir_creates_tree() {
        let dir = tempfile::tempdir().unwrap();
        let mount = VolumeMount {
            name: "grid-data".to_string(),
            mount_path: dir.path().display().to_string(),
            ..Default::default()
        };

        let work_dir = allocate_work_dir(&mount).await;

        assert!(work_dir.root().starts_with(dir.path()));
        assert!(work_dir.videos().is_dir());
        assert!(work_dir.logs().is_dir());
    }

    #[test_log::test(tokio::test)]
    async fn allocate_work_dir_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let mount = VolumeMount {
            name: "grid-data".to_string(),
            mount_path: blocker.display().to_string(),
            ..Default::default()
        };

        let work_dir = allocate_work_dir(&mount).await;

        assert!(work_dir.root().starts_with(&blocker));
        assert!(!work_dir.videos().exists());
    }

    #[test]
    fn unique_work_dirs_differ() {
        let first = SharedWorkDir::unique_under("/tmp/mounted");
        let second = SharedWorkDir::unique_under("/tmp/mounted");

        assert!(first != second);
    }
}
