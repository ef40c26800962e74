//! Artifact copy straight from the shared artifacts mount.
//!
//! A pod created while a shared mount exists writes its artifacts below its
//! own `SHARED_DIR`, which is storage we see locally too. No exec involved.

use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use tracing::debug;

use crate::platform::k8s::artifacts::Artifact;
use crate::platform::k8s::artifacts::ArtifactStream;
use crate::platform::k8s::pod_spec::SHARED_DIR_ENV;
use crate::platform::k8s::pod_status::first_container_env;
use crate::platform::k8s::ContainerError;

/// File extensions recognized as artifacts: browser logs and recordings.
pub const ARTIFACT_EXTENSIONS: [&str; 2] = ["log", "mp4"];

pub fn shared_dir_of(pod: &Pod) -> Option<&str> {
    first_container_env(pod, SHARED_DIR_ENV)
}

/// `{shared_dir}/{folder}`, with `folder` always taken as relative.
pub fn artifact_dir(shared_dir: &str, folder: &str) -> PathBuf {
    Path::new(shared_dir).join(folder.trim_start_matches('/'))
}

fn is_artifact(path: &Path) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| ARTIFACT_EXTENSIONS.contains(&extension))
}

/// Artifact files directly inside `dir`, sorted by name.
pub async fn list_artifacts(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut artifacts = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_file() && is_artifact(&path) {
            artifacts.push(path);
        }
    }

    artifacts.sort();
    Ok(artifacts)
}

/// Stream the files one at a time; nothing is read before it is polled.
pub fn read_artifacts(container_id: String, paths: Vec<PathBuf>) -> ArtifactStream {
    futures::stream::iter(paths)
        .then(move |path| {
            let container_id = container_id.clone();
            async move {
                let contents = tokio::fs::read(&path)
                    .await
                    .change_context(ContainerError::ArtifactReadFailed { container_id })
                    .attach_printable_lazy(|| format!("path: {}", path.display()))?;
                let name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                Ok(Artifact { name, contents })
            }
        })
        .boxed()
}

/// Copy `folder` of a pod through the shared artifacts mount.
///
/// # Errors
///
/// - [`ContainerError::LookupFailed`] if the pod cannot be fetched
/// - [`ContainerError::SharedDirMissing`] if the pod has no `SHARED_DIR`
/// - [`ContainerError::ArtifactReadFailed`] if the directory is unreadable
pub async fn copy_from_shared_volume(
    pods: &Api<Pod>,
    container_id: &str,
    folder: &str,
) -> Result<ArtifactStream, Report<ContainerError>> {
    let pod = pods
        .get(container_id)
        .await
        .change_context_lazy(|| ContainerError::LookupFailed {
            pod_name: container_id.to_string(),
        })?;

    let shared_dir = shared_dir_of(&pod).ok_or_else(|| {
        Report::new(ContainerError::SharedDirMissing {
            pod_name: container_id.to_string(),
        })
    })?;

    let dir = artifact_dir(shared_dir, folder);
    debug!(container_id, dir = %dir.display(), "Copying artifacts from shared volume");

    let paths = list_artifacts(&dir)
        .await
        .change_context_lazy(|| ContainerError::ArtifactReadFailed {
            container_id: container_id.to_string(),
        })
        .attach_printable_lazy(|| format!("dir: {}", dir.display()))?;

    Ok(read_artifacts(container_id.to_string(), paths))
}
