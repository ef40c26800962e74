//! Artifacts copied out of browser pods.

use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::platform::k8s::ContainerError;

/// One file produced by a browser pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Path relative to the copied folder
    pub name: String,
    pub contents: Vec<u8>,
}

/// Lazy, finite, single-pass sequence of artifacts. Reading it again
/// requires a new copy.
pub type ArtifactStream = BoxStream<'static, Result<Artifact, Report<ContainerError>>>;

/// Relative path of an artifact, refusing names that would escape `dir`.
fn safe_relative_path(name: &str) -> Option<PathBuf> {
    let path: PathBuf = Path::new(name)
        .components()
        .filter(|component| !matches!(component, Component::CurDir))
        .collect();
    let escapes = path
        .components()
        .any(|component| !matches!(component, Component::Normal(_)));
    (!escapes && path.components().next().is_some()).then_some(path)
}

/// Drain the stream into `dir`, returning the number of files written.
///
/// Artifacts whose names point outside `dir` are skipped.
pub async fn write_to_dir(
    mut artifacts: ArtifactStream,
    dir: &Path,
) -> Result<usize, Report<ContainerError>> {
    let mut written = 0;

    while let Some(artifact) = artifacts.next().await {
        let artifact = artifact?;
        let Some(relative) = safe_relative_path(&artifact.name) else {
            tracing::warn!(name = %artifact.name, "Skipping artifact outside of output directory");
            continue;
        };

        let target = dir.join(relative);
        let context = || ContainerError::ArtifactWriteFailed {
            name: artifact.name.clone(),
            path: target.display().to_string(),
        };
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .change_context_lazy(context)?;
        }
        tokio::fs::write(&target, &artifact.contents)
            .await
            .change_context_lazy(context)?;
        written += 1;
    }

    Ok(written)
}
