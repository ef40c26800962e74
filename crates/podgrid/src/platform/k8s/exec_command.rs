//! Arbitrary commands run inside a browser pod.

use error_stack::Report;
use error_stack::ResultExt;
use futures::future::BoxFuture;
use futures::FutureExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::AttachParams;
use kube::api::AttachedProcess;
use kube::Api;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::platform::k8s::ContainerError;

/// A running command whose results are collected once.
pub trait CommandChannel: Send + 'static {
    /// Stdout followed by stderr, read until both end.
    fn output(&mut self) -> BoxFuture<'_, Vec<u8>>;

    /// Exit status reported by the API server, if any.
    fn status(&mut self) -> BoxFuture<'_, Option<Status>>;

    /// Close the channel.
    fn release(self) -> BoxFuture<'static, Result<(), kube::Error>>;
}

impl CommandChannel for AttachedProcess {
    fn output(&mut self) -> BoxFuture<'_, Vec<u8>> {
        let stdout = self.stdout();
        let stderr = self.stderr();
        async move {
            let (mut output, stderr) = tokio::join!(read_all(stdout), read_all(stderr));
            output.extend_from_slice(&stderr);
            output
        }
        .boxed()
    }

    fn status(&mut self) -> BoxFuture<'_, Option<Status>> {
        let status = self.take_status();
        async move {
            match status {
                Some(status) => status.await,
                None => None,
            }
        }
        .boxed()
    }

    fn release(self) -> BoxFuture<'static, Result<(), kube::Error>> {
        self.join().map(|r| r.map_err(|e| kube::Error::Service(Box::new(e)))).boxed()
    }
}

/// What a command produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub output: Vec<u8>,
    pub failed: bool,
}

/// Run `command` in `container_id`.
///
/// With `wait` the call returns once the command finished; otherwise the
/// wait runs on a background task that cannot be cancelled. Failures are
/// logged, never returned.
pub async fn execute_command(pods: &Api<Pod>, container_id: &str, command: Vec<String>, wait: bool) {
    let process = match open_exec(pods, container_id, &command).await {
        Ok(process) => process,
        Err(report) => {
            error!(container_id, command = ?command, "{report:?}");
            return;
        }
    };

    dispatch(process, container_id.to_string(), command, wait).await;
}

async fn open_exec(
    pods: &Api<Pod>,
    container_id: &str,
    command: &[String],
) -> Result<AttachedProcess, Report<ContainerError>> {
    let params = AttachParams::default()
        .stdin(false)
        .stdout(true)
        .stderr(true);

    pods.exec(container_id, command.to_vec(), &params)
        .await
        .change_context_lazy(|| ContainerError::ExecFailed {
            container_id: container_id.to_string(),
        })
}

/// Wait inline, returning the outcome, or hand the wait to a background task
/// and return `None` right away.
pub async fn dispatch<C: CommandChannel>(
    channel: C,
    container_id: String,
    command: Vec<String>,
    wait: bool,
) -> Option<CommandOutcome> {
    if wait {
        Some(wait_for_results_and_cleanup(channel, container_id, command).await)
    } else {
        tokio::spawn(wait_for_results_and_cleanup(channel, container_id, command));
        None
    }
}

async fn read_all(stream: Option<impl AsyncRead + Unpin>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        if let Err(e) = stream.read_to_end(&mut buf).await {
            warn!("Failed to read command output: {e}");
        }
    }
    buf
}

/// Collect combined output, wait for the exit status and always release the
/// channel.
async fn wait_for_results_and_cleanup<C: CommandChannel>(
    mut channel: C,
    container_id: String,
    command: Vec<String>,
) -> CommandOutcome {
    let output = channel.output().await;

    let failed = match channel.status().await {
        Some(status) if status.status.as_deref() == Some("Failure") => {
            error!(
                container_id = %container_id,
                command = ?command,
                reason = ?status.reason,
                "Command failed: {}",
                status.message.unwrap_or_default()
            );
            true
        }
        Some(_) => false,
        None => {
            warn!(container_id = %container_id, "Command ended without a status");
            false
        }
    };

    if let Err(e) = channel.release().await {
        warn!(container_id = %container_id, "Error closing exec channel: {e}");
    }

    debug!(
        container_id = %container_id,
        command = ?command,
        output = %String::from_utf8_lossy(&output),
        "Command executed"
    );

    CommandOutcome { output, failed }
}
