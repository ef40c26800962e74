//! Artifact copy by running `tar` inside the pod and streaming its stdout.
//!
//! The exec channel reports back asynchronously: it opens, or fails to open,
//! and eventually closes. [`CopySession`] turns those events into a one-shot
//! open gate for the caller and an idempotent close action.
//!
//! A failing remote `tar` only shows up on stderr, after the stream has been
//! handed out. It is logged and the channel is torn down, so the caller sees a
//! truncated or empty archive rather than an error.

use std::fmt::Display;
use std::io::Read;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use error_stack::Report;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::AttachParams;
use kube::api::AttachedProcess;
use kube::Api;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::SyncIoBridge;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::platform::k8s::artifacts::Artifact;
use crate::platform::k8s::artifacts::ArtifactStream;
use crate::platform::k8s::ContainerError;

/// Stdout of the remote command.
pub type ExecStdout = Box<dyn AsyncRead + Send + Unpin>;

/// The part of an exec channel a session needs: tearing it down.
pub trait ExecChannel {
    fn close(&self);
}

impl ExecChannel for AttachedProcess {
    fn close(&self) {
        self.abort();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyState {
    Opening,
    Streaming,
    Closed,
    Failed,
}

/// Synchronization state of one exec-based copy.
///
/// Shared between the caller and the task driving the exec channel.
pub struct CopySession {
    container_id: String,
    command: Vec<String>,
    state: Mutex<CopyState>,
    stderr: Mutex<Vec<u8>>,
    closed: AtomicBool,
    opened: Mutex<Option<oneshot::Sender<ExecStdout>>>,
}

/// Released once the exec channel opened, or failed to.
pub struct OpenGate(oneshot::Receiver<ExecStdout>);

impl OpenGate {
    /// Wait for the channel. `None` means it failed before opening.
    pub async fn wait(self) -> Option<ExecStdout> {
        self.0.await.ok()
    }
}

impl CopySession {
    pub fn new(container_id: impl Into<String>, command: Vec<String>) -> (Arc<Self>, OpenGate) {
        let (tx, rx) = oneshot::channel();
        let session = Arc::new(Self {
            container_id: container_id.into(),
            command,
            state: Mutex::new(CopyState::Opening),
            stderr: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            opened: Mutex::new(Some(tx)),
        });
        (session, OpenGate(rx))
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn state(&self) -> CopyState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: CopyState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn take_gate(&self) -> Option<oneshot::Sender<ExecStdout>> {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// The channel is connected; hand its stdout to the waiting caller.
    pub fn on_open(&self, stdout: ExecStdout) {
        self.set_state(CopyState::Streaming);
        if let Some(gate) = self.take_gate() {
            if gate.send(stdout).is_err() {
                debug!(container_id = %self.container_id, "Copy caller went away before the channel opened");
            }
        }
    }

    /// The channel could not be opened. Failure before open is terminal.
    pub fn on_failure(&self, error: &dyn Display) {
        error!(
            container_id = %self.container_id,
            command = ?self.command,
            "Failed to execute command: {error}"
        );
        self.set_state(CopyState::Failed);
        // dropping the sender releases the gate empty-handed
        drop(self.take_gate());
    }

    pub fn append_stderr(&self, bytes: &[u8]) {
        self.stderr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(bytes);
    }

    pub fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.stderr.lock().unwrap_or_else(PoisonError::into_inner))
            .into_owned()
    }

    /// The channel closed. When the remote command reported errors, log them
    /// and close the channel, which does not clean up after itself and would
    /// leave a reader hanging.
    ///
    /// Only the first call can close the channel. Returns whether it did.
    pub fn on_close(&self, channel: &dyn ExecChannel) -> bool {
        let was_closed = self.closed.swap(true, Ordering::AcqRel);
        if self.state() != CopyState::Failed {
            self.set_state(CopyState::Closed);
        }

        let stderr = self.stderr();
        if was_closed || stderr.is_empty() {
            return false;
        }

        error!(
            container_id = %self.container_id,
            command = ?self.command,
            stderr = %stderr,
            "Copy files command failed"
        );
        channel.close();
        true
    }
}

/// `tar` invocation archiving `folder` to stdout.
pub fn tar_command(folder: &str) -> Vec<String> {
    ["tar", "-C", folder, "-c", "."]
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Copy `folder` out of a running pod as a stream of artifacts.
///
/// Never fails: remote errors are logged and end the stream early.
pub async fn copy_through_exec(pods: Api<Pod>, container_id: &str, folder: &str) -> ArtifactStream {
    let command = tar_command(folder);
    let (session, gate) = CopySession::new(container_id, command);

    tokio::spawn(drive_exec(pods, session));

    match gate.wait().await {
        Some(stdout) => tar_artifacts(container_id.to_string(), stdout),
        None => futures::stream::empty().boxed(),
    }
}

/// Open the exec channel and feed its events into the session.
async fn drive_exec(pods: Api<Pod>, session: Arc<CopySession>) {
    let params = AttachParams::default()
        .stdin(false)
        .stdout(true)
        .stderr(true);

    let mut process = match pods
        .exec(session.container_id(), session.command().to_vec(), &params)
        .await
    {
        Ok(process) => process,
        Err(e) => {
            session.on_failure(&e);
            return;
        }
    };

    let (Some(stdout), Some(mut stderr)) = (process.stdout(), process.stderr()) else {
        session.on_failure(&"exec channel opened without stdout or stderr");
        process.abort();
        return;
    };
    let status = process.take_status();

    session.on_open(Box::new(stdout));

    let mut buf = [0u8; 4096];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => session.append_stderr(&buf[..n]),
            Err(e) => {
                warn!(container_id = %session.container_id(), "Failed to read stderr: {e}");
                break;
            }
        }
    }

    if let Some(status) = status {
        if let Some(status) = status.await {
            debug!(container_id = %session.container_id(), status = ?status.status, "Copy command finished");
        }
    }

    session.on_close(&process);

    if let Err(e) = process.join().await {
        debug!(container_id = %session.container_id(), "Exec channel ended with: {e}");
    }
}

/// Decode a tar archive from `reader` lazily, one regular file at a time.
///
/// Decoding runs on a blocking thread and is paced by the consumer.
pub fn tar_artifacts(
    container_id: String,
    reader: impl AsyncRead + Send + Unpin + 'static,
) -> ArtifactStream {
    let (tx, rx) = mpsc::channel(1);
    let reader = SyncIoBridge::new(reader);

    tokio::task::spawn_blocking(move || {
        let mut archive = tar::Archive::new(reader);
        let read_failed = |e: std::io::Error| {
            Report::new(e).change_context(ContainerError::ArtifactReadFailed {
                container_id: container_id.clone(),
            })
        };

        let entries = match archive.entries() {
            Ok(entries) => entries,
            Err(e) => {
                let _ = tx.blocking_send(Err(read_failed(e)));
                return;
            }
        };

        for entry in entries {
            let artifact = entry.and_then(|mut entry| {
                if !entry.header().entry_type().is_file() {
                    return Ok(None);
                }
                let name = entry.path()?.display().to_string();
                let mut contents = Vec::new();
                entry.read_to_end(&mut contents)?;
                Ok(Some(Artifact {
                    name: name.trim_start_matches("./").to_string(),
                    contents,
                }))
            });

            let item = match artifact {
                Ok(None) => continue,
                Ok(Some(artifact)) => Ok(artifact),
                Err(e) => Err(read_failed(e)),
            };
            let is_err = item.is_err();
            if tx.blocking_send(item).is_err() || is_err {
                // consumer dropped the stream, or the archive is unreadable from here on
                break;
            }
        }
    });

    ReceiverStream::new(rx).boxed()
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::atomic::AtomicUsize;

    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    #[derive(Default)]
    struct FakeChannel {
        closes: AtomicUsize,
    }

    impl ExecChannel for FakeChannel {
        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn archive(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut dir = tar::Header::new_gnu();
        dir.set_entry_type(tar::EntryType::Directory);
        dir.set_size(0);
        dir.set_mode(0o755);
        builder.append_data(&mut dir, "videos", std::io::empty()).unwrap();
        for (name, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            builder.append_data(&mut header, name, *contents).unwrap();
        }
        builder.into_inner().unwrap()
    }

    async fn collect(stream: ArtifactStream) -> Vec<Artifact> {
        stream
            .map(|artifact| artifact.expect("artifact should decode"))
            .collect()
            .await
    }

    #[test]
    fn close_runs_at_most_once_with_stderr() {
        let (session, _gate) = CopySession::new("grid-40000-a", tar_command("/var/log/cont"));
        let channel = FakeChannel::default();
        session.append_stderr(b"tar: /var/log/cont: Cannot open: No such file or directory");

        assert!(session.on_close(&channel));
        assert!(!session.on_close(&channel));
        assert!(!session.on_close(&channel));

        assert_eq!(channel.closes.load(Ordering::SeqCst), 1);
        assert_eq!(session.state(), CopyState::Closed);
    }

    #[test]
    fn clean_close_leaves_channel_alone() {
        let (session, _gate) = CopySession::new("grid-40000-a", tar_command("/videos"));
        let channel = FakeChannel::default();

        assert!(!session.on_close(&channel));
        session.append_stderr(b"late error");
        assert!(!session.on_close(&channel));

        assert_eq!(channel.closes.load(Ordering::SeqCst), 0);
    }

    #[test(tokio::test)]
    async fn open_releases_gate_with_stdout() {
        let (session, gate) = CopySession::new("grid-40000-a", tar_command("/videos"));
        assert_eq!(session.state(), CopyState::Opening);

        session.on_open(Box::new(Cursor::new(b"payload".to_vec())));

        let mut stdout = gate.wait().await.expect("gate should carry stdout");
        let mut read = Vec::new();
        stdout.read_to_end(&mut read).await.unwrap();
        assert_eq!(read, b"payload");
        assert_eq!(session.state(), CopyState::Streaming);
    }

    #[test(tokio::test)]
    async fn failure_releases_gate_empty() {
        let (session, gate) = CopySession::new("grid-40000-a", tar_command("/videos"));

        session.on_failure(&"connection refused");

        assert!(gate.wait().await.is_none());
        assert_eq!(session.state(), CopyState::Failed);

        session.on_close(&FakeChannel::default());
        assert_eq!(session.state(), CopyState::Failed);
    }

    #[test]
    fn tar_command_archives_folder() {
        assert_eq!(
            tar_command("/home/seluser/videos"),
            vec!["tar", "-C", "/home/seluser/videos", "-c", "."]
        );
    }

    #[test(tokio::test)]
    async fn tar_stream_yields_regular_files() {
        let bytes = archive(&[("./a.log", b"log line"), ("./videos/b.mp4", b"\x00\x01\x02")]);

        let artifacts = collect(tar_artifacts("grid-40000-a".to_string(), Cursor::new(bytes))).await;

        assert_eq!(
            artifacts,
            vec![
                Artifact {
                    name: "a.log".to_string(),
                    contents: b"log line".to_vec(),
                },
                Artifact {
                    name: "videos/b.mp4".to_string(),
                    contents: b"\x00\x01\x02".to_vec(),
                },
            ]
        );
    }

    #[test(tokio::test)]
    async fn empty_stdout_is_an_empty_archive() {
        let artifacts = collect(tar_artifacts("grid-40000-a".to_string(), Cursor::new(Vec::new()))).await;

        assert!(artifacts.is_empty());
    }

    #[test(tokio::test)]
    async fn dropping_the_stream_stops_decoding() {
        let bytes = archive(&[("a.log", b"1"), ("b.log", b"2"), ("c.log", b"3")]);

        let mut stream = tar_artifacts("grid-40000-a".to_string(), Cursor::new(bytes));
        let first = stream.next().await.unwrap().unwrap();
        drop(stream);

        assert_eq!(first.name, "a.log");
    }
}
