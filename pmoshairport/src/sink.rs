//! Media sink seam
//!
//! The relay does not know how the encoded audio reaches listeners. A
//! [`MediaSink`] connects to a [`SinkTarget`] and returns a [`SinkHandle`]
//! that plays [`EncodedStream`]s. Playing returns a [`PlaybackCompletion`]
//! future resolved once the stream has ended, with the reason.
//!
//! [`FileSink`] is the bundled implementation: the target is a path (a file
//! or a FIFO read by another program) and playing copies the stream into it.

use crate::error::{Error, Result};
use crate::pipeline::EncodedStream;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Where the sink should deliver audio (channel id, URL, path…)
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
pub struct SinkTarget(pub String);

impl SinkTarget {
    pub fn new(target: impl Into<String>) -> Self {
        Self(target.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SinkTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SinkTarget {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Resolves when playback of one stream ends
///
/// `Ok(())` means the stream ran to its end; an error carries the reason it
/// stopped. If the sink drops the completion side without reporting, the
/// future resolves to a pipeline failure.
#[must_use = "a completion does nothing unless awaited"]
pub struct PlaybackCompletion {
    rx: oneshot::Receiver<Result<()>>,
}

/// Reporting side of a [`PlaybackCompletion`]
pub struct CompletionSender {
    tx: oneshot::Sender<Result<()>>,
}

impl PlaybackCompletion {
    pub fn channel() -> (CompletionSender, PlaybackCompletion) {
        let (tx, rx) = oneshot::channel();
        (CompletionSender { tx }, PlaybackCompletion { rx })
    }

    /// An already resolved completion
    pub fn ready(result: Result<()>) -> Self {
        let (tx, rx) = Self::channel();
        tx.complete(result);
        rx
    }
}

impl CompletionSender {
    pub fn complete(self, result: Result<()>) {
        let _ = self.tx.send(result);
    }
}

impl Future for PlaybackCompletion {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| Err(Error::pipeline("playback ended without a result")))
        })
    }
}

#[async_trait]
pub trait MediaSink: Send + Sync {
    async fn connect(&self, target: &SinkTarget) -> Result<Arc<dyn SinkHandle>>;
}

/// One live connection to a sink
#[async_trait]
pub trait SinkHandle: Send + Sync {
    fn is_connected(&self) -> bool;

    fn is_playing(&self) -> bool;

    /// Starts playing `stream`, replacing whatever was playing
    async fn play(&self, stream: EncodedStream) -> Result<PlaybackCompletion>;

    /// Stops playback; the stream is dropped
    async fn stop(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}

/// Writes the encoded stream to a file or FIFO
#[derive(Debug, Default, Clone)]
pub struct FileSink;

impl FileSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaSink for FileSink {
    async fn connect(&self, target: &SinkTarget) -> Result<Arc<dyn SinkHandle>> {
        let path = PathBuf::from(target.as_str());
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.is_dir() {
                return Err(Error::TransportLost(format!(
                    "output directory {} does not exist",
                    parent.display()
                )));
            }
        }
        info!(target = %target, "File sink connected");
        Ok(Arc::new(FileSinkHandle {
            path,
            connected: AtomicBool::new(true),
            task: Mutex::new(None),
        }))
    }
}

pub struct FileSinkHandle {
    path: PathBuf,
    connected: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FileSinkHandle {
    fn abort_task(&self) -> bool {
        let task = self.task.lock().unwrap().take();
        match task {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl SinkHandle for FileSinkHandle {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_playing(&self) -> bool {
        self.task
            .lock()
            .unwrap()
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    async fn play(&self, stream: EncodedStream) -> Result<PlaybackCompletion> {
        if !self.is_connected() {
            return Err(Error::TransportLost("file sink is disconnected".into()));
        }
        self.abort_task();

        let (done, completion) = PlaybackCompletion::channel();
        let path = self.path.clone();
        let task = tokio::spawn(async move {
            done.complete(copy_to_file(&path, stream).await);
        });
        *self.task.lock().unwrap() = Some(task);
        Ok(completion)
    }

    async fn stop(&self) -> Result<()> {
        if self.abort_task() {
            debug!(path = %self.path.display(), "File sink playback stopped");
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.abort_task();
        if self.connected.swap(false, Ordering::SeqCst) {
            info!(path = %self.path.display(), "File sink disconnected");
        } else {
            warn!(path = %self.path.display(), "File sink already disconnected");
        }
        Ok(())
    }
}

async fn copy_to_file(path: &Path, mut stream: EncodedStream) -> Result<()> {
    let mut out = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .await?;
    let copied = tokio::io::copy(&mut stream, &mut out).await?;
    debug!(bytes = copied, path = %path.display(), stream = stream.label(), "Encoded stream ended");
    stream.finish().await
}
