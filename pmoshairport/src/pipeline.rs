//! Transcoding pipeline
//!
//! The pipeline turns the raw PCM written by shairport into an encoded
//! stream for the sink. [`PipelineManager`] owns at most one running
//! pipeline: it spawns the transcoder, hands its output to the sink and
//! watches the playback completion, posting a [`PipelineEvent`] when it
//! ends. Every start and stop bumps a generation counter so that late
//! completions of a replaced pipeline can be told apart.

use crate::error::{Error, Result, SourceKind};
use crate::sink::SinkHandle;
use serde::Serialize;
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, ReadBuf};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Encoded audio on its way to the sink
///
/// When backed by a transcoder process, dropping the stream kills it.
pub struct EncodedStream {
    reader: Pin<Box<dyn AsyncRead + Send>>,
    child: Option<Child>,
    label: String,
}

impl EncodedStream {
    /// Wraps a spawned process whose stdout is piped
    pub fn from_child(mut child: Child, label: impl Into<String>) -> Result<Self> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::pipeline("transcoder stdout is not piped"))?;
        Ok(Self {
            reader: Box::pin(stdout),
            child: Some(child),
            label: label.into(),
        })
    }

    pub fn from_reader(reader: impl AsyncRead + Send + 'static, label: impl Into<String>) -> Self {
        Self {
            reader: Box::pin(reader),
            child: None,
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Waits for the producing process, once the stream has been drained
    ///
    /// A non-zero exit status is a pipeline failure.
    pub async fn finish(mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child.wait().await?;
        if status.success() {
            debug!(stream = %self.label, "Transcoder exited cleanly");
            Ok(())
        } else {
            Err(Error::pipeline(format!("{} exited with {}", self.label, status)))
        }
    }
}

impl AsyncRead for EncodedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.reader.as_mut().poll_read(cx, buf)
    }
}

impl fmt::Debug for EncodedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodedStream")
            .field("label", &self.label)
            .field("process", &self.child.as_ref().and_then(|c| c.id()))
            .finish()
    }
}

/// Produces an encoded stream from the PCM source
pub trait Transcoder: Send + Sync {
    fn spawn(&self, source: &Path) -> Result<EncodedStream>;
}

/// Encoding parameters for [`FfmpegTranscoder`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfmpegOptions {
    pub input_rate: u32,
    pub input_channels: u8,
    pub output_rate: u32,
    pub output_channels: u8,
    pub bitrate: String,
}

impl Default for FfmpegOptions {
    fn default() -> Self {
        // shairport-sync pipe backend: S16LE, 44.1 kHz, stereo
        Self {
            input_rate: 44_100,
            input_channels: 2,
            output_rate: 48_000,
            output_channels: 2,
            bitrate: "128k".to_string(),
        }
    }
}

/// Real-time PCM to Ogg/Opus through an `ffmpeg` process
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    program: PathBuf,
    options: FfmpegOptions,
}

impl FfmpegTranscoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            options: FfmpegOptions::default(),
        }
    }

    pub fn with_options(mut self, options: FfmpegOptions) -> Self {
        self.options = options;
        self
    }

    pub fn args(&self, source: &Path) -> Vec<OsString> {
        let o = &self.options;
        let mut args: Vec<OsString> = [
            "-hide_banner",
            "-loglevel",
            "error",
            "-nostdin",
            "-re",
            "-f",
            "s16le",
            "-ar",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();
        args.push(o.input_rate.to_string().into());
        args.push("-ac".into());
        args.push(o.input_channels.to_string().into());
        args.push("-i".into());
        args.push(source.as_os_str().to_owned());
        for arg in ["-vn", "-map_metadata", "-1", "-c:a", "libopus", "-ar"] {
            args.push(arg.into());
        }
        args.push(o.output_rate.to_string().into());
        args.push("-ac".into());
        args.push(o.output_channels.to_string().into());
        args.push("-b:a".into());
        args.push(o.bitrate.clone().into());
        for arg in ["-f", "opus", "pipe:1"] {
            args.push(arg.into());
        }
        args
    }
}

impl Transcoder for FfmpegTranscoder {
    fn spawn(&self, source: &Path) -> Result<EncodedStream> {
        let mut child = Command::new(&self.program)
            .args(self.args(source))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                Error::pipeline(format!("cannot spawn {}: {err}", self.program.display()))
            })?;

        let pid = child.id();
        info!(pid = ?pid, source = %source.display(), "ffmpeg started");

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(pid = ?pid, "ffmpeg: {line}");
                }
            });
        }

        EncodedStream::from_child(child, "ffmpeg")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Idle,
    Starting,
    Streaming,
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Idle => "idle",
            PipelineState::Starting => "starting",
            PipelineState::Streaming => "streaming",
            PipelineState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub enum PipelineEvent {
    /// Playback of the pipeline started as `generation` has ended
    Finished {
        generation: u64,
        result: Result<()>,
        ran_for: Duration,
    },
}

pub struct PipelineManager {
    source: PathBuf,
    transcoder: Arc<dyn Transcoder>,
    state: PipelineState,
    generation: u64,
    watcher: Option<JoinHandle<()>>,
}

impl PipelineManager {
    pub fn new(source: impl Into<PathBuf>, transcoder: Arc<dyn Transcoder>) -> Self {
        Self {
            source: source.into(),
            transcoder,
            state: PipelineState::Idle,
            generation: 0,
            watcher: None,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn source_exists(&self) -> bool {
        self.source.exists()
    }

    /// Starts a pipeline playing on `handle`, replacing any running one
    ///
    /// Returns the generation of the new pipeline. Its end is reported on
    /// `events`.
    pub async fn start(
        &mut self,
        handle: &Arc<dyn SinkHandle>,
        events: &mpsc::UnboundedSender<PipelineEvent>,
    ) -> Result<u64> {
        self.stop(Some(handle)).await;

        if !self.source.exists() {
            self.state = PipelineState::Failed;
            return Err(Error::source_unavailable(SourceKind::Audio, &self.source));
        }

        self.generation += 1;
        let generation = self.generation;
        self.state = PipelineState::Starting;

        let stream = match self.transcoder.spawn(&self.source) {
            Ok(stream) => stream,
            Err(err) => {
                self.state = PipelineState::Failed;
                return Err(err);
            }
        };
        let completion = match handle.play(stream).await {
            Ok(completion) => completion,
            Err(err) => {
                self.state = PipelineState::Failed;
                return Err(err);
            }
        };

        let started = Instant::now();
        let events = events.clone();
        self.watcher = Some(tokio::spawn(async move {
            let result = completion.await;
            let ran_for = started.elapsed();
            let _ = events.send(PipelineEvent::Finished {
                generation,
                result,
                ran_for,
            });
        }));
        self.state = PipelineState::Streaming;

        info!(generation, source = %self.source.display(), "Pipeline streaming");
        Ok(generation)
    }

    /// Stops the running pipeline, if any
    ///
    /// Completions of the stopped pipeline are ignored afterwards.
    pub async fn stop(&mut self, handle: Option<&Arc<dyn SinkHandle>>) {
        self.generation += 1;
        let was_running = self.watcher.is_some();
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        if let Some(handle) = handle {
            if let Err(err) = handle.stop().await {
                warn!(error = %err, "Failed to stop sink playback");
            }
        }
        if was_running {
            debug!(generation = self.generation, "Pipeline stopped");
        }
        self.state = PipelineState::Idle;
    }

    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    /// Records the end of pipeline `generation`
    ///
    /// Returns `false` for a stale generation, which must be ignored.
    pub fn mark_finished(&mut self, generation: u64, failed: bool) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        self.watcher = None;
        self.state = if failed {
            PipelineState::Failed
        } else {
            PipelineState::Idle
        };
        true
    }
}

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(3);
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_RESET_AFTER: Duration = Duration::from_secs(60);

/// Automatic restart policy after a pipeline failure
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first restart
    pub cooldown: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
    /// A pipeline that streamed this long resets the attempt count
    pub reset_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_COOLDOWN,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
            reset_after: DEFAULT_RESET_AFTER,
        }
    }
}

#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    current: Option<Duration>,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            current: None,
            attempts: 0,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.current = None;
        self.attempts = 0;
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_attempts {
            if self.attempts >= max {
                return None;
            }
        }

        let next = match self.current {
            Some(current) => {
                let factor = if self.policy.multiplier.is_finite() && self.policy.multiplier >= 1.0 {
                    self.policy.multiplier
                } else {
                    1.0
                };
                Duration::try_from_secs_f64(current.as_secs_f64() * factor)
                    .unwrap_or(self.policy.max_delay)
                    .min(self.policy.max_delay)
            }
            None => self.policy.cooldown,
        };
        self.current = Some(next);
        self.attempts += 1;
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ffmpeg_args() {
        let transcoder = FfmpegTranscoder::new("ffmpeg");
        let args: Vec<String> = transcoder
            .args(Path::new("/tmp/shairport-sync-audio"))
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        let expected = "-hide_banner -loglevel error -nostdin -re -f s16le -ar 44100 -ac 2 \
            -i /tmp/shairport-sync-audio -vn -map_metadata -1 -c:a libopus -ar 48000 -ac 2 \
            -b:a 128k -f opus pipe:1";
        assert_eq!(args.join(" "), expected);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new(RetryPolicy {
            max_attempts: None,
            max_delay: Duration::from_secs(20),
            ..RetryPolicy::default()
        });
        let delays: Vec<u64> = (0..5)
            .map(|_| backoff.next_delay().unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![3, 6, 12, 20, 20]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(3)));
        assert_eq!(backoff.attempts(), 1);
    }

    #[test]
    fn test_backoff_budget() {
        let mut backoff = Backoff::new(RetryPolicy {
            max_attempts: Some(2),
            ..RetryPolicy::default()
        });
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.attempts(), 2);
    }

    #[tokio::test]
    async fn test_stream_finish_without_process() {
        let stream = EncodedStream::from_reader(tokio::io::empty(), "empty");
        assert_eq!(stream.label(), "empty");
        assert!(stream.finish().await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stream_finish_reports_exit_status() {
        let child = Command::new("sh")
            .args(["-c", "exit 3"])
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let stream = EncodedStream::from_child(child, "sh").unwrap();
        assert!(matches!(stream.finish().await, Err(Error::PipelineFailure(_))));
    }

    #[tokio::test]
    async fn test_missing_transcoder_binary() {
        let transcoder = FfmpegTranscoder::new("/nonexistent/ffmpeg-binary");
        assert!(matches!(
            transcoder.spawn(Path::new("/tmp/whatever")),
            Err(Error::PipelineFailure(_))
        ));
    }
}
