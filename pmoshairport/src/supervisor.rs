//! Session supervisor
//!
//! One actor task owns the whole session: sink connection, transcoding
//! pipeline, metadata reader, health monitor and retry timers. Every
//! transition (start, stop, manual or automatic restart, reconnect) is a
//! message handled in order by that task, so there is never more than one
//! pipeline, reader or monitor alive at a time.
//!
//! [`SessionSupervisor`] is the cheap, cloneable handle used to drive it.
//!
//! ```text
//! Idle ──start──▶ Connecting ──▶ Streaming ◀──▶ Recovering
//!  ▲                                 │               │
//!  └──────────── stop / transport lost ◀─────────────┘
//! ```

use crate::announce::{Announcer, Notice};
use crate::error::{Error, Result, SourceKind};
use crate::health::{HealthMonitor, HealthSettings, HealthSnapshot, KeepaliveSignal};
use crate::pipeline::{Backoff, PipelineEvent, PipelineManager, PipelineState, RetryPolicy, Transcoder};
use crate::reader::{MetadataReader, ReaderCounters, ReaderSettings};
use crate::sink::{MediaSink, SinkHandle, SinkTarget};
use crate::track::{TrackState, TrackTracker, TrackUpdate};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_AUDIO_PIPE: &str = "/tmp/shairport-sync-audio";
pub const DEFAULT_METADATA_PIPE: &str = "/tmp/shairport-sync-metadata";
pub const DEFAULT_RESTART_SETTLE: Duration = Duration::from_millis(1000);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(2000);

const COMMAND_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    Connecting,
    Streaming,
    /// Connected, pipeline down (restart pending or needed)
    Recovering,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Streaming => "streaming",
            SessionState::Recovering => "recovering",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub audio_source: PathBuf,
    pub metadata: ReaderSettings,
    pub health: HealthSettings,
    pub retry: RetryPolicy,
    /// Pause between stop and start on a manual restart
    pub restart_settle: Duration,
    /// Pause between stop and start on a reconnect
    pub reconnect_delay: Duration,
}

impl SessionSettings {
    pub fn new(audio_source: impl Into<PathBuf>, metadata_source: impl Into<PathBuf>) -> Self {
        Self {
            audio_source: audio_source.into(),
            metadata: ReaderSettings::new(metadata_source),
            health: HealthSettings::default(),
            retry: RetryPolicy::default(),
            restart_settle: DEFAULT_RESTART_SETTLE,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIO_PIPE, DEFAULT_METADATA_PIPE)
    }
}

/// Everything known about the session at one point in time
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: Option<Uuid>,
    pub state: SessionState,
    pub pipeline: PipelineState,
    pub target: Option<SinkTarget>,
    pub connected: bool,
    pub playing: bool,
    pub metadata_reader_running: bool,
    pub keepalive_running: bool,
    pub audio_source: PathBuf,
    pub audio_source_present: bool,
    pub metadata_source: PathBuf,
    pub metadata_source_present: bool,
    pub track: TrackState,
    pub health: HealthSnapshot,
    pub reader: ReaderCounters,
    pub restart_attempts: u32,
}

enum Command {
    Start {
        target: SinkTarget,
        announcer: Weak<dyn Announcer>,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    RestartPipeline {
        reply: oneshot::Sender<Result<()>>,
    },
    Reconnect {
        target: Option<SinkTarget>,
        reply: oneshot::Sender<Result<()>>,
    },
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },
    CurrentTrack {
        reply: oneshot::Sender<TrackState>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle on the session actor
#[derive(Clone)]
pub struct SessionSupervisor {
    tx: mpsc::Sender<Command>,
}

impl SessionSupervisor {
    /// Spawns the actor on the current runtime
    pub fn spawn(
        settings: SessionSettings,
        sink: Arc<dyn MediaSink>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Self {
        let (tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (pipeline_tx, pipeline_rx) = mpsc::unbounded_channel();
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();

        let core = SessionCore {
            pipeline: PipelineManager::new(settings.audio_source.clone(), transcoder),
            backoff: Backoff::new(settings.retry.clone()),
            settings,
            sink,
            state: SessionState::Idle,
            session_id: None,
            target: None,
            handle: None,
            announcer: None,
            tracker: TrackTracker::new(),
            reader: None,
            last_reader_counters: ReaderCounters::default(),
            health: None,
            health_snapshot: Arc::new(watch::Sender::new(HealthSnapshot::default())),
            retry: None,
            pipeline_tx,
            retry_tx,
            track_rx: None,
            keepalive_rx: None,
        };

        tokio::spawn(core.run(cmd_rx, pipeline_rx, retry_rx));
        Self { tx }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await?;
        Ok(rx.await?)
    }

    /// Starts streaming to `target`
    ///
    /// The announcer is only held weakly: keep it alive for as long as
    /// announcements are wanted.
    pub async fn start_session(&self, target: SinkTarget, announcer: &Arc<dyn Announcer>) -> Result<()> {
        let announcer = Arc::downgrade(announcer);
        self.request(|reply| Command::Start {
            target,
            announcer,
            reply,
        })
        .await?
    }

    /// Stops the session; stopping an idle session does nothing
    pub async fn stop_session(&self) -> Result<()> {
        self.request(|reply| Command::Stop { reply }).await
    }

    /// Restarts the transcoding pipeline, keeping the connection
    pub async fn restart_pipeline(&self) -> Result<()> {
        self.request(|reply| Command::RestartPipeline { reply }).await?
    }

    /// Stops, then starts again on `target` or on the previous target
    pub async fn reconnect(&self, target: Option<SinkTarget>) -> Result<()> {
        self.request(|reply| Command::Reconnect { target, reply }).await?
    }

    pub async fn status(&self) -> Result<SessionStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub async fn current_track(&self) -> Result<TrackState> {
        self.request(|reply| Command::CurrentTrack { reply }).await
    }

    /// Stops the session and terminates the actor
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

struct SessionCore {
    settings: SessionSettings,
    sink: Arc<dyn MediaSink>,
    state: SessionState,
    session_id: Option<Uuid>,
    target: Option<SinkTarget>,
    handle: Option<Arc<dyn SinkHandle>>,
    announcer: Option<Weak<dyn Announcer>>,
    pipeline: PipelineManager,
    backoff: Backoff,
    tracker: TrackTracker,
    reader: Option<MetadataReader>,
    last_reader_counters: ReaderCounters,
    health: Option<HealthMonitor>,
    health_snapshot: Arc<watch::Sender<HealthSnapshot>>,
    retry: Option<JoinHandle<()>>,
    pipeline_tx: mpsc::UnboundedSender<PipelineEvent>,
    retry_tx: mpsc::UnboundedSender<u64>,
    /// Per-session channels, dropped at teardown with whatever is queued
    track_rx: Option<mpsc::UnboundedReceiver<TrackUpdate>>,
    keepalive_rx: Option<mpsc::UnboundedReceiver<KeepaliveSignal>>,
}

/// Next message of a per-session channel; pending while there is none
async fn recv_session<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl SessionCore {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut pipeline_rx: mpsc::UnboundedReceiver<PipelineEvent>,
        mut retry_rx: mpsc::UnboundedReceiver<u64>,
    ) {
        debug!("Session supervisor started");

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Shutdown { reply }) => {
                        self.teardown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        // Every handle is gone
                        self.teardown().await;
                        break;
                    }
                },
                Some(event) = pipeline_rx.recv() => self.on_pipeline_event(event).await,
                Some(update) = recv_session(&mut self.track_rx) => self.on_track_update(update).await,
                Some(signal) = recv_session(&mut self.keepalive_rx) => self.on_keepalive(signal).await,
                Some(generation) = retry_rx.recv() => self.on_retry_due(generation).await,
            }
        }

        info!("Session supervisor stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start {
                target,
                announcer,
                reply,
            } => {
                let result = self.start(target, Some(announcer)).await;
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                self.stop().await;
                let _ = reply.send(());
            }
            Command::RestartPipeline { reply } => {
                let result = self.restart().await;
                let _ = reply.send(result);
            }
            Command::Reconnect { target, reply } => {
                let result = self.reconnect(target).await;
                let _ = reply.send(result);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::CurrentTrack { reply } => {
                let _ = reply.send(self.tracker.current().clone());
            }
            Command::Shutdown { reply } => {
                // Handled by the loop
                let _ = reply.send(());
            }
        }
    }

    async fn start(
        &mut self,
        target: SinkTarget,
        announcer: Option<Weak<dyn Announcer>>,
    ) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(Error::SessionActive(self.state));
        }
        if !self.pipeline.source_exists() {
            let path = self.pipeline.source().to_path_buf();
            warn!(path = %path.display(), "Audio source missing, session not started");
            return Err(Error::source_unavailable(SourceKind::Audio, path));
        }

        let session_id = Uuid::new_v4();
        self.session_id = Some(session_id);
        self.target = Some(target.clone());
        self.announcer = announcer;
        self.state = SessionState::Connecting;
        info!(session = %session_id, target = %target, "Starting session");

        match self.bring_up(&target).await {
            Ok(()) => {
                self.state = SessionState::Streaming;
                info!(session = %session_id, "Session streaming");
                Ok(())
            }
            Err(err) => {
                error!(session = %session_id, error = %err, "Session start failed");
                self.teardown().await;
                Err(err)
            }
        }
    }

    async fn bring_up(&mut self, target: &SinkTarget) -> Result<()> {
        let handle = self.sink.connect(target).await?;
        self.handle = Some(handle.clone());
        self.backoff.reset();
        self.tracker.reset();

        self.pipeline.start(&handle, &self.pipeline_tx).await?;

        let (track_tx, track_rx) = mpsc::unbounded_channel();
        self.track_rx = Some(track_rx);
        self.reader = Some(MetadataReader::spawn(
            self.settings.metadata.clone(),
            track_tx,
        )?);

        self.health_snapshot.send_modify(|s| {
            s.connected = handle.is_connected();
            s.playing = handle.is_playing();
        });
        let (keepalive_tx, keepalive_rx) = mpsc::unbounded_channel();
        self.keepalive_rx = Some(keepalive_rx);
        self.health = Some(HealthMonitor::spawn(
            self.settings.health.clone(),
            handle,
            self.health_snapshot.clone(),
            keepalive_tx,
        ));
        Ok(())
    }

    async fn stop(&mut self) {
        if self.state == SessionState::Idle {
            debug!("Stop requested but no session is active");
            return;
        }
        info!(session = ?self.session_id, "Stopping session");
        self.teardown().await;
    }

    /// Releases everything the session holds and returns to Idle
    ///
    /// The target and announcer are kept for a later reconnect.
    async fn teardown(&mut self) {
        self.cancel_retry();

        if let Some(health) = self.health.take() {
            health.shutdown().await;
        }
        if let Some(reader) = self.reader.take() {
            self.last_reader_counters = reader.stats();
            reader.shutdown().await;
        }
        // Signals and updates queued by this session must not reach the next one
        self.keepalive_rx = None;
        self.track_rx = None;

        let handle = self.handle.take();
        self.pipeline.stop(handle.as_ref()).await;
        if let Some(handle) = handle {
            if let Err(err) = handle.disconnect().await {
                warn!(error = %err, "Sink disconnect failed");
            }
        }

        self.health_snapshot.send_modify(|s| {
            s.connected = false;
            s.playing = false;
        });
        if let Some(session_id) = self.session_id.take() {
            info!(session = %session_id, "Session stopped");
        }
        self.state = SessionState::Idle;
    }

    async fn restart(&mut self) -> Result<()> {
        if !matches!(self.state, SessionState::Streaming | SessionState::Recovering) {
            return Err(Error::InvalidState {
                operation: "restart the pipeline",
                state: self.state,
            });
        }
        self.cancel_retry();

        let handle = self
            .handle
            .clone()
            .ok_or_else(|| Error::TransportLost("no sink connection".into()))?;

        info!(session = ?self.session_id, "Restarting pipeline");
        self.pipeline.stop(Some(&handle)).await;
        if !self.settings.restart_settle.is_zero() {
            sleep(self.settings.restart_settle).await;
        }

        match self.pipeline.start(&handle, &self.pipeline_tx).await {
            Ok(_) => {
                self.backoff.reset();
                self.state = SessionState::Streaming;
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "Pipeline restart failed");
                self.state = SessionState::Recovering;
                Err(err)
            }
        }
    }

    async fn reconnect(&mut self, target: Option<SinkTarget>) -> Result<()> {
        let target = target
            .or_else(|| self.target.clone())
            .ok_or(Error::NoTarget)?;
        let announcer = self.announcer.clone();

        info!(target = %target, "Reconnecting");
        if self.state != SessionState::Idle {
            self.teardown().await;
            if !self.settings.reconnect_delay.is_zero() {
                sleep(self.settings.reconnect_delay).await;
            }
        }
        self.start(target, announcer).await
    }

    async fn on_pipeline_event(&mut self, event: PipelineEvent) {
        let PipelineEvent::Finished {
            generation,
            result,
            ran_for,
        } = event;

        if !self.pipeline.mark_finished(generation, result.is_err()) {
            debug!(generation, "Ignoring completion of a replaced pipeline");
            return;
        }

        let err = match result {
            Ok(()) => {
                info!(generation, ran_for_secs = ran_for.as_secs(), "Pipeline ended");
                return;
            }
            Err(err) => err,
        };

        error!(generation, error = %err, ran_for_secs = ran_for.as_secs(), "Pipeline failed");
        if ran_for >= self.backoff.policy().reset_after {
            self.backoff.reset();
        }
        let delay = self.backoff.next_delay();

        self.notify(Notice::PipelineError {
            reason: err.to_string(),
            retry_in: delay,
        })
        .await;

        self.state = SessionState::Recovering;
        match delay {
            Some(delay) => {
                info!(
                    delay_ms = delay.as_millis() as u64,
                    attempt = self.backoff.attempts(),
                    "Scheduling pipeline restart"
                );
                self.schedule_retry(delay);
            }
            None => {
                let attempts = self.backoff.attempts();
                self.notify(Notice::RetryBudgetExhausted { attempts }).await;
            }
        }
    }

    fn schedule_retry(&mut self, delay: Duration) {
        self.cancel_retry();
        let generation = self.pipeline.generation();
        let tx = self.retry_tx.clone();
        self.retry = Some(tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(generation);
        }));
    }

    fn cancel_retry(&mut self) {
        if let Some(retry) = self.retry.take() {
            retry.abort();
        }
    }

    async fn on_retry_due(&mut self, generation: u64) {
        if self.state != SessionState::Recovering || !self.pipeline.is_current(generation) {
            debug!(generation, "Ignoring stale restart timer");
            return;
        }
        self.retry = None;

        let Some(handle) = self.handle.clone().filter(|h| h.is_connected()) else {
            self.on_transport_lost().await;
            return;
        };

        match self.pipeline.start(&handle, &self.pipeline_tx).await {
            Ok(_) => {
                self.state = SessionState::Streaming;
                self.notify(Notice::PipelineRecovered).await;
            }
            Err(err) => {
                self.notify(Notice::PipelineRestartFailed {
                    reason: err.to_string(),
                })
                .await;
            }
        }
    }

    async fn on_transport_lost(&mut self) {
        if self.state == SessionState::Idle {
            return;
        }
        warn!(session = ?self.session_id, "Sink connection lost");
        self.notify(Notice::TransportLost).await;
        self.teardown().await;
    }

    async fn on_keepalive(&mut self, signal: KeepaliveSignal) {
        match signal {
            KeepaliveSignal::ConnectionLost => self.on_transport_lost().await,
            KeepaliveSignal::RestartRequested { reply } => {
                if self.state == SessionState::Idle {
                    let _ = reply.send(Err(Error::InvalidState {
                        operation: "restart the pipeline",
                        state: self.state,
                    }));
                    return;
                }
                let result = match self.restart().await {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        self.notify(Notice::KeepaliveGaveUp).await;
                        Err(Error::HealthCheckFailure(err.to_string()))
                    }
                };
                let _ = reply.send(result);
            }
        }
    }

    async fn on_track_update(&mut self, update: TrackUpdate) {
        if self.state == SessionState::Idle {
            return;
        }
        if let Some(track) = self.tracker.apply(update) {
            info!(
                session = ?self.session_id,
                title = track.title_or_default(),
                artist = track.artist_or_default(),
                "Track changed"
            );
            if let Some(announcer) = self.announcer() {
                announcer.announce_track(&track).await;
            }
        }
    }

    fn announcer(&self) -> Option<Arc<dyn Announcer>> {
        self.announcer.as_ref().and_then(Weak::upgrade)
    }

    async fn notify(&self, notice: Notice) {
        if notice.is_terminal() {
            warn!(session = ?self.session_id, "{notice}");
        } else {
            info!(session = ?self.session_id, "{notice}");
        }
        if let Some(announcer) = self.announcer() {
            announcer.notify(&notice).await;
        }
    }

    fn status(&self) -> SessionStatus {
        let (connected, playing) = self
            .handle
            .as_ref()
            .map(|h| (h.is_connected(), h.is_playing()))
            .unwrap_or((false, false));
        let metadata_source = self.settings.metadata.path.clone();

        SessionStatus {
            session_id: self.session_id,
            state: self.state,
            pipeline: self.pipeline.state(),
            target: self.target.clone(),
            connected,
            playing,
            metadata_reader_running: self.reader.as_ref().map(|r| r.is_running()).unwrap_or(false),
            keepalive_running: self
                .health
                .as_ref()
                .map(|h| h.keepalive_running())
                .unwrap_or(false),
            audio_source_present: self.pipeline.source_exists(),
            audio_source: self.pipeline.source().to_path_buf(),
            metadata_source_present: metadata_source.exists(),
            metadata_source,
            track: self.tracker.current().clone(),
            health: self.health_snapshot.borrow().clone(),
            reader: self
                .reader
                .as_ref()
                .map(|r| r.stats())
                .unwrap_or(self.last_reader_counters),
            restart_attempts: self.backoff.attempts(),
        }
    }
}
