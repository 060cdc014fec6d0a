//! Test doubles for the session supervisor

#![allow(dead_code)]

use async_trait::async_trait;
use pmoshairport::{
    Announcer, CompletionSender, EncodedStream, Error, MediaSink, Notice, PlaybackCompletion,
    Result, SessionSettings, SessionSupervisor, SinkHandle, SinkTarget, TrackState, Transcoder,
};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};

// ============================================================================
// Sink
// ============================================================================

#[derive(Default)]
pub struct MockSink {
    pub connects: AtomicUsize,
    pub fail_connect: AtomicBool,
    targets: Mutex<Vec<SinkTarget>>,
    handles: Mutex<Vec<Arc<MockHandle>>>,
}

impl MockSink {
    pub fn targets(&self) -> Vec<SinkTarget> {
        self.targets.lock().unwrap().clone()
    }

    pub fn handle(&self) -> Arc<MockHandle> {
        self.handles
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("sink was never connected")
    }

    pub fn total_disconnects(&self) -> usize {
        self.handles
            .lock()
            .unwrap()
            .iter()
            .map(|h| h.disconnects.load(Ordering::SeqCst))
            .sum()
    }
}

#[async_trait]
impl MediaSink for MockSink {
    async fn connect(&self, target: &SinkTarget) -> Result<Arc<dyn SinkHandle>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::TransportLost("mock refuses connection".into()));
        }
        self.targets.lock().unwrap().push(target.clone());
        let handle = Arc::new(MockHandle::default());
        handle.connected.store(true, Ordering::SeqCst);
        self.handles.lock().unwrap().push(handle.clone());
        Ok(handle)
    }
}

#[derive(Default)]
pub struct MockHandle {
    connected: AtomicBool,
    playing: AtomicBool,
    pub plays: AtomicUsize,
    pub stops: AtomicUsize,
    pub disconnects: AtomicUsize,
    current: Mutex<Option<(EncodedStream, CompletionSender)>>,
}

impl MockHandle {
    /// Ends the current playback with an error, as a crashed transcoder would
    pub fn fail_playback(&self, reason: &str) {
        let current = self.current.lock().unwrap().take();
        self.playing.store(false, Ordering::SeqCst);
        if let Some((stream, done)) = current {
            drop(stream);
            done.complete(Err(Error::pipeline(reason)));
        }
    }

    /// The connection vanishes without any playback event
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::SeqCst);
    }
}

#[async_trait]
impl SinkHandle for MockHandle {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    async fn play(&self, stream: EncodedStream) -> Result<PlaybackCompletion> {
        if !self.is_connected() {
            return Err(Error::TransportLost("mock is disconnected".into()));
        }
        self.plays.fetch_add(1, Ordering::SeqCst);
        let (done, completion) = PlaybackCompletion::channel();
        *self.current.lock().unwrap() = Some((stream, done));
        self.playing.store(true, Ordering::SeqCst);
        Ok(completion)
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.current.lock().unwrap().take();
        self.playing.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.current.lock().unwrap().take();
        self.playing.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Transcoder
// ============================================================================

/// Counts live streams; a stream is live until dropped
#[derive(Default)]
pub struct FakeTranscoder {
    pub spawned: AtomicUsize,
    pub fail_spawns: AtomicBool,
    live: Arc<AtomicUsize>,
    max_live: Arc<AtomicUsize>,
}

impl FakeTranscoder {
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }
}

impl Transcoder for FakeTranscoder {
    fn spawn(&self, _source: &Path) -> Result<EncodedStream> {
        if self.fail_spawns.load(Ordering::SeqCst) {
            return Err(Error::pipeline("fake transcoder refuses to start"));
        }
        self.spawned.fetch_add(1, Ordering::SeqCst);
        let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(now, Ordering::SeqCst);
        Ok(EncodedStream::from_reader(
            LiveGuard {
                inner: tokio::io::empty(),
                live: self.live.clone(),
            },
            "fake",
        ))
    }
}

struct LiveGuard {
    inner: tokio::io::Empty,
    live: Arc<AtomicUsize>,
}

impl AsyncRead for LiveGuard {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Announcer
// ============================================================================

#[derive(Default)]
pub struct RecordingAnnouncer {
    tracks: Mutex<Vec<TrackState>>,
    notices: Mutex<Vec<Notice>>,
}

impl RecordingAnnouncer {
    pub fn tracks(&self) -> Vec<TrackState> {
        self.tracks.lock().unwrap().clone()
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().clone()
    }
}

#[async_trait]
impl Announcer for RecordingAnnouncer {
    async fn announce_track(&self, track: &TrackState) {
        self.tracks.lock().unwrap().push(track.clone());
    }

    async fn notify(&self, notice: &Notice) {
        self.notices.lock().unwrap().push(notice.clone());
    }
}

// ============================================================================
// Fixture
// ============================================================================

pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub sink: Arc<MockSink>,
    pub transcoder: Arc<FakeTranscoder>,
    pub recorder: Arc<RecordingAnnouncer>,
    pub announcer: Arc<dyn Announcer>,
    pub supervisor: SessionSupervisor,
}

impl Fixture {
    pub fn audio_path(dir: &Path) -> PathBuf {
        dir.join("shairport-sync-audio")
    }

    pub fn metadata_path(dir: &Path) -> PathBuf {
        dir.join("shairport-sync-metadata")
    }

    /// Settings against a temp dir: audio source present, no metadata pipe,
    /// no settle/reconnect pauses
    pub fn settings(dir: &Path) -> SessionSettings {
        let mut settings = SessionSettings::new(Self::audio_path(dir), Self::metadata_path(dir));
        settings.restart_settle = Duration::ZERO;
        settings.reconnect_delay = Duration::ZERO;
        settings.metadata.idle_poll = Duration::from_millis(10);
        settings
    }

    pub fn new() -> Self {
        Self::with_settings(|_| {})
    }

    pub fn with_settings(adjust: impl FnOnce(&mut SessionSettings)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(Self::audio_path(dir.path()), b"").unwrap();
        let mut settings = Self::settings(dir.path());
        adjust(&mut settings);

        let sink = Arc::new(MockSink::default());
        let transcoder = Arc::new(FakeTranscoder::default());
        let recorder = Arc::new(RecordingAnnouncer::default());
        let announcer: Arc<dyn Announcer> = recorder.clone();
        let supervisor = SessionSupervisor::spawn(settings, sink.clone(), transcoder.clone());

        Self {
            dir,
            sink,
            transcoder,
            recorder,
            announcer,
            supervisor,
        }
    }

    pub async fn start(&self, target: &str) -> Result<()> {
        self.supervisor
            .start_session(SinkTarget::new(target), &self.announcer)
            .await
    }
}
