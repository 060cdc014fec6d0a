//! Metadata pipe reader
//!
//! Shairport writes its metadata pipe from a separate process and may close
//! and reopen it at any time, so the pipe is read from a dedicated OS thread
//! with plain blocking-style I/O. Bytes are reassembled into frames, decoded,
//! and the resulting [`TrackUpdate`]s are handed to the async side through an
//! unbounded channel.

use crate::error::{Error, Result, SourceKind};
use crate::frame::{decode_track_update, ITEM_CLOSE};
use crate::track::TrackUpdate;
use serde::Serialize;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

pub const DEFAULT_IDLE_POLL: Duration = Duration::from_millis(100);
pub const DEFAULT_MISSING_RETRY: Duration = Duration::from_secs(5);
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Longest uninterrupted sleep, so that a stop request is seen quickly
const STOP_CHECK: Duration = Duration::from_millis(100);

const THREAD_NAME: &str = "shairport-metadata";

/// Larger partial lines or frames are dropped
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ReaderSettings {
    pub path: PathBuf,
    /// Sleep when the pipe has no data
    pub idle_poll: Duration,
    /// Sleep when the pipe does not exist
    pub missing_retry: Duration,
    /// Upper bound on the wait for the thread at shutdown
    pub join_timeout: Duration,
}

impl ReaderSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            idle_poll: DEFAULT_IDLE_POLL,
            missing_retry: DEFAULT_MISSING_RETRY,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

/// Counters shared between the reader thread and its owner
#[derive(Debug, Default)]
pub struct ReaderStats {
    frames: AtomicU64,
    updates: AtomicU64,
    parse_errors: AtomicU64,
}

impl ReaderStats {
    pub fn snapshot(&self) -> ReaderCounters {
        ReaderCounters {
            frames: self.frames.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReaderCounters {
    pub frames: u64,
    pub updates: u64,
    pub parse_errors: u64,
}

/// Reassembles `<item>` frames from arbitrary byte chunks
///
/// Lines are trimmed and concatenated; a frame ends with the first line
/// that ends with `</item>`. Neither a partial line nor a partial frame may
/// exceed [`MAX_FRAME_BYTES`]; oversized data is dropped and counted.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    pending: Vec<u8>,
    frame: String,
    discarded: u64,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes, returning every frame completed by them
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut frames = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(frame) = self.push_line(&String::from_utf8_lossy(&line)) {
                frames.push(frame);
            }
        }
        if self.pending.len() > MAX_FRAME_BYTES {
            warn!(bytes = self.pending.len(), "Metadata line too long, dropping it");
            self.pending.clear();
            self.frame.clear();
            self.discarded += 1;
        }
        frames
    }

    /// Feeds one complete line
    pub fn push_line(&mut self, line: &str) -> Option<String> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if self.frame.len() + line.len() > MAX_FRAME_BYTES {
            warn!(bytes = self.frame.len() + line.len(), "Metadata frame too long, dropping it");
            self.frame.clear();
            self.discarded += 1;
            return None;
        }
        self.frame.push_str(line);
        if line.ends_with(ITEM_CLOSE) {
            Some(std::mem::take(&mut self.frame))
        } else {
            None
        }
    }

    /// Number of oversized lines or frames dropped since the last call
    pub fn take_discarded(&mut self) -> u64 {
        std::mem::take(&mut self.discarded)
    }

    /// Called when the source has nothing more for now
    ///
    /// A last line without its newline still completes the frame when it
    /// ends with `</item>`; anything else stays pending.
    pub fn flush_idle(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        if !line.trim_end().ends_with(ITEM_CLOSE) {
            return None;
        }
        self.pending.clear();
        self.push_line(&line)
    }
}

/// Frame assembly plus decoding, with counters
#[derive(Debug)]
pub struct FrameDecoder {
    assembler: FrameAssembler,
    stats: Arc<ReaderStats>,
}

impl FrameDecoder {
    pub fn new(stats: Arc<ReaderStats>) -> Self {
        Self {
            assembler: FrameAssembler::new(),
            stats,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<TrackUpdate> {
        let frames = self.assembler.push_bytes(bytes);
        let discarded = self.assembler.take_discarded();
        if discarded > 0 {
            self.stats.parse_errors.fetch_add(discarded, Ordering::Relaxed);
        }
        frames
            .into_iter()
            .filter_map(|frame| self.decode(&frame))
            .collect()
    }

    pub fn flush_idle(&mut self) -> Option<TrackUpdate> {
        let frame = self.assembler.flush_idle()?;
        self.decode(&frame)
    }

    fn decode(&self, frame: &str) -> Option<TrackUpdate> {
        self.stats.frames.fetch_add(1, Ordering::Relaxed);
        match decode_track_update(frame) {
            Ok(Some(update)) => {
                self.stats.updates.fetch_add(1, Ordering::Relaxed);
                debug!(field = ?update.field, value = %update.value, "Track metadata received");
                Some(update)
            }
            Ok(None) => None,
            Err(err) => {
                self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, "Discarding malformed metadata frame");
                None
            }
        }
    }
}

/// Handle on the reader thread
///
/// Dropping the handle asks the thread to stop without waiting for it.
pub struct MetadataReader {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    stats: Arc<ReaderStats>,
    join_timeout: Duration,
}

impl MetadataReader {
    pub fn spawn(settings: ReaderSettings, tx: mpsc::UnboundedSender<TrackUpdate>) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(ReaderStats::default());
        let join_timeout = settings.join_timeout;

        let thread = {
            let stop = stop.clone();
            let stats = stats.clone();
            thread::Builder::new()
                .name(THREAD_NAME.into())
                .spawn(move || worker(settings, stop, stats, tx))?
        };

        Ok(Self {
            stop,
            thread: Some(thread),
            stats,
            join_timeout,
        })
    }

    pub fn stats(&self) -> ReaderCounters {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    /// Stops the thread, waiting at most the join timeout
    ///
    /// Returns `false` if the thread did not finish in time; it is then
    /// left to exit on its own.
    pub async fn shutdown(mut self) -> bool {
        self.stop.store(true, Ordering::SeqCst);
        let Some(handle) = self.thread.take() else {
            return true;
        };

        let join = tokio::task::spawn_blocking(move || handle.join());
        match tokio::time::timeout(self.join_timeout, join).await {
            Ok(Ok(Ok(()))) => {
                debug!("Metadata reader stopped");
                true
            }
            Ok(Ok(Err(_))) => {
                warn!("Metadata reader thread panicked");
                true
            }
            Ok(Err(err)) => {
                warn!(error = %err, "Failed to join metadata reader");
                false
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.join_timeout.as_millis() as u64,
                    "Metadata reader did not stop in time"
                );
                false
            }
        }
    }
}

impl Drop for MetadataReader {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn worker(
    settings: ReaderSettings,
    stop: Arc<AtomicBool>,
    stats: Arc<ReaderStats>,
    tx: mpsc::UnboundedSender<TrackUpdate>,
) {
    info!(path = %settings.path.display(), "Metadata reader started");
    let mut decoder = FrameDecoder::new(stats);
    let mut buf = [0u8; 4096];
    let mut reported_missing = false;

    'outer: while !stop.load(Ordering::SeqCst) && !tx.is_closed() {
        if !settings.path.exists() {
            if !reported_missing {
                let err = Error::source_unavailable(SourceKind::Metadata, &settings.path);
                warn!(error = %err, "Waiting for the metadata pipe");
                reported_missing = true;
            }
            pause(&stop, settings.missing_retry);
            continue;
        }
        reported_missing = false;

        let mut source = match open_source(&settings.path) {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %settings.path.display(), error = %err, "Cannot open metadata pipe");
                pause(&stop, settings.missing_retry);
                continue;
            }
        };
        info!(path = %settings.path.display(), "Metadata pipe opened");

        loop {
            if stop.load(Ordering::SeqCst) {
                break 'outer;
            }
            let idle = match source.read(&mut buf) {
                Ok(0) => true,
                Ok(n) => {
                    trace!(bytes = n, "Metadata bytes read");
                    for update in decoder.feed(&buf[..n]) {
                        if tx.send(update).is_err() {
                            break 'outer;
                        }
                    }
                    false
                }
                Err(err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::Interrupted =>
                {
                    true
                }
                Err(err) => {
                    warn!(error = %err, "Error reading metadata pipe, reopening");
                    pause(&stop, settings.idle_poll);
                    break;
                }
            };

            if idle {
                if let Some(update) = decoder.flush_idle() {
                    if tx.send(update).is_err() {
                        break 'outer;
                    }
                }
                if tx.is_closed() {
                    break 'outer;
                }
                pause(&stop, settings.idle_poll);
            }
        }
    }

    info!("Metadata reader stopped");
}

#[cfg(unix)]
fn open_source(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    // Opening a FIFO without a writer would block otherwise
    std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
}

#[cfg(not(unix))]
fn open_source(path: &Path) -> io::Result<File> {
    File::open(path)
}

/// Sleeps `total`, returning early once `stop` is raised
fn pause(stop: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(STOP_CHECK));
    }
}
