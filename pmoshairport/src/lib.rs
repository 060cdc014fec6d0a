//! # pmoshairport - AirPlay relay for shairport-sync
//!
//! Relays the raw PCM feed written by [shairport-sync] into a live media
//! sink, follows the track metadata shairport publishes on its metadata
//! pipe, and keeps the broadcast alive across transient failures.
//!
//! ## Architecture
//!
//! ```text
//! shairport audio pipe ──▶ Transcoder (ffmpeg) ──▶ SinkHandle::play
//!                                   ▲                     │ completion
//!                                   │                     ▼
//!                          ┌───────────────── SessionSupervisor (actor) ◀── commands
//!                          │                        ▲          ▲
//! shairport metadata pipe ─▶ MetadataReader ─▶ TrackUpdate   KeepaliveSignal ◀── HealthMonitor
//!                                               │
//!                                               ▼
//!                                      Announcer::announce_track
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use pmoshairport::{
//!     Announcer, FfmpegTranscoder, FileSink, LogAnnouncer, SessionSettings, SessionSupervisor,
//!     SinkTarget,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> pmoshairport::Result<()> {
//! let supervisor = SessionSupervisor::spawn(
//!     SessionSettings::default(),
//!     Arc::new(FileSink::new()),
//!     Arc::new(FfmpegTranscoder::new("ffmpeg")),
//! );
//! let announcer: Arc<dyn Announcer> = Arc::new(LogAnnouncer);
//! supervisor
//!     .start_session(SinkTarget::new("/tmp/airplay.opus"), &announcer)
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! [shairport-sync]: https://github.com/mikebrady/shairport-sync

pub mod announce;
pub mod error;
pub mod frame;
pub mod health;
pub mod pipeline;
pub mod reader;
pub mod sink;
pub mod supervisor;
pub mod track;

#[cfg(feature = "pmoconfig")]
pub mod config_ext;

pub use announce::{Announcer, LogAnnouncer, Notice};
pub use error::{Error, Result, SourceKind};
pub use frame::{decode_track_update, parse_frame, FrameParseError, MetadataFrame};
pub use health::{HealthMonitor, HealthSettings, HealthSnapshot, KeepaliveSignal};
pub use pipeline::{
    Backoff, EncodedStream, FfmpegOptions, FfmpegTranscoder, PipelineEvent, PipelineManager,
    PipelineState, RetryPolicy, Transcoder,
};
pub use reader::{FrameAssembler, FrameDecoder, MetadataReader, ReaderCounters, ReaderSettings};
pub use sink::{CompletionSender, FileSink, MediaSink, PlaybackCompletion, SinkHandle, SinkTarget};
pub use supervisor::{SessionSettings, SessionState, SessionStatus, SessionSupervisor};
pub use track::{TrackField, TrackState, TrackTracker, TrackUpdate};

#[cfg(feature = "pmoconfig")]
pub use config_ext::ShairportConfigExt;
