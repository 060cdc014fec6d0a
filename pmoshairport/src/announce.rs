//! Announcements toward the listeners' side
//!
//! The session reports two kinds of things: track changes and operational
//! notices. Where they end up (a chat channel, a log, a web page) is up to
//! the [`Announcer`] implementation.
//!
//! ```
//! use pmoshairport::{Announcer, LogAnnouncer, Notice, TrackState};
//!
//! # tokio_test::block_on(async {
//! let track = TrackState {
//!     title: Some("Innuendo".into()),
//!     artist: Some("Queen".into()),
//!     album: None,
//! };
//! LogAnnouncer.announce_track(&track).await;
//! LogAnnouncer.notify(&Notice::PipelineRecovered).await;
//! # });
//! ```

use crate::track::TrackState;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tracing::{error, info, warn};

/// Operational notice for the people listening
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The pipeline failed; an automatic restart may follow
    PipelineError { reason: String, retry_in: Option<Duration> },
    PipelineRecovered,
    PipelineRestartFailed { reason: String },
    RetryBudgetExhausted { attempts: u32 },
    /// The keepalive could not restart playback
    KeepaliveGaveUp,
    TransportLost,
}

impl Notice {
    /// The session needs a manual action to resume audio
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Notice::PipelineError { .. } | Notice::PipelineRecovered)
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::PipelineError { reason, .. } => write!(f, "⚠️ Audio stream error: {reason}"),
            Notice::PipelineRecovered => f.write_str("✅ Audio stream restarted automatically"),
            Notice::PipelineRestartFailed { reason } => write!(
                f,
                "❌ Auto-restart failed: {reason}. Use restart or reconnect"
            ),
            Notice::RetryBudgetExhausted { attempts } => write!(
                f,
                "❌ Audio stream failed {attempts} times in a row. Use restart or reconnect"
            ),
            Notice::KeepaliveGaveUp => {
                f.write_str("🔄 Connection lost. Use reconnect to restore audio.")
            }
            Notice::TransportLost => {
                f.write_str("🔌 Voice connection lost. Use reconnect to restore audio.")
            }
        }
    }
}

#[async_trait]
pub trait Announcer: Send + Sync {
    /// Called once per track change with the new track
    async fn announce_track(&self, track: &TrackState);

    async fn notify(&self, notice: &Notice);
}

/// Announcer that writes to the log
#[derive(Debug, Default, Clone)]
pub struct LogAnnouncer;

#[async_trait]
impl Announcer for LogAnnouncer {
    async fn announce_track(&self, track: &TrackState) {
        info!(
            title = track.title_or_default(),
            artist = track.artist_or_default(),
            album = track.album_or_default(),
            "🎵 Now playing: {track}"
        );
    }

    async fn notify(&self, notice: &Notice) {
        match notice {
            Notice::PipelineRecovered => info!("{notice}"),
            Notice::PipelineError { .. } => warn!("{notice}"),
            _ => error!("{notice}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notice_texts() {
        let notice = Notice::PipelineError {
            reason: "ffmpeg exited with exit status: 1".into(),
            retry_in: Some(Duration::from_secs(3)),
        };
        assert_eq!(
            notice.to_string(),
            "⚠️ Audio stream error: ffmpeg exited with exit status: 1"
        );
        assert!(!notice.is_terminal());

        assert_eq!(
            Notice::PipelineRecovered.to_string(),
            "✅ Audio stream restarted automatically"
        );
        assert!(Notice::RetryBudgetExhausted { attempts: 5 }
            .to_string()
            .contains("5 times"));
        assert!(Notice::KeepaliveGaveUp.is_terminal());
        assert!(Notice::TransportLost.is_terminal());
    }
}
