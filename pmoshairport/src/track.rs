//! Current track information and the announce rule
//!
//! Shairport sends title, artist and album as separate frames, in any
//! order and often repeated. [`TrackTracker`] folds them into a
//! [`TrackState`] and decides when the state is worth announcing: title and
//! artist both known, and different from what was last announced.

use serde::Serialize;
use std::fmt;

pub const UNKNOWN_TITLE: &str = "Unknown Title";
pub const UNKNOWN_ARTIST: &str = "Unknown Artist";
pub const UNKNOWN_ALBUM: &str = "Unknown Album";

/// Track fields carried by shairport `core` frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackField {
    Title,
    Artist,
    Album,
}

impl TrackField {
    /// Maps a DMAP code (`minm`, `asar`, `asal`) to a field
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "minm" => Some(TrackField::Title),
            "asar" => Some(TrackField::Artist),
            "asal" => Some(TrackField::Album),
            _ => None,
        }
    }
}

/// One decoded metadata value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackUpdate {
    pub field: TrackField,
    pub value: String,
}

impl TrackUpdate {
    pub fn new(field: TrackField, value: impl Into<String>) -> Self {
        Self {
            field,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrackState {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
}

impl TrackState {
    /// Title and artist are both known
    pub fn is_announceable(&self) -> bool {
        self.title.is_some() && self.artist.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.artist.is_none() && self.album.is_none()
    }

    pub fn title_or_default(&self) -> &str {
        self.title.as_deref().unwrap_or(UNKNOWN_TITLE)
    }

    pub fn artist_or_default(&self) -> &str {
        self.artist.as_deref().unwrap_or(UNKNOWN_ARTIST)
    }

    pub fn album_or_default(&self) -> &str {
        self.album.as_deref().unwrap_or(UNKNOWN_ALBUM)
    }

    fn set(&mut self, field: TrackField, value: Option<String>) {
        match field {
            TrackField::Title => self.title = value,
            TrackField::Artist => self.artist = value,
            TrackField::Album => self.album = value,
        }
    }
}

impl fmt::Display for TrackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.artist_or_default(), self.title_or_default())?;
        if let Some(album) = &self.album {
            write!(f, " ({album})")?;
        }
        Ok(())
    }
}

/// Folds updates into the current state and tracks what was announced
#[derive(Debug, Default)]
pub struct TrackTracker {
    current: TrackState,
    announced: Option<TrackState>,
}

impl TrackTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> &TrackState {
        &self.current
    }

    /// Applies one update and returns the snapshot to announce, if any
    ///
    /// Blank values clear the field.
    pub fn apply(&mut self, update: TrackUpdate) -> Option<TrackState> {
        let trimmed = update.value.trim();
        let value = (!trimmed.is_empty()).then(|| trimmed.to_string());
        self.current.set(update.field, value);

        if !self.current.is_announceable() {
            return None;
        }
        if self.announced.as_ref() == Some(&self.current) {
            return None;
        }

        self.announced = Some(self.current.clone());
        Some(self.current.clone())
    }

    /// Forgets the current and announced tracks
    pub fn reset(&mut self) {
        self.current = TrackState::default();
        self.announced = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn title(v: &str) -> TrackUpdate {
        TrackUpdate::new(TrackField::Title, v)
    }

    fn artist(v: &str) -> TrackUpdate {
        TrackUpdate::new(TrackField::Artist, v)
    }

    fn album(v: &str) -> TrackUpdate {
        TrackUpdate::new(TrackField::Album, v)
    }

    #[test]
    fn test_codes() {
        assert_eq!(TrackField::from_code("minm"), Some(TrackField::Title));
        assert_eq!(TrackField::from_code("asar"), Some(TrackField::Artist));
        assert_eq!(TrackField::from_code("asal"), Some(TrackField::Album));
        assert_eq!(TrackField::from_code("pvol"), None);
    }

    #[test]
    fn test_announce_once_title_and_artist_known() {
        let mut tracker = TrackTracker::new();
        assert_eq!(tracker.apply(title("Bohemian Rhapsody")), None);

        let announced = tracker.apply(artist("Queen")).unwrap();
        assert_eq!(announced.title.as_deref(), Some("Bohemian Rhapsody"));
        assert_eq!(announced.artist.as_deref(), Some("Queen"));

        // Same values again: nothing new
        assert_eq!(tracker.apply(title("Bohemian Rhapsody")), None);
        assert_eq!(tracker.apply(artist("Queen")), None);
    }

    #[test]
    fn test_album_only_never_announces() {
        let mut tracker = TrackTracker::new();
        assert_eq!(tracker.apply(album("A Night at the Opera")), None);
        assert_eq!(tracker.apply(album("News of the World")), None);
        assert_eq!(tracker.current().album.as_deref(), Some("News of the World"));
    }

    #[test]
    fn test_album_change_after_announce_is_announced() {
        let mut tracker = TrackTracker::new();
        tracker.apply(title("Bohemian Rhapsody"));
        tracker.apply(artist("Queen"));

        let announced = tracker.apply(album("A Night at the Opera")).unwrap();
        assert_eq!(announced.album.as_deref(), Some("A Night at the Opera"));
    }

    #[test]
    fn test_blank_values_clear_the_field() {
        let mut tracker = TrackTracker::new();
        tracker.apply(title("Bohemian Rhapsody"));
        tracker.apply(artist("Queen"));

        assert_eq!(tracker.apply(artist("   ")), None);
        assert_eq!(tracker.current().artist, None);

        // Back to the announced state: not a change
        assert_eq!(tracker.apply(artist("Queen")), None);

        let next = tracker.apply(title("Innuendo")).unwrap();
        assert_eq!(next.title.as_deref(), Some("Innuendo"));
    }

    #[test]
    fn test_next_song_is_announced() {
        let mut tracker = TrackTracker::new();
        tracker.apply(title("Bohemian Rhapsody"));
        tracker.apply(artist("Queen"));

        let next = tracker.apply(title("Under Pressure")).unwrap();
        assert_eq!(next.title.as_deref(), Some("Under Pressure"));
        assert_eq!(next.artist.as_deref(), Some("Queen"));
    }

    #[test]
    fn test_reset_allows_reannouncing() {
        let mut tracker = TrackTracker::new();
        tracker.apply(title("Bohemian Rhapsody"));
        tracker.apply(artist("Queen"));
        tracker.reset();

        assert!(tracker.current().is_empty());
        tracker.apply(title("Bohemian Rhapsody"));
        assert!(tracker.apply(artist("Queen")).is_some());
    }

    #[test]
    fn test_display_fallbacks() {
        let state = TrackState::default();
        assert_eq!(state.to_string(), "Unknown Artist - Unknown Title");
        assert_eq!(state.album_or_default(), "Unknown Album");

        let state = TrackState {
            title: Some("Bohemian Rhapsody".into()),
            artist: Some("Queen".into()),
            album: Some("A Night at the Opera".into()),
        };
        assert_eq!(
            state.to_string(),
            "Queen - Bohemian Rhapsody (A Night at the Opera)"
        );
    }
}
