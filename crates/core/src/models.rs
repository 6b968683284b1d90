use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

use crate::codec::base64_bytes;

/// Identity of a platform media session (controller token, D-Bus name, ...)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Playback state reported by the platform, keyed by its integer code
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PlaybackStatus {
    None,
    Stopped,
    Paused,
    Playing,
    FastForwarding,
    Rewinding,
    Buffering,
    Error,
    Connecting,
    SkippingToPrevious,
    SkippingToNext,
    SkippingToQueueItem,
    /// Code outside the known range, kept verbatim
    Unknown(i32),
}

impl PlaybackStatus {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => PlaybackStatus::None,
            1 => PlaybackStatus::Stopped,
            2 => PlaybackStatus::Paused,
            3 => PlaybackStatus::Playing,
            4 => PlaybackStatus::FastForwarding,
            5 => PlaybackStatus::Rewinding,
            6 => PlaybackStatus::Buffering,
            7 => PlaybackStatus::Error,
            8 => PlaybackStatus::Connecting,
            9 => PlaybackStatus::SkippingToPrevious,
            10 => PlaybackStatus::SkippingToNext,
            11 => PlaybackStatus::SkippingToQueueItem,
            other => PlaybackStatus::Unknown(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            PlaybackStatus::None => 0,
            PlaybackStatus::Stopped => 1,
            PlaybackStatus::Paused => 2,
            PlaybackStatus::Playing => 3,
            PlaybackStatus::FastForwarding => 4,
            PlaybackStatus::Rewinding => 5,
            PlaybackStatus::Buffering => 6,
            PlaybackStatus::Error => 7,
            PlaybackStatus::Connecting => 8,
            PlaybackStatus::SkippingToPrevious => 9,
            PlaybackStatus::SkippingToNext => 10,
            PlaybackStatus::SkippingToQueueItem => 11,
            PlaybackStatus::Unknown(code) => *code,
        }
    }

    /// Stable label sent to the embedding application
    pub fn label(&self) -> Cow<'static, str> {
        let label = match self {
            PlaybackStatus::None => "STATE_NONE",
            PlaybackStatus::Stopped => "STATE_STOPPED",
            PlaybackStatus::Paused => "STATE_PAUSED",
            PlaybackStatus::Playing => "STATE_PLAYING",
            PlaybackStatus::FastForwarding => "STATE_FAST_FORWARDING",
            PlaybackStatus::Rewinding => "STATE_REWINDING",
            PlaybackStatus::Buffering => "STATE_BUFFERING",
            PlaybackStatus::Error => "STATE_ERROR",
            PlaybackStatus::Connecting => "STATE_CONNECTING",
            PlaybackStatus::SkippingToPrevious => "STATE_SKIPPING_TO_PREVIOUS",
            PlaybackStatus::SkippingToNext => "STATE_SKIPPING_TO_NEXT",
            PlaybackStatus::SkippingToQueueItem => "STATE_SKIPPING_TO_QUEUE_ITEM",
            PlaybackStatus::Unknown(code) => return Cow::Owned(format!("UNKNOWN ({})", code)),
        };
        Cow::Borrowed(label)
    }

    pub fn is_playing(&self) -> bool {
        *self == PlaybackStatus::Playing
    }
}

impl fmt::Display for PlaybackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Live playback state of a session
#[derive(Clone, Debug, PartialEq)]
pub struct PlaybackSnapshot {
    pub status: PlaybackStatus,
    pub position_ms: i64,
    pub playback_speed: f32,
    pub active_queue_item_id: Option<i64>,
}

impl PlaybackSnapshot {
    pub fn new(status: PlaybackStatus, position_ms: i64) -> Self {
        Self {
            status,
            position_ms,
            playback_speed: if status.is_playing() { 1.0 } else { 0.0 },
            active_queue_item_id: None,
        }
    }
}

/// Cover image as handed over by the platform
#[derive(Clone, Debug, PartialEq)]
pub enum Artwork {
    /// Raw RGBA pixels, row-major
    Bitmap { width: u32, height: u32, rgba: Vec<u8> },
    /// Image already in a container format (PNG, JPEG, ...)
    Encoded(Vec<u8>),
}

/// Metadata of the item loaded in a session
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MediaMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub duration_ms: Option<i64>,
    /// The dedicated "album art" image key
    pub album_art: Option<Artwork>,
    /// The generic "art" image key
    pub art: Option<Artwork>,
}

impl MediaMetadata {
    /// Album art, falling back to the generic art image
    pub fn cover(&self) -> Option<&Artwork> {
        self.album_art.as_ref().or(self.art.as_ref())
    }
}

/// Description attached to a queue entry
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueueItemDescription {
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub icon: Option<Artwork>,
    pub icon_uri: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueueEntry {
    pub queue_id: i64,
    pub description: QueueItemDescription,
}

/// Now-playing record pushed to the embedding application
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NowPlaying {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub package_name: String,
    #[serde(default, with = "base64_bytes")]
    pub album_art: Option<Vec<u8>>,
    pub is_playing: bool,
    /// Label of the playback state; absent when the session reports none
    pub state: Option<String>,
    pub song_changed: bool,
    pub queue_changed: bool,
    pub queue_index: Option<i64>,
    #[serde(default)]
    pub next_item: QueueItemSummary,
    #[serde(default)]
    pub previous_item: QueueItemSummary,
}

/// Position record pushed at the poll cadence
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionInfo {
    /// Milliseconds
    pub position: i64,
    /// Milliseconds, 0 if unknown
    pub duration: i64,
    pub playback_speed: f32,
    pub state: String,
}

/// Transport-safe summary of a queue entry. The empty summary serializes as `{}`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItemSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_bytes")]
    pub album_art: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album_art_uri: Option<String>,
}

impl QueueItemSummary {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.artist.is_none()
            && self.album_art.is_none()
            && self.album_art_uri.is_none()
    }
}

/// Hardware media keys understood by sessions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MediaKey {
    PlayPause,
    Stop,
    Next,
    Previous,
}

impl MediaKey {
    /// Platform key code
    pub fn key_code(&self) -> i32 {
        match self {
            MediaKey::PlayPause => 85,
            MediaKey::Stop => 86,
            MediaKey::Next => 87,
            MediaKey::Previous => 88,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyAction {
    Down,
    Up,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MediaKeyEvent {
    pub action: KeyAction,
    pub key: MediaKey,
}

impl MediaKeyEvent {
    pub fn down(key: MediaKey) -> Self {
        Self { action: KeyAction::Down, key }
    }

    pub fn up(key: MediaKey) -> Self {
        Self { action: KeyAction::Up, key }
    }
}
