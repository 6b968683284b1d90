use crate::error::PlatformError;
use crate::models::{MediaKeyEvent, MediaMetadata, PlaybackSnapshot, QueueEntry, SessionId};
use std::sync::Arc;

/// Registration returned by the platform for a callback
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallbackToken(pub u64);

/// Change notification delivered by a session, carrying the new value
#[derive(Clone, Debug)]
pub enum SessionChange {
    Metadata(Option<MediaMetadata>),
    PlaybackState(Option<PlaybackSnapshot>),
    Queue(Option<Vec<QueueEntry>>),
}

pub type SessionHandle = Arc<dyn MediaSession>;

/// Invoked by a session whenever its metadata, playback state or queue changes
pub type SessionCallback = Arc<dyn Fn(SessionChange) + Send + Sync>;

/// Invoked by the host with the new active session list
pub type SessionsChangedCallback = Arc<dyn Fn(Vec<SessionHandle>) + Send + Sync>;

/// Outcome of a request to show the notification-access settings
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettingsNavigation {
    /// Settings screen shown; the host reports back when the user returns
    Pending,
    /// Nothing to show on this platform
    Completed,
}

/// A platform media session. Any accessor may fail once the session is gone.
pub trait MediaSession: Send + Sync {
    /// Stable identity of this session
    fn id(&self) -> SessionId;

    /// Identifier of the app owning the session
    fn package_name(&self) -> Result<String, PlatformError>;

    fn metadata(&self) -> Result<Option<MediaMetadata>, PlatformError>;

    fn playback_state(&self) -> Result<Option<PlaybackSnapshot>, PlatformError>;

    /// Track length in milliseconds, read on every position tick.
    ///
    /// Hosts whose metadata carries artwork should override this to skip
    /// loading it.
    fn duration_ms(&self) -> Result<Option<i64>, PlatformError> {
        Ok(self.metadata()?.and_then(|metadata| metadata.duration_ms))
    }

    fn queue(&self) -> Result<Option<Vec<QueueEntry>>, PlatformError>;

    fn register_callback(&self, callback: SessionCallback) -> Result<CallbackToken, PlatformError>;

    /// Unknown tokens are ignored
    fn unregister_callback(&self, token: CallbackToken);

    fn dispatch_media_key(&self, event: MediaKeyEvent) -> Result<(), PlatformError>;

    fn seek_to(&self, position_ms: i64) -> Result<(), PlatformError>;
}

/// The platform media-session service
pub trait SessionHost: Send + Sync {
    /// Currently controllable sessions, in platform order
    fn active_sessions(&self) -> Result<Vec<SessionHandle>, PlatformError>;

    fn subscribe_sessions_changed(
        &self,
        callback: SessionsChangedCallback,
    ) -> Result<CallbackToken, PlatformError>;

    fn unsubscribe_sessions_changed(&self, token: CallbackToken);

    /// Registry string listing apps allowed to read notifications
    fn enabled_listeners(&self) -> Option<String>;

    fn open_notification_settings(&self, request_code: i32) -> Result<SettingsNavigation, PlatformError>;
}
