//! Windows session host via System Media Transport Controls (SMTC)
//!
//! Every app that publishes SMTC metadata (Spotify, browsers, Groove, ...)
//! shows up as one session. SMTC raises property, playback and session-list
//! events itself, so nothing is polled here apart from the engine's position
//! ticks.
//!
//! Requires Windows 10 version 1803 or later.

use anyhow::{anyhow, Context, Result};
use mediabridge_core::{
    Artwork, CallbackToken, KeyAction, MediaKey, MediaKeyEvent, MediaMetadata, MediaSession, PlatformError,
    PlaybackSnapshot, PlaybackStatus, QueueEntry, SessionCallback, SessionChange, SessionHandle, SessionHost,
    SessionId, SessionsChangedCallback, SettingsNavigation,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use windows::{
    core::RuntimeType,
    Foundation::{AsyncStatus, IAsyncOperation, IAsyncOperationWithProgress, TypedEventHandler},
    Media::Control::{
        GlobalSystemMediaTransportControlsSession, GlobalSystemMediaTransportControlsSessionManager,
        GlobalSystemMediaTransportControlsSessionPlaybackStatus,
    },
    Storage::Streams::{Buffer, DataReader, InputStreamOptions},
};

/// WinRT time spans count 100 ns ticks
const TICKS_PER_MS: i64 = 10_000;

const OPERATION_TIMEOUT: Duration = Duration::from_secs(2);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn winrt(e: windows::core::Error) -> PlatformError {
    PlatformError::Command(e.to_string())
}

fn ticks_to_ms(ticks: i64) -> i64 {
    ticks / TICKS_PER_MS
}

fn ms_to_ticks(ms: i64) -> i64 {
    ms.saturating_mul(TICKS_PER_MS)
}

/// A WinRT async operation that can be polled to completion
trait Pending {
    type Output;
    fn status(&self) -> windows::core::Result<AsyncStatus>;
    fn results(&self) -> windows::core::Result<Self::Output>;
}

impl<T: RuntimeType + 'static> Pending for IAsyncOperation<T> {
    type Output = T;

    fn status(&self) -> windows::core::Result<AsyncStatus> {
        self.Status()
    }

    fn results(&self) -> windows::core::Result<T> {
        self.GetResults()
    }
}

impl<T: RuntimeType + 'static, P: RuntimeType + 'static> Pending for IAsyncOperationWithProgress<T, P> {
    type Output = T;

    fn status(&self) -> windows::core::Result<AsyncStatus> {
        self.Status()
    }

    fn results(&self) -> windows::core::Result<T> {
        self.GetResults()
    }
}

/// Block until the operation completes or times out
fn wait<P: Pending>(operation: P) -> Result<P::Output, PlatformError> {
    let start = Instant::now();
    loop {
        match operation.status().map_err(winrt)? {
            AsyncStatus::Completed => return operation.results().map_err(winrt),
            AsyncStatus::Started => {
                if start.elapsed() > OPERATION_TIMEOUT {
                    return Err(PlatformError::Command("SMTC operation timed out".to_string()));
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            AsyncStatus::Canceled => return Err(PlatformError::Command("SMTC operation was canceled".to_string())),
            _ => return Err(PlatformError::Command("SMTC operation failed".to_string())),
        }
    }
}

fn playback_status(status: GlobalSystemMediaTransportControlsSessionPlaybackStatus) -> PlaybackStatus {
    match status {
        GlobalSystemMediaTransportControlsSessionPlaybackStatus::Playing => PlaybackStatus::Playing,
        GlobalSystemMediaTransportControlsSessionPlaybackStatus::Paused => PlaybackStatus::Paused,
        GlobalSystemMediaTransportControlsSessionPlaybackStatus::Stopped => PlaybackStatus::Stopped,
        GlobalSystemMediaTransportControlsSessionPlaybackStatus::Changing => PlaybackStatus::Buffering,
        GlobalSystemMediaTransportControlsSessionPlaybackStatus::Opened => PlaybackStatus::Stopped,
        _ => PlaybackStatus::None,
    }
}

/// Apps publish empty strings for unknown fields
fn non_empty(value: windows::core::Result<windows::core::HSTRING>) -> Option<String> {
    value
        .ok()
        .map(|value| value.to_string())
        .filter(|value| !value.is_empty())
}

fn read_duration(session: &GlobalSystemMediaTransportControlsSession) -> Result<Option<i64>, PlatformError> {
    let timeline = session.GetTimelineProperties().map_err(winrt)?;
    let end = timeline.EndTime().map_or(0, |span| ticks_to_ms(span.Duration));
    Ok((end > 0).then_some(end))
}

fn read_playback(session: &GlobalSystemMediaTransportControlsSession) -> Result<Option<PlaybackSnapshot>, PlatformError> {
    let info = session.GetPlaybackInfo().map_err(winrt)?;
    let status = playback_status(info.PlaybackStatus().map_err(winrt)?);
    let rate = info
        .PlaybackRate()
        .and_then(|rate| rate.Value())
        .unwrap_or(1.0) as f32;
    let position_ms = session
        .GetTimelineProperties()
        .and_then(|timeline| timeline.Position())
        .map_or(0, |span| ticks_to_ms(span.Duration));

    Ok(Some(PlaybackSnapshot {
        status,
        position_ms,
        playback_speed: if status.is_playing() { rate } else { 0.0 },
        active_queue_item_id: None,
    }))
}

fn read_thumbnail(
    properties: &windows::Media::Control::GlobalSystemMediaTransportControlsSessionMediaProperties,
) -> Result<Option<Vec<u8>>, PlatformError> {
    let Ok(thumbnail) = properties.Thumbnail() else {
        return Ok(None);
    };
    let stream = wait(thumbnail.OpenReadAsync().map_err(winrt)?)?;
    let size = stream.Size().map_err(winrt)?;
    if size == 0 {
        return Ok(None);
    }

    let buffer = Buffer::Create(size as u32).map_err(winrt)?;
    let capacity = buffer.Capacity().map_err(winrt)?;
    let filled = wait(stream.ReadAsync(&buffer, capacity, InputStreamOptions::None).map_err(winrt)?)?;
    let reader = DataReader::FromBuffer(&filled).map_err(winrt)?;
    let mut bytes = vec![0u8; filled.Length().map_err(winrt)? as usize];
    reader.ReadBytes(&mut bytes).map_err(winrt)?;
    Ok(Some(bytes))
}

fn read_metadata(session: &GlobalSystemMediaTransportControlsSession) -> Result<Option<MediaMetadata>, PlatformError> {
    let properties = wait(session.TryGetMediaPropertiesAsync().map_err(winrt)?)?;

    let album_art = match read_thumbnail(&properties) {
        Ok(bytes) => bytes.map(Artwork::Encoded),
        Err(e) => {
            debug!("Failed to read SMTC thumbnail: {}", e);
            None
        }
    };

    Ok(Some(MediaMetadata {
        title: non_empty(properties.Title()),
        artist: non_empty(properties.Artist()).or_else(|| non_empty(properties.AlbumArtist())),
        album: non_empty(properties.AlbumTitle()),
        duration_ms: read_duration(session)?,
        album_art,
        art: None,
    }))
}

/// One app's SMTC session
pub struct SmtcSession {
    session: GlobalSystemMediaTransportControlsSession,
    app_id: String,
    /// Media-properties and playback-info event tokens per callback
    handlers: Mutex<HashMap<CallbackToken, (i64, i64)>>,
    next_token: AtomicU64,
}

impl SmtcSession {
    fn new(session: GlobalSystemMediaTransportControlsSession) -> Result<Self, PlatformError> {
        let app_id = session.SourceAppUserModelId().map_err(winrt)?.to_string();
        Ok(Self {
            session,
            app_id,
            handlers: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        })
    }

    fn wait_accepted(&self, what: &str, operation: IAsyncOperation<bool>) -> Result<(), PlatformError> {
        if wait(operation)? {
            Ok(())
        } else {
            Err(PlatformError::Command(format!("{} rejected {}", self.app_id, what)))
        }
    }
}

impl MediaSession for SmtcSession {
    fn id(&self) -> SessionId {
        SessionId::new(self.app_id.clone())
    }

    fn package_name(&self) -> Result<String, PlatformError> {
        Ok(self.app_id.clone())
    }

    fn metadata(&self) -> Result<Option<MediaMetadata>, PlatformError> {
        read_metadata(&self.session)
    }

    fn playback_state(&self) -> Result<Option<PlaybackSnapshot>, PlatformError> {
        read_playback(&self.session)
    }

    fn duration_ms(&self) -> Result<Option<i64>, PlatformError> {
        read_duration(&self.session)
    }

    /// SMTC does not expose a queue
    fn queue(&self) -> Result<Option<Vec<QueueEntry>>, PlatformError> {
        Ok(None)
    }

    fn register_callback(&self, callback: SessionCallback) -> Result<CallbackToken, PlatformError> {
        let on_metadata = Arc::clone(&callback);
        let session = self.session.clone();
        let metadata_token = self
            .session
            .MediaPropertiesChanged(&TypedEventHandler::new(move |_, _| {
                match read_metadata(&session) {
                    Ok(metadata) => on_metadata(SessionChange::Metadata(metadata)),
                    Err(e) => debug!("Failed to read SMTC metadata: {}", e),
                }
                Ok(())
            }))
            .map_err(winrt)?;

        let session = self.session.clone();
        let playback_token = match self.session.PlaybackInfoChanged(&TypedEventHandler::new(move |_, _| {
            match read_playback(&session) {
                Ok(playback) => callback(SessionChange::PlaybackState(playback)),
                Err(e) => debug!("Failed to read SMTC playback info: {}", e),
            }
            Ok(())
        })) {
            Ok(token) => token,
            Err(e) => {
                let _ = self.session.RemoveMediaPropertiesChanged(metadata_token);
                return Err(winrt(e));
            }
        };

        let token = CallbackToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        lock(&self.handlers).insert(token, (metadata_token, playback_token));
        Ok(token)
    }

    fn unregister_callback(&self, token: CallbackToken) {
        let Some((metadata_token, playback_token)) = lock(&self.handlers).remove(&token) else {
            return;
        };
        if let Err(e) = self.session.RemoveMediaPropertiesChanged(metadata_token) {
            debug!("Failed to remove SMTC handler of {}: {}", self.app_id, e);
        }
        if let Err(e) = self.session.RemovePlaybackInfoChanged(playback_token) {
            debug!("Failed to remove SMTC handler of {}: {}", self.app_id, e);
        }
    }

    fn dispatch_media_key(&self, event: MediaKeyEvent) -> Result<(), PlatformError> {
        // SMTC commands are single calls; only the press is forwarded
        if event.action == KeyAction::Up {
            return Ok(());
        }
        let operation = match event.key {
            MediaKey::PlayPause => self.session.TryTogglePlayPauseAsync(),
            MediaKey::Stop => self.session.TryStopAsync(),
            MediaKey::Next => self.session.TrySkipNextAsync(),
            MediaKey::Previous => self.session.TrySkipPreviousAsync(),
        }
        .map_err(winrt)?;
        debug!("{}: {:?}", self.app_id, event.key);
        self.wait_accepted(&format!("{:?}", event.key), operation)
    }

    fn seek_to(&self, position_ms: i64) -> Result<(), PlatformError> {
        let operation = self
            .session
            .TryChangePlaybackPositionAsync(ms_to_ticks(position_ms))
            .map_err(winrt)?;
        self.wait_accepted("seek", operation)
    }
}

struct Shared {
    manager: GlobalSystemMediaTransportControlsSessionManager,
    /// Known sessions, reused while SMTC hands back the same object
    sessions: Mutex<Vec<Arc<SmtcSession>>>,
}

impl Shared {
    fn sessions(&self) -> Result<Vec<Arc<SmtcSession>>, PlatformError> {
        let listed = self.manager.GetSessions().map_err(winrt)?;
        let count = listed.Size().map_err(winrt)?;

        let mut known = lock(&self.sessions);
        let mut current = Vec::with_capacity(count as usize);
        for index in 0..count {
            let session = listed.GetAt(index).map_err(winrt)?;
            match known.iter().find(|known| known.session == session) {
                Some(existing) => current.push(Arc::clone(existing)),
                None => match SmtcSession::new(session) {
                    Ok(created) => current.push(Arc::new(created)),
                    Err(e) => debug!("Skipping SMTC session without app id: {}", e),
                },
            }
        }
        *known = current.clone();
        Ok(current)
    }
}

/// Session host backed by the SMTC session manager
pub struct SmtcHost {
    shared: Arc<Shared>,
    package_name: String,
    listeners: Mutex<HashMap<CallbackToken, i64>>,
    next_token: AtomicU64,
}

impl SmtcHost {
    /// Request the session manager from the OS
    pub fn connect(package_name: impl Into<String>) -> Result<Self> {
        let operation = GlobalSystemMediaTransportControlsSessionManager::RequestAsync()
            .map_err(|e| anyhow!("Failed to create RequestAsync operation: {}", e))?;
        let manager = wait(operation).context("SMTC session manager is not available")?;
        info!("Connected to the SMTC session manager");

        Ok(Self {
            shared: Arc::new(Shared {
                manager,
                sessions: Mutex::new(Vec::new()),
            }),
            package_name: package_name.into(),
            listeners: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        })
    }
}

impl SessionHost for SmtcHost {
    fn active_sessions(&self) -> Result<Vec<SessionHandle>, PlatformError> {
        Ok(self
            .shared
            .sessions()?
            .into_iter()
            .map(|session| session as SessionHandle)
            .collect())
    }

    fn subscribe_sessions_changed(
        &self,
        callback: SessionsChangedCallback,
    ) -> Result<CallbackToken, PlatformError> {
        // The manager owns the handler; a strong reference would never be released
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let event_token = self
            .shared
            .manager
            .SessionsChanged(&TypedEventHandler::new(move |_, _| {
                let Some(shared) = shared.upgrade() else {
                    return Ok(());
                };
                match shared.sessions() {
                    Ok(sessions) => {
                        info!("SMTC sessions changed: {} active", sessions.len());
                        callback(sessions.into_iter().map(|session| session as SessionHandle).collect());
                    }
                    Err(e) => warn!("Failed to list SMTC sessions: {}", e),
                }
                Ok(())
            }))
            .map_err(winrt)?;

        let token = CallbackToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners).insert(token, event_token);
        Ok(token)
    }

    fn unsubscribe_sessions_changed(&self, token: CallbackToken) {
        let Some(event_token) = lock(&self.listeners).remove(&token) else {
            return;
        };
        if let Err(e) = self.shared.manager.RemoveSessionsChanged(event_token) {
            debug!("Failed to remove SMTC sessions handler: {}", e);
        }
    }

    /// Any desktop app may read SMTC sessions
    fn enabled_listeners(&self) -> Option<String> {
        Some(self.package_name.clone())
    }

    fn open_notification_settings(&self, _request_code: i32) -> Result<SettingsNavigation, PlatformError> {
        Ok(SettingsNavigation::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_span_conversion() {
        assert_eq!(ticks_to_ms(1_800_000_000), 180_000);
        assert_eq!(ticks_to_ms(9_999), 0);
        assert_eq!(ms_to_ticks(5000), 50_000_000);
        assert_eq!(ms_to_ticks(i64::MAX), i64::MAX);
    }

    #[test]
    fn test_smtc_status_mapping() {
        use GlobalSystemMediaTransportControlsSessionPlaybackStatus as Smtc;

        assert_eq!(playback_status(Smtc::Playing), PlaybackStatus::Playing);
        assert_eq!(playback_status(Smtc::Paused), PlaybackStatus::Paused);
        assert_eq!(playback_status(Smtc::Stopped), PlaybackStatus::Stopped);
        assert_eq!(playback_status(Smtc::Changing), PlaybackStatus::Buffering);
        assert_eq!(playback_status(Smtc::Closed), PlaybackStatus::None);
    }

    #[test]
    fn test_empty_fields_are_absent() {
        assert_eq!(non_empty(Ok(windows::core::HSTRING::from("Song"))).as_deref(), Some("Song"));
        assert_eq!(non_empty(Ok(windows::core::HSTRING::new())), None);
    }
}
