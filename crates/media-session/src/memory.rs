//! In-memory session host
//!
//! Scriptable sessions used by the demo backend and the test suites. Setters
//! notify registered callbacks synchronously on the calling thread, the way a
//! platform delivers change notifications.

use mediabridge_core::{
    CallbackToken, KeyAction, MediaKey, MediaKeyEvent, MediaMetadata, MediaSession, PlatformError,
    PlaybackSnapshot, PlaybackStatus, QueueEntry, SessionCallback, SessionChange, SessionHandle,
    SessionHost, SessionId, SessionsChangedCallback, SettingsNavigation,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

#[derive(Default)]
struct SessionState {
    metadata: Option<MediaMetadata>,
    playback: Option<PlaybackSnapshot>,
    queue: Option<Vec<QueueEntry>>,
    stale: bool,
    callbacks: HashMap<CallbackToken, SessionCallback>,
    registrations: u64,
    keys: Vec<MediaKeyEvent>,
    seeks: Vec<i64>,
}

/// A session whose state is set from the outside
pub struct InMemorySession {
    id: SessionId,
    package_name: String,
    state: Mutex<SessionState>,
    next_token: AtomicU64,
}

impl InMemorySession {
    pub fn new(id: impl Into<String>, package_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: SessionId::new(id),
            package_name: package_name.into(),
            state: Mutex::new(SessionState::default()),
            next_token: AtomicU64::new(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        // A panicking test callback must not wedge the other tests
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Set the initial state without notifying anyone
    pub fn load(
        &self,
        metadata: Option<MediaMetadata>,
        playback: Option<PlaybackSnapshot>,
        queue: Option<Vec<QueueEntry>>,
    ) {
        let mut state = self.lock();
        state.metadata = metadata;
        state.playback = playback;
        state.queue = queue;
    }

    pub fn set_metadata(&self, metadata: Option<MediaMetadata>) {
        self.lock().metadata = metadata.clone();
        self.notify(SessionChange::Metadata(metadata));
    }

    pub fn set_playback_state(&self, playback: Option<PlaybackSnapshot>) {
        self.lock().playback = playback.clone();
        self.notify(SessionChange::PlaybackState(playback));
    }

    pub fn set_queue(&self, queue: Option<Vec<QueueEntry>>) {
        self.lock().queue = queue.clone();
        self.notify(SessionChange::Queue(queue));
    }

    /// Update the reported position without a change notification, as
    /// platforms do while a track plays
    pub fn advance_position(&self, position_ms: i64) {
        if let Some(playback) = self.lock().playback.as_mut() {
            playback.position_ms = position_ms;
        }
    }

    /// Every later access fails as if the owning app had exited
    pub fn mark_stale(&self) {
        self.lock().stale = true;
    }

    pub fn callback_count(&self) -> usize {
        self.lock().callbacks.len()
    }

    /// Total number of successful registrations over the session's life
    pub fn registration_count(&self) -> u64 {
        self.lock().registrations
    }

    pub fn dispatched_keys(&self) -> Vec<MediaKeyEvent> {
        self.lock().keys.clone()
    }

    pub fn seeks(&self) -> Vec<i64> {
        self.lock().seeks.clone()
    }

    fn notify(&self, change: SessionChange) {
        let callbacks: Vec<SessionCallback> = self.lock().callbacks.values().cloned().collect();
        for callback in callbacks {
            callback(change.clone());
        }
    }

    fn check(&self) -> Result<MutexGuard<'_, SessionState>, PlatformError> {
        let state = self.lock();
        if state.stale {
            return Err(PlatformError::StaleSession(self.id.to_string()));
        }
        Ok(state)
    }

    /// Apply a key-down to the simulated player
    fn apply_key(&self, key: MediaKey) {
        let next = {
            let state = self.lock();
            let Some(current) = state.playback.as_ref() else {
                return;
            };
            let status = match key {
                MediaKey::PlayPause if current.status.is_playing() => PlaybackStatus::Paused,
                MediaKey::PlayPause => PlaybackStatus::Playing,
                MediaKey::Stop => PlaybackStatus::Stopped,
                MediaKey::Next | MediaKey::Previous => return,
            };
            PlaybackSnapshot {
                status,
                playback_speed: if status.is_playing() { 1.0 } else { 0.0 },
                ..current.clone()
            }
        };
        self.set_playback_state(Some(next));
    }
}

impl MediaSession for InMemorySession {
    fn id(&self) -> SessionId {
        self.id.clone()
    }

    fn package_name(&self) -> Result<String, PlatformError> {
        self.check()?;
        Ok(self.package_name.clone())
    }

    fn metadata(&self) -> Result<Option<MediaMetadata>, PlatformError> {
        Ok(self.check()?.metadata.clone())
    }

    fn playback_state(&self) -> Result<Option<PlaybackSnapshot>, PlatformError> {
        Ok(self.check()?.playback.clone())
    }

    fn queue(&self) -> Result<Option<Vec<QueueEntry>>, PlatformError> {
        Ok(self.check()?.queue.clone())
    }

    fn register_callback(&self, callback: SessionCallback) -> Result<CallbackToken, PlatformError> {
        let mut state = self.check()?;
        let token = CallbackToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        state.callbacks.insert(token, callback);
        state.registrations += 1;
        Ok(token)
    }

    fn unregister_callback(&self, token: CallbackToken) {
        self.lock().callbacks.remove(&token);
    }

    fn dispatch_media_key(&self, event: MediaKeyEvent) -> Result<(), PlatformError> {
        self.check()?.keys.push(event);
        debug!("{}: media key {:?}", self.id, event);
        if event.action == KeyAction::Down {
            self.apply_key(event.key);
        }
        Ok(())
    }

    fn seek_to(&self, position_ms: i64) -> Result<(), PlatformError> {
        let next = {
            let mut state = self.check()?;
            state.seeks.push(position_ms);
            state.playback.as_ref().map(|playback| PlaybackSnapshot {
                position_ms,
                ..playback.clone()
            })
        };
        if next.is_some() {
            self.set_playback_state(next);
        }
        Ok(())
    }
}

/// A host whose active session list is set from the outside
pub struct InMemoryHost {
    sessions: Mutex<Vec<Arc<InMemorySession>>>,
    listeners: Mutex<HashMap<CallbackToken, SessionsChangedCallback>>,
    enabled_listeners: Mutex<Option<String>>,
    settings: Mutex<SettingsBehaviour>,
    listing_error: Mutex<Option<String>>,
    next_token: AtomicU64,
}

#[derive(Default)]
struct SettingsBehaviour {
    navigation: Option<SettingsNavigation>,
    requests: Vec<i32>,
}

impl Default for InMemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryHost {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(Vec::new()),
            listeners: Mutex::new(HashMap::new()),
            enabled_listeners: Mutex::new(None),
            settings: Mutex::new(SettingsBehaviour::default()),
            listing_error: Mutex::new(None),
            next_token: AtomicU64::new(1),
        }
    }

    /// Replace the active session list and notify subscribers
    pub fn set_sessions(&self, sessions: Vec<Arc<InMemorySession>>) {
        *lock(&self.sessions) = sessions;
        let handles = self.handles();
        let listeners: Vec<SessionsChangedCallback> = lock(&self.listeners).values().cloned().collect();
        for listener in listeners {
            listener(handles.clone());
        }
    }

    /// Replace the active session list without notifying subscribers
    pub fn preload_sessions(&self, sessions: Vec<Arc<InMemorySession>>) {
        *lock(&self.sessions) = sessions;
    }

    pub fn set_enabled_listeners(&self, registry: Option<&str>) {
        *lock(&self.enabled_listeners) = registry.map(str::to_string);
    }

    /// How `open_notification_settings` answers; defaults to `Pending`
    pub fn set_settings_navigation(&self, navigation: SettingsNavigation) {
        lock(&self.settings).navigation = Some(navigation);
    }

    /// Make `active_sessions` fail with `message` until reset with `None`
    pub fn set_listing_error(&self, message: Option<&str>) {
        *lock(&self.listing_error) = message.map(str::to_string);
    }

    pub fn settings_requests(&self) -> Vec<i32> {
        lock(&self.settings).requests.clone()
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    fn handles(&self) -> Vec<SessionHandle> {
        lock(&self.sessions)
            .iter()
            .map(|session| Arc::clone(session) as SessionHandle)
            .collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionHost for InMemoryHost {
    fn active_sessions(&self) -> Result<Vec<SessionHandle>, PlatformError> {
        if let Some(message) = lock(&self.listing_error).clone() {
            return Err(PlatformError::Unavailable(message));
        }
        Ok(self.handles())
    }

    fn subscribe_sessions_changed(
        &self,
        callback: SessionsChangedCallback,
    ) -> Result<CallbackToken, PlatformError> {
        let token = CallbackToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners).insert(token, callback);
        Ok(token)
    }

    fn unsubscribe_sessions_changed(&self, token: CallbackToken) {
        lock(&self.listeners).remove(&token);
    }

    fn enabled_listeners(&self) -> Option<String> {
        lock(&self.enabled_listeners).clone()
    }

    fn open_notification_settings(&self, request_code: i32) -> Result<SettingsNavigation, PlatformError> {
        let mut settings = lock(&self.settings);
        settings.requests.push(request_code);
        Ok(settings.navigation.unwrap_or(SettingsNavigation::Pending))
    }
}
