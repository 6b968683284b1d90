//! Inbound method calls
//!
//! Every command re-queries the host and acts on the first active session,
//! or on the last reconciled one when the host cannot list its sessions.
//! Platform failures are logged and degrade to `false` or `null`; only a
//! missing seek position reaches the caller as an error.

use crate::normalizer::{self, ChangeHints, SessionView};
use mediabridge_core::{
    BridgeError, MediaKey, MediaKeyEvent, NowPlaying, SessionHandle, SessionHost, SettingsNavigation,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Request code attached to the notification-settings navigation
pub const SETTINGS_REQUEST_CODE: i32 = 1001;

/// Result of a method call as seen by the embedding application
pub type Reply = Result<Value, BridgeError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    GetCurrentMedia,
    HasPermission,
    OpenSettings,
    PlayPause,
    SkipToNext,
    SkipToPrevious,
    Stop,
    SeekTo,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GetCurrentMedia => "getCurrentMedia",
            Method::HasPermission => "hasPermission",
            Method::OpenSettings => "openSettings",
            Method::PlayPause => "playPause",
            Method::SkipToNext => "skipToNext",
            Method::SkipToPrevious => "skipToPrevious",
            Method::Stop => "stop",
            Method::SeekTo => "seekTo",
        }
    }

    /// Media key sent by transport methods
    pub fn media_key(&self) -> Option<MediaKey> {
        match self {
            Method::PlayPause => Some(MediaKey::PlayPause),
            Method::SkipToNext => Some(MediaKey::Next),
            Method::SkipToPrevious => Some(MediaKey::Previous),
            Method::Stop => Some(MediaKey::Stop),
            _ => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "getCurrentMedia" => Ok(Method::GetCurrentMedia),
            "hasPermission" => Ok(Method::HasPermission),
            "openSettings" => Ok(Method::OpenSettings),
            "playPause" => Ok(Method::PlayPause),
            "skipToNext" => Ok(Method::SkipToNext),
            "skipToPrevious" => Ok(Method::SkipToPrevious),
            "stop" => Ok(Method::Stop),
            "seekTo" => Ok(Method::SeekTo),
            other => Err(BridgeError::NotImplemented(other.to_string())),
        }
    }
}

/// A named method with its JSON arguments
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    pub method: String,
    #[serde(default)]
    pub arguments: Value,
}

impl MethodCall {
    pub fn new(method: impl Into<String>, arguments: Value) -> Self {
        Self {
            method: method.into(),
            arguments,
        }
    }

    pub fn without_arguments(method: impl Into<String>) -> Self {
        Self::new(method, Value::Null)
    }
}

pub struct CommandDispatcher {
    package_name: String,
    /// openSettings reply waiting for the settings screen to return
    pending_settings: Option<oneshot::Sender<Reply>>,
}

impl CommandDispatcher {
    pub fn new(package_name: impl Into<String>) -> Self {
        Self {
            package_name: package_name.into(),
            pending_settings: None,
        }
    }

    /// Answer `call`, or hand back the platform work it needs.
    ///
    /// Unknown methods, `hasPermission`, `openSettings` and invalid arguments
    /// are answered here. Everything else becomes a [`Command`] that queries
    /// the host afresh; `current` is the session it falls back to when the
    /// host cannot list its sessions. `openSettings` may answer later, from
    /// [`CommandDispatcher::settings_returned`].
    pub fn dispatch(
        &mut self,
        host: &dyn SessionHost,
        call: MethodCall,
        reply: oneshot::Sender<Reply>,
        current: Option<SessionHandle>,
    ) -> Option<Command> {
        let method = match call.method.parse::<Method>() {
            Ok(method) => method,
            Err(e) => {
                debug!("Unknown method {}", call.method);
                send(reply, Err(e));
                return None;
            }
        };
        debug!("Dispatching {}", method);

        let action = match method {
            Method::OpenSettings => {
                self.open_settings(host, reply);
                return None;
            }
            Method::HasPermission => {
                send(reply, Ok(Value::Bool(self.has_permission(host))));
                return None;
            }
            Method::GetCurrentMedia => Action::CurrentMedia,
            Method::PlayPause | Method::SkipToNext | Method::SkipToPrevious | Method::Stop => {
                match method.media_key() {
                    Some(key) => Action::Key(key),
                    None => {
                        send(reply, Ok(Value::Bool(false)));
                        return None;
                    }
                }
            }
            Method::SeekTo => match seek_position(&call.arguments) {
                Ok(position) => Action::Seek(position),
                Err(e) => {
                    send(reply, Err(e));
                    return None;
                }
            },
        };

        Some(Command {
            action,
            fallback: current,
            reply,
        })
    }

    /// Whether this app is listed in the enabled-listener registry
    pub fn has_permission(&self, host: &dyn SessionHost) -> bool {
        host.enabled_listeners()
            .is_some_and(|registry| registry.contains(&self.package_name))
    }

    fn open_settings(&mut self, host: &dyn SessionHost, reply: oneshot::Sender<Reply>) {
        if let Some(previous) = self.pending_settings.take() {
            debug!("openSettings superseded; answering the earlier request");
            send(previous, Ok(Value::Null));
        }

        match host.open_notification_settings(SETTINGS_REQUEST_CODE) {
            Ok(SettingsNavigation::Pending) => {
                info!("Opened notification settings, waiting for return");
                self.pending_settings = Some(reply);
            }
            Ok(SettingsNavigation::Completed) => send(reply, Ok(Value::Null)),
            Err(e) => {
                warn!("Failed to open notification settings: {}", e);
                send(reply, Ok(Value::Null));
            }
        }
    }

    /// The settings screen returned with `request_code`
    pub fn settings_returned(&mut self, request_code: i32) {
        if request_code != SETTINGS_REQUEST_CODE {
            debug!("Ignoring settings return with request code {}", request_code);
            return;
        }
        if let Some(pending) = self.pending_settings.take() {
            send(pending, Ok(Value::Null));
        }
    }

    pub fn has_pending_settings(&self) -> bool {
        self.pending_settings.is_some()
    }

    /// Answer an outstanding openSettings before shutting down
    pub fn close(&mut self) {
        if let Some(pending) = self.pending_settings.take() {
            send(pending, Err(BridgeError::EngineStopped));
        }
    }
}

enum Action {
    CurrentMedia,
    Key(MediaKey),
    Seek(i64),
}

/// A call that reads or drives the first active session
pub struct Command {
    action: Action,
    fallback: Option<SessionHandle>,
    reply: oneshot::Sender<Reply>,
}

impl Command {
    /// Execute against `host` and send the reply. Platform calls may block.
    pub fn run(self, host: &dyn SessionHost) {
        let session = first_session(host, self.fallback);
        let result = match self.action {
            Action::CurrentMedia => current_media(session)
                .map(|record| serde_json::to_value(record).unwrap_or_default())
                .unwrap_or(Value::Null),
            Action::Key(key) => Value::Bool(send_media_key(session, key)),
            Action::Seek(position_ms) => Value::Bool(seek_to(session, position_ms)),
        };
        send(self.reply, Ok(result));
    }
}

/// Snapshot of the first active session, independent of any subscription
fn current_media(session: Option<SessionHandle>) -> Option<NowPlaying> {
    let session = session?;
    match SessionView::capture(session.as_ref()) {
        Ok(view) => normalizer::now_playing(&view, ChangeHints::NONE),
        Err(e) => {
            warn!("Failed to read current media: {}", e);
            None
        }
    }
}

/// Key-down then key-up; false if there is no session
fn send_media_key(session: Option<SessionHandle>, key: MediaKey) -> bool {
    let Some(session) = session else {
        return false;
    };
    let sent = session
        .dispatch_media_key(MediaKeyEvent::down(key))
        .and_then(|_| session.dispatch_media_key(MediaKeyEvent::up(key)));
    match sent {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to send {:?} to {}: {}", key, session.id(), e);
            false
        }
    }
}

fn seek_to(session: Option<SessionHandle>, position_ms: i64) -> bool {
    let Some(session) = session else {
        return false;
    };
    match session.seek_to(position_ms) {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to seek {} to {} ms: {}", session.id(), position_ms, e);
            false
        }
    }
}

fn first_session(host: &dyn SessionHost, fallback: Option<SessionHandle>) -> Option<SessionHandle> {
    match host.active_sessions() {
        Ok(sessions) => sessions.into_iter().next(),
        Err(e) => {
            warn!("Failed to list active sessions, using the last known one: {}", e);
            fallback
        }
    }
}

/// Any JSON number, truncated to whole milliseconds
fn seek_position(arguments: &Value) -> Result<i64, BridgeError> {
    let position = arguments.get("position");
    position
        .and_then(Value::as_i64)
        .or_else(|| position.and_then(Value::as_f64).map(|ms| ms as i64))
        .ok_or_else(|| BridgeError::InvalidArgument("Position must not be null".to_string()))
}

fn send(reply: oneshot::Sender<Reply>, result: Reply) {
    if reply.send(result).is_err() {
        debug!("Caller dropped before the reply was sent");
    }
}
