//! Linux session host via MPRIS over the D-Bus session bus
//!
//! Players are the `org.mpris.MediaPlayer2.*` names on the session bus, queried
//! through `dbus-send`. MPRIS property changes are not subscribed to; a watcher
//! thread diffs player snapshots on an interval and invokes the registered
//! callbacks, the way a platform session manager would. Differences are taken
//! against the state at registration, so nothing that happens between a
//! caller's first read and the next pass is lost.

use anyhow::{Context, Result};
use mediabridge_core::{
    Artwork, CallbackToken, KeyAction, MediaKey, MediaKeyEvent, MediaMetadata, MediaSession, PlatformError,
    PlaybackSnapshot, PlaybackStatus, QueueEntry, SessionCallback, SessionChange, SessionHandle, SessionHost,
    SessionId, SessionsChangedCallback, SettingsNavigation,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

const MPRIS_PREFIX: &str = "org.mpris.MediaPlayer2.";
const MPRIS_PATH: &str = "/org/mpris/MediaPlayer2";
const PLAYER_INTERFACE: &str = "org.mpris.MediaPlayer2.Player";
const DBUS_NAME: &str = "org.freedesktop.DBus";

/// Default interval between two watcher passes
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_millis(500);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A method-call channel to the session bus
pub trait Bus: Send + Sync {
    /// Call `args` (object path, member, arguments) on `dest` and return the printed reply
    fn send(&self, dest: &str, args: &[&str]) -> Result<String, PlatformError>;
}

/// The `dbus-send` command line tool
pub struct DbusSend;

impl Bus for DbusSend {
    fn send(&self, dest: &str, args: &[&str]) -> Result<String, PlatformError> {
        let output = Command::new("dbus-send")
            .arg("--session")
            .arg("--print-reply")
            .arg(format!("--dest={}", dest))
            .args(args)
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("ServiceUnknown") || stderr.contains("NameHasNoOwner") {
                return Err(PlatformError::StaleSession(dest.to_string()));
            }
            return Err(PlatformError::Command(stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn list_names(bus: &dyn Bus) -> Result<String, PlatformError> {
    bus.send(DBUS_NAME, &["/org/freedesktop/DBus", "org.freedesktop.DBus.ListNames"])
}

/// MPRIS bus names from a `ListNames` reply, dedicated players before browsers
fn parse_player_names(reply: &str) -> Vec<String> {
    let (browsers, players): (Vec<String>, Vec<String>) = reply
        .lines()
        .filter(|line| line.contains(MPRIS_PREFIX))
        .map(|line| {
            line.trim()
                .trim_start_matches("string \"")
                .trim_end_matches('"')
                .to_string()
        })
        .partition(|name| is_browser(name));

    // Browsers are likely playing video
    players.into_iter().chain(browsers).collect()
}

fn is_browser(name: &str) -> bool {
    ["firefox", "chrome", "chromium"]
        .iter()
        .any(|browser| name.contains(browser))
}

/// Value of a scalar variant line such as `variant int64 42` or `string "x"`
fn parse_scalar(text: &str) -> Option<String> {
    let text = text.trim().trim_start_matches("variant").trim();
    if let Some(start) = text.find('"') {
        let rest = &text[start + 1..];
        let end = rest.rfind('"')?;
        return Some(rest[..end].to_string());
    }

    let mut parts = text.split_whitespace();
    match parts.next()? {
        "byte" | "boolean" | "int16" | "uint16" | "int32" | "uint32" | "int64" | "uint64" | "double" => {
            parts.next().map(str::to_string)
        }
        _ => None,
    }
}

/// Value of a `Properties.Get` reply
fn parse_property(reply: &str) -> Option<String> {
    reply
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("variant"))
        .and_then(parse_scalar)
}

/// Flatten a `Metadata` reply into key/value strings. Arrays keep their first element.
fn parse_metadata(reply: &str) -> HashMap<String, String> {
    let lines: Vec<&str> = reply.lines().map(str::trim).collect();
    let mut metadata = HashMap::new();

    let mut i = 0;
    while i < lines.len() {
        if lines[i] != "dict entry(" {
            i += 1;
            continue;
        }
        let Some(key) = lines.get(i + 1).and_then(|line| parse_scalar(line)) else {
            i += 1;
            continue;
        };
        let Some(value_line) = lines.get(i + 2).filter(|line| line.starts_with("variant")) else {
            i += 2;
            continue;
        };

        let value = if value_line.contains("array [") {
            lines[i + 3..]
                .iter()
                .take_while(|line| !line.starts_with(']'))
                .find_map(|line| parse_scalar(line))
        } else {
            parse_scalar(value_line)
        };
        if let Some(value) = value {
            metadata.insert(key, value);
        }
        i += 3;
    }

    metadata
}

/// Local path of a `file://` URL. Only the empty and `localhost` hosts are local.
fn file_url_path(url: &str) -> Option<PathBuf> {
    let rest = url.strip_prefix("file://")?;
    let path = rest.strip_prefix("localhost").unwrap_or(rest);
    if !path.starts_with('/') {
        return None;
    }
    let decoded = urlencoding::decode(path).ok()?;
    Some(PathBuf::from(decoded.into_owned()))
}

fn playback_status(label: &str) -> PlaybackStatus {
    match label {
        "Playing" => PlaybackStatus::Playing,
        "Paused" => PlaybackStatus::Paused,
        "Stopped" => PlaybackStatus::Stopped,
        _ => PlaybackStatus::None,
    }
}

/// `mpris:length` is in microseconds
fn length_ms(map: &HashMap<String, String>) -> Option<i64> {
    map.get("mpris:length")
        .and_then(|length| length.parse::<i64>().ok())
        .map(|us| us / 1000)
}

fn metadata_from_map(map: &HashMap<String, String>) -> Option<MediaMetadata> {
    if map.is_empty() {
        return None;
    }

    let album_art = map
        .get("mpris:artUrl")
        .and_then(|url| file_url_path(url))
        .and_then(|path| match std::fs::read(&path) {
            Ok(bytes) => Some(Artwork::Encoded(bytes)),
            Err(e) => {
                debug!("Failed to read cover {}: {}", path.display(), e);
                None
            }
        });

    Some(MediaMetadata {
        title: map.get("xesam:title").cloned(),
        artist: map
            .get("xesam:artist")
            .or_else(|| map.get("xesam:albumArtist"))
            .cloned(),
        album: map.get("xesam:album").cloned(),
        duration_ms: length_ms(map),
        album_art,
        art: None,
    })
}

/// What the watcher compares between two passes
#[derive(Clone, Debug, PartialEq)]
struct Snapshot {
    metadata: HashMap<String, String>,
    status: Option<String>,
}

/// One MPRIS player on the session bus
pub struct MprisPlayer {
    bus: Arc<dyn Bus>,
    bus_name: String,
    callbacks: Mutex<HashMap<CallbackToken, SessionCallback>>,
    last_seen: Mutex<Option<Snapshot>>,
    next_token: AtomicU64,
}

impl MprisPlayer {
    fn new(bus: Arc<dyn Bus>, bus_name: String) -> Self {
        Self {
            bus,
            bus_name,
            callbacks: Mutex::new(HashMap::new()),
            last_seen: Mutex::new(None),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn bus_name(&self) -> &str {
        &self.bus_name
    }

    fn get(&self, name: &str) -> Result<String, PlatformError> {
        self.bus.send(
            &self.bus_name,
            &[
                MPRIS_PATH,
                "org.freedesktop.DBus.Properties.Get",
                &format!("string:{}", PLAYER_INTERFACE),
                &format!("string:{}", name),
            ],
        )
    }

    fn property(&self, name: &str) -> Result<Option<String>, PlatformError> {
        Ok(parse_property(&self.get(name)?))
    }

    fn metadata_map(&self) -> Result<HashMap<String, String>, PlatformError> {
        Ok(parse_metadata(&self.get("Metadata")?))
    }

    fn call(&self, method: &str, args: &[&str]) -> Result<(), PlatformError> {
        let member = format!("{}.{}", PLAYER_INTERFACE, method);
        let mut full = vec![MPRIS_PATH, member.as_str()];
        full.extend_from_slice(args);
        self.bus.send(&self.bus_name, &full)?;
        Ok(())
    }

    fn snapshot(&self) -> Result<Snapshot, PlatformError> {
        Ok(Snapshot {
            metadata: self.metadata_map()?,
            status: self.property("PlaybackStatus")?,
        })
    }

    fn has_callbacks(&self) -> bool {
        !lock(&self.callbacks).is_empty()
    }

    fn notify(&self, change: SessionChange) {
        let callbacks: Vec<SessionCallback> = lock(&self.callbacks).values().cloned().collect();
        for callback in callbacks {
            callback(change.clone());
        }
    }

    /// Compare with the last recorded snapshot and notify what changed
    fn watch(&self) {
        let current = match self.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                debug!("Skipping {}: {}", self.bus_name, e);
                return;
            }
        };
        let previous = lock(&self.last_seen).replace(current.clone());
        let Some(previous) = previous else {
            return;
        };

        if previous.metadata != current.metadata {
            debug!("{}: metadata changed", self.bus_name);
            self.notify(SessionChange::Metadata(metadata_from_map(&current.metadata)));
        }
        if previous.status != current.status {
            debug!("{}: playback status {:?}", self.bus_name, current.status);
            match self.playback_state() {
                Ok(playback) => self.notify(SessionChange::PlaybackState(playback)),
                Err(e) => debug!("Failed to read playback state of {}: {}", self.bus_name, e),
            }
        }
    }
}

impl MediaSession for MprisPlayer {
    fn id(&self) -> SessionId {
        SessionId::new(self.bus_name.clone())
    }

    fn package_name(&self) -> Result<String, PlatformError> {
        Ok(self
            .bus_name
            .strip_prefix(MPRIS_PREFIX)
            .unwrap_or(&self.bus_name)
            .to_string())
    }

    fn metadata(&self) -> Result<Option<MediaMetadata>, PlatformError> {
        Ok(metadata_from_map(&self.metadata_map()?))
    }

    fn playback_state(&self) -> Result<Option<PlaybackSnapshot>, PlatformError> {
        let Some(label) = self.property("PlaybackStatus")? else {
            return Ok(None);
        };
        let status = playback_status(&label);

        // Position and Rate are optional in MPRIS
        let position_ms = self
            .property("Position")
            .ok()
            .flatten()
            .and_then(|us| us.parse::<i64>().ok())
            .map_or(0, |us| us / 1000);
        let rate = self
            .property("Rate")
            .ok()
            .flatten()
            .and_then(|rate| rate.parse::<f32>().ok())
            .unwrap_or(1.0);

        Ok(Some(PlaybackSnapshot {
            status,
            position_ms,
            playback_speed: if status.is_playing() { rate } else { 0.0 },
            active_queue_item_id: None,
        }))
    }

    /// Length only; the cover file is not read
    fn duration_ms(&self) -> Result<Option<i64>, PlatformError> {
        Ok(length_ms(&self.metadata_map()?))
    }

    fn queue(&self) -> Result<Option<Vec<QueueEntry>>, PlatformError> {
        Ok(None)
    }

    fn register_callback(&self, callback: SessionCallback) -> Result<CallbackToken, PlatformError> {
        {
            let mut last_seen = lock(&self.last_seen);
            if last_seen.is_none() {
                *last_seen = Some(self.snapshot()?);
            }
        }
        let token = CallbackToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        lock(&self.callbacks).insert(token, callback);
        Ok(token)
    }

    fn unregister_callback(&self, token: CallbackToken) {
        lock(&self.callbacks).remove(&token);
    }

    fn dispatch_media_key(&self, event: MediaKeyEvent) -> Result<(), PlatformError> {
        // MPRIS methods act on press; the release has no counterpart
        if event.action == KeyAction::Up {
            return Ok(());
        }
        let method = match event.key {
            MediaKey::PlayPause => "PlayPause",
            MediaKey::Stop => "Stop",
            MediaKey::Next => "Next",
            MediaKey::Previous => "Previous",
        };
        debug!("{}: {}", self.bus_name, method);
        self.call(method, &[])
    }

    fn seek_to(&self, position_ms: i64) -> Result<(), PlatformError> {
        let track_id = self
            .metadata_map()?
            .remove("mpris:trackid")
            .ok_or_else(|| PlatformError::Command(format!("{} reports no track id", self.bus_name)))?;
        let track = format!("objpath:{}", track_id);
        let offset = format!("int64:{}", position_ms.saturating_mul(1000));
        self.call("SetPosition", &[track.as_str(), offset.as_str()])
    }
}

struct Shared {
    bus: Arc<dyn Bus>,
    package_name: String,
    watch_interval: Duration,
    players: Mutex<Vec<Arc<MprisPlayer>>>,
    listeners: Mutex<HashMap<CallbackToken, SessionsChangedCallback>>,
    /// Player names last reported to listeners; `None` until known
    announced: Mutex<Option<Vec<String>>>,
    next_token: AtomicU64,
    watcher_started: AtomicBool,
}

impl Shared {
    /// Current players in bus order, reusing known player objects
    fn refresh(&self) -> Result<Vec<Arc<MprisPlayer>>, PlatformError> {
        let names = parse_player_names(&list_names(self.bus.as_ref())?);
        let mut players = lock(&self.players);
        let refreshed: Vec<Arc<MprisPlayer>> = names
            .into_iter()
            .map(|name| {
                players
                    .iter()
                    .find(|player| player.bus_name == name)
                    .cloned()
                    .unwrap_or_else(|| Arc::new(MprisPlayer::new(Arc::clone(&self.bus), name)))
            })
            .collect();
        *players = refreshed.clone();
        Ok(refreshed)
    }

    fn notify_sessions(&self, players: &[Arc<MprisPlayer>]) {
        let handles: Vec<SessionHandle> = players
            .iter()
            .map(|player| Arc::clone(player) as SessionHandle)
            .collect();
        let listeners: Vec<SessionsChangedCallback> = lock(&self.listeners).values().cloned().collect();
        for listener in listeners {
            listener(handles.clone());
        }
    }

    /// One watcher pass: report list changes, then diff every watched player
    fn watch_pass(&self) {
        let players = match self.refresh() {
            Ok(players) => players,
            Err(e) => {
                warn!("Failed to list MPRIS players: {}", e);
                return;
            }
        };

        let names: Vec<String> = players.iter().map(|player| player.bus_name.clone()).collect();
        let changed = {
            let mut announced = lock(&self.announced);
            let changed = announced.as_ref() != Some(&names);
            if changed {
                *announced = Some(names.clone());
            }
            changed
        };
        if changed {
            info!("MPRIS players changed: {:?}", names);
            self.notify_sessions(&players);
        }

        for player in players.iter().filter(|player| player.has_callbacks()) {
            player.watch();
        }
    }
}

/// Watcher loop; ends once the host is dropped
fn watch(shared: Weak<Shared>, interval: Duration) {
    loop {
        thread::sleep(interval);
        let Some(shared) = shared.upgrade() else {
            debug!("MPRIS watcher exiting");
            return;
        };
        shared.watch_pass();
    }
}

/// Session host backed by the D-Bus session bus
pub struct MprisHost {
    shared: Arc<Shared>,
}

impl MprisHost {
    /// Check that the session bus answers, then build the host
    pub fn connect(package_name: impl Into<String>, watch_interval: Duration) -> Result<Self> {
        let bus: Arc<dyn Bus> = Arc::new(DbusSend);
        list_names(bus.as_ref()).context("D-Bus session bus is not reachable")?;
        Ok(Self::with_bus(bus, package_name, watch_interval))
    }

    /// Host over any [`Bus`]
    pub fn with_bus(bus: Arc<dyn Bus>, package_name: impl Into<String>, watch_interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                bus,
                package_name: package_name.into(),
                watch_interval,
                players: Mutex::new(Vec::new()),
                listeners: Mutex::new(HashMap::new()),
                announced: Mutex::new(None),
                next_token: AtomicU64::new(1),
                watcher_started: AtomicBool::new(false),
            }),
        }
    }

    fn ensure_watcher(&self) -> Result<(), PlatformError> {
        if self.shared.watcher_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let shared = Arc::downgrade(&self.shared);
        let interval = self.shared.watch_interval;
        thread::Builder::new()
            .name("mpris-watcher".to_string())
            .spawn(move || watch(shared, interval))?;
        Ok(())
    }
}

impl SessionHost for MprisHost {
    fn active_sessions(&self) -> Result<Vec<SessionHandle>, PlatformError> {
        Ok(self
            .shared
            .refresh()?
            .into_iter()
            .map(|player| player as SessionHandle)
            .collect())
    }

    fn subscribe_sessions_changed(
        &self,
        callback: SessionsChangedCallback,
    ) -> Result<CallbackToken, PlatformError> {
        // List changes are reported against the players present now
        match self.shared.refresh() {
            Ok(players) => {
                let mut announced = lock(&self.shared.announced);
                if announced.is_none() {
                    *announced = Some(players.iter().map(|player| player.bus_name.clone()).collect());
                }
            }
            Err(e) => debug!("No player baseline yet: {}", e),
        }

        self.ensure_watcher()?;
        let token = CallbackToken(self.shared.next_token.fetch_add(1, Ordering::Relaxed));
        lock(&self.shared.listeners).insert(token, callback);
        Ok(token)
    }

    fn unsubscribe_sessions_changed(&self, token: CallbackToken) {
        lock(&self.shared.listeners).remove(&token);
    }

    /// D-Bus has no notification-access gate
    fn enabled_listeners(&self) -> Option<String> {
        Some(self.shared.package_name.clone())
    }

    fn open_notification_settings(&self, _request_code: i32) -> Result<SettingsNavigation, PlatformError> {
        Ok(SettingsNavigation::Completed)
    }
}
