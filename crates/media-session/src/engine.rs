//! Observation engine
//!
//! One tokio task owns the subscription set, the poller, the stream slots and
//! the dispatcher. Platform callbacks and the embedding application only send
//! [`EngineEvent`]s; each event is handled to completion before the next one
//! is received, and poller ticks are interleaved between events.

use crate::dispatcher::{CommandDispatcher, MethodCall, Reply};
use crate::normalizer::{self, ChangeHints, SessionView};
use crate::poller::{PositionPoller, DEFAULT_POLL_INTERVAL};
use crate::registry::SubscriptionSet;
use crate::streams::{StreamConsumer, StreamKind, StreamRegistry};
use mediabridge_core::{
    BridgeError, CallbackToken, NowPlaying, PlatformError, PositionInfo, QueueItemSummary, SessionCallback,
    SessionChange, SessionHandle, SessionHost, SessionId,
};
use serde_json::Value;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default identifier looked up in the enabled-listener registry
pub const DEFAULT_PACKAGE_NAME: &str = "com.example.media_notification_service";

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Position update cadence while playing
    pub poll_interval: Duration,
    /// Own app identifier, checked by `hasPermission`
    pub package_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            package_name: DEFAULT_PACKAGE_NAME.to_string(),
        }
    }
}

/// Messages processed by the engine task, in arrival order
pub enum EngineEvent {
    /// The host reported a new active session list
    SessionsChanged(Vec<SessionHandle>),
    /// A tracked session changed
    Session { id: SessionId, change: SessionChange },
    Listen(StreamConsumer),
    Cancel(StreamKind),
    Call {
        call: MethodCall,
        reply: oneshot::Sender<Reply>,
    },
    /// The settings screen returned to the app
    SettingsReturned(i32),
    Shutdown,
}

pub struct Engine {
    host: Arc<dyn SessionHost>,
    subscriptions: SubscriptionSet,
    poller: PositionPoller,
    streams: StreamRegistry,
    dispatcher: CommandDispatcher,
    /// Weak so that dropping every handle ends the engine
    events: mpsc::WeakUnboundedSender<EngineEvent>,
    host_token: Option<CallbackToken>,
}

impl Engine {
    fn new(host: Arc<dyn SessionHost>, config: EngineConfig, events: mpsc::WeakUnboundedSender<EngineEvent>) -> Self {
        Self {
            host,
            subscriptions: SubscriptionSet::new(),
            poller: PositionPoller::new(config.poll_interval),
            streams: StreamRegistry::new(),
            dispatcher: CommandDispatcher::new(config.package_name),
            events,
            host_token: None,
        }
    }

    /// Start the engine on the current tokio runtime.
    ///
    /// The task subscribes to the host, reconciles the initial session list and
    /// runs until [`BridgeHandle::shutdown`] or until every handle is dropped.
    pub fn spawn(host: Arc<dyn SessionHost>, config: EngineConfig) -> (BridgeHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Engine::new(host, config, tx.downgrade());
        let task = tokio::spawn(engine.run(rx));
        (BridgeHandle { events: tx }, task)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EngineEvent>) {
        self.start().await;

        loop {
            tokio::select! {
                biased;

                event = rx.recv() => {
                    let Some(event) = event else {
                        debug!("All bridge handles dropped");
                        break;
                    };
                    if self.handle(event).await.is_break() {
                        break;
                    }
                }
                id = self.poller.next_tick() => self.on_poll_tick(&id).await,
            }
        }

        self.teardown();
    }

    async fn start(&mut self) {
        let host = Arc::clone(&self.host);
        let events = self.events.clone();
        let started = blocking(move || {
            let on_change = Arc::new(move |sessions: Vec<SessionHandle>| {
                send_event(&events, EngineEvent::SessionsChanged(sessions));
            });
            let token = host.subscribe_sessions_changed(on_change);
            Ok((token, host.active_sessions()))
        })
        .await;

        let sessions = match started {
            Ok((token, sessions)) => {
                match token {
                    Ok(token) => self.host_token = Some(token),
                    Err(e) => warn!("Failed to subscribe to session changes: {}", e),
                }
                sessions.unwrap_or_else(|e| {
                    warn!("Failed to list active sessions: {}", e);
                    Vec::new()
                })
            }
            Err(e) => {
                warn!("Failed to start session tracking: {}", e);
                Vec::new()
            }
        };
        self.reconcile(sessions).await;
        info!("Media engine started");
    }

    async fn handle(&mut self, event: EngineEvent) -> ControlFlow<()> {
        match event {
            EngineEvent::SessionsChanged(sessions) => self.reconcile(sessions).await,
            EngineEvent::Session { id, change } => self.on_session_change(&id, change).await,
            EngineEvent::Listen(consumer) => {
                let kind = consumer.kind();
                if self.streams.install(consumer) {
                    debug!("Replaced {} listener", kind);
                } else {
                    debug!("Listening on {}", kind);
                }
            }
            EngineEvent::Cancel(kind) => {
                debug!("Cancelled {} listener", kind);
                self.streams.clear(kind);
            }
            EngineEvent::Call { call, reply } => self.on_call(call, reply).await,
            EngineEvent::SettingsReturned(code) => self.dispatcher.settings_returned(code),
            EngineEvent::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    async fn on_call(&mut self, call: MethodCall, reply: oneshot::Sender<Reply>) {
        let current = self.subscriptions.current().cloned();
        let Some(command) = self.dispatcher.dispatch(self.host.as_ref(), call, reply, current) else {
            return;
        };

        // Awaited here so commands keep their order relative to other events
        let host = Arc::clone(&self.host);
        if let Err(e) = tokio::task::spawn_blocking(move || command.run(host.as_ref())).await {
            warn!("Command task failed: {}", e);
        }
    }

    async fn reconcile(&mut self, sessions: Vec<SessionHandle>) {
        let events = self.events.clone();
        let mut subscriptions = std::mem::take(&mut self.subscriptions);
        let reconciled = tokio::task::spawn_blocking(move || {
            let playing = subscriptions.reconcile(&sessions, |id| session_callback(events.clone(), id));
            (subscriptions, playing)
        })
        .await;

        let playing = match reconciled {
            Ok((subscriptions, playing)) => {
                self.subscriptions = subscriptions;
                playing
            }
            Err(e) => {
                warn!("Session reconciliation failed: {}", e);
                Vec::new()
            }
        };

        for id in playing {
            debug!("{} is already playing", id);
            self.poller.start(id);
        }

        let tracked_gone = self
            .poller
            .session()
            .is_some_and(|id| !self.subscriptions.contains(id));
        if tracked_gone {
            debug!("Polled session left the active list");
            self.poller.stop();
        }
    }

    async fn on_session_change(&mut self, id: &SessionId, change: SessionChange) {
        let Some(session) = self.subscriptions.get(id).cloned() else {
            debug!("Dropping change from untracked session {}", id);
            return;
        };

        let captured = blocking(move || SessionView::capture(session.as_ref())).await;
        let mut view = match captured {
            Ok(view) => view,
            Err(e) => {
                warn!("Failed to read session {}: {}", id, e);
                return;
            }
        };

        match change {
            SessionChange::Metadata(metadata) => {
                view.metadata = metadata;
                self.push_now_playing(&view, ChangeHints::metadata());
            }
            SessionChange::PlaybackState(playback) => {
                view.playback = playback;
                self.push_now_playing(&view, ChangeHints::playback_state());

                let playing = view
                    .playback
                    .as_ref()
                    .is_some_and(|playback| playback.status.is_playing());
                if playing {
                    self.poller.start(id.clone());
                } else {
                    self.poller.stop();
                    // Last known position with the new state
                    let duration = view.metadata.as_ref().and_then(|metadata| metadata.duration_ms);
                    let record = normalizer::position(view.playback.as_ref(), duration);
                    self.streams.position.emit(record);
                }
            }
            SessionChange::Queue(queue) => {
                view.queue = queue;
                self.push_now_playing(&view, ChangeHints::queue());
                let record = normalizer::queue(view.queue.as_deref());
                self.streams.queue.emit(record);
            }
        }
    }

    fn push_now_playing(&mut self, view: &SessionView, hints: ChangeHints) {
        let record = normalizer::now_playing(view, hints);
        self.streams.now_playing.emit(record);
    }

    async fn on_poll_tick(&mut self, id: &SessionId) {
        let Some(session) = self.subscriptions.get(id).cloned() else {
            self.poller.stop();
            return;
        };

        let state = blocking(move || Ok((session.playback_state()?, session.duration_ms()?))).await;
        match state {
            Ok((playback, duration)) => {
                let record = normalizer::position(playback.as_ref(), duration);
                self.streams.position.emit(record);
            }
            Err(e) => {
                warn!("Stopping position updates for {}: {}", id, e);
                self.poller.stop();
                self.streams.position.emit(None);
            }
        }
    }

    fn teardown(&mut self) {
        self.poller.stop();
        self.subscriptions.clear();
        if let Some(token) = self.host_token.take() {
            self.host.unsubscribe_sessions_changed(token);
        }
        self.dispatcher.close();
        info!("Media engine stopped");
    }
}

/// Run platform reads on the blocking pool; hosts may shell out or wait on the OS
async fn blocking<T, F>(f: F) -> Result<T, PlatformError>
where
    F: FnOnce() -> Result<T, PlatformError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .unwrap_or_else(|e| Err(PlatformError::Command(format!("platform task failed: {}", e))))
}

fn send_event(events: &mpsc::WeakUnboundedSender<EngineEvent>, event: EngineEvent) {
    // Nothing to do once the engine is gone
    if let Some(tx) = events.upgrade() {
        let _ = tx.send(event);
    }
}

fn session_callback(events: mpsc::WeakUnboundedSender<EngineEvent>, id: SessionId) -> SessionCallback {
    Arc::new(move |change| {
        send_event(
            &events,
            EngineEvent::Session {
                id: id.clone(),
                change,
            },
        );
    })
}

/// Handle held by the embedding application
#[derive(Clone)]
pub struct BridgeHandle {
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl BridgeHandle {
    /// Invoke a method; resolves when the engine answers
    pub async fn call(&self, call: MethodCall) -> Reply {
        self.submit(call)?.await.unwrap_or(Err(BridgeError::EngineStopped))
    }

    /// Queue a call in order with other events; the receiver yields the reply
    pub fn submit(&self, call: MethodCall) -> Result<oneshot::Receiver<Reply>, BridgeError> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineEvent::Call { call, reply: tx })?;
        Ok(rx)
    }

    /// Register `consumer` on its stream, replacing any previous one
    pub fn listen(&self, consumer: StreamConsumer) -> Result<(), BridgeError> {
        self.send(EngineEvent::Listen(consumer))
    }

    pub fn listen_now_playing<F>(&self, consumer: F) -> Result<(), BridgeError>
    where
        F: FnMut(Option<NowPlaying>) + Send + 'static,
    {
        self.listen(StreamConsumer::NowPlaying(Box::new(consumer)))
    }

    pub fn listen_position<F>(&self, consumer: F) -> Result<(), BridgeError>
    where
        F: FnMut(Option<PositionInfo>) + Send + 'static,
    {
        self.listen(StreamConsumer::Position(Box::new(consumer)))
    }

    pub fn listen_queue<F>(&self, consumer: F) -> Result<(), BridgeError>
    where
        F: FnMut(Option<Vec<QueueItemSummary>>) + Send + 'static,
    {
        self.listen(StreamConsumer::Queue(Box::new(consumer)))
    }

    /// Listen with the JSON form of the stream's values
    pub fn listen_json<F>(&self, kind: StreamKind, consumer: F) -> Result<(), BridgeError>
    where
        F: FnMut(Option<Value>) + Send + 'static,
    {
        self.listen(StreamConsumer::json(kind, consumer))
    }

    pub fn cancel(&self, kind: StreamKind) -> Result<(), BridgeError> {
        self.send(EngineEvent::Cancel(kind))
    }

    /// Report that the settings screen returned with `request_code`
    pub fn settings_returned(&self, request_code: i32) -> Result<(), BridgeError> {
        self.send(EngineEvent::SettingsReturned(request_code))
    }

    /// Ask the engine to tear down; pending `openSettings` calls fail with `ENGINE_STOPPED`
    pub fn shutdown(&self) {
        let _ = self.send(EngineEvent::Shutdown);
    }

    pub fn is_running(&self) -> bool {
        !self.events.is_closed()
    }

    fn send(&self, event: EngineEvent) -> Result<(), BridgeError> {
        self.events.send(event).map_err(|_| BridgeError::EngineStopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryHost, InMemorySession};
    use mediabridge_core::{MediaMetadata, PlaybackSnapshot, PlaybackStatus, QueueEntry, QueueItemDescription};
    use std::sync::Mutex;

    type Seen<T> = Arc<Mutex<Vec<Option<T>>>>;

    struct Harness {
        engine: Engine,
        rx: mpsc::UnboundedReceiver<EngineEvent>,
        // Keeps the weak senders alive
        _tx: mpsc::UnboundedSender<EngineEvent>,
        now_playing: Seen<NowPlaying>,
        position: Seen<PositionInfo>,
        queue: Seen<Vec<QueueItemSummary>>,
    }

    impl Harness {
        async fn new(host: Arc<InMemoryHost>) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let mut engine = Engine::new(host, EngineConfig::default(), tx.downgrade());

            let now_playing: Seen<NowPlaying> = Arc::default();
            let position: Seen<PositionInfo> = Arc::default();
            let queue: Seen<Vec<QueueItemSummary>> = Arc::default();
            let sink = now_playing.clone();
            let _ = engine
                .handle(EngineEvent::Listen(StreamConsumer::NowPlaying(Box::new(move |v| {
                    sink.lock().unwrap().push(v)
                }))))
                .await;
            let sink = position.clone();
            let _ = engine
                .handle(EngineEvent::Listen(StreamConsumer::Position(Box::new(move |v| {
                    sink.lock().unwrap().push(v)
                }))))
                .await;
            let sink = queue.clone();
            let _ = engine
                .handle(EngineEvent::Listen(StreamConsumer::Queue(Box::new(move |v| {
                    sink.lock().unwrap().push(v)
                }))))
                .await;

            Self {
                engine,
                rx,
                _tx: tx,
                now_playing,
                position,
                queue,
            }
        }

        /// Handle every event queued by platform callbacks
        async fn pump(&mut self) {
            while let Ok(event) = self.rx.try_recv() {
                let _ = self.engine.handle(event).await;
            }
        }
    }

    fn session(id: &str, status: PlaybackStatus) -> Arc<InMemorySession> {
        let session = InMemorySession::new(id, format!("com.example.{}", id));
        session.load(
            Some(MediaMetadata {
                title: Some("A".to_string()),
                duration_ms: Some(180_000),
                ..Default::default()
            }),
            Some(PlaybackSnapshot::new(status, 0)),
            None,
        );
        session
    }

    #[tokio::test]
    async fn test_start_polls_session_already_playing() {
        let host = Arc::new(InMemoryHost::new());
        host.preload_sessions(vec![session("a", PlaybackStatus::Paused), session("b", PlaybackStatus::Playing)]);
        let mut harness = Harness::new(host.clone()).await;

        harness.engine.start().await;
        assert_eq!(harness.engine.poller.session(), Some(&SessionId::new("b")));
        assert_eq!(harness.engine.subscriptions.len(), 2);
        assert_eq!(host.listener_count(), 1);
    }

    #[tokio::test]
    async fn test_playback_change_order() {
        let host = Arc::new(InMemoryHost::new());
        let a = session("a", PlaybackStatus::Paused);
        host.preload_sessions(vec![a.clone()]);
        let mut harness = Harness::new(host).await;
        harness.engine.start().await;

        a.set_playback_state(Some(PlaybackSnapshot::new(PlaybackStatus::Playing, 1000)));
        harness.pump().await;
        assert!(harness.engine.poller.is_active());
        assert!(harness.position.lock().unwrap().is_empty());

        a.set_playback_state(Some(PlaybackSnapshot::new(PlaybackStatus::Paused, 1500)));
        harness.pump().await;
        assert!(!harness.engine.poller.is_active());

        let now_playing = harness.now_playing.lock().unwrap();
        assert_eq!(now_playing.len(), 2);
        assert_eq!(now_playing[1].as_ref().unwrap().state.as_deref(), Some("STATE_PAUSED"));
        assert!(!now_playing[1].as_ref().unwrap().song_changed);

        let position = harness.position.lock().unwrap();
        assert_eq!(position.len(), 1);
        let last = position[0].as_ref().unwrap();
        assert_eq!(last.state, "STATE_PAUSED");
        assert_eq!(last.position, 1500);
        assert_eq!(last.duration, 180_000);
    }

    #[tokio::test]
    async fn test_queue_change_pushes_both_records() {
        let host = Arc::new(InMemoryHost::new());
        let a = session("a", PlaybackStatus::Paused);
        host.preload_sessions(vec![a.clone()]);
        let mut harness = Harness::new(host).await;
        harness.engine.start().await;

        a.set_queue(Some(vec![QueueEntry {
            queue_id: 1,
            description: QueueItemDescription {
                title: Some("next".to_string()),
                ..Default::default()
            },
        }]));
        a.set_queue(None);
        harness.pump().await;

        let now_playing = harness.now_playing.lock().unwrap();
        assert_eq!(now_playing.len(), 2);
        assert!(now_playing[0].as_ref().unwrap().queue_changed);
        assert_eq!(now_playing[0].as_ref().unwrap().queue_index, Some(-1));

        let queue = harness.queue.lock().unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].as_ref().unwrap()[0].title.as_deref(), Some("next"));
        assert_eq!(queue[1], None);
    }

    #[tokio::test]
    async fn test_reconcile_stops_poller_for_removed_session() {
        let host = Arc::new(InMemoryHost::new());
        let a = session("a", PlaybackStatus::Playing);
        host.preload_sessions(vec![a.clone()]);
        let mut harness = Harness::new(host.clone()).await;
        harness.engine.start().await;
        assert!(harness.engine.poller.is_active());

        host.set_sessions(vec![session("b", PlaybackStatus::Paused)]);
        harness.pump().await;
        assert!(!harness.engine.poller.is_active());
        assert_eq!(a.callback_count(), 0);

        // Event queued by the removed session before reconciliation
        let _ = harness
            .engine
            .handle(EngineEvent::Session {
                id: SessionId::new("a"),
                change: SessionChange::Metadata(None),
            })
            .await;
        assert!(harness.now_playing.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_tick_emits_absent_and_stops() {
        let host = Arc::new(InMemoryHost::new());
        let a = session("a", PlaybackStatus::Playing);
        host.preload_sessions(vec![a.clone()]);
        let mut harness = Harness::new(host).await;
        harness.engine.start().await;

        let id = SessionId::new("a");
        harness.engine.on_poll_tick(&id).await;
        a.mark_stale();
        harness.engine.on_poll_tick(&id).await;

        assert!(!harness.engine.poller.is_active());
        let position = harness.position.lock().unwrap();
        assert_eq!(position.len(), 2);
        assert_eq!(position[0].as_ref().unwrap().state, "STATE_PLAYING");
        assert_eq!(position[0].as_ref().unwrap().duration, 180_000);
        assert_eq!(position[1], None);
    }

    #[tokio::test]
    async fn test_commands_fall_back_to_reconciled_session() {
        let host = Arc::new(InMemoryHost::new());
        let a = session("a", PlaybackStatus::Paused);
        host.preload_sessions(vec![a.clone()]);
        let mut harness = Harness::new(host.clone()).await;
        harness.engine.start().await;

        host.set_listing_error(Some("bus restarting"));
        let (tx, rx) = oneshot::channel();
        let _ = harness
            .engine
            .handle(EngineEvent::Call {
                call: MethodCall::without_arguments("playPause"),
                reply: tx,
            })
            .await;
        assert_eq!(rx.await.unwrap(), Ok(Value::Bool(true)));
        assert_eq!(a.dispatched_keys().len(), 2);
    }

    #[tokio::test]
    async fn test_teardown_releases_everything() {
        let host = Arc::new(InMemoryHost::new());
        let a = session("a", PlaybackStatus::Playing);
        host.preload_sessions(vec![a.clone()]);
        let mut harness = Harness::new(host.clone()).await;
        harness.engine.start().await;

        harness.engine.teardown();
        assert!(!harness.engine.poller.is_active());
        assert_eq!(a.callback_count(), 0);
        assert_eq!(host.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_handle_after_shutdown() {
        let host = Arc::new(InMemoryHost::new());
        let (handle, task) = Engine::spawn(host.clone(), EngineConfig::default());

        assert_eq!(
            handle.call(MethodCall::without_arguments("hasPermission")).await,
            Ok(Value::Bool(false))
        );
        handle.shutdown();
        task.await.unwrap();

        assert!(!handle.is_running());
        assert_eq!(
            handle.call(MethodCall::without_arguments("playPause")).await,
            Err(BridgeError::EngineStopped)
        );
        assert_eq!(host.listener_count(), 0);
    }
}
