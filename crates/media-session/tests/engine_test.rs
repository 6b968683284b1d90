use mediabridge_core::{
    MediaMetadata, NowPlaying, PlaybackSnapshot, PlaybackStatus, PositionInfo, QueueEntry, QueueItemDescription,
};
use mediabridge_media_session::{
    BridgeHandle, Engine, EngineConfig, InMemoryHost, InMemorySession, MethodCall, StreamKind,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};

const PACKAGE: &str = "com.example.media_notification_service";

struct Bridge {
    handle: BridgeHandle,
    task: JoinHandle<()>,
    now_playing: mpsc::UnboundedReceiver<Option<NowPlaying>>,
    position: mpsc::UnboundedReceiver<Option<PositionInfo>>,
}

impl Bridge {
    async fn start(host: Arc<InMemoryHost>) -> Self {
        let (handle, task) = Engine::spawn(host, EngineConfig::default());

        let (tx, now_playing) = mpsc::unbounded_channel();
        handle
            .listen_now_playing(move |value| {
                let _ = tx.send(value);
            })
            .unwrap();
        let (tx, position) = mpsc::unbounded_channel();
        handle
            .listen_position(move |value| {
                let _ = tx.send(value);
            })
            .unwrap();

        let bridge = Self {
            handle,
            task,
            now_playing,
            position,
        };
        bridge.sync().await;
        bridge
    }

    /// Round trip through the engine; every earlier event has been handled on return
    async fn sync(&self) {
        let _ = self.handle.call(MethodCall::without_arguments("hasPermission")).await;
    }

    async fn call(&self, method: &str, arguments: Value) -> Result<Value, String> {
        self.handle
            .call(MethodCall::new(method, arguments))
            .await
            .map_err(|e| e.code().to_string())
    }

    async fn stop(self) {
        self.handle.shutdown();
        self.task.await.unwrap();
    }
}

fn session(id: &str, status: PlaybackStatus) -> Arc<InMemorySession> {
    let session = InMemorySession::new(id, format!("com.example.{}", id));
    session.load(
        Some(MediaMetadata {
            title: Some("A".to_string()),
            duration_ms: Some(60_000),
            ..Default::default()
        }),
        Some(PlaybackSnapshot::new(status, 0)),
        None,
    );
    session
}

fn host_with(sessions: Vec<Arc<InMemorySession>>) -> Arc<InMemoryHost> {
    let host = Arc::new(InMemoryHost::new());
    host.preload_sessions(sessions);
    host
}

/// Drain every value that arrives before `window` elapses
async fn collect<T>(rx: &mut mpsc::UnboundedReceiver<T>, window: Duration) -> Vec<T> {
    let deadline = Instant::now() + window;
    let mut values = Vec::new();
    while let Ok(Some(value)) = timeout_at(deadline, rx.recv()).await {
        values.push(value);
    }
    values
}

#[tokio::test(start_paused = true)]
async fn test_reconcile_keeps_one_callback_per_listed_session() {
    let a = session("a", PlaybackStatus::Paused);
    let b = session("b", PlaybackStatus::Paused);
    let c = session("c", PlaybackStatus::Paused);
    let host = host_with(vec![a.clone(), b.clone()]);
    let bridge = Bridge::start(host.clone()).await;

    assert_eq!((a.callback_count(), b.callback_count(), c.callback_count()), (1, 1, 0));

    host.set_sessions(vec![c.clone(), b.clone()]);
    bridge.sync().await;
    assert_eq!((a.callback_count(), b.callback_count(), c.callback_count()), (0, 1, 1));

    host.set_sessions(Vec::new());
    bridge.sync().await;
    assert_eq!((a.callback_count(), b.callback_count(), c.callback_count()), (0, 0, 0));

    bridge.stop().await;
    assert_eq!(host.listener_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_play_then_pause_scenario() {
    let a = session("a", PlaybackStatus::Paused);
    let host = host_with(vec![a.clone()]);
    let mut bridge = Bridge::start(host).await;

    a.set_playback_state(Some(PlaybackSnapshot::new(PlaybackStatus::Playing, 0)));

    let record = bridge.now_playing.recv().await.unwrap().unwrap();
    assert_eq!(record.title.as_deref(), Some("A"));
    assert!(record.is_playing);
    assert_eq!(record.state.as_deref(), Some("STATE_PLAYING"));

    let started = Instant::now();
    let first = timeout(Duration::from_millis(100), bridge.position.recv())
        .await
        .expect("position within 100 ms")
        .unwrap()
        .unwrap();
    assert!(started.elapsed() <= Duration::from_millis(100));
    assert_eq!(first.state, "STATE_PLAYING");
    assert_eq!(first.duration, 60_000);

    // A few periodic ticks reflect the live position
    a.advance_position(1200);
    let ticks = collect(&mut bridge.position, Duration::from_millis(250)).await;
    assert_eq!(ticks.len(), 2);
    assert!(ticks.iter().all(|tick| tick.as_ref().unwrap().position == 1200));

    a.set_playback_state(Some(PlaybackSnapshot::new(PlaybackStatus::Paused, 1300)));

    let record = bridge.now_playing.recv().await.unwrap().unwrap();
    assert!(!record.is_playing);
    assert_eq!(record.state.as_deref(), Some("STATE_PAUSED"));

    let after_pause = collect(&mut bridge.position, Duration::from_secs(2)).await;
    assert_eq!(after_pause.len(), 1);
    let last = after_pause[0].as_ref().unwrap();
    assert_eq!(last.state, "STATE_PAUSED");
    assert_eq!(last.position, 1300);
    assert_eq!(last.playback_speed, 0.0);

    bridge.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_repeated_play_events_keep_one_poller() {
    let a = session("a", PlaybackStatus::Paused);
    let host = host_with(vec![a.clone()]);
    let mut bridge = Bridge::start(host).await;

    a.set_playback_state(Some(PlaybackSnapshot::new(PlaybackStatus::Playing, 0)));
    a.set_playback_state(Some(PlaybackSnapshot::new(PlaybackStatus::Playing, 0)));
    a.set_playback_state(Some(PlaybackSnapshot::new(PlaybackStatus::Playing, 0)));
    bridge.sync().await;

    // Ticks at 0, 100, 200 and 300 ms from a single timer
    let ticks = collect(&mut bridge.position, Duration::from_millis(350)).await;
    assert_eq!(ticks.len(), 4);

    bridge.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_session_playing_at_attach_is_polled() {
    let a = session("a", PlaybackStatus::Playing);
    let host = host_with(vec![a.clone()]);
    let mut bridge = Bridge::start(host.clone()).await;

    let ticks = collect(&mut bridge.position, Duration::from_millis(150)).await;
    assert_eq!(ticks.len(), 2);

    // Removing the polled session stops the updates
    host.set_sessions(Vec::new());
    bridge.sync().await;
    assert!(collect(&mut bridge.position, Duration::from_secs(1)).await.is_empty());

    bridge.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_state_none_pushes_absent() {
    let a = session("a", PlaybackStatus::Paused);
    let host = host_with(vec![a.clone()]);
    let mut bridge = Bridge::start(host).await;

    a.set_playback_state(Some(PlaybackSnapshot::new(PlaybackStatus::None, 0)));
    assert_eq!(bridge.now_playing.recv().await.unwrap(), None);

    // Metadata alone does not revive a session without media
    a.set_metadata(Some(MediaMetadata {
        title: Some("B".to_string()),
        ..Default::default()
    }));
    assert_eq!(bridge.now_playing.recv().await.unwrap(), None);

    bridge.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_queue_neighbours_in_stream() {
    let a = session("a", PlaybackStatus::Paused);
    let host = host_with(vec![a.clone()]);
    let mut bridge = Bridge::start(host).await;

    let (tx, mut queue_rx) = mpsc::unbounded_channel();
    bridge
        .handle
        .listen_json(StreamKind::Queue, move |value| {
            let _ = tx.send(value);
        })
        .unwrap();

    let entries: Vec<QueueEntry> = ["one", "two", "three"]
        .iter()
        .enumerate()
        .map(|(i, title)| QueueEntry {
            queue_id: 100 + i as i64,
            description: QueueItemDescription {
                title: Some(title.to_string()),
                ..Default::default()
            },
        })
        .collect();
    a.set_playback_state(Some(PlaybackSnapshot {
        active_queue_item_id: Some(101),
        ..PlaybackSnapshot::new(PlaybackStatus::Paused, 0)
    }));
    a.set_queue(Some(entries));

    let _ = bridge.now_playing.recv().await;
    let record = bridge.now_playing.recv().await.unwrap().unwrap();
    assert!(record.queue_changed);
    assert!(!record.song_changed);
    assert_eq!(record.queue_index, Some(1));
    assert_eq!(record.next_item.title.as_deref(), Some("three"));
    assert_eq!(record.previous_item.title.as_deref(), Some("one"));

    let queue = queue_rx.recv().await.unwrap().unwrap();
    assert_eq!(queue, json!([{"title": "one"}, {"title": "two"}, {"title": "three"}]));

    // Unknown active id: both neighbours empty
    a.set_playback_state(Some(PlaybackSnapshot {
        active_queue_item_id: Some(999),
        ..PlaybackSnapshot::new(PlaybackStatus::Paused, 0)
    }));
    let record = bridge.now_playing.recv().await.unwrap().unwrap();
    assert_eq!(record.queue_index, Some(-1));
    assert!(record.next_item.is_empty());
    assert!(record.previous_item.is_empty());

    bridge.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_seek_to() {
    let a = session("a", PlaybackStatus::Playing);
    let host = host_with(vec![a.clone()]);
    let bridge = Bridge::start(host).await;

    assert_eq!(bridge.call("seekTo", Value::Null).await, Err("INVALID_ARGUMENT".to_string()));
    assert_eq!(bridge.call("seekTo", json!({"position": 5000})).await, Ok(json!(true)));
    assert_eq!(a.seeks(), vec![5000]);

    bridge.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_no_active_sessions() {
    let host = host_with(Vec::new());
    let bridge = Bridge::start(host.clone()).await;

    assert_eq!(bridge.call("getCurrentMedia", Value::Null).await, Ok(Value::Null));
    assert_eq!(bridge.call("hasPermission", Value::Null).await, Ok(json!(false)));
    assert_eq!(bridge.call("playPause", Value::Null).await, Ok(json!(false)));

    host.set_enabled_listeners(Some(&format!("{}/.MediaNotificationListener", PACKAGE)));
    assert_eq!(bridge.call("hasPermission", Value::Null).await, Ok(json!(true)));

    bridge.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_commands_follow_host_not_subscriptions() {
    let host = host_with(Vec::new());
    let bridge = Bridge::start(host.clone()).await;

    // Listed without a change notification
    let a = session("a", PlaybackStatus::Paused);
    host.preload_sessions(vec![a.clone()]);

    assert_eq!(bridge.call("playPause", Value::Null).await, Ok(json!(true)));
    assert_eq!(a.dispatched_keys().len(), 2);
    let media = bridge.call("getCurrentMedia", Value::Null).await.unwrap();
    assert_eq!(media["state"], "STATE_PLAYING");

    bridge.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_open_settings_round_trip() {
    let host = host_with(Vec::new());
    let bridge = Bridge::start(host.clone()).await;

    let mut pending = bridge
        .handle
        .submit(MethodCall::without_arguments("openSettings"))
        .unwrap();
    bridge.sync().await;
    assert!(pending.try_recv().is_err());

    // Other request codes are not ours
    bridge.handle.settings_returned(7).unwrap();
    bridge.sync().await;
    assert!(pending.try_recv().is_err());

    bridge.handle.settings_returned(1001).unwrap();
    assert_eq!(pending.await.unwrap(), Ok(Value::Null));
    assert_eq!(host.settings_requests(), vec![1001]);

    bridge.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_unknown_method() {
    let bridge = Bridge::start(host_with(Vec::new())).await;
    assert_eq!(bridge.call("rewind", Value::Null).await, Err("NOT_IMPLEMENTED".to_string()));
    bridge.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_stream_receives_nothing() {
    let a = session("a", PlaybackStatus::Paused);
    let host = host_with(vec![a.clone()]);
    let mut bridge = Bridge::start(host).await;

    bridge.handle.cancel(StreamKind::NowPlaying).unwrap();
    a.set_metadata(None);
    bridge.sync().await;

    assert!(bridge.now_playing.try_recv().is_err());
    bridge.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_dropping_handles_stops_engine() {
    let a = session("a", PlaybackStatus::Playing);
    let host = host_with(vec![a.clone()]);
    let (handle, task) = Engine::spawn(host.clone(), EngineConfig::default());
    let _ = handle.call(MethodCall::without_arguments("hasPermission")).await;
    assert_eq!(a.callback_count(), 1);

    drop(handle);
    task.await.unwrap();
    assert_eq!(a.callback_count(), 0);
    assert_eq!(host.listener_count(), 0);
}
