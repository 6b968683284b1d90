//! Simulated player for the `demo` backend

use mediabridge_core::{
    MediaMetadata, MediaSession, PlaybackSnapshot, PlaybackStatus, QueueEntry, QueueItemDescription,
};
use mediabridge_media_session::{InMemoryHost, InMemorySession};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const TRACKS: &[(&str, &str, i64)] = &[
    ("Opening", "The Demo Band", 30_000),
    ("Interlude", "The Demo Band", 20_000),
    ("Finale", "The Demo Band", 40_000),
];

const TICK: Duration = Duration::from_millis(250);

fn queue() -> Vec<QueueEntry> {
    TRACKS
        .iter()
        .enumerate()
        .map(|(index, (title, artist, _))| QueueEntry {
            queue_id: index as i64,
            description: QueueItemDescription {
                title: Some(title.to_string()),
                subtitle: Some(artist.to_string()),
                ..Default::default()
            },
        })
        .collect()
}

fn metadata(track: usize) -> MediaMetadata {
    let (title, artist, duration_ms) = TRACKS[track];
    MediaMetadata {
        title: Some(title.to_string()),
        artist: Some(artist.to_string()),
        album: Some("Demo Sessions".to_string()),
        duration_ms: Some(duration_ms),
        ..Default::default()
    }
}

fn playing(track: usize, position_ms: i64) -> PlaybackSnapshot {
    PlaybackSnapshot {
        active_queue_item_id: Some(track as i64),
        ..PlaybackSnapshot::new(PlaybackStatus::Playing, position_ms)
    }
}

/// Host with one session cycling through a short queue.
///
/// Must be called inside a tokio runtime; the player task stops once the
/// host is dropped.
pub fn start(package_name: &str) -> Arc<InMemoryHost> {
    let host = Arc::new(InMemoryHost::new());
    host.set_enabled_listeners(Some(package_name));

    let session = InMemorySession::new("demo", "org.example.demo_player");
    session.load(Some(metadata(0)), Some(playing(0, 0)), Some(queue()));
    host.preload_sessions(vec![session.clone()]);

    let weak_host = Arc::downgrade(&host);
    tokio::spawn(async move {
        let mut track = 0;
        let mut interval = tokio::time::interval(TICK);
        loop {
            interval.tick().await;
            if weak_host.strong_count() == 0 {
                return;
            }
            let Ok(Some(playback)) = session.playback_state() else {
                continue;
            };
            if !playback.status.is_playing() {
                continue;
            }

            let position = playback.position_ms + TICK.as_millis() as i64;
            if position < TRACKS[track].2 {
                session.advance_position(position);
                continue;
            }

            track = (track + 1) % TRACKS.len();
            info!("Demo player moving to {}", TRACKS[track].0);
            session.set_metadata(Some(metadata(track)));
            session.set_playback_state(Some(playing(track, 0)));
        }
    });

    info!("Demo backend ready");
    host
}
