//! Builds the now-playing, position and queue records from raw session state

use mediabridge_core::{
    encode_cover, summarize_queue_entry, MediaMetadata, MediaSession, NowPlaying, PlatformError,
    PlaybackSnapshot, PlaybackStatus, PositionInfo, QueueEntry, QueueItemSummary,
};

/// Which notification produced a now-playing record
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChangeHints {
    pub song_changed: bool,
    pub queue_changed: bool,
}

impl ChangeHints {
    pub const NONE: ChangeHints = ChangeHints {
        song_changed: false,
        queue_changed: false,
    };

    pub fn metadata() -> Self {
        Self {
            song_changed: true,
            queue_changed: false,
        }
    }

    pub fn playback_state() -> Self {
        Self::NONE
    }

    pub fn queue() -> Self {
        Self {
            song_changed: false,
            queue_changed: true,
        }
    }
}

/// Everything the normalizer reads from one session
#[derive(Clone, Debug, Default)]
pub struct SessionView {
    pub package_name: String,
    pub metadata: Option<MediaMetadata>,
    pub playback: Option<PlaybackSnapshot>,
    pub queue: Option<Vec<QueueEntry>>,
}

impl SessionView {
    /// Read the live state of a session
    pub fn capture(session: &dyn MediaSession) -> Result<Self, PlatformError> {
        Ok(Self {
            package_name: session.package_name()?,
            metadata: session.metadata()?,
            playback: session.playback_state()?,
            queue: session.queue()?,
        })
    }
}

/// Now-playing record, or `None` when the session has no media loaded
pub fn now_playing(view: &SessionView, hints: ChangeHints) -> Option<NowPlaying> {
    let status = view.playback.as_ref().map(|playback| playback.status);
    if status == Some(PlaybackStatus::None) {
        return None;
    }

    let metadata = view.metadata.as_ref();
    let active_id = view.playback.as_ref().and_then(|playback| playback.active_queue_item_id);

    let (queue_index, next_item, previous_item) = match view.queue.as_deref() {
        Some(queue) => {
            let index = queue_index(queue, active_id);
            if index < 0 {
                // no active item: neither neighbour is meaningful
                (Some(index), QueueItemSummary::default(), QueueItemSummary::default())
            } else {
                (Some(index), summary_at(queue, index + 1), summary_at(queue, index - 1))
            }
        }
        None => (None, QueueItemSummary::default(), QueueItemSummary::default()),
    };

    Some(NowPlaying {
        title: metadata.and_then(|m| m.title.clone()),
        artist: metadata.and_then(|m| m.artist.clone()),
        album: metadata.and_then(|m| m.album.clone()),
        package_name: view.package_name.clone(),
        album_art: encode_cover(metadata.and_then(MediaMetadata::cover)),
        is_playing: status.is_some_and(|status| status.is_playing()),
        state: status.map(|status| status.label().into_owned()),
        song_changed: hints.song_changed,
        queue_changed: hints.queue_changed,
        queue_index,
        next_item,
        previous_item,
    })
}

/// Position of the entry whose id matches the active queue item, or -1
pub fn queue_index(queue: &[QueueEntry], active_queue_item_id: Option<i64>) -> i64 {
    active_queue_item_id
        .and_then(|active| queue.iter().position(|entry| entry.queue_id == active))
        .map_or(-1, |index| index as i64)
}

fn summary_at(queue: &[QueueEntry], index: i64) -> QueueItemSummary {
    usize::try_from(index)
        .ok()
        .and_then(|index| queue.get(index))
        .map(summarize_queue_entry)
        .unwrap_or_default()
}

/// Position record, or `None` when the session reports no playback state
pub fn position(playback: Option<&PlaybackSnapshot>, duration_ms: Option<i64>) -> Option<PositionInfo> {
    let playback = playback?;
    Some(PositionInfo {
        position: playback.position_ms,
        duration: duration_ms.unwrap_or(0),
        playback_speed: playback.playback_speed,
        state: playback.status.label().into_owned(),
    })
}

/// Queue record, or `None` when the platform reports no queue
pub fn queue(queue: Option<&[QueueEntry]>) -> Option<Vec<QueueItemSummary>> {
    queue.map(|entries| entries.iter().map(summarize_queue_entry).collect())
}
