//! Downstream consumer slots
//!
//! Each output stream has room for exactly one consumer. Registering replaces
//! the previous consumer and unregistering empties the slot; this mirrors the
//! single embedding-application subscriber the bridge supports per stream.

use mediabridge_core::{NowPlaying, PositionInfo, QueueItemSummary};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Receives every value pushed to a stream; `None` is the explicit absent value
pub type Consumer<T> = Box<dyn FnMut(Option<T>) + Send>;

/// The three output streams
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamKind {
    NowPlaying,
    Position,
    Queue,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::NowPlaying => "nowPlaying",
            StreamKind::Position => "position",
            StreamKind::Queue => "queue",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseStreamKindError(String);

impl fmt::Display for ParseStreamKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown stream: {}", self.0)
    }
}

impl std::error::Error for ParseStreamKindError {}

impl FromStr for StreamKind {
    type Err = ParseStreamKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nowPlaying" => Ok(StreamKind::NowPlaying),
            "position" => Ok(StreamKind::Position),
            "queue" => Ok(StreamKind::Queue),
            other => Err(ParseStreamKindError(other.to_string())),
        }
    }
}

/// A consumer bound to the stream it listens on
pub enum StreamConsumer {
    NowPlaying(Consumer<NowPlaying>),
    Position(Consumer<PositionInfo>),
    Queue(Consumer<Vec<QueueItemSummary>>),
}

impl StreamConsumer {
    pub fn kind(&self) -> StreamKind {
        match self {
            StreamConsumer::NowPlaying(_) => StreamKind::NowPlaying,
            StreamConsumer::Position(_) => StreamKind::Position,
            StreamConsumer::Queue(_) => StreamKind::Queue,
        }
    }

    /// Consumer receiving the wire (JSON) form of any stream
    pub fn json<F>(kind: StreamKind, consumer: F) -> Self
    where
        F: FnMut(Option<Value>) + Send + 'static,
    {
        match kind {
            StreamKind::NowPlaying => StreamConsumer::NowPlaying(to_json(consumer)),
            StreamKind::Position => StreamConsumer::Position(to_json(consumer)),
            StreamKind::Queue => StreamConsumer::Queue(to_json(consumer)),
        }
    }
}

impl fmt::Debug for StreamConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StreamConsumer").field(&self.kind()).finish()
    }
}

fn to_json<T, F>(mut consumer: F) -> Consumer<T>
where
    T: Serialize,
    F: FnMut(Option<Value>) + Send + 'static,
{
    Box::new(move |value: Option<T>| {
        consumer(value.map(|value| serde_json::to_value(value).unwrap_or_default()))
    })
}

/// A capacity-1 slot for one stream
pub struct StreamSlot<T> {
    consumer: Option<Consumer<T>>,
}

impl<T> Default for StreamSlot<T> {
    fn default() -> Self {
        Self { consumer: None }
    }
}

impl<T> StreamSlot<T> {
    /// Install a consumer; returns true if one was replaced
    pub fn register(&mut self, consumer: Consumer<T>) -> bool {
        self.consumer.replace(consumer).is_some()
    }

    pub fn unregister(&mut self) {
        self.consumer = None;
    }

    pub fn is_registered(&self) -> bool {
        self.consumer.is_some()
    }

    /// Push a value; dropped when nobody listens
    pub fn emit(&mut self, value: Option<T>) {
        if let Some(consumer) = self.consumer.as_mut() {
            consumer(value);
        }
    }
}

/// The now-playing, position and queue slots
#[derive(Default)]
pub struct StreamRegistry {
    pub now_playing: StreamSlot<NowPlaying>,
    pub position: StreamSlot<PositionInfo>,
    pub queue: StreamSlot<Vec<QueueItemSummary>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route a consumer to its slot; returns true if it replaced another
    pub fn install(&mut self, consumer: StreamConsumer) -> bool {
        match consumer {
            StreamConsumer::NowPlaying(consumer) => self.now_playing.register(consumer),
            StreamConsumer::Position(consumer) => self.position.register(consumer),
            StreamConsumer::Queue(consumer) => self.queue.register(consumer),
        }
    }

    pub fn clear(&mut self, kind: StreamKind) {
        match kind {
            StreamKind::NowPlaying => self.now_playing.unregister(),
            StreamKind::Position => self.position.unregister(),
            StreamKind::Queue => self.queue.unregister(),
        }
    }

    pub fn is_registered(&self, kind: StreamKind) -> bool {
        match kind {
            StreamKind::NowPlaying => self.now_playing.is_registered(),
            StreamKind::Position => self.position.is_registered(),
            StreamKind::Queue => self.queue.is_registered(),
        }
    }
}
