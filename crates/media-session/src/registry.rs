//! Per-session callback registrations
//!
//! The set is rebuilt from scratch on every session-list change: all old
//! callbacks are unregistered before any new one is registered.

use mediabridge_core::{CallbackToken, SessionCallback, SessionHandle, SessionId};
use std::collections::HashMap;
use tracing::{debug, warn};

struct Subscription {
    session: SessionHandle,
    token: CallbackToken,
}

/// Sessions the engine currently listens to
#[derive(Default)]
pub struct SubscriptionSet {
    subscriptions: HashMap<SessionId, Subscription>,
    current: Option<SessionHandle>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unregister every held callback and forget the current session
    pub fn clear(&mut self) {
        for (id, subscription) in self.subscriptions.drain() {
            debug!("Unregistering callback {:?} from {}", subscription.token, id);
            subscription.session.unregister_callback(subscription.token);
        }
        self.current = None;
    }

    /// Replace the tracked sessions with `sessions`.
    ///
    /// `make_callback` builds the change listener for each session. Returns the
    /// ids of sessions whose initial playback state is playing, in list order.
    /// Sessions that fail during registration are logged and skipped.
    pub fn reconcile<F>(&mut self, sessions: &[SessionHandle], mut make_callback: F) -> Vec<SessionId>
    where
        F: FnMut(SessionId) -> SessionCallback,
    {
        self.clear();
        self.current = sessions.first().cloned();

        let mut playing = Vec::new();
        for session in sessions {
            let id = session.id();
            let token = match session.register_callback(make_callback(id.clone())) {
                Ok(token) => token,
                Err(e) => {
                    warn!("Skipping session {}: {}", id, e);
                    continue;
                }
            };

            if let Some(previous) = self.subscriptions.insert(
                id.clone(),
                Subscription {
                    session: session.clone(),
                    token,
                },
            ) {
                // Same session listed twice
                previous.session.unregister_callback(previous.token);
            }

            match session.playback_state() {
                Ok(Some(playback)) if playback.status.is_playing() => playing.push(id),
                Ok(_) => {}
                Err(e) => warn!("Failed to read playback state of {}: {}", id, e),
            }
        }

        debug!(
            "Tracking {} session(s), current: {:?}",
            self.subscriptions.len(),
            self.current.as_ref().map(|session| session.id())
        );
        playing
    }

    pub fn get(&self, id: &SessionId) -> Option<&SessionHandle> {
        self.subscriptions.get(id).map(|subscription| &subscription.session)
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.subscriptions.contains_key(id)
    }

    /// First session of the last reconciled list
    pub fn current(&self) -> Option<&SessionHandle> {
        self.current.as_ref()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemorySession;
    use mediabridge_core::{PlaybackSnapshot, PlaybackStatus};
    use std::sync::Arc;

    fn noop(_: SessionId) -> SessionCallback {
        Arc::new(|_| {})
    }

    fn handles(sessions: &[Arc<InMemorySession>]) -> Vec<SessionHandle> {
        sessions
            .iter()
            .map(|session| Arc::clone(session) as SessionHandle)
            .collect()
    }

    #[test]
    fn test_reconcile_replaces_all_callbacks() {
        let a = InMemorySession::new("a", "com.example.a");
        let b = InMemorySession::new("b", "com.example.b");
        let c = InMemorySession::new("c", "com.example.c");
        let mut set = SubscriptionSet::new();

        set.reconcile(&handles(&[a.clone(), b.clone()]), noop);
        assert_eq!(set.len(), 2);
        assert_eq!(a.callback_count(), 1);
        assert_eq!(set.current().map(|s| s.id()), Some(SessionId::new("a")));

        set.reconcile(&handles(&[b.clone(), c.clone()]), noop);
        assert_eq!(set.len(), 2);
        assert_eq!(a.callback_count(), 0);
        assert_eq!(b.callback_count(), 1);
        assert_eq!(b.registration_count(), 2);
        assert_eq!(c.callback_count(), 1);
        assert!(!set.contains(&SessionId::new("a")));
        assert_eq!(set.current().map(|s| s.id()), Some(SessionId::new("b")));
    }

    #[test]
    fn test_empty_list_clears_everything() {
        let a = InMemorySession::new("a", "com.example.a");
        let mut set = SubscriptionSet::new();
        set.reconcile(&handles(&[a.clone()]), noop);

        let playing = set.reconcile(&[], noop);
        assert!(playing.is_empty());
        assert!(set.is_empty());
        assert!(set.current().is_none());
        assert_eq!(a.callback_count(), 0);
    }

    #[test]
    fn test_reports_playing_sessions_in_order() {
        let a = InMemorySession::new("a", "com.example.a");
        let b = InMemorySession::new("b", "com.example.b");
        let c = InMemorySession::new("c", "com.example.c");
        a.load(None, Some(PlaybackSnapshot::new(PlaybackStatus::Playing, 0)), None);
        b.load(None, Some(PlaybackSnapshot::new(PlaybackStatus::Paused, 0)), None);
        c.load(None, Some(PlaybackSnapshot::new(PlaybackStatus::Playing, 0)), None);

        let mut set = SubscriptionSet::new();
        let playing = set.reconcile(&handles(&[a, b, c]), noop);
        assert_eq!(playing, vec![SessionId::new("a"), SessionId::new("c")]);
    }

    #[test]
    fn test_stale_session_is_skipped() {
        let stale = InMemorySession::new("gone", "com.example.gone");
        stale.mark_stale();
        let live = InMemorySession::new("live", "com.example.live");

        let mut set = SubscriptionSet::new();
        set.reconcile(&handles(&[stale, live.clone()]), noop);

        assert_eq!(set.len(), 1);
        assert!(set.contains(&SessionId::new("live")));
        assert_eq!(live.callback_count(), 1);
        // Still the first listed session; commands against it degrade to no-op
        assert_eq!(set.current().map(|s| s.id()), Some(SessionId::new("gone")));
    }

    #[test]
    fn test_duplicate_entries_keep_one_callback() {
        let a = InMemorySession::new("a", "com.example.a");
        let mut set = SubscriptionSet::new();
        set.reconcile(&handles(&[a.clone(), a.clone()]), noop);

        assert_eq!(set.len(), 1);
        assert_eq!(a.callback_count(), 1);
    }

    #[test]
    fn test_callbacks_are_built_per_session() {
        let a = InMemorySession::new("a", "com.example.a");
        let b = InMemorySession::new("b", "com.example.b");
        let mut built = Vec::new();

        let mut set = SubscriptionSet::new();
        set.reconcile(&handles(&[a, b]), |id| {
            built.push(id);
            noop(SessionId::new(""))
        });
        assert_eq!(built, vec![SessionId::new("a"), SessionId::new("b")]);
    }
}
