use std::collections::{HashMap, HashSet};

/// A change worth broadcasting as SCREEN_SHARE_UPDATE.
#[derive(Debug, PartialEq, Eq)]
pub struct StreamingChange {
    pub user_id: i64,
    pub streaming: bool,
}

/// Tracks who is streaming and which stream each viewer watches. Owned by
/// the hub loop; the renegotiation/keyframe sets drive bridge calls made by
/// the hub after each mutation.
#[derive(Debug, Default)]
pub struct ScreenShareTracker {
    streaming: HashSet<i64>,
    /// viewer -> streamer, at most one subscription per viewer.
    subscriptions: HashMap<i64, i64>,
    renegotiating: HashSet<i64>,
    /// viewer -> streamer owed a keyframe once that viewer's renegotiation
    /// finishes. Keyed by viewer so one viewer completing cannot flush
    /// another viewer's pending request.
    pending_keyframes: HashMap<i64, i64>,
}

impl ScreenShareTracker {
    pub fn is_streaming(&self, user_id: i64) -> bool {
        self.streaming.contains(&user_id)
    }

    pub fn start_share(&mut self, user_id: i64) -> Option<StreamingChange> {
        if !self.streaming.insert(user_id) {
            return None;
        }
        Some(StreamingChange { user_id, streaming: true })
    }

    pub fn stop_share(&mut self, user_id: i64) -> Option<StreamingChange> {
        if !self.streaming.remove(&user_id) {
            return None;
        }
        self.subscriptions.retain(|_, streamer| *streamer != user_id);
        self.pending_keyframes.retain(|_, streamer| *streamer != user_id);
        Some(StreamingChange { user_id, streaming: false })
    }

    /// Subscribe `viewer` to `streamer`'s stream. Returns the viewer's
    /// previous streamer, if any, so the hub can renegotiate both sides.
    /// None-with-no-effect when the target is not streaming.
    pub fn subscribe(&mut self, viewer: i64, streamer: i64) -> Result<Option<i64>, ()> {
        if !self.streaming.contains(&streamer) {
            return Err(());
        }
        let previous = self.subscriptions.insert(viewer, streamer);
        if previous == Some(streamer) {
            return Ok(previous);
        }
        self.pending_keyframes.insert(viewer, streamer);
        self.renegotiating.insert(viewer);
        Ok(previous)
    }

    /// Returns true when the viewer actually had a subscription.
    pub fn unsubscribe(&mut self, viewer: i64) -> bool {
        if self.subscriptions.remove(&viewer).is_none() {
            return false;
        }
        self.pending_keyframes.remove(&viewer);
        self.renegotiating.insert(viewer);
        true
    }

    /// Clears the viewer's outstanding renegotiation, returning the streamer
    /// now owed a keyframe request, if any.
    pub fn on_renegotiation_complete(&mut self, user_id: i64) -> Option<i64> {
        if !self.renegotiating.remove(&user_id) {
            return None;
        }
        self.pending_keyframes.remove(&user_id)
    }

    pub fn needs_renegotiation(&self, user_id: i64) -> bool {
        self.renegotiating.contains(&user_id)
    }

    /// Full cleanup when a user leaves voice or disconnects.
    pub fn on_user_disconnect(&mut self, user_id: i64) -> Option<StreamingChange> {
        self.subscriptions.remove(&user_id);
        self.renegotiating.remove(&user_id);
        self.pending_keyframes.remove(&user_id);
        self.stop_share(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_stop_is_idempotent() {
        let mut tracker = ScreenShareTracker::default();
        assert!(tracker.start_share(1).is_some());
        assert!(tracker.start_share(1).is_none());
        assert!(tracker.stop_share(1).is_some());
        assert!(tracker.stop_share(1).is_none());
    }

    #[test]
    fn subscribe_requires_active_stream() {
        let mut tracker = ScreenShareTracker::default();
        assert!(tracker.subscribe(2, 1).is_err());

        tracker.start_share(1);
        assert_eq!(tracker.subscribe(2, 1), Ok(None));
        assert!(tracker.needs_renegotiation(2));
        assert_eq!(tracker.on_renegotiation_complete(2), Some(1));
    }

    #[test]
    fn resubscribe_switches_streams() {
        let mut tracker = ScreenShareTracker::default();
        tracker.start_share(1);
        tracker.start_share(3);
        tracker.subscribe(2, 1).unwrap();
        assert_eq!(tracker.subscribe(2, 3), Ok(Some(1)));
        // Only the latest target is owed a keyframe.
        assert_eq!(tracker.on_renegotiation_complete(2), Some(3));

        // Duplicate subscribe to the same streamer is a no-op.
        assert_eq!(tracker.subscribe(2, 3), Ok(Some(3)));
        assert_eq!(tracker.on_renegotiation_complete(2), None);
    }

    #[test]
    fn keyframes_are_owed_per_viewer() {
        let mut tracker = ScreenShareTracker::default();
        tracker.start_share(1);
        tracker.subscribe(2, 1).unwrap();
        tracker.subscribe(3, 1).unwrap();

        // One viewer finishing does not flush the other's request.
        assert_eq!(tracker.on_renegotiation_complete(2), Some(1));
        assert!(tracker.needs_renegotiation(3));
        assert_eq!(tracker.on_renegotiation_complete(3), Some(1));
    }

    #[test]
    fn unsubscribe_drops_pending_keyframe() {
        let mut tracker = ScreenShareTracker::default();
        tracker.start_share(1);
        tracker.subscribe(2, 1).unwrap();
        assert!(tracker.unsubscribe(2));
        assert_eq!(tracker.on_renegotiation_complete(2), None);
    }

    #[test]
    fn stop_share_drops_subscribers() {
        let mut tracker = ScreenShareTracker::default();
        tracker.start_share(1);
        tracker.subscribe(2, 1).unwrap();
        tracker.stop_share(1);
        assert!(!tracker.unsubscribe(2));
    }

    #[test]
    fn disconnect_cleans_everything() {
        let mut tracker = ScreenShareTracker::default();
        tracker.start_share(1);
        tracker.subscribe(1, 1).ok();
        let change = tracker.on_user_disconnect(1).unwrap();
        assert!(!change.streaming);
        assert!(!tracker.is_streaming(1));
        assert!(!tracker.needs_renegotiation(1));
    }

    #[test]
    fn renegotiation_complete_clears_flag_once() {
        let mut tracker = ScreenShareTracker::default();
        tracker.start_share(1);
        tracker.subscribe(2, 1).unwrap();
        assert_eq!(tracker.on_renegotiation_complete(2), Some(1));
        assert_eq!(tracker.on_renegotiation_complete(2), None);
    }
}
