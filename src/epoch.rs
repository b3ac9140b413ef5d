//! The epoch / read-lock queue: the mechanism by which segments
//! awaiting recycling wait for every live reader session to advance past
//! them.
//!
//! Each session publishes a monotonically increasing lower bound (the
//! oldest sequence it might still be reading from); a segment pushed to
//! the recycle queue becomes eligible only once every live session's
//! lower bound has passed its tag.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use parking_lot::Mutex;

/// Globally unique, monotonically increasing allocation sequence
/// generator. Also doubles as the epoch clock: every commit and every
/// segment seal draws the next value.
#[derive(Default)]
pub struct SequenceClock {
    next: AtomicU64,
}

impl SequenceClock {
    /// Draw the next sequence number.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::AcqRel)
    }

    /// Current value without advancing.
    pub fn current(&self) -> u64 {
        self.next.load(Ordering::Acquire)
    }
}

/// Tracks every live session's published lower bound and the queue of
/// segments awaiting recycle.
pub struct EpochTracker {
    clock: SequenceClock,
    sessions: DashMap<u64, AtomicU64>,
    recycle_queue: Mutex<VecDeque<(u64, u32)>>,
    next_session_id: AtomicU64,
}

impl Default for EpochTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl EpochTracker {
    /// Build a fresh tracker.
    pub fn new() -> Self {
        Self {
            clock: SequenceClock::default(),
            sessions: DashMap::new(),
            recycle_queue: Mutex::new(VecDeque::new()),
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Shared sequence clock.
    pub fn clock(&self) -> &SequenceClock {
        &self.clock
    }

    /// Register a new session, publishing its initial lower bound as the
    /// current sequence.
    pub fn register_session(&self) -> u64 {
        let id = self.next_session_id.fetch_add(1, Ordering::AcqRel);
        self.sessions
            .insert(id, AtomicU64::new(self.clock.current()));
        id
    }

    /// Publish a session's new lower bound: "the oldest sequence this
    /// session could still be reading from".
    pub fn publish_lower_bound(&self, session_id: u64, lower_bound: u64) {
        if let Some(entry) = self.sessions.get(&session_id) {
            entry.store(lower_bound, Ordering::Release);
        }
    }

    /// Drop a session from tracking (its transactions have all ended).
    pub fn unregister_session(&self, session_id: u64) {
        self.sessions.remove(&session_id);
    }

    /// The minimum lower bound across all live sessions, or the current
    /// sequence if there are no live sessions.
    pub fn oldest_active_lower_bound(&self) -> u64 {
        self.sessions
            .iter()
            .map(|entry| entry.value().load(Ordering::Acquire))
            .min()
            .unwrap_or_else(|| self.clock.current())
    }

    /// Push a just-emptied segment into the recycle queue, tagged with the
    /// sequence at the time it was emptied.
    pub fn push_for_recycle(&self, tag: u64, segment: u32) {
        self.recycle_queue.lock().push_back((tag, segment));
    }

    /// Pop every segment in the recycle queue whose tag is strictly older
    /// than every live session's lower bound.
    pub fn drain_recyclable(&self) -> Vec<u32> {
        let oldest = self.oldest_active_lower_bound();
        let mut queue = self.recycle_queue.lock();
        let mut drained = Vec::new();
        while let Some(&(tag, _)) = queue.front() {
            if tag >= oldest {
                break;
            }
            let (_, segment) = queue.pop_front().unwrap();
            drained.push(segment);
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_recyclable_only_after_all_readers_pass() {
        let tracker = EpochTracker::new();
        let reader = tracker.register_session();
        let tag = tracker.clock().next();
        tracker.push_for_recycle(tag, 7);
        assert!(tracker.drain_recyclable().is_empty());
        tracker.publish_lower_bound(reader, tag + 1);
        assert_eq!(tracker.drain_recyclable(), vec![7]);
    }

    #[test]
    fn no_live_sessions_recycles_immediately() {
        let tracker = EpochTracker::new();
        let tag = tracker.clock().next();
        tracker.push_for_recycle(tag, 3);
        assert_eq!(tracker.drain_recyclable(), vec![3]);
    }
}
