use crate::seq::Seq;

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Entry {
    bytes: Arc<[u8]>,
    resend_count: u32,
    // Identity of the deadline currently armed for this entry; older heap entries are stale.
    resend_at: Instant,
}

struct Deadline {
    resend_at: Instant,
    seq: Seq,
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Deadline {
    fn eq(&self, other: &Self) -> bool {
        self.resend_at == other.resend_at
    }
}

impl Eq for Deadline {}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> Ordering {
        self.resend_at.cmp(&other.resend_at).reverse()
    }
}

pub(super) enum TimerEvent {
    /// The entry's timer fired within budget; the original bytes go out again.
    Resend { seq: Seq, bytes: Arc<[u8]> },
    /// The entry reached the resend cap and was dropped, freeing its window slot.
    Expired { seq: Seq, resend_count: u32 },
}

/// The sender's view of the reliable lane: one entry per unacknowledged packet, plus a
/// deadline heap standing in for the per-entry retransmit timers.
pub(super) struct SendWindow {
    entries: HashMap<Seq, Entry>,
    deadlines: BinaryHeap<Deadline>,
    limit: usize,
    period: Duration,
    max_resends: u32,
}

impl SendWindow {
    pub fn new(limit: u16, period: Duration, max_resends: u32) -> Self {
        Self {
            entries: HashMap::new(),
            deadlines: BinaryHeap::new(),
            limit: limit as usize,
            period,
            max_resends,
        }
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.limit
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Tracks a freshly transmitted packet and arms its first retransmit deadline.
    pub fn register(&mut self, seq: Seq, bytes: Arc<[u8]>, now: Instant) {
        let resend_at = now + self.period;

        self.entries.insert(seq, Entry { bytes, resend_count: 0, resend_at });
        self.deadlines.push(Deadline { resend_at, seq });
    }

    /// Removes the entry named by an acknowledgement. Its pending deadline becomes stale
    /// and is discarded when it surfaces. Returns `false` for unknown sequence numbers.
    pub fn acknowledge(&mut self, seq: Seq) -> bool {
        self.entries.remove(&seq).is_some()
    }

    /// The instant the soonest armed timer fires, if any. May name a cancelled timer, in
    /// which case the caller wakes early and finds nothing due.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.peek().map(|deadline| deadline.resend_at)
    }

    /// Services every timer that has fired by `now`, re-arming entries still within
    /// budget and dropping the ones that have exhausted it.
    pub fn pop_due(&mut self, now: Instant) -> Vec<TimerEvent> {
        let mut events = Vec::new();

        loop {
            match self.deadlines.peek() {
                Some(head) if head.resend_at <= now => {}
                _ => break,
            }

            let Some(deadline) = self.deadlines.pop() else {
                break;
            };

            let Some(entry) = self.entries.get_mut(&deadline.seq) else {
                continue;
            };
            if entry.resend_at != deadline.resend_at {
                continue;
            }

            if entry.resend_count >= self.max_resends {
                let resend_count = entry.resend_count;
                self.entries.remove(&deadline.seq);
                events.push(TimerEvent::Expired { seq: deadline.seq, resend_count });
            } else {
                entry.resend_count += 1;
                entry.resend_at = now + self.period;
                self.deadlines.push(Deadline { resend_at: entry.resend_at, seq: deadline.seq });
                events.push(TimerEvent::Resend { seq: deadline.seq, bytes: entry.bytes.clone() });
            }
        }

        events
    }

    /// Discards every entry and pending deadline.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.deadlines.clear();
    }
}
