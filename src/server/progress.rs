//! Per-table worker clock vector and the clock-indexed deferral buffer.

use std::collections::{BTreeMap, HashMap};

use crate::mailbox::{Message, ThreadId};

/// Logical clock (superstep count) of a worker.
pub type Clock = u64;

/// Tracks the clock of every registered worker thread and the global
/// minimum among them.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    progresses: HashMap<ThreadId, Clock>,
    min_clock: Clock,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the tracker from the given set of threads, all at clock 0.
    pub fn init(&mut self, tids: &[ThreadId]) {
        self.progresses.clear();
        self.progresses.extend(tids.iter().map(|&tid| (tid, 0)));
        self.min_clock = 0;
    }

    /// Advances the clock of `tid` by one. Returns the new min clock if
    /// `tid` was the only thread sitting at the old minimum, otherwise
    /// `None`. Unknown threads are left untouched and yield `None`.
    pub fn advance_and_get_changed_min_clock(
        &mut self,
        tid: ThreadId,
    ) -> Option<Clock> {
        let was_unique_min = self.is_unique_min(tid);
        let progress = self.progresses.get_mut(&tid)?;
        *progress += 1;
        if was_unique_min {
            self.min_clock += 1;
            Some(self.min_clock)
        } else {
            None
        }
    }

    /// True iff `tid` is at the min clock and no other thread is.
    pub fn is_unique_min(&self, tid: ThreadId) -> bool {
        match self.progresses.get(&tid) {
            Some(&p) if p == self.min_clock => {
                self.progresses
                    .values()
                    .filter(|&&p| p == self.min_clock)
                    .count()
                    == 1
            }
            _ => false,
        }
    }

    pub fn progress(&self, tid: ThreadId) -> Option<Clock> {
        self.progresses.get(&tid).copied()
    }

    pub fn min_clock(&self) -> Clock {
        self.min_clock
    }

    pub fn num_threads(&self) -> usize {
        self.progresses.len()
    }

    pub fn contains(&self, tid: ThreadId) -> bool {
        self.progresses.contains_key(&tid)
    }
}

/// Messages deferred until the min clock reaches a given value.
#[derive(Debug, Default)]
pub struct PendingBuffer {
    buffer: BTreeMap<Clock, Vec<Message>>,
}

impl PendingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defers `msg` until min clock reaches `clock`.
    pub fn push(&mut self, clock: Clock, msg: Message) {
        self.buffer.entry(clock).or_default().push(msg);
    }

    /// Takes every message deferred under `clock`, in arrival order.
    pub fn pop(&mut self, clock: Clock) -> Vec<Message> {
        self.buffer.remove(&clock).unwrap_or_default()
    }

    /// Number of messages deferred under `clock`.
    pub fn size(&self, clock: Clock) -> usize {
        self.buffer.get(&clock).map_or(0, |msgs| msgs.len())
    }

    /// Total number of deferred messages.
    pub fn total(&self) -> usize {
        self.buffer.values().map(|msgs| msgs.len()).sum()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
