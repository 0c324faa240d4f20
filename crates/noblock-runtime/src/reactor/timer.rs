//! BinaryHeap-based one-shot timers
//!
//! # Complexity
//!
//! - Insert: O(log n)
//! - Cancel: O(1) (lazy cancellation)
//! - Pop expired: O(log n) per timer
//! - Next deadline: O(1) amortized
//!
//! # Cancellation Strategy
//!
//! The callback map is the source of truth. Cancelling removes the
//! callback; the heap entry stays behind and is skipped when it surfaces.
//! Once dead entries outnumber live ones the heap is rebuilt from the live
//! set, so a long timer cannot pin every cancelled entry behind it.

use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

use super::Callback;

/// Dead heap entries tolerated on top of twice the live count
const COMPACT_SLACK: usize = 64;

/// Handle to a scheduled timer, unique per heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerHandle(pub(crate) u64);

impl TimerHandle {
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

struct HeapEntry {
    deadline: Instant,
    handle: TimerHandle,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.handle == other.handle
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed for a min-heap; equal deadlines fire in creation order
        match other.deadline.cmp(&self.deadline) {
            std::cmp::Ordering::Equal => other.handle.cmp(&self.handle),
            ord => ord,
        }
    }
}

/// Min-heap of one-shot timers owned by the event loop
pub struct TimerHeap {
    heap: BinaryHeap<HeapEntry>,
    callbacks: HashMap<TimerHandle, Callback>,
    next_handle: u64,
    total_inserted: u64,
    total_fired: u64,
    total_cancelled: u64,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity),
            callbacks: HashMap::with_capacity(capacity),
            next_handle: 0,
            total_inserted: 0,
            total_fired: 0,
            total_cancelled: 0,
        }
    }

    pub fn insert(&mut self, deadline: Instant, callback: Callback) -> TimerHandle {
        self.next_handle += 1;
        let handle = TimerHandle(self.next_handle);
        self.heap.push(HeapEntry { deadline, handle });
        self.callbacks.insert(handle, callback);
        self.total_inserted += 1;
        handle
    }

    /// False if the timer already fired or was cancelled
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        let removed = self.callbacks.remove(&handle).is_some();
        if removed {
            self.total_cancelled += 1;
        }
        if self.callbacks.is_empty() {
            self.heap.clear();
        } else if self.heap.len() > 2 * self.callbacks.len() + COMPACT_SLACK {
            let live = &self.callbacks;
            self.heap.retain(|e| live.contains_key(&e.handle));
        }
        removed
    }

    /// First handle that a timer inserted from now on would get.
    ///
    /// Passing it to [`pop_expired`](Self::pop_expired) keeps timers armed
    /// during a firing phase out of that phase.
    pub fn watermark(&self) -> TimerHandle {
        TimerHandle(self.next_handle + 1)
    }

    /// Pop the earliest live timer with `deadline <= now` created before
    /// `watermark`.
    ///
    /// Callers pop one at a time and run the callback before popping the
    /// next, so a callback can still cancel a sibling that expired in the
    /// same pass.
    pub fn pop_expired(&mut self, now: Instant, watermark: TimerHandle) -> Option<(TimerHandle, Callback)> {
        while let Some(top) = self.heap.peek() {
            if top.deadline > now || top.handle >= watermark {
                return None;
            }
            let handle = top.handle;
            self.heap.pop();
            if let Some(callback) = self.callbacks.remove(&handle) {
                self.total_fired += 1;
                return Some((handle, callback));
            }
        }
        None
    }

    /// Deadline of the earliest live timer
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(top) = self.heap.peek() {
            if self.callbacks.contains_key(&top.handle) {
                return Some(top.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Live (armed, uncancelled) timers
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn contains(&self, handle: TimerHandle) -> bool {
        self.callbacks.contains_key(&handle)
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.callbacks.clear();
    }

    pub fn stats(&self) -> TimerStats {
        TimerStats {
            active: self.callbacks.len(),
            heap_entries: self.heap.len(),
            total_inserted: self.total_inserted,
            total_fired: self.total_fired,
            total_cancelled: self.total_cancelled,
        }
    }
}

impl Default for TimerHeap {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics for `TimerHeap`
#[derive(Debug, Clone, Default)]
pub struct TimerStats {
    /// Armed timers
    pub active: usize,
    /// Heap entries including cancelled ones not yet skipped
    pub heap_entries: usize,
    pub total_inserted: u64,
    pub total_fired: u64,
    pub total_cancelled: u64,
}
