//! Expiry index: a deadline-ordered heap with stable handles.
//!
//! Every tracked item gets an [`ExpiryHandle`] that stays valid until the item
//! is removed. An item is either *scheduled* (it sits in the heap with a
//! deadline) or *not indexed* (tracked, but never returned by [`ExpiryHeap::peek`]).
//! Rescheduling, pinning and removal by handle are all O(log n).

use std::collections::HashMap;
use tokio::time::Instant;

/// Stable reference to an item in an [`ExpiryHeap`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExpiryHandle(u64);

/// Where an item currently sits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// Slot in the heap; zero is the earliest deadline
    Indexed(usize),
    /// Excluded from expiry
    NotIndexed,
}

/// The earliest scheduled item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expiring<'a, K> {
    pub handle: ExpiryHandle,
    pub key: &'a K,
    pub deadline: Instant,
}

struct Slot<K> {
    key: K,
    deadline: Instant,
    pos: Option<usize>,
}

/// Min-heap of deadlines addressable by handle
pub struct ExpiryHeap<K> {
    heap: Vec<ExpiryHandle>,
    slots: HashMap<ExpiryHandle, Slot<K>>,
    next_handle: u64,
}

impl<K> Default for ExpiryHeap<K> {
    fn default() -> Self {
        Self {
            heap: Vec::new(),
            slots: HashMap::new(),
            next_handle: 0,
        }
    }
}

impl<K> ExpiryHeap<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `key` with a deadline
    pub fn insert(&mut self, key: K, deadline: Instant) -> ExpiryHandle {
        let handle = self.insert_not_indexed(key, deadline);
        self.push(handle);
        handle
    }

    /// Track `key` without scheduling it
    pub fn insert_not_indexed(&mut self, key: K, deadline: Instant) -> ExpiryHandle {
        let handle = ExpiryHandle(self.next_handle);
        self.next_handle += 1;
        self.slots.insert(
            handle,
            Slot {
                key,
                deadline,
                pos: None,
            },
        );
        handle
    }

    /// Set a new deadline, scheduling the item if it was not indexed.
    ///
    /// Returns false for an unknown handle.
    pub fn update(&mut self, handle: ExpiryHandle, deadline: Instant) -> bool {
        let Some(slot) = self.slots.get_mut(&handle) else {
            return false;
        };
        slot.deadline = deadline;
        match slot.pos {
            Some(pos) => self.fix(pos),
            None => self.push(handle),
        }
        true
    }

    /// Exclude the item from expiry while keeping its handle valid.
    ///
    /// Returns false for an unknown handle.
    pub fn pin(&mut self, handle: ExpiryHandle) -> bool {
        match self.slots.get(&handle).map(|slot| slot.pos) {
            Some(Some(pos)) => {
                self.remove_at(pos);
                true
            }
            Some(None) => true,
            None => false,
        }
    }

    /// Stop tracking the item, returning its key
    pub fn remove(&mut self, handle: ExpiryHandle) -> Option<K> {
        if let Some(pos) = self.slots.get(&handle)?.pos {
            self.remove_at(pos);
        }
        self.slots.remove(&handle).map(|slot| slot.key)
    }

    /// The scheduled item with the earliest deadline
    pub fn peek(&self) -> Option<Expiring<'_, K>> {
        let handle = *self.heap.first()?;
        let slot = self.slots.get(&handle)?;
        Some(Expiring {
            handle,
            key: &slot.key,
            deadline: slot.deadline,
        })
    }

    pub fn position(&self, handle: ExpiryHandle) -> Option<Position> {
        self.slots.get(&handle).map(|slot| match slot.pos {
            Some(pos) => Position::Indexed(pos),
            None => Position::NotIndexed,
        })
    }

    /// Deadline of a scheduled item; `None` when not indexed or unknown
    pub fn deadline(&self, handle: ExpiryHandle) -> Option<Instant> {
        self.slots
            .get(&handle)
            .filter(|slot| slot.pos.is_some())
            .map(|slot| slot.deadline)
    }

    /// Number of tracked items, scheduled or not
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of scheduled items
    pub fn scheduled(&self) -> usize {
        self.heap.len()
    }

    fn deadline_at(&self, pos: usize) -> Instant {
        self.slots[&self.heap[pos]].deadline
    }

    fn set_pos(&mut self, pos: usize) {
        let handle = self.heap[pos];
        if let Some(slot) = self.slots.get_mut(&handle) {
            slot.pos = Some(pos);
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.set_pos(a);
        self.set_pos(b);
    }

    fn push(&mut self, handle: ExpiryHandle) {
        self.heap.push(handle);
        let pos = self.heap.len() - 1;
        self.set_pos(pos);
        self.sift_up(pos);
    }

    fn remove_at(&mut self, pos: usize) {
        let last = self.heap.len() - 1;
        if pos != last {
            self.swap(pos, last);
        }
        if let Some(handle) = self.heap.pop() {
            if let Some(slot) = self.slots.get_mut(&handle) {
                slot.pos = None;
            }
        }
        if pos < self.heap.len() {
            self.fix(pos);
        }
    }

    fn fix(&mut self, pos: usize) {
        if !self.sift_up(pos) {
            self.sift_down(pos);
        }
    }

    fn sift_up(&mut self, mut pos: usize) -> bool {
        let start = pos;
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.deadline_at(pos) >= self.deadline_at(parent) {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
        pos != start
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * pos + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child = if right < len && self.deadline_at(right) < self.deadline_at(left) {
                right
            } else {
                left
            };
            if self.deadline_at(pos) <= self.deadline_at(child) {
                break;
            }
            self.swap(pos, child);
            pos = child;
        }
    }
}
