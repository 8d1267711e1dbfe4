// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Fixed-capacity reusable entry storage for one CPU.
//!
//! The slot at `head` is always the writable current entry; committed
//! entries accumulate between `tail` and `head` in buffered mode. One spare
//! slot beyond the configured capacity keeps the staging slot available even
//! when the ring holds `capacity` undrained entries.

use crate::entry::Entry;

/// Minimum per-CPU ring capacity, in entries.
pub const MIN_BUFFER_SIZE: usize = 1 << 16;

pub(crate) struct EntryRing {
    slots: Vec<Entry>,
    head: usize,
    tail: usize,
}

impl EntryRing {
    pub fn new(capacity: usize) -> EntryRing {
        assert!(capacity > 0, "entry ring capacity must be non-zero");
        let mut slots = Vec::new();
        slots.resize_with(capacity + 1, Entry::default);
        EntryRing {
            slots,
            head: 0,
            tail: 0,
        }
    }

    /// Number of committed entries the ring can retain.
    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    pub fn head(&self) -> usize {
        self.head
    }

    pub fn tail(&self) -> usize {
        self.tail
    }

    pub fn current_ref(&self) -> &Entry {
        &self.slots[self.head]
    }

    pub fn current_mut(&mut self) -> &mut Entry {
        &mut self.slots[self.head]
    }

    pub fn entry(&self, index: usize) -> &Entry {
        &self.slots[index]
    }

    pub fn next_index(&self, index: usize) -> usize {
        (index + 1) % self.slots.len()
    }

    /// Advances the write cursor to a fresh slot. If the ring is full the
    /// oldest undrained entry is overwritten and `true` is returned.
    pub fn advance_head(&mut self) -> bool {
        self.head = self.next_index(self.head);
        if self.head == self.tail {
            self.tail = self.next_index(self.tail);
            return true;
        }
        false
    }

    pub fn set_tail_to_head(&mut self) {
        self.tail = self.head;
    }

    /// Destructively resizes the ring: every slot is reinitialized and both
    /// cursors return to zero. Must only run under the simulator's exclusive
    /// execution barrier.
    pub fn resize(&mut self, capacity: usize) {
        assert!(capacity > 0, "entry ring capacity must be non-zero");
        self.slots.truncate(capacity + 1);
        self.slots.resize_with(capacity + 1, Entry::default);
        for slot in &mut self.slots {
            slot.reset();
        }
        self.head = 0;
        self.tail = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_slot_is_writable_and_clean() {
        let mut ring = EntryRing::new(4);
        assert!(ring.current_ref().is_clean());
        ring.current_mut().pc = 0x1000;
        assert!(!ring.advance_head());
        assert!(ring.current_ref().is_clean());
    }

    #[test]
    fn overwrite_after_capacity_commits() {
        let mut ring = EntryRing::new(4);
        for i in 0..4 {
            ring.current_mut().pc = 0x1000 + i;
            assert!(!ring.advance_head());
        }
        assert_eq!(ring.tail(), 0);
        // One past capacity: the oldest entry is dropped, tail moves by one.
        ring.current_mut().pc = 0x1004;
        assert!(ring.advance_head());
        assert_eq!(ring.tail(), 1);
    }

    #[test]
    fn drain_order_is_oldest_first() {
        let mut ring = EntryRing::new(4);
        for i in 0..6u64 {
            ring.current_mut().pc = 0x1000 + i;
            ring.advance_head();
            ring.current_mut().reset();
        }
        let mut pcs = Vec::new();
        let mut curr = ring.tail();
        while curr != ring.head() {
            pcs.push(ring.entry(curr).pc);
            curr = ring.next_index(curr);
        }
        assert_eq!(pcs, vec![0x1002, 0x1003, 0x1004, 0x1005]);
    }

    #[test]
    fn resize_reinitializes_slots() {
        let mut ring = EntryRing::new(4);
        ring.current_mut().pc = 0xdead;
        ring.advance_head();
        ring.resize(8);
        assert_eq!(ring.head(), 0);
        assert_eq!(ring.tail(), 0);
        assert_eq!(ring.capacity(), 8);
        for i in 0..9 {
            assert!(ring.entry(i).is_clean());
        }
    }
}
