// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Commit-time entry filters.
//!
//! Filters are predicates over a complete entry, applied in registration
//! order with AND semantics; a rejected entry is dropped silently. The set
//! is closed and indexed, mirroring the fixed filter table consulted by the
//! commit engine.

use crate::entry::Entry;

/// Identifies one of the built-in trace filters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceFilter {
    /// Retains entries whose `pc` or memory access addresses fall in at
    /// least one configured address range.
    MemRange = 0,
    /// Retains only entries that carry at least one event.
    Events = 1,
}

/// An inclusive guest address range, as used by debug filtering.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressRange {
    pub start: u64,
    pub last: u64,
}

impl AddressRange {
    pub fn new(start: u64, last: u64) -> AddressRange {
        assert!(start <= last, "invalid address range");
        AddressRange { start, last }
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr <= self.last
    }
}

type FilterFn = fn(&[AddressRange], &Entry) -> bool;

// Indexed by TraceFilter discriminants.
static TRACE_FILTERS: [FilterFn; 2] = [mem_range_filter, event_filter];

impl TraceFilter {
    pub(crate) fn run(self, ranges: &[AddressRange], entry: &Entry) -> bool {
        TRACE_FILTERS[self as usize](ranges, entry)
    }
}

fn mem_range_filter(ranges: &[AddressRange], entry: &Entry) -> bool {
    if ranges.is_empty() {
        return true;
    }
    ranges.iter().any(|range| {
        range.contains(entry.pc) || entry.mem.iter().any(|minfo| range.contains(minfo.addr))
    })
}

fn event_filter(_ranges: &[AddressRange], entry: &Entry) -> bool {
    !entry.events.is_empty()
}
