// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interface between the tracing core and the CPU simulator.
//!
//! The simulator owns the guest CPU state; the core only observes it through
//! the [`CpuContext`] callbacks, which are expected to be cheap and free of
//! side effects on the guest.

use serde::Serialize;

pub const TARGET_PAGE_BITS: u32 = 12;
pub const TARGET_PAGE_MASK: u64 = !((1u64 << TARGET_PAGE_BITS) - 1);

/// Guest privilege mode as reported by the simulator on a mode switch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CpuMode {
    #[default]
    User,
    Supervisor,
    Hypervisor,
    Debug,
}

/// Opaque ISA memory-op descriptor attached to a traced memory access.
///
/// The core never interprets the value; it is carried through to the
/// encoder backends verbatim.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MemOp(pub u32);

/// Callbacks the simulator supplies for the CPU owning a logger.
///
/// All methods are queried on the CPU's own execution thread.
pub trait CpuContext {
    /// Whether the guest is currently executing in user mode.
    fn in_user_mode(&self) -> bool;

    /// The most recently executed guest program counter.
    fn recent_pc(&self) -> u64;

    /// Debug-translates an aligned guest virtual page to a physical page,
    /// or `None` if the page is unmapped.
    fn phys_page_debug(&self, vaddr_page: u64) -> Option<u64>;

    /// Produces a general-purpose register dump for trace start events.
    ///
    /// Returning `None` elides the register dump event.
    fn regdump(&self) -> Option<Vec<crate::entry::RegInfo>>;
}

/// Translates `vaddr` for tracing purposes, yielding the physical address or
/// the invalid-address sentinel when the page is unmapped.
pub(crate) fn paddr_for(ctx: &dyn CpuContext, vaddr: u64) -> u64 {
    match ctx.phys_page_debug(vaddr & TARGET_PAGE_MASK) {
        Some(page) => page + (vaddr & !TARGET_PAGE_MASK),
        None => crate::entry::PADDR_INVALID,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::PADDR_INVALID;
    use crate::entry::RegInfo;

    struct OffsetCpu;

    impl CpuContext for OffsetCpu {
        fn in_user_mode(&self) -> bool {
            true
        }

        fn recent_pc(&self) -> u64 {
            0
        }

        fn phys_page_debug(&self, vaddr_page: u64) -> Option<u64> {
            if vaddr_page < 0x8000_0000 {
                Some(vaddr_page + 0x4000_0000)
            } else {
                None
            }
        }

        fn regdump(&self) -> Option<Vec<RegInfo>> {
            None
        }
    }

    #[test]
    fn paddr_keeps_page_offset() {
        assert_eq!(paddr_for(&OffsetCpu, 0x1234), 0x4000_1234);
    }

    #[test]
    fn paddr_unmapped_is_sentinel() {
        assert_eq!(paddr_for(&OffsetCpu, 0x9000_0010), PADDR_INVALID);
    }
}
