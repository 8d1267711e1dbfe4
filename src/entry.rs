// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Value types for one traced guest instruction.
//!
//! An [`Entry`] collects everything the simulator reports about a single
//! instruction: register writes, memory accesses, trap information and
//! free-form events. Entries live in a preallocated per-CPU ring and are
//! reused; [`Entry::reset`] clears the record while retaining the backing
//! capacity of its growable containers so the staging path does not allocate
//! once warm.

use crate::cpu::CpuMode;
use crate::cpu::MemOp;

/// Upper bound on the byte length of a single guest instruction.
pub const MAX_INSN_SIZE: usize = 16;

/// Sentinel physical address for untranslated accesses.
pub const PADDR_INVALID: u64 = u64::MAX;

/// The entry carries instruction data (`pc`, `insn_bytes`, `insn_size`).
pub const FLAG_HAS_INSTR_DATA: u32 = 1 << 0;
/// The instruction changed the guest privilege mode; see `next_cpu_mode`.
pub const FLAG_MODE_SWITCH: u32 = 1 << 1;
/// A synchronous trap was taken; see the `intr_*` fields.
pub const FLAG_INTR_TRAP: u32 = 1 << 2;
/// An asynchronous interrupt was delivered; see the `intr_*` fields.
pub const FLAG_INTR_ASYNC: u32 = 1 << 3;
pub const FLAG_INTR_MASK: u32 = FLAG_INTR_TRAP | FLAG_INTR_ASYNC;

/// Register value holds the extended (wide) shape.
pub const REG_EXTENDED: u16 = 1 << 0;
/// The extended register holds a full extended value, not a plain integer.
pub const REG_HOLDS_EXT: u16 = 1 << 1;

pub const MEM_LOAD: u16 = 1 << 0;
pub const MEM_STORE: u16 = 1 << 1;
pub const MEM_EXTENDED: u16 = 1 << 2;

/// An implementation-defined wide register value with a validity tag, for
/// ISAs that extend beyond plain integer registers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExtValue {
    pub value: u128,
    pub tag: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegValue {
    Int(u64),
    Ext(ExtValue),
}

impl RegValue {
    pub fn as_int(&self) -> u64 {
        match self {
            RegValue::Int(v) => *v,
            RegValue::Ext(e) => e.value as u64,
        }
    }
}

/// One register write performed by the traced instruction.
///
/// `name` is a borrowed string valid for the process lifetime; register
/// names come from static target description tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegInfo {
    pub flags: u16,
    pub name: &'static str,
    pub value: RegValue,
}

impl RegInfo {
    pub fn int(name: &'static str, value: u64) -> RegInfo {
        RegInfo {
            flags: 0,
            name,
            value: RegValue::Int(value),
        }
    }

    pub fn ext(name: &'static str, value: ExtValue) -> RegInfo {
        RegInfo {
            flags: REG_EXTENDED | REG_HOLDS_EXT,
            name,
            value: RegValue::Ext(value),
        }
    }

    /// An extended register written with a plain integer value.
    pub fn ext_int(name: &'static str, value: u64) -> RegInfo {
        RegInfo {
            flags: REG_EXTENDED,
            name,
            value: RegValue::Int(value),
        }
    }
}

/// One memory access performed by the traced instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemInfo {
    pub flags: u16,
    pub op: MemOp,
    pub addr: u64,
    pub paddr: u64,
    pub value: RegValue,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TraceState {
    Start,
    Stop,
    Flush,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateEvent {
    pub next_state: TraceState,
    pub pc: u64,
}

/// A free-form annotation attached to an entry.
///
/// `RegDump` owns its register sequence; dropping the event releases it.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    State(StateEvent),
    RegDump(Vec<RegInfo>),
}

/// A complete record of one guest instruction's side effects.
#[derive(Debug)]
pub struct Entry {
    pub pc: u64,
    pub paddr: u64,
    pub insn_bytes: [u8; MAX_INSN_SIZE],
    pub insn_size: u8,
    pub flags: u32,
    pub next_cpu_mode: CpuMode,
    pub intr_code: u32,
    pub intr_vector: u64,
    pub intr_faultaddr: u64,
    pub asid: u16,
    pub regs: Vec<RegInfo>,
    pub mem: Vec<MemInfo>,
    pub events: Vec<Event>,
    pub txt_buffer: String,
}

impl Default for Entry {
    fn default() -> Entry {
        Entry {
            pc: 0,
            paddr: 0,
            insn_bytes: [0; MAX_INSN_SIZE],
            insn_size: 0,
            flags: 0,
            next_cpu_mode: CpuMode::default(),
            intr_code: 0,
            intr_vector: 0,
            intr_faultaddr: 0,
            asid: 0,
            regs: Vec::new(),
            mem: Vec::new(),
            events: Vec::new(),
            txt_buffer: String::new(),
        }
    }
}

impl Entry {
    /// Clears the entry for reuse.
    ///
    /// The fixed-layout prefix is zeroed; the growable containers are
    /// emptied in place so their backing capacity survives for the next
    /// instruction. Owned storage inside events is released.
    pub fn reset(&mut self) {
        self.pc = 0;
        self.paddr = 0;
        self.insn_bytes = [0; MAX_INSN_SIZE];
        self.insn_size = 0;
        self.flags = 0;
        self.next_cpu_mode = CpuMode::default();
        self.intr_code = 0;
        self.intr_vector = 0;
        self.intr_faultaddr = 0;
        self.asid = 0;
        self.regs.clear();
        self.mem.clear();
        self.events.clear();
        self.txt_buffer.clear();
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    /// The instruction bytes staged so far.
    pub fn insn(&self) -> &[u8] {
        &self.insn_bytes[..self.insn_size as usize]
    }

    /// Whether the entry holds no staged data. The writable ring slot is
    /// expected to be clean outside the staging region.
    pub fn is_clean(&self) -> bool {
        self.pc == 0
            && self.flags == 0
            && self.regs.is_empty()
            && self.mem.is_empty()
            && self.events.is_empty()
            && self.txt_buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_data() {
        let mut entry = Entry::default();
        entry.pc = 0x1000;
        entry.flags = FLAG_HAS_INSTR_DATA | FLAG_MODE_SWITCH;
        entry.insn_bytes[0] = 0xaa;
        entry.insn_size = 1;
        entry.regs.push(RegInfo::int("x1", 7));
        entry.mem.push(MemInfo {
            flags: MEM_LOAD,
            op: MemOp(0),
            addr: 0x2000,
            paddr: 0x2000,
            value: RegValue::Int(5),
        });
        entry.events.push(Event::State(StateEvent {
            next_state: TraceState::Start,
            pc: 0x1000,
        }));
        entry.txt_buffer.push_str("note");

        entry.reset();
        assert!(entry.is_clean());
        assert_eq!(entry.insn(), &[] as &[u8]);
    }

    #[test]
    fn reset_retains_capacity() {
        let mut entry = Entry::default();
        for i in 0..32 {
            entry.regs.push(RegInfo::int("x1", i));
            entry.events.push(Event::RegDump(vec![RegInfo::int("x2", i)]));
        }
        entry.txt_buffer.push_str(&"x".repeat(256));
        let regs_cap = entry.regs.capacity();
        let events_cap = entry.events.capacity();
        let txt_cap = entry.txt_buffer.capacity();

        entry.reset();
        assert!(entry.regs.capacity() >= regs_cap);
        assert!(entry.events.capacity() >= events_cap);
        assert!(entry.txt_buffer.capacity() >= txt_cap);
        assert!(entry.regs.is_empty());
        assert!(entry.events.is_empty());
        assert!(entry.txt_buffer.is_empty());
    }

    #[test]
    fn ext_reg_flags() {
        let reg = RegInfo::ext(
            "c1",
            ExtValue {
                value: 1 << 100,
                tag: true,
            },
        );
        assert_eq!(reg.flags, REG_EXTENDED | REG_HOLDS_EXT);
        let reg = RegInfo::ext_int("c2", 0x55);
        assert_eq!(reg.flags, REG_EXTENDED);
        assert_eq!(reg.value.as_int(), 0x55);
    }
}
