// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Framed binary encoder.
//!
//! The stream starts with one [`FileHeader`] per CPU, followed by one frame
//! per entry: an [`EntryFrame`] with fixed metadata and record counts, then
//! the register, memory and event records in order.
//! All frames are plain `#[repr(C)]` structs with no implicit padding so
//! they can be written byte-for-byte.

use zerocopy::Immutable;
use zerocopy::IntoBytes;

use crate::backend::TraceBackend;
use crate::backend::TraceSink;
use crate::entry::Entry;
use crate::entry::Event;
use crate::entry::RegInfo;
use crate::entry::RegValue;
use crate::entry::TraceState;
use crate::entry::MAX_INSN_SIZE;

const HEADER_MAGIC: [u8; 8] = *b"instrlog";
const FORMAT_VERSION: u16 = 1;

const EVENT_KIND_STATE: u8 = 0;
const EVENT_KIND_REGDUMP: u8 = 1;

#[repr(C)]
#[derive(Clone, Copy, IntoBytes, Immutable)]
struct FileHeader {
    magic: [u8; 8],
    version: u16,
    cpu_index: u16,
    _reserved: u32,
}

#[repr(C)]
#[derive(Clone, Copy, IntoBytes, Immutable)]
struct EntryFrame {
    pc: u64,
    paddr: u64,
    intr_vector: u64,
    intr_faultaddr: u64,
    flags: u32,
    intr_code: u32,
    asid: u16,
    insn_size: u8,
    next_cpu_mode: u8,
    reg_count: u16,
    mem_count: u16,
    event_count: u16,
    txt_len: u16,
    _pad: [u8; 4],
    insn_bytes: [u8; MAX_INSN_SIZE],
}

#[repr(C)]
#[derive(Clone, Copy, IntoBytes, Immutable)]
struct RegRecord {
    value_hi: u64,
    value_lo: u64,
    flags: u16,
    tag: u8,
    name_len: u8,
    _pad: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy, IntoBytes, Immutable)]
struct MemRecord {
    addr: u64,
    paddr: u64,
    value_hi: u64,
    value_lo: u64,
    op: u32,
    flags: u16,
    tag: u8,
    _pad: u8,
}

#[repr(C)]
#[derive(Clone, Copy, IntoBytes, Immutable)]
struct EventRecord {
    pc: u64,
    kind: u8,
    state: u8,
    reg_count: u16,
    _pad: [u8; 4],
}

fn split_value(value: &RegValue) -> (u64, u64, u8) {
    match value {
        RegValue::Int(v) => (0, *v, 0),
        RegValue::Ext(e) => ((e.value >> 64) as u64, e.value as u64, e.tag as u8),
    }
}

fn push_reg(out: &mut Vec<u8>, reg: &RegInfo) {
    let (value_hi, value_lo, tag) = split_value(&reg.value);
    let name = reg.name.as_bytes();
    let name_len = name.len().min(u8::MAX as usize);
    let record = RegRecord {
        value_hi,
        value_lo,
        flags: reg.flags,
        tag,
        name_len: name_len as u8,
        _pad: [0; 4],
    };
    out.extend_from_slice(record.as_bytes());
    out.extend_from_slice(&name[..name_len]);
}

pub struct BinaryBackend {
    sink: TraceSink,
    scratch: Vec<u8>,
}

impl BinaryBackend {
    pub fn new(sink: TraceSink) -> BinaryBackend {
        BinaryBackend {
            sink,
            scratch: Vec::new(),
        }
    }
}

impl TraceBackend for BinaryBackend {
    fn init(&mut self, cpu_index: usize) {
        let header = FileHeader {
            magic: HEADER_MAGIC,
            version: FORMAT_VERSION,
            cpu_index: cpu_index as u16,
            _reserved: 0,
        };
        self.sink.write_record(header.as_bytes());
    }

    fn emit_instr(&mut self, _cpu_index: usize, entry: &Entry) {
        let out = &mut self.scratch;
        out.clear();

        let txt = entry.txt_buffer.as_bytes();
        let txt_len = txt.len().min(u16::MAX as usize);
        let frame = EntryFrame {
            pc: entry.pc,
            paddr: entry.paddr,
            intr_vector: entry.intr_vector,
            intr_faultaddr: entry.intr_faultaddr,
            flags: entry.flags,
            intr_code: entry.intr_code,
            asid: entry.asid,
            insn_size: entry.insn_size,
            next_cpu_mode: entry.next_cpu_mode as u8,
            reg_count: entry.regs.len().min(u16::MAX as usize) as u16,
            mem_count: entry.mem.len().min(u16::MAX as usize) as u16,
            event_count: entry.events.len().min(u16::MAX as usize) as u16,
            txt_len: txt_len as u16,
            _pad: [0; 4],
            insn_bytes: entry.insn_bytes,
        };
        out.extend_from_slice(frame.as_bytes());

        for reg in entry.regs.iter().take(u16::MAX as usize) {
            push_reg(out, reg);
        }

        for minfo in entry.mem.iter().take(u16::MAX as usize) {
            let (value_hi, value_lo, tag) = split_value(&minfo.value);
            let record = MemRecord {
                addr: minfo.addr,
                paddr: minfo.paddr,
                value_hi,
                value_lo,
                op: minfo.op.0,
                flags: minfo.flags,
                tag,
                _pad: 0,
            };
            out.extend_from_slice(record.as_bytes());
        }

        for event in entry.events.iter().take(u16::MAX as usize) {
            match event {
                Event::State(ev) => {
                    let record = EventRecord {
                        pc: ev.pc,
                        kind: EVENT_KIND_STATE,
                        state: match ev.next_state {
                            TraceState::Start => 0,
                            TraceState::Stop => 1,
                            TraceState::Flush => 2,
                        },
                        reg_count: 0,
                        _pad: [0; 4],
                    };
                    out.extend_from_slice(record.as_bytes());
                }
                Event::RegDump(gpr) => {
                    let reg_count = gpr.len().min(u16::MAX as usize);
                    let record = EventRecord {
                        pc: 0,
                        kind: EVENT_KIND_REGDUMP,
                        state: 0,
                        reg_count: reg_count as u16,
                        _pad: [0; 4],
                    };
                    out.extend_from_slice(record.as_bytes());
                    for reg in &gpr[..reg_count] {
                        push_reg(out, reg);
                    }
                }
            }
        }

        out.extend_from_slice(&txt[..txt_len]);

        self.sink.write_record(out);
    }

    fn sync(&mut self) {
        self.sink.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn frame_layouts_are_stable() {
        assert_eq!(size_of::<FileHeader>(), 16);
        assert_eq!(size_of::<EntryFrame>(), 56 + MAX_INSN_SIZE);
        assert_eq!(size_of::<RegRecord>(), 24);
        assert_eq!(size_of::<MemRecord>(), 40);
        assert_eq!(size_of::<EventRecord>(), 16);
    }

    #[test]
    fn header_written_at_init() {
        let sink = TraceSink::memory();
        let mut backend = BinaryBackend::new(sink.clone());
        backend.init(3);
        let data = sink.contents().unwrap();
        assert_eq!(&data[..8], b"instrlog");
        assert_eq!(u16::from_ne_bytes([data[8], data[9]]), FORMAT_VERSION);
        assert_eq!(u16::from_ne_bytes([data[10], data[11]]), 3);
    }

    #[test]
    fn entry_frame_roundtrip_counts() {
        let sink = TraceSink::memory();
        let mut backend = BinaryBackend::new(sink.clone());
        let mut entry = Entry::default();
        entry.pc = 0x1000;
        entry.regs.push(RegInfo::int("x1", 1));
        entry.regs.push(RegInfo::int("x2", 2));
        backend.emit_instr(0, &entry);

        let data = sink.contents().unwrap();
        let frame_size = size_of::<EntryFrame>();
        // reg_count sits right after the fixed u64/u32/u16/u8 prefix.
        let reg_count_offset = 8 * 4 + 4 + 4 + 2 + 1 + 1;
        assert_eq!(
            u16::from_ne_bytes([data[reg_count_offset], data[reg_count_offset + 1]]),
            2
        );
        let expected = frame_size + 2 * (size_of::<RegRecord>() + 2);
        assert_eq!(data.len(), expected);
    }
}
