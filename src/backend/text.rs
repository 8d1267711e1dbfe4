// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Human-readable text encoder.

use std::fmt::Write as _;

use crate::backend::TraceBackend;
use crate::backend::TraceSink;
use crate::cpu::CpuMode;
use crate::entry::Entry;
use crate::entry::Event;
use crate::entry::RegValue;
use crate::entry::TraceState;
use crate::entry::FLAG_HAS_INSTR_DATA;
use crate::entry::FLAG_INTR_ASYNC;
use crate::entry::FLAG_INTR_TRAP;
use crate::entry::FLAG_MODE_SWITCH;
use crate::entry::MEM_STORE;
use crate::entry::PADDR_INVALID;

pub struct TextBackend {
    sink: TraceSink,
    scratch: String,
}

impl TextBackend {
    pub fn new(sink: TraceSink) -> TextBackend {
        TextBackend {
            sink,
            scratch: String::new(),
        }
    }
}

fn mode_name(mode: CpuMode) -> &'static str {
    match mode {
        CpuMode::User => "user",
        CpuMode::Supervisor => "supervisor",
        CpuMode::Hypervisor => "hypervisor",
        CpuMode::Debug => "debug",
    }
}

fn state_name(state: TraceState) -> &'static str {
    match state {
        TraceState::Start => "start",
        TraceState::Stop => "stop",
        TraceState::Flush => "flush",
    }
}

fn write_value(out: &mut String, value: &RegValue) {
    match value {
        RegValue::Int(v) => {
            let _ = write!(out, "{:016x}", v);
        }
        RegValue::Ext(e) => {
            let _ = write!(out, "v:{} 0x{:032x}", e.tag as u8, e.value);
        }
    }
}

impl TraceBackend for TextBackend {
    fn emit_instr(&mut self, cpu_index: usize, entry: &Entry) {
        let out = &mut self.scratch;
        out.clear();

        for event in &entry.events {
            match event {
                Event::State(ev) => {
                    let _ = writeln!(
                        out,
                        "[cpu {}] trace {} @ 0x{:016x}",
                        cpu_index,
                        state_name(ev.next_state),
                        ev.pc
                    );
                }
                Event::RegDump(gpr) => {
                    let _ = writeln!(out, "[cpu {}] register dump:", cpu_index);
                    for reg in gpr {
                        let _ = write!(out, "    {} = ", reg.name);
                        write_value(out, &reg.value);
                        out.push('\n');
                    }
                }
            }
        }

        if entry.has_flag(FLAG_HAS_INSTR_DATA) {
            let _ = write!(
                out,
                "[{:x}:{}] 0x{:016x}:",
                entry.asid, cpu_index, entry.pc
            );
            for byte in entry.insn() {
                let _ = write!(out, " {:02x}", byte);
            }
            out.push('\n');
        }

        if entry.has_flag(FLAG_MODE_SWITCH) {
            let _ = writeln!(out, "    -> switch to {} mode", mode_name(entry.next_cpu_mode));
        }
        if entry.has_flag(FLAG_INTR_TRAP) {
            let _ = writeln!(
                out,
                "    exception {} vector 0x{:x} fault 0x{:x}",
                entry.intr_code, entry.intr_vector, entry.intr_faultaddr
            );
        }
        if entry.has_flag(FLAG_INTR_ASYNC) {
            let _ = writeln!(
                out,
                "    interrupt {} vector 0x{:x}",
                entry.intr_code, entry.intr_vector
            );
        }

        for reg in &entry.regs {
            let _ = write!(out, "    write {} = ", reg.name);
            write_value(out, &reg.value);
            out.push('\n');
        }

        for minfo in &entry.mem {
            let dir = if minfo.flags & MEM_STORE != 0 {
                "write"
            } else {
                "read"
            };
            let _ = write!(out, "    mem {} [0x{:016x}", dir, minfo.addr);
            if minfo.paddr != PADDR_INVALID {
                let _ = write!(out, "/0x{:016x}", minfo.paddr);
            }
            let _ = write!(out, "] op={} = ", minfo.op.0);
            write_value(out, &minfo.value);
            out.push('\n');
        }

        if !entry.txt_buffer.is_empty() {
            out.push_str(&entry.txt_buffer);
            if !entry.txt_buffer.ends_with('\n') {
                out.push('\n');
            }
        }

        self.sink.write_record(out.as_bytes());
    }

    fn sync(&mut self) {
        self.sink.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::RegInfo;
    use crate::entry::StateEvent;

    #[test]
    fn renders_instruction_line() {
        let sink = TraceSink::memory();
        let mut backend = TextBackend::new(sink.clone());
        let mut entry = Entry::default();
        entry.pc = 0x1000;
        entry.asid = 5;
        entry.insn_bytes[..2].copy_from_slice(&[0x0b, 0x90]);
        entry.insn_size = 2;
        entry.flags |= FLAG_HAS_INSTR_DATA;
        entry.regs.push(RegInfo::int("x1", 0x2a));

        backend.emit_instr(0, &entry);
        let text = String::from_utf8(sink.contents().unwrap()).unwrap();
        assert!(text.contains("[5:0] 0x0000000000001000: 0b 90"));
        assert!(text.contains("write x1 = 000000000000002a"));
    }

    #[test]
    fn renders_state_event() {
        let sink = TraceSink::memory();
        let mut backend = TextBackend::new(sink.clone());
        let mut entry = Entry::default();
        entry.events.push(Event::State(StateEvent {
            next_state: TraceState::Start,
            pc: 0x4000,
        }));

        backend.emit_instr(1, &entry);
        let text = String::from_utf8(sink.contents().unwrap()).unwrap();
        assert!(text.contains("[cpu 1] trace start @ 0x0000000000004000"));
    }
}
