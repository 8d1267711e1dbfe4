// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! JSON-lines encoder: one serialized object per committed entry.

use log::error;
use serde::Serialize;

use crate::backend::TraceBackend;
use crate::backend::TraceSink;
use crate::cpu::CpuMode;
use crate::entry::Entry;
use crate::entry::Event;
use crate::entry::RegInfo;
use crate::entry::RegValue;
use crate::entry::TraceState;
use crate::entry::FLAG_HAS_INSTR_DATA;
use crate::entry::MEM_STORE;
use crate::entry::PADDR_INVALID;

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
enum JsonValue {
    Int(u64),
    Ext { value: String, tag: bool },
}

impl JsonValue {
    fn from_reg(value: &RegValue) -> JsonValue {
        match value {
            RegValue::Int(v) => JsonValue::Int(*v),
            RegValue::Ext(e) => JsonValue::Ext {
                value: format!("0x{:x}", e.value),
                tag: e.tag,
            },
        }
    }
}

#[derive(Serialize)]
struct JsonReg {
    name: &'static str,
    flags: u16,
    value: JsonValue,
}

impl JsonReg {
    fn new(reg: &RegInfo) -> JsonReg {
        JsonReg {
            name: reg.name,
            flags: reg.flags,
            value: JsonValue::from_reg(&reg.value),
        }
    }
}

#[derive(Serialize)]
struct JsonMem {
    access: &'static str,
    op: u32,
    addr: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    paddr: Option<u64>,
    value: JsonValue,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
enum JsonEvent {
    State { state: TraceState, pc: u64 },
    Regdump { gpr: Vec<JsonReg> },
}

#[derive(Serialize)]
struct JsonEntry<'a> {
    cpu: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pc: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    insn: Option<String>,
    asid: u16,
    flags: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<CpuMode>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    regs: Vec<JsonReg>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    mem: Vec<JsonMem>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    events: Vec<JsonEvent>,
    #[serde(skip_serializing_if = "str::is_empty")]
    txt: &'a str,
}

pub struct JsonBackend {
    sink: TraceSink,
}

impl JsonBackend {
    pub fn new(sink: TraceSink) -> JsonBackend {
        JsonBackend { sink }
    }
}

impl TraceBackend for JsonBackend {
    fn emit_instr(&mut self, cpu_index: usize, entry: &Entry) {
        let insn = if entry.has_flag(FLAG_HAS_INSTR_DATA) {
            let mut hex = String::with_capacity(entry.insn().len() * 2);
            for byte in entry.insn() {
                hex.push_str(&format!("{:02x}", byte));
            }
            Some(hex)
        } else {
            None
        };
        let record = JsonEntry {
            cpu: cpu_index,
            // Incomplete boundary records keep their pc too.
            pc: (entry.has_flag(FLAG_HAS_INSTR_DATA) || entry.pc != 0).then_some(entry.pc),
            insn,
            asid: entry.asid,
            flags: entry.flags,
            mode: entry
                .has_flag(crate::entry::FLAG_MODE_SWITCH)
                .then_some(entry.next_cpu_mode),
            regs: entry.regs.iter().map(JsonReg::new).collect(),
            mem: entry
                .mem
                .iter()
                .map(|minfo| JsonMem {
                    access: if minfo.flags & MEM_STORE != 0 {
                        "store"
                    } else {
                        "load"
                    },
                    op: minfo.op.0,
                    addr: minfo.addr,
                    paddr: (minfo.paddr != PADDR_INVALID).then_some(minfo.paddr),
                    value: JsonValue::from_reg(&minfo.value),
                })
                .collect(),
            events: entry
                .events
                .iter()
                .map(|event| match event {
                    Event::State(ev) => JsonEvent::State {
                        state: ev.next_state,
                        pc: ev.pc,
                    },
                    Event::RegDump(gpr) => JsonEvent::Regdump {
                        gpr: gpr.iter().map(JsonReg::new).collect(),
                    },
                })
                .collect(),
            txt: &entry.txt_buffer,
        };
        match serde_json::to_vec(&record) {
            Ok(mut line) => {
                line.push(b'\n');
                self.sink.write_record(&line);
            }
            Err(e) => error!("failed to encode trace entry: {}", e),
        }
    }

    fn sync(&mut self) {
        self.sink.flush();
    }
}
