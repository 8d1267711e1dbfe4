// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End-to-end tests driving the tracing core the way a simulator would:
//! stage at each instruction, commit at the boundary, drain safe-point work
//! between translated blocks.

use std::cell::Cell;
use std::thread;

use instr_trace::backend::BackendKind;
use instr_trace::backend::TraceSink;
use instr_trace::entry::RegInfo;
use instr_trace::printf::ConstArg;
use instr_trace::printf::GenArg;
use instr_trace::printf::OperandId;
use instr_trace::printf::OperandSource;
use instr_trace::printf::PrintfGen;
use instr_trace::CpuContext;
use instr_trace::CpuMode;
use instr_trace::InstrLogger;
use instr_trace::LogLevel;
use instr_trace::TraceOptions;
use instr_trace::TraceSession;
use instr_trace::LOG_INSTR;
use instr_trace::LOG_INSTR_U;

struct FakeCpu {
    user: Cell<bool>,
    pc: Cell<u64>,
}

impl FakeCpu {
    fn new() -> FakeCpu {
        FakeCpu {
            user: Cell::new(true),
            pc: Cell::new(0),
        }
    }
}

impl CpuContext for FakeCpu {
    fn in_user_mode(&self) -> bool {
        self.user.get()
    }

    fn recent_pc(&self) -> u64 {
        self.pc.get()
    }

    fn phys_page_debug(&self, vaddr_page: u64) -> Option<u64> {
        Some(vaddr_page + 0x8000_0000)
    }

    fn regdump(&self) -> Option<Vec<RegInfo>> {
        Some(vec![RegInfo::int("x0", 0), RegInfo::int("x1", 0x2a)])
    }
}

fn options(backend: BackendKind) -> TraceOptions {
    TraceOptions {
        backend,
        ..Default::default()
    }
}

/// Executes one guest instruction: stages it, lets the caller add extra
/// records, and commits at the boundary.
fn run_instr(logger: &mut InstrLogger, cpu: &FakeCpu, pc: u64, stage: impl FnOnce(&mut InstrLogger)) {
    cpu.pc.set(pc);
    if logger.enabled() {
        logger.record_instruction(cpu, pc, &[0x13, 0x05, 0x45, 0x03]);
        stage(logger);
        logger.commit();
    }
}

fn json_lines(sink: &TraceSink) -> Vec<serde_json::Value> {
    let data = String::from_utf8(sink.contents().unwrap()).unwrap();
    data.lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[test]
fn start_trace_stop_over_nop_backend() {
    let session = TraceSession::new(options(BackendKind::Nop)).unwrap();
    let cpu = FakeCpu::new();
    let mut logger = session.add_cpu(0, &cpu);

    logger.request_start(LogLevel::All, 0x1000);
    logger.process_safe_point_work(&cpu);
    assert!(logger.enabled());

    for i in 0..2u64 {
        run_instr(&mut logger, &cpu, 0x1000 + 4 * i, |logger| {
            logger.record_reg("a0", i);
        });
    }
    // The third instruction is the one that requests the stop; the stop
    // marker is carried out on its entry at the safe point.
    cpu.pc.set(0x1008);
    logger.record_instruction(&cpu, 0x1008, &[0x73, 0x00, 0x10, 0x00]);
    logger.record_reg("a0", 2);
    logger.request_stop(0x100c);
    logger.process_safe_point_work(&cpu);
    assert!(!logger.enabled());

    let stats = logger.stats();
    assert_eq!(stats.entries_emitted, 3);
    assert_eq!(stats.trace_start, 1);
    assert_eq!(stats.trace_stop, 1);
}

#[test]
fn start_and_stop_markers_ride_instruction_entries() {
    let session = TraceSession::new(options(BackendKind::Json)).unwrap();
    let sink = session.sink();
    let cpu = FakeCpu::new();
    let mut logger = session.add_cpu(0, &cpu);

    logger.request_start(LogLevel::All, 0x1000);
    logger.process_safe_point_work(&cpu);
    run_instr(&mut logger, &cpu, 0x1000, |_| {});
    run_instr(&mut logger, &cpu, 0x1004, |_| {});
    cpu.pc.set(0x1008);
    logger.record_instruction(&cpu, 0x1008, &[0x13]);
    logger.request_stop(0x1008);
    logger.process_safe_point_work(&cpu);

    let lines = json_lines(&sink);
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0]["events"][0]["state"]["state"], "start");
    assert_eq!(lines[0]["events"][0]["state"]["pc"], 0x1000);
    // The start entry also carries the register dump.
    assert_eq!(lines[0]["events"][1]["regdump"]["gpr"][0]["name"], "x0");
    assert!(lines[1].get("events").is_none());
    let last = lines.last().unwrap();
    assert_eq!(last["events"][0]["state"]["state"], "stop");
    assert_eq!(last["pc"], 0x1008);
}

#[test]
fn user_mode_gating_pauses_in_kernel() {
    let session = TraceSession::new(options(BackendKind::Json)).unwrap();
    let sink = session.sink();
    let cpu = FakeCpu::new();
    let mut logger = session.add_cpu(0, &cpu);

    session.global_switch(LOG_INSTR | LOG_INSTR_U);
    logger.process_safe_point_work(&cpu);
    assert!(logger.enabled());
    assert_eq!(logger.loglevel(), LogLevel::User);

    run_instr(&mut logger, &cpu, 0x1000, |_| {});
    // Instruction 2 traps into the kernel.
    run_instr(&mut logger, &cpu, 0x1004, |logger| {
        cpu.user.set(false);
        logger.mode_switch(CpuMode::Supervisor, 0x2000);
    });
    logger.process_safe_point_work(&cpu);
    assert!(!logger.enabled());

    // Instructions 3 and 4 run in the kernel and are not staged.
    run_instr(&mut logger, &cpu, 0x2000, |_| {
        panic!("staged while disabled");
    });
    run_instr(&mut logger, &cpu, 0x2004, |_| {
        panic!("staged while disabled");
    });

    // Return to user mode before instruction 5.
    cpu.user.set(true);
    logger.mode_switch(CpuMode::User, 0x1008);
    logger.process_safe_point_work(&cpu);
    assert!(logger.enabled());

    run_instr(&mut logger, &cpu, 0x1008, |_| {});
    run_instr(&mut logger, &cpu, 0x100c, |_| {});

    let lines = json_lines(&sink);
    let instr_pcs: Vec<u64> = lines
        .iter()
        .filter(|line| line.get("insn").is_some())
        .map(|line| line["pc"].as_u64().unwrap())
        .collect();
    assert_eq!(instr_pcs, vec![0x1000, 0x1004, 0x1008, 0x100c]);

    // The entries bracketing the kernel excursion carry the mode switch.
    let boundary_modes: Vec<(u64, Option<&str>)> = lines
        .iter()
        .filter(|line| line.get("insn").is_some())
        .map(|line| (line["pc"].as_u64().unwrap(), line["mode"].as_str()))
        .collect();
    assert_eq!(boundary_modes[1], (0x1004, Some("supervisor")));
    assert_eq!(boundary_modes[2], (0x1008, Some("user")));
    assert_eq!(boundary_modes[0], (0x1000, None));
}

#[test]
fn concurrent_cpus_emit_independently() {
    let session = TraceSession::new(options(BackendKind::Json)).unwrap();
    let sink = session.sink();

    thread::scope(|scope| {
        for cpu_index in 0..2usize {
            let session = &session;
            scope.spawn(move || {
                let cpu = FakeCpu::new();
                let mut logger = session.add_cpu(cpu_index, &cpu);
                logger.request_start(LogLevel::All, 0);
                logger.process_safe_point_work(&cpu);
                for i in 0..100u64 {
                    run_instr(&mut logger, &cpu, 0x1000 + 4 * i, |logger| {
                        logger.record_reg("a0", i);
                    });
                }
                assert_eq!(logger.stats().entries_emitted, 100);
            });
        }
    });

    let lines = json_lines(&sink);
    assert_eq!(lines.len(), 200);
    for cpu_index in 0..2 {
        let count = lines
            .iter()
            .filter(|line| line["cpu"].as_u64() == Some(cpu_index))
            .count();
        assert_eq!(count, 100);
    }
}

struct Operands(Vec<u64>);

impl OperandSource for Operands {
    fn load32(&self, op: OperandId) -> u32 {
        self.0[op.0 as usize] as u32
    }

    fn load64(&self, op: OperandId) -> u64 {
        self.0[op.0 as usize]
    }
}

#[test]
fn deferred_printf_lines_reach_the_trace() {
    let session = TraceSession::new(options(BackendKind::Json)).unwrap();
    let sink = session.sink();
    let cpu = FakeCpu::new();
    let mut logger = session.add_cpu(0, &cpu);

    logger.request_start(LogLevel::All, 0x1000);
    logger.process_safe_point_work(&cpu);

    // Translation half: eight captures planted in one block, no early flush.
    let mut gen = PrintfGen::new(true);
    for i in 0..8u64 {
        gen.gen_printf(
            "cw",
            "step %d pc=0x%x\n",
            &[GenArg::Const(ConstArg::Int(i)), GenArg::Guest32(OperandId(0))],
        );
    }
    gen.gen_printf_flush(false, true);
    let ops = gen.take_ops();

    // Execution half.
    logger.run_capture_ops(&ops, &Operands(vec![0x1000]));
    run_instr(&mut logger, &cpu, 0x1000, |_| {});

    let lines = json_lines(&sink);
    let txt = lines[0]["txt"].as_str().unwrap();
    let expected: String = (0..8).map(|i| format!("step {} pc=0x1000\n", i)).collect();
    assert_eq!(txt, expected);
}

#[test]
fn buffered_ring_drains_through_handle_flush() {
    let session = TraceSession::new(options(BackendKind::Json)).unwrap();
    let sink = session.sink();
    let cpu = FakeCpu::new();
    let mut logger = session.add_cpu(0, &cpu);
    let handle = session.handle(0).unwrap();

    logger.request_start(LogLevel::All, 0x1000);
    handle.set_buffered(true);
    logger.process_safe_point_work(&cpu);

    for i in 0..4u64 {
        run_instr(&mut logger, &cpu, 0x1000 + 4 * i, |_| {});
    }
    assert!(json_lines(&sink).is_empty());
    assert_eq!(logger.stats().entries_emitted, 0);

    handle.flush();
    logger.process_safe_point_work(&cpu);
    let lines = json_lines(&sink);
    assert_eq!(lines.len(), 4);
    assert_eq!(logger.stats().entries_emitted, 4);
}

#[test]
fn sync_buffers_blocks_until_cpu_reaches_safe_point() {
    let session = TraceSession::new(options(BackendKind::Json)).unwrap();
    let cpu = FakeCpu::new();
    let mut logger = session.add_cpu(0, &cpu);

    thread::scope(|scope| {
        let session = &session;
        let syncer = scope.spawn(move || {
            session.sync_buffers();
        });
        // Drive safe points until the sync lands.
        while !syncer.is_finished() {
            logger.process_safe_point_work(&cpu);
            thread::yield_now();
        }
        syncer.join().unwrap();
    });
}
