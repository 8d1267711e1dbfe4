// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-CPU log level state machine.
//!
//! Level changes must not race the execution loop, which caches the enable
//! flags in translated code. Both triggers — guest privilege-mode switches
//! and explicit start/stop requests — therefore post their work to the
//! owning CPU's safe-point queue; the actual transition runs in
//! [`InstrLogger::do_loglevel_switch`] between translated blocks.

use crate::cpu::CpuContext;
use crate::cpu::CpuMode;
use crate::entry::Event;
use crate::entry::StateEvent;
use crate::entry::TraceState;
use crate::entry::FLAG_HAS_INSTR_DATA;
use crate::entry::FLAG_MODE_SWITCH;
use crate::logger::InstrLogger;
use crate::session::LOG_INSTR;

/// Whether and when instructions are traced on a CPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogLevel {
    /// Tracing disabled.
    #[default]
    None,
    /// Trace only while the guest executes in user mode.
    User,
    /// Trace everything.
    All,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct LevelSwitchArg {
    pub next_level: LogLevel,
    pub pc: u64,
    pub global: bool,
}

impl InstrLogger {
    /// Records a guest privilege-mode change on the pending entry and, under
    /// USER-level gating, schedules the matching pause or resume.
    ///
    /// Instructions reporting a mode switch are expected to end their
    /// translated block so the scheduled switch runs promptly.
    pub fn mode_switch(&mut self, mode: CpuMode, pc: u64) {
        {
            let entry = self.state.ring.current_mut();
            entry.flags |= FLAG_MODE_SWITCH;
            entry.next_cpu_mode = mode;
        }

        if self.shared().log_mask() & LOG_INSTR == 0 || self.state.loglevel != LogLevel::User {
            return;
        }

        if (mode == CpuMode::User) != self.state.loglevel_active {
            self.schedule_loglevel_switch(self.state.loglevel, pc, false);
        }
    }

    /// Requests that tracing start at `level` on this CPU, taking effect at
    /// the next safe point. A no-op if the CPU already traces at `level`.
    pub fn request_start(&mut self, level: LogLevel, pc: u64) {
        self.shared().global_enable();
        if self.state.loglevel == level && self.state.loglevel_active {
            return;
        }
        self.schedule_loglevel_switch(level, pc, false);
    }

    /// Requests that tracing stop on this CPU at the next safe point.
    pub fn request_stop(&mut self, pc: u64) {
        self.schedule_loglevel_switch(LogLevel::None, pc, false);
    }

    pub(crate) fn schedule_loglevel_switch(&self, next_level: LogLevel, pc: u64, global: bool) {
        let arg = LevelSwitchArg {
            next_level,
            pc,
            global,
        };
        self.schedule(Box::new(move |logger, ctx| {
            logger.do_loglevel_switch(ctx, arg);
        }));
    }

    /// Performs the level change. Runs only in safe-point context.
    ///
    /// When logging starts, the start event is staged but the entry is not
    /// committed: the first traced instruction carries the marker out. The
    /// path from the safe point back to the execution loop can itself trap
    /// and immediately stop again; the deferral elides that zero-length
    /// slice instead of emitting an empty start/stop pair.
    pub(crate) fn do_loglevel_switch(&mut self, ctx: &dyn CpuContext, arg: LevelSwitchArg) {
        debug_assert!(self.shared().log_mask() & LOG_INSTR != 0);

        let prev_level = self.state.loglevel;
        let prev_active = self.state.loglevel_active;
        let pc = if arg.global { ctx.recent_pc() } else { arg.pc };

        let next_active = match arg.next_level {
            LogLevel::None => false,
            LogLevel::All => true,
            LogLevel::User => {
                // A pending mode switch tells us the mode the CPU is
                // entering; otherwise ask the simulator.
                let entry = self.state.ring.current_ref();
                if entry.has_flag(FLAG_MODE_SWITCH) {
                    entry.next_cpu_mode == CpuMode::User
                } else {
                    ctx.in_user_mode()
                }
            }
        };

        self.state.loglevel = arg.next_level;
        self.state.loglevel_active = next_active;

        if arg.next_level == prev_level && prev_active == next_active {
            return;
        }

        if prev_active {
            if self.state.starting {
                // Nothing was traced since the start marker was staged;
                // drop the empty slice.
                self.reset_current();
                return;
            }
            self.emit_stop_event(pc);
            self.state.stats.trace_stop += 1;
            self.do_commit();
            // The commit may have advanced to the next ring slot.
            self.reset_current();
        }
        if next_active {
            self.state.starting = true;
            self.emit_start_event(ctx, pc);
            self.emit_regdump_event(ctx);
            self.state.stats.trace_start += 1;
        }
    }

    /// Stages a trace-start marker on the pending entry.
    ///
    /// Start events never carry complete instruction data, but the entry's
    /// `pc` is set from the trigger so even the incomplete first record
    /// locates the slice.
    fn emit_start_event(&mut self, ctx: &dyn CpuContext, pc: u64) {
        let paddr = crate::cpu::paddr_for(ctx, pc);
        let entry = self.state.ring.current_mut();
        entry.flags &= !FLAG_HAS_INSTR_DATA;
        entry.pc = pc;
        entry.paddr = paddr;
        entry.events.push(Event::State(StateEvent {
            next_state: TraceState::Start,
            pc,
        }));
    }

    fn emit_stop_event(&mut self, pc: u64) {
        self.state
            .ring
            .current_mut()
            .events
            .push(Event::State(StateEvent {
                next_state: TraceState::Stop,
                pc,
            }));
    }

    fn emit_regdump_event(&mut self, ctx: &dyn CpuContext) {
        if let Some(gpr) = ctx.regdump() {
            self.state.ring.current_mut().events.push(Event::RegDump(gpr));
        }
    }
}
