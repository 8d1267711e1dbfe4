// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-CPU instruction logger: staging, commit and flush.
//!
//! Each guest CPU owns exactly one [`InstrLogger`], confined to that CPU's
//! execution thread. The simulator stages data into the current ring entry
//! while an instruction executes and commits at the instruction boundary;
//! no locking is involved on this path. Cross-thread requests arrive
//! through the safe-point work queue and are drained by
//! [`InstrLogger::process_safe_point_work`] between translated blocks.

use std::fmt;
use std::fmt::Write as _;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use log::info;
use log::warn;

use crate::backend::TraceBackend;
use crate::cpu::paddr_for;
use crate::cpu::CpuContext;
use crate::cpu::MemOp;
use crate::entry::Event;
use crate::entry::ExtValue;
use crate::entry::MemInfo;
use crate::entry::RegInfo;
use crate::entry::RegValue;
use crate::entry::StateEvent;
use crate::entry::TraceState;
use crate::entry::FLAG_HAS_INSTR_DATA;
use crate::entry::FLAG_INTR_ASYNC;
use crate::entry::FLAG_INTR_TRAP;
use crate::entry::MAX_INSN_SIZE;
use crate::entry::MEM_EXTENDED;
use crate::entry::MEM_LOAD;
use crate::entry::MEM_STORE;
use crate::filter::AddressRange;
use crate::filter::TraceFilter;
use crate::level::LogLevel;
use crate::printf::PrintfBuf;
use crate::ring::EntryRing;
use crate::session::SessionShared;
use crate::session::WorkItem;
use crate::session::LOG_INSTR;

/// Ring commits advance the write cursor instead of emitting; entries are
/// drained by an explicit flush.
pub(crate) const STATE_FLAG_BUFFERED: u32 = 1 << 0;

/// Per-CPU trace statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TraceStats {
    pub entries_emitted: u64,
    pub trace_start: u64,
    pub trace_stop: u64,
}

pub(crate) struct CpuLogState {
    pub loglevel: LogLevel,
    pub loglevel_active: bool,
    pub starting: bool,
    pub force_drop: bool,
    pub flags: u32,
    pub filters: Vec<TraceFilter>,
    pub ring: EntryRing,
    pub stats: TraceStats,
    pub printf_buf: PrintfBuf,
}

impl CpuLogState {
    fn new(capacity: usize) -> CpuLogState {
        CpuLogState {
            loglevel: LogLevel::None,
            loglevel_active: false,
            starting: false,
            force_drop: false,
            flags: 0,
            filters: Vec::new(),
            ring: EntryRing::new(capacity),
            stats: TraceStats::default(),
            printf_buf: PrintfBuf::default(),
        }
    }
}

/// The per-CPU instruction logger. Owned by the CPU's execution thread.
pub struct InstrLogger {
    cpu_index: usize,
    shared: Arc<SessionShared>,
    dfilter: Arc<[AddressRange]>,
    trace_debug: bool,
    pub(crate) state: CpuLogState,
    backend: Box<dyn TraceBackend>,
    work_tx: Sender<WorkItem>,
    work_rx: Receiver<WorkItem>,
}

impl InstrLogger {
    pub(crate) fn new(
        cpu_index: usize,
        shared: Arc<SessionShared>,
        dfilter: Arc<[AddressRange]>,
        trace_debug: bool,
        backend: Box<dyn TraceBackend>,
        work_tx: Sender<WorkItem>,
        work_rx: Receiver<WorkItem>,
        capacity: usize,
    ) -> InstrLogger {
        InstrLogger {
            cpu_index,
            shared,
            dfilter,
            trace_debug,
            state: CpuLogState::new(capacity),
            backend,
            work_tx,
            work_rx,
        }
    }

    pub fn cpu_index(&self) -> usize {
        self.cpu_index
    }

    pub fn stats(&self) -> TraceStats {
        self.state.stats
    }

    pub fn loglevel(&self) -> LogLevel {
        self.state.loglevel
    }

    /// Cheap inline check: is instruction logging active on this CPU right
    /// now? The simulator gates staging calls on this, and every staging
    /// helper re-checks it so spurious calls degrade to no-ops.
    #[inline]
    pub fn enabled(&self) -> bool {
        self.shared.log_mask() & LOG_INSTR != 0 && self.state.loglevel_active
    }

    /// Runs pending cross-thread work at a safe point. The simulator calls
    /// this between translated blocks, when no instruction is in flight.
    pub fn process_safe_point_work(&mut self, ctx: &dyn CpuContext) {
        loop {
            let work = match self.work_rx.try_recv() {
                Ok(work) => work,
                Err(_) => break,
            };
            work(self, ctx);
        }
    }

    pub(crate) fn schedule(&self, work: WorkItem) {
        // The receive side lives in this very struct, so the send cannot
        // fail while `self` is alive.
        let _ = self.work_tx.send(work);
    }

    // Staging -------------------------------------------------------------

    /// Records an integer register write to the current instruction.
    pub fn record_reg(&mut self, name: &'static str, value: u64) {
        if !self.enabled() {
            return;
        }
        self.state.ring.current_mut().regs.push(RegInfo::int(name, value));
    }

    /// Records an extended register write.
    pub fn record_reg_ext(&mut self, name: &'static str, value: ExtValue) {
        if !self.enabled() {
            return;
        }
        self.state.ring.current_mut().regs.push(RegInfo::ext(name, value));
    }

    /// Records an integer write to an extended register.
    pub fn record_reg_ext_int(&mut self, name: &'static str, value: u64) {
        if !self.enabled() {
            return;
        }
        self.state
            .ring
            .current_mut()
            .regs
            .push(RegInfo::ext_int(name, value));
    }

    fn record_mem(&mut self, ctx: &dyn CpuContext, addr: u64, flags: u16, op: MemOp, value: RegValue) {
        let paddr = paddr_for(ctx, addr);
        self.state.ring.current_mut().mem.push(MemInfo {
            flags,
            op,
            addr,
            paddr,
            value,
        });
    }

    /// Records an integer load.
    pub fn record_ld(&mut self, ctx: &dyn CpuContext, addr: u64, op: MemOp, value: u64) {
        if !self.enabled() {
            return;
        }
        self.record_mem(ctx, addr, MEM_LOAD, op, RegValue::Int(value));
    }

    /// Records an integer store.
    pub fn record_st(&mut self, ctx: &dyn CpuContext, addr: u64, op: MemOp, value: u64) {
        if !self.enabled() {
            return;
        }
        self.record_mem(ctx, addr, MEM_STORE, op, RegValue::Int(value));
    }

    /// Records an extended-width load.
    pub fn record_ld_ext(&mut self, ctx: &dyn CpuContext, addr: u64, value: ExtValue) {
        if !self.enabled() {
            return;
        }
        self.record_mem(
            ctx,
            addr,
            MEM_LOAD | MEM_EXTENDED,
            MemOp(0),
            RegValue::Ext(value),
        );
    }

    /// Records an extended-width store.
    pub fn record_st_ext(&mut self, ctx: &dyn CpuContext, addr: u64, value: ExtValue) {
        if !self.enabled() {
            return;
        }
        self.record_mem(
            ctx,
            addr,
            MEM_STORE | MEM_EXTENDED,
            MemOp(0),
            RegValue::Ext(value),
        );
    }

    /// Records the instruction's program counter and opcode bytes.
    pub fn record_instruction(&mut self, ctx: &dyn CpuContext, pc: u64, bytes: &[u8]) {
        if !self.enabled() {
            return;
        }
        debug_assert!(bytes.len() <= MAX_INSN_SIZE);
        let size = bytes.len().min(MAX_INSN_SIZE);
        let paddr = paddr_for(ctx, pc);
        let entry = self.state.ring.current_mut();
        entry.pc = pc;
        entry.paddr = paddr;
        entry.insn_bytes[..size].copy_from_slice(&bytes[..size]);
        entry.insn_size = size as u8;
        entry.flags |= FLAG_HAS_INSTR_DATA;
    }

    /// Records the active address-space identifier.
    pub fn record_asid(&mut self, asid: u16) {
        if !self.enabled() {
            return;
        }
        self.state.ring.current_mut().asid = asid;
    }

    /// Records a synchronous trap taken by the instruction.
    pub fn record_exception(&mut self, code: u32, vector: u64, faultaddr: u64) {
        if !self.enabled() {
            return;
        }
        let entry = self.state.ring.current_mut();
        entry.flags |= FLAG_INTR_TRAP;
        entry.intr_code = code;
        entry.intr_vector = vector;
        entry.intr_faultaddr = faultaddr;
    }

    /// Records an asynchronous interrupt delivered at this boundary.
    pub fn record_interrupt(&mut self, code: u32, vector: u64) {
        if !self.enabled() {
            return;
        }
        let entry = self.state.ring.current_mut();
        entry.flags |= FLAG_INTR_ASYNC;
        entry.intr_code = code;
        entry.intr_vector = vector;
    }

    /// Attaches an event to the current entry, taking ownership of any
    /// storage the event carries.
    pub fn record_event(&mut self, event: Event) {
        if !self.enabled() {
            return;
        }
        self.state.ring.current_mut().events.push(event);
    }

    /// Appends formatted free-form text to the current entry.
    pub fn record_extra(&mut self, args: fmt::Arguments) {
        if !self.enabled() {
            return;
        }
        let _ = self.state.ring.current_mut().txt_buffer.write_fmt(args);
    }

    /// Marks the pending entry to be discarded at commit.
    pub fn mark_drop(&mut self) {
        if !self.enabled() {
            return;
        }
        self.state.force_drop = true;
    }

    // Commit ---------------------------------------------------------------

    /// Commits the current instruction at its boundary: the entry either
    /// passes the filter chain and reaches the backend (or the ring, in
    /// buffered mode), or it is dropped; the slot is then recycled.
    pub fn commit(&mut self) {
        if !self.enabled() {
            return;
        }
        self.do_commit();
        self.reset_current();
    }

    pub(crate) fn do_commit(&mut self) {
        if self.state.force_drop {
            return;
        }
        let entry = self.state.ring.current_ref();
        if !self
            .state
            .filters
            .iter()
            .all(|filter| filter.run(&self.dfilter, entry))
        {
            return;
        }
        if self.state.flags & STATE_FLAG_BUFFERED != 0 {
            self.state.ring.advance_head();
        } else {
            let entry = self.state.ring.current_ref();
            self.backend.emit_instr(self.cpu_index, entry);
            self.state.stats.entries_emitted += 1;
        }
    }

    /// Recycles the current ring slot for the next instruction. A commit
    /// may have advanced the write cursor, in which case this cleans the
    /// newly selected slot.
    pub(crate) fn reset_current(&mut self) {
        self.state.ring.current_mut().reset();
        self.state.force_drop = false;
        self.state.starting = false;
    }

    // Filters --------------------------------------------------------------

    /// Registers a commit-time filter on this CPU. Duplicates are ignored.
    pub fn add_filter(&mut self, filter: TraceFilter) {
        if self.state.filters.contains(&filter) {
            return;
        }
        self.state.filters.push(filter);
    }

    pub fn remove_filter(&mut self, filter: TraceFilter) {
        self.state.filters.retain(|f| *f != filter);
    }

    // Buffered mode and flush ----------------------------------------------

    /// Switches ring-retention mode on or off.
    pub fn set_buffered(&mut self, enable: bool) {
        if enable {
            self.state.flags |= STATE_FLAG_BUFFERED;
        } else {
            self.state.flags &= !STATE_FLAG_BUFFERED;
        }
    }

    /// Drains the ring through the backend.
    ///
    /// A flush event is attached to the pending entry so consumers can see
    /// where the drain happened; if tracing is off the pending entry is
    /// force-committed so the event is not lost.
    pub fn flush(&mut self, _ctx: &dyn CpuContext) {
        let pc = self.state.ring.current_ref().pc;
        self.state
            .ring
            .current_mut()
            .events
            .push(Event::State(StateEvent {
                next_state: TraceState::Flush,
                pc,
            }));
        if !self.enabled() {
            self.do_commit();
            self.reset_current();
        }
        if self.state.flags & STATE_FLAG_BUFFERED == 0 {
            return;
        }
        let mut curr = self.state.ring.tail();
        while curr != self.state.ring.head() {
            let entry = self.state.ring.entry(curr);
            self.backend.emit_instr(self.cpu_index, entry);
            self.state.stats.entries_emitted += 1;
            curr = self.state.ring.next_index(curr);
        }
        self.state.ring.set_tail_to_head();
    }

    /// Resizes the entry ring. Destructive: cursors reset, staged data is
    /// lost. Runs only from safe-point work.
    pub(crate) fn resize_ring(&mut self, capacity: usize) {
        self.state.ring.resize(capacity);
    }

    // Backend hooks ---------------------------------------------------------

    /// Forwards a counter/debug value to the backend's side channel.
    pub fn counter(&mut self, counter_id: u32, value: i64) {
        self.backend.emit_debug(self.cpu_index, counter_id, value);
    }

    /// Drains backend-internal buffering and, when trace debugging is on,
    /// dumps the per-CPU statistics.
    pub(crate) fn do_backend_sync(&mut self) {
        self.backend.sync();
        if !self.trace_debug {
            return;
        }
        let stats = self.state.stats;
        info!(
            "instruction tracing statistics: CPU #{}: {} entries emitted, {} trace slices",
            self.cpu_index, stats.entries_emitted, stats.trace_start
        );
        if stats.trace_start != stats.trace_stop {
            warn!(
                "CPU #{}: unbalanced trace stop: {}",
                self.cpu_index, stats.trace_stop
            );
        }
    }

    // Accessors for sibling modules -----------------------------------------

    pub(crate) fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    pub(crate) fn printf_buf_mut(&mut self) -> &mut PrintfBuf {
        &mut self.state.printf_buf
    }

    pub(crate) fn current_txt_buffer(&mut self) -> &mut String {
        &mut self.state.ring.current_mut().txt_buffer
    }

}
