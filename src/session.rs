// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Trace session: the process-wide tracing configuration and CPU registry.
//!
//! A [`TraceSession`] is built once from parsed options, before any CPU
//! exists. The backend selection and startup lists freeze when the first
//! CPU registers; later mutations (level switches, filter changes, ring
//! resizes) are funneled through each CPU's safe-point work queue so they
//! execute on the owning thread, never concurrently with staging.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::sync::Mutex;

use log::warn;
use once_cell::sync::OnceCell;

use crate::backend::BackendKind;
use crate::backend::TraceBackend;
use crate::backend::TraceSink;
use crate::config;
use crate::config::TraceOptions;
use crate::cpu::CpuContext;
use crate::filter::AddressRange;
use crate::filter::TraceFilter;
use crate::level::LevelSwitchArg;
use crate::level::LogLevel;
use crate::logger::InstrLogger;
use crate::ring::MIN_BUFFER_SIZE;

/// Global enable bit for instruction tracing.
pub const LOG_INSTR: u32 = 1 << 0;
/// USER-mode gating bit; implies [`LOG_INSTR`].
pub const LOG_INSTR_U: u32 = 1 << 1;

/// A unit of work to run on a CPU's thread at its next safe point.
pub(crate) type WorkItem = Box<dyn FnOnce(&mut InstrLogger, &dyn CpuContext) + Send>;

#[derive(Default)]
struct StartupConfig {
    filters: Vec<TraceFilter>,
    dfilter: Vec<AddressRange>,
}

#[derive(Clone)]
struct FrozenLists {
    filters: Vec<TraceFilter>,
    dfilter: Arc<[AddressRange]>,
}

pub(crate) struct SessionShared {
    log_flags: AtomicU32,
    buffer_size: AtomicUsize,
    backend_kind: BackendKind,
    backend_build: fn(TraceSink) -> Box<dyn TraceBackend>,
    sink: TraceSink,
    trace_debug: bool,
    startup: Mutex<StartupConfig>,
    frozen: OnceCell<FrozenLists>,
    cpus: Mutex<Vec<LoggerHandle>>,
}

impl SessionShared {
    #[inline]
    pub(crate) fn log_mask(&self) -> u32 {
        self.log_flags.load(Ordering::Relaxed)
    }

    /// Raises the global enable bit. Lowering is deliberately deferred: the
    /// simulator may still be running cached translations that reference
    /// the instrumented helpers.
    pub(crate) fn global_enable(&self) {
        self.log_flags.fetch_or(LOG_INSTR, Ordering::Relaxed);
    }
}

/// Cross-thread handle to one CPU's logger.
///
/// All requests take effect at the target CPU's next safe point; there is
/// no synchronous acknowledgment.
#[derive(Clone)]
pub struct LoggerHandle {
    cpu_index: usize,
    tx: Sender<WorkItem>,
}

impl LoggerHandle {
    pub fn cpu_index(&self) -> usize {
        self.cpu_index
    }

    pub(crate) fn post(&self, work: WorkItem) -> bool {
        self.tx.send(work).is_ok()
    }

    /// Blocking variant: waits until the work ran on the CPU thread. Only
    /// used for shutdown-style operations; may delay the caller until the
    /// target CPU reaches a safe point.
    pub(crate) fn run_sync<F>(&self, f: F)
    where
        F: FnOnce(&mut InstrLogger, &dyn CpuContext) + Send + 'static,
    {
        let (ack_tx, ack_rx) = mpsc::channel();
        let posted = self.post(Box::new(move |logger, ctx| {
            f(logger, ctx);
            let _ = ack_tx.send(());
        }));
        if posted {
            let _ = ack_rx.recv();
        }
    }

    /// Requests that tracing start at `level` on this CPU.
    pub fn request_start(&self, level: LogLevel, pc: u64) {
        self.post(Box::new(move |logger, _ctx| {
            logger.request_start(level, pc);
        }));
    }

    /// Requests that tracing stop on this CPU.
    pub fn request_stop(&self, pc: u64) {
        self.post(Box::new(move |logger, _ctx| {
            logger.request_stop(pc);
        }));
    }

    pub fn add_filter(&self, filter: TraceFilter) {
        self.post(Box::new(move |logger, _ctx| {
            logger.add_filter(filter);
        }));
    }

    pub fn remove_filter(&self, filter: TraceFilter) {
        self.post(Box::new(move |logger, _ctx| {
            logger.remove_filter(filter);
        }));
    }

    pub fn set_buffered(&self, enable: bool) {
        self.post(Box::new(move |logger, _ctx| {
            logger.set_buffered(enable);
        }));
    }

    /// Requests a ring drain on this CPU.
    pub fn flush(&self) {
        self.post(Box::new(move |logger, ctx| {
            logger.flush(ctx);
        }));
    }
}

/// The one-shot configured tracing session.
pub struct TraceSession {
    shared: Arc<SessionShared>,
}

impl TraceSession {
    /// Builds a session from parsed options.
    ///
    /// A backend whose encoder is not built into this crate falls back to
    /// `text` with a diagnostic; an invalid filter name or an unopenable
    /// trace file refuses session construction.
    pub fn new(options: TraceOptions) -> anyhow::Result<TraceSession> {
        let startup_filters = match &options.filter {
            Some(spec) => config::parse_filter_spec(spec)?,
            None => Vec::new(),
        };

        let buffer_size = if options.buffer_size < MIN_BUFFER_SIZE {
            warn!(
                "{}; using the minimum",
                config::Error::BufferTooSmall(options.buffer_size)
            );
            MIN_BUFFER_SIZE
        } else {
            options.buffer_size
        };

        let sink = match &options.trace_file {
            Some(path) => TraceSink::file(path).map_err(config::Error::Io)?,
            None => TraceSink::stderr(),
        };

        let (backend_kind, backend_build) = match options.backend.build_fn() {
            Some(build) => (options.backend, build),
            None => {
                warn!(
                    "{}; using '{}'",
                    config::Error::BackendUnavailable(options.backend.name()),
                    BackendKind::Text.name()
                );
                (
                    BackendKind::Text,
                    BackendKind::Text.build_fn().expect("text backend missing"),
                )
            }
        };

        Ok(TraceSession {
            shared: Arc::new(SessionShared {
                log_flags: AtomicU32::new(0),
                buffer_size: AtomicUsize::new(buffer_size),
                backend_kind,
                backend_build,
                sink,
                trace_debug: options.trace_debug,
                startup: Mutex::new(StartupConfig {
                    filters: startup_filters,
                    dfilter: Vec::new(),
                }),
                frozen: OnceCell::new(),
                cpus: Mutex::new(Vec::new()),
            }),
        })
    }

    #[cfg(test)]
    pub(crate) fn shared_arc(&self) -> Arc<SessionShared> {
        Arc::clone(&self.shared)
    }

    /// The backend actually selected, after any fallback.
    pub fn backend_kind(&self) -> BackendKind {
        self.shared.backend_kind
    }

    /// The trace output sink shared by all backend instances.
    pub fn sink(&self) -> TraceSink {
        self.shared.sink.clone()
    }

    /// Registers a CPU and returns its logger, which moves to the CPU's
    /// execution thread. The first registration freezes the session
    /// configuration. Must be called on the thread that will own the
    /// logger; if tracing is already globally enabled the initial level
    /// switch runs here, before any instruction executes.
    pub fn add_cpu(&self, cpu_index: usize, ctx: &dyn CpuContext) -> InstrLogger {
        let shared = &self.shared;
        let frozen = shared
            .frozen
            .get_or_init(|| {
                let startup = shared.startup.lock().unwrap();
                FrozenLists {
                    filters: startup.filters.clone(),
                    dfilter: startup.dfilter.clone().into(),
                }
            })
            .clone();

        let mut backend = (shared.backend_build)(shared.sink.clone());
        backend.init(cpu_index);

        let (work_tx, work_rx) = mpsc::channel();
        let handle = LoggerHandle {
            cpu_index,
            tx: work_tx.clone(),
        };
        let mut logger = InstrLogger::new(
            cpu_index,
            Arc::clone(shared),
            frozen.dfilter,
            shared.trace_debug,
            backend,
            work_tx,
            work_rx,
            shared.buffer_size.load(Ordering::Relaxed),
        );
        for filter in &frozen.filters {
            logger.add_filter(*filter);
        }

        let mask = shared.log_mask();
        if mask & (LOG_INSTR | LOG_INSTR_U) != 0 {
            let level = if mask & LOG_INSTR_U != 0 {
                LogLevel::User
            } else {
                LogLevel::All
            };
            logger.do_loglevel_switch(
                ctx,
                LevelSwitchArg {
                    next_level: level,
                    pc: 0,
                    global: true,
                },
            );
        }

        shared.cpus.lock().unwrap().push(handle);
        logger
    }

    /// Handle for one registered CPU.
    pub fn handle(&self, cpu_index: usize) -> Option<LoggerHandle> {
        self.shared
            .cpus
            .lock()
            .unwrap()
            .iter()
            .find(|handle| handle.cpu_index == cpu_index)
            .cloned()
    }

    /// Handles for every registered CPU.
    pub fn handles(&self) -> Vec<LoggerHandle> {
        self.shared.cpus.lock().unwrap().clone()
    }

    pub fn log_mask(&self) -> u32 {
        self.shared.log_mask()
    }

    /// Replaces the tracing bits of the log mask. `LOG_INSTR_U` implies
    /// `LOG_INSTR`. Intended for startup configuration; runtime transitions
    /// go through [`TraceSession::global_switch`].
    pub fn set_log_mask(&self, mut flags: u32) {
        if flags & LOG_INSTR_U != 0 {
            flags |= LOG_INSTR;
        }
        self.shared.log_flags.store(flags, Ordering::Relaxed);
    }

    /// Starts or stops tracing on every CPU according to the tracing bits
    /// in `log_flags`, at each CPU's next safe point. Returns the adjusted
    /// flags. On a stop the global enable bit is left raised until every
    /// CPU has left its execution loop; it is lowered lazily.
    pub fn global_switch(&self, mut log_flags: u32) -> u32 {
        if log_flags & LOG_INSTR_U != 0 {
            log_flags |= LOG_INSTR;
        }
        let next_level = if log_flags & LOG_INSTR_U != 0 {
            LogLevel::User
        } else if log_flags & LOG_INSTR != 0 {
            LogLevel::All
        } else {
            LogLevel::None
        };

        let prev = self.shared.log_mask();
        self.shared
            .log_flags
            .store(log_flags | (prev & LOG_INSTR), Ordering::Relaxed);

        for handle in self.shared.cpus.lock().unwrap().iter() {
            handle.post(Box::new(move |logger, ctx| {
                if next_level != LogLevel::None {
                    logger.shared().global_enable();
                }
                logger.do_loglevel_switch(
                    ctx,
                    LevelSwitchArg {
                        next_level,
                        pc: 0,
                        global: true,
                    },
                );
            }));
        }
        log_flags
    }

    /// Starts tracing at `level` on every CPU, e.g. for a guest-requested
    /// all-CPU start. Each CPU switches at its own next safe point.
    pub fn start_all(&self, level: LogLevel) {
        for handle in self.handles() {
            handle.request_start(level, 0);
        }
    }

    /// Stops tracing on every CPU.
    pub fn stop_all(&self) {
        for handle in self.handles() {
            handle.request_stop(0);
        }
    }

    /// Registers a commit-time filter: on every CPU if any exist, otherwise
    /// on the startup list applied to each CPU at registration.
    pub fn add_filter(&self, filter: TraceFilter) {
        let cpus = self.shared.cpus.lock().unwrap();
        if cpus.is_empty() {
            drop(cpus);
            let mut startup = self.shared.startup.lock().unwrap();
            if !startup.filters.contains(&filter) {
                startup.filters.push(filter);
            }
        } else {
            for handle in cpus.iter() {
                handle.add_filter(filter);
            }
        }
    }

    pub fn remove_filter(&self, filter: TraceFilter) {
        let cpus = self.shared.cpus.lock().unwrap();
        if cpus.is_empty() {
            drop(cpus);
            self.shared
                .startup
                .lock()
                .unwrap()
                .filters
                .retain(|f| *f != filter);
        } else {
            for handle in cpus.iter() {
                handle.remove_filter(filter);
            }
        }
    }

    /// Configures the address ranges consulted by the mem-range filter.
    /// Only effective before the first CPU registers.
    pub fn set_address_ranges(&self, ranges: Vec<AddressRange>) {
        if self.shared.frozen.get().is_some() {
            warn!("trace address ranges cannot change after CPUs initialize");
            return;
        }
        self.shared.startup.lock().unwrap().dfilter = ranges;
    }

    /// Resizes every CPU's entry ring. The resize is destructive and runs
    /// at each CPU's next safe point. An undersized request is refused and
    /// surfaced; callers may ignore the error since the previous size is
    /// kept.
    pub fn set_buffer_size(&self, new_size: usize) -> Result<(), config::Error> {
        if new_size < MIN_BUFFER_SIZE {
            let err = config::Error::BufferTooSmall(new_size);
            warn!("{}; buffer size unchanged", err);
            return Err(err);
        }
        self.shared.buffer_size.store(new_size, Ordering::Relaxed);
        for handle in self.shared.cpus.lock().unwrap().iter() {
            handle.post(Box::new(move |logger, _ctx| {
                logger.resize_ring(new_size);
            }));
        }
        Ok(())
    }

    /// Synchronizes the backend on every CPU.
    ///
    /// Blocking: waits for each CPU to reach a safe point, so this may
    /// delay shutdown.
    pub fn sync_buffers(&self) {
        let handles = self.handles();
        for handle in handles {
            handle.run_sync(|logger, _ctx| {
                logger.do_backend_sync();
            });
        }
    }
}
