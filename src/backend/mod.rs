// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Encoder backends.
//!
//! Backends serialize committed entries to an external sink. The set is
//! closed: a fixed descriptor table maps each [`BackendKind`] to its
//! constructor, and the selection is frozen when the first CPU registers.
//! Each CPU gets its own backend instance; instances that share an output
//! sink serialize on the sink's internal lock.

mod binary;
mod json;
mod nop;
mod text;

use std::fs::File;
use std::io;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use log::error;
use serde::Deserialize;
use serde::Serialize;

pub use binary::BinaryBackend;
pub use json::JsonBackend;
pub use nop::NopBackend;
pub use text::TextBackend;

use crate::entry::Entry;

/// An encoder that serializes trace entries to some external sink.
///
/// `emit_instr` borrows the entry for the duration of the call and must not
/// retain it, and must not block the simulator indefinitely. The remaining
/// hooks are optional.
pub trait TraceBackend: Send {
    /// Called once per CPU before any entry is emitted; may write a header.
    fn init(&mut self, _cpu_index: usize) {}

    /// Drains backend-internal buffering. Called at flush and shutdown.
    fn sync(&mut self) {}

    fn emit_instr(&mut self, cpu_index: usize, entry: &Entry);

    /// Optional side channel for counter/debug values.
    fn emit_debug(&mut self, _cpu_index: usize, _counter_id: u32, _value: i64) {}
}

/// Selects the trace encoder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[default]
    Text,
    BinaryFramed,
    Nop,
    TracingSystem,
    Protobuf,
    Json,
    CacheSim,
}

impl BackendKind {
    pub fn name(self) -> &'static str {
        TRACE_BACKENDS[self as usize].name
    }

    /// The constructor for this backend, or `None` when the encoder is not
    /// built into this crate.
    pub(crate) fn build_fn(self) -> Option<fn(TraceSink) -> Box<dyn TraceBackend>> {
        TRACE_BACKENDS[self as usize].build
    }
}

struct BackendDesc {
    name: &'static str,
    build: Option<fn(TraceSink) -> Box<dyn TraceBackend>>,
}

// Indexed by BackendKind discriminants.
static TRACE_BACKENDS: [BackendDesc; 7] = [
    BackendDesc {
        name: "text",
        build: Some(build_text),
    },
    BackendDesc {
        name: "binary-framed",
        build: Some(build_binary),
    },
    BackendDesc {
        name: "nop",
        build: Some(build_nop),
    },
    BackendDesc {
        name: "tracing-system",
        build: None,
    },
    BackendDesc {
        name: "protobuf",
        build: None,
    },
    BackendDesc {
        name: "json",
        build: Some(build_json),
    },
    BackendDesc {
        name: "cache-sim",
        build: None,
    },
];

fn build_text(sink: TraceSink) -> Box<dyn TraceBackend> {
    Box::new(TextBackend::new(sink))
}

fn build_binary(sink: TraceSink) -> Box<dyn TraceBackend> {
    Box::new(BinaryBackend::new(sink))
}

fn build_nop(_sink: TraceSink) -> Box<dyn TraceBackend> {
    Box::new(NopBackend)
}

fn build_json(sink: TraceSink) -> Box<dyn TraceBackend> {
    Box::new(JsonBackend::new(sink))
}

enum SinkInner {
    Stderr,
    File(BufWriter<File>),
    Memory(Vec<u8>),
}

/// A shared trace output sink.
///
/// Backend instances on different CPUs may hold clones of the same sink;
/// each write takes the internal lock, so interleaving happens only at
/// entry granularity.
#[derive(Clone)]
pub struct TraceSink {
    inner: Arc<Mutex<SinkInner>>,
}

impl TraceSink {
    pub fn stderr() -> TraceSink {
        TraceSink {
            inner: Arc::new(Mutex::new(SinkInner::Stderr)),
        }
    }

    pub fn file(path: &Path) -> io::Result<TraceSink> {
        let file = File::create(path)?;
        Ok(TraceSink {
            inner: Arc::new(Mutex::new(SinkInner::File(BufWriter::new(file)))),
        })
    }

    /// An in-memory sink, mainly useful for tests and tooling.
    pub fn memory() -> TraceSink {
        TraceSink {
            inner: Arc::new(Mutex::new(SinkInner::Memory(Vec::new()))),
        }
    }

    /// The bytes collected so far, for memory sinks.
    pub fn contents(&self) -> Option<Vec<u8>> {
        match &*self.inner.lock().unwrap() {
            SinkInner::Memory(data) => Some(data.clone()),
            _ => None,
        }
    }

    /// Writes one encoded record. Failures are reported and swallowed;
    /// tracing never propagates I/O errors back into the simulator.
    pub(crate) fn write_record(&self, record: &[u8]) {
        let result = match &mut *self.inner.lock().unwrap() {
            SinkInner::Stderr => io::stderr().lock().write_all(record),
            SinkInner::File(writer) => writer.write_all(record),
            SinkInner::Memory(data) => {
                data.extend_from_slice(record);
                Ok(())
            }
        };
        if let Err(e) = result {
            error!("failed to write trace record: {}", e);
        }
    }

    pub(crate) fn flush(&self) {
        let result = match &mut *self.inner.lock().unwrap() {
            SinkInner::Stderr => io::stderr().lock().flush(),
            SinkInner::File(writer) => writer.flush(),
            SinkInner::Memory(_) => Ok(()),
        };
        if let Err(e) = result {
            error!("failed to flush trace sink: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_match_table() {
        assert_eq!(BackendKind::Text.name(), "text");
        assert_eq!(BackendKind::BinaryFramed.name(), "binary-framed");
        assert_eq!(BackendKind::CacheSim.name(), "cache-sim");
    }

    #[test]
    fn unavailable_backends_have_no_constructor() {
        assert!(BackendKind::Text.build_fn().is_some());
        assert!(BackendKind::Json.build_fn().is_some());
        assert!(BackendKind::TracingSystem.build_fn().is_none());
        assert!(BackendKind::Protobuf.build_fn().is_none());
        assert!(BackendKind::CacheSim.build_fn().is_none());
    }

    #[test]
    fn memory_sink_collects_records() {
        let sink = TraceSink::memory();
        sink.write_record(b"abc");
        sink.write_record(b"def");
        assert_eq!(sink.contents().unwrap(), b"abcdef");
    }

    #[test]
    fn file_sink_writes_through_on_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.out");
        let sink = TraceSink::file(&path).unwrap();
        sink.write_record(b"entry");
        sink.flush();
        assert_eq!(std::fs::read(&path).unwrap(), b"entry");
    }
}
