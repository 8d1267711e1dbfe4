// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Trace configuration knobs.
//!
//! Options arrive as a `key=value[,key=value]` string from the embedding's
//! option parser and deserialize into [`TraceOptions`].

use std::io;
use std::path::PathBuf;

use remain::sorted;
use serde::Deserialize;
use serde::Serialize;
use serde_keyvalue::FromKeyValues;
use thiserror::Error;

use crate::backend::BackendKind;
use crate::filter::TraceFilter;
use crate::ring::MIN_BUFFER_SIZE;

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("trace backend '{0}' support is not compiled in")]
    BackendUnavailable(&'static str),
    #[error("trace entry buffer size {0} is below the minimum {min}", min = MIN_BUFFER_SIZE)]
    BufferTooSmall(usize),
    #[error("invalid instruction trace filter name: {0}")]
    InvalidFilter(String),
    #[error("failed to open trace output file: {0}")]
    Io(io::Error),
}

/// Instruction tracing options.
///
/// `buffer-size` is the per-CPU ring capacity in entries; values below the
/// minimum are rejected at session construction. `filter` activates startup
/// filters by name before any CPU exists.
#[derive(Debug, Clone, Serialize, Deserialize, FromKeyValues)]
#[serde(deny_unknown_fields, default, rename_all = "kebab-case")]
pub struct TraceOptions {
    pub backend: BackendKind,
    pub buffer_size: usize,
    pub filter: Option<String>,
    pub trace_debug: bool,
    pub trace_file: Option<PathBuf>,
}

impl Default for TraceOptions {
    fn default() -> TraceOptions {
        TraceOptions {
            backend: BackendKind::Text,
            buffer_size: MIN_BUFFER_SIZE,
            filter: None,
            trace_debug: false,
            trace_file: None,
        }
    }
}

impl TraceOptions {
    /// Parses an option string such as
    /// `backend=json,buffer-size=131072,filter=events`.
    pub fn from_key_values(spec: &str) -> Result<TraceOptions, serde_keyvalue::ParseError> {
        serde_keyvalue::from_key_values(spec)
    }
}

/// Parses a comma-separated startup filter list. Only `events` is a valid
/// name; address-range filtering is armed through the dedicated range
/// interface instead.
pub(crate) fn parse_filter_spec(spec: &str) -> Result<Vec<TraceFilter>, Error> {
    spec.split(',')
        .map(|name| match name {
            "events" => Ok(TraceFilter::Events),
            _ => Err(Error::InvalidFilter(name.to_string())),
        })
        .collect()
}
