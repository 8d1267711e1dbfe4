// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Deferred printf pipeline.
//!
//! The simulator translates guest code ahead of execution, so a trace
//! message whose arguments depend on guest state cannot be formatted at
//! translation time. The pipeline is split in two halves: the codegen half
//! ([`PrintfGen`]) plants cheap value-capture stores into the translated
//! block, and the runtime half ([`InstrLogger::printf_dump`]) walks the
//! per-CPU capture buffer and formats the accumulated messages into the
//! current entry's text buffer.
//!
//! Captured slots are untyped; the formatter reinterprets each slot
//! according to the conversion specifier it is consumed by, so the caller
//! must keep the kind string and format string in agreement.

use static_assertions::const_assert;

use crate::logger::InstrLogger;

/// Number of capture rows available between flushes of a translated block.
pub const PRINTF_BUF_DEPTH: usize = 32;
/// Maximum conversions in a single captured format string.
pub const PRINTF_ARG_MAX: usize = 8;
/// Row watermark past which a non-forced flush emits the drain call.
pub const PRINTF_FLUSH_BARRIER: usize = PRINTF_BUF_DEPTH - 4;

// Row validity is tracked in a u64 bitmask.
const_assert!(PRINTF_BUF_DEPTH <= 64);
const_assert!(PRINTF_FLUSH_BARRIER <= PRINTF_BUF_DEPTH);

/// One captured argument slot.
///
/// This is the union of every shape a conversion can consume. Numeric
/// specifiers read the integer bits, float specifiers the float value, and
/// `%s` the borrowed string; mismatches reinterpret the raw bits.
#[derive(Clone, Copy, Debug)]
pub enum FmtArg {
    Int(u64),
    Float(f64),
    Str(&'static str),
}

impl Default for FmtArg {
    fn default() -> FmtArg {
        FmtArg::Int(0)
    }
}

impl FmtArg {
    fn as_u64(&self) -> u64 {
        match self {
            FmtArg::Int(v) => *v,
            FmtArg::Float(f) => f.to_bits(),
            FmtArg::Str(_) => 0,
        }
    }

    fn as_f64(&self) -> f64 {
        match self {
            FmtArg::Int(v) => f64::from_bits(*v),
            FmtArg::Float(f) => *f,
            FmtArg::Str(_) => 0.0,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            FmtArg::Str(s) => s,
            _ => "",
        }
    }
}

/// Per-CPU scratch area written by planted capture stores.
pub(crate) struct PrintfBuf {
    pub valid: u64,
    pub fmts: [Option<&'static str>; PRINTF_BUF_DEPTH],
    pub args: [[FmtArg; PRINTF_ARG_MAX]; PRINTF_BUF_DEPTH],
}

impl Default for PrintfBuf {
    fn default() -> PrintfBuf {
        PrintfBuf {
            valid: 0,
            fmts: [None; PRINTF_BUF_DEPTH],
            args: [[FmtArg::default(); PRINTF_ARG_MAX]; PRINTF_BUF_DEPTH],
        }
    }
}

/// Identifies a translated operand whose value is read at execution time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperandId(pub u32);

/// A translation-time constant argument.
#[derive(Clone, Copy, Debug)]
pub enum ConstArg {
    Int(u64),
    Float(f64),
    Str(&'static str),
}

/// One argument passed to [`PrintfGen::gen_printf`], matching one kind
/// character: `Const` for `c`, `Guest32` for `w`, `Guest64` for `d`.
#[derive(Clone, Copy, Debug)]
pub enum GenArg {
    Const(ConstArg),
    Guest32(OperandId),
    Guest64(OperandId),
}

/// Resolves operand values when a translated block executes.
pub trait OperandSource {
    fn load32(&self, op: OperandId) -> u32;
    fn load64(&self, op: OperandId) -> u64;
}

/// A capture store planted into a translated block.
#[derive(Clone, Copy, Debug)]
pub enum CaptureOp {
    SetFmt {
        ndx: u8,
        fmt: &'static str,
    },
    StoreConst {
        ndx: u8,
        arg: u8,
        value: FmtArg,
    },
    StoreGuest32 {
        ndx: u8,
        arg: u8,
        op: OperandId,
        size: u8,
        sign_extend: bool,
    },
    StoreGuest64 {
        ndx: u8,
        arg: u8,
        op: OperandId,
        size: u8,
    },
    /// Calls the runtime drain helper.
    Dump,
}

/// Codegen half of the pipeline; lives in the simulator's per-block
/// translation context.
pub struct PrintfGen {
    enabled: bool,
    used: usize,
    ops: Vec<CaptureOp>,
}

impl PrintfGen {
    pub fn new(logging_enabled: bool) -> PrintfGen {
        PrintfGen {
            enabled: logging_enabled,
            used: 0,
            ops: Vec::new(),
        }
    }

    /// Plants capture stores for one formatted message.
    ///
    /// `kinds` selects the provenance of each argument (`c` constant,
    /// `w` 32-bit guest value, `d` 64-bit guest value) and must match the
    /// conversions in `fmt` one for one. Panics on a mismatched pair or
    /// when the capture buffer is exhausted; translators are expected to
    /// call [`PrintfGen::gen_printf_flush`] well before the buffer fills.
    pub fn gen_printf(&mut self, kinds: &str, fmt: &'static str, args: &[GenArg]) {
        if !self.enabled {
            return;
        }
        let ndx = self.used;
        assert!(
            ndx < PRINTF_BUF_DEPTH,
            "printf capture rows exhausted; flush earlier or raise PRINTF_BUF_DEPTH"
        );
        self.used += 1;
        self.ops.push(CaptureOp::SetFmt {
            ndx: ndx as u8,
            fmt,
        });

        let mut conversions = Conversions::new(fmt);
        let mut args = args.iter();
        for (arg_i, kind) in kinds.chars().enumerate() {
            assert!(arg_i < PRINTF_ARG_MAX, "too many printf arguments");
            let conv = conversions
                .next()
                .expect("kind string does not match format string");
            let arg = args.next().expect("missing printf argument");
            let op = match (kind, arg) {
                ('c', GenArg::Const(c)) => CaptureOp::StoreConst {
                    ndx: ndx as u8,
                    arg: arg_i as u8,
                    value: const_slot(*c, &conv),
                },
                ('w', GenArg::Guest32(op)) => CaptureOp::StoreGuest32 {
                    ndx: ndx as u8,
                    arg: arg_i as u8,
                    op: *op,
                    size: conv.size,
                    sign_extend: conv.signed && conv.size == 8,
                },
                ('d', GenArg::Guest64(op)) => CaptureOp::StoreGuest64 {
                    ndx: ndx as u8,
                    arg: arg_i as u8,
                    op: *op,
                    size: conv.size,
                },
                _ => panic!("printf kind '{}' does not match argument", kind),
            };
            self.ops.push(op);
        }
    }

    /// Plants a call to the runtime drain helper.
    ///
    /// A forced flush always emits the call; otherwise the call is emitted
    /// only once captures exist and either `flush_early` is set or the
    /// buffer is close to full.
    pub fn gen_printf_flush(&mut self, flush_early: bool, force: bool) {
        if force
            || (self.used != 0 && (flush_early || self.used >= PRINTF_FLUSH_BARRIER))
        {
            self.ops.push(CaptureOp::Dump);
            self.used = 0;
        }
    }

    /// Hands the planted ops to the simulator for inclusion in the block.
    pub fn take_ops(&mut self) -> Vec<CaptureOp> {
        std::mem::take(&mut self.ops)
    }
}

fn const_slot(c: ConstArg, conv: &Conversion) -> FmtArg {
    match (c, conv.spec) {
        (ConstArg::Float(f), _) => FmtArg::Float(f),
        (ConstArg::Str(s), _) => FmtArg::Str(s),
        (ConstArg::Int(v), _) => FmtArg::Int(truncate(v, conv.size)),
    }
}

fn truncate(value: u64, size: u8) -> u64 {
    match size {
        1 => value & 0xff,
        2 => value & 0xffff,
        4 => value & 0xffff_ffff,
        _ => value,
    }
}

struct Conversion {
    spec: char,
    size: u8,
    signed: bool,
}

/// Iterates the conversion specifiers of a format string, skipping literal
/// text and `%%`.
struct Conversions<'a> {
    chars: std::str::Chars<'a>,
}

impl<'a> Conversions<'a> {
    fn new(fmt: &'a str) -> Conversions<'a> {
        Conversions { chars: fmt.chars() }
    }
}

impl Iterator for Conversions<'_> {
    type Item = Conversion;

    fn next(&mut self) -> Option<Conversion> {
        loop {
            loop {
                match self.chars.next()? {
                    '%' => break,
                    _ => continue,
                }
            }
            // Flags, width and precision do not affect the captured size.
            let mut short = false;
            let mut longs = 0u32;
            loop {
                let c = self.chars.next()?;
                match c {
                    '%' => break, // literal %%, not a conversion
                    'h' => short = true,
                    'l' => longs += 1,
                    '0'..='9' | '.' | '-' | '+' | ' ' | '#' => {}
                    spec => {
                        let (size, signed) = match spec {
                            'c' => (1, false),
                            'd' | 'i' => (int_size(short, longs), true),
                            'u' | 'x' | 'X' | 'o' => (int_size(short, longs), false),
                            'e' | 'E' | 'f' | 'g' | 'G' => {
                                (if longs > 0 { 8 } else { 4 }, false)
                            }
                            's' | 'p' => (8, false),
                            _ => continue,
                        };
                        return Some(Conversion { spec, size, signed });
                    }
                }
            }
        }
    }
}

fn int_size(short: bool, longs: u32) -> u8 {
    if longs >= 1 {
        8
    } else if short {
        2
    } else {
        4
    }
}

impl InstrLogger {
    /// Executes planted capture stores for one translated block.
    pub fn run_capture_ops(&mut self, ops: &[CaptureOp], operands: &dyn OperandSource) {
        for op in ops {
            match *op {
                CaptureOp::SetFmt { ndx, fmt } => {
                    let buf = self.printf_buf_mut();
                    buf.fmts[ndx as usize] = Some(fmt);
                    buf.valid |= 1u64 << ndx;
                }
                CaptureOp::StoreConst { ndx, arg, value } => {
                    self.printf_buf_mut().args[ndx as usize][arg as usize] = value;
                }
                CaptureOp::StoreGuest32 {
                    ndx,
                    arg,
                    op,
                    size,
                    sign_extend,
                } => {
                    let raw = operands.load32(op);
                    let value = if sign_extend {
                        raw as i32 as i64 as u64
                    } else {
                        truncate(raw as u64, size)
                    };
                    self.printf_buf_mut().args[ndx as usize][arg as usize] =
                        FmtArg::Int(value);
                }
                CaptureOp::StoreGuest64 { ndx, arg, op, size } => {
                    let raw = operands.load64(op);
                    self.printf_buf_mut().args[ndx as usize][arg as usize] =
                        FmtArg::Int(truncate(raw, size));
                }
                CaptureOp::Dump => self.printf_dump(),
            }
        }
    }

    /// Runtime half: drains every valid capture row, low index first, and
    /// appends the formatted text to the current entry.
    ///
    /// The validity mask is cleared even when tracing is disabled, so stale
    /// captures never leak into a later trace slice.
    pub fn printf_dump(&mut self) {
        let valid = std::mem::take(&mut self.printf_buf_mut().valid);
        if !self.enabled() {
            return;
        }
        let mut remaining = valid;
        while remaining != 0 {
            let ndx = remaining.trailing_zeros() as usize;
            remaining &= remaining - 1;
            let buf = self.printf_buf_mut();
            let Some(fmt) = buf.fmts[ndx].take() else {
                continue;
            };
            let args = buf.args[ndx];
            format_into(self.current_txt_buffer(), fmt, &args);
        }
    }
}

/// Formats `fmt` into `out`, consuming one slot per conversion specifier.
///
/// Recognized conversions: `%c %d %i %u %x %X %o %e %E %f %g %G %s %p`,
/// size modifiers `h`, `l`, `ll`, literal `%%`, plus zero-padding, `#`,
/// field width and precision.
pub(crate) fn format_into(out: &mut String, fmt: &str, args: &[FmtArg]) {
    let mut chars = fmt.chars().peekable();
    let mut arg_i = 0usize;
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut zero_pad = false;
        let mut left = false;
        let mut alt = false;
        while let Some(&flag) = chars.peek() {
            match flag {
                '0' => zero_pad = true,
                '-' => left = true,
                '#' => alt = true,
                '+' | ' ' => {}
                _ => break,
            }
            chars.next();
        }
        let mut width = 0usize;
        while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
            width = width * 10 + d as usize;
            chars.next();
        }
        let mut precision = None;
        if chars.peek() == Some(&'.') {
            chars.next();
            let mut p = 0usize;
            while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                p = p * 10 + d as usize;
                chars.next();
            }
            precision = Some(p);
        }
        let mut short = false;
        let mut longs = 0u32;
        while let Some(&m) = chars.peek() {
            match m {
                'h' => short = true,
                'l' => longs += 1,
                _ => break,
            }
            chars.next();
        }
        let Some(spec) = chars.next() else {
            out.push('%');
            break;
        };
        if spec == '%' {
            out.push('%');
            continue;
        }
        let arg = args.get(arg_i).copied().unwrap_or_default();
        arg_i += 1;
        let body = match spec {
            'c' => ((arg.as_u64() as u8) as char).to_string(),
            'd' | 'i' => signed_int(arg.as_u64(), short, longs).to_string(),
            'u' => unsigned_int(arg.as_u64(), short, longs).to_string(),
            'x' => with_radix_prefix(
                alt,
                "0x",
                format!("{:x}", unsigned_int(arg.as_u64(), short, longs)),
            ),
            'X' => with_radix_prefix(
                alt,
                "0X",
                format!("{:X}", unsigned_int(arg.as_u64(), short, longs)),
            ),
            'o' => with_radix_prefix(
                alt,
                "0",
                format!("{:o}", unsigned_int(arg.as_u64(), short, longs)),
            ),
            'f' => format!("{:.*}", precision.unwrap_or(6), arg.as_f64()),
            'e' => format_exp(arg.as_f64(), precision.unwrap_or(6), false),
            'E' => format_exp(arg.as_f64(), precision.unwrap_or(6), true),
            'g' => format_general(arg.as_f64(), precision.unwrap_or(6), false),
            'G' => format_general(arg.as_f64(), precision.unwrap_or(6), true),
            's' => arg.as_str().to_string(),
            'p' => format!("0x{:x}", arg.as_u64()),
            _ => {
                // Unknown conversion: keep it verbatim, give the slot back.
                arg_i -= 1;
                out.push('%');
                out.push(spec);
                continue;
            }
        };
        emit_padded(out, &body, width, zero_pad, left);
    }
}

fn signed_int(bits: u64, short: bool, longs: u32) -> i64 {
    if longs >= 1 {
        bits as i64
    } else if short {
        bits as u16 as i16 as i64
    } else {
        bits as u32 as i32 as i64
    }
}

fn unsigned_int(bits: u64, short: bool, longs: u32) -> u64 {
    if longs >= 1 {
        bits
    } else if short {
        bits & 0xffff
    } else {
        bits & 0xffff_ffff
    }
}

fn with_radix_prefix(alt: bool, prefix: &str, digits: String) -> String {
    if alt && digits != "0" {
        format!("{}{}", prefix, digits)
    } else {
        digits
    }
}

fn emit_padded(out: &mut String, body: &str, width: usize, zero_pad: bool, left: bool) {
    let len = body.chars().count();
    if len >= width {
        out.push_str(body);
        return;
    }
    let pad = width - len;
    if left {
        out.push_str(body);
        out.extend(std::iter::repeat(' ').take(pad));
    } else if zero_pad {
        // The sign stays ahead of the zero padding.
        if let Some(rest) = body.strip_prefix('-') {
            out.push('-');
            out.extend(std::iter::repeat('0').take(pad));
            out.push_str(rest);
        } else {
            out.extend(std::iter::repeat('0').take(pad));
            out.push_str(body);
        }
    } else {
        out.extend(std::iter::repeat(' ').take(pad));
        out.push_str(body);
    }
}

fn format_exp(value: f64, precision: usize, upper: bool) -> String {
    if !value.is_finite() {
        return format!("{}", value);
    }
    let (mantissa, exponent) = decompose(value);
    let e = if upper { 'E' } else { 'e' };
    let sign = if exponent < 0 { '-' } else { '+' };
    format!(
        "{:.*}{}{}{:02}",
        precision,
        mantissa,
        e,
        sign,
        exponent.abs()
    )
}

fn decompose(value: f64) -> (f64, i32) {
    if value == 0.0 {
        return (0.0, 0);
    }
    let mut exponent = value.abs().log10().floor() as i32;
    let mut mantissa = value / 10f64.powi(exponent);
    if mantissa.abs() >= 10.0 {
        mantissa /= 10.0;
        exponent += 1;
    }
    (mantissa, exponent)
}

fn format_general(value: f64, precision: usize, upper: bool) -> String {
    if !value.is_finite() {
        return format!("{}", value);
    }
    let precision = precision.max(1);
    let (_, exponent) = decompose(value);
    let formatted = if value != 0.0 && (exponent < -4 || exponent >= precision as i32) {
        format_exp(value, precision - 1, upper)
    } else {
        let frac = (precision as i32 - 1 - exponent).max(0) as usize;
        format!("{:.*}", frac, value)
    };
    strip_trailing_zeros(formatted)
}

fn strip_trailing_zeros(text: String) -> String {
    if !text.contains('.') {
        return text;
    }
    match text.split_once(['e', 'E']) {
        Some((mantissa, exp)) => {
            let mantissa = mantissa.trim_end_matches('0').trim_end_matches('.');
            let e = if text.contains('E') { 'E' } else { 'e' };
            format!("{}{}{}", mantissa, e, exp)
        }
        None => text
            .trim_end_matches('0')
            .trim_end_matches('.')
            .to_string(),
    }
}
