//! Diagnostics for the file engine: leveled records and per-opcode latency.
//!
//! A single process-wide [`Logger`] is installed by the first event loop whose
//! [`LoggingConfig`] is enabled, or explicitly with [`install`]. Until then the
//! `log_*!` macros cost one atomic load and never format their arguments.
//!
//! Records from the file path carry the operation's kind, the correlation id
//! the reactor assigned to it and the descriptor it runs against, so a single
//! operation can be followed from submission to completion:
//!
//! ```text
//! 1760871234567 TRACE file: read submitted on slot 3 op=read corr=0x100e0003 fd=7
//! 1760871234569 TRACE file: read completed with 512 op=read corr=0x100e0003 fd=7 elapsed=2041us
//! ```
//!
//! Components log under short names: `registry`, `file`, `event_loop`,
//! `watchdog` and `backend`.
//!
//! [`LoggingConfig`]: crate::config::LoggingConfig

use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::fs::OpenOptions;
use std::io::{self, LineWriter, Write};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::LoggingConfig;
use crate::operation::OpKind;

/// Severity of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    /// Per-operation detail
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl LogLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// What a record knows about the operation it describes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpContext {
    pub op: Option<OpKind>,
    /// User data the reactor assigned at submission
    pub correlation_id: Option<u64>,
    pub fd: Option<RawFd>,
    /// Time between submission and completion
    pub elapsed: Option<Duration>,
}

impl OpContext {
    pub fn new(op: OpKind) -> Self {
        Self {
            op: Some(op),
            ..Self::default()
        }
    }

    pub fn correlation_id(mut self, correlation_id: Option<u64>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Negative descriptors (not yet open, already closed) are left out.
    pub fn fd(mut self, fd: RawFd) -> Self {
        self.fd = (fd >= 0).then_some(fd);
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = Some(elapsed);
        self
    }
}

/// One record, borrowed from its call site until rendered.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    pub level: LogLevel,
    pub component: &'a str,
    pub message: fmt::Arguments<'a>,
    pub context: OpContext,
}

impl Record<'_> {
    fn render_text(&self, at: SystemTime, out: &mut String) {
        let _ = write!(
            out,
            "{} {:<5} {}: {}",
            epoch_millis(at),
            self.level,
            self.component,
            self.message
        );
        let context = &self.context;
        if let Some(op) = context.op {
            let _ = write!(out, " op={}", op);
        }
        if let Some(id) = context.correlation_id {
            let _ = write!(out, " corr={:#x}", id);
        }
        if let Some(fd) = context.fd {
            let _ = write!(out, " fd={}", fd);
        }
        if let Some(elapsed) = context.elapsed {
            let _ = write!(out, " elapsed={}us", elapsed.as_micros());
        }
    }

    fn render_json(&self, at: SystemTime, out: &mut String) {
        let _ = write!(
            out,
            "{{\"ts_ms\":{},\"level\":\"{}\",\"component\":",
            epoch_millis(at),
            self.level.as_str()
        );
        push_json_string(out, self.component);
        out.push_str(",\"message\":");
        push_json_string(out, &self.message.to_string());

        let context = &self.context;
        if let Some(op) = context.op {
            let _ = write!(out, ",\"op\":\"{}\"", op.name());
        }
        if let Some(id) = context.correlation_id {
            let _ = write!(out, ",\"correlation_id\":{}", id);
        }
        if let Some(fd) = context.fd {
            let _ = write!(out, ",\"fd\":{}", fd);
        }
        if let Some(elapsed) = context.elapsed {
            let _ = write!(out, ",\"elapsed_us\":{}", elapsed.as_micros());
        }
        out.push('}');
    }
}

fn epoch_millis(at: SystemTime) -> u128 {
    at.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis()
}

fn push_json_string(out: &mut String, value: &str) {
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Completion latency of one operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyStats {
    pub count: u64,
    pub total: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl LatencyStats {
    fn first(elapsed: Duration) -> Self {
        Self {
            count: 1,
            total: elapsed,
            min: elapsed,
            max: elapsed,
        }
    }

    fn add(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total += elapsed;
        self.min = self.min.min(elapsed);
        self.max = self.max.max(elapsed);
    }

    pub fn mean(&self) -> Duration {
        let nanos = self.total.as_nanos() / u128::from(self.count.max(1));
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

/// Latency per operation kind, fed by every registry completion.
#[derive(Debug, Clone, Default)]
pub struct LatencyTable {
    by_op: HashMap<OpKind, LatencyStats>,
}

impl LatencyTable {
    pub fn record(&mut self, op: OpKind, elapsed: Duration) {
        self.by_op
            .entry(op)
            .and_modify(|stats| stats.add(elapsed))
            .or_insert_with(|| LatencyStats::first(elapsed));
    }

    pub fn get(&self, op: OpKind) -> Option<LatencyStats> {
        self.by_op.get(&op).copied()
    }

    /// Completions recorded across all kinds.
    pub fn total(&self) -> u64 {
        self.by_op.values().map(|stats| stats.count).sum()
    }
}

/// A level filter in front of one line-oriented sink, plus latency counters.
pub struct Logger {
    level: LogLevel,
    json: bool,
    sink: Box<dyn Write + Send>,
    latency: LatencyTable,
    line: String,
}

impl Logger {
    pub fn new(level: LogLevel, json: bool, sink: Box<dyn Write + Send>) -> Self {
        Self {
            level,
            json,
            sink,
            latency: LatencyTable::default(),
            line: String::new(),
        }
    }

    pub fn stderr(level: LogLevel, json: bool) -> Self {
        Self::new(level, json, Box::new(io::stderr()))
    }

    /// Appends to `log_file` when one is configured, otherwise writes to stderr.
    pub fn from_config(config: &LoggingConfig) -> io::Result<Self> {
        match &config.log_file {
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Ok(Self::new(
                    config.level,
                    config.json_format,
                    Box::new(LineWriter::new(file)),
                ))
            }
            None => Ok(Self::stderr(config.level, config.json_format)),
        }
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.level
    }

    /// Render and write `record` if it passes the level filter.
    pub fn write(&mut self, record: &Record<'_>) {
        if !self.enabled(record.level) {
            return;
        }
        self.line.clear();
        let now = SystemTime::now();
        if self.json {
            record.render_json(now, &mut self.line);
        } else {
            record.render_text(now, &mut self.line);
        }
        self.line.push('\n');
        // A sink that fails has nowhere left to report to.
        let _ = self.sink.write_all(self.line.as_bytes());
    }

    pub fn record_latency(&mut self, op: OpKind, elapsed: Duration) {
        self.latency.record(op, elapsed);
    }

    pub fn latency(&self) -> &LatencyTable {
        &self.latency
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("level", &self.level)
            .field("json", &self.json)
            .field("latency", &self.latency)
            .finish_non_exhaustive()
    }
}

/// Threshold while no logger is installed; above every level.
const SILENT: u8 = u8::MAX;

static THRESHOLD: AtomicU8 = AtomicU8::new(SILENT);
static LOGGER: OnceLock<Mutex<Logger>> = OnceLock::new();

/// Install `logger` as the process-wide logger.
///
/// Returns `false`, dropping `logger`, when one is already installed.
pub fn install(logger: Logger) -> bool {
    let level = logger.level();
    let installed = LOGGER.set(Mutex::new(logger)).is_ok();
    if installed {
        THRESHOLD.store(level as u8, Ordering::Release);
    }
    installed
}

/// Install a logger for `config` unless one exists; an existing logger only
/// takes the configured level.
///
/// A log file that cannot be opened falls back to stderr.
pub fn configure(config: &LoggingConfig) {
    if !config.enabled {
        return;
    }
    if LOGGER.get().is_some() {
        set_level(config.level);
        return;
    }
    match Logger::from_config(config) {
        Ok(logger) => {
            install(logger);
        }
        Err(e) => {
            install(Logger::stderr(config.level, config.json_format));
            crate::log_warn!("logging", "log file unavailable, using stderr: {}", e);
        }
    }
}

pub fn set_level(level: LogLevel) {
    with_logger(|logger| {
        logger.level = level;
        THRESHOLD.store(level as u8, Ordering::Release);
    });
}

/// Whether a record at `level` would be written.
#[inline]
pub fn enabled(level: LogLevel) -> bool {
    level as u8 >= THRESHOLD.load(Ordering::Relaxed)
}

fn with_logger(f: impl FnOnce(&mut Logger)) {
    if let Some(logger) = LOGGER.get() {
        let mut logger = logger.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut logger);
    }
}

/// Write a plain record. The `log_*!` macros call this after checking
/// [`enabled`].
pub fn log(level: LogLevel, component: &str, message: fmt::Arguments<'_>) {
    log_op(level, component, OpContext::default(), message);
}

/// Write a record about one operation.
pub fn log_op(level: LogLevel, component: &str, context: OpContext, message: fmt::Arguments<'_>) {
    if !enabled(level) {
        return;
    }
    with_logger(|logger| {
        logger.write(&Record {
            level,
            component,
            message,
            context,
        })
    });
}

/// Count one completion of `op`. A no-op until a logger is installed.
pub fn record_latency(op: OpKind, elapsed: Duration) {
    with_logger(|logger| logger.record_latency(op, elapsed));
}

/// Snapshot of the installed logger's latency table.
pub fn latency() -> Option<LatencyTable> {
    let logger = LOGGER.get()?;
    let logger = logger.lock().unwrap_or_else(PoisonError::into_inner);
    Some(logger.latency.clone())
}

#[doc(hidden)]
#[macro_export]
macro_rules! __log_at {
    ($level:ident, $component:expr, $($arg:tt)+) => {
        if $crate::logging::enabled($crate::logging::LogLevel::$level) {
            $crate::logging::log(
                $crate::logging::LogLevel::$level,
                $component,
                format_args!($($arg)+),
            )
        }
    };
}

/// Log at [`LogLevel::Trace`](crate::logging::LogLevel::Trace).
#[macro_export]
macro_rules! log_trace {
    ($component:expr, $($arg:tt)+) => { $crate::__log_at!(Trace, $component, $($arg)+) };
}

/// Log at [`LogLevel::Debug`](crate::logging::LogLevel::Debug).
#[macro_export]
macro_rules! log_debug {
    ($component:expr, $($arg:tt)+) => { $crate::__log_at!(Debug, $component, $($arg)+) };
}

/// Log at [`LogLevel::Info`](crate::logging::LogLevel::Info).
#[macro_export]
macro_rules! log_info {
    ($component:expr, $($arg:tt)+) => { $crate::__log_at!(Info, $component, $($arg)+) };
}

/// Log at [`LogLevel::Warn`](crate::logging::LogLevel::Warn).
#[macro_export]
macro_rules! log_warn {
    ($component:expr, $($arg:tt)+) => { $crate::__log_at!(Warn, $component, $($arg)+) };
}

/// Log at [`LogLevel::Error`](crate::logging::LogLevel::Error).
#[macro_export]
macro_rules! log_error {
    ($component:expr, $($arg:tt)+) => { $crate::__log_at!(Error, $component, $($arg)+) };
}
