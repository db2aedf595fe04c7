//! Concrete sinks for the engine's event recorder: a text log, a binary
//! trace, and a shutdown-time profile histogram — the three destinations
//! spec.md §4.6's structured events fan out to. `leakspector-core` only
//! defines the `LogSink`/`TraceSink`/`ProfileSink` traits and never touches
//! a file itself; this module is where the shim actually owns the
//! descriptors, grounded on the same split the teacher's
//! `malloc/allocator.rs` keeps between its `AllocatorLogRecord` type and
//! whatever actually writes one out.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};

use leakspector_core::recorder::{EngineEventRecord, EventKind, LogSink, ProfileSink, TraceSink};
use leakspector_core::CallContext;

/// One line per event, written through any `std::io::Write` — a file at
/// the configured log path, or stderr when none is configured.
pub struct TextLogSink {
    writer: Box<dyn Write + Send>,
}

impl TextLogSink {
    #[must_use]
    pub fn to_stderr() -> Self {
        Self { writer: Box::new(std::io::stderr()) }
    }

    pub fn to_path(path: &str) -> std::io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self { writer: Box::new(BufWriter::new(file)) })
    }
}

impl LogSink for TextLogSink {
    fn emit(&mut self, record: &EngineEventRecord) {
        let _ = writeln!(
            self.writer,
            "[{}] {} live={}B/{} {}",
            record.decision_id,
            describe(&record.kind),
            record.counters.live_bytes,
            record.counters.live_count,
            describe_site(&record.context),
        );
    }
}

fn describe(kind: &EventKind) -> String {
    match kind {
        EventKind::LogAlloc { base, size, kind } => format!("{} base={base:#x} size={size}", kind.name()),
        EventKind::LogRealloc { old_base, new_base, old_size, new_size } => {
            format!("realloc {old_base:#x}({old_size}) -> {new_base:#x}({new_size})")
        }
        EventKind::LogFree { base, kind } => format!("{} base={base:#x}", kind.name()),
        EventKind::LogMemSet { base, size } => format!("memset base={base:#x} size={size}"),
        EventKind::LogMemCopy { dst, src, size } => format!("memcpy dst={dst:#x} src={src:#x} size={size}"),
        EventKind::LogMemLocate { base, size } => format!("memchr base={base:#x} size={size}"),
        EventKind::LogMemCompare { a, b, size } => format!("memcmp a={a:#x} b={b:#x} size={size}"),
        EventKind::AllocEventCompleted { ordinal } => format!("alloc-event #{ordinal}"),
        EventKind::FreeEventCompleted { ordinal } => format!("free-event #{ordinal}"),
        EventKind::Error(err) => format!("error: {err}"),
        EventKind::Warning(err) => format!("warning: {err}"),
        EventKind::Summary { message } => format!("summary: {message}"),
    }
}

fn describe_site(context: &CallContext) -> String {
    match (&context.function, &context.file) {
        (Some(function), Some(file)) => format!("at {function} ({file}:{})", context.line),
        (Some(function), None) => format!("at {function}"),
        _ => String::new(),
    }
}

/// Fixed-width binary framing for traced allocation/free events: a one-byte
/// tag followed by `u64` fields, little-endian. Not the `bincode` crate —
/// absent from the teacher's stack — but the same "serde-shaped struct,
/// written as raw framed bytes" idea the spec calls "bincode-style".
pub struct BinaryTraceSink {
    writer: BufWriter<File>,
    active: bool,
}

impl BinaryTraceSink {
    pub fn to_path(path: &str) -> std::io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self { writer: BufWriter::new(file), active: true })
    }
}

const TRACE_TAG_ALLOC: u8 = 0;
const TRACE_TAG_FREE: u8 = 1;

impl TraceSink for BinaryTraceSink {
    fn is_active(&self) -> bool {
        self.active
    }

    fn record_alloc(&mut self, ordinal: u64, base: usize, size: usize) {
        let mut frame = Vec::with_capacity(25);
        frame.push(TRACE_TAG_ALLOC);
        frame.extend_from_slice(&ordinal.to_le_bytes());
        frame.extend_from_slice(&(base as u64).to_le_bytes());
        frame.extend_from_slice(&(size as u64).to_le_bytes());
        let _ = self.writer.write_all(&frame);
    }

    fn record_free(&mut self, ordinal: u64) {
        let mut frame = Vec::with_capacity(9);
        frame.push(TRACE_TAG_FREE);
        frame.extend_from_slice(&ordinal.to_le_bytes());
        let _ = self.writer.write_all(&frame);
    }

    fn flush(&mut self) {
        let _ = self.writer.flush();
    }
}

/// Per-call-site allocation counts and byte totals, written out as a JSON
/// histogram at shutdown via `serde_json` — mirroring how the teacher's
/// harness crate serializes its own fixtures.
#[derive(Default)]
pub struct ProfileAccumulator {
    path: Option<String>,
    sites: HashMap<String, SiteTotals>,
}

#[derive(Default, serde::Serialize)]
struct SiteTotals {
    count: u64,
    bytes: u64,
}

impl ProfileAccumulator {
    #[must_use]
    pub fn to_path(path: impl Into<String>) -> Self {
        Self { path: Some(path.into()), sites: HashMap::new() }
    }

    fn site_key(context: &CallContext) -> String {
        match (&context.function, &context.file) {
            (Some(function), Some(file)) => format!("{file}:{}:{function}", context.line),
            (Some(function), None) => function.clone(),
            _ => "<unknown>".to_string(),
        }
    }
}

impl ProfileSink for ProfileAccumulator {
    fn is_active(&self) -> bool {
        self.path.is_some()
    }

    fn register_allocation(&mut self, context: &CallContext, size: usize) {
        let entry = self.sites.entry(Self::site_key(context)).or_default();
        entry.count += 1;
        entry.bytes += size as u64;
    }

    fn flush(&mut self) {
        let Some(path) = self.path.as_deref() else {
            return;
        };
        let Ok(text) = serde_json::to_string_pretty(&self.sites) else {
            return;
        };
        let _ = std::fs::write(path, text);
    }
}
