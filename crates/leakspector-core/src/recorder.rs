//! Emits per-event log/trace/profile records; bridges to the external sinks
//! (spec.md §4.6).

use crate::context::CallContext;
use crate::error::{EngineError, Severity};
use crate::kind::AllocKind;

/// Live aggregate counters, snapshotted into every event so a log line is
/// self-contained (spec.md §3's "Engine state" counters).
#[derive(Debug, Clone, Copy, Default)]
pub struct Counters {
    pub live_bytes: usize,
    pub peak_live_bytes: usize,
    pub live_count: usize,
    pub peak_live_count: usize,
    pub total_compared: u64,
    pub total_copied: u64,
    pub total_located: u64,
    pub total_set: u64,
}

/// The structured event kinds the recorder accepts (spec.md §4.6).
#[derive(Debug, Clone)]
pub enum EventKind {
    LogAlloc { base: usize, size: usize, kind: AllocKind },
    LogRealloc { old_base: usize, new_base: usize, old_size: usize, new_size: usize },
    LogFree { base: usize, kind: AllocKind },
    LogMemSet { base: usize, size: usize },
    LogMemCopy { dst: usize, src: usize, size: usize },
    LogMemLocate { base: usize, size: usize },
    LogMemCompare { a: usize, b: usize, size: usize },
    AllocEventCompleted { ordinal: u64 },
    FreeEventCompleted { ordinal: u64 },
    Error(EngineError),
    Warning(EngineError),
    Summary { message: String },
}

impl EventKind {
    fn severity(&self) -> Severity {
        match self {
            Self::Error(e) => e.severity().max(Severity::Error),
            Self::Warning(_) => Severity::Warning,
            Self::Summary { .. } => Severity::Error,
            _ => Severity::Warning,
        }
    }
}

impl Severity {
    fn max(self, other: Severity) -> Severity {
        fn rank(s: Severity) -> u8 {
            match s {
                Severity::Warning => 0,
                Severity::Error => 1,
                Severity::Fatal => 2,
            }
        }
        if rank(self) >= rank(other) {
            self
        } else {
            other
        }
    }
}

/// One recorded event: a monotonic decision id, the event itself, the call
/// context, and a snapshot of the live counters at the time it was
/// admitted.
#[derive(Debug, Clone)]
pub struct EngineEventRecord {
    pub decision_id: u64,
    pub kind: EventKind,
    pub context: CallContext,
    pub counters: Counters,
}

/// A text log sink: one line per event, human-readable.
pub trait LogSink {
    fn emit(&mut self, record: &EngineEventRecord);
}

/// A binary trace sink; only consulted for records whose originating
/// allocation has `traced` set.
pub trait TraceSink {
    /// Whether tracing is active at all right now (asked once per
    /// allocation, per spec.md §4.6).
    fn is_active(&self) -> bool;
    fn record_alloc(&mut self, ordinal: u64, base: usize, size: usize);
    fn record_free(&mut self, ordinal: u64);
    /// Flush any buffered trace frames to the backing store. Called once
    /// at shutdown; the default is a no-op for sinks with nothing to
    /// buffer.
    fn flush(&mut self) {}
}

/// A per-call-site profile accumulator; only consulted for records whose
/// originating allocation has `profiled` set.
pub trait ProfileSink {
    fn is_active(&self) -> bool;
    fn register_allocation(&mut self, context: &CallContext, size: usize);
    /// Write the accumulated per-call-site histogram to its backing store.
    /// Called once at shutdown; the default is a no-op for sinks that
    /// write as they go.
    fn flush(&mut self) {}
}

/// Fans structured events out to the text log, the trace sink, and the
/// profile sink, stamping each with a monotonic decision id.
#[derive(Default)]
pub struct EventRecorder {
    next_decision_id: u64,
    log: Option<Box<dyn LogSink + Send>>,
    trace: Option<Box<dyn TraceSink + Send>>,
    profile: Option<Box<dyn ProfileSink + Send>>,
}

impl EventRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_decision_id: 1,
            log: None,
            trace: None,
            profile: None,
        }
    }

    pub fn set_log_sink(&mut self, sink: Box<dyn LogSink + Send>) {
        self.log = Some(sink);
    }

    pub fn set_trace_sink(&mut self, sink: Box<dyn TraceSink + Send>) {
        self.trace = Some(sink);
    }

    pub fn set_profile_sink(&mut self, sink: Box<dyn ProfileSink + Send>) {
        self.profile = Some(sink);
    }

    /// Whether a trace sink is currently active, asked once at allocation
    /// time to decide a new record's `traced` flag.
    #[must_use]
    pub fn trace_active(&self) -> bool {
        self.trace.as_ref().is_some_and(|t| t.is_active())
    }

    /// Whether a profile sink is currently active, asked once at
    /// allocation time to decide a new record's `profiled` flag.
    #[must_use]
    pub fn profile_active(&self) -> bool {
        self.profile.as_ref().is_some_and(|p| p.is_active())
    }

    /// Record an event, stamping it with the next decision id and routing
    /// it to whichever sinks are configured and relevant. Returns the
    /// decision id assigned.
    pub fn record(&mut self, kind: EventKind, context: CallContext, counters: Counters) -> u64 {
        let decision_id = self.next_decision_id;
        self.next_decision_id += 1;

        let record = EngineEventRecord {
            decision_id,
            kind,
            context,
            counters,
        };

        if let Some(log) = self.log.as_mut() {
            log.emit(&record);
        }

        record.decision_id
    }

    /// Feed a completed allocation into the trace sink, if tracing was
    /// decided active for this record.
    pub fn trace_alloc(&mut self, ordinal: u64, base: usize, size: usize) {
        if let Some(trace) = self.trace.as_mut() {
            trace.record_alloc(ordinal, base, size);
        }
    }

    pub fn trace_free(&mut self, ordinal: u64) {
        if let Some(trace) = self.trace.as_mut() {
            trace.record_free(ordinal);
        }
    }

    pub fn profile_allocation(&mut self, context: &CallContext, size: usize) {
        if let Some(profile) = self.profile.as_mut() {
            profile.register_allocation(context, size);
        }
    }

    /// Flushes the trace and profile sinks, if configured. Called once at
    /// shutdown, after the final summary event has been recorded.
    pub fn flush_sinks(&mut self) {
        if let Some(trace) = self.trace.as_mut() {
            trace.flush();
        }
        if let Some(profile) = self.profile.as_mut() {
            profile.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        events: Vec<(u64, String)>,
    }

    impl LogSink for RecordingSink {
        fn emit(&mut self, record: &EngineEventRecord) {
            self.events
                .push((record.decision_id, format!("{:?}", record.kind)));
        }
    }

    #[test]
    fn decision_ids_are_strictly_increasing() {
        let mut recorder = EventRecorder::new();
        let id1 = recorder.record(
            EventKind::LogAlloc {
                base: 0x1000,
                size: 16,
                kind: AllocKind::General,
            },
            CallContext::default(),
            Counters::default(),
        );
        let id2 = recorder.record(
            EventKind::LogFree {
                base: 0x1000,
                kind: AllocKind::General,
            },
            CallContext::default(),
            Counters::default(),
        );
        assert_eq!(id1, 1);
        assert_eq!(id2, 2);
    }

    #[test]
    fn log_sink_receives_every_event_in_order() {
        let mut recorder = EventRecorder::new();
        recorder.set_log_sink(Box::new(RecordingSink::default()));
        recorder.record(
            EventKind::Summary {
                message: "shutdown".into(),
            },
            CallContext::default(),
            Counters::default(),
        );
        // No direct accessor for the sink after moving it in; this test
        // exercises that recording with a sink installed does not panic
        // and returns a valid id.
    }

    #[test]
    fn inactive_trace_and_profile_sinks_are_not_queried_when_absent() {
        let recorder = EventRecorder::new();
        assert!(!recorder.trace_active());
        assert!(!recorder.profile_active());
    }
}
