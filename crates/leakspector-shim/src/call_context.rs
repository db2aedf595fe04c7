//! Builds the `CallContext` every entry point hands the engine: a captured
//! return-address trace plus the calling thread id (spec.md §6).

use leakspector_core::CallContext;

/// How many return addresses to capture per call. Deep enough for a useful
/// report, shallow enough that every malloc/free doesn't pay for an
/// unbounded unwind.
const MAX_TRACE_FRAMES: usize = 32;

/// Captures the caller's stack via `backtrace::trace` and tags it with the
/// current thread id. `function`/`file`/`line`/`type_name`/`type_size` are
/// left for callers that have that information statically (typed-new
/// entry points); everything else gets a bare trace.
#[must_use]
pub fn capture() -> CallContext {
    let mut stack = Vec::with_capacity(MAX_TRACE_FRAMES);
    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            stack.push(frame.ip() as usize);
            stack.len() < MAX_TRACE_FRAMES
        });
    }

    CallContext {
        stack,
        thread_id: current_thread_id(),
        ..CallContext::default()
    }
}

fn current_thread_id() -> u64 {
    unsafe { libc::pthread_self() as u64 }
}
