//! Owns the process-wide [`Engine`] instance and guards re-entrant calls
//! into the exported ABI surface.
//!
//! The engine is constructed lazily, on the first entry point call, rather
//! than via a C constructor — `leakspector-core::Engine::new` itself
//! touches the page provider, which under `LD_PRELOAD` may not be safe to
//! do before libc has finished its own startup. Lazy init needs a guard
//! against re-entrancy: building the engine calls [`crate::config::resolved`],
//! which reads environment variables, which can allocate and recurse back
//! into this crate's own `malloc`. A [`std::sync::OnceLock`] would block
//! that reentrant caller on the very thread running the initializer — a
//! deadlock. Instead this is the same manual atomic state machine the
//! teacher's `runtime_policy::kernel` uses: a reentrant call that observes
//! `INITIALIZING` falls through to the native libc symbols instead of
//! waiting.

use std::cell::Cell;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use leakspector_core::Engine;
use parking_lot::Mutex;

use crate::logging::{BinaryTraceSink, ProfileAccumulator, TextLogSink};
use crate::providers::{OsPageProvider, OsStackWalker, OsSymbolResolver};

const STATE_UNINIT: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_READY: u8 = 2;

static ENGINE_STATE: AtomicU8 = AtomicU8::new(STATE_UNINIT);
static ENGINE_PTR: AtomicPtr<Mutex<Engine>> = AtomicPtr::new(std::ptr::null_mut());

/// Returns the global engine, constructing it on first use.
///
/// `None` means: either this call is reentrant during construction (the
/// initializer's own allocations looped back here), or construction is
/// happening concurrently on another thread. Either way the caller falls
/// back to the native libc allocator for this one call; the next call will
/// very likely observe `STATE_READY`.
pub fn try_global() -> Option<&'static Mutex<Engine>> {
    let state = ENGINE_STATE.load(Ordering::Acquire);
    if state == STATE_READY {
        // SAFETY-equivalent: only set after the pointer is published.
        return Some(unsafe { &*ENGINE_PTR.load(Ordering::Acquire) });
    }
    if state == STATE_INITIALIZING {
        return None;
    }

    if ENGINE_STATE
        .compare_exchange(
            STATE_UNINIT,
            STATE_INITIALIZING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        return None;
    }

    let config = crate::config::resolved();
    let log_path = config.log_path.clone();
    let mut engine = Engine::new(
        config,
        Box::new(OsPageProvider::new()),
        Box::new(OsStackWalker),
        Box::new(OsSymbolResolver),
    );
    wire_sinks(&mut engine, log_path.as_deref());
    let leaked = Box::into_raw(Box::new(Mutex::new(engine)));
    ENGINE_PTR.store(leaked, Ordering::Release);
    ENGINE_STATE.store(STATE_READY, Ordering::Release);
    unsafe {
        libc::atexit(run_shutdown_report);
    }
    Some(unsafe { &*leaked })
}

/// Installs the text log sink (the configured log path, or stderr), and —
/// if the corresponding path environment variables are set — the binary
/// trace sink and the profile accumulator. Neither of the latter two has a
/// `Config` field of its own: whether they're active at all is a shim-side
/// wiring decision, not part of the engine's portable configuration.
fn wire_sinks(engine: &mut Engine, log_path: Option<&str>) {
    let log_sink = match log_path {
        Some(path) => TextLogSink::to_path(path).unwrap_or_else(|_| TextLogSink::to_stderr()),
        None => TextLogSink::to_stderr(),
    };
    engine.recorder_mut().set_log_sink(Box::new(log_sink));

    if let Ok(path) = std::env::var("LKSPCTR_TRACE_PATH") {
        if let Ok(sink) = BinaryTraceSink::to_path(&path) {
            engine.recorder_mut().set_trace_sink(Box::new(sink));
        }
    }
    if let Ok(path) = std::env::var("LKSPCTR_PROFILE_PATH") {
        engine.recorder_mut().set_profile_sink(Box::new(ProfileAccumulator::to_path(path)));
    }
}

/// Registered once via `libc::atexit` on first engine construction: flushes
/// the shutdown summary and the trace/profile sinks before the process
/// actually exits.
extern "C" fn run_shutdown_report() {
    if let Some(engine) = try_global() {
        engine.lock().shutdown_report();
    }
}

thread_local! {
    /// Depth of nested entry into this crate's exported symbols on the
    /// current thread. `Engine`'s own bookkeeping (e.g. `free_pages` during
    /// a resize) never calls back into the ABI surface, so in practice this
    /// only ever guards against the environment-resolution recursion
    /// described above and against one shim entry point calling another
    /// (e.g. `calloc` calling into the same allocation path `malloc` uses).
    static REENTRY_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// RAII guard incrementing the reentry depth for the lifetime of one entry
/// point call, decrementing on drop so a panicking path still unwinds the
/// counter correctly.
pub struct ReentryGuard {
    _private: (),
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        REENTRY_DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

/// Enter one exported-symbol call. Returns `None` if this thread is already
/// inside another call into this crate's ABI surface, signalling the caller
/// to fall through to the native libc implementation rather than recurse.
pub fn enter() -> Option<ReentryGuard> {
    REENTRY_DEPTH.with(|depth| {
        if depth.get() > 0 {
            None
        } else {
            depth.set(1);
            Some(ReentryGuard { _private: () })
        }
    })
}
