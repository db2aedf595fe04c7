//! Instrumentation hooks for scope-bounded (`alloca`-style) allocations.
//!
//! `alloca` itself cannot be intercepted the way `malloc` can: it expands
//! inline to a stack-pointer adjustment, with no call a shim could
//! interpose on. mpatrol handles this the same way — via source
//! instrumentation that replaces `alloca(n)` calls with a macro invoking its
//! library directly — rather than runtime interposition. This crate exposes
//! the equivalent pair of hooks for instrumented callers to link against:
//!
//! - `leakspector_scope_alloc(size)` takes the allocation, tagged
//!   [`AllocKind::ScopeBounded`], tied to the calling frame.
//! - `leakspector_scope_unwind()` releases every scope allocation whose
//!   frame the caller has since returned past, exactly like the automatic
//!   unwind bulk-memory operations already trigger on every call
//!   (`Engine::unwind_scopes`). A caller that never reaches a bulk-memory
//!   op after its scope allocations (the common case for `alloca`) needs to
//!   call this explicitly, e.g. from an epilogue the instrumentation also
//!   inserts.

use std::ffi::c_void;

use leakspector_core::AllocKind;

use crate::call_context::capture;
use crate::engine_state::{enter, try_global};

#[unsafe(no_mangle)]
pub unsafe extern "C" fn leakspector_scope_alloc(size: usize) -> *mut c_void {
    let Some(guard) = enter() else {
        return std::ptr::null_mut();
    };
    let Some(engine) = try_global() else {
        drop(guard);
        return std::ptr::null_mut();
    };

    let mut engine = engine.lock();
    match engine.get_memory(size, 0, AllocKind::ScopeBounded, capture()) {
        Ok(ptr) => ptr as *mut c_void,
        Err(_) => std::ptr::null_mut(),
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn leakspector_scope_unwind() {
    let Some(guard) = enter() else {
        return;
    };
    let Some(engine) = try_global() else {
        drop(guard);
        return;
    };

    let mut engine = engine.lock();
    engine.unwind_scopes(&capture());
}
