//! C++ `operator new`/`operator delete` family, exported under their
//! Itanium-mangled names so a C++ binary linking against this shim picks
//! them up the same way it would the real libstdc++ symbols.
//!
//! `operator new` never returns null on failure per the C++ standard; it
//! throws `std::bad_alloc`. Since this is a C ABI boundary with no
//! exception support, an allocation failure here calls
//! [`std::process::abort`] instead of fabricating an exception, matching
//! how libstdc++'s `new_handler` path ultimately terminates when no
//! handler is installed.

use std::ffi::c_void;

use leakspector_core::AllocKind;

use crate::call_context::capture;
use crate::engine_state::{enter, try_global};

fn new_or_abort(size: usize, kind: AllocKind) -> *mut c_void {
    let Some(guard) = enter() else {
        // Reentrant during this crate's own init: fall back to malloc,
        // which itself falls back to native libc in the same situation.
        return unsafe { crate::malloc_abi::malloc(size) };
    };
    let Some(engine) = try_global() else {
        drop(guard);
        return unsafe { crate::malloc_abi::malloc(size) };
    };

    let mut engine = engine.lock();
    match engine.get_memory(size, 0, kind, capture()) {
        Ok(ptr) => ptr as *mut c_void,
        Err(_) => std::process::abort(),
    }
}

fn delete_with_kind(ptr: *mut c_void, kind: AllocKind) {
    if ptr.is_null() {
        return;
    }
    let Some(guard) = enter() else {
        unsafe { crate::malloc_abi::free(ptr) };
        return;
    };
    let Some(engine) = try_global() else {
        drop(guard);
        unsafe { crate::malloc_abi::free(ptr) };
        return;
    };

    let mut engine = engine.lock();
    let _ = engine.free_memory(Some(ptr as usize), kind, capture());
}

/// `operator new(unsigned long)`.
#[unsafe(export_name = "_Znwm")]
pub extern "C" fn operator_new(size: usize) -> *mut c_void {
    new_or_abort(size, AllocKind::NewScalar)
}

/// `operator new[](unsigned long)`.
#[unsafe(export_name = "_Znam")]
pub extern "C" fn operator_new_array(size: usize) -> *mut c_void {
    new_or_abort(size, AllocKind::NewArray)
}

/// `operator delete(void*)`.
#[unsafe(export_name = "_ZdlPv")]
pub extern "C" fn operator_delete(ptr: *mut c_void) {
    delete_with_kind(ptr, AllocKind::DeleteScalar);
}

/// `operator delete[](void*)`.
#[unsafe(export_name = "_ZdaPv")]
pub extern "C" fn operator_delete_array(ptr: *mut c_void) {
    delete_with_kind(ptr, AllocKind::DeleteArray);
}

/// `operator delete(void*, unsigned long)`, the sized-deallocation overload.
#[unsafe(export_name = "_ZdlPvm")]
pub extern "C" fn operator_delete_sized(ptr: *mut c_void, _size: usize) {
    delete_with_kind(ptr, AllocKind::DeleteScalar);
}

/// `operator delete[](void*, unsigned long)`, the sized-deallocation overload.
#[unsafe(export_name = "_ZdaPvm")]
pub extern "C" fn operator_delete_array_sized(ptr: *mut c_void, _size: usize) {
    delete_with_kind(ptr, AllocKind::DeleteArray);
}
