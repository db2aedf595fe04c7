//! Bulk memory operations (`memset`, `memcpy`, `memmove`, `memcmp`,
//! `memchr`): routed through the engine's range checks (spec.md §4.7.4)
//! before touching memory, so an overrun or use of freed memory during a
//! bulk operation is caught the same way a bad `free` is.

use std::ffi::c_void;

use crate::call_context::capture;
use crate::engine_state::{enter, try_global};

unsafe extern "C" {
    #[link_name = "memset"]
    fn native_memset(dst: *mut c_void, byte: i32, n: usize) -> *mut c_void;
    #[link_name = "memcpy"]
    fn native_memcpy(dst: *mut c_void, src: *const c_void, n: usize) -> *mut c_void;
    #[link_name = "memmove"]
    fn native_memmove(dst: *mut c_void, src: *const c_void, n: usize) -> *mut c_void;
    #[link_name = "memcmp"]
    fn native_memcmp(a: *const c_void, b: *const c_void, n: usize) -> i32;
    #[link_name = "memchr"]
    fn native_memchr(s: *const c_void, c: i32, n: usize) -> *mut c_void;
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn memset(dst: *mut c_void, byte: i32, n: usize) -> *mut c_void {
    let Some(guard) = enter() else {
        return unsafe { native_memset(dst, byte, n) };
    };
    let Some(engine) = try_global() else {
        drop(guard);
        return unsafe { native_memset(dst, byte, n) };
    };

    let mut engine = engine.lock();
    let _ = engine.set_memory(dst as usize, byte as u8, n, capture());
    drop(engine);
    unsafe { native_memset(dst, byte, n) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn memcpy(dst: *mut c_void, src: *const c_void, n: usize) -> *mut c_void {
    let Some(guard) = enter() else {
        return unsafe { native_memcpy(dst, src, n) };
    };
    let Some(engine) = try_global() else {
        drop(guard);
        return unsafe { native_memcpy(dst, src, n) };
    };

    let mut engine = engine.lock();
    let _ = engine.copy_memory(dst as usize, src as usize, n, false, capture());
    drop(engine);
    unsafe { native_memcpy(dst, src, n) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn memmove(dst: *mut c_void, src: *const c_void, n: usize) -> *mut c_void {
    let Some(guard) = enter() else {
        return unsafe { native_memmove(dst, src, n) };
    };
    let Some(engine) = try_global() else {
        drop(guard);
        return unsafe { native_memmove(dst, src, n) };
    };

    let mut engine = engine.lock();
    let _ = engine.copy_memory(dst as usize, src as usize, n, true, capture());
    drop(engine);
    unsafe { native_memmove(dst, src, n) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn memcmp(a: *const c_void, b: *const c_void, n: usize) -> i32 {
    let Some(guard) = enter() else {
        return unsafe { native_memcmp(a, b, n) };
    };
    let Some(engine) = try_global() else {
        drop(guard);
        return unsafe { native_memcmp(a, b, n) };
    };

    let mut engine = engine.lock();
    let _ = engine.compare_memory(a as usize, b as usize, n, capture());
    drop(engine);
    unsafe { native_memcmp(a, b, n) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn memchr(s: *const c_void, c: i32, n: usize) -> *mut c_void {
    let Some(guard) = enter() else {
        return unsafe { native_memchr(s, c, n) };
    };
    let Some(engine) = try_global() else {
        drop(guard);
        return unsafe { native_memchr(s, c, n) };
    };

    let mut engine = engine.lock();
    let located = engine.locate_memory(s as usize, n, c as u8, capture());
    drop(engine);
    match located {
        Ok(Some(addr)) => addr as *mut c_void,
        _ => std::ptr::null_mut(),
    }
}

/// `memmem`, GNU's substring search — used for the `MemLocateBlock` kind's
/// range-check coverage even though the actual search is delegated to the
/// native implementation once the checked region is established.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn memmem(
    haystack: *const c_void,
    haystack_len: usize,
    needle: *const c_void,
    needle_len: usize,
) -> *mut c_void {
    let Some(guard) = enter() else {
        return native_memmem(haystack, haystack_len, needle, needle_len);
    };
    let Some(engine) = try_global() else {
        drop(guard);
        return native_memmem(haystack, haystack_len, needle, needle_len);
    };

    {
        let mut engine = engine.lock();
        let _ = engine.check_range(haystack as usize, haystack_len, capture());
    }
    native_memmem(haystack, haystack_len, needle, needle_len)
}

/// No libc symbol for `memmem` is declared via `extern "C"` above (its
/// signature needs a small range-check side door on `Engine` first); this
/// is a plain byte-search fallback used regardless of engine availability.
fn native_memmem(
    haystack: *const c_void,
    haystack_len: usize,
    needle: *const c_void,
    needle_len: usize,
) -> *mut c_void {
    if needle_len == 0 {
        return haystack as *mut c_void;
    }
    if needle_len > haystack_len {
        return std::ptr::null_mut();
    }
    let hay = unsafe { std::slice::from_raw_parts(haystack as *const u8, haystack_len) };
    let ndl = unsafe { std::slice::from_raw_parts(needle as *const u8, needle_len) };
    hay.windows(ndl.len())
        .position(|window| window == ndl)
        .map_or(std::ptr::null_mut(), |pos| unsafe {
            haystack.add(pos) as *mut c_void
        })
}
