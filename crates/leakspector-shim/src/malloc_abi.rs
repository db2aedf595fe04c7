//! The `malloc` family: `extern "C"` entry points that dispatch to the
//! global [`leakspector_core::Engine`] and fall back to the native libc
//! symbols whenever the engine isn't available for this call (still
//! initializing, or this thread is already inside another shim entry
//! point).
//!
//! Follows the teacher's own `malloc_abi.rs` shape: a reentry guard first,
//! then dispatch, then native fallback — just against this crate's engine
//! instead of the membrane pipeline.

use std::ffi::c_void;

use leakspector_core::AllocKind;

use crate::call_context::capture;
use crate::engine_state::{enter, try_global};

unsafe extern "C" {
    #[link_name = "malloc"]
    fn native_malloc(size: usize) -> *mut c_void;
    #[link_name = "calloc"]
    fn native_calloc(nmemb: usize, size: usize) -> *mut c_void;
    #[link_name = "realloc"]
    fn native_realloc(ptr: *mut c_void, size: usize) -> *mut c_void;
    #[link_name = "free"]
    fn native_free(ptr: *mut c_void);
    #[link_name = "posix_memalign"]
    fn native_posix_memalign(memptr: *mut *mut c_void, alignment: usize, size: usize) -> i32;
    #[link_name = "memalign"]
    fn native_memalign(alignment: usize, size: usize) -> *mut c_void;
    #[link_name = "aligned_alloc"]
    fn native_aligned_alloc(alignment: usize, size: usize) -> *mut c_void;
}

fn ptr_to_option(ptr: *mut c_void) -> Option<usize> {
    if ptr.is_null() {
        None
    } else {
        Some(ptr as usize)
    }
}

fn set_errno(value: i32) {
    unsafe {
        *libc::__errno_location() = value;
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    let Some(guard) = enter() else {
        return unsafe { native_malloc(size) };
    };
    let Some(engine) = try_global() else {
        drop(guard);
        return unsafe { native_malloc(size) };
    };

    let mut engine = engine.lock();
    match engine.get_memory(size, 0, AllocKind::General, capture()) {
        Ok(ptr) => ptr as *mut c_void,
        Err(_) => {
            set_errno(libc::ENOMEM);
            std::ptr::null_mut()
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    let Some(guard) = enter() else {
        return unsafe { native_calloc(nmemb, size) };
    };
    let Some(engine) = try_global() else {
        drop(guard);
        return unsafe { native_calloc(nmemb, size) };
    };

    let Some(total) = nmemb.checked_mul(size) else {
        set_errno(libc::ENOMEM);
        return std::ptr::null_mut();
    };

    // `get_memory` zero-fills for `AllocKind::ZeroInit` (guard.rs).
    let mut engine = engine.lock();
    match engine.get_memory(total, 0, AllocKind::ZeroInit, capture()) {
        Ok(ptr) => ptr as *mut c_void,
        Err(_) => {
            set_errno(libc::ENOMEM);
            std::ptr::null_mut()
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    let Some(guard) = enter() else {
        return unsafe { native_realloc(ptr, size) };
    };
    let Some(engine) = try_global() else {
        drop(guard);
        return unsafe { native_realloc(ptr, size) };
    };

    let mut engine = engine.lock();
    match engine.resize_memory(ptr_to_option(ptr), size, 0, AllocKind::Resize, capture()) {
        Ok(new_ptr) => new_ptr.map_or(std::ptr::null_mut(), |p| p as *mut c_void),
        Err(_) => {
            set_errno(libc::ENOMEM);
            std::ptr::null_mut()
        }
    }
}

/// mpatrol's `reallocf`: identical to `realloc` except the original block is
/// always released even when the resize fails, instead of leaving it live
/// for the caller to separately free.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn reallocf(ptr: *mut c_void, size: usize) -> *mut c_void {
    let Some(guard) = enter() else {
        return unsafe { native_realloc(ptr, size) };
    };
    let Some(engine) = try_global() else {
        drop(guard);
        return unsafe { native_realloc(ptr, size) };
    };

    let mut engine = engine.lock();
    match engine.resize_memory(ptr_to_option(ptr), size, 0, AllocKind::ResizeZeroFill, capture()) {
        Ok(new_ptr) => new_ptr.map_or(std::ptr::null_mut(), |p| p as *mut c_void),
        Err(_) => {
            let _ = engine.free_memory(ptr_to_option(ptr), AllocKind::Release, capture());
            set_errno(libc::ENOMEM);
            std::ptr::null_mut()
        }
    }
}

/// BSD's `recallocarray`: resize that zero-fills any newly grown tail,
/// tagged separately from `realloc`/`reallocf` for reporting only.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn recallocarray(ptr: *mut c_void, nmemb: usize, size: usize) -> *mut c_void {
    let Some(total) = nmemb.checked_mul(size) else {
        set_errno(libc::ENOMEM);
        return std::ptr::null_mut();
    };

    let Some(guard) = enter() else {
        return unsafe { native_realloc(ptr, total) };
    };
    let Some(engine) = try_global() else {
        drop(guard);
        return unsafe { native_realloc(ptr, total) };
    };

    let mut engine = engine.lock();
    match engine.resize_memory(ptr_to_option(ptr), total, 0, AllocKind::Recalloc, capture()) {
        Ok(new_ptr) => new_ptr.map_or(std::ptr::null_mut(), |p| p as *mut c_void),
        Err(_) => {
            set_errno(libc::ENOMEM);
            std::ptr::null_mut()
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    let Some(guard) = enter() else {
        unsafe { native_free(ptr) };
        return;
    };
    let Some(engine) = try_global() else {
        drop(guard);
        unsafe { native_free(ptr) };
        return;
    };

    let mut engine = engine.lock();
    let _ = engine.free_memory(ptr_to_option(ptr), AllocKind::Release, capture());
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(memptr: *mut *mut c_void, alignment: usize, size: usize) -> i32 {
    let Some(guard) = enter() else {
        return unsafe { native_posix_memalign(memptr, alignment, size) };
    };
    let Some(engine) = try_global() else {
        drop(guard);
        return unsafe { native_posix_memalign(memptr, alignment, size) };
    };

    let mut engine = engine.lock();
    match engine.get_memory(size, alignment, AllocKind::AlignConstrained, capture()) {
        Ok(ptr) => {
            unsafe { *memptr = ptr as *mut c_void };
            0
        }
        Err(_) => libc::ENOMEM,
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut c_void {
    let Some(guard) = enter() else {
        return unsafe { native_memalign(alignment, size) };
    };
    let Some(engine) = try_global() else {
        drop(guard);
        return unsafe { native_memalign(alignment, size) };
    };

    let mut engine = engine.lock();
    match engine.get_memory(size, alignment, AllocKind::AlignConstrained, capture()) {
        Ok(ptr) => ptr as *mut c_void,
        Err(_) => {
            set_errno(libc::ENOMEM);
            std::ptr::null_mut()
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    let Some(guard) = enter() else {
        return unsafe { native_aligned_alloc(alignment, size) };
    };
    let Some(engine) = try_global() else {
        drop(guard);
        return unsafe { native_aligned_alloc(alignment, size) };
    };

    let mut engine = engine.lock();
    match engine.get_memory(size, alignment, AllocKind::AlignConstrained, capture()) {
        Ok(ptr) => ptr as *mut c_void,
        Err(_) => {
            set_errno(libc::ENOMEM);
            std::ptr::null_mut()
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn valloc(size: usize) -> *mut c_void {
    let Some(guard) = enter() else {
        return unsafe { native_memalign(4096, size) };
    };
    let Some(engine) = try_global() else {
        drop(guard);
        return unsafe { native_memalign(4096, size) };
    };

    let mut engine = engine.lock();
    match engine.get_memory(size, 0, AllocKind::PageAligned, capture()) {
        Ok(ptr) => ptr as *mut c_void,
        Err(_) => {
            set_errno(libc::ENOMEM);
            std::ptr::null_mut()
        }
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn pvalloc(size: usize) -> *mut c_void {
    let Some(guard) = enter() else {
        return unsafe { native_memalign(4096, size) };
    };
    let Some(engine) = try_global() else {
        drop(guard);
        return unsafe { native_memalign(4096, size) };
    };

    let mut engine = engine.lock();
    match engine.get_memory(size, 0, AllocKind::PageRounded, capture()) {
        Ok(ptr) => ptr as *mut c_void,
        Err(_) => {
            set_errno(libc::ENOMEM);
            std::ptr::null_mut()
        }
    }
}
